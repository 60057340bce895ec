//! Address assignment for dirty nodes and release of superseded extents.
//!
//! Every node rewritten by a commit lands at a fresh address. The allocator
//! prefers the chunk that held the node's previous copy, then any chunk of the
//! right type, and only then asks the chunk lifecycle manager for a new chunk.
//! Each allocation records a skinny tree-block reference in the extent tree.

use tracing::{error, trace};

use super::{FsState, Transaction};
use crate::storage::arena::{ItemBody, NodeId, NODE_FLAG_MIXED_BACKREF};
use crate::storage::records::{
    DataRef, ExtentItem, ExtentRecord, ExtentRefV0, FileExtentItem, InlineRef, EXTENT_FLAG_DATA,
    EXTENT_FLAG_TREE_BLOCK,
};
use crate::types::{item_type, ArborError, Key, Result, TreeId};

impl FsState {
    /// Takes `[address, address + len)` out of chunk `idx`'s free list and
    /// charges it as used.
    pub fn claim_extent(&mut self, idx: usize, address: u64, len: u64) -> Result<()> {
        {
            let mut chunk = self.chunks[idx].lock();
            chunk.free.remove(address, len)?;
            chunk.used += len;
            chunk.changed = true;
        }
        self.fresh.insert(address);
        Ok(())
    }

    /// Returns an extent's space to its chunk.
    ///
    /// Extents allocated in the open transaction go straight back to the free
    /// list; anything older is pinned until the superblock is published.
    pub fn release_extent(&mut self, address: u64, len: u64) -> Result<()> {
        let idx = self.chunk_for(address)?;
        let fresh = self.fresh.remove(&address);
        let mut chunk = self.chunks[idx].lock();
        chunk.used = chunk.used.checked_sub(len).ok_or_else(|| {
            ArborError::Inconsistent(format!("chunk {:#x} usage underflow", chunk.offset))
        })?;
        if fresh {
            chunk.free.add(address, len)?;
        } else {
            chunk.pinned.add(address, len)?;
        }
        chunk.changed = true;
        trace!(address, len, pinned = !fresh, "alloc.release");
        Ok(())
    }
}

/// File extent referenced by a leaf that still uses legacy back-references.
pub(super) struct LegacyDataExtent {
    pub(super) address: u64,
    pub(super) size: u64,
    pub(super) owner: DataRef,
}

impl Transaction<'_> {
    /// Assigns a new address to `node` and charges its chunk.
    ///
    /// Fails with [`ArborError::NoSpace`] when neither an existing chunk nor a
    /// newly created one can hold the node.
    pub fn allocate_node(&mut self, node: NodeId) -> Result<u64> {
        let (tree, level, old) = {
            let n = &self.state.trees.arena[node];
            (n.tree, n.level, n.address)
        };
        let flags = self.state.policy.tree_flags(tree);

        let mut candidates = Vec::new();
        if let Some(idx) = old.and_then(|old| self.state.chunk_index(old)) {
            if self.state.chunks[idx].lock().matches_type(flags) {
                candidates.push(idx);
            }
        }
        for (idx, chunk) in self.state.chunks.iter().enumerate() {
            if !candidates.contains(&idx) && chunk.lock().flags == flags {
                candidates.push(idx);
            }
        }
        for idx in candidates {
            if let Some(address) = self.insert_tree_extent(idx, tree, level)? {
                self.state.trees.arena[node].new_address = Some(address);
                return Ok(address);
            }
        }

        let idx = self.state.alloc_chunk(flags)?;
        if let Some(address) = self.insert_tree_extent(idx, tree, level)? {
            self.state.trees.arena[node].new_address = Some(address);
            return Ok(address);
        }
        error!(tree = tree.0, level, "alloc.disk_full");
        Err(ArborError::NoSpace("no chunk can hold a tree block"))
    }

    /// Carves a node-sized extent out of chunk `idx` and records its
    /// reference. Returns `None` when the chunk has no room.
    fn insert_tree_extent(&mut self, idx: usize, tree: TreeId, level: u8) -> Result<Option<u64>> {
        let node_size = self.state.node_size();
        let address = {
            let chunk = self.state.chunks[idx].lock();
            if chunk.size - chunk.used < node_size {
                return Ok(None);
            }
            match chunk.free.find_fit(node_size) {
                Some(address) => address,
                None => return Ok(None),
            }
        };
        self.state.claim_extent(idx, address, node_size)?;
        let record = ExtentItem::tree_block(tree.0, self.generation());
        let leaf = self.state.trees.insert_item(
            TreeId::EXTENT,
            Key::new(address, item_type::METADATA_ITEM, level as u64),
            record.encode(),
            self.undo,
        )?;
        self.state.mark_ancestors_dirty(leaf);
        trace!(address, tree = tree.0, level, "alloc.tree_extent");
        Ok(Some(address))
    }

    /// Gives every dirty node that lacks one a new address, releasing the
    /// extent its previous copy occupied.
    ///
    /// Recording references may dirty further extent-tree nodes; those are
    /// picked up by the same call.
    pub fn allocate_tree_extents(&mut self) -> Result<usize> {
        let mut allocated = 0;
        loop {
            let pending: Vec<NodeId> = self
                .state
                .trees
                .arena
                .iter()
                .filter(|(_, n)| n.dirty && n.new_address.is_none())
                .map(|(id, _)| id)
                .collect();
            if pending.is_empty() {
                return Ok(allocated);
            }
            for node in pending {
                let Some(n) = self.state.trees.arena.get(node) else {
                    continue;
                };
                if n.new_address.is_some() {
                    continue;
                }
                let old = n.address;
                self.allocate_node(node)?;
                if let Some(old) = old {
                    self.reduce_tree_extent(old, Some(node))?;
                }
                allocated += 1;
            }
        }
    }

    /// Deletes the extent record of the tree block at `address` and returns
    /// its space.
    ///
    /// When `node` is given and its on-disk copy predates mixed
    /// back-references, the references it holds to its children are
    /// upgraded first.
    pub fn reduce_tree_extent(&mut self, address: u64, node: Option<NodeId>) -> Result<()> {
        let node_size = self.state.node_size();
        let seek = Key::new(address, item_type::METADATA_ITEM, u64::MAX);
        let skinny = self
            .state
            .trees
            .search(TreeId::EXTENT, &seek)?
            .filter(|c| {
                let key = self.state.trees.key_at(*c);
                key.objectid == address && key.item_type == item_type::METADATA_ITEM
            });

        if let Some(cursor) = skinny {
            self.state.trees.delete_item(cursor, self.undo)?;
        } else {
            let key = Key::new(address, item_type::EXTENT_ITEM, node_size);
            let cursor = self.state.trees.lookup(TreeId::EXTENT, &key)?.ok_or_else(|| {
                error!(address, "alloc.reduce.record_missing");
                ArborError::Inconsistent(format!("no extent record for tree block {address:#x}"))
            })?;
            let record = ExtentRecord::decode(self.state.trees.data_at(cursor), false)?;
            if record.refs() > 1 {
                return Err(ArborError::Unsupported("tree block with several references"));
            }
            self.state.trees.delete_item(cursor, self.undo)?;
            if matches!(record, ExtentRecord::LegacyV0 { .. }) {
                self.delete_first_ref_v0(address)?;
            }
        }

        if let Some(node) = node {
            if self.state.trees.arena[node].flags & NODE_FLAG_MIXED_BACKREF == 0 {
                self.convert_legacy_children(node)?;
            }
        }
        self.state.release_extent(address, node_size)
    }

    fn delete_first_ref_v0(&mut self, address: u64) -> Result<Option<ExtentRefV0>> {
        let seek = Key::new(address, item_type::EXTENT_REF_V0, 0);
        let Some(cursor) = self
            .state
            .trees
            .search_forward(TreeId::EXTENT, &seek)?
            .filter(|c| {
                let key = self.state.trees.key_at(*c);
                key.objectid == address && key.item_type == item_type::EXTENT_REF_V0
            })
        else {
            return Ok(None);
        };
        let (_, data) = self.state.trees.delete_item(cursor, self.undo)?;
        ExtentRefV0::decode(&data).map(Some)
    }

    fn convert_legacy_children(&mut self, node: NodeId) -> Result<()> {
        let n = &self.state.trees.arena[node];
        let tree = n.tree;
        if n.level > 0 {
            let level = n.level - 1;
            let children: Vec<u64> = n
                .items
                .iter()
                .filter(|item| !item.inserted)
                .filter_map(|item| item.pointer_ref().map(|ptr| ptr.address))
                .filter(|address| *address != 0)
                .collect();
            for child in children {
                self.convert_old_tree_extent(child, level, tree)?;
            }
            return Ok(());
        }

        let mut extents = Vec::new();
        for item in n.items.iter().filter(|item| !item.inserted) {
            if item.key.item_type != item_type::EXTENT_DATA {
                continue;
            }
            let ItemBody::Leaf(data) = &item.body else {
                continue;
            };
            let extent = FileExtentItem::decode(data)?;
            if !extent.references_extent() {
                continue;
            }
            extents.push(LegacyDataExtent {
                address: extent.disk_bytenr,
                size: extent.disk_num_bytes,
                owner: extent.data_ref(tree.0, &item.key),
            });
        }
        for extent in extents {
            self.convert_old_data_extent(&extent)?;
        }
        Ok(())
    }

    /// Replaces a child's legacy reference pair with a skinny record owned by
    /// `tree`.
    fn convert_old_tree_extent(&mut self, address: u64, level: u8, tree: TreeId) -> Result<()> {
        let Some(v0) = self.delete_first_ref_v0(address)? else {
            trace!(address, "alloc.legacy_ref_absent");
            return Ok(());
        };
        let key = Key::new(address, item_type::EXTENT_ITEM, self.state.node_size());
        self.state
            .trees
            .delete_key(TreeId::EXTENT, &key, self.undo)?;
        let record = ExtentItem {
            refs: 1,
            generation: v0.generation,
            flags: EXTENT_FLAG_TREE_BLOCK,
            tree_block_info: None,
            inline: vec![InlineRef::TreeBlock { root: tree.0 }],
        };
        self.state.trees.insert_item(
            TreeId::EXTENT,
            Key::new(address, item_type::METADATA_ITEM, level as u64),
            record.encode(),
            self.undo,
        )?;
        trace!(address, level, tree = tree.0, "alloc.legacy_tree_ref_upgraded");
        Ok(())
    }

    /// Rewrites a legacy data extent record with inline data references.
    pub(super) fn convert_old_data_extent(&mut self, extent: &LegacyDataExtent) -> Result<()> {
        let key = Key::new(extent.address, item_type::EXTENT_ITEM, extent.size);
        let Some(cursor) = self.state.trees.lookup(TreeId::EXTENT, &key)? else {
            return Ok(());
        };
        let ExtentRecord::LegacyV0 { refs } =
            ExtentRecord::decode(self.state.trees.data_at(cursor), false)?
        else {
            return Ok(());
        };
        let from = Key::new(extent.address, item_type::EXTENT_REF_V0, 0);
        let to = Key::new(extent.address, item_type::EXTENT_REF_V0, u64::MAX);
        let old_refs = self.state.trees.collect_range(TreeId::EXTENT, &from, &to)?;

        let mut generation = 0;
        let mut inline: Vec<InlineRef> = Vec::with_capacity(old_refs.len());
        for (ref_key, data) in &old_refs {
            let v0 = ExtentRefV0::decode(data)?;
            generation = generation.max(v0.generation);
            let offset = if v0.root == extent.owner.root && v0.objectid == extent.owner.objectid {
                extent.owner.offset
            } else {
                0
            };
            inline.push(InlineRef::Data(DataRef {
                root: v0.root,
                objectid: v0.objectid,
                offset,
                count: v0.count,
            }));
            self.state
                .trees
                .delete_key(TreeId::EXTENT, ref_key, self.undo)?;
        }
        if inline.is_empty() {
            inline.push(InlineRef::Data(DataRef {
                count: refs,
                ..extent.owner
            }));
        }
        self.state
            .trees
            .delete_key(TreeId::EXTENT, &key, self.undo)?;
        let record = ExtentItem {
            refs: refs as u64,
            generation: if generation == 0 {
                self.generation()
            } else {
                generation
            },
            flags: EXTENT_FLAG_DATA,
            tree_block_info: None,
            inline,
        };
        self.state
            .trees
            .insert_item(TreeId::EXTENT, key, record.encode(), self.undo)?;
        trace!(address = extent.address, "alloc.legacy_data_ref_upgraded");
        Ok(())
    }
}
