//! Root items: refresh before the fixed point, publication after it, and
//! dropping of whole trees.

use std::collections::BTreeSet;

use tracing::{debug, error, info, warn};

use super::Transaction;
use crate::storage::arena::ItemBody;
use crate::storage::records::{FileExtentItem, RootItem};
use crate::storage::store::Cursor;
use crate::types::{item_type, ArborError, Key, Result, TreeId};

fn root_item_key(tree: TreeId) -> Key {
    Key::new(tree.0, item_type::ROOT_ITEM, 0)
}

impl Transaction<'_> {
    /// Marks the root tree's root node dirty so its generation advances
    /// with every commit.
    pub fn force_root_dirty(&mut self) -> Result<()> {
        let root = self.state.trees.root(TreeId::ROOT)?;
        self.state.trees.arena[root].dirty = true;
        Ok(())
    }

    /// Trees that own at least one dirty node.
    fn dirty_trees(&self) -> BTreeSet<TreeId> {
        self.state
            .trees
            .arena
            .iter()
            .filter(|(_, n)| n.dirty)
            .map(|(_, n)| n.tree)
            .collect()
    }

    fn root_item_cursor(&self, tree: TreeId) -> Result<Cursor> {
        self.state
            .trees
            .lookup(TreeId::ROOT, &root_item_key(tree))?
            .ok_or_else(|| {
                error!(tree = tree.0, "roots.root_item_missing");
                ArborError::Inconsistent(format!("root item of tree {tree} missing"))
            })
    }

    /// Dirties the root-tree leaf holding the root item of every dirty tree
    /// (and always the extent tree's), rewriting legacy short items at full
    /// length on the way.
    pub fn refresh_root_items(&mut self) -> Result<()> {
        let mut trees = self.dirty_trees();
        trees.insert(TreeId::EXTENT);
        for tree in trees.into_iter().filter(|t| !t.is_superblock_rooted()) {
            let cursor = self.root_item_cursor(tree)?;
            let data = self.state.trees.data_at(cursor);
            if RootItem::is_short(data) {
                let mut item = RootItem::decode(data)?;
                item.generation_v2 = item.generation;
                self.state.trees.delete_item(cursor, self.undo)?;
                self.state.trees.insert_item(
                    TreeId::ROOT,
                    root_item_key(tree),
                    item.encode(),
                    self.undo,
                )?;
                debug!(tree = tree.0, "roots.short_item_upgraded");
            } else {
                self.state.trees.arena[cursor.node].dirty = true;
            }
        }
        Ok(())
    }

    /// Writes the new address, level and generation of every rewritten root
    /// into its root item.
    ///
    /// The item is replaced in place; its leaf was dirtied by
    /// [`Transaction::refresh_root_items`] and already has its new address.
    pub fn update_root_root(&mut self) -> Result<()> {
        let generation = self.generation();
        let roots: Vec<(TreeId, u64, u8)> = self
            .state
            .trees
            .trees
            .values()
            .filter(|t| !t.id.is_superblock_rooted())
            .filter_map(|t| {
                let node = &self.state.trees.arena[t.root];
                (node.dirty && node.parent.is_none())
                    .then(|| node.new_address.map(|a| (t.id, a, node.level)))
                    .flatten()
            })
            .collect();

        for (tree, address, level) in roots {
            let item = {
                let logical = self.state.trees.tree_mut(tree)?;
                logical.root_item.bytenr = address;
                logical.root_item.level = level;
                logical.root_item.generation = generation;
                logical.root_item.generation_v2 = generation;
                logical.root_item.clone()
            };
            let cursor = self.root_item_cursor(tree)?;
            let leaf = &mut self.state.trees.arena[cursor.node];
            if !leaf.dirty {
                return Err(ArborError::Inconsistent(format!(
                    "root item leaf of tree {tree} was not rewritten"
                )));
            }
            let encoded = item.encode();
            let slot = &mut leaf.items[cursor.slot];
            if slot.data().map(<[u8]>::len) != Some(encoded.len()) {
                return Err(ArborError::Inconsistent(format!(
                    "root item of tree {tree} changed length"
                )));
            }
            slot.body = ItemBody::Leaf(encoded);
            debug!(tree = tree.0, address, level, "roots.published");
        }
        Ok(())
    }

    /// Drops every tree queued for deletion: all of its blocks and the data
    /// references held by its file extents are released, and its root item
    /// removed.
    pub fn drop_roots(&mut self) -> Result<()> {
        let queued = std::mem::take(&mut self.state.pending.drop_roots);
        for tree in queued {
            if tree.is_superblock_rooted()
                || [TreeId::EXTENT, TreeId::DEV, TreeId::CSUM].contains(&tree)
            {
                return Err(ArborError::Invalid("system trees cannot be dropped"));
            }
            self.drop_root(tree)?;
        }
        Ok(())
    }

    fn drop_root(&mut self, tree: TreeId) -> Result<()> {
        let root = self.state.trees.root(tree)?;
        let nodes = self.state.trees.arena.subtree(root);

        let mut data_refs = Vec::new();
        for id in &nodes {
            let node = &self.state.trees.arena[*id];
            if !node.is_leaf() {
                continue;
            }
            for item in &node.items {
                if item.key.item_type != item_type::EXTENT_DATA {
                    continue;
                }
                let Some(data) = item.data() else {
                    continue;
                };
                let extent = FileExtentItem::decode(data)?;
                if extent.references_extent() {
                    data_refs.push((
                        extent.disk_bytenr,
                        extent.disk_num_bytes,
                        extent.data_ref(tree.0, &item.key),
                    ));
                }
            }
        }
        for (address, size, owner) in data_refs {
            self.state.adjust_data_ref(address, size, owner, -1, false)?;
        }

        for id in &nodes {
            let node = &self.state.trees.arena[*id];
            if let Some(address) = node.new_address.or(node.address) {
                self.reduce_tree_extent(address, None)?;
            }
        }

        match self.state.trees.lookup(TreeId::ROOT, &root_item_key(tree))? {
            Some(cursor) => {
                self.state.trees.delete_item(cursor, self.undo)?;
            }
            None => warn!(tree = tree.0, "roots.drop.root_item_missing"),
        }
        self.state.trees.trees.remove(&tree);
        for id in nodes {
            self.state.trees.arena.release(id);
        }
        info!(tree = tree.0, "roots.dropped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::engine::{testutil, FsState};
    use crate::storage::records::{ExtentItem, FILE_EXTENT_REGULAR};
    use crate::storage::undo::UndoLog;

    fn with_root_items(state: &mut FsState) {
        let mut undo = UndoLog::new();
        for tree in [TreeId::EXTENT, TreeId::DEV, TreeId::FS, TreeId::CSUM] {
            let item = state.trees.trees[&tree].root_item.clone();
            state
                .trees
                .insert_item(TreeId::ROOT, root_item_key(tree), item.encode(), &mut undo)
                .unwrap();
        }
    }

    fn root_item(state: &FsState, tree: TreeId) -> Vec<u8> {
        let cursor = state
            .trees
            .lookup(TreeId::ROOT, &root_item_key(tree))
            .unwrap()
            .unwrap();
        state.trees.data_at(cursor).to_vec()
    }

    #[test]
    fn short_root_items_are_rewritten() {
        let mut state = testutil::state(1, 64 << 20, 4096);
        with_root_items(&mut state);
        let mut undo = UndoLog::new();
        let short = state.trees.trees[&TreeId::FS].root_item.encode()[..RootItem::LEGACY_LEN].to_vec();
        state
            .trees
            .upsert_item(TreeId::ROOT, root_item_key(TreeId::FS), short, &mut undo)
            .unwrap();

        let runs = Mutex::new(Vec::new());
        let mut tx = Transaction::new(&mut state, &mut undo, &runs);
        tx.refresh_root_items().unwrap();
        assert_eq!(root_item(tx.state, TreeId::FS).len(), RootItem::LEN);
    }

    #[test]
    fn missing_root_item_is_inconsistent() {
        let mut state = testutil::state(1, 64 << 20, 4096);
        let mut undo = UndoLog::new();
        let runs = Mutex::new(Vec::new());
        let mut tx = Transaction::new(&mut state, &mut undo, &runs);
        assert!(matches!(
            tx.refresh_root_items(),
            Err(ArborError::Inconsistent(_))
        ));
    }

    #[test]
    fn published_roots_carry_address_and_generation() {
        let mut state = testutil::state(1, 64 << 20, 4096);
        with_root_items(&mut state);
        state.generation = 9;
        let fs_root = state.trees.root(TreeId::FS).unwrap();
        state.trees.arena[fs_root].new_address = Some(0x12_0000);
        let mut undo = UndoLog::new();
        let runs = Mutex::new(Vec::new());
        let mut tx = Transaction::new(&mut state, &mut undo, &runs);
        tx.update_root_root().unwrap();
        let item = RootItem::decode(&root_item(tx.state, TreeId::FS)).unwrap();
        assert_eq!(item.bytenr, 0x12_0000);
        assert_eq!(item.generation, 9);
        assert_eq!(item.generation_v2, 9);
        assert_eq!(item.level, 0);
    }

    #[test]
    fn dropping_a_subvolume_releases_blocks_and_data() {
        let mut state = testutil::state(1, 256 << 20, 4096);
        with_root_items(&mut state);
        let sub = TreeId(TreeId::FIRST_SUBVOLUME);
        let mut undo = UndoLog::new();
        let sub_root = state.trees.create_tree(sub, 1).unwrap();
        let item = state.trees.trees[&sub].root_item.clone();
        state
            .trees
            .insert_item(TreeId::ROOT, root_item_key(sub), item.encode(), &mut undo)
            .unwrap();

        let data = state.alloc_data_extent(4096).unwrap();
        let extent = FileExtentItem {
            generation: 1,
            ram_bytes: 4096,
            extent_type: FILE_EXTENT_REGULAR,
            disk_bytenr: data,
            disk_num_bytes: 4096,
            offset: 0,
            num_bytes: 4096,
            inline_data: Vec::new(),
        };
        let file_key = Key::new(257, item_type::EXTENT_DATA, 0);
        state
            .trees
            .insert_item(sub, file_key, extent.encode(), &mut undo)
            .unwrap();
        let owner = extent.data_ref(sub.0, &file_key);
        state
            .trees
            .insert_item(
                TreeId::EXTENT,
                Key::new(data, item_type::EXTENT_ITEM, 4096),
                ExtentItem::data(owner, 1).encode(),
                &mut undo,
            )
            .unwrap();
        state.pending.drop_roots.push(sub);

        let runs = Mutex::new(Vec::new());
        let mut tx = Transaction::new(&mut state, &mut undo, &runs);
        tx.drop_roots().unwrap();
        assert!(tx.state.trees.root(sub).is_err());
        assert!(tx.state.trees.arena.get(sub_root).is_none());
        assert!(tx
            .state
            .trees
            .lookup(TreeId::ROOT, &root_item_key(sub))
            .unwrap()
            .is_none());

        tx.update_chunk_usage().unwrap();
        assert!(tx
            .state
            .trees
            .lookup(TreeId::EXTENT, &Key::new(data, item_type::EXTENT_ITEM, 4096))
            .unwrap()
            .is_none());
    }

    #[test]
    fn system_trees_cannot_be_dropped() {
        let mut state = testutil::state(1, 64 << 20, 4096);
        state.pending.drop_roots.push(TreeId::EXTENT);
        let mut undo = UndoLog::new();
        let runs = Mutex::new(Vec::new());
        let mut tx = Transaction::new(&mut state, &mut undo, &runs);
        assert!(matches!(tx.drop_roots(), Err(ArborError::Invalid(_))));
    }
}
