//! Data extent reference bookkeeping.
//!
//! Collaborators adjust data references through [`FsState::adjust_data_ref`],
//! which only updates the chunk's in-memory [`ChangedExtent`] set. The commit
//! reconciles each changed extent against its on-disk record in
//! [`Transaction::flush_changed_extent`].

use tracing::{debug, error, trace, warn};

use super::alloc::LegacyDataExtent;
use super::{ChangedSectorRun, FsState, Transaction};
use crate::storage::arena::{NodeId, NODE_FLAG_MIXED_BACKREF, NODE_FLAG_SHARED_BACKREF};
use crate::storage::chunk::{block_group, ChangedExtent};
use crate::storage::records::{
    encode_legacy_extent, DataRef, ExtentItem, ExtentRecord, ExtentRefV0, InlineRef,
    EXTENT_FLAG_DATA,
};
use crate::types::{item_type, ArborError, Key, Result, TreeId};

/// A data reference recorded through a parent leaf that must be re-recorded
/// as a full reference once that leaf is rewritten.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SharedDataRef {
    /// Address of the leaf holding the file extent item.
    pub leaf: u64,
    /// Data extent address.
    pub extent: u64,
    /// Data extent size.
    pub size: u64,
    /// Full reference replacing the shared one.
    pub data_ref: DataRef,
}

impl FsState {
    /// First existing data chunk with a free range of `len` bytes.
    pub fn find_data_space(&self, len: u64) -> Option<(usize, u64)> {
        self.chunks.iter().enumerate().find_map(|(idx, chunk)| {
            let chunk = chunk.lock();
            if !chunk.matches_type(block_group::DATA) || chunk.size - chunk.used < len {
                return None;
            }
            chunk.free.find_fit(len).map(|at| (idx, at))
        })
    }

    /// Allocates a data extent of `len` bytes, creating a data chunk when no
    /// existing one has room.
    pub fn alloc_data_extent(&mut self, len: u64) -> Result<u64> {
        let (idx, at) = match self.find_data_space(len) {
            Some(found) => found,
            None => {
                let idx = self.alloc_chunk(self.policy.data_flags())?;
                let at = self.chunks[idx]
                    .lock()
                    .free
                    .find_fit(len)
                    .ok_or(ArborError::NoSpace("data extent larger than a chunk"))?;
                (idx, at)
            }
        };
        self.claim_extent(idx, at, len)?;
        trace!(address = at, len, "bookkeep.data_extent_allocated");
        Ok(at)
    }

    /// Adjusts the reference held by `(root, objectid, offset)` on the data
    /// extent at `address` by `delta`.
    ///
    /// The first adjustment of an extent in a transaction snapshots its
    /// on-disk reference set as the "old" side of the reconciliation.
    pub fn adjust_data_ref(
        &mut self,
        address: u64,
        size: u64,
        owner: DataRef,
        delta: i64,
        no_csum: bool,
    ) -> Result<()> {
        let idx = self.chunk_for(address)?;
        let tracked = self.chunks[idx]
            .lock()
            .changed_extent_mut(address)
            .is_some();
        if !tracked {
            let extent = self.load_changed_extent(address, size, no_csum)?;
            self.chunks[idx].lock().changed_extents.push(extent);
        }
        let mut chunk = self.chunks[idx].lock();
        chunk.changed = true;
        let extent = chunk
            .changed_extent_mut(address)
            .ok_or_else(|| ArborError::Inconsistent(format!("extent {address:#x} untracked")))?;
        extent.size = size;
        extent.no_csum |= no_csum;
        extent.apply_delta(owner.root, owner.objectid, owner.offset, delta)
    }

    fn load_changed_extent(&self, address: u64, size: u64, no_csum: bool) -> Result<ChangedExtent> {
        let seek = Key::new(address, item_type::EXTENT_ITEM, u64::MAX);
        let found = self.trees.search(TreeId::EXTENT, &seek)?.filter(|c| {
            let key = self.trees.key_at(*c);
            key.objectid == address && key.item_type == item_type::EXTENT_ITEM
        });
        let (old_count, old_refs, old_size) = match found {
            Some(cursor) => {
                let key = self.trees.key_at(cursor);
                match ExtentRecord::decode(self.trees.data_at(cursor), false)? {
                    ExtentRecord::Current(item) => {
                        let refs = item
                            .inline
                            .iter()
                            .filter_map(|r| match r {
                                InlineRef::Data(d) => Some(*d),
                                _ => None,
                            })
                            .collect();
                        (item.refs, refs, key.offset)
                    }
                    ExtentRecord::LegacyV0 { refs } => (refs as u64, Vec::new(), key.offset),
                }
            }
            None => (0, Vec::new(), size),
        };
        Ok(ChangedExtent {
            address,
            size,
            old_size,
            count: old_count,
            old_count,
            no_csum,
            refs: old_refs.clone(),
            old_refs,
        })
    }
}

fn owner_matches(r: &InlineRef, owner: &DataRef) -> bool {
    matches!(r, InlineRef::Data(d) if d.same_owner(owner))
}

impl Transaction<'_> {
    /// Reconciles one changed extent with the extent tree.
    ///
    /// References gained are added, references lost are removed, a size
    /// change re-keys the record, and an extent left without references has
    /// its checksums deleted and its space returned.
    pub fn flush_changed_extent(&mut self, extent: ChangedExtent) -> Result<()> {
        let key_size = if extent.old_count > 0 {
            extent.old_size
        } else {
            extent.size
        };
        let mut old_refs = extent.old_refs.clone();
        for r in &extent.refs {
            let old = old_refs
                .iter()
                .position(|o| o.same_owner(r))
                .map_or(0, |i| old_refs.remove(i).count);
            if r.count > old {
                let added = DataRef {
                    count: r.count - old,
                    ..*r
                };
                self.increase_extent_refcount_data(extent.address, key_size, added)?;
            } else if r.count < old {
                self.decrease_extent_refcount_data(extent.address, key_size, r, old - r.count)?;
            }
        }
        for o in old_refs {
            self.decrease_extent_refcount_data(extent.address, key_size, &o, o.count)?;
        }

        if extent.count > 0 && extent.old_count > 0 && extent.size != extent.old_size {
            let old_key = Key::new(extent.address, item_type::EXTENT_ITEM, extent.old_size);
            let data = self
                .state
                .trees
                .delete_key(TreeId::EXTENT, &old_key, self.undo)?;
            self.state.trees.insert_item(
                TreeId::EXTENT,
                Key::new(extent.address, item_type::EXTENT_ITEM, extent.size),
                data,
                self.undo,
            )?;
            debug!(
                address = extent.address,
                from = extent.old_size,
                to = extent.size,
                "bookkeep.extent_resized"
            );
        }

        if extent.count == 0 {
            if !extent.no_csum {
                let sectors = extent.size / self.state.sector_size();
                self.csum_runs
                    .lock()
                    .push(ChangedSectorRun::deleted(extent.address, sectors));
            }
            self.state.release_extent(extent.address, extent.size)?;
            debug!(address = extent.address, size = extent.size, "bookkeep.extent_freed");
        }
        Ok(())
    }

    /// Adds `data_ref.count` references from `data_ref`'s owner to the
    /// record keyed `(address, EXTENT_ITEM, size)`, creating it if needed.
    pub fn increase_extent_refcount_data(
        &mut self,
        address: u64,
        size: u64,
        data_ref: DataRef,
    ) -> Result<()> {
        let key = Key::new(address, item_type::EXTENT_ITEM, size);
        let Some(cursor) = self.state.trees.lookup(TreeId::EXTENT, &key)? else {
            let record = ExtentItem::data(data_ref, self.generation());
            self.state
                .trees
                .insert_item(TreeId::EXTENT, key, record.encode(), self.undo)?;
            return Ok(());
        };
        let mut record = match ExtentRecord::decode(self.state.trees.data_at(cursor), false)? {
            ExtentRecord::Current(item) => item,
            ExtentRecord::LegacyV0 { refs } => ExtentItem {
                refs: refs as u64,
                generation: self.generation(),
                flags: EXTENT_FLAG_DATA,
                tree_block_info: None,
                inline: Vec::new(),
            },
        };
        match record
            .inline
            .iter_mut()
            .find(|r| owner_matches(r, &data_ref))
        {
            Some(InlineRef::Data(existing)) => existing.count += data_ref.count,
            _ => record.inline.push(InlineRef::Data(data_ref)),
        }
        record.refs += data_ref.count as u64;
        self.state.trees.delete_item(cursor, self.undo)?;
        self.state
            .trees
            .insert_item(TreeId::EXTENT, key, record.encode(), self.undo)?;
        Ok(())
    }

    /// Removes `count` references held by `owner`, deleting the record when
    /// none remain.
    pub fn decrease_extent_refcount_data(
        &mut self,
        address: u64,
        size: u64,
        owner: &DataRef,
        count: u32,
    ) -> Result<()> {
        let key = Key::new(address, item_type::EXTENT_ITEM, size);
        let mut record = self.load_current_record(&key, Some(owner))?;
        let slot = record
            .inline
            .iter()
            .position(|r| owner_matches(r, owner))
            .ok_or_else(|| {
                error!(address, root = owner.root, inode = owner.objectid, "bookkeep.ref_missing");
                ArborError::Inconsistent(format!("extent {address:#x} lacks the dropped reference"))
            })?;
        if let InlineRef::Data(d) = &mut record.inline[slot] {
            if d.count < count {
                return Err(ArborError::Inconsistent(format!(
                    "extent {address:#x} reference count underflow"
                )));
            }
            d.count -= count;
            if d.count == 0 {
                record.inline.remove(slot);
            }
        }
        self.store_record(key, record, count as u64)
    }

    /// Removes `count` references recorded through the parent leaf at
    /// `parent`.
    pub fn decrease_extent_refcount_shared_data(
        &mut self,
        address: u64,
        size: u64,
        parent: u64,
        count: u32,
    ) -> Result<()> {
        let key = Key::new(address, item_type::EXTENT_ITEM, size);
        let mut record = self.load_current_record(&key, None)?;
        let slot = record
            .inline
            .iter()
            .position(|r| matches!(r, InlineRef::SharedData { parent: p, .. } if *p == parent))
            .ok_or_else(|| {
                ArborError::Inconsistent(format!("extent {address:#x} has no shared reference"))
            })?;
        let mut dropped = count;
        if let InlineRef::SharedData { count: held, .. } = &mut record.inline[slot] {
            dropped = count.min(*held);
            *held -= dropped;
            if *held == 0 {
                record.inline.remove(slot);
            }
        }
        self.store_record(key, record, dropped as u64)
    }

    /// Removes the legacy reference recorded through `parent`.
    pub fn decrease_extent_refcount_old(&mut self, address: u64, size: u64, parent: u64) -> Result<()> {
        let ref_key = Key::new(address, item_type::EXTENT_REF_V0, parent);
        let data = self
            .state
            .trees
            .delete_key(TreeId::EXTENT, &ref_key, self.undo)?;
        let dropped = ExtentRefV0::decode(&data)?.count as u64;
        let key = Key::new(address, item_type::EXTENT_ITEM, size);
        let cursor = self
            .state
            .trees
            .lookup(TreeId::EXTENT, &key)?
            .ok_or_else(|| ArborError::Inconsistent(format!("extent {address:#x} missing")))?;
        match ExtentRecord::decode(self.state.trees.data_at(cursor), false)? {
            ExtentRecord::Current(record) => self.store_record(key, record, dropped),
            ExtentRecord::LegacyV0 { refs } => {
                self.state.trees.delete_item(cursor, self.undo)?;
                let left = (refs as u64).saturating_sub(dropped);
                if left > 0 {
                    self.state.trees.insert_item(
                        TreeId::EXTENT,
                        key,
                        encode_legacy_extent(left as u32),
                        self.undo,
                    )?;
                }
                Ok(())
            }
        }
    }

    fn load_current_record(&mut self, key: &Key, owner: Option<&DataRef>) -> Result<ExtentItem> {
        let cursor = self.state.trees.lookup(TreeId::EXTENT, key)?.ok_or_else(|| {
            error!(address = key.objectid, "bookkeep.record_missing");
            ArborError::Inconsistent(format!("extent record {key} missing"))
        })?;
        match ExtentRecord::decode(self.state.trees.data_at(cursor), false)? {
            ExtentRecord::Current(item) => Ok(item),
            ExtentRecord::LegacyV0 { .. } => {
                let owner = owner.copied().unwrap_or(DataRef {
                    root: 0,
                    objectid: 0,
                    offset: 0,
                    count: 0,
                });
                self.convert_old_data_extent(&LegacyDataExtent {
                    address: key.objectid,
                    size: key.offset,
                    owner,
                })?;
                let cursor = self
                    .state
                    .trees
                    .lookup(TreeId::EXTENT, key)?
                    .ok_or_else(|| ArborError::Inconsistent(format!("extent record {key} lost")))?;
                ExtentItem::decode(self.state.trees.data_at(cursor), false)
            }
        }
    }

    /// Writes `record` back with `dropped` fewer references, deleting it when
    /// none remain.
    fn store_record(&mut self, key: Key, mut record: ExtentItem, dropped: u64) -> Result<()> {
        record.refs = record.refs.checked_sub(dropped).ok_or_else(|| {
            ArborError::Inconsistent(format!("extent {:#x} refs underflow", key.objectid))
        })?;
        self.state
            .trees
            .delete_key(TreeId::EXTENT, &key, self.undo)?;
        if record.refs > 0 {
            self.state
                .trees
                .insert_item(TreeId::EXTENT, key, record.encode(), self.undo)?;
        }
        Ok(())
    }

    /// Re-records queued shared data references of dirty leaves as full
    /// references and gives those leaves mixed back-references.
    pub fn convert_shared_data_refs(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.state.pending.shared_data_refs);
        if pending.is_empty() {
            return Ok(());
        }
        let leaves: Vec<(NodeId, u64, bool)> = self
            .state
            .trees
            .arena
            .iter()
            .filter(|(_, n)| {
                n.dirty
                    && n.is_leaf()
                    && (n.flags & NODE_FLAG_SHARED_BACKREF != 0
                        || n.flags & NODE_FLAG_MIXED_BACKREF == 0)
            })
            .filter_map(|(id, n)| {
                n.address
                    .map(|a| (id, a, n.flags & NODE_FLAG_MIXED_BACKREF != 0))
            })
            .collect();

        let mut unmatched = Vec::new();
        let mut converted = 0usize;
        for entry in pending {
            let Some(&(leaf, parent, mixed)) = leaves.iter().find(|(_, a, _)| *a == entry.leaf)
            else {
                unmatched.push(entry);
                continue;
            };
            self.increase_extent_refcount_data(entry.extent, entry.size, entry.data_ref)?;
            let result = if mixed {
                self.decrease_extent_refcount_shared_data(
                    entry.extent,
                    entry.size,
                    parent,
                    entry.data_ref.count,
                )
            } else {
                self.decrease_extent_refcount_old(entry.extent, entry.size, parent)
            };
            if let Err(err) = result {
                warn!(extent = entry.extent, leaf = parent, error = %err, "bookkeep.shared_ref_not_dropped");
            }
            let node = &mut self.state.trees.arena[leaf];
            node.flags &= !NODE_FLAG_SHARED_BACKREF;
            node.flags |= NODE_FLAG_MIXED_BACKREF;
            converted += 1;
        }
        self.state.pending.shared_data_refs = unmatched;
        debug!(converted, "bookkeep.shared_refs_converted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::engine::testutil;
    use crate::storage::arena::Item;
    use crate::storage::undo::UndoLog;

    const NODE: u32 = 4096;

    fn owner(objectid: u64) -> DataRef {
        DataRef {
            root: TreeId::FS.0,
            objectid,
            offset: 0,
            count: 1,
        }
    }

    fn record(state: &FsState, address: u64, size: u64) -> Option<ExtentItem> {
        let key = Key::new(address, item_type::EXTENT_ITEM, size);
        state
            .trees
            .lookup(TreeId::EXTENT, &key)
            .unwrap()
            .map(|c| ExtentItem::decode(state.trees.data_at(c), false).unwrap())
    }

    /// Data extent already recorded on disk with one reference per owner.
    fn committed_extent(state: &mut FsState, size: u64, owners: &[DataRef]) -> u64 {
        let address = state.alloc_data_extent(size).unwrap();
        state.fresh.clear();
        let mut item = ExtentItem::data(owners[0], 1);
        for o in &owners[1..] {
            item.inline.push(InlineRef::Data(*o));
            item.refs += 1;
        }
        let mut undo = UndoLog::new();
        state
            .trees
            .insert_item(
                TreeId::EXTENT,
                Key::new(address, item_type::EXTENT_ITEM, size),
                item.encode(),
                &mut undo,
            )
            .unwrap();
        address
    }

    #[test]
    fn new_reference_creates_record() {
        let mut state = testutil::state(1, 256 << 20, NODE);
        let address = state.alloc_data_extent(8192).unwrap();
        state
            .adjust_data_ref(address, 8192, owner(257), 1, false)
            .unwrap();
        let idx = state.chunk_for(address).unwrap();
        let extents = std::mem::take(&mut state.chunks[idx].lock().changed_extents);

        let mut undo = UndoLog::new();
        let runs = Mutex::new(Vec::new());
        let mut tx = Transaction::new(&mut state, &mut undo, &runs);
        for extent in extents {
            tx.flush_changed_extent(extent).unwrap();
        }
        let item = record(tx.state, address, 8192).unwrap();
        assert_eq!(item.refs, 1);
        assert_eq!(item.inline, vec![InlineRef::Data(owner(257))]);
        assert!(runs.lock().is_empty());
    }

    #[test]
    fn last_reference_frees_and_deletes_checksums() {
        let mut state = testutil::state(1, 256 << 20, NODE);
        let address = committed_extent(&mut state, 8192, &[owner(257)]);
        state
            .adjust_data_ref(address, 8192, owner(257), -1, false)
            .unwrap();
        let idx = state.chunk_for(address).unwrap();
        let extents = std::mem::take(&mut state.chunks[idx].lock().changed_extents);

        let mut undo = UndoLog::new();
        let runs = Mutex::new(Vec::new());
        let mut tx = Transaction::new(&mut state, &mut undo, &runs);
        for extent in extents {
            tx.flush_changed_extent(extent).unwrap();
        }
        assert!(record(tx.state, address, 8192).is_none());
        let chunk = tx.state.chunks[idx].lock();
        assert!(chunk.pinned.contains(address, 8192));
        assert_eq!(chunk.used, 0);
        drop(chunk);
        assert_eq!(*runs.lock(), vec![ChangedSectorRun::deleted(address, 2)]);
    }

    #[test]
    fn unmatched_old_references_are_dropped() {
        let mut state = testutil::state(1, 256 << 20, NODE);
        let address = committed_extent(&mut state, 4096, &[owner(257), owner(258)]);
        state
            .adjust_data_ref(address, 4096, owner(257), -1, false)
            .unwrap();
        let idx = state.chunk_for(address).unwrap();
        let extents = std::mem::take(&mut state.chunks[idx].lock().changed_extents);
        let mut undo = UndoLog::new();
        let runs = Mutex::new(Vec::new());
        let mut tx = Transaction::new(&mut state, &mut undo, &runs);
        for extent in extents {
            tx.flush_changed_extent(extent).unwrap();
        }
        let item = record(tx.state, address, 4096).unwrap();
        assert_eq!(item.refs, 1);
        assert_eq!(item.inline, vec![InlineRef::Data(owner(258))]);
    }

    #[test]
    fn resized_extent_is_rekeyed() {
        let mut state = testutil::state(1, 256 << 20, NODE);
        let address = committed_extent(&mut state, 4096, &[owner(257)]);
        state
            .adjust_data_ref(address, 8192, owner(300), 1, false)
            .unwrap();
        let idx = state.chunk_for(address).unwrap();
        let extents = std::mem::take(&mut state.chunks[idx].lock().changed_extents);
        let mut undo = UndoLog::new();
        let runs = Mutex::new(Vec::new());
        let mut tx = Transaction::new(&mut state, &mut undo, &runs);
        for extent in extents {
            tx.flush_changed_extent(extent).unwrap();
        }
        assert!(record(tx.state, address, 4096).is_none());
        let item = record(tx.state, address, 8192).unwrap();
        assert_eq!(item.refs, 2);
    }

    #[test]
    fn shared_references_become_full_references() {
        let mut state = testutil::state(1, 256 << 20, NODE);
        let leaf_addr = 0x10_0000_0000;
        let address = committed_extent(&mut state, 4096, &[owner(1)]);
        let mut undo = UndoLog::new();
        let shared = ExtentItem {
            refs: 1,
            generation: 1,
            flags: EXTENT_FLAG_DATA,
            tree_block_info: None,
            inline: vec![InlineRef::SharedData {
                parent: leaf_addr,
                count: 1,
            }],
        };
        state
            .trees
            .upsert_item(
                TreeId::EXTENT,
                Key::new(address, item_type::EXTENT_ITEM, 4096),
                shared.encode(),
                &mut undo,
            )
            .unwrap();
        let root = state.trees.root(TreeId::FS).unwrap();
        {
            let leaf = &mut state.trees.arena[root];
            leaf.address = Some(leaf_addr);
            leaf.flags |= NODE_FLAG_SHARED_BACKREF;
            leaf.items
                .push(Item::leaf(Key::new(257, item_type::INODE_ITEM, 0), vec![0; 4]));
        }
        let full = owner(257);
        state.pending.shared_data_refs.push(SharedDataRef {
            leaf: leaf_addr,
            extent: address,
            size: 4096,
            data_ref: full,
        });
        state.pending.shared_data_refs.push(SharedDataRef {
            leaf: 0xdead_0000,
            extent: address,
            size: 4096,
            data_ref: full,
        });

        let runs = Mutex::new(Vec::new());
        let mut tx = Transaction::new(&mut state, &mut undo, &runs);
        tx.convert_shared_data_refs().unwrap();
        let item = record(tx.state, address, 4096).unwrap();
        assert_eq!(item.refs, 1);
        assert_eq!(item.inline, vec![InlineRef::Data(full)]);
        let flags = tx.state.trees.arena[root].flags;
        assert_eq!(flags & NODE_FLAG_SHARED_BACKREF, 0);
        assert_ne!(flags & NODE_FLAG_MIXED_BACKREF, 0);
        assert_eq!(tx.state.pending.shared_data_refs.len(), 1);
    }
}
