//! Chunk creation, drop, and usage records.
//!
//! A chunk exists in memory as soon as the allocator creates it, but gets its
//! chunk item, block-group item and device extents only when the commit
//! records it. Usage changes reach the block-group item and the superblock's
//! global counter once per fixed-point iteration.

use std::cmp::Reverse;

use tracing::{debug, error, info, warn};

use super::{FsState, Transaction};
use crate::storage::chunk::{Chunk, Profile};
use crate::storage::records::{BlockGroupItem, DevExtent, StripeRecord};
use crate::storage::space::{Span, SpaceList};
use crate::storage::superblock::{DEVICE_RESERVED, SUPERBLOCK_OFFSETS};
use crate::types::{item_type, objectid, ArborError, Key, Result, TreeId};

/// Logical address of the first chunk.
pub const FIRST_CHUNK_OFFSET: u64 = 1 << 20;

/// Physical space of a fresh device that chunks may occupy: everything past
/// the reserved head, minus one stripe around each superblock copy.
pub fn initial_device_space(total_bytes: u64, stripe_len: u64) -> Result<SpaceList> {
    let mut free = SpaceList::new();
    if total_bytes <= DEVICE_RESERVED {
        return Ok(free);
    }
    free.add(DEVICE_RESERVED, total_bytes - DEVICE_RESERVED)?;
    for off in SUPERBLOCK_OFFSETS {
        if off < DEVICE_RESERVED || off >= total_bytes {
            continue;
        }
        free.remove(off, stripe_len.min(total_bytes - off))?;
    }
    Ok(free)
}

fn round_down(value: u64, align: u64) -> u64 {
    value - value % align
}

impl FsState {
    /// Creates an in-memory chunk with `flags`, placing its stripes on the
    /// devices with the most free space. The chunk's records are written by
    /// the next commit.
    ///
    /// Shrinks the chunk below the policy size when devices are short on
    /// space, and fails with [`ArborError::NoSpace`] when not even one stripe
    /// length fits.
    pub fn alloc_chunk(&mut self, flags: u64) -> Result<usize> {
        let profile = Profile::from_flags(flags);
        let (num_stripes, sub_stripes) = profile
            .layout(self.devices.len())
            .ok_or(ArborError::Invalid("profile needs more devices"))?;
        let stripe_len = self.policy.stripe_len;
        let factor = profile.stripe_factor(num_stripes, sub_stripes);
        let target = self.policy.chunk_size(flags);
        let mut dev_len = round_down(target / factor, stripe_len).max(stripe_len);

        let placement = loop {
            if let Some(placement) = self.place_stripes(profile, num_stripes, dev_len) {
                break placement;
            }
            if dev_len <= stripe_len {
                warn!(flags, %profile, "chunk.alloc.no_device_space");
                return Err(ArborError::NoSpace("no device space for a new chunk"));
            }
            dev_len = round_down(dev_len / 2, stripe_len).max(stripe_len);
        };

        let mut stripes = Vec::with_capacity(placement.len());
        for (dev_idx, physical) in placement {
            let device = &mut self.devices[dev_idx];
            device.free.remove(physical, dev_len)?;
            device.item.bytes_used += dev_len;
            stripes.push(StripeRecord {
                dev_id: device.id(),
                offset: physical,
                dev_uuid: device.item.uuid,
            });
        }

        let offset = self
            .chunks
            .iter()
            .map(|c| {
                let c = c.lock();
                c.offset + c.size
            })
            .max()
            .unwrap_or(FIRST_CHUNK_OFFSET);
        let size = dev_len * factor;
        let mut free = SpaceList::new();
        free.add(offset, size)?;
        let chunk = Chunk {
            offset,
            size,
            flags,
            stripe_len,
            sub_stripes,
            stripes,
            sector_size: self.superblock.sector_size,
            used: 0,
            oldused: 0,
            free,
            pinned: SpaceList::new(),
            created: true,
            changed: true,
            changed_extents: Vec::new(),
            cache: None,
        };
        info!(offset, size, flags, %profile, "chunk.created");
        self.chunks.push(parking_lot::Mutex::new(chunk));
        Ok(self.chunks.len() - 1)
    }

    fn place_stripes(&self, profile: Profile, num_stripes: u16, len: u64) -> Option<Vec<(usize, u64)>> {
        let mut order: Vec<usize> = (0..self.devices.len()).collect();
        order.sort_by_key(|&i| Reverse(self.devices[i].free.largest()));

        if profile == Profile::Dup {
            'device: for &i in &order {
                let mut free = self.devices[i].free.clone();
                let mut picks = Vec::with_capacity(num_stripes as usize);
                for _ in 0..num_stripes {
                    let Some(at) = free.find_fit(len) else {
                        continue 'device;
                    };
                    free.remove(at, len).ok()?;
                    picks.push((i, at));
                }
                return Some(picks);
            }
            return None;
        }

        let picks: Vec<(usize, u64)> = order
            .iter()
            .filter_map(|&i| self.devices[i].free.find_fit(len).map(|at| (i, at)))
            .take(num_stripes as usize)
            .collect();
        (picks.len() == num_stripes as usize).then_some(picks)
    }
}

impl Transaction<'_> {
    /// Rewrites the device item of device `dev_idx` from memory.
    pub fn update_dev_item(&mut self, dev_idx: usize) -> Result<()> {
        let item = self.state.devices[dev_idx].item.clone();
        let key = Key::new(objectid::DEV_ITEMS, item_type::DEV_ITEM, item.dev_id);
        self.state
            .trees
            .delete_key(TreeId::CHUNK, &key, self.undo)
            .map_err(|err| {
                error!(dev_id = item.dev_id, "chunk.dev_item_missing");
                err
            })?;
        self.state
            .trees
            .insert_item(TreeId::CHUNK, key, item.encode(), self.undo)?;
        Ok(())
    }

    /// Inserts the records of a chunk created since the last commit: chunk
    /// item, bootstrap entry for system chunks, block-group item and one
    /// device extent per stripe.
    pub fn create_chunk_records(&mut self, idx: usize) -> Result<()> {
        let chunk = self.state.chunks[idx].lock().clone();
        let item = chunk.item();
        self.state.trees.insert_item(
            TreeId::CHUNK,
            Key::new(chunk.chunk_objectid(), item_type::CHUNK_ITEM, chunk.offset),
            item.encode(),
            self.undo,
        )?;
        if chunk.is_system() {
            self.state.superblock.add_bootstrap(chunk.offset, item)?;
        }
        let group = BlockGroupItem {
            used: chunk.used,
            chunk_objectid: chunk.chunk_objectid(),
            flags: chunk.flags,
        };
        self.state.trees.insert_item(
            TreeId::EXTENT,
            Key::new(chunk.offset, item_type::BLOCK_GROUP_ITEM, chunk.size),
            group.encode(),
            self.undo,
        )?;

        let length = chunk.device_stripe_len();
        let mut touched = Vec::new();
        for stripe in &chunk.stripes {
            let extent = DevExtent {
                chunk_tree: TreeId::CHUNK.0,
                chunk_objectid: chunk.chunk_objectid(),
                chunk_offset: chunk.offset,
                length,
            };
            self.state.trees.insert_item(
                TreeId::DEV,
                Key::new(stripe.dev_id, item_type::DEV_EXTENT, stripe.offset),
                extent.encode(),
                self.undo,
            )?;
            let dev_idx = self.state.device_index(stripe.dev_id)?;
            if !touched.contains(&dev_idx) {
                touched.push(dev_idx);
            }
        }
        for dev_idx in touched {
            self.update_dev_item(dev_idx)?;
        }
        self.state.chunks[idx].lock().created = false;
        info!(offset = chunk.offset, size = chunk.size, "chunk.recorded");
        Ok(())
    }

    /// Removes chunk `idx` entirely: its cache object, device extents and
    /// records. Device space returns to the devices' free lists.
    pub fn drop_chunk(&mut self, idx: usize) -> Result<()> {
        let chunk = self.state.chunks.remove(idx).into_inner();
        if !chunk.changed_extents.is_empty() {
            warn!(
                offset = chunk.offset,
                pending = chunk.changed_extents.len(),
                "chunk.drop.pending_extents_discarded"
            );
        }
        if let Some(cache) = chunk.cache {
            self.remove_cache_object(&chunk, cache)?;
        }

        let stripe_len = chunk.device_stripe_len();
        let mut touched = Vec::new();
        for stripe in &chunk.stripes {
            let length = if chunk.created {
                stripe_len
            } else {
                let key = Key::new(stripe.dev_id, item_type::DEV_EXTENT, stripe.offset);
                let data = self.state.trees.delete_key(TreeId::DEV, &key, self.undo)?;
                DevExtent::decode(&data)?.length
            };
            let dev_idx = self.state.device_index(stripe.dev_id)?;
            let device = &mut self.state.devices[dev_idx];
            device.item.bytes_used = device.item.bytes_used.saturating_sub(length);
            device.free.add(stripe.offset, length)?;
            if !touched.contains(&dev_idx) {
                touched.push(dev_idx);
            }
        }
        for dev_idx in touched {
            self.update_dev_item(dev_idx)?;
        }

        if !chunk.created {
            let chunk_key = Key::new(chunk.chunk_objectid(), item_type::CHUNK_ITEM, chunk.offset);
            if let Some(cursor) = self.state.trees.lookup(TreeId::CHUNK, &chunk_key)? {
                self.state.trees.delete_item(cursor, self.undo)?;
            } else {
                warn!(offset = chunk.offset, "chunk.drop.chunk_item_missing");
            }
            let group_key = Key::new(chunk.offset, item_type::BLOCK_GROUP_ITEM, chunk.size);
            if let Some(cursor) = self.state.trees.lookup(TreeId::EXTENT, &group_key)? {
                self.state.trees.delete_item(cursor, self.undo)?;
            } else {
                warn!(offset = chunk.offset, "chunk.drop.block_group_missing");
            }
        }
        if chunk.oldused > 0 {
            let persisted = chunk.oldused * chunk.usage_multiplier();
            self.state.superblock.bytes_used =
                self.state.superblock.bytes_used.saturating_sub(persisted);
        }
        if chunk.is_system() {
            self.state.superblock.remove_bootstrap(chunk.offset)?;
        }
        info!(offset = chunk.offset, size = chunk.size, "chunk.dropped");
        Ok(())
    }

    /// Reconciles changed chunks at the start of a commit: chunks whose usage
    /// (ignoring their own cache object) reached zero are dropped, newly
    /// created ones get their records.
    pub fn update_chunks(&mut self) -> Result<()> {
        let mut idx = 0;
        while idx < self.state.chunks.len() {
            let (changed, created, remaining) = {
                let chunk = self.state.chunks[idx].lock();
                let own_cache = chunk
                    .cache
                    .filter(|span| chunk.contains(span.start, span.len))
                    .map_or(0, |span: Span| span.len);
                (
                    chunk.changed,
                    chunk.created,
                    chunk.used.saturating_sub(own_cache),
                )
            };
            if changed && remaining == 0 {
                self.drop_chunk(idx)?;
                continue;
            }
            if changed && created {
                self.create_chunk_records(idx)?;
            }
            idx += 1;
        }
        Ok(())
    }

    /// Flushes every chunk's changed extents and brings block-group items and
    /// the global used-byte counter up to date with in-memory usage.
    pub fn update_chunk_usage(&mut self) -> Result<()> {
        let mut flushed = 0usize;
        for idx in 0..self.state.chunks.len() {
            let extents = std::mem::take(&mut self.state.chunks[idx].lock().changed_extents);
            flushed += extents.len();
            for extent in extents {
                self.flush_changed_extent(extent)?;
            }

            if self.state.chunks[idx].lock().created {
                self.create_chunk_records(idx)?;
            }

            let (offset, size, used, oldused, group, multiplier) = {
                let chunk = self.state.chunks[idx].lock();
                let group = BlockGroupItem {
                    used: chunk.used,
                    chunk_objectid: chunk.chunk_objectid(),
                    flags: chunk.flags,
                };
                (
                    chunk.offset,
                    chunk.size,
                    chunk.used,
                    chunk.oldused,
                    group,
                    chunk.usage_multiplier(),
                )
            };
            if used == oldused {
                continue;
            }
            let key = Key::new(offset, item_type::BLOCK_GROUP_ITEM, size);
            self.state
                .trees
                .delete_key(TreeId::EXTENT, &key, self.undo)
                .map_err(|err| {
                    error!(offset, "chunk.block_group_missing");
                    err
                })?;
            self.state
                .trees
                .insert_item(TreeId::EXTENT, key, group.encode(), self.undo)?;

            let delta = (used as i64 - oldused as i64) * multiplier as i64;
            let sb = &mut self.state.superblock;
            sb.bytes_used = sb.bytes_used.checked_add_signed(delta).ok_or_else(|| {
                ArborError::Inconsistent("global used-byte counter underflow".to_string())
            })?;
            self.state.chunks[idx].lock().oldused = used;
            debug!(offset, used, oldused, "chunk.usage_updated");
        }
        if flushed > 0 {
            self.apply_checksum_runs()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::engine::testutil;
    use crate::storage::chunk::block_group;
    use crate::storage::records::{ChunkItem, DevItem};
    use crate::storage::undo::UndoLog;

    const NODE: u32 = 4096;

    #[test]
    fn device_space_skips_superblock_windows() {
        let free = initial_device_space(128 << 20, 64 << 10).unwrap();
        assert_eq!(free.spans()[0], Span::new(1 << 20, (64 << 20) - (1 << 20)));
        assert_eq!(free.spans()[1].start, (64 << 20) + (64 << 10));
        assert!(initial_device_space(1 << 20, 64 << 10).unwrap().is_empty());
    }

    #[test]
    fn raid1_stripes_land_on_distinct_devices() {
        let mut state = testutil::state(2, 256 << 20, NODE);
        state.policy.metadata = Profile::Raid1;
        let flags = state.policy.tree_flags(TreeId::FS);
        let idx = state.alloc_chunk(flags).unwrap();
        let chunk = state.chunks[idx].lock();
        assert_eq!(chunk.stripes.len(), 2);
        assert_ne!(chunk.stripes[0].dev_id, chunk.stripes[1].dev_id);
        assert_eq!(chunk.size, 32 << 20);
        drop(chunk);

        let mut single = testutil::state(1, 256 << 20, NODE);
        single.policy.metadata = Profile::Raid1;
        assert!(matches!(
            single.alloc_chunk(flags),
            Err(ArborError::Invalid(_))
        ));
    }

    #[test]
    fn short_devices_get_smaller_chunks() {
        let mut state = testutil::state(1, 16 << 20, NODE);
        let idx = state
            .alloc_chunk(block_group::DATA | Profile::Single.flags())
            .unwrap();
        let size = state.chunks[idx].lock().size;
        assert!(size < 64 << 20 && size >= 64 << 10, "{size}");
    }

    #[test]
    fn created_chunk_gets_records_and_usage() {
        let mut state = testutil::state(1, 256 << 20, NODE);
        let flags = state.policy.tree_flags(TreeId::FS);
        let idx = state.alloc_chunk(flags).unwrap();
        let (offset, size, dev_len) = {
            let mut chunk = state.chunks[idx].lock();
            chunk.used = 3 * NODE as u64;
            (chunk.offset, chunk.size, chunk.device_stripe_len())
        };

        let mut undo = UndoLog::new();
        let runs = Mutex::new(Vec::new());
        let mut tx = Transaction::new(&mut state, &mut undo, &runs);
        tx.update_chunks().unwrap();
        tx.update_chunk_usage().unwrap();

        let trees = &tx.state.trees;
        let item = trees
            .lookup(TreeId::CHUNK, &Key::new(256, item_type::CHUNK_ITEM, offset))
            .unwrap()
            .unwrap();
        assert_eq!(ChunkItem::decode(trees.data_at(item)).unwrap().length, size);
        let group = trees
            .lookup(
                TreeId::EXTENT,
                &Key::new(offset, item_type::BLOCK_GROUP_ITEM, size),
            )
            .unwrap()
            .unwrap();
        assert_eq!(
            BlockGroupItem::decode(trees.data_at(group)).unwrap().used,
            3 * NODE as u64
        );
        let extents = trees
            .collect_range(
                TreeId::DEV,
                &Key::new(1, item_type::DEV_EXTENT, 0),
                &Key::new(1, item_type::DEV_EXTENT, u64::MAX),
            )
            .unwrap();
        assert_eq!(extents.len(), 2);
        let dev = trees
            .lookup(TreeId::CHUNK, &Key::new(1, item_type::DEV_ITEM, 1))
            .unwrap()
            .unwrap();
        assert_eq!(
            DevItem::decode(trees.data_at(dev)).unwrap().bytes_used,
            2 * dev_len
        );
        // DUP counts every byte twice.
        assert_eq!(tx.state.superblock.bytes_used, 6 * NODE as u64);
        assert!(!tx.state.chunks[idx].lock().created);
    }

    #[test]
    fn empty_chunk_is_dropped_and_device_space_returns() {
        let mut state = testutil::state(1, 256 << 20, NODE);
        let initial = state.devices[0].free.clone();
        let idx = state
            .alloc_chunk(block_group::DATA | Profile::Single.flags())
            .unwrap();
        let offset = state.chunks[idx].lock().offset;
        let mut undo = UndoLog::new();
        let runs = Mutex::new(Vec::new());
        let mut tx = Transaction::new(&mut state, &mut undo, &runs);
        tx.state.chunks[idx].lock().used = 4096;
        tx.update_chunks().unwrap();
        tx.state.chunks[idx].lock().used = 0;
        assert_ne!(tx.state.devices[0].free, initial);

        tx.update_chunks().unwrap();
        assert!(tx.state.chunks.is_empty());
        let device = &tx.state.devices[0];
        assert_eq!(device.free, initial);
        assert_eq!(device.item.bytes_used, 0);
        let trees = &tx.state.trees;
        assert!(trees
            .lookup(TreeId::CHUNK, &Key::new(256, item_type::CHUNK_ITEM, offset))
            .unwrap()
            .is_none());
        assert!(trees
            .collect_range(TreeId::DEV, &Key::new(0, 0, 0), &Key::MAX)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn system_chunk_tracks_bootstrap_array() {
        let mut state = testutil::state(1, 256 << 20, NODE);
        let flags = state.policy.tree_flags(TreeId::CHUNK);
        let idx = state.alloc_chunk(flags).unwrap();
        let offset = state.chunks[idx].lock().offset;
        state.chunks[idx].lock().used = NODE as u64;

        let mut undo = UndoLog::new();
        let runs = Mutex::new(Vec::new());
        let mut tx = Transaction::new(&mut state, &mut undo, &runs);
        tx.update_chunks().unwrap();
        let entries = tx.state.superblock.bootstrap_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, offset);

        tx.state.chunks[idx].lock().used = 0;
        tx.update_chunks().unwrap();
        assert!(tx.state.superblock.bootstrap_entries().unwrap().is_empty());
    }
}
