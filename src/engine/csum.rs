//! Merging of changed-sector runs into the checksum tree.
//!
//! Checksum items are keyed `(CSUM, EXTENT_CSUM, first_sector_address)` and
//! hold one little-endian `u32` per sector. After every merge a contiguous
//! range of present sectors is stored as items of the largest size a leaf
//! admits, laid out from the start of the range, so the tree's shape depends
//! only on which sectors carry which checksum and not on the order in which
//! runs were applied.

use tracing::{debug, trace};

use super::{ChangedSectorRun, Transaction};
use crate::primitives::bytes::LeWriter;
use crate::storage::arena::LEAF_ITEM_LEN;
use crate::storage::store::Cursor;
use crate::types::{item_type, objectid, read_u32, ArborError, Key, Result, TreeId};

fn csum_key(address: u64) -> Key {
    Key::new(objectid::CSUM, item_type::EXTENT_CSUM, address)
}

/// Existing checksum item pulled out of the tree for merging.
struct Stored {
    key: Key,
    start: u64,
    words: Vec<u32>,
}

/// Sector-indexed checksum words of one merge region.
struct Region {
    start: u64,
    sector: u64,
    words: Vec<Option<u32>>,
}

impl Region {
    fn new(start: u64, end: u64, sector: u64) -> Self {
        Self {
            start,
            sector,
            words: vec![None; ((end - start) / sector) as usize],
        }
    }

    fn slot(&self, address: u64) -> usize {
        ((address - self.start) / self.sector) as usize
    }

    /// Present runs as `(start_address, words)`, split at `max_words`.
    fn items(&self, max_words: usize) -> Vec<(u64, Vec<u32>)> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < self.words.len() {
            if self.words[i].is_none() {
                i += 1;
                continue;
            }
            let mut j = i;
            while j < self.words.len() && self.words[j].is_some() {
                j += 1;
            }
            for from in (i..j).step_by(max_words) {
                let to = (from + max_words).min(j);
                let words = self.words[from..to].iter().flatten().copied().collect();
                out.push((self.start + from as u64 * self.sector, words));
            }
            i = j;
        }
        out
    }
}

impl Transaction<'_> {
    /// Drains the changed-sector list and merges every run.
    pub fn apply_checksum_runs(&mut self) -> Result<()> {
        let runs = std::mem::take(&mut *self.csum_runs.lock());
        if runs.is_empty() {
            return Ok(());
        }
        for run in &runs {
            self.merge_run(run)?;
        }
        debug!(runs = runs.len(), "csum.runs_applied");
        Ok(())
    }

    /// Merges one run with every item it overlaps or touches.
    pub fn merge_run(&mut self, run: &ChangedSectorRun) -> Result<()> {
        if run.sectors == 0 {
            return Ok(());
        }
        if let Some(words) = &run.checksums {
            if words.len() as u64 != run.sectors {
                return Err(ArborError::Invalid("checksum run length mismatch"));
            }
        }
        let sector = self.state.sector_size();
        let lo = run.address;
        let hi = lo + run.sectors * sector;

        let stored = self.collect_touching(lo, hi, sector)?;
        let region_lo = stored.iter().map(|s| s.start).fold(lo, u64::min);
        let region_hi = stored
            .iter()
            .map(|s| s.start + s.words.len() as u64 * sector)
            .fold(hi, u64::max);

        let mut region = Region::new(region_lo, region_hi, sector);
        for item in &stored {
            let at = region.slot(item.start);
            for (i, word) in item.words.iter().enumerate() {
                region.words[at + i] = Some(*word);
            }
        }
        let at = region.slot(lo);
        for i in 0..run.sectors as usize {
            region.words[at + i] = run.checksums.as_ref().map(|w| w[i]);
        }

        for item in &stored {
            self.state
                .trees
                .delete_key(TreeId::CSUM, &item.key, self.undo)?;
        }
        let max_words = (self.capacity() - LEAF_ITEM_LEN) / 4;
        for (start, words) in region.items(max_words) {
            let mut w = LeWriter::with_capacity(words.len() * 4);
            for word in &words {
                w.u32(*word);
            }
            self.state
                .trees
                .insert_item(TreeId::CSUM, csum_key(start), w.finish(), self.undo)?;
        }
        trace!(
            address = lo,
            sectors = run.sectors,
            deletion = run.is_deletion(),
            merged = stored.len(),
            "csum.run_merged"
        );
        Ok(())
    }

    /// Items overlapping or adjacent to `[lo, hi)`, extended transitively
    /// through runs of contiguous items on both sides.
    fn collect_touching(&self, lo: u64, hi: u64, sector: u64) -> Result<Vec<Stored>> {
        let trees = &self.state.trees;
        let mut stored = Vec::new();
        let mut region_lo = lo;
        let mut region_hi = hi;

        let mut cursor = trees.search(TreeId::CSUM, &csum_key(lo))?;
        while let Some(c) = cursor {
            let item = self.decode_item(c, sector)?;
            if item.start > lo {
                break;
            }
            let end = item.start + item.words.len() as u64 * sector;
            if end < region_lo {
                break;
            }
            region_lo = region_lo.min(item.start);
            region_hi = region_hi.max(end);
            stored.push(item);
            cursor = trees.prev(c);
        }

        let mut cursor = trees.search_forward(TreeId::CSUM, &csum_key(lo + 1))?;
        while let Some(c) = cursor {
            let item = self.decode_item(c, sector)?;
            if item.start > region_hi {
                break;
            }
            region_hi = region_hi.max(item.start + item.words.len() as u64 * sector);
            stored.push(item);
            cursor = trees.next(c);
        }
        Ok(stored)
    }

    fn decode_item(&self, cursor: Cursor, sector: u64) -> Result<Stored> {
        let key = self.state.trees.key_at(cursor);
        if key.objectid != objectid::CSUM || key.item_type != item_type::EXTENT_CSUM {
            return Err(ArborError::Corruption("foreign item in checksum tree"));
        }
        if key.offset % sector != 0 {
            return Err(ArborError::Corruption("unaligned checksum item"));
        }
        let data = self.state.trees.data_at(cursor);
        if data.len() % 4 != 0 {
            return Err(ArborError::Corruption("checksum item length not a word multiple"));
        }
        let words = data.chunks_exact(4).map(|w| read_u32(w, 0)).collect();
        Ok(Stored {
            key,
            start: key.offset,
            words,
        })
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use proptest::prelude::*;

    use super::*;
    use crate::engine::{testutil, FsState};
    use crate::storage::undo::UndoLog;

    const SECTOR: u64 = 4096;
    const BASE: u64 = 1 << 30;

    fn written(first: u64, words: &[u32]) -> ChangedSectorRun {
        ChangedSectorRun::written(BASE + first * SECTOR, words.to_vec())
    }

    fn apply(state: &mut FsState, runs: Vec<ChangedSectorRun>) {
        let mut undo = UndoLog::new();
        let pending = Mutex::new(runs);
        let mut tx = Transaction::new(state, &mut undo, &pending);
        tx.apply_checksum_runs().unwrap();
    }

    fn items(state: &FsState) -> Vec<(u64, Vec<u32>)> {
        state
            .trees
            .collect_range(TreeId::CSUM, &Key::new(0, 0, 0), &Key::MAX)
            .unwrap()
            .into_iter()
            .map(|(key, data)| {
                let words = data.chunks_exact(4).map(|w| read_u32(w, 0)).collect();
                ((key.offset - BASE) / SECTOR, words)
            })
            .collect()
    }

    #[test]
    fn adjacent_runs_merge() {
        let mut state = testutil::state(1, 64 << 20, 4096);
        apply(&mut state, vec![written(0, &[1, 2]), written(2, &[3])]);
        assert_eq!(items(&state), vec![(0, vec![1, 2, 3])]);
    }

    #[test]
    fn deletion_splits_an_item() {
        let mut state = testutil::state(1, 64 << 20, 4096);
        apply(&mut state, vec![written(0, &[1, 2, 3, 4])]);
        apply(
            &mut state,
            vec![ChangedSectorRun::deleted(BASE + SECTOR, 2)],
        );
        assert_eq!(items(&state), vec![(0, vec![1]), (3, vec![4])]);
    }

    #[test]
    fn overwrite_replaces_words() {
        let mut state = testutil::state(1, 64 << 20, 4096);
        apply(&mut state, vec![written(0, &[1, 2, 3])]);
        apply(&mut state, vec![written(1, &[9])]);
        assert_eq!(items(&state), vec![(0, vec![1, 9, 3])]);
    }

    #[test]
    fn long_runs_split_at_leaf_capacity() {
        let mut state = testutil::state(1, 64 << 20, 4096);
        let max = (state.trees.capacity() - LEAF_ITEM_LEN) / 4;
        let words: Vec<u32> = (0..(max + 10) as u32).collect();
        apply(&mut state, vec![written(0, &words)]);
        let got = items(&state);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].1.len(), max);
        assert_eq!(got[1].0, max as u64);
        assert_eq!(got[1].1.len(), 10);
    }

    #[test]
    fn ragged_item_is_corruption() {
        let mut state = testutil::state(1, 64 << 20, 4096);
        let mut undo = UndoLog::new();
        state
            .trees
            .insert_item(TreeId::CSUM, csum_key(BASE), vec![0; 6], &mut undo)
            .unwrap();
        let pending = Mutex::new(vec![written(0, &[1])]);
        let mut tx = Transaction::new(&mut state, &mut undo, &pending);
        assert!(matches!(
            tx.apply_checksum_runs(),
            Err(ArborError::Corruption(_))
        ));
    }

    fn arb_run() -> impl Strategy<Value = ChangedSectorRun> {
        (0u64..24, 1u64..6, any::<bool>()).prop_map(|(first, len, delete)| {
            if delete {
                ChangedSectorRun::deleted(BASE + first * SECTOR, len)
            } else {
                let words = (0..len as u32).map(|i| first as u32 * 100 + i).collect();
                ChangedSectorRun::written(BASE + first * SECTOR, words)
            }
        })
    }

    proptest! {
        #[test]
        fn disjoint_runs_commute(runs in proptest::collection::vec(arb_run(), 1..8)) {
            // Keep only runs that do not overlap an earlier one.
            let mut taken = Vec::new();
            let mut kept = Vec::new();
            for run in runs {
                let lo = run.address;
                let hi = lo + run.sectors * SECTOR;
                if taken.iter().all(|&(a, b)| hi <= a || lo >= b) {
                    taken.push((lo, hi));
                    kept.push(run);
                }
            }
            let mut forward = testutil::state(1, 64 << 20, 4096);
            apply(&mut forward, kept.clone());
            let mut backward = testutil::state(1, 64 << 20, 4096);
            kept.reverse();
            apply(&mut backward, kept);
            prop_assert_eq!(items(&forward), items(&backward));
        }
    }
}
