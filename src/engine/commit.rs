//! The commit orchestrator.
//!
//! A commit turns the in-memory dirty state into a new on-disk generation:
//! queued work is translated into tree items, the allocator and the trees are
//! iterated to a fixed point, every dirty node is written, and the
//! superblock naming the new roots is published last.

use std::time::Instant;

use tracing::{debug, info, trace};

use super::Transaction;
use crate::types::{ArborError, Result};

/// Upper bound on fixed-point iterations before the commit gives up.
const MAX_ITERATIONS: usize = 64;

/// Outcome of a successful commit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommitStats {
    /// Generation that was committed.
    pub generation: u64,
    /// Passes of the fixed-point loop.
    pub iterations: usize,
    /// Nodes written.
    pub nodes_written: usize,
}

impl Transaction<'_> {
    /// Commits the open transaction.
    ///
    /// On success the superblock names the new generation on every device,
    /// pinned extents are free again, and the state's generation has moved
    /// on. On failure nothing on disk names the partially written blocks;
    /// the caller discards the in-memory state or replays its undo log.
    pub fn commit(&mut self) -> Result<CommitStats> {
        if self.state.readonly {
            return Err(ArborError::ReadOnly);
        }
        let started = Instant::now();
        let generation = self.generation();
        info!(generation, "commit.start");

        self.flush_pending()?;
        self.convert_shared_data_refs()?;
        self.apply_checksum_runs()?;
        self.drop_roots()?;
        self.update_chunks()?;
        self.force_root_dirty()?;
        self.refresh_root_items()?;

        let iterations = self.run_to_fixed_point()?;

        self.update_root_root()?;
        let nodes_written = self.write_trees()?;

        self.write_superblocks()?;

        let emptied = self.state.clean_space_cache()?;
        self.finish_nodes();
        self.state.generation = generation + 1;
        self.state.need_write = emptied;
        if emptied {
            debug!(generation, "commit.empty_chunks_pending_drop");
        }

        info!(
            generation,
            iterations,
            nodes_written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "commit.done"
        );
        Ok(CommitStats {
            generation,
            iterations,
            nodes_written,
        })
    }

    /// Repeats structural maintenance, allocation and usage recording until
    /// a pass leaves nothing to do.
    fn run_to_fixed_point(&mut self) -> Result<usize> {
        for iteration in 1..=MAX_ITERATIONS {
            self.add_parents();
            self.do_splits()?;
            let allocated = self.allocate_tree_extents()?;
            self.update_chunk_usage()?;
            let cache_changed = self.allocate_cache()?;
            trace!(iteration, allocated, cache_changed, "commit.fixed_point.iteration");
            if !cache_changed && self.trees_consistent() {
                debug!(iterations = iteration, "commit.fixed_point.reached");
                return Ok(iteration);
            }
        }
        Err(ArborError::Inconsistent(format!(
            "commit did not converge in {MAX_ITERATIONS} iterations"
        )))
    }

    /// True when every dirty node is addressed, within capacity, non-empty
    /// unless it is a root, and has a dirty parent.
    pub fn trees_consistent(&self) -> bool {
        let capacity = self.capacity();
        let arena = &self.state.trees.arena;
        arena.iter().filter(|(_, n)| n.dirty).all(|(_, node)| {
            let parent_ok = node
                .parent
                .map_or(true, |p| arena.get(p).is_some_and(|p| p.dirty));
            parent_ok
                && node.new_address.is_some()
                && node.size() <= capacity
                && !(node.items.is_empty() && node.parent.is_some())
        })
    }

    /// Adopts written addresses as the nodes' current ones and clears the
    /// dirty state.
    fn finish_nodes(&mut self) {
        let dirty: Vec<_> = self
            .state
            .trees
            .arena
            .iter()
            .filter(|(_, n)| n.dirty)
            .map(|(id, _)| id)
            .collect();
        for id in dirty {
            let node = &mut self.state.trees.arena[id];
            if let Some(address) = node.new_address.take() {
                node.address = Some(address);
            }
            node.dirty = false;
            for item in &mut node.items {
                item.inserted = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::engine::testutil::{commit, committable};
    use crate::engine::FsState;
    use crate::storage::arena::codec::decode_node;
    use crate::storage::stripe::read_logical;
    use crate::storage::superblock::load_superblock;
    use crate::storage::undo::UndoLog;
    use crate::types::{item_type, Key, TreeId};

    fn read_node(state: &FsState, address: u64) -> crate::storage::arena::codec::DecodedNode {
        let idx = state.chunk_for(address).unwrap();
        let chunk = state.chunks[idx].lock().clone();
        let mut buf = vec![0u8; state.node_size() as usize];
        read_logical(&chunk, &state.devices, address, &mut buf).unwrap();
        decode_node(&buf).unwrap()
    }

    #[test]
    fn first_commit_publishes_every_tree() {
        let mut state = committable(1);
        let stats = commit(&mut state).unwrap();
        assert_eq!(stats.generation, 1);
        assert!(stats.nodes_written >= 6);
        assert_eq!(state.generation, 2);
        assert!(state.trees.arena.iter().all(|(_, n)| !n.dirty && n.new_address.is_none()));

        let sb = load_superblock(state.devices[0].io.as_ref()).unwrap();
        assert_eq!(sb.generation, 1);
        assert_eq!(sb.cache_generation, 1);
        let root = read_node(&state, sb.root);
        assert_eq!(root.header.owner, TreeId::ROOT);
        assert_eq!(root.header.generation, 1);
        assert!(!sb.bootstrap_entries().unwrap().is_empty());
    }

    #[test]
    fn fixed_point_leaves_nothing_to_allocate() {
        let mut state = committable(1);
        let mut undo = UndoLog::new();
        let runs = Mutex::new(Vec::new());
        let mut tx = Transaction::new(&mut state, &mut undo, &runs);
        tx.force_root_dirty().unwrap();
        tx.refresh_root_items().unwrap();
        tx.run_to_fixed_point().unwrap();
        assert!(tx.trees_consistent());

        tx.add_parents();
        tx.do_splits().unwrap();
        assert_eq!(tx.allocate_tree_extents().unwrap(), 0);
        assert!(!tx.allocate_cache().unwrap());
    }

    #[test]
    fn commit_without_data_space_still_settles() {
        let mut state = committable(1);
        assert!(state.space_cache);
        assert!(state.find_data_space(4096).is_none());
        let stats = commit(&mut state).unwrap();
        assert!(stats.iterations <= 3, "took {} passes", stats.iterations);
        assert!(state.chunks.iter().all(|c| c.lock().cache.is_none()));

        let stats = commit(&mut state).unwrap();
        assert_eq!(stats.generation, 2);
        assert!(stats.iterations <= 3);
    }

    #[test]
    fn large_insert_batch_splits_and_commits() {
        let mut state = committable(1);
        let mut undo = UndoLog::new();
        for i in 0..2_000u64 {
            state
                .trees
                .insert_item(
                    TreeId::FS,
                    Key::new(256 + i, item_type::INODE_ITEM, 0),
                    vec![i as u8; 160],
                    &mut undo,
                )
                .unwrap();
        }
        commit(&mut state).unwrap();

        let capacity = state.trees.capacity();
        let fs_root = state.trees.root(TreeId::FS).unwrap();
        assert!(state.trees.arena[fs_root].level >= 1);
        for id in state.trees.arena.subtree(fs_root) {
            let node = &state.trees.arena[id];
            assert!(node.size() <= capacity);
            let on_disk = read_node(&state, node.address.unwrap());
            assert_eq!(on_disk.items.len(), node.items.len());
        }
        assert_eq!(state.trees.item_count(TreeId::FS).unwrap(), 2_000);
    }

    #[test]
    fn consecutive_commits_advance_generation() {
        let mut state = committable(2);
        commit(&mut state).unwrap();
        let first_root = state.superblock.root;
        let stats = commit(&mut state).unwrap();
        assert_eq!(stats.generation, 2);
        assert_ne!(state.superblock.root, first_root);
        for device in &state.devices {
            assert_eq!(load_superblock(device.io.as_ref()).unwrap().generation, 2);
        }
    }

    #[test]
    fn readonly_state_refuses_to_commit() {
        let mut state = committable(1);
        state.readonly = true;
        assert!(matches!(commit(&mut state), Err(ArborError::ReadOnly)));
    }
}
