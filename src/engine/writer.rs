//! Node serialization and batched dispatch.
//!
//! Dirty nodes are encoded at their new addresses, sorted, and merged into
//! runs of contiguous bytes inside one chunk. Runs are handed to the dispatch
//! context as one batch; writes that share a parity row with the previous run
//! are held back and issued one by one after the batch completes.

use tracing::{debug, trace, warn};

use super::Transaction;
use crate::primitives::io::DispatchContext;
use crate::storage::arena::codec::encode_node;
use crate::storage::arena::{NodeId, NODE_FLAG_MIXED_BACKREF, NODE_FLAG_WRITTEN};
use crate::storage::chunk::Chunk;
use crate::storage::stripe::{parity_row, submit_write, write_parity};
use crate::types::{ArborError, Result};

/// A contiguous logical write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRun {
    /// Logical start address.
    pub address: u64,
    /// Index of the chunk holding the run.
    pub chunk: usize,
    /// Bytes to write.
    pub data: Vec<u8>,
    /// Shares a parity row with the preceding run.
    pub overlap: bool,
}

impl WriteRun {
    fn end(&self) -> u64 {
        self.address + self.data.len() as u64
    }
}

/// Sorts `writes` by address and merges contiguous writes of one chunk.
pub fn coalesce(mut writes: Vec<WriteRun>) -> Vec<WriteRun> {
    writes.sort_by_key(|w| w.address);
    let mut runs: Vec<WriteRun> = Vec::with_capacity(writes.len());
    for write in writes {
        match runs.last_mut() {
            Some(last) if last.chunk == write.chunk && last.end() == write.address => {
                last.data.extend_from_slice(&write.data);
            }
            _ => runs.push(write),
        }
    }
    runs
}

/// Flags runs of parity chunks whose first parity row equals that of the
/// preceding run in the same chunk.
pub fn mark_overlaps(runs: &mut [WriteRun], chunks: &[&Chunk]) {
    let mut previous: Option<(usize, u64)> = None;
    for run in runs.iter_mut() {
        let chunk = chunks[run.chunk];
        if !chunk.profile().is_parity() {
            previous = None;
            continue;
        }
        let row = parity_row(chunk, run.address);
        run.overlap = previous == Some((run.chunk, row));
        previous = Some((run.chunk, parity_row(chunk, run.end() - 1)));
    }
}

impl Transaction<'_> {
    /// Points every parent at the new address and generation of its dirty
    /// children, lowest level first.
    fn refresh_parent_pointers(&mut self) -> Result<()> {
        let generation = self.generation();
        let Some(max) = self.state.trees.arena.max_dirty_level() else {
            return Ok(());
        };
        for level in 0..=max {
            for id in self.state.trees.arena.dirty_at_level(level) {
                let node = &self.state.trees.arena[id];
                let Some(parent) = node.parent else {
                    continue;
                };
                let address = node.new_address.ok_or_else(|| unaddressed(id))?;
                let key = node.first_key();
                let slot = self.state.trees.arena[parent]
                    .slot_of_child(id)
                    .ok_or_else(|| ArborError::Inconsistent("child missing from parent".into()))?;
                let item = &mut self.state.trees.arena[parent].items[slot];
                if let Some(key) = key {
                    item.key = key;
                }
                if let Some(ptr) = item.pointer_mut() {
                    ptr.address = address;
                    ptr.generation = generation;
                }
            }
        }
        Ok(())
    }

    /// Serializes every dirty node and cache blob and writes them out.
    ///
    /// Returns the number of nodes written. Devices are synced before
    /// returning.
    pub fn write_trees(&mut self) -> Result<usize> {
        self.refresh_parent_pointers()?;
        let generation = self.generation();
        let node_size = self.state.superblock.node_size;

        let mut writes = Vec::new();
        let dirty: Vec<NodeId> = self
            .state
            .trees
            .arena
            .iter()
            .filter(|(_, n)| n.dirty)
            .map(|(id, _)| id)
            .collect();
        for id in &dirty {
            let node = &mut self.state.trees.arena[*id];
            let address = node.new_address.ok_or_else(|| unaddressed(*id))?;
            node.flags |= NODE_FLAG_MIXED_BACKREF | NODE_FLAG_WRITTEN;
            node.generation = generation;
            let data = encode_node(node, address, generation, &self.state.stamp, node_size)?;
            writes.push(WriteRun {
                address,
                chunk: self.state.chunk_for(address)?,
                data,
                overlap: false,
            });
        }
        for (address, data) in self.state.cache_blobs()? {
            writes.push(WriteRun {
                address,
                chunk: self.state.chunk_for(address)?,
                data,
                overlap: false,
            });
        }

        let mut runs = coalesce(writes);
        {
            let guards: Vec<_> = self.state.chunks.iter().map(|c| c.lock()).collect();
            let chunks: Vec<&Chunk> = guards.iter().map(|g| &**g).collect();
            mark_overlaps(&mut runs, &chunks);
        }
        debug!(
            nodes = dirty.len(),
            runs = runs.len(),
            held_back = runs.iter().filter(|r| r.overlap).count(),
            "writer.batch"
        );

        let mut ctx = DispatchContext::new();
        let mut failed = None;
        for run in runs.iter().filter(|r| !r.overlap) {
            if let Err(err) = self.issue(&mut ctx, run) {
                failed = Some(err);
                break;
            }
        }
        let waited = ctx.wait();
        if let Some(err) = failed {
            warn!(error = %err, "writer.submit_failed");
            return Err(err);
        }
        waited?;

        for run in runs.iter().filter(|r| r.overlap) {
            let mut ctx = DispatchContext::new();
            self.issue(&mut ctx, run)?;
            ctx.wait()?;
            trace!(address = run.address, "writer.overlap_written");
        }

        for device in &self.state.devices {
            device.io.sync_all()?;
        }
        Ok(dirty.len())
    }

    fn issue(&self, ctx: &mut DispatchContext, run: &WriteRun) -> Result<()> {
        let chunk = self.state.chunks[run.chunk].lock();
        if chunk.profile().is_parity() {
            write_parity(&chunk, &self.state.devices, run.address, &run.data)
        } else {
            submit_write(&chunk, &self.state.devices, ctx, run.address, &run.data)
        }
    }
}

fn unaddressed(id: NodeId) -> ArborError {
    ArborError::Inconsistent(format!("dirty node {id:?} has no address"))
}
