//! Transaction commit engine.
//!
//! A [`Transaction`] borrows the filesystem state exclusively for the whole
//! commit. Each component lives in its own module as an `impl Transaction`
//! block:
//!
//! - [`alloc`]: new addresses for dirty nodes and release of old ones
//! - [`maintain`]: split, merge, rebalance, height changes
//! - [`bookkeep`]: data extent reference reconciliation
//! - [`csum`]: changed-sector run merging into the checksum tree
//! - [`lifecycle`]: chunk creation, drop, and usage records
//! - [`cache`]: free-space cache objects
//! - [`flush`]: translation of dirty directory entries and files
//! - [`roots`]: root item refresh, publication, and root dropping
//! - [`writer`]: node serialization and batched dispatch
//! - [`publish`]: superblock publication
//! - [`commit`]: the orchestrator

use std::collections::BTreeSet;

use parking_lot::Mutex;

use crate::storage::arena::codec::NodeStamp;
use crate::storage::arena::NodeId;
use crate::storage::chunk::{block_group, Chunk, Device, Profile};
use crate::storage::store::TreeSet;
use crate::storage::superblock::Superblock;
use crate::storage::undo::UndoLog;
use crate::types::{ArborError, Result, TreeId};

pub mod alloc;
pub mod bookkeep;
pub mod cache;
pub mod commit;
pub mod csum;
pub mod flush;
pub mod lifecycle;
pub mod maintain;
pub mod publish;
pub mod roots;
pub mod writer;

pub use bookkeep::SharedDataRef;
pub use commit::CommitStats;
pub use flush::{DirEntryChange, FileChange, FileExtentChange};

/// Pending update of per-sector checksums.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangedSectorRun {
    /// Logical address of the first sector.
    pub address: u64,
    /// Number of sectors covered.
    pub sectors: u64,
    /// New checksum words, one per sector; `None` deletes the range.
    pub checksums: Option<Vec<u32>>,
}

impl ChangedSectorRun {
    /// Run recording freshly written sectors.
    pub fn written(address: u64, checksums: Vec<u32>) -> Self {
        Self {
            address,
            sectors: checksums.len() as u64,
            checksums: Some(checksums),
        }
    }

    /// Run removing the checksums of `sectors` sectors.
    pub fn deleted(address: u64, sectors: u64) -> Self {
        Self {
            address,
            sectors,
            checksums: None,
        }
    }

    /// True for deletion runs.
    pub fn is_deletion(&self) -> bool {
        self.checksums.is_none()
    }
}

/// Profiles and target sizes used when the allocator creates chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkPolicy {
    /// Profile of metadata chunks.
    pub metadata: Profile,
    /// Profile of data chunks.
    pub data: Profile,
    /// Profile of system chunks.
    pub system: Profile,
    /// Target logical size of metadata chunks.
    pub metadata_chunk_size: u64,
    /// Target logical size of data chunks.
    pub data_chunk_size: u64,
    /// Target logical size of system chunks.
    pub system_chunk_size: u64,
    /// Stripe length of new chunks.
    pub stripe_len: u64,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            metadata: Profile::Dup,
            data: Profile::Single,
            system: Profile::Dup,
            metadata_chunk_size: 32 << 20,
            data_chunk_size: 64 << 20,
            system_chunk_size: 4 << 20,
            stripe_len: 64 << 10,
        }
    }
}

impl ChunkPolicy {
    /// Block-group flags of chunks holding nodes of `tree`.
    pub fn tree_flags(&self, tree: TreeId) -> u64 {
        if tree == TreeId::CHUNK {
            block_group::SYSTEM | self.system.flags()
        } else {
            block_group::METADATA | self.metadata.flags()
        }
    }

    /// Block-group flags of data chunks.
    pub fn data_flags(&self) -> u64 {
        block_group::DATA | self.data.flags()
    }

    /// Target chunk size for chunks with `flags`.
    pub fn chunk_size(&self, flags: u64) -> u64 {
        if flags & block_group::SYSTEM != 0 {
            self.system_chunk_size
        } else if flags & block_group::DATA != 0 {
            self.data_chunk_size
        } else {
            self.metadata_chunk_size
        }
    }
}

/// Work queued by collaborators for the next commit.
#[derive(Debug, Default)]
pub struct PendingWork {
    /// Dirty directory entries.
    pub dir_entries: Vec<DirEntryChange>,
    /// Dirty files.
    pub files: Vec<FileChange>,
    /// Trees whose every block is released at the next commit.
    pub drop_roots: Vec<TreeId>,
    /// Shared data references awaiting conversion to full references.
    pub shared_data_refs: Vec<SharedDataRef>,
}

impl PendingWork {
    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.dir_entries.is_empty()
            && self.files.is_empty()
            && self.drop_roots.is_empty()
            && self.shared_data_refs.is_empty()
    }
}

/// Mutable state of one mounted filesystem.
///
/// Every field is guarded by the filesystem-wide lock; chunk free lists and
/// usage counters additionally sit behind per-chunk mutexes taken only for
/// the duration of a single chunk operation.
#[derive(Debug)]
pub struct FsState {
    /// In-memory copy of the superblock.
    pub superblock: Superblock,
    /// Generation of the open transaction.
    pub generation: u64,
    /// Every loaded tree.
    pub trees: TreeSet,
    /// Chunks, ordered by logical offset.
    pub chunks: Vec<Mutex<Chunk>>,
    /// Member devices.
    pub devices: Vec<Device>,
    /// Identity stamped into every node header.
    pub stamp: NodeStamp,
    /// Chunk creation policy.
    pub policy: ChunkPolicy,
    /// Queued collaborator work.
    pub pending: PendingWork,
    /// Extents allocated during the open transaction; freeing them skips
    /// pinning.
    pub fresh: BTreeSet<u64>,
    /// Whether free-space cache objects are maintained.
    pub space_cache: bool,
    /// Set by every mutation; cleared by a successful commit.
    pub need_write: bool,
    /// Mounted read-only.
    pub readonly: bool,
}

impl FsState {
    /// Empty state around `superblock` with no trees, chunks or devices.
    pub fn new(superblock: Superblock, generation: u64, policy: ChunkPolicy) -> Self {
        let stamp = NodeStamp {
            fsid: superblock.fsid,
            chunk_tree_uuid: [0; 16],
        };
        Self {
            trees: TreeSet::new(superblock.node_size),
            superblock,
            generation,
            chunks: Vec::new(),
            devices: Vec::new(),
            stamp,
            policy,
            pending: PendingWork::default(),
            fresh: BTreeSet::new(),
            space_cache: true,
            need_write: false,
            readonly: false,
        }
    }

    /// Node size in bytes.
    pub fn node_size(&self) -> u64 {
        self.superblock.node_size as u64
    }

    /// Sector size in bytes.
    pub fn sector_size(&self) -> u64 {
        self.superblock.sector_size as u64
    }

    /// Index of the chunk containing `address`.
    pub fn chunk_index(&self, address: u64) -> Option<usize> {
        self.chunks
            .iter()
            .position(|chunk| chunk.lock().contains(address, 1))
    }

    /// Like [`FsState::chunk_index`], treating a miss as an inconsistency.
    pub fn chunk_for(&self, address: u64) -> Result<usize> {
        self.chunk_index(address).ok_or_else(|| {
            tracing::error!(address, "chunk.lookup_failed");
            ArborError::Inconsistent(format!("no chunk holds address {address:#x}"))
        })
    }

    /// Index of the device with `dev_id`.
    pub fn device_index(&self, dev_id: u64) -> Result<usize> {
        self.devices
            .iter()
            .position(|d| d.id() == dev_id)
            .ok_or_else(|| ArborError::Inconsistent(format!("device {dev_id} not present")))
    }

    /// Marks `node` and every ancestor dirty.
    pub fn mark_path_dirty(&mut self, node: NodeId) {
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            let node = &mut self.trees.arena[id];
            node.dirty = true;
            cursor = node.parent;
        }
    }

    /// Marks every ancestor of `node` dirty, leaving `node` itself alone.
    pub fn mark_ancestors_dirty(&mut self, node: NodeId) {
        if let Some(parent) = self.trees.arena[node].parent {
            self.mark_path_dirty(parent);
        }
    }
}

/// One commit's exclusive view of the filesystem.
///
/// Every tree-item mutation made through the transaction is recorded in the
/// borrowed undo log.
pub struct Transaction<'a> {
    pub(crate) state: &'a mut FsState,
    pub(crate) undo: &'a mut UndoLog,
    pub(crate) csum_runs: &'a Mutex<Vec<ChangedSectorRun>>,
}

impl<'a> Transaction<'a> {
    /// Opens a transaction over `state`.
    pub fn new(
        state: &'a mut FsState,
        undo: &'a mut UndoLog,
        csum_runs: &'a Mutex<Vec<ChangedSectorRun>>,
    ) -> Self {
        Self {
            state,
            undo,
            csum_runs,
        }
    }

    /// Generation this transaction commits.
    pub fn generation(&self) -> u64 {
        self.state.generation
    }

    /// Read access to the filesystem state.
    pub fn state(&self) -> &FsState {
        self.state
    }

    /// Write access to the filesystem state.
    pub fn state_mut(&mut self) -> &mut FsState {
        self.state
    }

    fn capacity(&self) -> usize {
        self.state.trees.capacity()
    }
}
