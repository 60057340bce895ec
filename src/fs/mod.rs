//! Mounted filesystem instance.
//!
//! [`Filesystem`] owns the in-memory state behind one `RwLock` and exposes a
//! small file API on top of the commit engine. Mutations queue dirty objects
//! on the state's pending work; [`Filesystem::flush`] commits them.

mod flusher;
mod format;
mod mount;
mod options;

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::engine::{
    ChangedSectorRun, CommitStats, DirEntryChange, FileChange, FileExtentChange, FsState,
    Transaction,
};
use crate::primitives::io::DispatchContext;
use crate::storage::records::{
    DirItem, FileExtentItem, InodeItem, InodeRef, FILE_EXTENT_INLINE, FILE_EXTENT_REGULAR,
};
use crate::storage::stripe::{read_logical, submit_write, write_parity};
use crate::storage::superblock::Superblock;
use crate::storage::undo::UndoLog;
use crate::types::checksum::{name_hash, sector_crc32};
use crate::types::{item_type, objectid, ArborError, Key, Result, TreeId};

use flusher::Flusher;

pub use format::format;
pub use options::{ConfigError, ConfigFile, FormatOptions, MountOptions};

/// Longest accepted entry name.
pub const MAX_NAME_LEN: usize = 255;

/// Kind of inode created by [`Filesystem::create`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

impl FileKind {
    /// Directory-entry file type.
    pub fn file_type(self) -> u8 {
        match self {
            FileKind::File => 1,
            FileKind::Directory => 2,
        }
    }

    /// Mode bits of a new inode.
    pub fn mode(self) -> u32 {
        match self {
            FileKind::File => 0o100_644,
            FileKind::Directory => 0o040_755,
        }
    }

    fn of_mode(mode: u32) -> Self {
        if mode & 0o170_000 == 0o040_000 {
            FileKind::Directory
        } else {
            FileKind::File
        }
    }
}

/// One entry of a directory listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    /// Directory index.
    pub index: u64,
    /// Entry name.
    pub name: Vec<u8>,
    /// Target inode.
    pub inode: u64,
    /// File type of the target.
    pub file_type: u8,
}

#[derive(Debug, Default)]
struct Counters {
    next_inode: BTreeMap<TreeId, u64>,
    next_index: BTreeMap<(TreeId, u64), u64>,
}

/// A mounted filesystem.
pub struct Filesystem {
    state: RwLock<FsState>,
    csum_runs: Mutex<Vec<ChangedSectorRun>>,
    undo: Mutex<UndoLog>,
    counters: Mutex<Counters>,
    options: MountOptions,
    flusher: Mutex<Option<Flusher>>,
}

impl Filesystem {
    fn from_state(state: FsState, options: MountOptions) -> Arc<Self> {
        let fs = Arc::new(Self {
            state: RwLock::new(state),
            csum_runs: Mutex::new(Vec::new()),
            undo: Mutex::new(UndoLog::new()),
            counters: Mutex::new(Counters::default()),
            options,
            flusher: Mutex::new(None),
        });
        if fs.options.background_flush && !fs.options.read_only {
            match Flusher::spawn(Arc::downgrade(&fs), fs.options.flush_interval()) {
                Ok(flusher) => *fs.flusher.lock() = Some(flusher),
                Err(err) => warn!(error = %err, "fs.flusher_spawn_failed"),
            }
        }
        fs
    }

    /// Options the filesystem was mounted with.
    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    /// Copy of the in-memory superblock.
    pub fn superblock(&self) -> Superblock {
        self.state.read().superblock.clone()
    }

    /// Runs `f` with shared access to the filesystem state.
    pub fn with_state<R>(&self, f: impl FnOnce(&FsState) -> R) -> R {
        f(&self.state.read())
    }

    /// Commits pending work when there is any and the filesystem is
    /// writable. The undo log is cleared either way.
    pub fn flush(&self) -> Result<Option<CommitStats>> {
        let mut state = self.state.write();
        let mut undo = self.undo.lock();
        let dirty = state.need_write || !self.csum_runs.lock().is_empty();
        let result = if state.readonly || !dirty {
            Ok(None)
        } else {
            Transaction::new(&mut state, &mut undo, &self.csum_runs)
                .commit()
                .map(Some)
        };
        undo.clear();
        result
    }

    /// Stops the background flusher and commits outstanding work.
    pub fn shutdown(&self) -> Result<()> {
        if let Some(mut flusher) = self.flusher.lock().take() {
            flusher.stop();
        }
        self.flush()?;
        info!("fs.shutdown");
        Ok(())
    }

    fn writable(&self, state: &FsState) -> Result<()> {
        if state.readonly {
            return Err(ArborError::ReadOnly);
        }
        Ok(())
    }

    /// Translates queued work into tree items so lookups observe it.
    fn translate_pending(&self, state: &mut FsState) -> Result<()> {
        if state.pending.dir_entries.is_empty() && state.pending.files.is_empty() {
            return Ok(());
        }
        let mut undo = self.undo.lock();
        Transaction::new(state, &mut undo, &self.csum_runs).flush_pending()
    }

    fn inode_item(state: &FsState, tree: TreeId, inode: u64) -> Result<InodeItem> {
        let cursor = state
            .trees
            .lookup(tree, &Key::new(inode, item_type::INODE_ITEM, 0))?
            .ok_or(ArborError::NotFound)?;
        InodeItem::decode(state.trees.data_at(cursor))
    }

    fn next_inode(&self, state: &FsState, tree: TreeId) -> Result<u64> {
        let mut counters = self.counters.lock();
        let next = match counters.next_inode.get(&tree) {
            Some(next) => *next,
            None => {
                let last = state
                    .trees
                    .search(tree, &Key::MAX)?
                    .map(|c| state.trees.key_at(c).objectid)
                    .unwrap_or(0);
                last.saturating_add(1).max(objectid::FIRST_FREE)
            }
        };
        counters.next_inode.insert(tree, next + 1);
        Ok(next)
    }

    fn next_index(&self, state: &FsState, tree: TreeId, dir: u64) -> Result<u64> {
        let mut counters = self.counters.lock();
        let next = match counters.next_index.get(&(tree, dir)) {
            Some(next) => *next,
            None => {
                let seek = Key::new(dir, item_type::DIR_INDEX, u64::MAX);
                state
                    .trees
                    .search(tree, &seek)?
                    .map(|c| state.trees.key_at(c))
                    .filter(|k| k.objectid == dir && k.item_type == item_type::DIR_INDEX)
                    .map_or(2, |k| k.offset + 1)
            }
        };
        counters.next_index.insert((tree, dir), next + 1);
        Ok(next)
    }

    fn dir_item(state: &FsState, tree: TreeId, dir: u64, name: &[u8]) -> Result<Option<DirItem>> {
        let key = Key::new(dir, item_type::DIR_ITEM, name_hash(name));
        match state.trees.lookup(tree, &key)? {
            Some(cursor) => {
                let item = DirItem::decode(state.trees.data_at(cursor))?;
                Ok((item.name == name).then_some(item))
            }
            None => Ok(None),
        }
    }

    /// Creates `name` in directory `dir` of `tree` and returns its inode
    /// number.
    pub fn create(&self, tree: TreeId, dir: u64, name: &[u8], kind: FileKind) -> Result<u64> {
        if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains(&b'/') {
            return Err(ArborError::Invalid("bad entry name"));
        }
        let mut state = self.state.write();
        self.writable(&state)?;
        self.translate_pending(&mut state)?;
        let parent = Self::inode_item(&state, tree, dir)?;
        if FileKind::of_mode(parent.mode) != FileKind::Directory {
            return Err(ArborError::Invalid("parent is not a directory"));
        }
        let hash_key = Key::new(dir, item_type::DIR_ITEM, name_hash(name));
        if state.trees.lookup(tree, &hash_key)?.is_some() {
            return Err(ArborError::Invalid("entry already exists"));
        }

        let inode = self.next_inode(&state, tree)?;
        let index = self.next_index(&state, tree, dir)?;
        let generation = state.generation;
        state.pending.files.push(FileChange {
            tree,
            inode,
            deleted: false,
            item: InodeItem {
                generation,
                transid: generation,
                nlink: 1,
                mode: kind.mode(),
                ..InodeItem::default()
            },
            extents: Vec::new(),
        });
        state.pending.dir_entries.push(DirEntryChange::Add {
            tree,
            dir,
            name: name.to_vec(),
            location: Key::new(inode, item_type::INODE_ITEM, 0),
            file_type: kind.file_type(),
            index,
        });
        state.need_write = true;
        debug!(tree = tree.0, dir, inode, index, "fs.created");
        Ok(inode)
    }

    /// Inode of entry `name` in directory `dir`, if present.
    pub fn lookup(&self, tree: TreeId, dir: u64, name: &[u8]) -> Result<Option<u64>> {
        let mut state = self.state.write();
        self.translate_pending(&mut state)?;
        Ok(Self::dir_item(&state, tree, dir, name)?.map(|item| item.location.objectid))
    }

    /// Entries of directory `dir` in index order.
    pub fn list_dir(&self, tree: TreeId, dir: u64) -> Result<Vec<DirEntry>> {
        let mut state = self.state.write();
        self.translate_pending(&mut state)?;
        let from = Key::new(dir, item_type::DIR_INDEX, 0);
        let to = Key::new(dir, item_type::DIR_INDEX, u64::MAX);
        state
            .trees
            .collect_range(tree, &from, &to)?
            .into_iter()
            .map(|(key, data)| {
                let item = DirItem::decode(&data)?;
                Ok(DirEntry {
                    index: key.offset,
                    name: item.name,
                    inode: item.location.objectid,
                    file_type: item.file_type,
                })
            })
            .collect()
    }

    /// Inode record of `inode`.
    pub fn stat(&self, tree: TreeId, inode: u64) -> Result<InodeItem> {
        let mut state = self.state.write();
        self.translate_pending(&mut state)?;
        Self::inode_item(&state, tree, inode)
    }

    /// Writes `data` at sector-aligned `offset` of file `inode` into a new
    /// data extent, replacing any mapping that starts at `offset`.
    pub fn write(&self, tree: TreeId, inode: u64, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        self.writable(&state)?;
        let sector = state.sector_size();
        if data.is_empty() || offset % sector != 0 {
            return Err(ArborError::Invalid("writes must be non-empty and sector aligned"));
        }
        self.translate_pending(&mut state)?;
        let mut item = Self::inode_item(&state, tree, inode)?;
        if FileKind::of_mode(item.mode) != FileKind::File {
            return Err(ArborError::Invalid("not a regular file"));
        }

        let len = (data.len() as u64).div_ceil(sector) * sector;
        let mut replaced = 0;
        let from = Key::new(inode, item_type::EXTENT_DATA, 0);
        let to = Key::new(inode, item_type::EXTENT_DATA, u64::MAX);
        for (key, raw) in state.trees.collect_range(tree, &from, &to)? {
            let existing = FileExtentItem::decode(&raw)?;
            let end = key.offset + existing.num_bytes;
            if key.offset == offset {
                replaced = existing.num_bytes;
            } else if key.offset < offset + len && offset < end {
                return Err(ArborError::Unsupported("writes overlapping an extent boundary"));
            }
        }

        let mut buf = data.to_vec();
        buf.resize(len as usize, 0);
        let address = state.alloc_data_extent(len)?;
        if let Err(err) = Self::write_extent(&state, address, &buf) {
            state.release_extent(address, len)?;
            return Err(err);
        }
        let checksums = buf.chunks(sector as usize).map(sector_crc32).collect();
        self.csum_runs
            .lock()
            .push(ChangedSectorRun::written(address, checksums));

        let generation = state.generation;
        let extent = FileExtentItem {
            generation,
            ram_bytes: len,
            extent_type: FILE_EXTENT_REGULAR,
            disk_bytenr: address,
            disk_num_bytes: len,
            offset: 0,
            num_bytes: len,
            inline_data: Vec::new(),
        };
        item.size = item.size.max(offset + data.len() as u64);
        item.nbytes = (item.nbytes + len).saturating_sub(replaced);
        item.sequence += 1;
        state.pending.files.push(FileChange {
            tree,
            inode,
            deleted: false,
            item,
            extents: vec![FileExtentChange::Insert {
                offset,
                item: extent,
            }],
        });
        state.need_write = true;
        debug!(tree = tree.0, inode, offset, address, len, "fs.written");
        Ok(())
    }

    fn write_extent(state: &FsState, address: u64, data: &[u8]) -> Result<()> {
        let idx = state.chunk_for(address)?;
        let chunk = state.chunks[idx].lock();
        if chunk.profile().is_parity() {
            return write_parity(&chunk, &state.devices, address, data);
        }
        let mut ctx = DispatchContext::new();
        let submitted = submit_write(&chunk, &state.devices, &mut ctx, address, data);
        let waited = ctx.wait();
        submitted?;
        waited
    }

    /// Contents of file `inode`, holes read as zeroes.
    pub fn read(&self, tree: TreeId, inode: u64) -> Result<Vec<u8>> {
        let mut state = self.state.write();
        self.translate_pending(&mut state)?;
        let item = Self::inode_item(&state, tree, inode)?;
        let size = item.size as usize;
        let mut out = vec![0u8; size];
        let from = Key::new(inode, item_type::EXTENT_DATA, 0);
        let to = Key::new(inode, item_type::EXTENT_DATA, u64::MAX);
        for (key, raw) in state.trees.collect_range(tree, &from, &to)? {
            let extent = FileExtentItem::decode(&raw)?;
            let start = key.offset as usize;
            if start >= size {
                continue;
            }
            let bytes = if extent.extent_type == FILE_EXTENT_INLINE {
                extent.inline_data
            } else if extent.disk_bytenr == 0 {
                continue;
            } else {
                let mut buf = vec![0u8; extent.num_bytes as usize];
                let address = extent.disk_bytenr + extent.offset;
                let idx = state.chunk_for(address)?;
                let chunk = state.chunks[idx].lock().clone();
                read_logical(&chunk, &state.devices, address, &mut buf)?;
                buf
            };
            let n = bytes.len().min(size - start);
            out[start..start + n].copy_from_slice(&bytes[..n]);
        }
        Ok(out)
    }

    /// Removes entry `name` from directory `dir`; the inode goes away with
    /// its last link.
    pub fn unlink(&self, tree: TreeId, dir: u64, name: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        self.writable(&state)?;
        self.translate_pending(&mut state)?;
        let entry = Self::dir_item(&state, tree, dir, name)?.ok_or(ArborError::NotFound)?;
        let inode = entry.location.objectid;
        let back = state
            .trees
            .lookup(tree, &Key::new(inode, item_type::INODE_REF, dir))?
            .ok_or_else(|| ArborError::Inconsistent(format!("inode {inode} lacks a back reference")))?;
        let index = InodeRef::decode(state.trees.data_at(back))?.index;

        let mut item = Self::inode_item(&state, tree, inode)?;
        if FileKind::of_mode(item.mode) == FileKind::Directory {
            let from = Key::new(inode, item_type::DIR_INDEX, 0);
            let to = Key::new(inode, item_type::DIR_INDEX, u64::MAX);
            if !state.trees.collect_range(tree, &from, &to)?.is_empty() {
                return Err(ArborError::Invalid("directory not empty"));
            }
        }
        item.nlink = item.nlink.saturating_sub(1);
        state.pending.dir_entries.push(DirEntryChange::Remove {
            tree,
            dir,
            name: name.to_vec(),
            inode,
            index,
        });
        state.pending.files.push(FileChange {
            tree,
            inode,
            deleted: item.nlink == 0,
            item,
            extents: Vec::new(),
        });
        state.need_write = true;
        debug!(tree = tree.0, dir, inode, "fs.unlinked");
        Ok(())
    }

    /// Creates an empty subvolume with a root directory and returns its id.
    pub fn create_subvolume(&self) -> Result<TreeId> {
        let mut state = self.state.write();
        self.writable(&state)?;
        let id = TreeId(
            state
                .trees
                .trees
                .keys()
                .map(|t| t.0 + 1)
                .max()
                .unwrap_or(TreeId::FIRST_SUBVOLUME)
                .max(TreeId::FIRST_SUBVOLUME),
        );
        let generation = state.generation;
        let mut undo = self.undo.lock();
        state.trees.create_tree(id, generation)?;
        format::insert_root_dir(&mut state, id, &mut undo)?;
        let root_item = {
            let logical = state.trees.tree_mut(id)?;
            logical.root_item.root_dirid = objectid::FIRST_FREE;
            logical.root_item.clone()
        };
        state.trees.insert_item(
            TreeId::ROOT,
            Key::new(id.0, item_type::ROOT_ITEM, 0),
            root_item.encode(),
            &mut undo,
        )?;
        state.need_write = true;
        info!(tree = id.0, "fs.subvolume_created");
        Ok(id)
    }

    /// Queues subvolume `tree` for deletion at the next commit.
    pub fn delete_subvolume(&self, tree: TreeId) -> Result<()> {
        if tree.0 < TreeId::FIRST_SUBVOLUME {
            return Err(ArborError::Invalid("only subvolumes can be deleted"));
        }
        let mut state = self.state.write();
        self.writable(&state)?;
        if !state.trees.trees.contains_key(&tree) || state.pending.drop_roots.contains(&tree) {
            return Err(ArborError::NotFound);
        }
        state.pending.drop_roots.push(tree);
        state.need_write = true;
        let mut counters = self.counters.lock();
        counters.next_inode.remove(&tree);
        counters.next_index.retain(|(t, _), _| *t != tree);
        info!(tree = tree.0, "fs.subvolume_queued_for_drop");
        Ok(())
    }
}

impl Drop for Filesystem {
    fn drop(&mut self) {
        if let Some(mut flusher) = self.flusher.lock().take() {
            flusher.stop();
        }
        if let Err(err) = self.flush() {
            warn!(error = %err, "fs.final_flush_failed");
        }
    }
}
