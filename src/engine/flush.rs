//! Object flush translators.
//!
//! Higher layers queue dirty directory entries and files on
//! [`PendingWork`](super::PendingWork); the first commit step turns them into
//! tree-item mutations. Removals are applied before additions so a name that
//! is unlinked and re-created in one transaction ends up pointing at the new
//! inode.

use tracing::{debug, trace};

use super::Transaction;
use crate::storage::records::{DirItem, FileExtentItem, InodeItem, InodeRef};
use crate::types::checksum::name_hash;
use crate::types::{item_type, ArborError, Key, Result, TreeId};

/// A directory entry added or removed since the last commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DirEntryChange {
    /// New name `name` in directory `dir` pointing at `location`.
    Add {
        /// Subvolume tree holding the directory.
        tree: TreeId,
        /// Directory inode.
        dir: u64,
        /// Entry name.
        name: Vec<u8>,
        /// Key of the target's inode item.
        location: Key,
        /// File type of the target.
        file_type: u8,
        /// Directory index of the entry.
        index: u64,
    },
    /// Name `name` removed from directory `dir`.
    Remove {
        /// Subvolume tree holding the directory.
        tree: TreeId,
        /// Directory inode.
        dir: u64,
        /// Entry name.
        name: Vec<u8>,
        /// Inode the entry pointed at.
        inode: u64,
        /// Directory index of the entry.
        index: u64,
    },
}

impl DirEntryChange {
    fn is_removal(&self) -> bool {
        matches!(self, DirEntryChange::Remove { .. })
    }
}

/// A change to one file extent mapping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileExtentChange {
    /// Maps `item` at file offset `offset`, replacing any mapping there.
    Insert {
        /// File offset.
        offset: u64,
        /// New mapping.
        item: FileExtentItem,
    },
    /// Removes the mapping at file offset `offset`.
    Remove {
        /// File offset.
        offset: u64,
    },
}

/// A dirty file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileChange {
    /// Subvolume tree holding the inode.
    pub tree: TreeId,
    /// Inode number.
    pub inode: u64,
    /// The inode was deleted; every item it owns goes away.
    pub deleted: bool,
    /// Current inode record.
    pub item: InodeItem,
    /// Extent mapping changes, applied in order.
    pub extents: Vec<FileExtentChange>,
}

impl Transaction<'_> {
    /// Translates every queued directory entry and file change into tree
    /// items, removals first.
    pub fn flush_pending(&mut self) -> Result<()> {
        let entries = std::mem::take(&mut self.state.pending.dir_entries);
        let files = std::mem::take(&mut self.state.pending.files);
        if entries.is_empty() && files.is_empty() {
            return Ok(());
        }
        let (removals, additions): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(DirEntryChange::is_removal);
        let (deleted, changed): (Vec<_>, Vec<_>) = files.into_iter().partition(|f| f.deleted);

        for entry in &removals {
            self.flush_dir_entry(entry)?;
        }
        for file in &deleted {
            self.flush_deleted_file(file)?;
        }
        for entry in &additions {
            self.flush_dir_entry(entry)?;
        }
        for file in &changed {
            self.flush_file(file)?;
        }
        debug!(
            entries = removals.len() + additions.len(),
            files = deleted.len() + changed.len(),
            "flush.translated"
        );
        Ok(())
    }

    fn flush_dir_entry(&mut self, entry: &DirEntryChange) -> Result<()> {
        let generation = self.generation();
        match entry {
            DirEntryChange::Add {
                tree,
                dir,
                name,
                location,
                file_type,
                index,
            } => {
                let payload = DirItem {
                    location: *location,
                    transid: generation,
                    file_type: *file_type,
                    name: name.clone(),
                }
                .encode();
                let trees = &mut self.state.trees;
                trees.insert_item(
                    *tree,
                    Key::new(*dir, item_type::DIR_ITEM, name_hash(name)),
                    payload.clone(),
                    self.undo,
                )?;
                trees.insert_item(
                    *tree,
                    Key::new(*dir, item_type::DIR_INDEX, *index),
                    payload,
                    self.undo,
                )?;
                if location.item_type == item_type::INODE_ITEM {
                    let back = InodeRef {
                        index: *index,
                        name: name.clone(),
                    };
                    trees.insert_item(
                        *tree,
                        Key::new(location.objectid, item_type::INODE_REF, *dir),
                        back.encode(),
                        self.undo,
                    )?;
                }
                trace!(dir, index, "flush.dir_entry_added");
            }
            DirEntryChange::Remove {
                tree,
                dir,
                name,
                inode,
                index,
            } => {
                let trees = &mut self.state.trees;
                trees.delete_key(
                    *tree,
                    &Key::new(*dir, item_type::DIR_ITEM, name_hash(name)),
                    self.undo,
                )?;
                trees.delete_key(*tree, &Key::new(*dir, item_type::DIR_INDEX, *index), self.undo)?;
                let back = Key::new(*inode, item_type::INODE_REF, *dir);
                if let Some(cursor) = trees.lookup(*tree, &back)? {
                    trees.delete_item(cursor, self.undo)?;
                }
                trace!(dir, index, "flush.dir_entry_removed");
            }
        }
        Ok(())
    }

    /// Drops the data reference held by the mapping at `key`, if any.
    fn release_mapping(&mut self, tree: TreeId, key: &Key, data: &[u8]) -> Result<()> {
        let extent = FileExtentItem::decode(data)?;
        if extent.references_extent() {
            self.state.adjust_data_ref(
                extent.disk_bytenr,
                extent.disk_num_bytes,
                extent.data_ref(tree.0, key),
                -1,
                false,
            )?;
        }
        Ok(())
    }

    fn flush_deleted_file(&mut self, file: &FileChange) -> Result<()> {
        let from = Key::new(file.inode, 0, 0);
        let to = Key::new(file.inode, u8::MAX, u64::MAX);
        let items = self.state.trees.collect_range(file.tree, &from, &to)?;
        for (key, data) in &items {
            if key.item_type == item_type::EXTENT_DATA {
                self.release_mapping(file.tree, key, data)?;
            }
            self.state.trees.delete_key(file.tree, key, self.undo)?;
        }
        trace!(inode = file.inode, items = items.len(), "flush.file_deleted");
        Ok(())
    }

    fn flush_file(&mut self, file: &FileChange) -> Result<()> {
        let generation = self.generation();
        let mut item = file.item.clone();
        item.transid = generation;
        self.state.trees.upsert_item(
            file.tree,
            Key::new(file.inode, item_type::INODE_ITEM, 0),
            item.encode(),
            self.undo,
        )?;

        for change in &file.extents {
            match change {
                FileExtentChange::Insert { offset, item } => {
                    let key = Key::new(file.inode, item_type::EXTENT_DATA, *offset);
                    if let Some(cursor) = self.state.trees.lookup(file.tree, &key)? {
                        let (_, old) = self.state.trees.delete_item(cursor, self.undo)?;
                        self.release_mapping(file.tree, &key, &old)?;
                    }
                    if item.references_extent() {
                        self.state.adjust_data_ref(
                            item.disk_bytenr,
                            item.disk_num_bytes,
                            item.data_ref(file.tree.0, &key),
                            1,
                            false,
                        )?;
                    }
                    self.state
                        .trees
                        .insert_item(file.tree, key, item.encode(), self.undo)?;
                }
                FileExtentChange::Remove { offset } => {
                    let key = Key::new(file.inode, item_type::EXTENT_DATA, *offset);
                    let old = self
                        .state
                        .trees
                        .delete_key(file.tree, &key, self.undo)
                        .map_err(|_| {
                            ArborError::Inconsistent(format!(
                                "inode {} has no extent at {offset}",
                                file.inode
                            ))
                        })?;
                    self.release_mapping(file.tree, &key, &old)?;
                }
            }
        }
        Ok(())
    }
}
