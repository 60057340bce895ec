//! Superblock publication, the commit point.
//!
//! Every copy on every device is rewritten after the tree writes are durable.
//! The copies of one device are written in order and stop at the first
//! failure; the commit fails when some device got no copy at all.

use tracing::{debug, info, warn};

use super::Transaction;
use crate::primitives::io::DispatchContext;
use crate::storage::superblock::{
    superblock_offsets_for, write_superblock, BackupRoot, Superblock,
};
use crate::types::{ArborError, Result, TreeId};

impl Transaction<'_> {
    /// Snapshot of the roots `sb` publishes.
    fn backup_root(&self, sb: &Superblock) -> BackupRoot {
        let mut backup = BackupRoot {
            tree_root: sb.root,
            tree_root_gen: sb.generation,
            tree_root_level: sb.root_level,
            chunk_root: sb.chunk_root,
            chunk_root_gen: sb.chunk_root_generation,
            chunk_root_level: sb.chunk_root_level,
            total_bytes: sb.total_bytes,
            bytes_used: sb.bytes_used,
            num_devices: sb.num_devices,
            ..BackupRoot::default()
        };
        let root_of = |tree: TreeId| {
            self.state
                .trees
                .trees
                .get(&tree)
                .map(|t| (t.root_item.bytenr, t.root_item.generation, t.root_item.level))
                .unwrap_or_default()
        };
        (backup.extent_root, backup.extent_root_gen, backup.extent_root_level) =
            root_of(TreeId::EXTENT);
        (backup.fs_root, backup.fs_root_gen, backup.fs_root_level) = root_of(TreeId::FS);
        (backup.dev_root, backup.dev_root_gen, backup.dev_root_level) = root_of(TreeId::DEV);
        (backup.csum_root, backup.csum_root_gen, backup.csum_root_level) = root_of(TreeId::CSUM);
        backup
    }

    /// Builds the superblock this commit publishes: the in-memory one
    /// pointed at the freshly written root and chunk trees, with a new
    /// backup-root entry pushed.
    ///
    /// The in-memory superblock is left alone until every device has a copy.
    fn stage_superblock(&self) -> Result<Superblock> {
        let generation = self.generation();
        let (root_address, root_level) = self.written_root(TreeId::ROOT)?;
        let (chunk_address, chunk_level, chunk_dirty) = {
            let id = self.state.trees.root(TreeId::CHUNK)?;
            let node = &self.state.trees.arena[id];
            (node.effective_address(), node.level, node.dirty)
        };
        let chunk_address = chunk_address.ok_or_else(|| {
            ArborError::Inconsistent("chunk tree root was never written".into())
        })?;

        let mut sb = self.state.superblock.clone();
        sb.generation = generation;
        sb.cache_generation = if self.state.space_cache { generation } else { 0 };
        sb.root = root_address;
        sb.root_level = root_level;
        sb.chunk_root = chunk_address;
        sb.chunk_root_level = chunk_level;
        if chunk_dirty {
            sb.chunk_root_generation = generation;
        }
        sb.num_devices = self.state.devices.len() as u64;
        sb.total_bytes = self.state.devices.iter().map(|d| d.item.total_bytes).sum();

        let backup = self.backup_root(&sb);
        sb.backups.rotate_left(1);
        if let Some(last) = sb.backups.last_mut() {
            *last = backup;
        }
        Ok(sb)
    }

    fn written_root(&self, tree: TreeId) -> Result<(u64, u8)> {
        let id = self.state.trees.root(tree)?;
        let node = &self.state.trees.arena[id];
        let address = node
            .new_address
            .ok_or_else(|| ArborError::Inconsistent(format!("root of tree {tree} has no address")))?;
        Ok((address, node.level))
    }

    /// Writes the superblock to every copy location of every device and
    /// syncs the devices.
    ///
    /// The staged superblock replaces the in-memory one only once every
    /// device holds at least one copy, so a failed attempt can be retried.
    pub fn write_superblocks(&mut self) -> Result<()> {
        let staged = self.stage_superblock()?;
        let mut copies = 0usize;
        for device in &self.state.devices {
            let mut sb = staged.clone();
            sb.dev_item = device.item.clone();
            let mut written = 0usize;
            let mut last_err = None;
            for offset in superblock_offsets_for(device.item.total_bytes) {
                sb.bytenr = offset;
                let block = write_superblock(&sb)?;
                match DispatchContext::write_now(device.id(), device.io.as_ref(), offset, &block) {
                    Ok(()) => written += 1,
                    Err(err) => {
                        warn!(dev_id = device.id(), offset, error = %err, "superblock.copy_failed");
                        last_err = Some(err);
                        break;
                    }
                }
            }
            if written == 0 {
                return Err(last_err.unwrap_or(ArborError::NoSpace("device too small for a superblock")));
            }
            device.io.sync_all()?;
            debug!(dev_id = device.id(), copies = written, "superblock.device_done");
            copies += written;
        }
        info!(
            generation = staged.generation,
            root = staged.root,
            copies,
            "superblock.published"
        );
        self.state.superblock = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::engine::testutil;
    use crate::primitives::io::{FileIo, MemFileIo};
    use crate::storage::superblock::{load_superblock, SUPERBLOCK_OFFSETS};
    use crate::storage::undo::UndoLog;

    fn addressed_roots(state: &mut crate::engine::FsState) {
        for (i, tree) in [TreeId::ROOT, TreeId::CHUNK].into_iter().enumerate() {
            let root = state.trees.root(tree).unwrap();
            state.trees.arena[root].new_address = Some(0x40_0000 + i as u64 * 0x4000);
        }
    }

    #[test]
    fn every_device_gets_the_new_generation() {
        let mut state = testutil::state(2, 128 << 20, 4096);
        state.generation = 3;
        addressed_roots(&mut state);
        let mut undo = UndoLog::new();
        let runs = Mutex::new(Vec::new());
        let mut tx = Transaction::new(&mut state, &mut undo, &runs);
        tx.write_superblocks().unwrap();

        for device in &tx.state.devices {
            let sb = load_superblock(device.io.as_ref()).unwrap();
            assert_eq!(sb.generation, 3);
            assert_eq!(sb.root, 0x40_0000);
            assert_eq!(sb.chunk_root, 0x40_4000);
            assert_eq!(sb.chunk_root_generation, 3);
            assert_eq!(sb.dev_item.dev_id, device.id());
            assert_eq!(sb.num_devices, 2);
            assert_eq!(sb.backups[3].tree_root, 0x40_0000);
        }
    }

    #[test]
    fn backups_rotate_oldest_out() {
        let mut state = testutil::state(1, 128 << 20, 4096);
        addressed_roots(&mut state);
        let mut undo = UndoLog::new();
        let runs = Mutex::new(Vec::new());
        for generation in 1..=5 {
            state.generation = generation;
            let mut tx = Transaction::new(&mut state, &mut undo, &runs);
            tx.write_superblocks().unwrap();
        }
        let gens: Vec<u64> = state.superblock.backups.iter().map(|b| b.tree_root_gen).collect();
        assert_eq!(gens, vec![2, 3, 4, 5]);
    }

    #[test]
    fn unwritable_device_fails_the_commit() {
        let mut state = testutil::state(1, 128 << 20, 4096);
        let io = Arc::new(MemFileIo::new(128 << 20));
        io.set_fail_writes(true);
        state.devices[0].io = io;
        addressed_roots(&mut state);
        let mut undo = UndoLog::new();
        let runs = Mutex::new(Vec::new());
        let mut tx = Transaction::new(&mut state, &mut undo, &runs);
        assert!(matches!(
            tx.write_superblocks(),
            Err(ArborError::DeviceWrite { dev_id: 1, .. })
        ));
    }

    #[test]
    fn failed_publication_can_be_retried() {
        let mut state = testutil::state(1, 128 << 20, 4096);
        let io = Arc::new(MemFileIo::new(128 << 20));
        state.devices[0].io = io.clone();
        addressed_roots(&mut state);
        let mut undo = UndoLog::new();
        let runs = Mutex::new(Vec::new());
        for generation in 1..=3 {
            state.generation = generation;
            Transaction::new(&mut state, &mut undo, &runs)
                .write_superblocks()
                .unwrap();
        }
        let before = state.superblock.clone();

        state.generation = 4;
        io.set_fail_writes(true);
        assert!(Transaction::new(&mut state, &mut undo, &runs)
            .write_superblocks()
            .is_err());
        assert_eq!(state.superblock, before);

        io.set_fail_writes(false);
        Transaction::new(&mut state, &mut undo, &runs)
            .write_superblocks()
            .unwrap();
        let gens: Vec<u64> = state.superblock.backups.iter().map(|b| b.tree_root_gen).collect();
        assert_eq!(gens, vec![1, 2, 3, 4]);
        assert_eq!(load_superblock(io.as_ref()).unwrap().generation, 4);
    }

    #[test]
    fn small_device_gets_only_fitting_copies() {
        let len = 32 << 20;
        let mut state = testutil::state(1, len, 4096);
        let io = Arc::new(MemFileIo::new(len));
        state.devices[0].io = io.clone();
        addressed_roots(&mut state);
        let mut undo = UndoLog::new();
        let runs = Mutex::new(Vec::new());
        let mut tx = Transaction::new(&mut state, &mut undo, &runs);
        tx.write_superblocks().unwrap();

        assert_eq!(io.write_count(), 1);
        let mut buf = vec![0u8; 8];
        io.read_at(SUPERBLOCK_OFFSETS[0] + 64, &mut buf).unwrap();
        assert_eq!(&buf, b"_ArBoRfS");
        assert!(io.read_at(SUPERBLOCK_OFFSETS[1], &mut buf).is_err());
    }

    #[test]
    fn device_without_room_for_any_copy_fails_the_commit() {
        let mut state = testutil::state(1, 32 << 20, 4096);
        let io = Arc::new(MemFileIo::new(32 << 20));
        state.devices[0].io = io.clone();
        state.devices[0].item.total_bytes = SUPERBLOCK_OFFSETS[0] + 1024;
        addressed_roots(&mut state);
        state.generation = 1;
        let before = state.superblock.clone();
        let mut undo = UndoLog::new();
        let runs = Mutex::new(Vec::new());
        let mut tx = Transaction::new(&mut state, &mut undo, &runs);
        assert!(matches!(
            tx.write_superblocks(),
            Err(ArborError::NoSpace(_))
        ));
        assert_eq!(io.write_count(), 0);
        assert_eq!(state.superblock, before);
    }
}
