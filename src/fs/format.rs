//! Creation of a fresh filesystem.
//!
//! Formatting builds the well-known trees in memory and lets the ordinary
//! commit path allocate the first chunks, write every node and publish the
//! first superblock.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::info;

use super::{FileKind, FormatOptions};
use crate::engine::lifecycle::initial_device_space;
use crate::engine::{FsState, Transaction};
use crate::primitives::io::FileIo;
use crate::storage::chunk::Device;
use crate::storage::records::{DevItem, InodeItem, InodeRef};
use crate::storage::superblock::{Superblock, DEVICE_RESERVED};
use crate::storage::undo::UndoLog;
use crate::types::{item_type, objectid, ArborError, Key, Result, TreeId};

/// Smallest device accepted by [`format`].
pub const MIN_DEVICE_SIZE: u64 = 16 << 20;

fn random_uuid() -> [u8; 16] {
    let mut uuid = [0u8; 16];
    OsRng.fill_bytes(&mut uuid);
    uuid
}

fn validate(devices: &[Arc<dyn FileIo>], opts: &FormatOptions) -> Result<()> {
    if devices.is_empty() {
        return Err(ArborError::Invalid("no devices given"));
    }
    if !opts.sector_size.is_power_of_two() || opts.sector_size < 512 {
        return Err(ArborError::Invalid("sector size must be a power of two of at least 512"));
    }
    if !opts.node_size.is_power_of_two()
        || opts.node_size < opts.sector_size
        || opts.node_size > 64 * 1024
    {
        return Err(ArborError::Invalid(
            "node size must be a power of two between the sector size and 64 KiB",
        ));
    }
    for io in devices {
        if io.len()? < MIN_DEVICE_SIZE.max(DEVICE_RESERVED * 2) {
            return Err(ArborError::NoSpace("device too small"));
        }
    }
    Ok(())
}

/// Inserts the root directory inode of `tree`.
pub(super) fn insert_root_dir(state: &mut FsState, tree: TreeId, undo: &mut UndoLog) -> Result<()> {
    let generation = state.generation;
    let dir = objectid::FIRST_FREE;
    let inode = InodeItem {
        generation,
        transid: generation,
        nlink: 1,
        mode: FileKind::Directory.mode(),
        ..InodeItem::default()
    };
    state
        .trees
        .insert_item(tree, Key::new(dir, item_type::INODE_ITEM, 0), inode.encode(), undo)?;
    let back = InodeRef {
        index: 0,
        name: b"..".to_vec(),
    };
    state
        .trees
        .insert_item(tree, Key::new(dir, item_type::INODE_REF, dir), back.encode(), undo)?;
    Ok(())
}

/// Formats `devices` as one filesystem and returns the published
/// superblock.
pub fn format(devices: &[Arc<dyn FileIo>], opts: &FormatOptions) -> Result<Superblock> {
    validate(devices, opts)?;
    let fsid = random_uuid();
    let mut sizes = Vec::with_capacity(devices.len());
    for io in devices {
        sizes.push(io.len()?);
    }
    let superblock = Superblock {
        fsid,
        node_size: opts.node_size,
        sector_size: opts.sector_size,
        label: opts.label.clone(),
        total_bytes: sizes.iter().sum(),
        num_devices: devices.len() as u64,
        ..Superblock::default()
    };

    let policy = opts.policy();
    let mut state = FsState::new(superblock, 1, policy);
    state.space_cache = opts.space_cache;
    for (idx, (io, len)) in devices.iter().zip(&sizes).enumerate() {
        state.devices.push(Device {
            item: DevItem {
                dev_id: idx as u64 + 1,
                total_bytes: *len,
                io_align: opts.sector_size,
                io_width: opts.sector_size,
                sector_size: opts.sector_size,
                generation: 1,
                uuid: random_uuid(),
                fsid,
                ..DevItem::default()
            },
            io: Arc::clone(io),
            free: initial_device_space(*len, policy.stripe_len)?,
        });
    }

    for tree in [
        TreeId::ROOT,
        TreeId::EXTENT,
        TreeId::CHUNK,
        TreeId::DEV,
        TreeId::FS,
        TreeId::CSUM,
    ] {
        state.trees.create_tree(tree, 1)?;
    }

    let mut undo = UndoLog::new();
    for device in &state.devices {
        let key = Key::new(objectid::DEV_ITEMS, item_type::DEV_ITEM, device.item.dev_id);
        state
            .trees
            .insert_item(TreeId::CHUNK, key, device.item.encode(), &mut undo)?;
    }
    insert_root_dir(&mut state, TreeId::FS, &mut undo)?;
    state.trees.tree_mut(TreeId::FS)?.root_item.root_dirid = objectid::FIRST_FREE;
    for tree in [TreeId::EXTENT, TreeId::DEV, TreeId::FS, TreeId::CSUM] {
        let item = state.trees.trees[&tree].root_item.encode();
        state.trees.insert_item(
            TreeId::ROOT,
            Key::new(tree.0, item_type::ROOT_ITEM, 0),
            item,
            &mut undo,
        )?;
    }

    let runs = Mutex::new(Vec::new());
    let stats = Transaction::new(&mut state, &mut undo, &runs).commit()?;
    info!(
        devices = devices.len(),
        node_size = opts.node_size,
        chunks = state.chunks.len(),
        nodes = stats.nodes_written,
        "fs.formatted"
    );
    Ok(state.superblock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::MemFileIo;
    use crate::storage::superblock::load_superblock;

    fn devices(n: usize, len: u64) -> Vec<Arc<dyn FileIo>> {
        (0..n)
            .map(|_| Arc::new(MemFileIo::new(len)) as Arc<dyn FileIo>)
            .collect()
    }

    #[test]
    fn formatted_devices_carry_matching_superblocks() {
        let devs = devices(2, 256 << 20);
        let sb = format(&devs, &FormatOptions::scratch()).unwrap();
        assert_eq!(sb.generation, 1);
        assert_eq!(sb.num_devices, 2);
        for (idx, io) in devs.iter().enumerate() {
            let on_disk = load_superblock(io.as_ref()).unwrap();
            assert_eq!(on_disk.fsid, sb.fsid);
            assert_eq!(on_disk.root, sb.root);
            assert_eq!(on_disk.dev_item.dev_id, idx as u64 + 1);
        }
    }

    #[test]
    fn bad_geometry_is_rejected() {
        let devs = devices(1, 64 << 20);
        let opts = FormatOptions {
            node_size: 3000,
            ..FormatOptions::scratch()
        };
        assert!(matches!(format(&devs, &opts), Err(ArborError::Invalid(_))));
        assert!(matches!(
            format(&[], &FormatOptions::scratch()),
            Err(ArborError::Invalid(_))
        ));
        let tiny = devices(1, 4 << 20);
        assert!(matches!(
            format(&tiny, &FormatOptions::scratch()),
            Err(ArborError::NoSpace(_))
        ));
    }
}
