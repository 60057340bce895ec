use std::path::Path;

use serde::Serialize;

use crate::admin::util::{open_images, uuid_string};
use crate::admin::Result;
use crate::engine::FsState;
use crate::fs::{Filesystem, MountOptions};
use crate::storage::chunk::block_group;
use crate::storage::superblock::BackupRoot;
use crate::types::TreeId;

/// Everything `arborfs inspect` prints about an image.
#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    /// Fields of the newest superblock.
    pub superblock: SuperblockSection,
    /// Backup-root ring, oldest slot first.
    pub backups: Vec<BackupSection>,
    /// Chunk table in logical order.
    pub chunks: Vec<ChunkSection>,
    /// Member devices.
    pub devices: Vec<DeviceSection>,
    /// Loaded logical trees.
    pub trees: Vec<TreeSection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuperblockSection {
    pub fsid: String,
    pub label: String,
    pub generation: u64,
    pub root: u64,
    pub root_level: u8,
    pub chunk_root: u64,
    pub chunk_root_generation: u64,
    pub chunk_root_level: u8,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub num_devices: u64,
    pub node_size: u32,
    pub sector_size: u32,
    pub cache_generation: u64,
    pub bootstrap_chunks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupSection {
    pub slot: usize,
    pub tree_root: u64,
    pub tree_root_gen: u64,
    pub chunk_root: u64,
    pub extent_root: u64,
    pub fs_root: u64,
    pub dev_root: u64,
    pub csum_root: u64,
    pub bytes_used: u64,
}

impl BackupSection {
    fn new(slot: usize, backup: &BackupRoot) -> Self {
        Self {
            slot,
            tree_root: backup.tree_root,
            tree_root_gen: backup.tree_root_gen,
            chunk_root: backup.chunk_root,
            extent_root: backup.extent_root,
            fs_root: backup.fs_root,
            dev_root: backup.dev_root,
            csum_root: backup.csum_root,
            bytes_used: backup.bytes_used,
        }
    }

    /// True for slots no commit has filled yet.
    pub fn is_empty(&self) -> bool {
        self.tree_root_gen == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkSection {
    pub offset: u64,
    pub length: u64,
    pub kind: &'static str,
    pub profile: String,
    pub used: u64,
    pub free: u64,
    pub has_cache: bool,
    pub stripes: Vec<StripeSection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StripeSection {
    pub dev_id: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSection {
    pub dev_id: u64,
    pub uuid: String,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub unallocated: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeSection {
    pub id: u64,
    pub name: String,
    pub address: u64,
    pub level: u8,
    pub generation: u64,
    pub items: usize,
}

/// Human name of a tree id.
pub fn tree_name(tree: TreeId) -> String {
    match tree {
        TreeId::ROOT => "root".into(),
        TreeId::EXTENT => "extent".into(),
        TreeId::CHUNK => "chunk".into(),
        TreeId::DEV => "dev".into(),
        TreeId::FS => "fs".into(),
        TreeId::CSUM => "csum".into(),
        other => format!("subvol-{}", other.0),
    }
}

fn chunk_kind(flags: u64) -> &'static str {
    match flags & block_group::TYPE_MASK {
        block_group::DATA => "data",
        block_group::METADATA => "metadata",
        block_group::SYSTEM => "system",
        _ => "mixed",
    }
}

/// Opens the images read-only and describes them.
///
/// # Errors
///
/// Returns an error if an image is missing or the filesystem does not
/// mount.
pub fn inspect<P: AsRef<Path>>(paths: &[P]) -> Result<InspectReport> {
    let devices = open_images(paths)?;
    let fs = Filesystem::open(devices, MountOptions::inspect())?;
    let report = fs.with_state(report_for)?;
    fs.shutdown()?;
    Ok(report)
}

pub(crate) fn report_for(state: &FsState) -> Result<InspectReport> {
    let sb = &state.superblock;
    let superblock = SuperblockSection {
        fsid: uuid_string(&sb.fsid),
        label: sb.label.clone(),
        generation: sb.generation,
        root: sb.root,
        root_level: sb.root_level,
        chunk_root: sb.chunk_root,
        chunk_root_generation: sb.chunk_root_generation,
        chunk_root_level: sb.chunk_root_level,
        total_bytes: sb.total_bytes,
        bytes_used: sb.bytes_used,
        num_devices: sb.num_devices,
        node_size: sb.node_size,
        sector_size: sb.sector_size,
        cache_generation: sb.cache_generation,
        bootstrap_chunks: sb.bootstrap_entries()?.len(),
    };
    let backups = sb
        .backups
        .iter()
        .enumerate()
        .map(|(slot, backup)| BackupSection::new(slot, backup))
        .collect();
    let chunks = state
        .chunks
        .iter()
        .map(|chunk| {
            let chunk = chunk.lock();
            ChunkSection {
                offset: chunk.offset,
                length: chunk.size,
                kind: chunk_kind(chunk.flags),
                profile: chunk.profile().to_string(),
                used: chunk.used,
                free: chunk.free.total(),
                has_cache: chunk.cache.is_some(),
                stripes: chunk
                    .stripes
                    .iter()
                    .map(|stripe| StripeSection {
                        dev_id: stripe.dev_id,
                        offset: stripe.offset,
                    })
                    .collect(),
            }
        })
        .collect();
    let devices = state
        .devices
        .iter()
        .map(|device| DeviceSection {
            dev_id: device.id(),
            uuid: uuid_string(&device.item.uuid),
            total_bytes: device.item.total_bytes,
            bytes_used: device.item.bytes_used,
            unallocated: device.free.total(),
        })
        .collect();
    let mut trees = Vec::with_capacity(state.trees.trees.len());
    for (id, tree) in &state.trees.trees {
        let root = &state.trees.arena[tree.root];
        trees.push(TreeSection {
            id: id.0,
            name: tree_name(*id),
            address: root.effective_address().unwrap_or(0),
            level: root.level,
            generation: root.generation,
            items: state.trees.item_count(*id)?,
        });
    }
    Ok(InspectReport {
        superblock,
        backups,
        chunks,
        devices,
        trees,
    })
}
