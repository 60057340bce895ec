use std::ops::Range;

use crate::primitives::bytes::{LeReader, LeWriter};
use crate::primitives::io::FileIo;
use crate::storage::records::{ChunkItem, DevItem};
use crate::types::checksum::{stamp_block_crc32, verify_block_crc32};
use crate::types::{item_type, objectid, read_u16, read_u32, read_u64, ArborError, Key, Result};

/// Size of one superblock copy.
pub const SUPERBLOCK_SIZE: usize = 4096;
/// Physical offsets of the superblock copies on every device.
pub const SUPERBLOCK_OFFSETS: [u64; 3] = [0x1_0000, 0x400_0000, 0x40_0000_0000];
/// Slots in the backup-root ring.
pub const BACKUP_ROOT_SLOTS: usize = 4;
/// Capacity of the system-chunk bootstrap array.
pub const SYS_CHUNK_ARRAY_SIZE: usize = 2048;
/// Superblock magic.
pub const SUPERBLOCK_MAGIC: [u8; 8] = *b"_ArBoRfS";
/// Space at the start of each device never handed to chunks.
pub const DEVICE_RESERVED: u64 = 1 << 20;

const SB_FSID: Range<usize> = 32..48;
const SB_BYTENR: Range<usize> = 48..56;
const SB_FLAGS: Range<usize> = 56..64;
const SB_MAGIC: Range<usize> = 64..72;
const SB_GENERATION: Range<usize> = 72..80;
const SB_ROOT: Range<usize> = 80..88;
const SB_CHUNK_ROOT: Range<usize> = 88..96;
const SB_LOG_ROOT: Range<usize> = 96..104;
const SB_TOTAL_BYTES: Range<usize> = 104..112;
const SB_BYTES_USED: Range<usize> = 112..120;
const SB_ROOT_DIR: Range<usize> = 120..128;
const SB_NUM_DEVICES: Range<usize> = 128..136;
const SB_SECTOR_SIZE: Range<usize> = 136..140;
const SB_NODE_SIZE: Range<usize> = 140..144;
const SB_STRIPE_SIZE: Range<usize> = 144..148;
const SB_SYS_ARRAY_SIZE: Range<usize> = 148..152;
const SB_CHUNK_ROOT_GENERATION: Range<usize> = 152..160;
const SB_COMPAT_FLAGS: Range<usize> = 160..168;
const SB_COMPAT_RO_FLAGS: Range<usize> = 168..176;
const SB_INCOMPAT_FLAGS: Range<usize> = 176..184;
const SB_CSUM_TYPE: Range<usize> = 184..186;
const SB_ROOT_LEVEL: usize = 186;
const SB_CHUNK_ROOT_LEVEL: usize = 187;
const SB_DEV_ITEM: Range<usize> = 188..188 + DevItem::LEN;
const SB_LABEL: Range<usize> = 272..528;
const SB_CACHE_GENERATION: Range<usize> = 528..536;
const SB_SYS_CHUNK_ARRAY: Range<usize> = 536..536 + SYS_CHUNK_ARRAY_SIZE;
const SB_BACKUPS: usize = 536 + SYS_CHUNK_ARRAY_SIZE;
const BACKUP_LEN: usize = 128;

/// Snapshot of the tree roots of one committed generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackupRoot {
    /// Root tree address.
    pub tree_root: u64,
    /// Root tree generation.
    pub tree_root_gen: u64,
    /// Chunk tree address.
    pub chunk_root: u64,
    /// Chunk tree generation.
    pub chunk_root_gen: u64,
    /// Extent tree address.
    pub extent_root: u64,
    /// Extent tree generation.
    pub extent_root_gen: u64,
    /// Default file tree address.
    pub fs_root: u64,
    /// Default file tree generation.
    pub fs_root_gen: u64,
    /// Device tree address.
    pub dev_root: u64,
    /// Device tree generation.
    pub dev_root_gen: u64,
    /// Checksum tree address.
    pub csum_root: u64,
    /// Checksum tree generation.
    pub csum_root_gen: u64,
    /// Filesystem size.
    pub total_bytes: u64,
    /// Bytes used.
    pub bytes_used: u64,
    /// Device count.
    pub num_devices: u64,
    /// Root tree level.
    pub tree_root_level: u8,
    /// Chunk tree level.
    pub chunk_root_level: u8,
    /// Extent tree level.
    pub extent_root_level: u8,
    /// Default file tree level.
    pub fs_root_level: u8,
    /// Device tree level.
    pub dev_root_level: u8,
    /// Checksum tree level.
    pub csum_root_level: u8,
}

impl BackupRoot {
    fn encode(&self, dst: &mut [u8]) {
        let raw = LeWriter::with_capacity(BACKUP_LEN)
            .u64(self.tree_root)
            .u64(self.tree_root_gen)
            .u64(self.chunk_root)
            .u64(self.chunk_root_gen)
            .u64(self.extent_root)
            .u64(self.extent_root_gen)
            .u64(self.fs_root)
            .u64(self.fs_root_gen)
            .u64(self.dev_root)
            .u64(self.dev_root_gen)
            .u64(self.csum_root)
            .u64(self.csum_root_gen)
            .u64(self.total_bytes)
            .u64(self.bytes_used)
            .u64(self.num_devices)
            .u8(self.tree_root_level)
            .u8(self.chunk_root_level)
            .u8(self.extent_root_level)
            .u8(self.fs_root_level)
            .u8(self.dev_root_level)
            .u8(self.csum_root_level)
            .finish();
        dst[..raw.len()].copy_from_slice(&raw);
    }

    fn decode(src: &[u8]) -> Result<Self> {
        let mut r = LeReader::new(src, "backup root truncated");
        Ok(Self {
            tree_root: r.u64()?,
            tree_root_gen: r.u64()?,
            chunk_root: r.u64()?,
            chunk_root_gen: r.u64()?,
            extent_root: r.u64()?,
            extent_root_gen: r.u64()?,
            fs_root: r.u64()?,
            fs_root_gen: r.u64()?,
            dev_root: r.u64()?,
            dev_root_gen: r.u64()?,
            csum_root: r.u64()?,
            csum_root_gen: r.u64()?,
            total_bytes: r.u64()?,
            bytes_used: r.u64()?,
            num_devices: r.u64()?,
            tree_root_level: r.u8()?,
            chunk_root_level: r.u8()?,
            extent_root_level: r.u8()?,
            fs_root_level: r.u8()?,
            dev_root_level: r.u8()?,
            csum_root_level: r.u8()?,
        })
    }
}

/// The filesystem's root-of-trust record.
///
/// Every device carries identical copies, except for `bytenr` and
/// `dev_item`, which describe the copy's own location and device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Superblock {
    /// Filesystem uuid.
    pub fsid: [u8; 16],
    /// Physical offset of this copy.
    pub bytenr: u64,
    /// Superblock flags.
    pub flags: u64,
    /// Generation of the last committed transaction.
    pub generation: u64,
    /// Root tree address.
    pub root: u64,
    /// Chunk tree address.
    pub chunk_root: u64,
    /// Log tree address (always zero).
    pub log_root: u64,
    /// Sum of device sizes.
    pub total_bytes: u64,
    /// Bytes used, scaled by each chunk's redundancy.
    pub bytes_used: u64,
    /// Root directory objectid.
    pub root_dir_objectid: u64,
    /// Number of devices.
    pub num_devices: u64,
    /// Sector size.
    pub sector_size: u32,
    /// Node size.
    pub node_size: u32,
    /// Stripe size.
    pub stripe_size: u32,
    /// Generation the chunk tree was last written in.
    pub chunk_root_generation: u64,
    /// Compatible feature flags.
    pub compat_flags: u64,
    /// Read-only compatible feature flags.
    pub compat_ro_flags: u64,
    /// Incompatible feature flags.
    pub incompat_flags: u64,
    /// Checksum algorithm.
    pub csum_type: u16,
    /// Root tree level.
    pub root_level: u8,
    /// Chunk tree level.
    pub chunk_root_level: u8,
    /// Device this copy lives on.
    pub dev_item: DevItem,
    /// Filesystem label.
    pub label: String,
    /// Generation whose free-space caches are valid.
    pub cache_generation: u64,
    /// Bootstrap array of system chunks: encoded key followed by chunk item.
    pub sys_chunk_array: Vec<u8>,
    /// Backup-root ring, oldest first.
    pub backups: [BackupRoot; BACKUP_ROOT_SLOTS],
}

impl Default for Superblock {
    fn default() -> Self {
        Self {
            fsid: [0; 16],
            bytenr: 0,
            flags: 0,
            generation: 0,
            root: 0,
            chunk_root: 0,
            log_root: 0,
            total_bytes: 0,
            bytes_used: 0,
            root_dir_objectid: 6,
            num_devices: 0,
            sector_size: 4096,
            node_size: 16384,
            stripe_size: 65536,
            chunk_root_generation: 0,
            compat_flags: 0,
            compat_ro_flags: 0,
            incompat_flags: 0,
            csum_type: 0,
            root_level: 0,
            chunk_root_level: 0,
            dev_item: DevItem::default(),
            label: String::new(),
            cache_generation: 0,
            sys_chunk_array: Vec::new(),
            backups: [BackupRoot::default(); BACKUP_ROOT_SLOTS],
        }
    }
}

impl Superblock {
    /// Parsed bootstrap entries: chunk start and chunk item.
    pub fn bootstrap_entries(&self) -> Result<Vec<(u64, ChunkItem)>> {
        let mut out = Vec::new();
        let mut at = 0usize;
        let array = &self.sys_chunk_array;
        while at < array.len() {
            let key = Key::decode(&array[at..])?;
            if key.item_type != item_type::CHUNK_ITEM {
                return Err(ArborError::Corruption("bootstrap entry is not a chunk item"));
            }
            at += Key::LEN;
            let item = ChunkItem::decode(&array[at..])?;
            at += item.encoded_len();
            out.push((key.offset, item));
        }
        Ok(out)
    }

    /// Rewrites the bootstrap array from `entries`, sorted by chunk start.
    pub fn set_bootstrap(&mut self, mut entries: Vec<(u64, ChunkItem)>) -> Result<()> {
        entries.sort_by_key(|(offset, _)| *offset);
        let mut w = LeWriter::default();
        for (offset, item) in &entries {
            w.key(&Key::new(
                objectid::FIRST_CHUNK_TREE,
                item_type::CHUNK_ITEM,
                *offset,
            ))
            .bytes(&item.encode());
        }
        let raw = w.finish();
        if raw.len() > SYS_CHUNK_ARRAY_SIZE {
            return Err(ArborError::NoSpace("system chunk array full"));
        }
        self.sys_chunk_array = raw;
        Ok(())
    }

    /// Adds a system chunk to the bootstrap array.
    pub fn add_bootstrap(&mut self, offset: u64, item: ChunkItem) -> Result<()> {
        let mut entries = self.bootstrap_entries()?;
        entries.retain(|(o, _)| *o != offset);
        entries.push((offset, item));
        self.set_bootstrap(entries)
    }

    /// Removes a system chunk from the bootstrap array.
    pub fn remove_bootstrap(&mut self, offset: u64) -> Result<bool> {
        let mut entries = self.bootstrap_entries()?;
        let before = entries.len();
        entries.retain(|(o, _)| *o != offset);
        let removed = entries.len() != before;
        self.set_bootstrap(entries)?;
        Ok(removed)
    }
}

fn put(buf: &mut [u8], range: Range<usize>, bytes: &[u8]) {
    buf[range].copy_from_slice(bytes);
}

/// Serializes `sb` into a checksummed [`SUPERBLOCK_SIZE`] block.
pub fn write_superblock(sb: &Superblock) -> Result<Vec<u8>> {
    if sb.sys_chunk_array.len() > SYS_CHUNK_ARRAY_SIZE {
        return Err(ArborError::NoSpace("system chunk array full"));
    }
    if sb.label.len() >= SB_LABEL.len() {
        return Err(ArborError::Invalid("label too long"));
    }
    let mut buf = vec![0u8; SUPERBLOCK_SIZE];
    put(&mut buf, SB_FSID, &sb.fsid);
    put(&mut buf, SB_BYTENR, &sb.bytenr.to_le_bytes());
    put(&mut buf, SB_FLAGS, &sb.flags.to_le_bytes());
    put(&mut buf, SB_MAGIC, &SUPERBLOCK_MAGIC);
    put(&mut buf, SB_GENERATION, &sb.generation.to_le_bytes());
    put(&mut buf, SB_ROOT, &sb.root.to_le_bytes());
    put(&mut buf, SB_CHUNK_ROOT, &sb.chunk_root.to_le_bytes());
    put(&mut buf, SB_LOG_ROOT, &sb.log_root.to_le_bytes());
    put(&mut buf, SB_TOTAL_BYTES, &sb.total_bytes.to_le_bytes());
    put(&mut buf, SB_BYTES_USED, &sb.bytes_used.to_le_bytes());
    put(&mut buf, SB_ROOT_DIR, &sb.root_dir_objectid.to_le_bytes());
    put(&mut buf, SB_NUM_DEVICES, &sb.num_devices.to_le_bytes());
    put(&mut buf, SB_SECTOR_SIZE, &sb.sector_size.to_le_bytes());
    put(&mut buf, SB_NODE_SIZE, &sb.node_size.to_le_bytes());
    put(&mut buf, SB_STRIPE_SIZE, &sb.stripe_size.to_le_bytes());
    put(
        &mut buf,
        SB_SYS_ARRAY_SIZE,
        &(sb.sys_chunk_array.len() as u32).to_le_bytes(),
    );
    put(
        &mut buf,
        SB_CHUNK_ROOT_GENERATION,
        &sb.chunk_root_generation.to_le_bytes(),
    );
    put(&mut buf, SB_COMPAT_FLAGS, &sb.compat_flags.to_le_bytes());
    put(&mut buf, SB_COMPAT_RO_FLAGS, &sb.compat_ro_flags.to_le_bytes());
    put(&mut buf, SB_INCOMPAT_FLAGS, &sb.incompat_flags.to_le_bytes());
    put(&mut buf, SB_CSUM_TYPE, &sb.csum_type.to_le_bytes());
    buf[SB_ROOT_LEVEL] = sb.root_level;
    buf[SB_CHUNK_ROOT_LEVEL] = sb.chunk_root_level;
    put(&mut buf, SB_DEV_ITEM, &sb.dev_item.encode());
    buf[SB_LABEL.start..SB_LABEL.start + sb.label.len()].copy_from_slice(sb.label.as_bytes());
    put(&mut buf, SB_CACHE_GENERATION, &sb.cache_generation.to_le_bytes());
    let arr = SB_SYS_CHUNK_ARRAY.start;
    buf[arr..arr + sb.sys_chunk_array.len()].copy_from_slice(&sb.sys_chunk_array);
    for (i, backup) in sb.backups.iter().enumerate() {
        let at = SB_BACKUPS + i * BACKUP_LEN;
        backup.encode(&mut buf[at..at + BACKUP_LEN]);
    }
    stamp_block_crc32(&mut buf);
    Ok(buf)
}

/// Parses and validates one superblock copy.
pub fn read_superblock(buf: &[u8]) -> Result<Superblock> {
    if buf.len() < SUPERBLOCK_SIZE {
        return Err(ArborError::Corruption("superblock truncated"));
    }
    if buf[SB_MAGIC] != SUPERBLOCK_MAGIC {
        return Err(ArborError::Corruption("superblock magic mismatch"));
    }
    if !verify_block_crc32(&buf[..SUPERBLOCK_SIZE]) {
        return Err(ArborError::Corruption("superblock checksum mismatch"));
    }
    let sys_len = read_u32(buf, SB_SYS_ARRAY_SIZE.start) as usize;
    if sys_len > SYS_CHUNK_ARRAY_SIZE {
        return Err(ArborError::Corruption("system chunk array size"));
    }
    let mut fsid = [0u8; 16];
    fsid.copy_from_slice(&buf[SB_FSID]);
    let label_raw = &buf[SB_LABEL];
    let label_len = label_raw.iter().position(|&b| b == 0).unwrap_or(label_raw.len());
    let label = String::from_utf8_lossy(&label_raw[..label_len]).into_owned();
    let mut backups = [BackupRoot::default(); BACKUP_ROOT_SLOTS];
    for (i, slot) in backups.iter_mut().enumerate() {
        let at = SB_BACKUPS + i * BACKUP_LEN;
        *slot = BackupRoot::decode(&buf[at..at + BACKUP_LEN])?;
    }
    let arr = SB_SYS_CHUNK_ARRAY.start;
    Ok(Superblock {
        fsid,
        bytenr: read_u64(buf, SB_BYTENR.start),
        flags: read_u64(buf, SB_FLAGS.start),
        generation: read_u64(buf, SB_GENERATION.start),
        root: read_u64(buf, SB_ROOT.start),
        chunk_root: read_u64(buf, SB_CHUNK_ROOT.start),
        log_root: read_u64(buf, SB_LOG_ROOT.start),
        total_bytes: read_u64(buf, SB_TOTAL_BYTES.start),
        bytes_used: read_u64(buf, SB_BYTES_USED.start),
        root_dir_objectid: read_u64(buf, SB_ROOT_DIR.start),
        num_devices: read_u64(buf, SB_NUM_DEVICES.start),
        sector_size: read_u32(buf, SB_SECTOR_SIZE.start),
        node_size: read_u32(buf, SB_NODE_SIZE.start),
        stripe_size: read_u32(buf, SB_STRIPE_SIZE.start),
        chunk_root_generation: read_u64(buf, SB_CHUNK_ROOT_GENERATION.start),
        compat_flags: read_u64(buf, SB_COMPAT_FLAGS.start),
        compat_ro_flags: read_u64(buf, SB_COMPAT_RO_FLAGS.start),
        incompat_flags: read_u64(buf, SB_INCOMPAT_FLAGS.start),
        csum_type: read_u16(buf, SB_CSUM_TYPE.start),
        root_level: buf[SB_ROOT_LEVEL],
        chunk_root_level: buf[SB_CHUNK_ROOT_LEVEL],
        dev_item: DevItem::decode(&buf[SB_DEV_ITEM])?,
        label,
        cache_generation: read_u64(buf, SB_CACHE_GENERATION.start),
        sys_chunk_array: buf[arr..arr + sys_len].to_vec(),
        backups,
    })
}

/// Offsets of the superblock copies that fit on a device of `len` bytes.
pub fn superblock_offsets_for(len: u64) -> impl Iterator<Item = u64> {
    SUPERBLOCK_OFFSETS
        .into_iter()
        .take_while(move |off| off + SUPERBLOCK_SIZE as u64 <= len)
}

/// Reads every copy on `io` and returns the valid one with the highest
/// generation.
pub fn load_superblock(io: &dyn FileIo) -> Result<Superblock> {
    let len = io.len()?;
    let mut best: Option<Superblock> = None;
    let mut buf = vec![0u8; SUPERBLOCK_SIZE];
    for off in superblock_offsets_for(len) {
        io.read_at(off, &mut buf)?;
        match read_superblock(&buf) {
            Ok(sb) if sb.bytenr == off => {
                if best.as_ref().map_or(true, |b| sb.generation > b.generation) {
                    best = Some(sb);
                }
            }
            Ok(_) => tracing::warn!(offset = off, "superblock.misplaced_copy"),
            Err(err) => tracing::debug!(offset = off, error = %err, "superblock.invalid_copy"),
        }
    }
    best.ok_or(ArborError::Corruption("no valid superblock copy"))
}
