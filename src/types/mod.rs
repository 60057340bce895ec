//! Identifiers, item keys and the crate-wide error type.

#![forbid(unsafe_code)]

use std::fmt;

pub mod checksum;

/// Identifier of a logical tree (the objectid of its root item).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TreeId(pub u64);

impl TreeId {
    /// Tree of root items for every other tree.
    pub const ROOT: TreeId = TreeId(1);
    /// Extent (allocation/reference) tree.
    pub const EXTENT: TreeId = TreeId(2);
    /// Chunk mapping tree; its root lives in the superblock.
    pub const CHUNK: TreeId = TreeId(3);
    /// Per-device extent tree.
    pub const DEV: TreeId = TreeId(4);
    /// Default file tree.
    pub const FS: TreeId = TreeId(5);
    /// Data checksum tree.
    pub const CSUM: TreeId = TreeId(7);
    /// First objectid available to subvolume trees.
    pub const FIRST_SUBVOLUME: u64 = 256;

    /// Returns true for the two trees whose roots are published through the
    /// superblock instead of a root item.
    pub fn is_superblock_rooted(self) -> bool {
        self == TreeId::ROOT || self == TreeId::CHUNK
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Item type discriminants stored in [`Key::item_type`].
pub mod item_type {
    /// Inode record.
    pub const INODE_ITEM: u8 = 0x01;
    /// Back-reference from an inode to its parent directory.
    pub const INODE_REF: u8 = 0x0c;
    /// Extended attribute.
    pub const XATTR_ITEM: u8 = 0x18;
    /// Directory entry hashed by name.
    pub const DIR_ITEM: u8 = 0x54;
    /// Directory entry keyed by insertion index.
    pub const DIR_INDEX: u8 = 0x60;
    /// File extent mapping.
    pub const EXTENT_DATA: u8 = 0x6c;
    /// Run of data checksums.
    pub const EXTENT_CSUM: u8 = 0x80;
    /// Root record of a logical tree.
    pub const ROOT_ITEM: u8 = 0x84;
    /// Extent record keyed by byte size.
    pub const EXTENT_ITEM: u8 = 0xa8;
    /// Skinny tree-block extent record keyed by level.
    pub const METADATA_ITEM: u8 = 0xa9;
    /// Inline reference: tree block owned by a root.
    pub const TREE_BLOCK_REF: u8 = 0xb0;
    /// Inline reference: data owned by (root, inode, offset).
    pub const EXTENT_DATA_REF: u8 = 0xb2;
    /// Legacy standalone reference record.
    pub const EXTENT_REF_V0: u8 = 0xb4;
    /// Inline reference: tree block shared through a parent block.
    pub const SHARED_BLOCK_REF: u8 = 0xb6;
    /// Inline reference: data shared through a parent block.
    pub const SHARED_DATA_REF: u8 = 0xb8;
    /// Per-chunk usage record.
    pub const BLOCK_GROUP_ITEM: u8 = 0xc0;
    /// Physical range of a device owned by a chunk.
    pub const DEV_EXTENT: u8 = 0xcc;
    /// Device description.
    pub const DEV_ITEM: u8 = 0xd8;
    /// Chunk mapping.
    pub const CHUNK_ITEM: u8 = 0xe4;
}

/// Well-known objectids that are not tree ids.
pub mod objectid {
    /// Objectid of device items in the chunk tree.
    pub const DEV_ITEMS: u64 = 1;
    /// Objectid of chunk items in the chunk tree.
    pub const FIRST_CHUNK_TREE: u64 = 256;
    /// Objectid under which checksum items are stored.
    pub const CSUM: u64 = (-10i64) as u64;
    /// Objectid of free-space cache headers in the root tree.
    pub const FREE_SPACE: u64 = (-11i64) as u64;
    /// First inode number handed to regular files.
    pub const FIRST_FREE: u64 = 256;
}

/// Ordered key of a tree item.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Key {
    /// Primary ordering component.
    pub objectid: u64,
    /// Item type discriminant, see [`item_type`].
    pub item_type: u8,
    /// Type-specific offset.
    pub offset: u64,
}

impl Key {
    /// Encoded length of a key.
    pub const LEN: usize = 17;
    /// Greatest possible key.
    pub const MAX: Key = Key {
        objectid: u64::MAX,
        item_type: u8::MAX,
        offset: u64::MAX,
    };

    /// Builds a key from its components.
    pub const fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }

    /// Writes the little-endian encoding into `dst[..17]`.
    pub fn encode(&self, dst: &mut [u8]) {
        dst[0..8].copy_from_slice(&self.objectid.to_le_bytes());
        dst[8] = self.item_type;
        dst[9..17].copy_from_slice(&self.offset.to_le_bytes());
    }

    /// Reads a key from `src[..17]`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < Self::LEN {
            return Err(ArborError::Corruption("key truncated"));
        }
        Ok(Self {
            objectid: read_u64(src, 0),
            item_type: src[8],
            offset: read_u64(src, 9),
        })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:#x}, {:#04x}, {:#x})",
            self.objectid, self.item_type, self.offset
        )
    }
}

pub(crate) fn read_u64(src: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&src[at..at + 8]);
    u64::from_le_bytes(raw)
}

pub(crate) fn read_u32(src: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&src[at..at + 4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn read_u16(src: &[u8], at: usize) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&src[at..at + 2]);
    u16::from_le_bytes(raw)
}

/// Errors produced by the filesystem engine.
#[derive(thiserror::Error, Debug)]
pub enum ArborError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A write to a specific device failed.
    #[error("write to device {dev_id} failed: {source}")]
    DeviceWrite {
        /// Failing device.
        dev_id: u64,
        /// Error reported by the device.
        #[source]
        source: std::io::Error,
    },
    /// On-disk data failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A requested item does not exist.
    #[error("not found")]
    NotFound,
    /// Disk or metadata space is exhausted.
    #[error("no space: {0}")]
    NoSpace(&'static str),
    /// An in-memory invariant was found broken.
    #[error("internal inconsistency: {0}")]
    Inconsistent(String),
    /// The on-disk layout uses a feature this build cannot handle.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// The filesystem is mounted read-only.
    #[error("filesystem is read-only")]
    ReadOnly,
}

impl ArborError {
    /// Returns true for errors that a later commit attempt may not hit again.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, ArborError::NoSpace(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ArborError>;
