//! Codecs for the item payloads the commit engine reads and writes.

use crate::primitives::bytes::{LeReader, LeWriter};
use crate::types::{item_type, ArborError, Key, Result};

/// Extent flag: the extent holds file data.
pub const EXTENT_FLAG_DATA: u64 = 1;
/// Extent flag: the extent holds a tree block.
pub const EXTENT_FLAG_TREE_BLOCK: u64 = 2;

/// Root record of a logical tree, stored in the root tree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RootItem {
    /// Generation of the last root write.
    pub generation: u64,
    /// Root directory inode.
    pub root_dirid: u64,
    /// Address of the root node.
    pub bytenr: u64,
    /// Bytes of tree blocks owned by this tree.
    pub bytes_used: u64,
    /// Root flags.
    pub flags: u64,
    /// Reference count of the root.
    pub refs: u32,
    /// Level of the root node.
    pub level: u8,
    /// Copy of `generation`; zero on roots written by old versions.
    pub generation_v2: u64,
    /// Subvolume uuid.
    pub uuid: [u8; 16],
}

impl RootItem {
    /// Length of a full root item.
    pub const LEN: usize = 69;
    /// Length of a root item written by old versions.
    pub const LEGACY_LEN: usize = 45;

    /// Encodes the full-length record.
    pub fn encode(&self) -> Vec<u8> {
        LeWriter::with_capacity(Self::LEN)
            .u64(self.generation)
            .u64(self.root_dirid)
            .u64(self.bytenr)
            .u64(self.bytes_used)
            .u64(self.flags)
            .u32(self.refs)
            .u8(self.level)
            .u64(self.generation_v2)
            .bytes(&self.uuid)
            .finish()
    }

    /// Decodes either the full or the legacy short layout.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = LeReader::new(data, "root item truncated");
        let mut item = RootItem {
            generation: r.u64()?,
            root_dirid: r.u64()?,
            bytenr: r.u64()?,
            bytes_used: r.u64()?,
            flags: r.u64()?,
            refs: r.u32()?,
            level: r.u8()?,
            ..RootItem::default()
        };
        if data.len() >= Self::LEN {
            item.generation_v2 = r.u64()?;
            item.uuid = r.uuid()?;
        }
        Ok(item)
    }

    /// True when `data` uses the legacy short layout.
    pub fn is_short(data: &[u8]) -> bool {
        data.len() < Self::LEN
    }
}

/// Data reference: extent used by (root, inode, file offset).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataRef {
    /// Owning subvolume tree.
    pub root: u64,
    /// Inode number.
    pub objectid: u64,
    /// File offset the extent is mapped at (minus the extent offset).
    pub offset: u64,
    /// Number of references with this identity.
    pub count: u32,
}

impl DataRef {
    /// True when both refer to the same (root, inode, offset).
    pub fn same_owner(&self, other: &DataRef) -> bool {
        self.root == other.root && self.objectid == other.objectid && self.offset == other.offset
    }
}

/// Reference stored inline in an extent record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InlineRef {
    /// Tree block owned by a root.
    TreeBlock {
        /// Owning tree.
        root: u64,
    },
    /// Tree block referenced through a parent block.
    SharedBlock {
        /// Parent block address.
        parent: u64,
    },
    /// Data owned by a file.
    Data(DataRef),
    /// Data referenced through a parent leaf.
    SharedData {
        /// Parent leaf address.
        parent: u64,
        /// Number of references.
        count: u32,
    },
}

impl InlineRef {
    fn count(&self) -> u64 {
        match self {
            InlineRef::TreeBlock { .. } | InlineRef::SharedBlock { .. } => 1,
            InlineRef::Data(d) => d.count as u64,
            InlineRef::SharedData { count, .. } => *count as u64,
        }
    }
}

/// Current-format extent record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtentItem {
    /// Total reference count.
    pub refs: u64,
    /// Generation the extent was allocated in.
    pub generation: u64,
    /// `EXTENT_FLAG_*` bits.
    pub flags: u64,
    /// First key and level, present on non-skinny tree-block records.
    pub tree_block_info: Option<(Key, u8)>,
    /// Inline references.
    pub inline: Vec<InlineRef>,
}

impl ExtentItem {
    /// Record for a freshly allocated tree block owned by `root`.
    pub fn tree_block(root: u64, generation: u64) -> Self {
        Self {
            refs: 1,
            generation,
            flags: EXTENT_FLAG_TREE_BLOCK,
            tree_block_info: None,
            inline: vec![InlineRef::TreeBlock { root }],
        }
    }

    /// Record for a data extent with a single reference.
    pub fn data(data_ref: DataRef, generation: u64) -> Self {
        Self {
            refs: data_ref.count as u64,
            generation,
            flags: EXTENT_FLAG_DATA,
            tree_block_info: None,
            inline: vec![InlineRef::Data(data_ref)],
        }
    }

    /// Encodes the record.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = LeWriter::with_capacity(24 + self.inline.len() * 29);
        w.u64(self.refs).u64(self.generation).u64(self.flags);
        if let Some((key, level)) = &self.tree_block_info {
            w.key(key).u8(*level);
        }
        for r in &self.inline {
            match r {
                InlineRef::TreeBlock { root } => {
                    w.u8(item_type::TREE_BLOCK_REF).u64(*root);
                }
                InlineRef::SharedBlock { parent } => {
                    w.u8(item_type::SHARED_BLOCK_REF).u64(*parent);
                }
                InlineRef::Data(d) => {
                    w.u8(item_type::EXTENT_DATA_REF)
                        .u64(d.root)
                        .u64(d.objectid)
                        .u64(d.offset)
                        .u32(d.count);
                }
                InlineRef::SharedData { parent, count } => {
                    w.u8(item_type::SHARED_DATA_REF).u64(*parent).u32(*count);
                }
            }
        }
        w.finish()
    }

    /// Decodes a current-format record. `skinny` records never carry
    /// tree-block info.
    pub fn decode(data: &[u8], skinny: bool) -> Result<Self> {
        let mut r = LeReader::new(data, "extent item truncated");
        let refs = r.u64()?;
        let generation = r.u64()?;
        let flags = r.u64()?;
        let tree_block_info = if !skinny && flags & EXTENT_FLAG_TREE_BLOCK != 0 {
            Some((r.key()?, r.u8()?))
        } else {
            None
        };
        let mut inline = Vec::new();
        while r.remaining() > 0 {
            let kind = r.u8()?;
            let item = match kind {
                item_type::TREE_BLOCK_REF => InlineRef::TreeBlock { root: r.u64()? },
                item_type::SHARED_BLOCK_REF => InlineRef::SharedBlock { parent: r.u64()? },
                item_type::EXTENT_DATA_REF => InlineRef::Data(DataRef {
                    root: r.u64()?,
                    objectid: r.u64()?,
                    offset: r.u64()?,
                    count: r.u32()?,
                }),
                item_type::SHARED_DATA_REF => InlineRef::SharedData {
                    parent: r.u64()?,
                    count: r.u32()?,
                },
                _ => return Err(ArborError::Corruption("unknown inline extent ref")),
            };
            inline.push(item);
        }
        Ok(Self {
            refs,
            generation,
            flags,
            tree_block_info,
            inline,
        })
    }

    /// Sum of the counts of every inline reference.
    pub fn inline_total(&self) -> u64 {
        self.inline.iter().map(InlineRef::count).sum()
    }
}

/// An extent record as found in the extent tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExtentRecord {
    /// Current format.
    Current(ExtentItem),
    /// Legacy 4-byte record whose references live in `EXTENT_REF_V0` items.
    LegacyV0 {
        /// Reference count.
        refs: u32,
    },
}

impl ExtentRecord {
    /// Payload length of a legacy record.
    pub const LEGACY_LEN: usize = 4;

    /// Decodes either format.
    pub fn decode(data: &[u8], skinny: bool) -> Result<Self> {
        if data.len() == Self::LEGACY_LEN {
            let mut r = LeReader::new(data, "legacy extent item truncated");
            return Ok(ExtentRecord::LegacyV0 { refs: r.u32()? });
        }
        ExtentItem::decode(data, skinny).map(ExtentRecord::Current)
    }

    /// Reference count regardless of format.
    pub fn refs(&self) -> u64 {
        match self {
            ExtentRecord::Current(item) => item.refs,
            ExtentRecord::LegacyV0 { refs } => *refs as u64,
        }
    }
}

/// Encodes a legacy extent record.
pub fn encode_legacy_extent(refs: u32) -> Vec<u8> {
    LeWriter::default().u32(refs).finish()
}

/// Legacy standalone reference, keyed `(addr, EXTENT_REF_V0, parent)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtentRefV0 {
    /// Referencing root.
    pub root: u64,
    /// Generation of the reference.
    pub generation: u64,
    /// Referencing objectid (level for tree blocks).
    pub objectid: u64,
    /// Reference count.
    pub count: u32,
}

impl ExtentRefV0 {
    /// Encodes the record.
    pub fn encode(&self) -> Vec<u8> {
        LeWriter::with_capacity(28)
            .u64(self.root)
            .u64(self.generation)
            .u64(self.objectid)
            .u32(self.count)
            .finish()
    }

    /// Decodes the record.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = LeReader::new(data, "extent ref v0 truncated");
        Ok(Self {
            root: r.u64()?,
            generation: r.u64()?,
            objectid: r.u64()?,
            count: r.u32()?,
        })
    }
}

/// Usage record of a chunk, keyed `(chunk_start, BLOCK_GROUP_ITEM, size)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockGroupItem {
    /// Bytes in use.
    pub used: u64,
    /// Objectid of the chunk item.
    pub chunk_objectid: u64,
    /// Profile flags.
    pub flags: u64,
}

impl BlockGroupItem {
    /// Encoded length.
    pub const LEN: usize = 24;

    /// Encodes the record.
    pub fn encode(&self) -> Vec<u8> {
        LeWriter::with_capacity(Self::LEN)
            .u64(self.used)
            .u64(self.chunk_objectid)
            .u64(self.flags)
            .finish()
    }

    /// Decodes the record.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = LeReader::new(data, "block group item truncated");
        Ok(Self {
            used: r.u64()?,
            chunk_objectid: r.u64()?,
            flags: r.u64()?,
        })
    }
}

/// One stripe of a chunk item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StripeRecord {
    /// Device id.
    pub dev_id: u64,
    /// Physical offset on the device.
    pub offset: u64,
    /// Device uuid.
    pub dev_uuid: [u8; 16],
}

/// Chunk mapping, keyed `(FIRST_CHUNK_TREE, CHUNK_ITEM, chunk_start)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkItem {
    /// Logical length.
    pub length: u64,
    /// Owning tree (always the extent tree).
    pub owner: u64,
    /// Stripe length.
    pub stripe_len: u64,
    /// Profile flags.
    pub chunk_type: u64,
    /// I/O alignment.
    pub io_align: u32,
    /// I/O width.
    pub io_width: u32,
    /// Sector size.
    pub sector_size: u32,
    /// Sub-stripes (RAID10).
    pub sub_stripes: u16,
    /// Stripes.
    pub stripes: Vec<StripeRecord>,
}

impl ChunkItem {
    /// Length of the fixed part.
    pub const HEADER_LEN: usize = 48;
    /// Length of one stripe entry.
    pub const STRIPE_LEN: usize = 32;

    /// Encoded length.
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_LEN + self.stripes.len() * Self::STRIPE_LEN
    }

    /// Encodes the record.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = LeWriter::with_capacity(self.encoded_len());
        w.u64(self.length)
            .u64(self.owner)
            .u64(self.stripe_len)
            .u64(self.chunk_type)
            .u32(self.io_align)
            .u32(self.io_width)
            .u32(self.sector_size)
            .u16(self.stripes.len() as u16)
            .u16(self.sub_stripes);
        for s in &self.stripes {
            w.u64(s.dev_id).u64(s.offset).bytes(&s.dev_uuid);
        }
        w.finish()
    }

    /// Decodes the record.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = LeReader::new(data, "chunk item truncated");
        let length = r.u64()?;
        let owner = r.u64()?;
        let stripe_len = r.u64()?;
        let chunk_type = r.u64()?;
        let io_align = r.u32()?;
        let io_width = r.u32()?;
        let sector_size = r.u32()?;
        let num_stripes = r.u16()?;
        let sub_stripes = r.u16()?;
        if num_stripes == 0 {
            return Err(ArborError::Corruption("chunk item without stripes"));
        }
        let mut stripes = Vec::with_capacity(num_stripes as usize);
        for _ in 0..num_stripes {
            stripes.push(StripeRecord {
                dev_id: r.u64()?,
                offset: r.u64()?,
                dev_uuid: r.uuid()?,
            });
        }
        Ok(Self {
            length,
            owner,
            stripe_len,
            chunk_type,
            io_align,
            io_width,
            sector_size,
            sub_stripes,
            stripes,
        })
    }
}

/// Device description, keyed `(DEV_ITEMS, DEV_ITEM, dev_id)` and embedded in
/// each device's superblock.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DevItem {
    /// Device id.
    pub dev_id: u64,
    /// Usable size.
    pub total_bytes: u64,
    /// Bytes allocated to chunks.
    pub bytes_used: u64,
    /// I/O alignment.
    pub io_align: u32,
    /// I/O width.
    pub io_width: u32,
    /// Sector size.
    pub sector_size: u32,
    /// Device type.
    pub dev_type: u64,
    /// Generation the item was last updated in.
    pub generation: u64,
    /// Device uuid.
    pub uuid: [u8; 16],
    /// Filesystem uuid.
    pub fsid: [u8; 16],
}

impl DevItem {
    /// Encoded length.
    pub const LEN: usize = 84;

    /// Encodes the record.
    pub fn encode(&self) -> Vec<u8> {
        LeWriter::with_capacity(Self::LEN)
            .u64(self.dev_id)
            .u64(self.total_bytes)
            .u64(self.bytes_used)
            .u32(self.io_align)
            .u32(self.io_width)
            .u32(self.sector_size)
            .u64(self.dev_type)
            .u64(self.generation)
            .bytes(&self.uuid)
            .bytes(&self.fsid)
            .finish()
    }

    /// Decodes the record.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = LeReader::new(data, "dev item truncated");
        Ok(Self {
            dev_id: r.u64()?,
            total_bytes: r.u64()?,
            bytes_used: r.u64()?,
            io_align: r.u32()?,
            io_width: r.u32()?,
            sector_size: r.u32()?,
            dev_type: r.u64()?,
            generation: r.u64()?,
            uuid: r.uuid()?,
            fsid: r.uuid()?,
        })
    }
}

/// Physical range owned by a chunk, keyed `(dev_id, DEV_EXTENT, phys_offset)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DevExtent {
    /// Chunk tree id.
    pub chunk_tree: u64,
    /// Chunk objectid.
    pub chunk_objectid: u64,
    /// Logical start of the owning chunk.
    pub chunk_offset: u64,
    /// Length of the range.
    pub length: u64,
}

impl DevExtent {
    /// Encoded length.
    pub const LEN: usize = 32;

    /// Encodes the record.
    pub fn encode(&self) -> Vec<u8> {
        LeWriter::with_capacity(Self::LEN)
            .u64(self.chunk_tree)
            .u64(self.chunk_objectid)
            .u64(self.chunk_offset)
            .u64(self.length)
            .finish()
    }

    /// Decodes the record.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = LeReader::new(data, "dev extent truncated");
        Ok(Self {
            chunk_tree: r.u64()?,
            chunk_objectid: r.u64()?,
            chunk_offset: r.u64()?,
            length: r.u64()?,
        })
    }
}

/// Inode record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InodeItem {
    /// Generation the inode was created in.
    pub generation: u64,
    /// Generation of the last change.
    pub transid: u64,
    /// File size.
    pub size: u64,
    /// Bytes allocated.
    pub nbytes: u64,
    /// Link count.
    pub nlink: u32,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Mode bits.
    pub mode: u32,
    /// Inode flags.
    pub flags: u64,
    /// Change sequence number.
    pub sequence: u64,
}

impl InodeItem {
    /// Encoded length.
    pub const LEN: usize = 64;

    /// Encodes the record.
    pub fn encode(&self) -> Vec<u8> {
        LeWriter::with_capacity(Self::LEN)
            .u64(self.generation)
            .u64(self.transid)
            .u64(self.size)
            .u64(self.nbytes)
            .u32(self.nlink)
            .u32(self.uid)
            .u32(self.gid)
            .u32(self.mode)
            .u64(self.flags)
            .u64(self.sequence)
            .finish()
    }

    /// Decodes the record.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = LeReader::new(data, "inode item truncated");
        Ok(Self {
            generation: r.u64()?,
            transid: r.u64()?,
            size: r.u64()?,
            nbytes: r.u64()?,
            nlink: r.u32()?,
            uid: r.u32()?,
            gid: r.u32()?,
            mode: r.u32()?,
            flags: r.u64()?,
            sequence: r.u64()?,
        })
    }
}

/// Directory entry payload shared by `DIR_ITEM` and `DIR_INDEX`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirItem {
    /// Key of the target inode item.
    pub location: Key,
    /// Generation the entry was written in.
    pub transid: u64,
    /// File type of the target.
    pub file_type: u8,
    /// Entry name.
    pub name: Vec<u8>,
}

impl DirItem {
    /// Encodes the record.
    pub fn encode(&self) -> Vec<u8> {
        LeWriter::with_capacity(30 + self.name.len())
            .key(&self.location)
            .u64(self.transid)
            .u16(0)
            .u16(self.name.len() as u16)
            .u8(self.file_type)
            .bytes(&self.name)
            .finish()
    }

    /// Decodes the record.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = LeReader::new(data, "dir item truncated");
        let location = r.key()?;
        let transid = r.u64()?;
        let _data_len = r.u16()?;
        let name_len = r.u16()? as usize;
        let file_type = r.u8()?;
        let name = r.bytes(name_len)?.to_vec();
        Ok(Self {
            location,
            transid,
            file_type,
            name,
        })
    }
}

/// Back-reference from an inode to a directory, keyed
/// `(inode, INODE_REF, parent_dir)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InodeRef {
    /// Directory index of the entry.
    pub index: u64,
    /// Entry name.
    pub name: Vec<u8>,
}

impl InodeRef {
    /// Encodes the record.
    pub fn encode(&self) -> Vec<u8> {
        LeWriter::with_capacity(10 + self.name.len())
            .u64(self.index)
            .u16(self.name.len() as u16)
            .bytes(&self.name)
            .finish()
    }

    /// Decodes the record.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = LeReader::new(data, "inode ref truncated");
        let index = r.u64()?;
        let len = r.u16()? as usize;
        Ok(Self {
            index,
            name: r.bytes(len)?.to_vec(),
        })
    }
}

/// File extent kind.
pub const FILE_EXTENT_INLINE: u8 = 0;
/// File extent kind.
pub const FILE_EXTENT_REGULAR: u8 = 1;
/// File extent kind.
pub const FILE_EXTENT_PREALLOC: u8 = 2;

/// File extent mapping, keyed `(inode, EXTENT_DATA, file_offset)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileExtentItem {
    /// Generation of the write.
    pub generation: u64,
    /// Uncompressed length.
    pub ram_bytes: u64,
    /// `FILE_EXTENT_*` kind.
    pub extent_type: u8,
    /// Address of the data extent (regular/prealloc).
    pub disk_bytenr: u64,
    /// Size of the data extent.
    pub disk_num_bytes: u64,
    /// Offset into the data extent.
    pub offset: u64,
    /// Bytes of the extent mapped into the file.
    pub num_bytes: u64,
    /// Inline file data.
    pub inline_data: Vec<u8>,
}

impl FileExtentItem {
    const FIXED_LEN: usize = 21;

    /// Encodes the record.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = LeWriter::with_capacity(Self::FIXED_LEN + 32 + self.inline_data.len());
        w.u64(self.generation)
            .u64(self.ram_bytes)
            .u8(0)
            .u8(0)
            .u16(0)
            .u8(self.extent_type);
        if self.extent_type == FILE_EXTENT_INLINE {
            w.bytes(&self.inline_data);
        } else {
            w.u64(self.disk_bytenr)
                .u64(self.disk_num_bytes)
                .u64(self.offset)
                .u64(self.num_bytes);
        }
        w.finish()
    }

    /// Decodes the record.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = LeReader::new(data, "file extent item truncated");
        let generation = r.u64()?;
        let ram_bytes = r.u64()?;
        let _compression = r.u8()?;
        let _encryption = r.u8()?;
        let _other = r.u16()?;
        let extent_type = r.u8()?;
        let mut item = Self {
            generation,
            ram_bytes,
            extent_type,
            disk_bytenr: 0,
            disk_num_bytes: 0,
            offset: 0,
            num_bytes: 0,
            inline_data: Vec::new(),
        };
        if extent_type == FILE_EXTENT_INLINE {
            item.inline_data = r.bytes(r.remaining())?.to_vec();
        } else {
            item.disk_bytenr = r.u64()?;
            item.disk_num_bytes = r.u64()?;
            item.offset = r.u64()?;
            item.num_bytes = r.u64()?;
        }
        Ok(item)
    }

    /// True when this maps a real on-disk data extent.
    pub fn references_extent(&self) -> bool {
        self.extent_type != FILE_EXTENT_INLINE && self.disk_bytenr != 0
    }

    /// Reference this mapping holds on its data extent, for the item keyed
    /// `key` in tree `root`.
    pub fn data_ref(&self, root: u64, key: &Key) -> DataRef {
        DataRef {
            root,
            objectid: key.objectid,
            offset: key.offset.wrapping_sub(self.offset),
            count: 1,
        }
    }
}

/// Header of a chunk's free-space cache, keyed
/// `(FREE_SPACE, 0, chunk_start)` in the root tree.
///
/// The entry count and checksum live in the blob itself, so the header only
/// changes when the blob moves or its generation advances.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FreeSpaceHeader {
    /// Address of the data extent holding the cache blob.
    pub address: u64,
    /// Length of that extent.
    pub length: u64,
    /// Generation the blob was written in.
    pub generation: u64,
}

impl FreeSpaceHeader {
    /// Encoded length.
    pub const LEN: usize = 24;

    /// Encodes the record.
    pub fn encode(&self) -> Vec<u8> {
        LeWriter::with_capacity(Self::LEN)
            .u64(self.address)
            .u64(self.length)
            .u64(self.generation)
            .finish()
    }

    /// Decodes the record.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = LeReader::new(data, "free space header truncated");
        Ok(Self {
            address: r.u64()?,
            length: r.u64()?,
            generation: r.u64()?,
        })
    }
}
