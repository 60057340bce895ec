//! Chunks, devices and redundancy profiles.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::records::{ChunkItem, DataRef, DevItem, StripeRecord};
use super::space::{Span, SpaceList};
use crate::primitives::io::FileIo;
use crate::types::{objectid, ArborError, Result, TreeId};

/// Block-group type and profile bits.
pub mod block_group {
    /// Chunk holds file data.
    pub const DATA: u64 = 1 << 0;
    /// Chunk holds the chunk tree.
    pub const SYSTEM: u64 = 1 << 1;
    /// Chunk holds tree blocks.
    pub const METADATA: u64 = 1 << 2;
    /// Striped.
    pub const RAID0: u64 = 1 << 3;
    /// Mirrored across two devices.
    pub const RAID1: u64 = 1 << 4;
    /// Duplicated on one device.
    pub const DUP: u64 = 1 << 5;
    /// Striped mirrors.
    pub const RAID10: u64 = 1 << 6;
    /// Single parity.
    pub const RAID5: u64 = 1 << 7;
    /// Double parity.
    pub const RAID6: u64 = 1 << 8;
    /// Mask of the type bits.
    pub const TYPE_MASK: u64 = DATA | SYSTEM | METADATA;
    /// Mask of the profile bits.
    pub const PROFILE_MASK: u64 = RAID0 | RAID1 | DUP | RAID10 | RAID5 | RAID6;
}

/// Redundancy profile of a chunk.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// One copy.
    Single,
    /// Two copies on the same device.
    Dup,
    /// Striped, no redundancy.
    Raid0,
    /// Two copies on different devices.
    Raid1,
    /// Striped mirrors.
    Raid10,
    /// Striped with one parity stripe per row.
    Raid5,
    /// Striped with two parity stripes per row.
    Raid6,
}

impl Profile {
    /// Decodes the profile bits of a block-group flag word.
    pub fn from_flags(flags: u64) -> Profile {
        use block_group::*;
        match flags & PROFILE_MASK {
            f if f & RAID10 != 0 => Profile::Raid10,
            f if f & RAID6 != 0 => Profile::Raid6,
            f if f & RAID5 != 0 => Profile::Raid5,
            f if f & RAID1 != 0 => Profile::Raid1,
            f if f & RAID0 != 0 => Profile::Raid0,
            f if f & DUP != 0 => Profile::Dup,
            _ => Profile::Single,
        }
    }

    /// Profile bits of this profile.
    pub fn flags(self) -> u64 {
        use block_group::*;
        match self {
            Profile::Single => 0,
            Profile::Dup => DUP,
            Profile::Raid0 => RAID0,
            Profile::Raid1 => RAID1,
            Profile::Raid10 => RAID10,
            Profile::Raid5 => RAID5,
            Profile::Raid6 => RAID6,
        }
    }

    /// Factor applied to a chunk's used bytes when accounting the global
    /// used-byte counter.
    pub fn usage_multiplier(self, num_stripes: u16) -> u64 {
        match self {
            Profile::Single | Profile::Raid0 => 1,
            Profile::Raid1 | Profile::Dup | Profile::Raid10 => 2,
            Profile::Raid5 | Profile::Raid6 => num_stripes as u64,
        }
    }

    /// Divisor turning a chunk's logical size into its per-device stripe size.
    pub fn stripe_factor(self, num_stripes: u16, sub_stripes: u16) -> u64 {
        let n = num_stripes.max(1) as u64;
        match self {
            Profile::Raid0 => n,
            Profile::Raid10 => n / sub_stripes.max(1) as u64,
            Profile::Raid5 => n - 1,
            Profile::Raid6 => n - 2,
            Profile::Single | Profile::Dup | Profile::Raid1 => 1,
        }
    }

    /// True for parity profiles.
    pub fn is_parity(self) -> bool {
        matches!(self, Profile::Raid5 | Profile::Raid6)
    }

    /// Stripe count and sub-stripe count for a chunk spread over `devices`
    /// devices, or `None` if the profile cannot be built on that many.
    pub fn layout(self, devices: usize) -> Option<(u16, u16)> {
        let n = devices as u16;
        match self {
            Profile::Single => (devices >= 1).then_some((1, 0)),
            Profile::Dup => (devices >= 1).then_some((2, 0)),
            Profile::Raid0 => (devices >= 2).then_some((n, 0)),
            Profile::Raid1 => (devices >= 2).then_some((2, 0)),
            Profile::Raid10 => (devices >= 4).then_some((n - n % 2, 2)),
            Profile::Raid5 => (devices >= 2).then_some((n, 0)),
            Profile::Raid6 => (devices >= 3).then_some((n, 0)),
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Profile::Single => "single",
            Profile::Dup => "dup",
            Profile::Raid0 => "raid0",
            Profile::Raid1 => "raid1",
            Profile::Raid10 => "raid10",
            Profile::Raid5 => "raid5",
            Profile::Raid6 => "raid6",
        };
        f.write_str(name)
    }
}

/// Reference changes of one data extent accumulated during a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangedExtent {
    /// Extent address.
    pub address: u64,
    /// Size the extent will be recorded with.
    pub size: u64,
    /// Size the on-disk record is keyed by.
    pub old_size: u64,
    /// Reference count after this transaction.
    pub count: u64,
    /// Reference count on disk.
    pub old_count: u64,
    /// The extent has no checksums to delete when freed.
    pub no_csum: bool,
    /// References after this transaction.
    pub refs: Vec<DataRef>,
    /// References on disk.
    pub old_refs: Vec<DataRef>,
}

impl ChangedExtent {
    /// Adjusts the new reference set of `(root, objectid, offset)` by `delta`.
    pub fn apply_delta(&mut self, root: u64, objectid: u64, offset: u64, delta: i64) -> Result<()> {
        let candidate = DataRef {
            root,
            objectid,
            offset,
            count: 0,
        };
        let idx = match self.refs.iter().position(|r| r.same_owner(&candidate)) {
            Some(idx) => idx,
            None => {
                self.refs.push(candidate);
                self.refs.len() - 1
            }
        };
        let current = self.refs[idx].count as i64;
        let next = current + delta;
        if next < 0 || (self.count as i64) + delta < 0 {
            return Err(ArborError::Inconsistent(format!(
                "extent {:#x} reference count underflow",
                self.address
            )));
        }
        self.refs[idx].count = next as u32;
        self.count = (self.count as i64 + delta) as u64;
        Ok(())
    }
}

/// A chunk: a logical allocation unit mapped onto device stripes.
#[derive(Clone, Debug)]
pub struct Chunk {
    /// Logical start.
    pub offset: u64,
    /// Logical length.
    pub size: u64,
    /// Type and profile bits.
    pub flags: u64,
    /// Stripe length.
    pub stripe_len: u64,
    /// Sub-stripes (RAID10).
    pub sub_stripes: u16,
    /// Device stripes.
    pub stripes: Vec<StripeRecord>,
    /// Sector size.
    pub sector_size: u32,
    /// Bytes in use.
    pub used: u64,
    /// Bytes in use as last persisted in the block-group item.
    pub oldused: u64,
    /// Ranges available to the allocator.
    pub free: SpaceList,
    /// Ranges freed this transaction that the last committed generation may
    /// still reference.
    pub pinned: SpaceList,
    /// Set until the chunk's records have been inserted.
    pub created: bool,
    /// Set when usage or free space changed during this transaction.
    pub changed: bool,
    /// Data extents with pending reference changes.
    pub changed_extents: Vec<ChangedExtent>,
    /// Extent holding this chunk's free-space cache blob.
    pub cache: Option<Span>,
}

impl Chunk {
    /// Rebuilds a chunk from its on-disk chunk item.
    pub fn from_item(offset: u64, item: &ChunkItem) -> Self {
        Self {
            offset,
            size: item.length,
            flags: item.chunk_type,
            stripe_len: item.stripe_len,
            sub_stripes: item.sub_stripes,
            stripes: item.stripes.clone(),
            sector_size: item.sector_size,
            used: 0,
            oldused: 0,
            free: SpaceList::new(),
            pinned: SpaceList::new(),
            created: false,
            changed: false,
            changed_extents: Vec::new(),
            cache: None,
        }
    }

    /// Chunk item describing this chunk.
    pub fn item(&self) -> ChunkItem {
        ChunkItem {
            length: self.size,
            owner: TreeId::EXTENT.0,
            stripe_len: self.stripe_len,
            chunk_type: self.flags,
            io_align: self.stripe_len as u32,
            io_width: self.stripe_len as u32,
            sector_size: self.sector_size,
            sub_stripes: self.sub_stripes,
            stripes: self.stripes.clone(),
        }
    }

    /// Redundancy profile.
    pub fn profile(&self) -> Profile {
        Profile::from_flags(self.flags)
    }

    /// Number of device stripes.
    pub fn num_stripes(&self) -> u16 {
        self.stripes.len() as u16
    }

    /// Per-device length of each stripe.
    pub fn device_stripe_len(&self) -> u64 {
        self.size
            / self
                .profile()
                .stripe_factor(self.num_stripes(), self.sub_stripes)
    }

    /// Factor for the global used-byte counter.
    pub fn usage_multiplier(&self) -> u64 {
        self.profile().usage_multiplier(self.num_stripes())
    }

    /// True when `[address, address + len)` lies inside the chunk.
    pub fn contains(&self, address: u64, len: u64) -> bool {
        address >= self.offset
            && address
                .checked_add(len)
                .is_some_and(|end| end <= self.offset + self.size)
    }

    /// True for system chunks.
    pub fn is_system(&self) -> bool {
        self.flags & block_group::SYSTEM != 0
    }

    /// True for chunks that hold file data.
    pub fn is_data(&self) -> bool {
        self.flags & block_group::DATA != 0
    }

    /// True when the chunk accepts allocations of the given type bits.
    pub fn matches_type(&self, type_flags: u64) -> bool {
        self.flags & block_group::TYPE_MASK == type_flags & block_group::TYPE_MASK
    }

    /// Objectid of the chunk item.
    pub fn chunk_objectid(&self) -> u64 {
        objectid::FIRST_CHUNK_TREE
    }

    /// Changed-extent entry for `address`, if any.
    pub fn changed_extent_mut(&mut self, address: u64) -> Option<&mut ChangedExtent> {
        self.changed_extents
            .iter_mut()
            .find(|ce| ce.address == address)
    }
}

/// A device backing one or more chunk stripes.
#[derive(Clone)]
pub struct Device {
    /// Device record.
    pub item: DevItem,
    /// Positioned I/O on the device.
    pub io: Arc<dyn FileIo>,
    /// Physical ranges not owned by any chunk.
    pub free: SpaceList,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("item", &self.item)
            .field("free", &self.free)
            .finish()
    }
}

impl Device {
    /// Device id.
    pub fn id(&self) -> u64 {
        self.item.dev_id
    }
}
