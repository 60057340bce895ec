//! On-disk structures and the in-memory model of the filesystem.
//!
//! Holds the node arena and codec, the ordered item store with its cursors,
//! the undo log, record codecs, free-space lists, chunks and devices, stripe
//! mapping, and the superblock.

/// Node arena and node serialization.
pub mod arena;
/// Chunks, redundancy profiles, and devices.
pub mod chunk;
/// Encodings of every tree item payload.
pub mod records;
/// Sorted free-range lists.
pub mod space;
/// Ordered key/value item store over the arena.
pub mod store;
/// Logical-to-physical stripe mapping.
pub mod stripe;
/// Superblock layout, backup roots, and the bootstrap chunk array.
pub mod superblock;
/// Inverse-operation log for item mutations.
pub mod undo;

pub use arena::{Node, NodeArena, NodeId};
pub use chunk::{Chunk, Device, Profile};
pub use space::{Span, SpaceList};
pub use store::{Cursor, TreeSet};
pub use superblock::Superblock;
pub use undo::UndoLog;
