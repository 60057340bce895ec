#![forbid(unsafe_code)]

//! Offline administration of arborfs images.
//!
//! These helpers back the `arborfs` binary: creating and formatting image
//! files, describing a filesystem's superblock and chunk layout, and
//! verifying its on-disk structures.

mod error;
mod inspect;
mod mkfs;
mod util;
mod verify;

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Read-only description of an image set.
pub use inspect::{
    inspect, tree_name, BackupSection, ChunkSection, DeviceSection, InspectReport, StripeSection,
    SuperblockSection, TreeSection,
};

/// Image creation.
pub use mkfs::{mkfs, MkfsReport};

/// Structural verification of an image set.
pub use verify::{verify, VerifyCounts, VerifyFinding, VerifyLevel, VerifyReport, VerifySeverity};

/// Utility functions for opening image files.
pub use util::{create_images, open_images};
