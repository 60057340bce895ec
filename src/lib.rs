//! arborfs: the transaction-commit engine of a copy-on-write B-tree
//! filesystem.
//!
//! A mounted [`fs::Filesystem`] accumulates dirty tree nodes, extent
//! reference changes and checksum runs; [`engine::Transaction::commit`]
//! turns them into a new crash-consistent generation whose only in-place
//! write is the superblock. The [`admin`] module and the `arborfs` binary
//! format, inspect and verify image files.

#![warn(missing_docs)]

pub mod admin;
pub mod engine;
pub mod fs;
pub mod primitives;
pub mod storage;
pub mod types;

pub use fs::{Filesystem, FormatOptions, MountOptions};
pub use types::{ArborError, Result, TreeId};
