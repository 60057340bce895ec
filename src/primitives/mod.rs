//! Low-level primitives shared by the storage layer.
//!
//! Includes little-endian byte codecs and the positioned device I/O layer
//! with its batched write dispatch.

/// Byte-level encoding and decoding helpers.
pub mod bytes;

/// Device I/O and write dispatch.
///
/// The commit engine hands buffers and physical offsets to this layer and
/// blocks once on the batch completion.
pub mod io;
