#![forbid(unsafe_code)]

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::trace;

use crate::types::{ArborError, Result};

mod dispatch;
mod mem;

pub use dispatch::{Completion, DispatchContext};
pub use mem::MemFileIo;

/// Positioned I/O against one block device or image file.
///
/// Offsets are physical byte offsets on the device. Short transfers are
/// errors: a read past the end reports `UnexpectedEof`, a write that makes no
/// progress reports `WriteZero`.
pub trait FileIo: Send + Sync + 'static {
    /// Fills `dst` from the device starting at `off`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` to the device starting at `off`.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Flushes written data to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Size of the device in bytes.
    fn len(&self) -> Result<u64>;
    /// True when the device has no capacity.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(unix)]
fn pread(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, dst, off)
}

#[cfg(unix)]
fn pwrite(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, src, off)
}

#[cfg(windows)]
fn pread(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, dst, off)
}

#[cfg(windows)]
fn pwrite(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, src, off)
}

#[cfg(not(any(unix, windows)))]
fn pread(_file: &File, _dst: &mut [u8], _off: u64) -> io::Result<usize> {
    Err(io::Error::new(ErrorKind::Unsupported, "positioned reads unavailable"))
}

#[cfg(not(any(unix, windows)))]
fn pwrite(_file: &File, _src: &[u8], _off: u64) -> io::Result<usize> {
    Err(io::Error::new(ErrorKind::Unsupported, "positioned writes unavailable"))
}

/// Device backed by an image file or a block device node.
#[derive(Clone)]
pub struct StdFileIo {
    file: Arc<File>,
    path: PathBuf,
}

impl StdFileIo {
    /// Opens an existing image for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self::wrap(file, path))
    }

    /// Creates (or truncates) an image file of `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        Ok(Self::wrap(file, path))
    }

    fn wrap(file: File, path: &Path) -> Self {
        Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
        }
    }

    /// Path the device was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for StdFileIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdFileIo").field("path", &self.path).finish()
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, mut off: u64, mut dst: &mut [u8]) -> Result<()> {
        trace!(path = %self.path.display(), off, len = dst.len(), "io.read");
        while !dst.is_empty() {
            let n = pread(&self.file, dst, off)?;
            if n == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "read past end of device").into());
            }
            dst = &mut std::mem::take(&mut dst)[n..];
            off += n as u64;
        }
        Ok(())
    }

    fn write_at(&self, mut off: u64, mut src: &[u8]) -> Result<()> {
        trace!(path = %self.path.display(), off, len = src.len(), "io.write");
        while !src.is_empty() {
            let n = pwrite(&self.file, src, off)?;
            if n == 0 {
                return Err(io::Error::new(ErrorKind::WriteZero, "device accepted no bytes").into());
            }
            src = &src[n..];
            off += n as u64;
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        self.file.sync_all().map_err(ArborError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}
