use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use super::FileIo;
use crate::types::{ArborError, Result};

const PAGE: u64 = 4096;

/// Sparse in-memory device of a fixed size.
///
/// Unwritten ranges read back as zeroes. Writes can be made to fail on demand
/// so callers can exercise their I/O error paths.
pub struct MemFileIo {
    pages: RwLock<HashMap<u64, Box<[u8]>>>,
    len: u64,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemFileIo {
    /// Creates a zero-filled device of `len` bytes.
    pub fn new(len: u64) -> Self {
        Self {
            pages: RwLock::new(HashMap::new()),
            len,
            fail_writes: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        }
    }

    /// Makes every following write fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `write_at` calls so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_bounds(&self, off: u64, len: usize, kind: ErrorKind) -> Result<()> {
        let end = off
            .checked_add(len as u64)
            .ok_or(ArborError::Invalid("offset overflow"))?;
        if end > self.len {
            return Err(io::Error::new(kind, "access past end of device").into());
        }
        Ok(())
    }
}

impl FileIo for MemFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.check_bounds(off, dst.len(), ErrorKind::UnexpectedEof)?;
        let pages = self.pages.read();
        let mut done = 0usize;
        while done < dst.len() {
            let pos = off + done as u64;
            let page_no = pos / PAGE;
            let in_page = (pos % PAGE) as usize;
            let take = (PAGE as usize - in_page).min(dst.len() - done);
            match pages.get(&page_no) {
                Some(page) => dst[done..done + take].copy_from_slice(&page[in_page..in_page + take]),
                None => dst[done..done + take].fill(0),
            }
            done += take;
        }
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(ErrorKind::Other, "injected write failure").into());
        }
        self.check_bounds(off, src.len(), ErrorKind::WriteZero)?;
        let mut pages = self.pages.write();
        let mut done = 0usize;
        while done < src.len() {
            let pos = off + done as u64;
            let page_no = pos / PAGE;
            let in_page = (pos % PAGE) as usize;
            let take = (PAGE as usize - in_page).min(src.len() - done);
            let page = pages
                .entry(page_no)
                .or_insert_with(|| vec![0u8; PAGE as usize].into_boxed_slice());
            page[in_page..in_page + take].copy_from_slice(&src[done..done + take]);
            done += take;
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unaligned_write_spans_pages() {
        let dev = MemFileIo::new(3 * PAGE);
        let data: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
        dev.write_at(1000, &data).unwrap();
        let mut back = vec![0u8; 6000];
        dev.read_at(1000, &mut back).unwrap();
        assert_eq!(back, data);
        let mut head = [1u8; 16];
        dev.read_at(0, &mut head).unwrap();
        assert_eq!(head, [0u8; 16]);
    }

    #[test]
    fn bounds_and_injected_failures() {
        let dev = MemFileIo::new(PAGE);
        assert!(dev.write_at(PAGE - 1, &[0, 0]).is_err());
        dev.set_fail_writes(true);
        assert!(dev.write_at(0, &[1]).is_err());
        dev.set_fail_writes(false);
        dev.write_at(0, &[1]).unwrap();
        assert_eq!(dev.write_count(), 1);
    }
}
