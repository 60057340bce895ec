#![forbid(unsafe_code)]

/// Incremental checksum interface.
pub trait Checksum {
    /// Clears accumulated state.
    fn reset(&mut self);
    /// Feeds bytes into the checksum.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed since the last reset.
    fn finalize(&self) -> u32;
}

/// CRC32 checksum backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Length of the checksum field that opens every node and superblock.
pub const CSUM_FIELD_LEN: usize = 32;

/// Checksums a block whose first [`CSUM_FIELD_LEN`] bytes hold the checksum.
pub fn block_crc32(block: &[u8]) -> u32 {
    let mut c = Crc32Fast::default();
    c.update(&block[CSUM_FIELD_LEN..]);
    c.finalize()
}

/// Stamps the checksum of `block` into its leading checksum field.
pub fn stamp_block_crc32(block: &mut [u8]) {
    let crc = block_crc32(block);
    block[..CSUM_FIELD_LEN].fill(0);
    block[..4].copy_from_slice(&crc.to_le_bytes());
}

/// Returns true when the stored checksum matches the block contents.
pub fn verify_block_crc32(block: &[u8]) -> bool {
    if block.len() < CSUM_FIELD_LEN {
        return false;
    }
    let mut stored = [0u8; 4];
    stored.copy_from_slice(&block[..4]);
    u32::from_le_bytes(stored) == block_crc32(block)
}

/// Checksum word of one data sector.
pub fn sector_crc32(sector: &[u8]) -> u32 {
    let mut c = Crc32Fast::default();
    c.update(sector);
    c.finalize()
}

/// Hash used to key directory entries by name.
pub fn name_hash(name: &[u8]) -> u64 {
    let mut c = Crc32Fast::default();
    c.update(name);
    c.finalize() as u64
}
