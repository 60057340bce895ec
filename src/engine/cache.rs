//! Self-hosted free-space cache.
//!
//! Each chunk may own a blob listing its free ranges (pinned ranges
//! included, since they are free once the commit lands). The blob lives in
//! a data extent owned by `(ROOT, FREE_SPACE, chunk_start)` and is described
//! by a [`FreeSpaceHeader`] in the root tree.
//!
//! Blob layout: `crc u32 | reserved u32 | generation u64 | count u64`
//! followed by `count` pairs of `(start u64, len u64)`. The crc covers every
//! byte after the crc field up to the last pair.

use tracing::{debug, warn};

use super::{FsState, Transaction};
use crate::primitives::bytes::{LeReader, LeWriter};
use crate::storage::chunk::Chunk;
use crate::storage::records::{DataRef, FreeSpaceHeader};
use crate::storage::space::{SpaceList, Span};
use crate::types::checksum::{Checksum, Crc32Fast};
use crate::types::{item_type, objectid, ArborError, Key, Result, TreeId};

const BLOB_HEADER_LEN: u64 = 24;
const PAIR_LEN: u64 = 16;
/// Entries of headroom added when a blob is (re)allocated.
const ENTRY_SLACK: u64 = 16;

/// Root-tree key of the cache header of the chunk at `chunk_offset`.
pub fn header_key(chunk_offset: u64) -> Key {
    Key::new(objectid::FREE_SPACE, 0, chunk_offset)
}

/// Owner recorded on a cache extent.
pub fn cache_owner(chunk_offset: u64) -> DataRef {
    DataRef {
        root: TreeId::ROOT.0,
        objectid: objectid::FREE_SPACE,
        offset: chunk_offset,
        count: 1,
    }
}

fn blob_len(entries: u64) -> u64 {
    BLOB_HEADER_LEN + PAIR_LEN * entries
}

fn round_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Serializes `spans` as a cache blob padded with zeroes to `len` bytes.
pub fn encode_blob(generation: u64, spans: &[Span], len: u64) -> Result<Vec<u8>> {
    let used = blob_len(spans.len() as u64);
    if used > len {
        return Err(ArborError::NoSpace("free-space cache blob outgrew its extent"));
    }
    let mut w = LeWriter::with_capacity(len as usize);
    w.u32(0).u32(0).u64(generation).u64(spans.len() as u64);
    for span in spans {
        w.u64(span.start).u64(span.len);
    }
    let mut blob = w.finish();
    let mut crc = Crc32Fast::default();
    crc.update(&blob[4..]);
    blob[..4].copy_from_slice(&crc.finalize().to_le_bytes());
    blob.resize(len as usize, 0);
    Ok(blob)
}

/// Parses a cache blob, returning its generation and free ranges.
pub fn decode_blob(blob: &[u8]) -> Result<(u64, SpaceList)> {
    let mut r = LeReader::new(blob, "free space cache blob truncated");
    let stored_crc = r.u32()?;
    let _reserved = r.u32()?;
    let generation = r.u64()?;
    let count = r.u64()?;
    let used = count
        .checked_mul(PAIR_LEN)
        .and_then(|pairs| pairs.checked_add(BLOB_HEADER_LEN))
        .filter(|used| *used <= blob.len() as u64)
        .ok_or(ArborError::Corruption("free space cache entry count out of range"))?;
    let mut crc = Crc32Fast::default();
    crc.update(&blob[4..used as usize]);
    if crc.finalize() != stored_crc {
        return Err(ArborError::Corruption("free space cache checksum mismatch"));
    }
    let mut spans = Vec::with_capacity(count as usize);
    for _ in 0..count {
        spans.push(Span::new(r.u64()?, r.u64()?));
    }
    Ok((generation, SpaceList::from_spans(spans)?))
}

impl FsState {
    /// Ranges a chunk's cache blob records.
    fn cache_entries(chunk: &Chunk) -> Result<SpaceList> {
        chunk.free.union(&chunk.pinned)
    }

    /// Cache blobs of every chunk owning a cache, as `(address, bytes)`.
    pub fn cache_blobs(&self) -> Result<Vec<(u64, Vec<u8>)>> {
        let mut blobs = Vec::new();
        for chunk in &self.chunks {
            let chunk = chunk.lock();
            let Some(cache) = chunk.cache else {
                continue;
            };
            let entries = Self::cache_entries(&chunk)?;
            blobs.push((
                cache.start,
                encode_blob(self.generation, entries.spans(), cache.len)?,
            ));
        }
        Ok(blobs)
    }

    /// Returns pinned ranges to the free lists once the superblock naming
    /// the new generation is durable.
    ///
    /// A chunk left holding nothing but its own cache object stays marked
    /// changed so the next commit drops it. Returns whether any did.
    pub fn clean_space_cache(&mut self) -> Result<bool> {
        let mut emptied = false;
        for chunk in &self.chunks {
            let mut chunk = chunk.lock();
            let mut pinned = std::mem::take(&mut chunk.pinned);
            chunk.free.absorb(&mut pinned)?;
            let own_cache = chunk
                .cache
                .filter(|span| chunk.contains(span.start, span.len))
                .map_or(0, |span| span.len);
            chunk.changed = chunk.used <= own_cache;
            emptied |= chunk.changed;
        }
        self.fresh.clear();
        Ok(emptied)
    }
}

impl Transaction<'_> {
    /// Allocates or grows cache extents of changed chunks and refreshes
    /// every cache header.
    ///
    /// Returns `true` when an extent was (re)allocated or dropped, which
    /// forces another pass of the fixed-point loop.
    pub fn allocate_cache(&mut self) -> Result<bool> {
        if !self.state.space_cache {
            return Ok(false);
        }
        let sector = self.state.sector_size();
        let mut changed = false;
        for idx in 0..self.state.chunks.len() {
            let (offset, needed, current) = {
                let chunk = self.state.chunks[idx].lock();
                if !chunk.changed {
                    continue;
                }
                let entries = (chunk.free.spans().len() + chunk.pinned.spans().len()) as u64;
                (chunk.offset, blob_len(entries), chunk.cache)
            };
            if current.is_some_and(|span| span.len >= needed) {
                continue;
            }
            let entries = (needed - BLOB_HEADER_LEN) / PAIR_LEN;
            let len = round_up(blob_len(entries + ENTRY_SLACK), sector);
            let owner = cache_owner(offset);
            match self.state.find_data_space(len) {
                Some((data_idx, at)) => {
                    self.state.claim_extent(data_idx, at, len)?;
                    self.state.adjust_data_ref(at, len, owner, 1, true)?;
                    if let Some(old) = current {
                        self.state
                            .adjust_data_ref(old.start, old.len, owner, -1, true)?;
                    }
                    self.state.chunks[idx].lock().cache = Some(Span::new(at, len));
                    debug!(chunk = offset, address = at, len, "cache.allocated");
                    changed = true;
                }
                None => {
                    warn!(chunk = offset, len, "cache.allocation_skipped");
                    if let Some(old) = current {
                        let chunk = self.state.chunks[idx].lock().clone();
                        self.remove_cache_object(&chunk, old)?;
                        self.state.chunks[idx].lock().cache = None;
                        changed = true;
                    }
                }
            }
        }

        let generation = self.generation();
        for idx in 0..self.state.chunks.len() {
            let (offset, cache) = {
                let chunk = self.state.chunks[idx].lock();
                (chunk.offset, chunk.cache)
            };
            let Some(cache) = cache else {
                continue;
            };
            let header = FreeSpaceHeader {
                address: cache.start,
                length: cache.len,
                generation,
            }
            .encode();
            let key = header_key(offset);
            let current = self.state.trees.lookup(TreeId::ROOT, &key)?;
            if current.is_some_and(|c| self.state.trees.data_at(c) == header.as_slice()) {
                continue;
            }
            self.state
                .trees
                .upsert_item(TreeId::ROOT, key, header, self.undo)?;
        }
        Ok(changed)
    }

    /// Deletes `chunk`'s cache header and releases the extent at `cache`.
    ///
    /// A cache hosted inside the chunk itself goes away with the chunk, so
    /// only its extent record is removed.
    pub fn remove_cache_object(&mut self, chunk: &Chunk, cache: Span) -> Result<()> {
        let key = header_key(chunk.offset);
        match self.state.trees.lookup(TreeId::ROOT, &key)? {
            Some(cursor) => {
                self.state.trees.delete_item(cursor, self.undo)?;
            }
            None => debug!(chunk = chunk.offset, "cache.header_absent"),
        }
        if chunk.contains(cache.start, cache.len) {
            let record = Key::new(cache.start, item_type::EXTENT_ITEM, cache.len);
            if let Some(cursor) = self.state.trees.lookup(TreeId::EXTENT, &record)? {
                self.state.trees.delete_item(cursor, self.undo)?;
            }
            return Ok(());
        }
        self.state
            .adjust_data_ref(cache.start, cache.len, cache_owner(chunk.offset), -1, true)
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::engine::testutil;
    use crate::storage::undo::UndoLog;

    #[test]
    fn blob_roundtrip_and_crc() {
        let spans = [Span::new(0x10_0000, 0x4000), Span::new(0x20_0000, 0x1000)];
        let blob = encode_blob(7, &spans, 4096).unwrap();
        assert_eq!(blob.len(), 4096);
        let (generation, list) = decode_blob(&blob).unwrap();
        assert_eq!(generation, 7);
        assert_eq!(list.spans(), &spans);

        let mut bad = blob.clone();
        bad[30] ^= 0xff;
        assert!(matches!(decode_blob(&bad), Err(ArborError::Corruption(_))));
    }

    #[test]
    fn oversized_entry_list_is_rejected() {
        let spans: Vec<Span> = (0..300).map(|i| Span::new(i * 0x10000, 0x1000)).collect();
        assert!(matches!(
            encode_blob(1, &spans, 4096),
            Err(ArborError::NoSpace(_))
        ));
    }

    #[test]
    fn changed_chunk_gets_cache_and_header() {
        let mut state = testutil::state(1, 256 << 20, 4096);
        state.alloc_data_extent(4096).unwrap();
        let mut undo = UndoLog::new();
        let runs = Mutex::new(Vec::new());
        let mut tx = Transaction::new(&mut state, &mut undo, &runs);
        assert!(tx.allocate_cache().unwrap());
        let cache = tx.state.chunks[0].lock().cache.unwrap();
        let header = tx
            .state
            .trees
            .lookup(TreeId::ROOT, &header_key(tx.state.chunks[0].lock().offset))
            .unwrap()
            .map(|c| FreeSpaceHeader::decode(tx.state.trees.data_at(c)).unwrap())
            .unwrap();
        assert_eq!(header.address, cache.start);
        assert_eq!(header.generation, 1);

        // Flushing the cache's own reference settles the loop.
        tx.update_chunk_usage().unwrap();
        assert!(!tx.allocate_cache().unwrap());
    }

    #[test]
    fn no_data_chunk_skips_cache() {
        let mut state = testutil::state(1, 256 << 20, 4096);
        let idx = state.alloc_chunk(state.policy.tree_flags(TreeId::FS)).unwrap();
        let mut undo = UndoLog::new();
        let runs = Mutex::new(Vec::new());
        let mut tx = Transaction::new(&mut state, &mut undo, &runs);
        // Nothing allocated and nothing removed, so the loop may settle.
        assert!(!tx.allocate_cache().unwrap());
        assert!(!tx.allocate_cache().unwrap());
        assert!(tx.state.chunks[idx].lock().cache.is_none());
    }

    #[test]
    fn clean_space_cache_releases_pins_and_flags_empty_chunks() {
        let mut state = testutil::state(1, 256 << 20, 4096);
        let address = state.alloc_data_extent(8192).unwrap();
        state.fresh.clear();
        state.release_extent(address, 8192).unwrap();
        let idx = state.chunk_for(address).unwrap();
        assert!(!state.chunks[idx].lock().free.contains(address, 8192));
        assert!(state.clean_space_cache().unwrap());
        let chunk = state.chunks[idx].lock();
        assert!(chunk.free.contains(address, 8192));
        assert!(chunk.pinned.is_empty());
        // emptied, so the next commit drops it
        assert!(chunk.changed);
    }
}
