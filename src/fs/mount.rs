//! Mounting: from superblock copies to a fully loaded in-memory state.
//!
//! The newest valid superblock names the chunk and root trees. System chunks
//! from its bootstrap array make the chunk tree readable; the chunk tree
//! makes every other tree readable. Free lists come from the free-space
//! cache when its generation matches the superblock and are rebuilt from the
//! extent tree otherwise.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{Filesystem, MountOptions};
use crate::engine::cache::{decode_blob, header_key};
use crate::engine::lifecycle::initial_device_space;
use crate::engine::{ChunkPolicy, FsState};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::storage::arena::codec::{decode_node, DecodedBody};
use crate::storage::arena::{Item, Node, NodeId};
use crate::storage::chunk::{block_group, Chunk, Device, Profile};
use crate::storage::records::{BlockGroupItem, ChunkItem, DevExtent, DevItem, FreeSpaceHeader, RootItem};
use crate::storage::space::{SpaceList, Span};
use crate::storage::stripe::read_logical;
use crate::storage::superblock::{load_superblock, Superblock};
use crate::types::{item_type, objectid, ArborError, Key, Result, TreeId};

impl Filesystem {
    /// Mounts the filesystem spread over `devices`.
    pub fn open(devices: Vec<Arc<dyn FileIo>>, options: MountOptions) -> Result<Arc<Self>> {
        let state = load_state(devices, &options)?;
        info!(
            generation = state.superblock.generation,
            devices = state.devices.len(),
            chunks = state.chunks.len(),
            trees = state.trees.trees.len(),
            read_only = options.read_only,
            "fs.mounted"
        );
        Ok(Self::from_state(state, options))
    }

    /// Mounts the filesystem whose devices are the image files at `paths`.
    pub fn open_paths<P: AsRef<Path>>(paths: &[P], options: MountOptions) -> Result<Arc<Self>> {
        let mut devices: Vec<Arc<dyn FileIo>> = Vec::with_capacity(paths.len());
        for path in paths {
            devices.push(Arc::new(StdFileIo::open(path)?));
        }
        Self::open(devices, options)
    }
}

/// Reads the state of the filesystem on `devices` without mounting it.
pub(crate) fn load_state(devices: Vec<Arc<dyn FileIo>>, options: &MountOptions) -> Result<FsState> {
    if devices.is_empty() {
        return Err(ArborError::Invalid("no devices given"));
    }
    let mut copies: Vec<(Arc<dyn FileIo>, Superblock)> = Vec::with_capacity(devices.len());
    for io in devices {
        let sb = load_superblock(io.as_ref())?;
        copies.push((io, sb));
    }
    let newest = copies
        .iter()
        .map(|(_, sb)| sb)
        .max_by_key(|sb| sb.generation)
        .cloned()
        .ok_or(ArborError::Invalid("no devices given"))?;
    if copies.iter().any(|(_, sb)| sb.fsid != newest.fsid) {
        return Err(ArborError::Invalid("devices belong to different filesystems"));
    }
    if newest.num_devices != copies.len() as u64 {
        return Err(ArborError::Unsupported("mounting with missing or extra devices"));
    }

    let mut state = FsState::new(newest.clone(), newest.generation + 1, ChunkPolicy::default());
    state.space_cache = options.space_cache;
    state.readonly = options.read_only;
    for (io, sb) in copies {
        if sb.generation != newest.generation {
            warn!(
                dev_id = sb.dev_item.dev_id,
                generation = sb.generation,
                newest = newest.generation,
                "mount.stale_device"
            );
        }
        let free = initial_device_space(sb.dev_item.total_bytes, state.policy.stripe_len)?;
        state.devices.push(Device {
            item: sb.dev_item,
            io,
            free,
        });
    }
    state.devices.sort_by_key(|d| d.id());

    for (offset, item) in newest.bootstrap_entries()? {
        state.chunks.push(Mutex::new(Chunk::from_item(offset, &item)));
    }
    let chunk_root = RootItem {
        bytenr: newest.chunk_root,
        level: newest.chunk_root_level,
        generation: newest.chunk_root_generation,
        generation_v2: newest.chunk_root_generation,
        refs: 1,
        ..RootItem::default()
    };
    load_tree(&mut state, TreeId::CHUNK, chunk_root)?;
    load_chunks(&mut state)?;

    let root_root = RootItem {
        bytenr: newest.root,
        level: newest.root_level,
        generation: newest.generation,
        generation_v2: newest.generation,
        refs: 1,
        ..RootItem::default()
    };
    load_tree(&mut state, TreeId::ROOT, root_root)?;
    let from = Key::new(0, item_type::ROOT_ITEM, 0);
    let to = Key::new(u64::MAX, item_type::ROOT_ITEM, u64::MAX);
    for (key, data) in state.trees.collect_range(TreeId::ROOT, &from, &to)? {
        let tree = TreeId(key.objectid);
        if key.item_type != item_type::ROOT_ITEM || tree.is_superblock_rooted() {
            continue;
        }
        load_tree(&mut state, tree, RootItem::decode(&data)?)?;
    }
    for required in [TreeId::EXTENT, TreeId::DEV, TreeId::FS, TreeId::CSUM] {
        if !state.trees.trees.contains_key(&required) {
            return Err(ArborError::Corruption("well-known tree missing"));
        }
    }

    load_block_groups(&mut state)?;
    load_free_space(&mut state, options.trust_space_cache)?;
    load_device_space(&mut state)?;
    state.policy = infer_policy(&state);
    Ok(state)
}

fn load_tree(state: &mut FsState, tree: TreeId, root_item: RootItem) -> Result<()> {
    let root = load_node(state, tree, root_item.bytenr, root_item.level, None)?;
    debug!(tree = tree.0, address = root_item.bytenr, level = root_item.level, "mount.tree_loaded");
    state.trees.adopt_tree(tree, root, root_item)
}

fn load_node(
    state: &mut FsState,
    tree: TreeId,
    address: u64,
    level: u8,
    parent: Option<NodeId>,
) -> Result<NodeId> {
    let mut buf = vec![0u8; state.node_size() as usize];
    {
        let idx = state
            .chunk_index(address)
            .ok_or(ArborError::Corruption("tree block outside every chunk"))?;
        let chunk = state.chunks[idx].lock();
        read_logical(&chunk, &state.devices, address, &mut buf)?;
    }
    let decoded = decode_node(&buf)?;
    let header = &decoded.header;
    if header.address != address {
        return Err(ArborError::Corruption("tree block written at another address"));
    }
    if header.fsid != state.superblock.fsid {
        return Err(ArborError::Corruption("tree block of another filesystem"));
    }
    if header.level != level {
        return Err(ArborError::Corruption("tree block level mismatch"));
    }
    if header.owner != tree {
        return Err(ArborError::Corruption("tree block owned by another tree"));
    }

    let mut node = Node::new(tree, level, header.generation);
    node.address = Some(address);
    node.flags = header.flags;
    node.parent = parent;
    node.dirty = false;
    let id = state.trees.arena.alloc(node);
    for (key, body) in decoded.items {
        let item = match body {
            DecodedBody::Leaf(data) => Item::leaf(key, data),
            DecodedBody::Pointer {
                address: child_address,
                generation,
            } => {
                if level == 0 {
                    return Err(ArborError::Corruption("pointer in a leaf"));
                }
                let child = load_node(state, tree, child_address, level - 1, Some(id))?;
                Item::pointer(key, child, child_address, generation)
            }
        };
        state.trees.arena[id].items.push(item);
    }
    Ok(id)
}

/// Replaces the bootstrap chunks with the full chunk table and refreshes
/// device records from the chunk tree.
fn load_chunks(state: &mut FsState) -> Result<()> {
    let from = Key::new(objectid::FIRST_CHUNK_TREE, item_type::CHUNK_ITEM, 0);
    let to = Key::new(objectid::FIRST_CHUNK_TREE, item_type::CHUNK_ITEM, u64::MAX);
    let mut chunks = Vec::new();
    for (key, data) in state.trees.collect_range(TreeId::CHUNK, &from, &to)? {
        chunks.push(Chunk::from_item(key.offset, &ChunkItem::decode(&data)?));
    }
    chunks.sort_by_key(|c| c.offset);
    state.chunks = chunks.into_iter().map(Mutex::new).collect();

    let from = Key::new(objectid::DEV_ITEMS, item_type::DEV_ITEM, 0);
    let to = Key::new(objectid::DEV_ITEMS, item_type::DEV_ITEM, u64::MAX);
    for (key, data) in state.trees.collect_range(TreeId::CHUNK, &from, &to)? {
        let item = DevItem::decode(&data)?;
        let idx = state.device_index(key.offset).map_err(|_| {
            ArborError::Unsupported("chunk tree names a device that was not given")
        })?;
        state.devices[idx].item = item;
    }
    Ok(())
}

fn load_block_groups(state: &mut FsState) -> Result<()> {
    for chunk in &state.chunks {
        let mut chunk = chunk.lock();
        let key = Key::new(chunk.offset, item_type::BLOCK_GROUP_ITEM, chunk.size);
        let cursor = state
            .trees
            .lookup(TreeId::EXTENT, &key)?
            .ok_or(ArborError::Corruption("chunk without block group item"))?;
        let group = BlockGroupItem::decode(state.trees.data_at(cursor))?;
        chunk.used = group.used;
        chunk.oldused = group.used;
    }
    Ok(())
}

fn load_free_space(state: &mut FsState, trust_cache: bool) -> Result<()> {
    let cache_generation = state.superblock.cache_generation;
    let mut rebuilt = 0usize;
    for idx in 0..state.chunks.len() {
        let offset = state.chunks[idx].lock().offset;
        let header = match state.trees.lookup(TreeId::ROOT, &header_key(offset))? {
            Some(cursor) => Some(FreeSpaceHeader::decode(state.trees.data_at(cursor))?),
            None => None,
        };
        let (header, span) = match header {
            Some(h) => match cache_span(state, &h) {
                Ok(span) => (Some(h), Some(span)),
                Err(err) => {
                    warn!(chunk = offset, error = %err, "mount.cache_header_invalid");
                    (None, recorded_extent(state, h.address)?)
                }
            },
            None => (None, None),
        };
        let cached = match (header, span) {
            (Some(h), Some(span)) if trust_cache && h.generation == cache_generation => {
                match read_cache(state, span, h.generation) {
                    Ok(list) => Some(list),
                    Err(err) => {
                        warn!(chunk = offset, error = %err, "mount.cache_unreadable");
                        None
                    }
                }
            }
            _ => None,
        };
        let mut chunk = state.chunks[idx].lock();
        chunk.cache = span;
        match cached {
            Some(free) if free.total() <= chunk.size => chunk.free = free,
            _ => {
                chunk.free = rebuild_free_space(state, &chunk)?;
                chunk.changed = true;
                rebuilt += 1;
            }
        }
    }
    debug!(chunks = state.chunks.len(), rebuilt, "mount.free_space_loaded");
    Ok(())
}

/// The cache extent `header` names, which must lie inside one chunk.
fn cache_span(state: &FsState, header: &FreeSpaceHeader) -> Result<Span> {
    let idx = state
        .chunk_index(header.address)
        .ok_or(ArborError::Corruption("cache extent outside every chunk"))?;
    if !state.chunks[idx].lock().contains(header.address, header.length) {
        return Err(ArborError::Corruption("free-space cache larger than its chunk"));
    }
    Ok(Span::new(header.address, header.length))
}

/// Extent recorded at `address` in the extent tree, if any.
fn recorded_extent(state: &FsState, address: u64) -> Result<Option<Span>> {
    let from = Key::new(address, item_type::EXTENT_ITEM, 0);
    let to = Key::new(address, item_type::EXTENT_ITEM, u64::MAX);
    Ok(state
        .trees
        .collect_range(TreeId::EXTENT, &from, &to)?
        .first()
        .map(|(key, _)| Span::new(address, key.offset)))
}

fn read_cache(state: &FsState, span: Span, expected: u64) -> Result<SpaceList> {
    let idx = state
        .chunk_index(span.start)
        .ok_or(ArborError::Corruption("cache extent outside every chunk"))?;
    let mut blob = vec![0u8; span.len as usize];
    {
        let chunk = state.chunks[idx].lock();
        read_logical(&chunk, &state.devices, span.start, &mut blob)?;
    }
    let (generation, list) = decode_blob(&blob)?;
    if generation != expected {
        return Err(ArborError::Corruption("cache blob generation mismatch"));
    }
    Ok(list)
}

/// Free ranges of `chunk`: its whole range minus every extent record inside
/// it.
fn rebuild_free_space(state: &FsState, chunk: &Chunk) -> Result<SpaceList> {
    let mut free = SpaceList::new();
    free.add(chunk.offset, chunk.size)?;
    let from = Key::new(chunk.offset, 0, 0);
    let to = Key::new(chunk.offset + chunk.size - 1, u8::MAX, u64::MAX);
    let node_size = state.node_size();
    for (key, _) in state.trees.collect_range(TreeId::EXTENT, &from, &to)? {
        let len = match key.item_type {
            item_type::EXTENT_ITEM => key.offset,
            item_type::METADATA_ITEM => node_size,
            _ => continue,
        };
        free.remove(key.objectid, len)
            .map_err(|_| ArborError::Corruption("overlapping extent records"))?;
    }
    Ok(free)
}

fn load_device_space(state: &mut FsState) -> Result<()> {
    for idx in 0..state.devices.len() {
        let dev_id = state.devices[idx].id();
        let from = Key::new(dev_id, item_type::DEV_EXTENT, 0);
        let to = Key::new(dev_id, item_type::DEV_EXTENT, u64::MAX);
        for (key, data) in state.trees.collect_range(TreeId::DEV, &from, &to)? {
            let extent = DevExtent::decode(&data)?;
            state.devices[idx]
                .free
                .remove(key.offset, extent.length)
                .map_err(|_| ArborError::Corruption("overlapping device extents"))?;
        }
    }
    Ok(())
}

/// Chunk policy matching the profiles of the chunks already present.
fn infer_policy(state: &FsState) -> ChunkPolicy {
    let mut policy = ChunkPolicy::default();
    for chunk in &state.chunks {
        let chunk = chunk.lock();
        let profile = Profile::from_flags(chunk.flags);
        if chunk.flags & block_group::SYSTEM != 0 {
            policy.system = profile;
        } else if chunk.flags & block_group::DATA != 0 {
            policy.data = profile;
        } else {
            policy.metadata = profile;
        }
    }
    policy
}
