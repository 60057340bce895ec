//! On-disk node format.
//!
//! A node is a fixed-size block: a 101-byte header, then either leaf item
//! descriptors packed forward with their payloads packed backward from the
//! end of the block, or internal pointer entries packed forward.

use std::ops::Range;

use super::{ItemBody, Node, KEY_PTR_LEN, LEAF_ITEM_LEN, NODE_HEADER_LEN};
use crate::types::checksum::{stamp_block_crc32, verify_block_crc32};
use crate::types::{read_u32, read_u64, ArborError, Key, Result, TreeId};

mod header {
    use std::ops::Range;

    pub const FSID: Range<usize> = 32..48;
    pub const ADDRESS: Range<usize> = 48..56;
    pub const FLAGS: Range<usize> = 56..64;
    pub const CHUNK_TREE_UUID: Range<usize> = 64..80;
    pub const GENERATION: Range<usize> = 80..88;
    pub const OWNER: Range<usize> = 88..96;
    pub const NRITEMS: Range<usize> = 96..100;
    pub const LEVEL: usize = 100;
}

/// Decoded node header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeHeader {
    /// Filesystem uuid.
    pub fsid: [u8; 16],
    /// Logical address the node was written to.
    pub address: u64,
    /// Header flags.
    pub flags: u64,
    /// Chunk tree uuid.
    pub chunk_tree_uuid: [u8; 16],
    /// Generation of the write.
    pub generation: u64,
    /// Owning tree.
    pub owner: TreeId,
    /// Number of items.
    pub nritems: u32,
    /// Level above the leaves.
    pub level: u8,
}

/// Item body as read from disk, before children are attached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodedBody {
    /// Inline leaf data.
    Leaf(Vec<u8>),
    /// Child pointer.
    Pointer {
        /// Child address.
        address: u64,
        /// Child generation.
        generation: u64,
    },
}

/// A node read from disk.
#[derive(Clone, Debug)]
pub struct DecodedNode {
    /// Header fields.
    pub header: NodeHeader,
    /// Items in key order.
    pub items: Vec<(Key, DecodedBody)>,
}

/// Identity fields stamped into every node header.
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeStamp {
    /// Filesystem uuid.
    pub fsid: [u8; 16],
    /// Chunk tree uuid.
    pub chunk_tree_uuid: [u8; 16],
}

fn put(buf: &mut [u8], range: Range<usize>, bytes: &[u8]) {
    buf[range].copy_from_slice(bytes);
}

/// Serializes `node` into a `node_size` block addressed at `address`.
pub fn encode_node(
    node: &Node,
    address: u64,
    generation: u64,
    stamp: &NodeStamp,
    node_size: u32,
) -> Result<Vec<u8>> {
    let node_size = node_size as usize;
    let capacity = node_size - NODE_HEADER_LEN;
    if node.size() > capacity {
        return Err(ArborError::Inconsistent(format!(
            "node at {address:#x} holds {} bytes, capacity {capacity}",
            node.size()
        )));
    }
    let mut buf = vec![0u8; node_size];
    put(&mut buf, header::FSID, &stamp.fsid);
    put(&mut buf, header::ADDRESS, &address.to_le_bytes());
    put(&mut buf, header::FLAGS, &node.flags.to_le_bytes());
    put(&mut buf, header::CHUNK_TREE_UUID, &stamp.chunk_tree_uuid);
    put(&mut buf, header::GENERATION, &generation.to_le_bytes());
    put(&mut buf, header::OWNER, &node.tree.0.to_le_bytes());
    put(
        &mut buf,
        header::NRITEMS,
        &(node.items.len() as u32).to_le_bytes(),
    );
    buf[header::LEVEL] = node.level;

    let mut cursor = NODE_HEADER_LEN;
    let mut data_end = capacity;
    for item in &node.items {
        match &item.body {
            ItemBody::Leaf(data) => {
                if node.level != 0 {
                    return Err(ArborError::Inconsistent(format!(
                        "leaf payload in level {} node at {address:#x}",
                        node.level
                    )));
                }
                data_end -= data.len();
                item.key.encode(&mut buf[cursor..cursor + Key::LEN]);
                put(
                    &mut buf,
                    cursor + Key::LEN..cursor + Key::LEN + 4,
                    &(data_end as u32).to_le_bytes(),
                );
                put(
                    &mut buf,
                    cursor + Key::LEN + 4..cursor + LEAF_ITEM_LEN,
                    &(data.len() as u32).to_le_bytes(),
                );
                let at = NODE_HEADER_LEN + data_end;
                buf[at..at + data.len()].copy_from_slice(data);
                cursor += LEAF_ITEM_LEN;
            }
            ItemBody::Pointer(ptr) => {
                if node.level == 0 {
                    return Err(ArborError::Inconsistent(format!(
                        "child pointer in leaf at {address:#x}"
                    )));
                }
                item.key.encode(&mut buf[cursor..cursor + Key::LEN]);
                put(
                    &mut buf,
                    cursor + Key::LEN..cursor + Key::LEN + 8,
                    &ptr.address.to_le_bytes(),
                );
                put(
                    &mut buf,
                    cursor + Key::LEN + 8..cursor + KEY_PTR_LEN,
                    &ptr.generation.to_le_bytes(),
                );
                cursor += KEY_PTR_LEN;
            }
        }
    }
    stamp_block_crc32(&mut buf);
    Ok(buf)
}

/// Reads the header fields of a node block without validating items.
pub fn decode_header(buf: &[u8]) -> Result<NodeHeader> {
    if buf.len() < NODE_HEADER_LEN {
        return Err(ArborError::Corruption("node shorter than header"));
    }
    let mut fsid = [0u8; 16];
    fsid.copy_from_slice(&buf[header::FSID]);
    let mut chunk_tree_uuid = [0u8; 16];
    chunk_tree_uuid.copy_from_slice(&buf[header::CHUNK_TREE_UUID]);
    Ok(NodeHeader {
        fsid,
        address: read_u64(buf, header::ADDRESS.start),
        flags: read_u64(buf, header::FLAGS.start),
        chunk_tree_uuid,
        generation: read_u64(buf, header::GENERATION.start),
        owner: TreeId(read_u64(buf, header::OWNER.start)),
        nritems: read_u32(buf, header::NRITEMS.start),
        level: buf[header::LEVEL],
    })
}

/// Validates and decodes a node block.
pub fn decode_node(buf: &[u8]) -> Result<DecodedNode> {
    let header = decode_header(buf)?;
    if !verify_block_crc32(buf) {
        return Err(ArborError::Corruption("node checksum mismatch"));
    }
    let capacity = buf.len() - NODE_HEADER_LEN;
    let nritems = header.nritems as usize;
    let entry_len = if header.level == 0 {
        LEAF_ITEM_LEN
    } else {
        KEY_PTR_LEN
    };
    if nritems * entry_len > capacity {
        return Err(ArborError::Corruption("node item count exceeds capacity"));
    }
    let mut items = Vec::with_capacity(nritems);
    let mut cursor = NODE_HEADER_LEN;
    for _ in 0..nritems {
        let key = Key::decode(&buf[cursor..cursor + Key::LEN])?;
        let body = if header.level == 0 {
            let offset = read_u32(buf, cursor + Key::LEN) as usize;
            let size = read_u32(buf, cursor + Key::LEN + 4) as usize;
            if offset + size > capacity {
                return Err(ArborError::Corruption("leaf item data out of bounds"));
            }
            let at = NODE_HEADER_LEN + offset;
            DecodedBody::Leaf(buf[at..at + size].to_vec())
        } else {
            DecodedBody::Pointer {
                address: read_u64(buf, cursor + Key::LEN),
                generation: read_u64(buf, cursor + Key::LEN + 8),
            }
        };
        if let Some((prev, _)) = items.last() {
            if *prev >= key {
                return Err(ArborError::Corruption("node keys out of order"));
            }
        }
        items.push((key, body));
        cursor += entry_len;
    }
    Ok(DecodedNode { header, items })
}
