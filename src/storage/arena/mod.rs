//! In-memory tree nodes addressed by arena handles.
//!
//! Parent links are plain [`NodeId`] back-references. Children are owned by
//! the arena, not by their parent, so split, merge and height changes only
//! rewrite handles.

use std::ops::{Index, IndexMut};

use crate::types::{Key, TreeId};

pub mod codec;

/// Length of the on-disk node header.
pub const NODE_HEADER_LEN: usize = 101;
/// Length of a leaf item descriptor (key, data offset, data size).
pub const LEAF_ITEM_LEN: usize = Key::LEN + 8;
/// Length of an internal pointer entry (key, child address, child generation).
pub const KEY_PTR_LEN: usize = Key::LEN + 16;
/// Highest level a tree may reach.
pub const MAX_LEVEL: u8 = 7;

/// Header flag: node has been written at least once.
pub const NODE_FLAG_WRITTEN: u64 = 1 << 0;
/// Header flag: extent references of this block use the current format.
pub const NODE_FLAG_MIXED_BACKREF: u64 = 1 << 56;
/// Header flag: data extents of this block are referenced through it as parent.
pub const NODE_FLAG_SHARED_BACKREF: u64 = 1 << 1;

/// Stable handle of a node inside a [`NodeArena`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(pub u32);

/// Pointer entry of an internal node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildPointer {
    /// Arena handle of the child.
    pub child: NodeId,
    /// Child address as last written.
    pub address: u64,
    /// Child generation as last written.
    pub generation: u64,
}

/// Payload of an item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemBody {
    /// Inline leaf data.
    Leaf(Vec<u8>),
    /// Child pointer of an internal node.
    Pointer(ChildPointer),
}

/// One keyed entry of a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    /// Item key.
    pub key: Key,
    /// Item payload.
    pub body: ItemBody,
    /// Set when the item was added during the running transaction.
    pub inserted: bool,
}

impl Item {
    /// Creates a leaf item.
    pub fn leaf(key: Key, data: Vec<u8>) -> Self {
        Self {
            key,
            body: ItemBody::Leaf(data),
            inserted: false,
        }
    }

    /// Creates an internal pointer item.
    pub fn pointer(key: Key, child: NodeId, address: u64, generation: u64) -> Self {
        Self {
            key,
            body: ItemBody::Pointer(ChildPointer {
                child,
                address,
                generation,
            }),
            inserted: false,
        }
    }

    /// Serialized footprint of this item inside a node.
    pub fn size(&self) -> usize {
        match &self.body {
            ItemBody::Leaf(data) => LEAF_ITEM_LEN + data.len(),
            ItemBody::Pointer(_) => KEY_PTR_LEN,
        }
    }

    /// Leaf payload, if this is a leaf item.
    pub fn data(&self) -> Option<&[u8]> {
        match &self.body {
            ItemBody::Leaf(data) => Some(data),
            ItemBody::Pointer(_) => None,
        }
    }

    /// Child pointer, if this is an internal item.
    pub fn pointer_ref(&self) -> Option<&ChildPointer> {
        match &self.body {
            ItemBody::Pointer(ptr) => Some(ptr),
            ItemBody::Leaf(_) => None,
        }
    }

    /// Mutable child pointer, if this is an internal item.
    pub fn pointer_mut(&mut self) -> Option<&mut ChildPointer> {
        match &mut self.body {
            ItemBody::Pointer(ptr) => Some(ptr),
            ItemBody::Leaf(_) => None,
        }
    }
}

/// A tree block held in memory.
#[derive(Clone, Debug)]
pub struct Node {
    /// Owning logical tree.
    pub tree: TreeId,
    /// Height above the leaves.
    pub level: u8,
    /// Ordered, unique-keyed items.
    pub items: Vec<Item>,
    /// Parent node, `None` for a root.
    pub parent: Option<NodeId>,
    /// Address the node was read from or last written to.
    pub address: Option<u64>,
    /// Address assigned during the running transaction.
    pub new_address: Option<u64>,
    /// Generation stamped when last written.
    pub generation: u64,
    /// Header flags.
    pub flags: u64,
    /// Set when the node must be rewritten by the next commit.
    pub dirty: bool,
}

impl Node {
    /// Creates an empty, dirty node with no address.
    pub fn new(tree: TreeId, level: u8, generation: u64) -> Self {
        Self {
            tree,
            level,
            items: Vec::new(),
            parent: None,
            address: None,
            new_address: None,
            generation,
            flags: NODE_FLAG_MIXED_BACKREF,
            dirty: true,
        }
    }

    /// True for level-0 nodes.
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// Serialized payload size (excluding the header).
    pub fn size(&self) -> usize {
        self.items.iter().map(Item::size).sum()
    }

    /// Key of the first item.
    pub fn first_key(&self) -> Option<Key> {
        self.items.first().map(|item| item.key)
    }

    /// Slot of the pointer item referring to `child`.
    pub fn slot_of_child(&self, child: NodeId) -> Option<usize> {
        self.items
            .iter()
            .position(|item| item.pointer_ref().is_some_and(|ptr| ptr.child == child))
    }

    /// Children referenced by this node's pointer items, in key order.
    pub fn children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.items
            .iter()
            .filter_map(|item| item.pointer_ref().map(|ptr| ptr.child))
    }

    /// Address the next write of this node will land on.
    pub fn effective_address(&self) -> Option<u64> {
        self.new_address.or(self.address)
    }
}

/// Payload bytes available in a node of `node_size`.
pub fn node_capacity(node_size: u32) -> usize {
    node_size as usize - NODE_HEADER_LEN
}

/// Owner of every in-memory node.
#[derive(Default, Debug)]
pub struct NodeArena {
    slots: Vec<Option<Node>>,
    free: Vec<u32>,
    live: usize,
}

impl NodeArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `node` and returns its handle.
    pub fn alloc(&mut self, node: Node) -> NodeId {
        self.live += 1;
        if let Some(slot) = self.free.pop() {
            self.slots[slot as usize] = Some(node);
            return NodeId(slot);
        }
        self.slots.push(Some(node));
        NodeId((self.slots.len() - 1) as u32)
    }

    /// Removes a node, returning it if the handle was live.
    pub fn release(&mut self, id: NodeId) -> Option<Node> {
        let node = self.slots.get_mut(id.0 as usize)?.take()?;
        self.free.push(id.0);
        self.live -= 1;
        Some(node)
    }

    /// Returns the node behind `id` if it is live.
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots.get(id.0 as usize).and_then(Option::as_ref)
    }

    /// Mutable variant of [`NodeArena::get`].
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.live
    }

    /// True when no node is live.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Iterates over live nodes.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|node| (NodeId(idx as u32), node)))
    }

    /// Handles of dirty nodes at `level`.
    pub fn dirty_at_level(&self, level: u8) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, node)| node.dirty && node.level == level)
            .map(|(id, _)| id)
            .collect()
    }

    /// Highest level among dirty nodes.
    pub fn max_dirty_level(&self) -> Option<u8> {
        self.iter()
            .filter(|(_, node)| node.dirty)
            .map(|(_, node)| node.level)
            .max()
    }

    /// Walks parent links up to the root of `id`'s tree.
    pub fn root_of(&self, mut id: NodeId) -> NodeId {
        while let Some(parent) = self.get(id).and_then(|node| node.parent) {
            id = parent;
        }
        id
    }

    /// Every node of the subtree rooted at `root`, parents before children.
    pub fn subtree(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.get(id) {
                out.push(id);
                stack.extend(node.children());
            }
        }
        out
    }
}

impl Index<NodeId> for NodeArena {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        match self.get(id) {
            Some(node) => node,
            None => panic!("stale node handle {:?}", id),
        }
    }
}

impl IndexMut<NodeId> for NodeArena {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        match self.get_mut(id) {
            Some(node) => node,
            None => panic!("stale node handle {:?}", id),
        }
    }
}
