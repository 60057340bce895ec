//! Ordered item store over the in-memory node arena.
//!
//! Inserts and deletes never rebalance. They only touch one leaf and mark it
//! dirty; node size invariants are restored by the commit's structural pass.

use std::collections::BTreeMap;

use super::arena::{node_capacity, Item, ItemBody, Node, NodeArena, NodeId};
use super::records::RootItem;
use super::undo::{UndoLog, UndoOp};
use crate::types::{ArborError, Key, Result, TreeId};

/// Position of an item in a leaf.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Cursor {
    /// Leaf holding the item.
    pub node: NodeId,
    /// Slot inside the leaf.
    pub slot: usize,
}

/// A named root and its bookkeeping.
#[derive(Clone, Debug)]
pub struct LogicalTree {
    /// Tree id.
    pub id: TreeId,
    /// Root node.
    pub root: NodeId,
    /// Root record as last published.
    pub root_item: RootItem,
}

/// All loaded logical trees and their nodes.
#[derive(Debug)]
pub struct TreeSet {
    /// Node storage.
    pub arena: NodeArena,
    /// Logical trees by id.
    pub trees: BTreeMap<TreeId, LogicalTree>,
    /// Node size in bytes.
    pub node_size: u32,
}

impl TreeSet {
    /// Empty set for nodes of `node_size` bytes.
    pub fn new(node_size: u32) -> Self {
        Self {
            arena: NodeArena::new(),
            trees: BTreeMap::new(),
            node_size,
        }
    }

    /// Payload capacity of one node.
    pub fn capacity(&self) -> usize {
        node_capacity(self.node_size)
    }

    /// Creates a tree consisting of one empty, dirty leaf.
    pub fn create_tree(&mut self, id: TreeId, generation: u64) -> Result<NodeId> {
        if self.trees.contains_key(&id) {
            return Err(ArborError::Invalid("tree already exists"));
        }
        let root = self.arena.alloc(Node::new(id, 0, generation));
        self.trees.insert(
            id,
            LogicalTree {
                id,
                root,
                root_item: RootItem {
                    generation,
                    refs: 1,
                    bytes_used: self.node_size as u64,
                    generation_v2: generation,
                    ..RootItem::default()
                },
            },
        );
        Ok(root)
    }

    /// Registers a tree whose nodes were already loaded into the arena.
    pub fn adopt_tree(&mut self, id: TreeId, root: NodeId, root_item: RootItem) -> Result<()> {
        if self.trees.contains_key(&id) {
            return Err(ArborError::Invalid("tree already exists"));
        }
        self.trees.insert(id, LogicalTree { id, root, root_item });
        Ok(())
    }

    /// Root node of `tree`.
    pub fn root(&self, tree: TreeId) -> Result<NodeId> {
        self.trees
            .get(&tree)
            .map(|t| t.root)
            .ok_or_else(|| ArborError::Inconsistent(format!("tree {tree} not loaded")))
    }

    /// Bookkeeping of `tree`.
    pub fn tree_mut(&mut self, tree: TreeId) -> Result<&mut LogicalTree> {
        self.trees
            .get_mut(&tree)
            .ok_or_else(|| ArborError::Inconsistent(format!("tree {tree} not loaded")))
    }

    fn descend(&self, tree: TreeId, key: &Key) -> Result<NodeId> {
        let mut id = self.root(tree)?;
        loop {
            let node = &self.arena[id];
            if node.is_leaf() {
                return Ok(id);
            }
            if node.items.is_empty() {
                return Err(ArborError::Inconsistent(format!(
                    "empty internal node in tree {tree}"
                )));
            }
            let idx = node.items.partition_point(|item| item.key <= *key);
            let slot = idx.saturating_sub(1);
            id = match &node.items[slot].body {
                ItemBody::Pointer(ptr) => ptr.child,
                ItemBody::Leaf(_) => {
                    return Err(ArborError::Inconsistent(
                        "leaf item in internal node".to_string(),
                    ))
                }
            };
        }
    }

    /// Greatest item with key `<= key`, or the first item of the tree when
    /// every key is greater. `None` only for an empty tree.
    pub fn search(&self, tree: TreeId, key: &Key) -> Result<Option<Cursor>> {
        let leaf = self.descend(tree, key)?;
        let idx = self.arena[leaf]
            .items
            .partition_point(|item| item.key <= *key);
        if idx > 0 {
            return Ok(Some(Cursor {
                node: leaf,
                slot: idx - 1,
            }));
        }
        if let Some(prev) = self.prev_leaf_item(leaf) {
            return Ok(Some(prev));
        }
        Ok(self.first_item_from(leaf))
    }

    /// Item with exactly `key`.
    pub fn lookup(&self, tree: TreeId, key: &Key) -> Result<Option<Cursor>> {
        Ok(self
            .search(tree, key)?
            .filter(|c| self.key_at(*c) == *key))
    }

    /// First item with key `>= key`.
    pub fn search_forward(&self, tree: TreeId, key: &Key) -> Result<Option<Cursor>> {
        let Some(cursor) = self.search(tree, key)? else {
            return Ok(None);
        };
        if self.key_at(cursor) >= *key {
            return Ok(Some(cursor));
        }
        Ok(self.next(cursor))
    }

    /// Key of the item under `cursor`.
    pub fn key_at(&self, cursor: Cursor) -> Key {
        self.arena[cursor.node].items[cursor.slot].key
    }

    /// Payload of the item under `cursor`.
    pub fn data_at(&self, cursor: Cursor) -> &[u8] {
        self.arena[cursor.node].items[cursor.slot]
            .data()
            .unwrap_or(&[])
    }

    /// Item after `cursor`, crossing leaves.
    pub fn next(&self, cursor: Cursor) -> Option<Cursor> {
        let node = self.arena.get(cursor.node)?;
        if cursor.slot + 1 < node.items.len() {
            return Some(Cursor {
                node: cursor.node,
                slot: cursor.slot + 1,
            });
        }
        let mut leaf = self.next_leaf(cursor.node)?;
        loop {
            if !self.arena[leaf].items.is_empty() {
                return Some(Cursor { node: leaf, slot: 0 });
            }
            leaf = self.next_leaf(leaf)?;
        }
    }

    /// Item before `cursor`, crossing leaves.
    pub fn prev(&self, cursor: Cursor) -> Option<Cursor> {
        if cursor.slot > 0 {
            return Some(Cursor {
                node: cursor.node,
                slot: cursor.slot - 1,
            });
        }
        self.prev_leaf_item(cursor.node)
    }

    fn prev_leaf_item(&self, leaf: NodeId) -> Option<Cursor> {
        let mut leaf = self.prev_leaf(leaf)?;
        loop {
            let len = self.arena[leaf].items.len();
            if len > 0 {
                return Some(Cursor {
                    node: leaf,
                    slot: len - 1,
                });
            }
            leaf = self.prev_leaf(leaf)?;
        }
    }

    fn first_item_from(&self, mut leaf: NodeId) -> Option<Cursor> {
        loop {
            if !self.arena[leaf].items.is_empty() {
                return Some(Cursor { node: leaf, slot: 0 });
            }
            leaf = self.next_leaf(leaf)?;
        }
    }

    fn sibling(&self, mut id: NodeId, forward: bool) -> Option<NodeId> {
        let mut depth = 0usize;
        loop {
            let parent = self.arena.get(id)?.parent?;
            let slot = self.arena[parent].slot_of_child(id)?;
            let len = self.arena[parent].items.len();
            let target = if forward {
                (slot + 1 < len).then_some(slot + 1)
            } else {
                slot.checked_sub(1)
            };
            if let Some(target) = target {
                let mut node = self.arena[parent].items[target].pointer_ref()?.child;
                for _ in 0..depth {
                    let items = &self.arena[node].items;
                    let pick = if forward { items.first() } else { items.last() };
                    node = pick?.pointer_ref()?.child;
                }
                return Some(node);
            }
            id = parent;
            depth += 1;
        }
    }

    /// Leaf to the right of `leaf`.
    pub fn next_leaf(&self, leaf: NodeId) -> Option<NodeId> {
        self.sibling(leaf, true)
    }

    /// Leaf to the left of `leaf`.
    pub fn prev_leaf(&self, leaf: NodeId) -> Option<NodeId> {
        self.sibling(leaf, false)
    }

    /// Every item of `tree` with a key in `[from, to]`, in order.
    pub fn collect_range(&self, tree: TreeId, from: &Key, to: &Key) -> Result<Vec<(Key, Vec<u8>)>> {
        let mut out = Vec::new();
        let mut cursor = self.search_forward(tree, from)?;
        while let Some(c) = cursor {
            let key = self.key_at(c);
            if key > *to {
                break;
            }
            out.push((key, self.data_at(c).to_vec()));
            cursor = self.next(c);
        }
        Ok(out)
    }

    pub(crate) fn insert_raw(&mut self, tree: TreeId, key: Key, data: Vec<u8>) -> Result<NodeId> {
        let leaf = self.descend(tree, &key)?;
        let node = &mut self.arena[leaf];
        let idx = node.items.partition_point(|item| item.key < key);
        if node.items.get(idx).is_some_and(|item| item.key == key) {
            return Err(ArborError::Inconsistent(format!(
                "duplicate key {key} in tree {tree}"
            )));
        }
        let mut item = Item::leaf(key, data);
        item.inserted = true;
        node.items.insert(idx, item);
        node.dirty = true;
        Ok(leaf)
    }

    pub(crate) fn delete_raw(&mut self, cursor: Cursor) -> Result<(Key, Vec<u8>)> {
        let node = self
            .arena
            .get_mut(cursor.node)
            .ok_or_else(|| ArborError::Inconsistent("cursor on released node".to_string()))?;
        if cursor.slot >= node.items.len() || !node.is_leaf() {
            return Err(ArborError::Inconsistent("cursor out of range".to_string()));
        }
        let item = node.items.remove(cursor.slot);
        node.dirty = true;
        let data = match item.body {
            ItemBody::Leaf(data) => data,
            ItemBody::Pointer(_) => Vec::new(),
        };
        Ok((item.key, data))
    }

    /// Inserts `(key, data)` into `tree`, returning the leaf that holds it.
    pub fn insert_item(
        &mut self,
        tree: TreeId,
        key: Key,
        data: Vec<u8>,
        undo: &mut UndoLog,
    ) -> Result<NodeId> {
        let leaf = self.insert_raw(tree, key, data)?;
        undo.record(UndoOp::Inserted { tree, key });
        Ok(leaf)
    }

    /// Deletes the item under `cursor`, returning its key and payload.
    pub fn delete_item(&mut self, cursor: Cursor, undo: &mut UndoLog) -> Result<(Key, Vec<u8>)> {
        let tree = self.arena[cursor.node].tree;
        let (key, data) = self.delete_raw(cursor)?;
        undo.record(UndoOp::Deleted {
            tree,
            key,
            data: data.clone(),
        });
        Ok((key, data))
    }

    /// Deletes the item with exactly `key`; a missing item is an
    /// inconsistency.
    pub fn delete_key(&mut self, tree: TreeId, key: &Key, undo: &mut UndoLog) -> Result<Vec<u8>> {
        let cursor = self.lookup(tree, key)?.ok_or_else(|| {
            ArborError::Inconsistent(format!("item {key} missing from tree {tree}"))
        })?;
        Ok(self.delete_item(cursor, undo)?.1)
    }

    /// Replaces the payload of the item with exactly `key`, inserting it if
    /// absent.
    pub fn upsert_item(
        &mut self,
        tree: TreeId,
        key: Key,
        data: Vec<u8>,
        undo: &mut UndoLog,
    ) -> Result<NodeId> {
        if let Some(cursor) = self.lookup(tree, &key)? {
            self.delete_item(cursor, undo)?;
        }
        self.insert_item(tree, key, data, undo)
    }

    /// Number of items in every leaf of `tree`.
    pub fn item_count(&self, tree: TreeId) -> Result<usize> {
        let root = self.root(tree)?;
        Ok(self
            .arena
            .subtree(root)
            .into_iter()
            .filter(|id| self.arena[*id].is_leaf())
            .map(|id| self.arena[id].items.len())
            .sum())
    }
}
