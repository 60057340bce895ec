//! Structural maintenance of dirty trees: splits, merges, rebalancing and
//! height changes.
//!
//! Item inserts and deletes never restructure nodes. Before allocation the
//! commit brings every dirty node back within `[1, capacity]` bytes of items,
//! parents before their new siblings, and collapses roots left with a single
//! child.

use tracing::{debug, error, trace};

use super::Transaction;
use crate::storage::arena::{Item, Node, NodeId, MAX_LEVEL};
use crate::storage::records::ExtentItem;
use crate::types::{item_type, ArborError, Key, Result, TreeId};

impl Transaction<'_> {
    /// Marks every ancestor of a dirty node dirty.
    pub fn add_parents(&mut self) {
        let dirty: Vec<NodeId> = self
            .state
            .trees
            .arena
            .iter()
            .filter(|(_, n)| n.dirty && n.parent.is_some())
            .map(|(id, _)| id)
            .collect();
        for id in dirty {
            self.state.mark_ancestors_dirty(id);
        }
    }

    /// Restores node size invariants on every dirty node.
    pub fn do_splits(&mut self) -> Result<()> {
        let capacity = self.capacity();
        let mut done_deletions = false;

        let mut level = 0u8;
        while level <= self.state.trees.arena.max_dirty_level().unwrap_or(0) {
            for id in self.state.trees.arena.dirty_at_level(level) {
                let Some(node) = self.state.trees.arena.get(id) else {
                    continue;
                };
                if node.items.is_empty() {
                    if node.parent.is_some() {
                        self.delete_node(id)?;
                        done_deletions = true;
                    } else if node.level != 0 {
                        self.demote_empty_root(id)?;
                    }
                    continue;
                }
                let mut current = id;
                while self.state.trees.arena[current].size() > capacity {
                    current = self.split(current)?;
                }
            }
            level += 1;
        }

        let half = capacity / 2;
        let top = self.state.trees.arena.max_dirty_level().unwrap_or(0);
        for level in 0..=top {
            for id in self.state.trees.arena.dirty_at_level(level) {
                let small = self
                    .state
                    .trees
                    .arena
                    .get(id)
                    .is_some_and(|n| n.parent.is_some() && !n.items.is_empty() && n.size() < half);
                if small && self.try_amalgamate(id)? {
                    done_deletions = true;
                }
            }
        }

        if done_deletions {
            for level in (1..=MAX_LEVEL).rev() {
                for id in self.state.trees.arena.dirty_at_level(level) {
                    let collapse = self
                        .state
                        .trees
                        .arena
                        .get(id)
                        .is_some_and(|n| n.parent.is_none() && n.items.len() == 1);
                    if collapse {
                        self.promote_only_child(id)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Releases the extent backing `id`, whichever copy currently holds it.
    fn release_node_extent(&mut self, id: NodeId) -> Result<()> {
        let node = &self.state.trees.arena[id];
        match node.new_address.or(node.address) {
            Some(address) => self.reduce_tree_extent(address, Some(id)),
            None => Ok(()),
        }
    }

    fn charge_root(&mut self, tree: TreeId, nodes: i64) -> Result<()> {
        let node_size = self.state.node_size() as i64;
        let item = &mut self.state.trees.tree_mut(tree)?.root_item;
        item.bytes_used = item.bytes_used.saturating_add_signed(nodes * node_size);
        Ok(())
    }

    /// Removes an empty non-root node and its entry in the parent.
    fn delete_node(&mut self, id: NodeId) -> Result<()> {
        let (tree, parent) = {
            let node = &self.state.trees.arena[id];
            (node.tree, node.parent)
        };
        let parent = parent.ok_or(ArborError::Invalid("root nodes are never deleted"))?;
        let slot = self.state.trees.arena[parent]
            .slot_of_child(id)
            .ok_or_else(|| ArborError::Inconsistent(format!("node {id:?} missing from parent")))?;
        self.release_node_extent(id)?;
        self.state.trees.arena[parent].items.remove(slot);
        self.state.mark_path_dirty(parent);
        self.charge_root(tree, -1)?;
        self.state.trees.arena.release(id);
        trace!(tree = tree.0, "maintain.node_deleted");
        Ok(())
    }

    /// Turns an empty internal root into an empty leaf.
    fn demote_empty_root(&mut self, id: NodeId) -> Result<()> {
        let (level, new_address) = {
            let node = &self.state.trees.arena[id];
            (node.level, node.new_address)
        };
        if let Some(address) = new_address {
            self.update_extent_level(address, level, 0)?;
        }
        self.state.trees.arena[id].level = 0;
        debug!(from = level, "maintain.root_demoted");
        Ok(())
    }

    /// Re-keys the tree-block record at `address` from `from` to `to`.
    pub fn update_extent_level(&mut self, address: u64, from: u8, to: u8) -> Result<()> {
        let skinny = Key::new(address, item_type::METADATA_ITEM, from as u64);
        if let Some(cursor) = self.state.trees.lookup(TreeId::EXTENT, &skinny)? {
            let (_, data) = self.state.trees.delete_item(cursor, self.undo)?;
            self.state.trees.insert_item(
                TreeId::EXTENT,
                Key::new(address, item_type::METADATA_ITEM, to as u64),
                data,
                self.undo,
            )?;
            return Ok(());
        }
        let fat = Key::new(address, item_type::EXTENT_ITEM, self.state.node_size());
        if let Some(cursor) = self.state.trees.lookup(TreeId::EXTENT, &fat)? {
            let mut record = ExtentItem::decode(self.state.trees.data_at(cursor), false)?;
            if let Some((_, level)) = record.tree_block_info.as_mut() {
                *level = to;
                self.state.trees.delete_item(cursor, self.undo)?;
                self.state
                    .trees
                    .insert_item(TreeId::EXTENT, fat, record.encode(), self.undo)?;
                return Ok(());
            }
        }
        error!(address, from, to, "maintain.extent_level_record_missing");
        Err(ArborError::Inconsistent(format!(
            "no tree-block record at {address:#x} level {from}"
        )))
    }

    /// Moves the tail of an overfull node into a new right sibling and
    /// returns the sibling.
    fn split(&mut self, id: NodeId) -> Result<NodeId> {
        let capacity = self.capacity();
        let generation = self.generation();
        let (tree, level, parent, at) = {
            let node = &self.state.trees.arena[id];
            let mut size = 0;
            let at = node.items.iter().position(|item| {
                size += item.size();
                size > capacity
            });
            (node.tree, node.level, node.parent, at)
        };
        let at = at.ok_or_else(|| ArborError::Inconsistent("split of a node that fits".into()))?;
        if at == 0 {
            error!(tree = tree.0, level, "maintain.item_exceeds_node");
            return Err(ArborError::Inconsistent(format!(
                "item larger than a node in tree {tree}"
            )));
        }

        let tail = self.state.trees.arena[id].items.split_off(at);
        let mut sibling = Node::new(tree, level, generation);
        sibling.items = tail;
        sibling.parent = parent;
        let sib = self.state.trees.arena.alloc(sibling);
        self.adopt_children(sib);
        self.charge_root(tree, 1)?;
        let sib_key = self.first_key(sib)?;

        match parent {
            Some(parent) => {
                let slot = self.state.trees.arena[parent]
                    .slot_of_child(id)
                    .ok_or_else(|| ArborError::Inconsistent("split node missing from parent".into()))?;
                let mut pointer = Item::pointer(sib_key, sib, 0, generation);
                pointer.inserted = true;
                self.state.trees.arena[parent]
                    .items
                    .insert(slot + 1, pointer);
                self.state.mark_path_dirty(parent);
            }
            None => {
                if level >= MAX_LEVEL {
                    return Err(ArborError::Unsupported("tree exceeds the maximum height"));
                }
                let mut root = Node::new(tree, level + 1, generation);
                let mut left = Item::pointer(self.first_key(id)?, id, 0, generation);
                let mut right = Item::pointer(sib_key, sib, 0, generation);
                left.inserted = true;
                right.inserted = true;
                root.items = vec![left, right];
                let root = self.state.trees.arena.alloc(root);
                self.state.trees.arena[id].parent = Some(root);
                self.state.trees.arena[sib].parent = Some(root);
                self.state.trees.tree_mut(tree)?.root = root;
                self.charge_root(tree, 1)?;
                debug!(tree = tree.0, level = level + 1, "maintain.root_grown");
            }
        }
        trace!(tree = tree.0, level, at, "maintain.split");
        Ok(sib)
    }

    /// Merges the under-filled node `id` with its right sibling, or evens
    /// out the pair when a merge would overflow. Returns `true` when the
    /// sibling was removed.
    ///
    /// The last child of a parent has no right sibling and is left as is.
    fn try_amalgamate(&mut self, id: NodeId) -> Result<bool> {
        let capacity = self.capacity();
        let Some(parent) = self.state.trees.arena[id].parent else {
            return Ok(false);
        };
        let slot = self.state.trees.arena[parent]
            .slot_of_child(id)
            .ok_or_else(|| ArborError::Inconsistent("merge candidate missing from parent".into()))?;
        let right_slot = slot + 1;
        let Some(next) = self.state.trees.arena[parent].items.get(right_slot) else {
            return Ok(false);
        };
        let right = pointer_child(next)?;

        let left_size = self.state.trees.arena[id].size();
        let right_size = self.state.trees.arena[right].size();
        if left_size + right_size <= capacity {
            let tree = self.state.trees.arena[right].tree;
            self.release_node_extent(right)?;
            let mut moved = std::mem::take(&mut self.state.trees.arena[right].items);
            for item in &mut moved {
                item.inserted = true;
            }
            self.state.trees.arena[id].items.extend(moved);
            self.adopt_children(id);
            self.state.trees.arena[parent].items.remove(right_slot);
            self.state.mark_path_dirty(id);
            self.charge_root(tree, -1)?;
            self.state.trees.arena.release(right);
            trace!(tree = tree.0, "maintain.merged");
            return Ok(true);
        }

        // `id` is under half full, so the sibling is the larger side.
        let target = (left_size + right_size) / 2;
        let mut size = left_size;
        let mut take = 0;
        for item in &self.state.trees.arena[right].items {
            if size + item.size() > target {
                break;
            }
            size += item.size();
            take += 1;
        }
        let mut moved: Vec<Item> = self.state.trees.arena[right].items.drain(..take).collect();
        for item in &mut moved {
            item.inserted = true;
        }
        self.state.trees.arena[id].items.extend(moved);
        self.adopt_children(id);
        if let Some(key) = self.state.trees.arena[right].first_key() {
            self.state.trees.arena[parent].items[right_slot].key = key;
        }
        self.state.mark_path_dirty(id);
        self.state.mark_path_dirty(right);
        trace!(moved = take, "maintain.rebalanced");
        Ok(false)
    }

    /// Replaces a single-child internal root with that child.
    fn promote_only_child(&mut self, root: NodeId) -> Result<()> {
        let tree = self.state.trees.arena[root].tree;
        let child = pointer_child(&self.state.trees.arena[root].items[0])?;
        self.release_node_extent(root)?;
        let node = &mut self.state.trees.arena[child];
        node.parent = None;
        node.dirty = true;
        self.state.trees.tree_mut(tree)?.root = child;
        self.charge_root(tree, -1)?;
        self.state.trees.arena.release(root);
        debug!(tree = tree.0, "maintain.root_collapsed");
        Ok(())
    }

    fn adopt_children(&mut self, id: NodeId) {
        let children: Vec<NodeId> = self.state.trees.arena[id].children().collect();
        for child in children {
            self.state.trees.arena[child].parent = Some(id);
        }
    }

    fn first_key(&self, id: NodeId) -> Result<Key> {
        self.state.trees.arena[id]
            .first_key()
            .ok_or_else(|| ArborError::Inconsistent("empty node has no first key".into()))
    }
}

fn pointer_child(item: &Item) -> Result<NodeId> {
    item.pointer_ref()
        .map(|ptr| ptr.child)
        .ok_or_else(|| ArborError::Inconsistent("leaf item in internal node".into()))
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use proptest::prelude::*;

    use super::*;
    use crate::engine::{testutil, FsState};
    use crate::storage::undo::UndoLog;

    const NODE: u32 = 4096;

    fn key(n: u64) -> Key {
        Key::new(n, item_type::INODE_ITEM, 0)
    }

    fn fill(state: &mut FsState, keys: impl IntoIterator<Item = u64>, len: usize) {
        let mut undo = UndoLog::new();
        for n in keys {
            state
                .trees
                .insert_item(TreeId::FS, key(n), vec![n as u8; len], &mut undo)
                .unwrap();
        }
    }

    fn maintain(state: &mut FsState) {
        let mut undo = UndoLog::new();
        let runs = Mutex::new(Vec::new());
        let mut tx = Transaction::new(state, &mut undo, &runs);
        tx.add_parents();
        tx.do_splits().unwrap();
    }

    /// Checks size bounds and parent links of `tree`, returning its keys.
    fn check_tree(state: &FsState, tree: TreeId) -> Vec<Key> {
        let arena = &state.trees.arena;
        let root = state.trees.root(tree).unwrap();
        assert!(arena[root].parent.is_none());
        let mut keys = Vec::new();
        for id in arena.subtree(root) {
            let node = &arena[id];
            assert!(node.size() <= state.trees.capacity());
            if id != root {
                assert!(!node.items.is_empty());
            }
            for child in node.children() {
                assert_eq!(arena[child].parent, Some(id));
                assert_eq!(arena[child].level + 1, node.level);
            }
        }
        let mut cursor = state
            .trees
            .search_forward(tree, &Key::new(0, 0, 0))
            .unwrap();
        while let Some(c) = cursor {
            keys.push(state.trees.key_at(c));
            cursor = state.trees.next(c);
        }
        keys
    }

    #[test]
    fn overfull_root_leaf_grows_a_level() {
        let mut state = testutil::state(1, 64 << 20, NODE);
        fill(&mut state, 0..100, 60);
        maintain(&mut state);
        let root = state.trees.root(TreeId::FS).unwrap();
        assert_eq!(state.trees.arena[root].level, 1);
        let keys = check_tree(&state, TreeId::FS);
        assert_eq!(keys, (0..100).map(key).collect::<Vec<_>>());
        let leaves = state.trees.arena[root].items.len() as u64;
        assert_eq!(
            state.trees.trees[&TreeId::FS].root_item.bytes_used,
            (leaves + 1) * NODE as u64
        );
    }

    #[test]
    fn oversized_item_is_rejected() {
        let mut state = testutil::state(1, 64 << 20, NODE);
        fill(&mut state, [1], NODE as usize);
        let mut undo = UndoLog::new();
        let runs = Mutex::new(Vec::new());
        let mut tx = Transaction::new(&mut state, &mut undo, &runs);
        assert!(matches!(
            tx.do_splits(),
            Err(ArborError::Inconsistent(_))
        ));
    }

    #[test]
    fn emptied_leaves_are_removed_and_root_collapses() {
        let mut state = testutil::state(1, 64 << 20, NODE);
        fill(&mut state, 0..100, 60);
        maintain(&mut state);
        let mut undo = UndoLog::new();
        for n in 10..100 {
            state.trees.delete_key(TreeId::FS, &key(n), &mut undo).unwrap();
        }
        maintain(&mut state);
        let root = state.trees.root(TreeId::FS).unwrap();
        assert_eq!(state.trees.arena[root].level, 0);
        assert_eq!(check_tree(&state, TreeId::FS), (0..10).map(key).collect::<Vec<_>>());
        assert_eq!(
            state.trees.trees[&TreeId::FS].root_item.bytes_used,
            NODE as u64
        );
    }

    #[test]
    fn one_and_a_half_leaf_splits_at_first_overflowing_item() {
        // 85-byte items, 47 of which fill a 3995-byte leaf exactly.
        let mut state = testutil::state(1, 64 << 20, NODE);
        fill(&mut state, 0..70, 60);
        maintain(&mut state);
        let root = state.trees.root(TreeId::FS).unwrap();
        let node = &state.trees.arena[root];
        assert_eq!(node.level, 1);
        assert_eq!(node.items.len(), 2);
        let leaves: Vec<NodeId> = node.children().collect();
        assert_eq!(state.trees.arena[leaves[0]].items.len(), 47);
        assert_eq!(state.trees.arena[leaves[1]].first_key(), Some(key(47)));
        assert_eq!(node.items[1].key, key(47));
        assert_eq!(check_tree(&state, TreeId::FS), (0..70).map(key).collect::<Vec<_>>());
    }

    #[test]
    fn split_under_existing_parent_adds_one_separator() {
        let mut state = testutil::state(1, 64 << 20, NODE);
        fill(&mut state, 0..120, 60);
        maintain(&mut state);
        let root = state.trees.root(TreeId::FS).unwrap();
        assert_eq!(state.trees.arena[root].items.len(), 3);

        // The last leaf holds 94..120; 44 more items make it 1.5x full.
        fill(&mut state, 120..164, 60);
        maintain(&mut state);
        assert_eq!(state.trees.root(TreeId::FS).unwrap(), root);
        let node = &state.trees.arena[root];
        assert_eq!(node.items.len(), 4);
        assert_eq!(node.items[3].key, key(94 + 47));
        assert_eq!(check_tree(&state, TreeId::FS), (0..164).map(key).collect::<Vec<_>>());
    }

    #[test]
    fn small_neighbours_are_merged() {
        // Leaves 0..47, 47..94 and 94..120.
        let mut state = testutil::state(1, 64 << 20, NODE);
        fill(&mut state, 0..120, 60);
        maintain(&mut state);
        let root = state.trees.root(TreeId::FS).unwrap();
        let before = state.trees.arena[root].items.len();
        assert_eq!(before, 3);

        let mut undo = UndoLog::new();
        for n in (10..47).chain(47..80) {
            state.trees.delete_key(TreeId::FS, &key(n), &mut undo).unwrap();
        }
        maintain(&mut state);
        let root = state.trees.root(TreeId::FS).unwrap();
        assert_eq!(state.trees.arena[root].items.len(), before - 1);
        let first = state.trees.arena[root].children().next().unwrap();
        assert_eq!(state.trees.arena[first].items.len(), 10 + 14);
        let expect: Vec<Key> = (0..10).chain(80..120).map(key).collect();
        assert_eq!(check_tree(&state, TreeId::FS), expect);
    }

    #[test]
    fn small_last_child_is_left_alone() {
        let mut state = testutil::state(1, 64 << 20, NODE);
        fill(&mut state, 0..120, 60);
        maintain(&mut state);
        let mut undo = UndoLog::new();
        for n in 100..120 {
            state.trees.delete_key(TreeId::FS, &key(n), &mut undo).unwrap();
        }
        maintain(&mut state);
        let root = state.trees.root(TreeId::FS).unwrap();
        let node = &state.trees.arena[root];
        assert_eq!(node.items.len(), 3);
        assert_eq!(node.items[1].key, key(47));
        assert_eq!(node.items[2].key, key(94));
    }

    #[test]
    fn empty_internal_root_is_demoted_with_its_record() {
        let mut state = testutil::state(1, 64 << 20, NODE);
        let root = state.trees.root(TreeId::FS).unwrap();
        state.trees.arena[root].level = 2;
        state.trees.arena[root].new_address = Some(0x40_0000);
        let mut undo = UndoLog::new();
        state
            .trees
            .insert_item(
                TreeId::EXTENT,
                Key::new(0x40_0000, item_type::METADATA_ITEM, 2),
                ExtentItem::tree_block(TreeId::FS.0, 1).encode(),
                &mut undo,
            )
            .unwrap();
        maintain(&mut state);
        assert_eq!(state.trees.arena[root].level, 0);
        assert!(state
            .trees
            .lookup(TreeId::EXTENT, &Key::new(0x40_0000, item_type::METADATA_ITEM, 0))
            .unwrap()
            .is_some());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn random_edits_keep_trees_well_formed(
            inserts in proptest::collection::btree_map(0u64..2000, 1usize..300, 1..400),
            delete_mask in any::<u64>(),
        ) {
            let mut state = testutil::state(1, 64 << 20, NODE);
            let mut undo = UndoLog::new();
            for (n, len) in &inserts {
                state.trees.insert_item(TreeId::FS, key(*n), vec![0; *len], &mut undo).unwrap();
            }
            maintain(&mut state);
            let mut expect: Vec<Key> = inserts.keys().copied().map(key).collect();
            prop_assert_eq!(check_tree(&state, TreeId::FS), expect.clone());

            expect.retain(|k| {
                let drop = delete_mask >> (k.objectid % 64) & 1 == 1;
                if drop {
                    state.trees.delete_key(TreeId::FS, k, &mut undo).unwrap();
                }
                !drop
            });
            maintain(&mut state);
            prop_assert_eq!(check_tree(&state, TreeId::FS), expect);
        }
    }
}
