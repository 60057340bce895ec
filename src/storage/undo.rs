//! Transaction-scoped log of inverse item mutations.

use super::store::TreeSet;
use crate::types::{Key, Result, TreeId};

/// Inverse of one recorded mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UndoOp {
    /// An item was inserted; undoing deletes it.
    Inserted {
        /// Tree the item lives in.
        tree: TreeId,
        /// Key of the inserted item.
        key: Key,
    },
    /// An item was deleted; undoing re-inserts it.
    Deleted {
        /// Tree the item lived in.
        tree: TreeId,
        /// Key of the deleted item.
        key: Key,
        /// Payload of the deleted item.
        data: Vec<u8>,
    },
}

/// Stack of inverse operations for every item insert and delete made within
/// one transaction scope.
///
/// The commit engine only appends to it. Its owner decides whether to
/// [`clear`](UndoLog::clear) it after publication or [`replay`](UndoLog::replay)
/// it to unwind an abandoned transaction.
#[derive(Default, Debug)]
pub struct UndoLog {
    ops: Vec<UndoOp>,
}

impl UndoLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, op: UndoOp) {
        self.ops.push(op);
    }

    /// Recorded operations, oldest first.
    pub fn ops(&self) -> &[UndoOp] {
        &self.ops
    }

    /// Number of recorded operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Forgets every recorded operation.
    pub fn clear(&mut self) {
        self.ops.clear();
    }

    /// Applies the inverse operations newest first, leaving the log empty.
    pub fn replay(&mut self, trees: &mut TreeSet) -> Result<()> {
        while let Some(op) = self.ops.pop() {
            match op {
                UndoOp::Inserted { tree, key } => {
                    if let Some(cursor) = trees.lookup(tree, &key)? {
                        trees.delete_raw(cursor)?;
                    }
                }
                UndoOp::Deleted { tree, key, data } => {
                    trees.insert_raw(tree, key, data)?;
                }
            }
        }
        Ok(())
    }
}
