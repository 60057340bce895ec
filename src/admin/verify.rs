use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::admin::inspect::tree_name;
use crate::admin::util::open_images;
use crate::admin::Result;
use crate::engine::FsState;
use crate::fs::{Filesystem, MountOptions};
use crate::primitives::io::FileIo;
use crate::storage::arena::NodeId;
use crate::storage::records::{BlockGroupItem, RootItem};
use crate::storage::superblock::{read_superblock, superblock_offsets_for, SUPERBLOCK_SIZE};
use crate::types::{item_type, Key, TreeId};

const MAX_FINDINGS: usize = 32;

/// Specifies the depth of verification checks to perform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLevel {
    /// Superblock copies only; the filesystem is not mounted.
    Fast,
    /// Superblocks, then every tree node and the chunk accounting of the
    /// mounted filesystem.
    Full,
}

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Informational message about the verification process.
    Info,
    /// Recoverable inconsistency, such as a stale superblock copy.
    Warning,
    /// Damage that makes the image untrustworthy.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// The severity level of this finding.
    pub severity: VerifySeverity,
    /// Human-readable description of the issue.
    pub message: String,
}

impl VerifyFinding {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Warning,
            message: message.into(),
        }
    }
}

/// Statistics collected during the verification process.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// Devices examined.
    pub devices: u64,
    /// Valid superblock copies found.
    pub superblock_copies: u64,
    /// Logical trees walked.
    pub trees: u64,
    /// Tree nodes visited.
    pub nodes: u64,
    /// Items held by visited nodes.
    pub items: u64,
    /// Extent records in the extent tree.
    pub extents: u64,
    /// Chunks whose accounting was checked.
    pub chunks: u64,
}

/// Complete report of a verification operation.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// The verification level that was performed.
    pub level: VerifyLevel,
    /// Whether verification finished without error findings.
    pub success: bool,
    /// List of issues discovered during verification.
    pub findings: Vec<VerifyFinding>,
    /// Statistics about the structures examined.
    pub counts: VerifyCounts,
}

/// Verifies the integrity of a filesystem image set.
///
/// `VerifyLevel::Fast` checks that every superblock copy on every device is
/// readable and agrees with its siblings. `VerifyLevel::Full` additionally
/// mounts the images read-only and checks every tree node (key order, size,
/// levels, parent/child pointers) and the extent accounting of every chunk.
///
/// # Errors
///
/// Returns an error if an image is missing or cannot be read. Damage found
/// inside the images is reported as findings, not as an error.
pub fn verify<P: AsRef<Path>>(paths: &[P], level: VerifyLevel) -> Result<VerifyReport> {
    let devices = open_images(paths)?;
    let mut findings = Vec::new();
    let mut counts = VerifyCounts::default();

    check_superblocks(&devices, &mut findings, &mut counts)?;

    if level == VerifyLevel::Full {
        match Filesystem::open(devices, MountOptions::inspect()) {
            Ok(fs) => {
                fs.with_state(|state| check_state(state, &mut findings, &mut counts));
                fs.shutdown()?;
            }
            Err(err) => push_error(&mut findings, format!("mount failed: {err}")),
        }
    }

    Ok(VerifyReport {
        level,
        success: !findings
            .iter()
            .any(|f| f.severity == VerifySeverity::Error),
        findings,
        counts,
    })
}

fn check_superblocks(
    devices: &[Arc<dyn FileIo>],
    findings: &mut Vec<VerifyFinding>,
    counts: &mut VerifyCounts,
) -> Result<()> {
    let mut newest = Vec::with_capacity(devices.len());
    let mut buf = vec![0u8; SUPERBLOCK_SIZE];
    for (idx, io) in devices.iter().enumerate() {
        counts.devices += 1;
        let mut copies = Vec::new();
        for offset in superblock_offsets_for(io.len()?) {
            io.read_at(offset, &mut buf)?;
            match read_superblock(&buf) {
                Ok(sb) if sb.bytenr != offset => push_error(
                    findings,
                    format!(
                        "device {idx}: copy at {offset:#x} claims offset {:#x}",
                        sb.bytenr
                    ),
                ),
                Ok(sb) => copies.push((offset, sb)),
                Err(err) => push_error(findings, format!("device {idx}: copy at {offset:#x}: {err}")),
            }
        }
        counts.superblock_copies += copies.len() as u64;
        let Some(best) = copies.iter().map(|(_, sb)| sb.generation).max() else {
            push_error(findings, format!("device {idx}: no valid superblock copy"));
            continue;
        };
        for (offset, sb) in &copies {
            if sb.generation != best {
                push_finding(
                    findings,
                    VerifyFinding::warning(format!(
                        "device {idx}: copy at {offset:#x} is stale (generation {} < {best})",
                        sb.generation
                    )),
                );
            }
        }
        if let Some((_, sb)) = copies.into_iter().find(|(_, sb)| sb.generation == best) {
            newest.push((idx, sb));
        }
    }

    if let Some((_, first)) = newest.first() {
        for (idx, sb) in &newest[1..] {
            if sb.fsid != first.fsid {
                push_error(findings, format!("device {idx}: belongs to another filesystem"));
            } else if sb.generation != first.generation {
                push_error(
                    findings,
                    format!(
                        "device {idx}: generation {} differs from {}",
                        sb.generation, first.generation
                    ),
                );
            }
        }
        if first.num_devices != devices.len() as u64 {
            push_error(
                findings,
                format!(
                    "superblock lists {} devices, {} given",
                    first.num_devices,
                    devices.len()
                ),
            );
        }
    }
    Ok(())
}

/// Checks every tree and chunk of a loaded, committed state.
pub(crate) fn check_state(
    state: &FsState,
    findings: &mut Vec<VerifyFinding>,
    counts: &mut VerifyCounts,
) {
    let mut walk = TreeWalk {
        state,
        findings,
        counts,
        tree_blocks: BTreeMap::new(),
    };
    for (&tree, logical) in &state.trees.trees {
        walk.counts.trees += 1;
        walk.check_tree(tree, logical.root);
        walk.check_root_record(tree, logical.root);
    }
    let tree_blocks = std::mem::take(&mut walk.tree_blocks);
    check_accounting(state, &tree_blocks, findings, counts);
}

struct TreeWalk<'a> {
    state: &'a FsState,
    findings: &'a mut Vec<VerifyFinding>,
    counts: &'a mut VerifyCounts,
    tree_blocks: BTreeMap<u64, u8>,
}

struct Visit {
    node: NodeId,
    parent: Option<NodeId>,
    level: Option<u8>,
    low: Option<Key>,
    high: Option<Key>,
}

impl TreeWalk<'_> {
    fn error(&mut self, message: String) {
        push_error(self.findings, message);
    }

    fn check_tree(&mut self, tree: TreeId, root: NodeId) {
        let state = self.state;
        let capacity = state.trees.capacity();
        let mut stack = vec![Visit {
            node: root,
            parent: None,
            level: None,
            low: None,
            high: None,
        }];
        while let Some(visit) = stack.pop() {
            let Some(node) = state.trees.arena.get(visit.node) else {
                self.error(format!("tree {}: dangling node reference", tree_name(tree)));
                continue;
            };
            self.counts.nodes += 1;
            self.counts.items += node.items.len() as u64;

            let Some(address) = node.address else {
                self.error(format!("tree {}: node without an address", tree_name(tree)));
                continue;
            };
            let at = format!("tree {} node {address:#x}", tree_name(tree));
            if self.tree_blocks.insert(address, node.level).is_some() {
                self.error(format!("{at}: address used by two nodes"));
            }
            if node.dirty {
                self.error(format!("{at}: still dirty"));
            }
            if node.tree != tree {
                self.error(format!("{at}: owned by tree {}", node.tree));
            }
            if let Some(level) = visit.level.filter(|level| *level != node.level) {
                self.error(format!("{at}: level {} where {level} was expected", node.level));
            }
            if node.parent != visit.parent {
                self.error(format!("{at}: parent link disagrees with the parent's pointer"));
            }
            if node.generation > state.superblock.generation {
                self.error(format!(
                    "{at}: generation {} newer than the superblock",
                    node.generation
                ));
            }
            if node.size() > capacity {
                self.error(format!("{at}: {} payload bytes exceed capacity {capacity}", node.size()));
            }
            if node.items.is_empty() && (visit.parent.is_some() || node.level > 0) {
                self.error(format!("{at}: empty non-root node"));
            }
            match state.chunk_index(address) {
                Some(idx) if state.chunks[idx].lock().is_data() => {
                    self.error(format!("{at}: tree block inside a data chunk"));
                }
                Some(_) => {}
                None => self.error(format!("{at}: outside every chunk")),
            }
            if node
                .items
                .windows(2)
                .any(|pair| pair[0].key >= pair[1].key)
            {
                self.error(format!("{at}: keys out of order"));
            }
            if let (Some(low), Some(first)) = (visit.low, node.first_key()) {
                if first < low {
                    self.error(format!("{at}: first key sorts before its separator"));
                }
            }
            if let (Some(high), Some(last)) = (visit.high, node.items.last()) {
                if last.key >= high {
                    self.error(format!("{at}: last key reaches the next separator"));
                }
            }

            if node.is_leaf() {
                if node.items.iter().any(|item| item.pointer_ref().is_some()) {
                    self.error(format!("{at}: child pointer in a leaf"));
                }
                continue;
            }
            for (slot, item) in node.items.iter().enumerate() {
                let Some(ptr) = item.pointer_ref() else {
                    self.error(format!("{at}: leaf item in an internal node"));
                    continue;
                };
                if let Some(child) = state.trees.arena.get(ptr.child) {
                    if child.address != Some(ptr.address) {
                        self.error(format!(
                            "{at}: slot {slot} points at {:#x}, child lives at {:?}",
                            ptr.address, child.address
                        ));
                    }
                    if child.generation != ptr.generation {
                        self.error(format!(
                            "{at}: slot {slot} expects generation {}, child has {}",
                            ptr.generation, child.generation
                        ));
                    }
                }
                stack.push(Visit {
                    node: ptr.child,
                    parent: Some(visit.node),
                    level: Some(node.level - 1),
                    low: Some(item.key),
                    high: node.items.get(slot + 1).map(|next| next.key).or(visit.high),
                });
            }
        }
    }

    /// The record naming a tree's root must match the loaded root node.
    fn check_root_record(&mut self, tree: TreeId, root: NodeId) {
        let state = self.state;
        let Some(node) = state.trees.arena.get(root) else {
            return;
        };
        let address = node.address.unwrap_or(0);
        let sb = &state.superblock;
        if tree == TreeId::ROOT {
            if sb.root != address || sb.root_level != node.level {
                self.error(format!("superblock names root tree at {:#x}, found {address:#x}", sb.root));
            }
            return;
        }
        if tree == TreeId::CHUNK {
            if sb.chunk_root != address || sb.chunk_root_level != node.level {
                self.error(format!(
                    "superblock names chunk tree at {:#x}, found {address:#x}",
                    sb.chunk_root
                ));
            }
            return;
        }
        let key = Key::new(tree.0, item_type::ROOT_ITEM, 0);
        let record = match state.trees.lookup(TreeId::ROOT, &key) {
            Ok(Some(cursor)) => RootItem::decode(state.trees.data_at(cursor)),
            Ok(None) => {
                self.error(format!("tree {}: no root item", tree_name(tree)));
                return;
            }
            Err(err) => {
                self.error(format!("tree {}: root item lookup failed: {err}", tree_name(tree)));
                return;
            }
        };
        match record {
            Ok(item) if item.bytenr != address || item.level != node.level => self.error(format!(
                "tree {}: root item names {:#x} level {}, root is {address:#x} level {}",
                tree_name(tree),
                item.bytenr,
                item.level,
                node.level
            )),
            Ok(_) => {}
            Err(err) => self.error(format!("tree {}: bad root item: {err}", tree_name(tree))),
        }
    }
}

/// Compares each chunk's used bytes with its extent records, block-group
/// item and free list, and the global counter with the chunk total.
fn check_accounting(
    state: &FsState,
    tree_blocks: &BTreeMap<u64, u8>,
    findings: &mut Vec<VerifyFinding>,
    counts: &mut VerifyCounts,
) {
    let node_size = state.node_size();
    let records = match state
        .trees
        .collect_range(TreeId::EXTENT, &Key::new(0, 0, 0), &Key::MAX)
    {
        Ok(records) => records,
        Err(err) => {
            push_error(findings, format!("failed to scan the extent tree: {err}"));
            return;
        }
    };

    let mut per_chunk = vec![0u64; state.chunks.len()];
    let mut recorded = BTreeSet::new();
    for (key, _) in &records {
        let len = match key.item_type {
            item_type::METADATA_ITEM => {
                if !tree_blocks.contains_key(&key.objectid) {
                    push_error(
                        findings,
                        format!("extent record {:#x} names no tree block", key.objectid),
                    );
                }
                node_size
            }
            item_type::EXTENT_ITEM => key.offset,
            _ => continue,
        };
        counts.extents += 1;
        recorded.insert(key.objectid);
        match state.chunk_index(key.objectid) {
            Some(idx) if state.chunks[idx].lock().contains(key.objectid, len) => {
                per_chunk[idx] += len;
            }
            _ => push_error(
                findings,
                format!("extent {:#x}+{len:#x} crosses a chunk boundary", key.objectid),
            ),
        }
    }
    for address in tree_blocks.keys() {
        if !recorded.contains(address) {
            push_error(findings, format!("tree block {address:#x} has no extent record"));
        }
    }

    let mut global = 0u64;
    for (idx, chunk) in state.chunks.iter().enumerate() {
        let chunk = chunk.lock();
        counts.chunks += 1;
        global += chunk.used * chunk.usage_multiplier();
        if per_chunk[idx] != chunk.used {
            push_error(
                findings,
                format!(
                    "chunk {:#x}: used {} but extents cover {}",
                    chunk.offset, chunk.used, per_chunk[idx]
                ),
            );
        }
        if chunk.free.total() + chunk.pinned.total() + chunk.used != chunk.size {
            push_error(
                findings,
                format!(
                    "chunk {:#x}: free {} and used {} do not add up to {}",
                    chunk.offset,
                    chunk.free.total(),
                    chunk.used,
                    chunk.size
                ),
            );
        }
        let key = Key::new(chunk.offset, item_type::BLOCK_GROUP_ITEM, chunk.size);
        let group = state
            .trees
            .lookup(TreeId::EXTENT, &key)
            .ok()
            .flatten()
            .map(|cursor| BlockGroupItem::decode(state.trees.data_at(cursor)));
        match group {
            Some(Ok(group)) if group.used == chunk.used => {}
            Some(Ok(group)) => push_error(
                findings,
                format!(
                    "chunk {:#x}: block group records {} used, chunk has {}",
                    chunk.offset, group.used, chunk.used
                ),
            ),
            Some(Err(err)) => push_error(findings, format!("chunk {:#x}: {err}", chunk.offset)),
            None => push_error(findings, format!("chunk {:#x}: no block group item", chunk.offset)),
        }
        for stripe in &chunk.stripes {
            if state.device_index(stripe.dev_id).is_err() {
                push_error(
                    findings,
                    format!("chunk {:#x}: stripe on missing device {}", chunk.offset, stripe.dev_id),
                );
            }
        }
    }
    if global != state.superblock.bytes_used {
        push_error(
            findings,
            format!(
                "superblock counts {} bytes used, chunks add up to {global}",
                state.superblock.bytes_used
            ),
        );
    }
}

fn push_error(findings: &mut Vec<VerifyFinding>, message: impl Into<String>) {
    push_finding(findings, VerifyFinding::error(message));
}

fn push_finding(findings: &mut Vec<VerifyFinding>, finding: VerifyFinding) {
    if findings.len() < MAX_FINDINGS {
        findings.push(finding);
    }
}
