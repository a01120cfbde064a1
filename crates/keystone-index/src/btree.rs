//! Disk-resident B+Tree index.
//!
//! Order M nodes live in fixed-size slots; every node holds at most M - 1
//! keys. Internal nodes carry explicit parent pointers and child slots,
//! leaves carry record positions plus prev/next links forming a doubly
//! linked chain for range scans. A node that reaches M keys is split before
//! it is written back: leaves copy the right half's first key up, internals
//! promote their middle key. Deletion borrows from a sibling with surplus
//! before merging, and an internal root left with no keys collapses to its
//! single child.

use keystone_common::{BTreeConfig, KeystoneError, Position, Record, Result};
use keystone_store::{RecordStore, SlotFile, NULL_SLOT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// Fixed part of a packed node: is_leaf u16, key_count u16, reserved u32,
// parent i64, next_leaf i64, prev_leaf i64.
const NODE_HEADER: usize = 32;

fn node_size(order: usize) -> usize {
    NODE_HEADER + (order - 1) * 8 + order * 8
}

/// Sidecar metadata so a reopened index uses the order it was built with.
#[derive(Debug, Serialize, Deserialize)]
struct BTreeMeta {
    order: usize,
}

/// One unpacked node.
#[derive(Debug, Clone)]
struct BtNode {
    is_leaf: bool,
    parent: i64,
    next_leaf: i64,
    prev_leaf: i64,
    keys: Vec<i64>,
    /// Child slots for internals (`keys.len() + 1` entries), record
    /// positions for leaves (`keys.len()` entries).
    ptrs: Vec<i64>,
}

impl BtNode {
    fn leaf() -> Self {
        Self {
            is_leaf: true,
            parent: NULL_SLOT,
            next_leaf: NULL_SLOT,
            prev_leaf: NULL_SLOT,
            keys: Vec::new(),
            ptrs: Vec::new(),
        }
    }

    fn internal() -> Self {
        Self {
            is_leaf: false,
            parent: NULL_SLOT,
            next_leaf: NULL_SLOT,
            prev_leaf: NULL_SLOT,
            keys: Vec::new(),
            ptrs: Vec::new(),
        }
    }

    fn to_bytes(&self, order: usize) -> Result<Vec<u8>> {
        if self.keys.len() > order - 1 {
            return Err(KeystoneError::Internal(format!(
                "packing node with {} keys at order {order}",
                self.keys.len()
            )));
        }
        let mut buf = vec![0u8; node_size(order)];
        buf[0..2].copy_from_slice(&(self.is_leaf as u16).to_le_bytes());
        buf[2..4].copy_from_slice(&(self.keys.len() as u16).to_le_bytes());
        buf[8..16].copy_from_slice(&self.parent.to_le_bytes());
        buf[16..24].copy_from_slice(&self.next_leaf.to_le_bytes());
        buf[24..32].copy_from_slice(&self.prev_leaf.to_le_bytes());

        let mut off = NODE_HEADER;
        for i in 0..order - 1 {
            let key = self.keys.get(i).copied().unwrap_or(0);
            buf[off..off + 8].copy_from_slice(&key.to_le_bytes());
            off += 8;
        }
        for i in 0..order {
            let ptr = self.ptrs.get(i).copied().unwrap_or(NULL_SLOT);
            buf[off..off + 8].copy_from_slice(&ptr.to_le_bytes());
            off += 8;
        }
        Ok(buf)
    }

    fn from_bytes(slot: i64, order: usize, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != node_size(order) {
            return Err(KeystoneError::CorruptNode {
                slot,
                reason: format!("expected {} bytes, got {}", node_size(order), bytes.len()),
            });
        }
        let is_leaf = u16::from_le_bytes(bytes[0..2].try_into().unwrap()) == 1;
        let key_count = u16::from_le_bytes(bytes[2..4].try_into().unwrap()) as usize;
        if key_count > order - 1 {
            return Err(KeystoneError::CorruptNode {
                slot,
                reason: format!("key count {key_count} exceeds order {order}"),
            });
        }
        let parent = i64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let next_leaf = i64::from_le_bytes(bytes[16..24].try_into().unwrap());
        let prev_leaf = i64::from_le_bytes(bytes[24..32].try_into().unwrap());

        let mut keys = Vec::with_capacity(key_count);
        let mut off = NODE_HEADER;
        for i in 0..order - 1 {
            if i < key_count {
                keys.push(i64::from_le_bytes(bytes[off..off + 8].try_into().unwrap()));
            }
            off += 8;
        }
        let ptr_count = if is_leaf { key_count } else { key_count + 1 };
        let mut ptrs = Vec::with_capacity(ptr_count);
        for i in 0..order {
            if i < ptr_count {
                ptrs.push(i64::from_le_bytes(bytes[off..off + 8].try_into().unwrap()));
            }
            off += 8;
        }

        Ok(Self {
            is_leaf,
            parent,
            next_leaf,
            prev_leaf,
            keys,
            ptrs,
        })
    }
}

/// B+Tree over integer keys, mapping each key to a record position.
pub struct BPlusTreeIndex {
    nodes: SlotFile,
    store: RecordStore,
    meta_path: PathBuf,
    order: usize,
}

impl BPlusTreeIndex {
    /// Opens or creates a B+Tree index. An existing index keeps the order
    /// it was created with; `config.order` only applies to a fresh one.
    pub fn open(
        index_path: impl Into<PathBuf>,
        data_path: impl Into<PathBuf>,
        config: BTreeConfig,
    ) -> Result<Self> {
        config.validate()?;
        let index_path = index_path.into();

        let meta_path = {
            let mut os = index_path.as_os_str().to_os_string();
            os.push(".meta");
            PathBuf::from(os)
        };
        let order = if meta_path.exists() {
            let meta: BTreeMeta = serde_json::from_str(&std::fs::read_to_string(&meta_path)?)?;
            meta.order
        } else {
            std::fs::write(&meta_path, serde_json::to_string(&BTreeMeta { order: config.order })?)?;
            config.order
        };

        Ok(Self {
            nodes: SlotFile::open(index_path, node_size(order))?,
            store: RecordStore::open(data_path)?,
            meta_path,
            order,
        })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Inserts a key and its record. Returns `false` without touching the
    /// log or the tree when the key already exists.
    pub fn insert(&mut self, key: i64, record: &Record) -> Result<bool> {
        if self.find_entry(key)?.is_some() {
            warn!(key, "duplicate key ignored by B+Tree index");
            return Ok(false);
        }

        let position = self.store.append(record)? as i64;
        let root = self.nodes.read_root()?;
        if root == NULL_SLOT {
            let mut leaf = BtNode::leaf();
            leaf.keys.push(key);
            leaf.ptrs.push(position);
            let slot = self.append_node(&leaf)?;
            self.nodes.write_root(slot)?;
            self.nodes.flush()?;
            return Ok(true);
        }

        let leaf_slot = self.find_leaf(key)?;
        let mut leaf = self.read_node(leaf_slot)?;
        let idx = leaf.keys.partition_point(|&k| k < key);
        leaf.keys.insert(idx, key);
        leaf.ptrs.insert(idx, position);

        if leaf.keys.len() < self.order {
            self.write_node(leaf_slot, &leaf)?;
        } else {
            self.split_leaf(leaf_slot, leaf)?;
        }
        self.nodes.flush()?;
        Ok(true)
    }

    /// Point lookup.
    pub fn search(&self, key: i64) -> Result<Option<Record>> {
        match self.find_entry(key)? {
            Some((_, _, position)) => Ok(Some(self.store.read(position)?)),
            None => Ok(None),
        }
    }

    /// Returns the records with `low <= key <= high` by walking the leaf
    /// chain from the first candidate leaf.
    pub fn range_search(&self, low: i64, high: i64) -> Result<Vec<Record>> {
        let mut results = Vec::new();
        if self.nodes.read_root()? == NULL_SLOT {
            return Ok(results);
        }
        let mut slot = self.find_leaf(low)?;
        while slot != NULL_SLOT {
            let leaf = self.read_node(slot)?;
            for (i, &key) in leaf.keys.iter().enumerate() {
                if key > high {
                    return Ok(results);
                }
                if key >= low {
                    results.push(self.store.read(leaf.ptrs[i] as Position)?);
                }
            }
            slot = leaf.next_leaf;
        }
        Ok(results)
    }

    /// Removes a key. The record bytes stay in the log until compaction.
    /// Returns `false` when the key is absent.
    pub fn delete(&mut self, key: i64) -> Result<bool> {
        let root = self.nodes.read_root()?;
        if root == NULL_SLOT {
            warn!(key, "delete of missing key ignored by B+Tree index");
            return Ok(false);
        }

        let leaf_slot = self.find_leaf(key)?;
        let mut leaf = self.read_node(leaf_slot)?;
        let Some(idx) = leaf.keys.iter().position(|&k| k == key) else {
            warn!(key, "delete of missing key ignored by B+Tree index");
            return Ok(false);
        };
        leaf.keys.remove(idx);
        leaf.ptrs.remove(idx);

        if leaf.parent == NULL_SLOT && leaf.keys.is_empty() {
            self.write_node(leaf_slot, &leaf)?;
            self.nodes.write_root(NULL_SLOT)?;
            self.nodes.flush()?;
            return Ok(true);
        }

        self.write_node(leaf_slot, &leaf)?;
        if leaf.parent != NULL_SLOT && leaf.keys.len() < self.min_keys(true) {
            self.handle_underflow(leaf_slot)?;
        }
        self.nodes.flush()?;
        Ok(true)
    }

    /// Replaces the record for an existing key: append then repoint.
    pub fn update(&mut self, key: i64, record: &Record) -> Result<bool> {
        let Some((slot, idx, _)) = self.find_entry(key)? else {
            warn!(key, "update of missing key ignored by B+Tree index");
            return Ok(false);
        };
        let position = self.store.append(record)? as i64;
        let mut leaf = self.read_node(slot)?;
        leaf.ptrs[idx] = position;
        self.write_node(slot, &leaf)?;
        self.nodes.flush()?;
        Ok(true)
    }

    /// Rewrites the record log in key order and repoints every leaf entry.
    pub fn compact_data_file(&mut self) -> Result<()> {
        let leaves = self.leaf_slots()?;
        let mut order = Vec::new();
        for &slot in &leaves {
            let leaf = self.read_node(slot)?;
            order.extend(leaf.ptrs.iter().map(|&p| p as Position));
        }

        let remap = self.store.rewrite(&order)?;
        for slot in leaves {
            let mut leaf = self.read_node(slot)?;
            let mut changed = false;
            for ptr in leaf.ptrs.iter_mut() {
                if let Some(&new_pos) = remap.get(&(*ptr as Position)) {
                    *ptr = new_pos as i64;
                    changed = true;
                }
            }
            if changed {
                self.write_node(slot, &leaf)?;
            }
        }
        self.nodes.flush()?;
        debug!(live = remap.len(), "B+Tree data file compacted");
        Ok(())
    }

    /// Number of live keys.
    pub fn len(&self) -> Result<usize> {
        let mut total = 0;
        for slot in self.leaf_slots()? {
            total += self.read_node(slot)?.keys.len();
        }
        Ok(total)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.nodes.read_root()? == NULL_SLOT)
    }

    /// Removes all backing files.
    pub fn destroy(self) -> Result<()> {
        self.nodes.destroy()?;
        self.store.destroy()?;
        if self.meta_path.exists() {
            std::fs::remove_file(&self.meta_path)?;
        }
        Ok(())
    }

    pub fn data_path(&self) -> &Path {
        self.store.path()
    }

    // =====
    // Node I/O
    // =====

    fn read_node(&self, slot: i64) -> Result<BtNode> {
        BtNode::from_bytes(slot, self.order, &self.nodes.read_slot(slot)?)
    }

    fn write_node(&self, slot: i64, node: &BtNode) -> Result<()> {
        self.nodes.write_slot(slot, &node.to_bytes(self.order)?)
    }

    fn append_node(&self, node: &BtNode) -> Result<i64> {
        self.nodes.append_slot(&node.to_bytes(self.order)?)
    }

    /// Minimum key count below which a non-root node underflows.
    fn min_keys(&self, is_leaf: bool) -> usize {
        if is_leaf {
            self.order / 2
        } else {
            (self.order - 1) / 2
        }
    }

    // =====
    // Search
    // =====

    /// Descends to the leaf that would hold `key`. The tree must not be
    /// empty. Equal keys route right, matching the rightmost-bias search.
    fn find_leaf(&self, key: i64) -> Result<i64> {
        let mut slot = self.nodes.read_root()?;
        loop {
            let node = self.read_node(slot)?;
            if node.is_leaf {
                return Ok(slot);
            }
            let idx = node.keys.partition_point(|&k| k <= key);
            let child = node.ptrs[idx];
            if child == NULL_SLOT {
                return Err(KeystoneError::CorruptIndex(format!(
                    "null child pointer in internal node at slot {slot}"
                )));
            }
            slot = child;
        }
    }

    /// Finds `(leaf_slot, index_in_leaf, position)` for an exact key.
    fn find_entry(&self, key: i64) -> Result<Option<(i64, usize, Position)>> {
        if self.nodes.read_root()? == NULL_SLOT {
            return Ok(None);
        }
        let slot = self.find_leaf(key)?;
        let leaf = self.read_node(slot)?;
        let idx = leaf.keys.partition_point(|&k| k < key);
        if idx < leaf.keys.len() && leaf.keys[idx] == key {
            Ok(Some((slot, idx, leaf.ptrs[idx] as Position)))
        } else {
            Ok(None)
        }
    }

    /// Leaf slots in key order, via the leftmost descent plus chain walk.
    fn leaf_slots(&self) -> Result<Vec<i64>> {
        let mut slots = Vec::new();
        let mut slot = self.nodes.read_root()?;
        if slot == NULL_SLOT {
            return Ok(slots);
        }
        loop {
            let node = self.read_node(slot)?;
            if node.is_leaf {
                break;
            }
            slot = node.ptrs[0];
        }
        while slot != NULL_SLOT {
            slots.push(slot);
            slot = self.read_node(slot)?.next_leaf;
        }
        Ok(slots)
    }

    // =====
    // Split
    // =====

    /// Splits an overfull in-memory leaf (holding `order` keys) before
    /// anything oversized reaches disk. The first key of the right half is
    /// copied up as the separator.
    fn split_leaf(&mut self, slot: i64, mut leaf: BtNode) -> Result<()> {
        let mid = self.order / 2;

        let mut right = BtNode::leaf();
        right.parent = leaf.parent;
        right.keys = leaf.keys.split_off(mid);
        right.ptrs = leaf.ptrs.split_off(mid);
        right.prev_leaf = slot;
        right.next_leaf = leaf.next_leaf;
        let promoted = right.keys[0];
        let right_slot = self.append_node(&right)?;

        if leaf.next_leaf != NULL_SLOT {
            let mut after = self.read_node(leaf.next_leaf)?;
            after.prev_leaf = right_slot;
            self.write_node(leaf.next_leaf, &after)?;
        }
        leaf.next_leaf = right_slot;
        self.write_node(slot, &leaf)?;

        self.insert_in_parent(slot, promoted, right_slot)
    }

    /// Splits an overfull in-memory internal node, promoting its middle key.
    fn split_internal(&mut self, slot: i64, mut node: BtNode) -> Result<()> {
        let mid = self.order / 2;
        let promoted = node.keys[mid];

        let mut right = BtNode::internal();
        right.parent = node.parent;
        right.keys = node.keys.split_off(mid + 1);
        right.ptrs = node.ptrs.split_off(mid + 1);
        node.keys.truncate(mid);
        let right_slot = self.append_node(&right)?;

        for &child in &right.ptrs {
            let mut child_node = self.read_node(child)?;
            child_node.parent = right_slot;
            self.write_node(child, &child_node)?;
        }
        self.write_node(slot, &node)?;

        self.insert_in_parent(slot, promoted, right_slot)
    }

    fn insert_in_parent(&mut self, left_slot: i64, key: i64, right_slot: i64) -> Result<()> {
        let left = self.read_node(left_slot)?;
        if left.parent == NULL_SLOT {
            let mut root = BtNode::internal();
            root.keys.push(key);
            root.ptrs.push(left_slot);
            root.ptrs.push(right_slot);
            let root_slot = self.append_node(&root)?;
            self.nodes.write_root(root_slot)?;

            for child in [left_slot, right_slot] {
                let mut node = self.read_node(child)?;
                node.parent = root_slot;
                self.write_node(child, &node)?;
            }
            return Ok(());
        }

        let parent_slot = left.parent;
        let mut parent = self.read_node(parent_slot)?;
        let idx = parent.keys.partition_point(|&k| k < key);
        parent.keys.insert(idx, key);
        parent.ptrs.insert(idx + 1, right_slot);

        if parent.keys.len() < self.order {
            self.write_node(parent_slot, &parent)?;
            Ok(())
        } else {
            self.split_internal(parent_slot, parent)
        }
    }

    // =====
    // Underflow
    // =====

    fn handle_underflow(&mut self, slot: i64) -> Result<()> {
        let node = self.read_node(slot)?;
        if node.parent == NULL_SLOT {
            // An internal root with no keys hands the tree to its only
            // child; a root leaf may hold any count.
            if !node.is_leaf && node.keys.is_empty() && !node.ptrs.is_empty() {
                let new_root = node.ptrs[0];
                let mut child = self.read_node(new_root)?;
                child.parent = NULL_SLOT;
                self.write_node(new_root, &child)?;
                self.nodes.write_root(new_root)?;
            }
            return Ok(());
        }
        if node.keys.len() >= self.min_keys(node.is_leaf) {
            return Ok(());
        }

        let parent_slot = node.parent;
        let parent = self.read_node(parent_slot)?;
        let child_idx = parent
            .ptrs
            .iter()
            .position(|&p| p == slot)
            .ok_or_else(|| {
                KeystoneError::CorruptIndex(format!(
                    "node at slot {slot} missing from parent {parent_slot}"
                ))
            })?;

        if child_idx > 0 {
            let left_slot = parent.ptrs[child_idx - 1];
            let left = self.read_node(left_slot)?;
            if left.keys.len() > self.min_keys(left.is_leaf) {
                return self.borrow_from_left(slot, left_slot, parent_slot, child_idx);
            }
        }
        if child_idx + 1 < parent.ptrs.len() {
            let right_slot = parent.ptrs[child_idx + 1];
            let right = self.read_node(right_slot)?;
            if right.keys.len() > self.min_keys(right.is_leaf) {
                return self.borrow_from_right(slot, right_slot, parent_slot, child_idx);
            }
        }

        if child_idx > 0 {
            let left_slot = parent.ptrs[child_idx - 1];
            self.merge_nodes(left_slot, slot, parent_slot, child_idx - 1)
        } else {
            let right_slot = parent.ptrs[child_idx + 1];
            self.merge_nodes(slot, right_slot, parent_slot, child_idx)
        }
    }

    fn borrow_from_left(
        &mut self,
        slot: i64,
        left_slot: i64,
        parent_slot: i64,
        child_idx: usize,
    ) -> Result<()> {
        let mut node = self.read_node(slot)?;
        let mut left = self.read_node(left_slot)?;
        let mut parent = self.read_node(parent_slot)?;
        let sep_idx = child_idx - 1;

        let surplus = || KeystoneError::Internal("borrow from sibling without surplus".to_string());
        if node.is_leaf {
            let key = left.keys.pop().ok_or_else(surplus)?;
            let ptr = left.ptrs.pop().ok_or_else(surplus)?;
            node.keys.insert(0, key);
            node.ptrs.insert(0, ptr);
            parent.keys[sep_idx] = node.keys[0];
        } else {
            // Rotate through the parent separator.
            node.keys.insert(0, parent.keys[sep_idx]);
            parent.keys[sep_idx] = left.keys.pop().ok_or_else(surplus)?;
            let child = left.ptrs.pop().ok_or_else(surplus)?;
            node.ptrs.insert(0, child);
            let mut moved = self.read_node(child)?;
            moved.parent = slot;
            self.write_node(child, &moved)?;
        }

        self.write_node(slot, &node)?;
        self.write_node(left_slot, &left)?;
        self.write_node(parent_slot, &parent)?;
        Ok(())
    }

    fn borrow_from_right(
        &mut self,
        slot: i64,
        right_slot: i64,
        parent_slot: i64,
        child_idx: usize,
    ) -> Result<()> {
        let mut node = self.read_node(slot)?;
        let mut right = self.read_node(right_slot)?;
        let mut parent = self.read_node(parent_slot)?;
        let sep_idx = child_idx;

        if node.is_leaf {
            let key = right.keys.remove(0);
            let ptr = right.ptrs.remove(0);
            node.keys.push(key);
            node.ptrs.push(ptr);
            parent.keys[sep_idx] = right.keys[0];
        } else {
            node.keys.push(parent.keys[sep_idx]);
            parent.keys[sep_idx] = right.keys.remove(0);
            let child = right.ptrs.remove(0);
            node.ptrs.push(child);
            let mut moved = self.read_node(child)?;
            moved.parent = slot;
            self.write_node(child, &moved)?;
        }

        self.write_node(slot, &node)?;
        self.write_node(right_slot, &right)?;
        self.write_node(parent_slot, &parent)?;
        Ok(())
    }

    /// Merges `right_slot` into `left_slot` and removes the separator from
    /// the parent, recursing when the parent underflows in turn.
    fn merge_nodes(
        &mut self,
        left_slot: i64,
        right_slot: i64,
        parent_slot: i64,
        sep_idx: usize,
    ) -> Result<()> {
        let mut left = self.read_node(left_slot)?;
        let right = self.read_node(right_slot)?;
        let mut parent = self.read_node(parent_slot)?;

        let separator = parent.keys.remove(sep_idx);
        parent.ptrs.remove(sep_idx + 1);

        if !left.is_leaf {
            // The separator comes down between the two pointer runs.
            left.keys.push(separator);
        }
        let moved_children: Vec<i64> = if left.is_leaf { Vec::new() } else { right.ptrs.clone() };
        left.keys.extend(right.keys.iter().copied());
        left.ptrs.extend(right.ptrs.iter().copied());

        if left.is_leaf {
            left.next_leaf = right.next_leaf;
            if right.next_leaf != NULL_SLOT {
                let mut after = self.read_node(right.next_leaf)?;
                after.prev_leaf = left_slot;
                self.write_node(right.next_leaf, &after)?;
            }
        } else {
            for child in moved_children {
                let mut node = self.read_node(child)?;
                node.parent = left_slot;
                self.write_node(child, &node)?;
            }
        }

        self.write_node(left_slot, &left)?;
        self.write_node(parent_slot, &parent)?;

        let parent_is_root = parent.parent == NULL_SLOT;
        if (parent_is_root && parent.keys.is_empty())
            || (!parent_is_root && parent.keys.len() < self.min_keys(false))
        {
            self.handle_underflow(parent_slot)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_index(order: usize) -> (BPlusTreeIndex, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let index = BPlusTreeIndex::open(
            dir.path().join("keys.bpt"),
            dir.path().join("records.jsonl"),
            BTreeConfig { order },
        )
        .unwrap();
        (index, dir)
    }

    fn row(id: i64) -> Record {
        Record::new().with("id", id).with("name", format!("row-{id}"))
    }

    fn keys_of(records: &[Record]) -> Vec<i64> {
        records
            .iter()
            .map(|r| r.get("id").unwrap().as_int().unwrap())
            .collect()
    }

    /// Full structural check: sorted keys, parent pointers, fill bounds,
    /// uniform leaf depth, and a consistent doubly linked leaf chain.
    fn assert_well_formed(index: &BPlusTreeIndex) {
        let root = index.nodes.read_root().unwrap();
        if root == NULL_SLOT {
            return;
        }

        fn check(index: &BPlusTreeIndex, slot: i64, is_root: bool) -> usize {
            let node = index.read_node(slot).unwrap();
            assert!(node.keys.windows(2).all(|w| w[0] < w[1]), "unsorted keys");
            assert!(node.keys.len() <= index.order - 1, "overfull node");
            if !is_root {
                assert!(
                    node.keys.len() >= index.min_keys(node.is_leaf),
                    "underfull node at slot {slot}: {} keys",
                    node.keys.len()
                );
            }
            if node.is_leaf {
                assert_eq!(node.ptrs.len(), node.keys.len());
                return 1;
            }
            assert_eq!(node.ptrs.len(), node.keys.len() + 1);
            let mut depth = None;
            for &child in &node.ptrs {
                let child_node = index.read_node(child).unwrap();
                assert_eq!(child_node.parent, slot, "bad parent pointer at {child}");
                let d = check(index, child, false);
                match depth {
                    None => depth = Some(d),
                    Some(prev) => assert_eq!(prev, d, "ragged leaf depth"),
                }
            }
            depth.unwrap() + 1
        }
        check(index, root, true);

        // Leaf chain agrees with the tree ordering.
        let slots = index.leaf_slots().unwrap();
        let mut prev = NULL_SLOT;
        let mut last_key = i64::MIN;
        for &slot in &slots {
            let leaf = index.read_node(slot).unwrap();
            assert_eq!(leaf.prev_leaf, prev);
            for &k in &leaf.keys {
                assert!(k > last_key, "leaf chain out of order");
                last_key = k;
            }
            prev = slot;
        }
    }

    #[test]
    fn test_insert_and_search() {
        let (mut index, _dir) = create_test_index(4);
        for key in [5, 1, 9, 3] {
            assert!(index.insert(key, &row(key)).unwrap());
        }
        assert_eq!(index.search(3).unwrap(), Some(row(3)));
        assert_eq!(index.search(4).unwrap(), None);
        assert_well_formed(&index);
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let (mut index, _dir) = create_test_index(4);
        assert!(index.insert(7, &row(7)).unwrap());
        let log_len = index.store.len().unwrap();

        assert!(!index.insert(7, &row(999)).unwrap());
        assert_eq!(index.store.len().unwrap(), log_len);
        assert_eq!(index.search(7).unwrap(), Some(row(7)));
    }

    #[test]
    fn test_sequential_inserts_split_leaves() {
        let (mut index, _dir) = create_test_index(4);
        for key in 1..=10 {
            index.insert(key, &row(key)).unwrap();
        }
        assert_well_formed(&index);
        // Ten keys at order 4 cannot fit in one or two leaves.
        assert!(index.leaf_slots().unwrap().len() >= 3);
        assert_eq!(index.len().unwrap(), 10);

        let hits = index.range_search(3, 7).unwrap();
        assert_eq!(keys_of(&hits), vec![3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_root_split_grows_height() {
        let (mut index, _dir) = create_test_index(4);
        for key in 1..=10 {
            index.insert(key, &row(key)).unwrap();
        }
        let root = index.nodes.read_root().unwrap();
        let root_node = index.read_node(root).unwrap();
        assert!(!root_node.is_leaf);
        // Children of the root are internal too after ten inserts.
        let child = index.read_node(root_node.ptrs[0]).unwrap();
        assert!(!child.is_leaf);
    }

    #[test]
    fn test_range_search_outside_bounds() {
        let (mut index, _dir) = create_test_index(4);
        for key in [2, 4, 6, 8] {
            index.insert(key, &row(key)).unwrap();
        }
        assert!(index.range_search(9, 20).unwrap().is_empty());
        assert!(index.range_search(-5, 1).unwrap().is_empty());
        assert_eq!(keys_of(&index.range_search(4, 4).unwrap()), vec![4]);
    }

    #[test]
    fn test_delete_with_borrow_and_merge() {
        let (mut index, _dir) = create_test_index(4);
        for key in 1..=12 {
            index.insert(key, &row(key)).unwrap();
        }
        for key in [1, 2, 3, 12, 11, 6] {
            assert!(index.delete(key).unwrap());
            assert_well_formed(&index);
        }
        assert_eq!(index.len().unwrap(), 6);
        assert_eq!(
            keys_of(&index.range_search(i64::MIN, i64::MAX).unwrap()),
            vec![4, 5, 7, 8, 9, 10]
        );
    }

    #[test]
    fn test_delete_everything_collapses_root() {
        let (mut index, _dir) = create_test_index(4);
        for key in 1..=20 {
            index.insert(key, &row(key)).unwrap();
        }
        for key in 1..=20 {
            assert!(index.delete(key).unwrap());
            assert_well_formed(&index);
        }
        assert!(index.is_empty().unwrap());
        assert_eq!(index.search(5).unwrap(), None);

        // The tree is usable again after going empty.
        assert!(index.insert(5, &row(5)).unwrap());
        assert_eq!(index.search(5).unwrap(), Some(row(5)));
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let (mut index, _dir) = create_test_index(4);
        index.insert(1, &row(1)).unwrap();
        assert!(!index.delete(2).unwrap());
        assert!(!index.delete(2).unwrap());
        assert_eq!(index.len().unwrap(), 1);
    }

    #[test]
    fn test_update_repoints_entry() {
        let (mut index, _dir) = create_test_index(4);
        for key in 1..=8 {
            index.insert(key, &row(key)).unwrap();
        }
        let v2 = Record::new().with("id", 5i64).with("name", "updated");
        assert!(index.update(5, &v2).unwrap());
        assert_eq!(index.search(5).unwrap(), Some(v2));
        assert!(!index.update(50, &row(50)).unwrap());
        assert_well_formed(&index);
    }

    #[test]
    fn test_compaction_preserves_scans() {
        let (mut index, _dir) = create_test_index(4);
        for key in 1..=30 {
            index.insert(key, &row(key)).unwrap();
        }
        for key in (1..=30).step_by(2) {
            index.delete(key).unwrap();
        }
        let len_before = index.store.len().unwrap();
        index.compact_data_file().unwrap();
        assert!(index.store.len().unwrap() < len_before);

        let hits = index.range_search(i64::MIN, i64::MAX).unwrap();
        assert_eq!(keys_of(&hits), (2..=30).step_by(2).collect::<Vec<i64>>());
        assert_well_formed(&index);
    }

    #[test]
    fn test_larger_order() {
        let (mut index, _dir) = create_test_index(16);
        for key in (0..200).rev() {
            index.insert(key, &row(key)).unwrap();
        }
        assert_well_formed(&index);
        assert_eq!(index.len().unwrap(), 200);
        assert_eq!(
            keys_of(&index.range_search(50, 60).unwrap()),
            (50..=60).collect::<Vec<i64>>()
        );
    }

    #[test]
    fn test_persistence_keeps_order_across_reopen() {
        let dir = tempdir().unwrap();
        let index_path = dir.path().join("keys.bpt");
        let data_path = dir.path().join("records.jsonl");
        {
            let mut index =
                BPlusTreeIndex::open(&index_path, &data_path, BTreeConfig { order: 5 }).unwrap();
            for key in 1..=25 {
                index.insert(key, &row(key)).unwrap();
            }
        }
        {
            // A different configured order must not win over the sidecar.
            let index =
                BPlusTreeIndex::open(&index_path, &data_path, BTreeConfig { order: 9 }).unwrap();
            assert_eq!(index.order(), 5);
            assert_eq!(index.search(13).unwrap(), Some(row(13)));
            assert_eq!(index.len().unwrap(), 25);
            assert_well_formed(&index);
        }
    }

    #[test]
    fn test_rejects_invalid_order() {
        let dir = tempdir().unwrap();
        let result = BPlusTreeIndex::open(
            dir.path().join("keys.bpt"),
            dir.path().join("records.jsonl"),
            BTreeConfig { order: 2 },
        );
        assert!(matches!(result, Err(KeystoneError::InvalidParameter { .. })));
    }

    #[test]
    fn test_randomized_against_reference() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        use std::collections::BTreeMap;

        let (mut index, _dir) = create_test_index(4);
        let mut reference: BTreeMap<i64, Record> = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(0xB7);

        for _ in 0..400 {
            let key = rng.gen_range(0..80);
            match rng.gen_range(0..3) {
                0 => {
                    let record = row(key);
                    let inserted = index.insert(key, &record).unwrap();
                    assert_eq!(inserted, !reference.contains_key(&key));
                    reference.entry(key).or_insert(record);
                }
                1 => {
                    let removed = index.delete(key).unwrap();
                    assert_eq!(removed, reference.remove(&key).is_some());
                }
                _ => {
                    assert_eq!(index.search(key).unwrap(), reference.get(&key).cloned());
                }
            }
        }

        assert_well_formed(&index);
        let all = index.range_search(i64::MIN, i64::MAX).unwrap();
        assert_eq!(keys_of(&all), reference.keys().copied().collect::<Vec<i64>>());
    }
}
