//! Disk-resident AVL index.
//!
//! Nodes live in fixed 40-byte slots inside a [`SlotFile`]; the header holds
//! the root slot. Child links are slot indexes with `-1` meaning empty.
//! Insert and delete descend recursively and rebalance while unwinding, so
//! every node on the search path is rewritten at most a constant number of
//! times. Deleted nodes stay in the file; the slot arena only grows.

use keystone_common::{KeystoneError, Position, Record, Result};
use keystone_store::{RecordStore, SlotFile, NULL_SLOT};
use std::path::PathBuf;
use tracing::{debug, warn};

const NODE_SIZE: usize = 40;

/// One packed tree node.
#[derive(Debug, Clone, Copy, PartialEq)]
struct AvlNode {
    key: i64,
    position: Position,
    left: i64,
    right: i64,
    height: i64,
}

impl AvlNode {
    fn new(key: i64, position: Position) -> Self {
        Self {
            key,
            position,
            left: NULL_SLOT,
            right: NULL_SLOT,
            height: 0,
        }
    }

    fn to_bytes(&self) -> [u8; NODE_SIZE] {
        let mut buf = [0u8; NODE_SIZE];
        buf[0..8].copy_from_slice(&self.key.to_le_bytes());
        buf[8..16].copy_from_slice(&self.position.to_le_bytes());
        buf[16..24].copy_from_slice(&self.left.to_le_bytes());
        buf[24..32].copy_from_slice(&self.right.to_le_bytes());
        buf[32..40].copy_from_slice(&self.height.to_le_bytes());
        buf
    }

    fn from_bytes(slot: i64, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != NODE_SIZE {
            return Err(KeystoneError::CorruptNode {
                slot,
                reason: format!("expected {NODE_SIZE} bytes, got {}", bytes.len()),
            });
        }
        Ok(Self {
            key: i64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            position: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            left: i64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            right: i64::from_le_bytes(bytes[24..32].try_into().unwrap()),
            height: i64::from_le_bytes(bytes[32..40].try_into().unwrap()),
        })
    }
}

/// AVL tree over integer keys, mapping each key to a record position.
pub struct AvlIndex {
    nodes: SlotFile,
    store: RecordStore,
}

impl AvlIndex {
    /// Opens or creates an AVL index backed by `index_path` (node slots) and
    /// `data_path` (record log).
    pub fn open(index_path: impl Into<PathBuf>, data_path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            nodes: SlotFile::open(index_path, NODE_SIZE)?,
            store: RecordStore::open(data_path)?,
        })
    }

    /// Inserts a key and its record. Returns `false` without touching the
    /// log or the tree when the key already exists.
    pub fn insert(&mut self, key: i64, record: &Record) -> Result<bool> {
        if self.find_slot(key)?.is_some() {
            warn!(key, "duplicate key ignored by AVL index");
            return Ok(false);
        }

        let position = self.store.append(record)?;
        let root = self.nodes.read_root()?;
        let new_root = self.insert_rec(root, key, position)?;
        self.nodes.write_root(new_root)?;
        self.nodes.flush()?;
        Ok(true)
    }

    /// Point lookup.
    pub fn search(&self, key: i64) -> Result<Option<Record>> {
        match self.find_slot(key)? {
            Some((_, node)) => Ok(Some(self.store.read(node.position)?)),
            None => Ok(None),
        }
    }

    /// Returns the records with `low <= key <= high`, in key order.
    pub fn range_search(&self, low: i64, high: i64) -> Result<Vec<Record>> {
        let mut positions = Vec::new();
        self.range_rec(self.nodes.read_root()?, low, high, &mut positions)?;
        positions
            .into_iter()
            .map(|p| self.store.read(p))
            .collect()
    }

    /// Removes a key from the tree. The record bytes stay in the log until
    /// the next compaction. Returns `false` when the key is absent.
    pub fn delete(&mut self, key: i64) -> Result<bool> {
        let root = self.nodes.read_root()?;
        let (new_root, removed) = self.delete_rec(root, key)?;
        if !removed {
            warn!(key, "delete of missing key ignored by AVL index");
            return Ok(false);
        }
        self.nodes.write_root(new_root)?;
        self.nodes.flush()?;
        Ok(true)
    }

    /// Replaces the record for an existing key: the new version is appended
    /// to the log and the node repointed. Returns `false` when absent.
    pub fn update(&mut self, key: i64, record: &Record) -> Result<bool> {
        let Some((slot, mut node)) = self.find_slot(key)? else {
            warn!(key, "update of missing key ignored by AVL index");
            return Ok(false);
        };
        node.position = self.store.append(record)?;
        self.write_node(slot, &node)?;
        self.nodes.flush()?;
        Ok(true)
    }

    /// Rewrites the record log keeping only live records, in key order, and
    /// repoints every node to its new position.
    pub fn compact_data_file(&mut self) -> Result<()> {
        let mut live = Vec::new();
        self.inorder_rec(self.nodes.read_root()?, &mut live)?;

        let order: Vec<Position> = live.iter().map(|&(_, pos)| pos).collect();
        let remap = self.store.rewrite(&order)?;

        for (slot, old_pos) in live {
            if let Some(&new_pos) = remap.get(&old_pos) {
                let mut node = self.read_node(slot)?;
                node.position = new_pos;
                self.write_node(slot, &node)?;
            }
        }
        self.nodes.flush()?;
        debug!(live = remap.len(), "AVL data file compacted");
        Ok(())
    }

    /// Number of live keys.
    pub fn len(&self) -> Result<usize> {
        let mut live = Vec::new();
        self.inorder_rec(self.nodes.read_root()?, &mut live)?;
        Ok(live.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.nodes.read_root()? == NULL_SLOT)
    }

    /// Removes both backing files.
    pub fn destroy(self) -> Result<()> {
        self.nodes.destroy()?;
        self.store.destroy()
    }

    // =====
    // Node I/O
    // =====

    fn read_node(&self, slot: i64) -> Result<AvlNode> {
        AvlNode::from_bytes(slot, &self.nodes.read_slot(slot)?)
    }

    fn write_node(&self, slot: i64, node: &AvlNode) -> Result<()> {
        self.nodes.write_slot(slot, &node.to_bytes())
    }

    fn append_node(&self, node: &AvlNode) -> Result<i64> {
        self.nodes.append_slot(&node.to_bytes())
    }

    /// Height of a subtree, `-1` for the empty subtree.
    fn subtree_height(&self, slot: i64) -> Result<i64> {
        if slot == NULL_SLOT {
            Ok(-1)
        } else {
            Ok(self.read_node(slot)?.height)
        }
    }

    fn balance_of(&self, slot: i64) -> Result<i64> {
        let node = self.read_node(slot)?;
        Ok(self.subtree_height(node.left)? - self.subtree_height(node.right)?)
    }

    fn find_slot(&self, key: i64) -> Result<Option<(i64, AvlNode)>> {
        let mut slot = self.nodes.read_root()?;
        while slot != NULL_SLOT {
            let node = self.read_node(slot)?;
            if key == node.key {
                return Ok(Some((slot, node)));
            }
            slot = if key < node.key { node.left } else { node.right };
        }
        Ok(None)
    }

    // =====
    // Rotations
    // =====

    /// Right rotation around `slot`; returns the new subtree root slot.
    fn rotate_right(&self, slot: i64) -> Result<i64> {
        let mut y = self.read_node(slot)?;
        let x_slot = y.left;
        let mut x = self.read_node(x_slot)?;

        y.left = x.right;
        x.right = slot;

        y.height = 1 + self.subtree_height(y.left)?.max(self.subtree_height(y.right)?);
        self.write_node(slot, &y)?;
        x.height = 1 + self.subtree_height(x.left)?.max(y.height);
        self.write_node(x_slot, &x)?;
        Ok(x_slot)
    }

    /// Left rotation around `slot`; returns the new subtree root slot.
    fn rotate_left(&self, slot: i64) -> Result<i64> {
        let mut x = self.read_node(slot)?;
        let y_slot = x.right;
        let mut y = self.read_node(y_slot)?;

        x.right = y.left;
        y.left = slot;

        x.height = 1 + self.subtree_height(x.left)?.max(self.subtree_height(x.right)?);
        self.write_node(slot, &x)?;
        y.height = 1 + x.height.max(self.subtree_height(y.right)?);
        self.write_node(y_slot, &y)?;
        Ok(y_slot)
    }

    // =====
    // Insert
    // =====

    fn insert_rec(&self, slot: i64, key: i64, position: Position) -> Result<i64> {
        if slot == NULL_SLOT {
            return self.append_node(&AvlNode::new(key, position));
        }

        let mut node = self.read_node(slot)?;
        if key < node.key {
            node.left = self.insert_rec(node.left, key, position)?;
        } else {
            node.right = self.insert_rec(node.right, key, position)?;
        }

        node.height = 1 + self.subtree_height(node.left)?.max(self.subtree_height(node.right)?);
        let balance = self.subtree_height(node.left)? - self.subtree_height(node.right)?;

        if balance > 1 {
            let left = self.read_node(node.left)?;
            if key < left.key {
                // Left-left
                self.write_node(slot, &node)?;
                return self.rotate_right(slot);
            }
            // Left-right
            node.left = self.rotate_left(node.left)?;
            self.write_node(slot, &node)?;
            return self.rotate_right(slot);
        }
        if balance < -1 {
            let right = self.read_node(node.right)?;
            if key > right.key {
                // Right-right
                self.write_node(slot, &node)?;
                return self.rotate_left(slot);
            }
            // Right-left
            node.right = self.rotate_right(node.right)?;
            self.write_node(slot, &node)?;
            return self.rotate_left(slot);
        }

        self.write_node(slot, &node)?;
        Ok(slot)
    }

    // =====
    // Delete
    // =====

    fn delete_rec(&self, slot: i64, key: i64) -> Result<(i64, bool)> {
        if slot == NULL_SLOT {
            return Ok((NULL_SLOT, false));
        }

        let mut node = self.read_node(slot)?;
        let removed;
        if key < node.key {
            let (child, r) = self.delete_rec(node.left, key)?;
            node.left = child;
            removed = r;
        } else if key > node.key {
            let (child, r) = self.delete_rec(node.right, key)?;
            node.right = child;
            removed = r;
        } else {
            removed = true;
            if node.left == NULL_SLOT {
                return Ok((node.right, true));
            }
            if node.right == NULL_SLOT {
                return Ok((node.left, true));
            }
            // Two children: adopt the in-order successor, then remove it
            // from the right subtree.
            let successor = self.min_node(node.right)?;
            node.key = successor.key;
            node.position = successor.position;
            let (child, _) = self.delete_rec(node.right, successor.key)?;
            node.right = child;
        }

        if !removed {
            return Ok((slot, false));
        }

        node.height = 1 + self.subtree_height(node.left)?.max(self.subtree_height(node.right)?);
        let balance = self.subtree_height(node.left)? - self.subtree_height(node.right)?;

        if balance > 1 {
            if self.balance_of(node.left)? >= 0 {
                self.write_node(slot, &node)?;
                return Ok((self.rotate_right(slot)?, true));
            }
            node.left = self.rotate_left(node.left)?;
            self.write_node(slot, &node)?;
            return Ok((self.rotate_right(slot)?, true));
        }
        if balance < -1 {
            if self.balance_of(node.right)? <= 0 {
                self.write_node(slot, &node)?;
                return Ok((self.rotate_left(slot)?, true));
            }
            node.right = self.rotate_right(node.right)?;
            self.write_node(slot, &node)?;
            return Ok((self.rotate_left(slot)?, true));
        }

        self.write_node(slot, &node)?;
        Ok((slot, true))
    }

    fn min_node(&self, mut slot: i64) -> Result<AvlNode> {
        loop {
            let node = self.read_node(slot)?;
            if node.left == NULL_SLOT {
                return Ok(node);
            }
            slot = node.left;
        }
    }

    // =====
    // Traversal
    // =====

    fn range_rec(&self, slot: i64, low: i64, high: i64, out: &mut Vec<Position>) -> Result<()> {
        if slot == NULL_SLOT {
            return Ok(());
        }
        let node = self.read_node(slot)?;
        if low < node.key {
            self.range_rec(node.left, low, high, out)?;
        }
        if low <= node.key && node.key <= high {
            out.push(node.position);
        }
        if high > node.key {
            self.range_rec(node.right, low, high, out)?;
        }
        Ok(())
    }

    /// In-order `(slot, position)` pairs, i.e. in ascending key order.
    fn inorder_rec(&self, slot: i64, out: &mut Vec<(i64, Position)>) -> Result<()> {
        if slot == NULL_SLOT {
            return Ok(());
        }
        let node = self.read_node(slot)?;
        self.inorder_rec(node.left, out)?;
        out.push((slot, node.position));
        self.inorder_rec(node.right, out)?;
        Ok(())
    }
}
