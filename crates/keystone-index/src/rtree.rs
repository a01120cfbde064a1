//! R-tree spatial index over 3D bounding boxes.
//!
//! The tree is held in memory as owned nodes and persisted as a single
//! serde snapshot rewritten after every mutation. Levels are numbered
//! upward from 0 at the leaves; a leaf entry pairs a box with a record
//! position, an internal entry pairs a covering box with a child node.
//! Node overflow is resolved with the quadratic split and node underflow
//! with condense-and-reinsert, so boxes stay tight after deletions.
//! A degenerate box (min == max) stores a point.

use keystone_common::{BoundingBox, KeystoneError, Position, RTreeConfig, Record, Result, Sphere};
use keystone_store::RecordStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Entry {
    Record { bbox: BoundingBox, position: Position },
    Node { bbox: BoundingBox, child: Box<RtNode> },
}

impl Entry {
    fn bbox(&self) -> &BoundingBox {
        match self {
            Entry::Record { bbox, .. } => bbox,
            Entry::Node { bbox, .. } => bbox,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RtNode {
    /// 0 at the leaves, parent level is child level + 1.
    level: u32,
    entries: Vec<Entry>,
}

impl RtNode {
    fn leaf() -> Self {
        Self {
            level: 0,
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    max_children: usize,
    root: RtNode,
}

/// R-tree with quadratic node splitting.
pub struct RTreeIndex {
    path: PathBuf,
    store: RecordStore,
    root: RtNode,
    max_children: usize,
}

impl RTreeIndex {
    /// Opens or creates an R-tree. An existing snapshot keeps the
    /// `max_children` it was built with; `config` applies to a fresh tree.
    pub fn open(
        index_path: impl Into<PathBuf>,
        data_path: impl Into<PathBuf>,
        config: RTreeConfig,
    ) -> Result<Self> {
        config.validate()?;
        let path = index_path.into();
        let store = RecordStore::open(data_path)?;

        if path.exists() {
            let snapshot: Snapshot = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
            if snapshot.max_children < 2 {
                return Err(KeystoneError::CorruptIndex(format!(
                    "R-tree snapshot has max_children {}",
                    snapshot.max_children
                )));
            }
            Ok(Self {
                path,
                store,
                root: snapshot.root,
                max_children: snapshot.max_children,
            })
        } else {
            let index = Self {
                path,
                store,
                root: RtNode::leaf(),
                max_children: config.max_children,
            };
            index.save()?;
            Ok(index)
        }
    }

    pub fn max_children(&self) -> usize {
        self.max_children
    }

    fn min_children(&self) -> usize {
        RTreeConfig {
            max_children: self.max_children,
        }
        .min_children()
    }

    /// Inserts a box and its record. A box with the exact extent of an
    /// existing entry is a duplicate and is ignored.
    pub fn insert(&mut self, bbox: &BoundingBox, record: &Record) -> Result<bool> {
        if find_position(&self.root, bbox).is_some() {
            warn!(?bbox, "duplicate box ignored by R-tree index");
            return Ok(false);
        }
        let position = self.store.append(record)?;
        self.insert_at_root(
            Entry::Record {
                bbox: *bbox,
                position,
            },
            0,
        )?;
        self.save()?;
        Ok(true)
    }

    /// Looks up the record stored under a box with this exact extent.
    pub fn search(&self, bbox: &BoundingBox) -> Result<Option<Record>> {
        match find_position(&self.root, bbox) {
            Some(position) => Ok(Some(self.store.read(position)?)),
            None => Ok(None),
        }
    }

    /// Records whose stored point falls inside `query`. Internal levels
    /// are pruned by box intersection.
    pub fn search_box(&self, query: &BoundingBox) -> Result<Vec<Record>> {
        let mut results = Vec::new();
        self.collect_box(&self.root, query, &mut results)?;
        Ok(results)
    }

    /// Records whose stored point falls inside `query`, pruning internal
    /// levels by the nearest-point sphere/box test.
    pub fn search_sphere(&self, query: &Sphere) -> Result<Vec<Record>> {
        let mut results = Vec::new();
        self.collect_sphere(&self.root, query, &mut results)?;
        Ok(results)
    }

    /// Removes the entry with this exact extent, then condenses: underfull
    /// nodes on the removal path are detached and their entries reinserted
    /// at their original level.
    pub fn delete(&mut self, bbox: &BoundingBox) -> Result<bool> {
        let min = self.min_children();
        let mut orphans = Vec::new();
        if !delete_entry(&mut self.root, bbox, min, &mut orphans)? {
            warn!(?bbox, "delete of missing box ignored by R-tree index");
            return Ok(false);
        }

        // A root with a single internal child shrinks the tree by a level;
        // an emptied internal root becomes a fresh leaf.
        while self.root.level > 0 && self.root.entries.len() == 1 {
            match self.root.entries.pop() {
                Some(Entry::Node { child, .. }) => self.root = *child,
                _ => return Err(level_mismatch()),
            }
        }
        if self.root.level > 0 && self.root.entries.is_empty() {
            self.root = RtNode::leaf();
        }

        let mut queue = orphans;
        while let Some(entry) = queue.pop() {
            match entry {
                Entry::Record { .. } => self.insert_at_root(entry, 0)?,
                Entry::Node { bbox, child } => {
                    let target = child.level + 1;
                    if target > self.root.level {
                        // The tree shrank below this subtree's height;
                        // break it up and reinsert the pieces.
                        queue.extend(child.entries);
                    } else {
                        self.insert_at_root(Entry::Node { bbox, child }, target)?;
                    }
                }
            }
        }
        self.save()?;
        Ok(true)
    }

    /// Replaces the record under an existing box: append then repoint.
    pub fn update(&mut self, bbox: &BoundingBox, record: &Record) -> Result<bool> {
        if find_position(&self.root, bbox).is_none() {
            warn!(?bbox, "update of missing box ignored by R-tree index");
            return Ok(false);
        }
        let position = self.store.append(record)?;
        if !repoint(&mut self.root, bbox, position) {
            return Err(KeystoneError::CorruptIndex(
                "box vanished between lookup and update".to_string(),
            ));
        }
        self.save()?;
        Ok(true)
    }

    /// Rewrites the record log with only live records and repoints every
    /// leaf entry.
    pub fn compact_data_file(&mut self) -> Result<()> {
        let mut order = Vec::with_capacity(self.len());
        collect_positions(&self.root, &mut order);
        let remap = self.store.rewrite(&order)?;
        self.apply_position_remap(&remap)?;
        debug!(live = remap.len(), "R-tree data file compacted");
        Ok(())
    }

    /// Repoints leaf entries through `remap`. Used by this index's own
    /// compaction and by callers that rewrite a record log shared with
    /// other indexes.
    pub fn apply_position_remap(&mut self, remap: &HashMap<Position, Position>) -> Result<()> {
        remap_positions(&mut self.root, remap);
        self.save()
    }

    /// Number of live boxes.
    pub fn len(&self) -> usize {
        count_records(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes the snapshot and the record log.
    pub fn destroy(self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        self.store.destroy()
    }

    // =====
    // Internal
    // =====

    fn insert_at_root(&mut self, entry: Entry, target_level: u32) -> Result<()> {
        let max = self.max_children;
        let min = self.min_children();
        if let Some(sibling) = insert_entry(&mut self.root, entry, target_level, max, min)? {
            let old = std::mem::replace(&mut self.root, RtNode::leaf());
            let level = old.level + 1;
            let left = Entry::Node {
                bbox: mbr(&old.entries).ok_or_else(level_mismatch)?,
                child: Box::new(old),
            };
            let right = Entry::Node {
                bbox: mbr(&sibling.entries).ok_or_else(level_mismatch)?,
                child: Box::new(sibling),
            };
            self.root = RtNode {
                level,
                entries: vec![left, right],
            };
            debug!(level, "R-tree root split");
        }
        Ok(())
    }

    fn collect_box(&self, node: &RtNode, query: &BoundingBox, out: &mut Vec<Record>) -> Result<()> {
        for entry in &node.entries {
            match entry {
                Entry::Record { bbox, position } => {
                    if query.contains_point(bbox.min) {
                        out.push(self.store.read(*position)?);
                    }
                }
                Entry::Node { bbox, child } => {
                    if bbox.intersects(query) {
                        self.collect_box(child, query, out)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn collect_sphere(&self, node: &RtNode, query: &Sphere, out: &mut Vec<Record>) -> Result<()> {
        for entry in &node.entries {
            match entry {
                Entry::Record { bbox, position } => {
                    if query.contains_point(bbox.min) {
                        out.push(self.store.read(*position)?);
                    }
                }
                Entry::Node { bbox, child } => {
                    if query.intersects_box(bbox) {
                        self.collect_sphere(child, query, out)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let snapshot = Snapshot {
            max_children: self.max_children,
            root: self.root.clone(),
        };
        let tmp_path = {
            let mut os = self.path.as_os_str().to_os_string();
            os.push(".tmp");
            PathBuf::from(os)
        };
        std::fs::write(&tmp_path, serde_json::to_vec(&snapshot)?)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn level_mismatch() -> KeystoneError {
    KeystoneError::Internal("R-tree node level does not match its entries".to_string())
}

/// Inserts `entry` into the subtree, placing it in a node at
/// `target_level`. Returns the split-off sibling when the node overflowed.
fn insert_entry(
    node: &mut RtNode,
    entry: Entry,
    target_level: u32,
    max: usize,
    min: usize,
) -> Result<Option<RtNode>> {
    if node.level == target_level {
        node.entries.push(entry);
    } else {
        let idx = choose_subtree(node, entry.bbox())?;
        let split = match &mut node.entries[idx] {
            Entry::Node { bbox, child } => {
                let split = insert_entry(child, entry, target_level, max, min)?;
                *bbox = mbr(&child.entries).ok_or_else(level_mismatch)?;
                split
            }
            Entry::Record { .. } => return Err(level_mismatch()),
        };
        if let Some(sibling) = split {
            let bbox = mbr(&sibling.entries).ok_or_else(level_mismatch)?;
            node.entries.push(Entry::Node {
                bbox,
                child: Box::new(sibling),
            });
        }
    }

    if node.entries.len() > max {
        Ok(Some(split_node(node, min)))
    } else {
        Ok(None)
    }
}

/// Child needing the least volume enlargement to cover `bbox`, ties
/// broken by smaller volume.
fn choose_subtree(node: &RtNode, bbox: &BoundingBox) -> Result<usize> {
    let mut best: Option<(usize, f64, f64)> = None;
    for (idx, entry) in node.entries.iter().enumerate() {
        let enlargement = entry.bbox().enlargement(bbox);
        let volume = entry.bbox().volume();
        let better = match best {
            None => true,
            Some((_, best_enl, best_vol)) => {
                enlargement < best_enl || (enlargement == best_enl && volume < best_vol)
            }
        };
        if better {
            best = Some((idx, enlargement, volume));
        }
    }
    best.map(|(idx, _, _)| idx).ok_or_else(level_mismatch)
}

/// Quadratic split: seed with the pair wasting the most dead space, then
/// assign each remaining entry to the group its box enlarges less, forcing
/// assignment when a group needs every remaining entry to reach `min`.
/// The node keeps the first group; the second is returned.
fn split_node(node: &mut RtNode, min: usize) -> RtNode {
    let mut rest = std::mem::take(&mut node.entries);

    let mut seeds = (0, 1);
    let mut worst = f64::NEG_INFINITY;
    for i in 0..rest.len() {
        for j in (i + 1)..rest.len() {
            let a = rest[i].bbox();
            let b = rest[j].bbox();
            let dead = a.union(b).volume() - a.volume() - b.volume();
            if dead > worst {
                worst = dead;
                seeds = (i, j);
            }
        }
    }
    // Remove the higher index first so the lower one stays valid.
    let seed_b = rest.remove(seeds.1);
    let seed_a = rest.remove(seeds.0);
    let mut bbox_a = *seed_a.bbox();
    let mut bbox_b = *seed_b.bbox();
    let mut group_a = vec![seed_a];
    let mut group_b = vec![seed_b];

    while let Some(entry) = rest.pop() {
        let remaining = rest.len() + 1;
        let to_a = if min.saturating_sub(group_a.len()) >= remaining {
            true
        } else if min.saturating_sub(group_b.len()) >= remaining {
            false
        } else {
            let enl_a = bbox_a.enlargement(entry.bbox());
            let enl_b = bbox_b.enlargement(entry.bbox());
            if enl_a != enl_b {
                enl_a < enl_b
            } else if bbox_a.volume() != bbox_b.volume() {
                bbox_a.volume() < bbox_b.volume()
            } else {
                group_a.len() <= group_b.len()
            }
        };
        if to_a {
            bbox_a = bbox_a.union(entry.bbox());
            group_a.push(entry);
        } else {
            bbox_b = bbox_b.union(entry.bbox());
            group_b.push(entry);
        }
    }

    node.entries = group_a;
    RtNode {
        level: node.level,
        entries: group_b,
    }
}

/// Smallest box covering every entry, `None` for an empty slice.
fn mbr(entries: &[Entry]) -> Option<BoundingBox> {
    let mut iter = entries.iter();
    let first = *iter.next()?.bbox();
    Some(iter.fold(first, |acc, e| acc.union(e.bbox())))
}

fn find_position(node: &RtNode, target: &BoundingBox) -> Option<Position> {
    for entry in &node.entries {
        match entry {
            Entry::Record { bbox, position } => {
                if bbox.same_extent(target) {
                    return Some(*position);
                }
            }
            Entry::Node { bbox, child } => {
                if bbox.intersects(target) {
                    if let Some(position) = find_position(child, target) {
                        return Some(position);
                    }
                }
            }
        }
    }
    None
}

/// Removes the exact-extent entry, tightening boxes on the way back up and
/// detaching nodes that fall under `min`. Detached entries land in
/// `orphans` for level-preserving reinsertion.
fn delete_entry(
    node: &mut RtNode,
    target: &BoundingBox,
    min: usize,
    orphans: &mut Vec<Entry>,
) -> Result<bool> {
    if node.level == 0 {
        if let Some(idx) = node
            .entries
            .iter()
            .position(|e| e.bbox().same_extent(target))
        {
            node.entries.remove(idx);
            return Ok(true);
        }
        return Ok(false);
    }

    for idx in 0..node.entries.len() {
        if !node.entries[idx].bbox().intersects(target) {
            continue;
        }
        let removed = match &mut node.entries[idx] {
            Entry::Node { child, .. } => delete_entry(child, target, min, orphans)?,
            Entry::Record { .. } => return Err(level_mismatch()),
        };
        if !removed {
            continue;
        }
        let underfull = match &node.entries[idx] {
            Entry::Node { child, .. } => child.entries.len() < min,
            Entry::Record { .. } => return Err(level_mismatch()),
        };
        if underfull {
            match node.entries.remove(idx) {
                Entry::Node { child, .. } => orphans.extend(child.entries),
                Entry::Record { .. } => return Err(level_mismatch()),
            }
        } else {
            match &mut node.entries[idx] {
                Entry::Node { bbox, child } => {
                    *bbox = mbr(&child.entries).ok_or_else(level_mismatch)?;
                }
                Entry::Record { .. } => return Err(level_mismatch()),
            }
        }
        return Ok(true);
    }
    Ok(false)
}

fn repoint(node: &mut RtNode, target: &BoundingBox, new_position: Position) -> bool {
    for entry in node.entries.iter_mut() {
        match entry {
            Entry::Record { bbox, position } => {
                if bbox.same_extent(target) {
                    *position = new_position;
                    return true;
                }
            }
            Entry::Node { bbox, child } => {
                if bbox.intersects(target) && repoint(child, target, new_position) {
                    return true;
                }
            }
        }
    }
    false
}

fn collect_positions(node: &RtNode, out: &mut Vec<Position>) {
    for entry in &node.entries {
        match entry {
            Entry::Record { position, .. } => out.push(*position),
            Entry::Node { child, .. } => collect_positions(child, out),
        }
    }
}

fn remap_positions(node: &mut RtNode, remap: &HashMap<Position, Position>) {
    for entry in node.entries.iter_mut() {
        match entry {
            Entry::Record { position, .. } => {
                if let Some(&new_position) = remap.get(position) {
                    *position = new_position;
                }
            }
            Entry::Node { child, .. } => remap_positions(child, remap),
        }
    }
}

fn count_records(node: &RtNode) -> usize {
    node.entries
        .iter()
        .map(|e| match e {
            Entry::Record { .. } => 1,
            Entry::Node { child, .. } => count_records(child),
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    fn create_test_index(max_children: usize) -> (RTreeIndex, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let index = RTreeIndex::open(
            dir.path().join("keys.rtx"),
            dir.path().join("records.jsonl"),
            RTreeConfig { max_children },
        )
        .unwrap();
        (index, dir)
    }

    fn point(x: f64, y: f64) -> BoundingBox {
        BoundingBox::point([x, y, 0.0])
    }

    fn city(name: &str, x: f64, y: f64) -> Record {
        Record::new()
            .with("name", name)
            .with("x", x)
            .with("y", y)
    }

    fn names_of(mut records: Vec<Record>) -> Vec<String> {
        let mut names: Vec<String> = records
            .drain(..)
            .map(|r| r.get("name").unwrap().as_str().unwrap().to_string())
            .collect();
        names.sort();
        names
    }

    /// Structural invariants: entry kinds match levels, child levels
    /// decrease by one, every internal box covers its subtree, and
    /// non-root nodes respect the fill bounds.
    fn assert_well_formed(index: &RTreeIndex) {
        fn check(node: &RtNode, max: usize, min: usize, is_root: bool) -> BoundingBox {
            assert!(node.entries.len() <= max, "node over capacity");
            if !is_root {
                assert!(node.entries.len() >= min, "non-root node underfull");
            }
            let mut covered: Option<BoundingBox> = None;
            for entry in &node.entries {
                let child_bbox = match entry {
                    Entry::Record { bbox, .. } => {
                        assert_eq!(node.level, 0, "record entry above leaf level");
                        *bbox
                    }
                    Entry::Node { bbox, child } => {
                        assert!(node.level > 0, "node entry at leaf level");
                        assert_eq!(child.level + 1, node.level, "level gap");
                        let actual = check(child, max, min, false);
                        assert!(
                            bbox.same_extent(&actual),
                            "stored box does not match subtree extent"
                        );
                        *bbox
                    }
                };
                covered = Some(match covered {
                    None => child_bbox,
                    Some(acc) => acc.union(&child_bbox),
                });
            }
            covered.unwrap_or(BoundingBox::point([0.0, 0.0, 0.0]))
        }
        check(&index.root, index.max_children, index.min_children(), true);
    }

    #[test]
    fn test_insert_and_exact_search() {
        let (mut index, _dir) = create_test_index(4);
        assert!(index.insert(&point(1.0, 1.0), &city("lima", 1.0, 1.0)).unwrap());
        assert!(index.insert(&point(5.0, 5.0), &city("cusco", 5.0, 5.0)).unwrap());

        assert_eq!(
            index.search(&point(1.0, 1.0)).unwrap(),
            Some(city("lima", 1.0, 1.0))
        );
        assert_eq!(index.search(&point(9.0, 9.0)).unwrap(), None);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_duplicate_box_is_noop() {
        let (mut index, _dir) = create_test_index(4);
        assert!(index.insert(&point(1.0, 1.0), &city("a", 1.0, 1.0)).unwrap());
        let log_len = index.store.len().unwrap();

        assert!(!index.insert(&point(1.0, 1.0), &city("b", 1.0, 1.0)).unwrap());
        assert_eq!(index.store.len().unwrap(), log_len);
        assert_eq!(index.search(&point(1.0, 1.0)).unwrap(), Some(city("a", 1.0, 1.0)));
    }

    #[test]
    fn test_fifth_point_splits_root() {
        let (mut index, _dir) = create_test_index(4);
        let points = [(0.0, 0.0), (1.0, 0.0), (10.0, 10.0), (11.0, 10.0), (0.5, 0.5)];
        for (i, &(x, y)) in points.iter().enumerate() {
            index
                .insert(&point(x, y), &city(&format!("p{i}"), x, y))
                .unwrap();
        }
        assert!(index.root.level > 0, "root did not split");
        assert_well_formed(&index);

        // Full-extent query still finds all five.
        let hits = index
            .search_box(&BoundingBox::new([-1.0, -1.0, -1.0], [20.0, 20.0, 1.0]))
            .unwrap();
        assert_eq!(hits.len(), 5);
    }

    #[test]
    fn test_search_box_filters_by_point() {
        let (mut index, _dir) = create_test_index(4);
        for (name, x, y) in [("a", 1.0, 1.0), ("b", 2.0, 2.0), ("c", 8.0, 8.0)] {
            index.insert(&point(x, y), &city(name, x, y)).unwrap();
        }
        let hits = index
            .search_box(&BoundingBox::new([0.0, 0.0, 0.0], [3.0, 3.0, 0.0]))
            .unwrap();
        assert_eq!(names_of(hits), vec!["a", "b"]);
    }

    #[test]
    fn test_search_sphere() {
        let (mut index, _dir) = create_test_index(4);
        for (name, x, y) in [("near", 1.0, 0.0), ("edge", 3.0, 0.0), ("far", 10.0, 0.0)] {
            index.insert(&point(x, y), &city(name, x, y)).unwrap();
        }
        // Radius reaches "edge" exactly.
        let hits = index.search_sphere(&Sphere::new([0.0, 0.0, 0.0], 3.0)).unwrap();
        assert_eq!(names_of(hits), vec!["edge", "near"]);
    }

    #[test]
    fn test_delete_and_condense() {
        let (mut index, _dir) = create_test_index(4);
        for i in 0..12 {
            let x = f64::from(i);
            index
                .insert(&point(x, x), &city(&format!("p{i}"), x, x))
                .unwrap();
        }
        assert_well_formed(&index);

        for i in [3, 7, 1, 10, 5] {
            let x = f64::from(i);
            assert!(index.delete(&point(x, x)).unwrap());
        }
        assert!(!index.delete(&point(3.0, 3.0)).unwrap());
        assert_eq!(index.len(), 7);
        assert_well_formed(&index);

        let hits = index
            .search_box(&BoundingBox::new([-1.0, -1.0, -1.0], [20.0, 20.0, 1.0]))
            .unwrap();
        assert_eq!(hits.len(), 7);
        assert_eq!(index.search(&point(3.0, 3.0)).unwrap(), None);
    }

    #[test]
    fn test_delete_everything_resets_to_leaf() {
        let (mut index, _dir) = create_test_index(4);
        for i in 0..9 {
            let x = f64::from(i);
            index
                .insert(&point(x, 0.0), &city(&format!("p{i}"), x, 0.0))
                .unwrap();
        }
        for i in 0..9 {
            assert!(index.delete(&point(f64::from(i), 0.0)).unwrap());
        }
        assert!(index.is_empty());
        assert_eq!(index.root.level, 0);
    }

    #[test]
    fn test_update_repoints_record() {
        let (mut index, _dir) = create_test_index(4);
        index.insert(&point(1.0, 1.0), &city("old", 1.0, 1.0)).unwrap();
        assert!(index.update(&point(1.0, 1.0), &city("new", 1.0, 1.0)).unwrap());
        assert_eq!(
            index.search(&point(1.0, 1.0)).unwrap(),
            Some(city("new", 1.0, 1.0))
        );
        assert!(!index.update(&point(9.0, 9.0), &city("x", 9.0, 9.0)).unwrap());
    }

    #[test]
    fn test_compaction_drops_stale_log_entries() {
        let (mut index, _dir) = create_test_index(4);
        for i in 0..6 {
            let x = f64::from(i);
            index
                .insert(&point(x, x), &city(&format!("p{i}"), x, x))
                .unwrap();
        }
        for i in 0..6 {
            let x = f64::from(i);
            index
                .update(&point(x, x), &city(&format!("v2-{i}"), x, x))
                .unwrap();
        }
        let len_before = index.store.len().unwrap();
        index.compact_data_file().unwrap();
        assert!(index.store.len().unwrap() < len_before);

        for i in 0..6 {
            let x = f64::from(i);
            assert_eq!(
                index.search(&point(x, x)).unwrap(),
                Some(city(&format!("v2-{i}"), x, x))
            );
        }
        assert_well_formed(&index);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let index_path = dir.path().join("keys.rtx");
        let data_path = dir.path().join("records.jsonl");
        {
            let mut index =
                RTreeIndex::open(&index_path, &data_path, RTreeConfig { max_children: 4 }).unwrap();
            for i in 0..7 {
                let x = f64::from(i);
                index
                    .insert(&point(x, x), &city(&format!("p{i}"), x, x))
                    .unwrap();
            }
        }
        // Snapshot wins over a different configured capacity.
        let index =
            RTreeIndex::open(&index_path, &data_path, RTreeConfig { max_children: 16 }).unwrap();
        assert_eq!(index.max_children(), 4);
        assert_eq!(index.len(), 7);
        assert_eq!(index.search(&point(3.0, 3.0)).unwrap(), Some(city("p3", 3.0, 3.0)));
        assert_well_formed(&index);
    }

    #[test]
    fn test_randomized_against_reference() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x57EE);
        let (mut index, _dir) = create_test_index(6);
        let mut reference: Vec<(f64, f64)> = Vec::new();

        for _ in 0..300 {
            let x = f64::from(rng.gen_range(0..40));
            let y = f64::from(rng.gen_range(0..40));
            if rng.gen_bool(0.7) {
                let inserted = index
                    .insert(&point(x, y), &city(&format!("{x}-{y}"), x, y))
                    .unwrap();
                assert_eq!(inserted, !reference.contains(&(x, y)));
                if inserted {
                    reference.push((x, y));
                }
            } else {
                let deleted = index.delete(&point(x, y)).unwrap();
                assert_eq!(deleted, reference.contains(&(x, y)));
                reference.retain(|&p| p != (x, y));
            }
        }
        assert_eq!(index.len(), reference.len());
        assert_well_formed(&index);

        let query = BoundingBox::new([5.0, 5.0, 0.0], [25.0, 25.0, 0.0]);
        let expected = reference
            .iter()
            .filter(|&&(x, y)| (5.0..=25.0).contains(&x) && (5.0..=25.0).contains(&y))
            .count();
        assert_eq!(index.search_box(&query).unwrap().len(), expected);
    }
}
