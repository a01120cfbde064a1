//! Extendible hash index.
//!
//! The directory holds `2^global_depth` entries indexed by the top
//! `global_depth` bits of a 32-bit key hash; each entry names a bucket in a
//! slab, so aliasing after a directory doubling is plain index equality,
//! and buddy checks compare identifiers rather than object identity.
//! Inserting into a full bucket whose `local_depth` equals the global depth
//! doubles the directory first, then splits the bucket on the next hash
//! bit. Deletes try to fold a bucket into its buddy and halve the directory
//! back down. The whole structure is a snapshot rewritten after every
//! mutation; only point lookups are supported.

use keystone_common::{HashConfig, KeystoneError, Position, Record, Result};
use keystone_store::RecordStore;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Hard ceiling: the hash has 32 bits to hand out as directory prefixes.
const MAX_GLOBAL_DEPTH: u32 = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Bucket {
    local_depth: u32,
    entries: Vec<(i64, Position)>,
}

impl Bucket {
    fn new(local_depth: u32) -> Self {
        Self {
            local_depth,
            entries: Vec::new(),
        }
    }
}

/// Serialized snapshot of the whole structure.
#[derive(Debug, Serialize, Deserialize)]
struct HashState {
    global_depth: u32,
    bucket_capacity: usize,
    /// `2^global_depth` bucket ids, indexed by hash prefix.
    directory: Vec<usize>,
    buckets: Vec<Bucket>,
    /// Dead slab entries available for reuse after merges.
    free: Vec<usize>,
}

impl HashState {
    fn initial(bucket_capacity: usize) -> Self {
        Self {
            global_depth: 1,
            bucket_capacity,
            directory: vec![0, 1],
            buckets: vec![Bucket::new(1), Bucket::new(1)],
            free: Vec::new(),
        }
    }
}

/// Extendible hash over integer keys. Equality lookups only.
pub struct ExtendibleHashIndex {
    path: PathBuf,
    store: RecordStore,
    state: HashState,
}

fn hash_key(key: i64) -> u32 {
    crc32fast::hash(&key.to_le_bytes())
}

/// Index into a `2^depth`-entry directory: the top `depth` hash bits.
fn dir_index(hash: u32, depth: u32) -> usize {
    if depth == 0 {
        0
    } else {
        (hash >> (32 - depth)) as usize
    }
}

/// Hash bit at `depth`, counting from the most significant bit.
fn hash_bit(hash: u32, depth: u32) -> u32 {
    (hash >> (31 - depth)) & 1
}

/// Bit at `depth` of a directory index made of `global_depth` bits.
fn index_bit(index: usize, depth: u32, global_depth: u32) -> u32 {
    ((index >> (global_depth - 1 - depth)) & 1) as u32
}

impl ExtendibleHashIndex {
    /// Opens or creates a hash index. An existing snapshot keeps the bucket
    /// capacity it was created with; `config` only seeds a fresh index.
    pub fn open(
        index_path: impl Into<PathBuf>,
        data_path: impl Into<PathBuf>,
        config: HashConfig,
    ) -> Result<Self> {
        config.validate()?;
        let path = index_path.into();
        let store = RecordStore::open(data_path)?;

        let state = if path.exists() {
            let state: HashState = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
            if state.directory.len() != 1usize << state.global_depth {
                return Err(KeystoneError::CorruptIndex(format!(
                    "hash directory has {} entries for global depth {}",
                    state.directory.len(),
                    state.global_depth
                )));
            }
            state
        } else {
            let state = HashState::initial(config.bucket_capacity);
            write_snapshot(&path, &state)?;
            state
        };

        Ok(Self { path, store, state })
    }

    pub fn global_depth(&self) -> u32 {
        self.state.global_depth
    }

    pub fn bucket_capacity(&self) -> usize {
        self.state.bucket_capacity
    }

    /// Inserts a key and its record. Returns `false` without touching the
    /// log or the directory when the key already exists.
    pub fn insert(&mut self, key: i64, record: &Record) -> Result<bool> {
        if self.find_entry(key).is_some() {
            warn!(key, "duplicate key ignored by hash index");
            return Ok(false);
        }

        // Make room before touching the log; a directory stuck at the depth
        // ceiling must not leave orphan bytes behind.
        let hash = hash_key(key);
        loop {
            let bucket_id = self.state.directory[dir_index(hash, self.state.global_depth)];
            if self.state.buckets[bucket_id].entries.len() < self.state.bucket_capacity {
                break;
            }
            if self.state.buckets[bucket_id].local_depth == self.state.global_depth {
                self.double_directory()?;
            }
            self.split_bucket(bucket_id);
        }

        let position = self.store.append(record)?;
        let bucket_id = self.state.directory[dir_index(hash, self.state.global_depth)];
        self.state.buckets[bucket_id].entries.push((key, position));
        self.save()?;
        Ok(true)
    }

    /// Point lookup.
    pub fn search(&self, key: i64) -> Result<Option<Record>> {
        match self.find_entry(key) {
            Some((_, _, position)) => Ok(Some(self.store.read(position)?)),
            None => Ok(None),
        }
    }

    /// Removes a key, folding buckets back together where possible. The
    /// record bytes stay in the log until compaction.
    pub fn delete(&mut self, key: i64) -> Result<bool> {
        let Some((bucket_id, entry_idx, _)) = self.find_entry(key) else {
            warn!(key, "delete of missing key ignored by hash index");
            return Ok(false);
        };
        self.state.buckets[bucket_id].entries.remove(entry_idx);

        self.sweep_merges();
        self.shrink_directory();
        self.save()?;
        Ok(true)
    }

    /// Replaces the record for an existing key: append then repoint.
    pub fn update(&mut self, key: i64, record: &Record) -> Result<bool> {
        let Some((bucket_id, entry_idx, _)) = self.find_entry(key) else {
            warn!(key, "update of missing key ignored by hash index");
            return Ok(false);
        };
        let position = self.store.append(record)?;
        self.state.buckets[bucket_id].entries[entry_idx].1 = position;
        self.save()?;
        Ok(true)
    }

    /// Rewrites the record log keeping only live records and repoints every
    /// bucket entry.
    pub fn compact_data_file(&mut self) -> Result<()> {
        let mut order = Vec::new();
        for &bucket_id in &self.live_buckets() {
            order.extend(self.state.buckets[bucket_id].entries.iter().map(|&(_, p)| p));
        }

        let remap = self.store.rewrite(&order)?;
        for &bucket_id in &self.live_buckets() {
            for entry in self.state.buckets[bucket_id].entries.iter_mut() {
                if let Some(&new_pos) = remap.get(&entry.1) {
                    entry.1 = new_pos;
                }
            }
        }
        self.save()?;
        debug!(live = remap.len(), "hash data file compacted");
        Ok(())
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.live_buckets()
            .iter()
            .map(|&id| self.state.buckets[id].entries.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes both backing files.
    pub fn destroy(self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        self.store.destroy()
    }

    // =====
    // Directory maintenance
    // =====

    /// Doubles the directory: prefix `p` fans out into `p0` and `p1`, both
    /// aliasing the bucket `p` named.
    fn double_directory(&mut self) -> Result<()> {
        if self.state.global_depth >= MAX_GLOBAL_DEPTH {
            return Err(KeystoneError::CorruptIndex(
                "hash directory cannot grow past 32 bits".to_string(),
            ));
        }
        let mut directory = Vec::with_capacity(self.state.directory.len() * 2);
        for &bucket_id in &self.state.directory {
            directory.push(bucket_id);
            directory.push(bucket_id);
        }
        self.state.directory = directory;
        self.state.global_depth += 1;
        debug!(global_depth = self.state.global_depth, "hash directory doubled");
        Ok(())
    }

    /// Splits one full bucket on its next hash bit. The original bucket
    /// keeps the 0-side entries; the 1-side moves to a fresh slab entry.
    fn split_bucket(&mut self, bucket_id: usize) {
        let old_depth = self.state.buckets[bucket_id].local_depth;
        let entries = std::mem::take(&mut self.state.buckets[bucket_id].entries);

        let (zeros, ones): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|&(key, _)| hash_bit(hash_key(key), old_depth) == 0);

        self.state.buckets[bucket_id].local_depth = old_depth + 1;
        self.state.buckets[bucket_id].entries = zeros;

        let new_id = self.alloc_bucket(Bucket {
            local_depth: old_depth + 1,
            entries: ones,
        });
        let global_depth = self.state.global_depth;
        for i in 0..self.state.directory.len() {
            if self.state.directory[i] == bucket_id && index_bit(i, old_depth, global_depth) == 1 {
                self.state.directory[i] = new_id;
            }
        }
    }

    /// Runs buddy merges across the whole directory until nothing folds.
    /// Merging only the deleted key's chain can strand an empty deep bucket
    /// whose buddy emptied earlier, pinning the directory at full width.
    fn sweep_merges(&mut self) {
        loop {
            let merged_before = self.state.free.len();
            let global_depth = self.state.global_depth;
            for i in 0..self.state.directory.len() {
                let hash = (i as u32) << (32 - global_depth);
                self.merge_with_buddy(hash);
            }
            if self.state.free.len() == merged_before {
                break;
            }
        }
    }

    /// Repeatedly folds the bucket for `hash` into its buddy while both
    /// sides agree on depth and fit one bucket.
    fn merge_with_buddy(&mut self, hash: u32) {
        loop {
            let global_depth = self.state.global_depth;
            let index = dir_index(hash, global_depth);
            let bucket_id = self.state.directory[index];
            let depth = self.state.buckets[bucket_id].local_depth;
            if depth == 0 {
                break;
            }

            // The buddy prefix differs in the last bit of the local prefix.
            let buddy_index = index ^ (1usize << (global_depth - depth));
            let buddy_id = self.state.directory[buddy_index];
            if buddy_id == bucket_id {
                break;
            }
            if self.state.buckets[buddy_id].local_depth != depth {
                break;
            }
            let combined = self.state.buckets[bucket_id].entries.len()
                + self.state.buckets[buddy_id].entries.len();
            if combined > self.state.bucket_capacity {
                break;
            }

            let moved = std::mem::take(&mut self.state.buckets[buddy_id].entries);
            self.state.buckets[bucket_id].entries.extend(moved);
            self.state.buckets[bucket_id].local_depth = depth - 1;
            self.state.free.push(buddy_id);
            for entry in self.state.directory.iter_mut() {
                if *entry == buddy_id {
                    *entry = bucket_id;
                }
            }
            debug!(local_depth = depth - 1, "hash buckets merged");
        }
    }

    /// Halves the directory while no bucket needs the full prefix width.
    /// The directory never shrinks below one bit.
    fn shrink_directory(&mut self) {
        while self.state.global_depth > 1 {
            let global_depth = self.state.global_depth;
            let all_shallow = self
                .state
                .directory
                .iter()
                .all(|&id| self.state.buckets[id].local_depth < global_depth);
            if !all_shallow {
                break;
            }
            let halved: Vec<usize> = self
                .state
                .directory
                .chunks(2)
                .map(|pair| pair[0])
                .collect();
            self.state.directory = halved;
            self.state.global_depth -= 1;
            debug!(global_depth = self.state.global_depth, "hash directory halved");
        }
    }

    fn alloc_bucket(&mut self, bucket: Bucket) -> usize {
        if let Some(id) = self.state.free.pop() {
            self.state.buckets[id] = bucket;
            id
        } else {
            self.state.buckets.push(bucket);
            self.state.buckets.len() - 1
        }
    }

    /// Finds `(bucket_id, entry_index, position)` for an exact key.
    fn find_entry(&self, key: i64) -> Option<(usize, usize, Position)> {
        let bucket_id = self.state.directory[dir_index(hash_key(key), self.state.global_depth)];
        self.state.buckets[bucket_id]
            .entries
            .iter()
            .position(|&(k, _)| k == key)
            .map(|idx| (bucket_id, idx, self.state.buckets[bucket_id].entries[idx].1))
    }

    /// Bucket ids referenced by the directory, first appearance order.
    fn live_buckets(&self) -> Vec<usize> {
        let mut seen = Vec::new();
        for &id in &self.state.directory {
            if !seen.contains(&id) {
                seen.push(id);
            }
        }
        seen
    }

    fn save(&self) -> Result<()> {
        write_snapshot(&self.path, &self.state)
    }
}

/// Writes the snapshot to a sibling file and renames it into place.
fn write_snapshot(path: &PathBuf, state: &HashState) -> Result<()> {
    let tmp_path = {
        let mut os = path.as_os_str().to_os_string();
        os.push(".tmp");
        PathBuf::from(os)
    };
    std::fs::write(&tmp_path, serde_json::to_vec(state)?)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
