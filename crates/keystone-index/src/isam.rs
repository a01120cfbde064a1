//! ISAM index: a static two-level index over sorted data pages.
//!
//! The page structure is built by `bulk_load` and never rebalanced by
//! ordinary inserts: a full data page grows an overflow chain instead, and
//! only `reorganize` folds the chains back into a fresh static structure.
//! Pages hold `(key, position)` entries; index pages map a child's maximum
//! key to its pointer, with `i64::MAX` as the bootstrap sentinel so an
//! empty index still routes every key somewhere. State is persisted in
//! three files: data and overflow pages, index pages, and a small metadata
//! file holding the root pointer and the block factors.

use keystone_common::{IsamConfig, KeystoneError, Position, Record, Result};
use keystone_store::RecordStore;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DataPage {
    entries: Vec<(i64, Position)>,
    overflow: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OverflowPage {
    entries: Vec<(i64, Position)>,
    next: Option<usize>,
}

/// Index page: `(max_key_of_child, child_ptr)` entries in ascending order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IndexPage {
    entries: Vec<(i64, usize)>,
}

impl IndexPage {
    /// Routes a key to the child whose max key first covers it, falling to
    /// the last child for keys beyond every separator.
    fn find_child(&self, key: i64) -> Option<usize> {
        let idx = self.entries.partition_point(|&(k, _)| k < key);
        if idx < self.entries.len() {
            Some(self.entries[idx].1)
        } else {
            self.entries.last().map(|&(_, p)| p)
        }
    }

    fn max_key(&self) -> Option<i64> {
        self.entries.last().map(|&(k, _)| k)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PagesFile {
    data_pages: Vec<DataPage>,
    overflow_pages: Vec<OverflowPage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetaFile {
    root_ptr: usize,
    data_block_factor: usize,
    index_block_factor: usize,
}

/// ISAM over integer keys with overflow chaining.
pub struct IsamIndex {
    pages_path: PathBuf,
    index_path: PathBuf,
    meta_path: PathBuf,
    store: RecordStore,
    data_pages: Vec<DataPage>,
    overflow_pages: Vec<OverflowPage>,
    index_pages: Vec<IndexPage>,
    root_ptr: usize,
    data_bf: usize,
    index_bf: usize,
}

impl IsamIndex {
    /// Opens or creates an ISAM index. `base_path` names the index; the
    /// three structure files are derived from it. An existing index keeps
    /// the block factors it was built with.
    pub fn open(
        base_path: impl Into<PathBuf>,
        data_path: impl Into<PathBuf>,
        config: IsamConfig,
    ) -> Result<Self> {
        config.validate()?;
        let base_path = base_path.into();
        let with_suffix = |suffix: &str| {
            let mut os = base_path.as_os_str().to_os_string();
            os.push(suffix);
            PathBuf::from(os)
        };
        let pages_path = with_suffix(".pages");
        let index_path = with_suffix(".index");
        let meta_path = with_suffix(".meta");
        let store = RecordStore::open(data_path)?;

        let mut isam = Self {
            pages_path,
            index_path,
            meta_path,
            store,
            data_pages: Vec::new(),
            overflow_pages: Vec::new(),
            index_pages: Vec::new(),
            root_ptr: 0,
            data_bf: config.data_block_factor,
            index_bf: config.index_block_factor,
        };

        if isam.pages_path.exists() && isam.index_path.exists() && isam.meta_path.exists() {
            let pages: PagesFile =
                serde_json::from_str(&std::fs::read_to_string(&isam.pages_path)?)?;
            let index_pages: Vec<IndexPage> =
                serde_json::from_str(&std::fs::read_to_string(&isam.index_path)?)?;
            let meta: MetaFile = serde_json::from_str(&std::fs::read_to_string(&isam.meta_path)?)?;
            if meta.root_ptr >= index_pages.len() {
                return Err(KeystoneError::CorruptIndex(format!(
                    "ISAM root pointer {} out of range ({} index pages)",
                    meta.root_ptr,
                    index_pages.len()
                )));
            }
            isam.data_pages = pages.data_pages;
            isam.overflow_pages = pages.overflow_pages;
            isam.index_pages = index_pages;
            isam.root_ptr = meta.root_ptr;
            isam.data_bf = meta.data_block_factor;
            isam.index_bf = meta.index_block_factor;
        } else {
            isam.reset_empty();
            isam.save()?;
        }
        Ok(isam)
    }

    pub fn data_block_factor(&self) -> usize {
        self.data_bf
    }

    pub fn data_page_count(&self) -> usize {
        self.data_pages.len()
    }

    pub fn overflow_page_count(&self) -> usize {
        self.overflow_pages.len()
    }

    /// Inserts a key and its record. A full home page grows its overflow
    /// chain; the static index pages never change.
    pub fn insert(&mut self, key: i64, record: &Record) -> Result<bool> {
        if self.find_position(key)?.is_some() {
            warn!(key, "duplicate key ignored by ISAM index");
            return Ok(false);
        }

        let position = self.store.append(record)?;
        let page_ptr = self.find_data_page(key)?;
        let page = &mut self.data_pages[page_ptr];

        if page.entries.len() < self.data_bf {
            let idx = page.entries.partition_point(|&(k, _)| k < key);
            page.entries.insert(idx, (key, position));
        } else {
            debug!(key, page = page_ptr, "data page full, spilling to overflow");
            self.insert_overflow(page_ptr, key, position);
        }
        self.save()?;
        Ok(true)
    }

    /// Point lookup through the static levels, then the overflow chain.
    pub fn search(&self, key: i64) -> Result<Option<Record>> {
        match self.find_position(key)? {
            Some(position) => Ok(Some(self.store.read(position)?)),
            None => Ok(None),
        }
    }

    /// Returns the records with `low <= key <= high` in key order. The
    /// index levels bound the scan to the pages whose key intervals touch
    /// the range; each page is merged with its overflow chain, and pages
    /// partition the key space, so per-page sorting yields a globally
    /// ordered result.
    pub fn range_search(&self, low: i64, high: i64) -> Result<Vec<Record>> {
        if low > high {
            return Ok(Vec::new());
        }
        let first = self.find_data_page(low)?;
        let last = self.find_data_page(high)?;
        let mut results = Vec::new();
        for page in &self.data_pages[first..=last] {
            let mut hits: Vec<(i64, Position)> = page
                .entries
                .iter()
                .copied()
                .filter(|&(k, _)| low <= k && k <= high)
                .collect();
            let mut overflow = page.overflow;
            while let Some(ptr) = overflow {
                let op = &self.overflow_pages[ptr];
                hits.extend(op.entries.iter().copied().filter(|&(k, _)| low <= k && k <= high));
                overflow = op.next;
            }
            hits.sort_by_key(|&(k, _)| k);
            for (_, position) in hits {
                results.push(self.store.read(position)?);
            }
        }
        Ok(results)
    }

    /// Removes a key from its page or overflow chain. Chains are never
    /// unlinked here; only `reorganize` reclaims them.
    pub fn delete(&mut self, key: i64) -> Result<bool> {
        let page_ptr = self.find_data_page(key)?;
        let page = &mut self.data_pages[page_ptr];
        if let Some(idx) = page.entries.iter().position(|&(k, _)| k == key) {
            page.entries.remove(idx);
            self.save()?;
            return Ok(true);
        }

        let mut overflow = page.overflow;
        while let Some(ptr) = overflow {
            let op = &mut self.overflow_pages[ptr];
            if let Some(idx) = op.entries.iter().position(|&(k, _)| k == key) {
                op.entries.remove(idx);
                self.save()?;
                return Ok(true);
            }
            overflow = op.next;
        }

        warn!(key, "delete of missing key ignored by ISAM index");
        Ok(false)
    }

    /// Replaces the record for an existing key: append then repoint.
    pub fn update(&mut self, key: i64, record: &Record) -> Result<bool> {
        if self.find_position(key)?.is_none() {
            warn!(key, "update of missing key ignored by ISAM index");
            return Ok(false);
        }
        let position = self.store.append(record)?;

        let page_ptr = self.find_data_page(key)?;
        let page = &mut self.data_pages[page_ptr];
        if let Some(entry) = page.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = position;
            self.save()?;
            return Ok(true);
        }
        let mut overflow = page.overflow;
        while let Some(ptr) = overflow {
            let op = &mut self.overflow_pages[ptr];
            if let Some(entry) = op.entries.iter_mut().find(|(k, _)| *k == key) {
                entry.1 = position;
                self.save()?;
                return Ok(true);
            }
            overflow = op.next;
        }
        Err(KeystoneError::CorruptIndex(format!(
            "key {key} vanished between lookup and update"
        )))
    }

    /// Every live `(key, record)` pair in ascending key order.
    pub fn get_all_records_sorted(&self) -> Result<Vec<(i64, Record)>> {
        let mut records = Vec::with_capacity(self.len());
        for (key, position) in self.all_entries_sorted() {
            records.push((key, self.store.read(position)?));
        }
        Ok(records)
    }

    /// Rebuilds the whole structure from sorted records: the record log is
    /// truncated and refilled in key order, data pages are packed to the
    /// block factor, and both index levels are rebuilt from max keys. There
    /// is no third level; a load the root cannot address is rejected before
    /// the log or any page is touched, leaving the index as it was.
    pub fn bulk_load(&mut self, sorted_records: &[(i64, Record)]) -> Result<()> {
        if sorted_records.is_empty() {
            warn!("bulk load of zero records ignored");
            return Ok(());
        }
        if !sorted_records.windows(2).all(|w| w[0].0 < w[1].0) {
            return Err(KeystoneError::InvalidParameter {
                name: "sorted_records".to_string(),
                value: "keys not strictly ascending".to_string(),
            });
        }

        // Pages are packed exactly to the block factors, so the page counts
        // are known before anything is built.
        let data_page_count = sorted_records.len().div_ceil(self.data_bf);
        let l1_page_count = data_page_count.div_ceil(self.index_bf);
        if l1_page_count > self.index_bf {
            return Err(KeystoneError::CorruptIndex(format!(
                "bulk load of {} records needs {} level-1 pages, root holds at most {}",
                sorted_records.len(),
                l1_page_count,
                self.index_bf
            )));
        }

        self.store.truncate()?;
        self.data_pages.clear();
        self.overflow_pages.clear();
        self.index_pages.clear();

        let mut current = DataPage::default();
        for (key, record) in sorted_records {
            let position = self.store.append(record)?;
            if current.entries.len() >= self.data_bf {
                self.data_pages.push(current);
                current = DataPage::default();
            }
            current.entries.push((*key, position));
        }
        self.data_pages.push(current);

        // Level 1: one entry per data page, keyed by its max key.
        let mut l1_ptrs = vec![0usize];
        let mut l1 = IndexPage::default();
        for (i, page) in self.data_pages.iter().enumerate() {
            let max_key = page
                .entries
                .last()
                .map(|&(k, _)| k)
                .ok_or_else(|| KeystoneError::Internal("empty page during bulk load".to_string()))?;
            if l1.entries.len() >= self.index_bf {
                self.index_pages.push(l1);
                l1 = IndexPage::default();
                l1_ptrs.push(self.index_pages.len());
            }
            l1.entries.push((max_key, i));
        }
        self.index_pages.push(l1);

        let mut root = IndexPage::default();
        for ptr in l1_ptrs {
            let max_key = self.index_pages[ptr]
                .max_key()
                .ok_or_else(|| KeystoneError::Internal("empty level-1 page".to_string()))?;
            root.entries.push((max_key, ptr));
        }
        self.index_pages.push(root);
        self.root_ptr = self.index_pages.len() - 1;

        self.save()?;
        info!(
            records = sorted_records.len(),
            data_pages = self.data_pages.len(),
            "ISAM bulk load complete"
        );
        Ok(())
    }

    /// Collects every live record and bulk loads it again, folding the
    /// overflow chains back into the static structure.
    pub fn reorganize(&mut self) -> Result<()> {
        let records = self.get_all_records_sorted()?;
        if records.is_empty() {
            self.store.truncate()?;
            self.reset_empty();
            self.save()?;
            return Ok(());
        }
        self.bulk_load(&records)?;
        info!(records = records.len(), "ISAM reorganized");
        Ok(())
    }

    /// Rewrites the record log in key order and repoints every entry.
    pub fn compact_data_file(&mut self) -> Result<()> {
        let order: Vec<Position> = self.all_entries_sorted().iter().map(|&(_, p)| p).collect();
        let remap = self.store.rewrite(&order)?;

        for page in self.data_pages.iter_mut() {
            for entry in page.entries.iter_mut() {
                if let Some(&new_pos) = remap.get(&entry.1) {
                    entry.1 = new_pos;
                }
            }
        }
        for page in self.overflow_pages.iter_mut() {
            for entry in page.entries.iter_mut() {
                if let Some(&new_pos) = remap.get(&entry.1) {
                    entry.1 = new_pos;
                }
            }
        }
        self.save()?;
        debug!(live = remap.len(), "ISAM data file compacted");
        Ok(())
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let primary: usize = self.data_pages.iter().map(|p| p.entries.len()).sum();
        let overflow: usize = self.overflow_pages.iter().map(|p| p.entries.len()).sum();
        primary + overflow
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes all backing files.
    pub fn destroy(self) -> Result<()> {
        for path in [&self.pages_path, &self.index_path, &self.meta_path] {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        self.store.destroy()
    }

    // =====
    // Internal
    // =====

    /// Bootstrap layout: one empty data page and sentinel index pages so
    /// routing always lands somewhere.
    fn reset_empty(&mut self) {
        self.data_pages = vec![DataPage::default()];
        self.overflow_pages = Vec::new();
        let l1 = IndexPage {
            entries: vec![(i64::MAX, 0)],
        };
        let root = IndexPage {
            entries: vec![(i64::MAX, 0)],
        };
        self.index_pages = vec![l1, root];
        self.root_ptr = 1;
    }

    /// Root, then level 1, then the data page pointer.
    fn find_data_page(&self, key: i64) -> Result<usize> {
        let routing_error =
            || KeystoneError::CorruptIndex("ISAM index page routed to nothing".to_string());
        let root = &self.index_pages[self.root_ptr];
        let l1_ptr = root.find_child(key).ok_or_else(routing_error)?;
        let l1 = self
            .index_pages
            .get(l1_ptr)
            .ok_or_else(routing_error)?;
        let data_ptr = l1.find_child(key).ok_or_else(routing_error)?;
        if data_ptr >= self.data_pages.len() {
            return Err(routing_error());
        }
        Ok(data_ptr)
    }

    fn find_position(&self, key: i64) -> Result<Option<Position>> {
        let page = &self.data_pages[self.find_data_page(key)?];
        if let Some(&(_, position)) = page.entries.iter().find(|&&(k, _)| k == key) {
            return Ok(Some(position));
        }
        let mut overflow = page.overflow;
        while let Some(ptr) = overflow {
            let op = &self.overflow_pages[ptr];
            if let Some(&(_, position)) = op.entries.iter().find(|&&(k, _)| k == key) {
                return Ok(Some(position));
            }
            overflow = op.next;
        }
        Ok(None)
    }

    /// Walks the chain for a full page, filling the first overflow page
    /// with room or appending a new one at the tail.
    fn insert_overflow(&mut self, page_ptr: usize, key: i64, position: Position) {
        let entry = (key, position);
        match self.data_pages[page_ptr].overflow {
            None => {
                self.overflow_pages.push(OverflowPage {
                    entries: vec![entry],
                    next: None,
                });
                self.data_pages[page_ptr].overflow = Some(self.overflow_pages.len() - 1);
            }
            Some(mut ptr) => loop {
                if self.overflow_pages[ptr].entries.len() < self.data_bf {
                    let op = &mut self.overflow_pages[ptr];
                    let idx = op.entries.partition_point(|&(k, _)| k < key);
                    op.entries.insert(idx, entry);
                    break;
                }
                match self.overflow_pages[ptr].next {
                    Some(next) => ptr = next,
                    None => {
                        self.overflow_pages.push(OverflowPage {
                            entries: vec![entry],
                            next: None,
                        });
                        self.overflow_pages[ptr].next = Some(self.overflow_pages.len() - 1);
                        break;
                    }
                }
            },
        }
    }

    /// Every live `(key, position)` entry, ascending by key.
    fn all_entries_sorted(&self) -> Vec<(i64, Position)> {
        let mut entries = Vec::new();
        for page in &self.data_pages {
            entries.extend(page.entries.iter().copied());
            let mut overflow = page.overflow;
            while let Some(ptr) = overflow {
                let op = &self.overflow_pages[ptr];
                entries.extend(op.entries.iter().copied());
                overflow = op.next;
            }
        }
        entries.sort_by_key(|&(k, _)| k);
        entries
    }

    fn save(&self) -> Result<()> {
        let pages = PagesFile {
            data_pages: self.data_pages.clone(),
            overflow_pages: self.overflow_pages.clone(),
        };
        let meta = MetaFile {
            root_ptr: self.root_ptr,
            data_block_factor: self.data_bf,
            index_block_factor: self.index_bf,
        };
        write_json(&self.pages_path, &pages)?;
        write_json(&self.index_path, &self.index_pages)?;
        write_json(&self.meta_path, &meta)?;
        Ok(())
    }
}

/// Serializes to a sibling file and renames it into place.
fn write_json<T: Serialize>(path: &PathBuf, value: &T) -> Result<()> {
    let tmp_path = {
        let mut os = path.as_os_str().to_os_string();
        os.push(".tmp");
        PathBuf::from(os)
    };
    std::fs::write(&tmp_path, serde_json::to_vec(value)?)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
