//! Append-only record log.
//!
//! Records are serialized as one JSON object per line. A record's position
//! is the byte offset of its line, handed out by [`RecordStore::append`] and
//! stored by the index structures. Deletes never touch the log; stale lines
//! are only reclaimed by [`RecordStore::rewrite`].

use keystone_common::{KeystoneError, Position, Record, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Configuration for the record log.
#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    /// Enable fsync after appends.
    pub fsync_enabled: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { fsync_enabled: true }
    }
}

/// Append-only data log addressed by byte offset.
pub struct RecordStore {
    path: PathBuf,
    config: StoreConfig,
    file: Mutex<File>,
}

impl RecordStore {
    /// Opens or creates the log at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    /// Opens or creates the log with explicit configuration.
    pub fn open_with_config(path: impl Into<PathBuf>, config: StoreConfig) -> Result<Self> {
        let path = path.into();
        let file = open_log(&path)?;
        Ok(Self {
            path,
            config,
            file: Mutex::new(file),
        })
    }

    /// Returns the log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the log size in bytes.
    pub fn len(&self) -> Result<u64> {
        let file = self.file.lock();
        Ok(file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Appends one record and returns its position.
    pub fn append(&self, record: &Record) -> Result<Position> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock();
        let position = file.seek(SeekFrom::End(0))?;
        file.write_all(&line)?;
        if self.config.fsync_enabled {
            file.sync_all()?;
        }
        Ok(position)
    }

    /// Reads the record at `position`.
    ///
    /// An offset past the end of the log or a malformed line is reported as
    /// a corrupt record, never as a raw I/O error.
    pub fn read(&self, position: Position) -> Result<Record> {
        let file = self.file.lock();
        read_at(&file, position)
    }

    /// Reads every record in the log, in file order.
    ///
    /// Malformed lines are logged and skipped so one bad line cannot take
    /// down a full scan.
    pub fn scan(&self) -> Result<Vec<(Position, Record)>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;

        let mut reader = BufReader::new(&*file);
        let mut records = Vec::new();
        let mut position = 0u64;
        let mut line = Vec::new();
        loop {
            line.clear();
            let n = reader.read_until(b'\n', &mut line)?;
            if n == 0 {
                break;
            }
            match serde_json::from_slice::<Record>(trim_line(&line)) {
                Ok(record) => records.push((position, record)),
                Err(e) => {
                    warn!(position, error = %e, "skipping malformed record line");
                }
            }
            position += n as u64;
        }
        Ok(records)
    }

    /// Discards every record in the log.
    pub fn truncate(&self) -> Result<()> {
        let mut file = self.file.lock();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        if self.config.fsync_enabled {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Rewrites the log keeping only the given positions, in the given
    /// order. Duplicate positions are written once. Returns the old to new
    /// offset map; positions that could not be read are logged and dropped
    /// from the map.
    ///
    /// The rewrite goes to a sibling file that atomically replaces the log.
    pub fn rewrite(&self, order: &[Position]) -> Result<HashMap<Position, Position>> {
        let mut file = self.file.lock();

        let tmp_path = {
            let mut os = self.path.as_os_str().to_os_string();
            os.push(".compact");
            PathBuf::from(os)
        };
        let mut tmp = File::create(&tmp_path)?;

        let mut remap = HashMap::new();
        let mut offset = 0u64;
        for &position in order {
            if remap.contains_key(&position) {
                continue;
            }
            let record = match read_at(&file, position) {
                Ok(record) => record,
                Err(e) => {
                    warn!(position, error = %e, "dropping unreadable record during compaction");
                    continue;
                }
            };
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');
            tmp.write_all(&line)?;
            remap.insert(position, offset);
            offset += line.len() as u64;
        }

        if self.config.fsync_enabled {
            tmp.sync_all()?;
        }
        drop(tmp);
        std::fs::rename(&tmp_path, &self.path)?;
        *file = open_log(&self.path)?;

        debug!(live = remap.len(), bytes = offset, path = %self.path.display(), "record log compacted");
        Ok(remap)
    }

    /// Removes the log file from disk. The store is unusable afterwards.
    pub fn destroy(self) -> Result<()> {
        drop(self.file);
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

fn open_log(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    Ok(file)
}

fn read_at(mut file: &File, position: Position) -> Result<Record> {
    let end = file.metadata()?.len();
    if position >= end {
        return Err(KeystoneError::CorruptRecord {
            position,
            reason: format!("offset past end of log ({end} bytes)"),
        });
    }
    file.seek(SeekFrom::Start(position))?;

    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line)?;
    if n == 0 {
        return Err(KeystoneError::CorruptRecord {
            position,
            reason: "empty line".to_string(),
        });
    }
    serde_json::from_slice(trim_line(&line)).map_err(|e| KeystoneError::CorruptRecord {
        position,
        reason: e.to_string(),
    })
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}
