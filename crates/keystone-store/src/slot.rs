//! Fixed-size slot files for the tree indexes.
//!
//! Layout: an 8-byte little-endian header holding the root slot index
//! (`-1` = empty tree) followed by fixed-size node slots. Slots are only
//! ever appended; logically deleted nodes stay in place and the file never
//! shrinks outside a full rebuild.

use keystone_common::{KeystoneError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Sentinel slot index meaning "no node".
pub const NULL_SLOT: i64 = -1;

const HEADER_SIZE: u64 = 8;

struct SlotFileInner {
    file: File,
    /// Number of slots currently in the file.
    count: i64,
}

/// Header plus fixed-size slots, the backing file for AVL and B+Tree nodes.
pub struct SlotFile {
    path: PathBuf,
    slot_size: usize,
    inner: Mutex<SlotFileInner>,
}

impl SlotFile {
    /// Opens or creates a slot file. A fresh file gets a header pointing at
    /// no root. An existing file must agree with `slot_size`.
    pub fn open(path: impl Into<PathBuf>, slot_size: usize) -> Result<Self> {
        let path = path.into();
        if slot_size == 0 {
            return Err(KeystoneError::InvalidParameter {
                name: "slot_size".to_string(),
                value: "0".to_string(),
            });
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len < HEADER_SIZE {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&NULL_SLOT.to_le_bytes())?;
        } else if (len - HEADER_SIZE) % slot_size as u64 != 0 {
            return Err(KeystoneError::CorruptIndex(format!(
                "slot file {} has {} trailing bytes for slot size {}",
                path.display(),
                (len - HEADER_SIZE) % slot_size as u64,
                slot_size
            )));
        }

        let count = if len < HEADER_SIZE {
            0
        } else {
            ((len - HEADER_SIZE) / slot_size as u64) as i64
        };

        Ok(Self {
            path,
            slot_size,
            inner: Mutex::new(SlotFileInner { file, count }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Returns the number of slots in the file (live or dead).
    pub fn slot_count(&self) -> i64 {
        self.inner.lock().count
    }

    /// Reads the root slot index from the header.
    pub fn read_root(&self) -> Result<i64> {
        let mut inner = self.inner.lock();
        inner.file.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; 8];
        inner.file.read_exact(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    /// Writes the root slot index to the header.
    pub fn write_root(&self, slot: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&slot.to_le_bytes())?;
        Ok(())
    }

    /// Reads one slot.
    pub fn read_slot(&self, slot: i64) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        if slot < 0 || slot >= inner.count {
            return Err(KeystoneError::CorruptNode {
                slot,
                reason: format!("slot out of range (count {})", inner.count),
            });
        }
        inner.file.seek(SeekFrom::Start(self.slot_offset(slot)))?;
        let mut buf = vec![0u8; self.slot_size];
        inner.file.read_exact(&mut buf).map_err(|e| KeystoneError::CorruptNode {
            slot,
            reason: format!("short read: {e}"),
        })?;
        Ok(buf)
    }

    /// Overwrites one existing slot.
    pub fn write_slot(&self, slot: i64, bytes: &[u8]) -> Result<()> {
        self.check_len(bytes)?;
        let mut inner = self.inner.lock();
        if slot < 0 || slot >= inner.count {
            return Err(KeystoneError::CorruptNode {
                slot,
                reason: format!("slot out of range (count {})", inner.count),
            });
        }
        inner.file.seek(SeekFrom::Start(self.slot_offset(slot)))?;
        inner.file.write_all(bytes)?;
        Ok(())
    }

    /// Appends a new slot and returns its index.
    pub fn append_slot(&self, bytes: &[u8]) -> Result<i64> {
        self.check_len(bytes)?;
        let mut inner = self.inner.lock();
        let slot = inner.count;
        inner.file.seek(SeekFrom::Start(self.slot_offset(slot)))?;
        inner.file.write_all(bytes)?;
        inner.count = slot + 1;
        Ok(slot)
    }

    /// Syncs all buffered writes to disk.
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.file.sync_all()?;
        Ok(())
    }

    /// Removes the backing file. The slot file is unusable afterwards.
    pub fn destroy(self) -> Result<()> {
        drop(self.inner);
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn slot_offset(&self, slot: i64) -> u64 {
        HEADER_SIZE + slot as u64 * self.slot_size as u64
    }

    fn check_len(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.slot_size {
            return Err(KeystoneError::Internal(format!(
                "slot write of {} bytes into {}-byte slots",
                bytes.len(),
                self.slot_size
            )));
        }
        Ok(())
    }
}
