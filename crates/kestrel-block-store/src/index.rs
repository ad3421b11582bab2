//! Commit index.
//!
//! A durable map from committed hotstuff height to the committed block hash
//! and the serialized VM block id at that height. Read back at startup to
//! restore consensus state and replay VM commits.
//!
//! On-disk format: a sequence of `[u32 length | bincode record]` frames
//! appended as heights commit.

use crate::errors::StoreError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared_types::Hash;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Serialize, Deserialize)]
struct IndexRecord {
    height: u64,
    block_hash: Hash,
    vm_id: Vec<u8>,
}

struct IndexInner {
    entries: BTreeMap<u64, (Hash, Vec<u8>)>,
    file: File,
    path: PathBuf,
}

/// Durable height → (block hash, VM block id) index of committed blocks.
pub struct CommitIndex {
    inner: Mutex<IndexInner>,
}

impl CommitIndex {
    /// Open the index file, replaying any existing records. A truncated
    /// trailing frame (e.g. from a crash mid-append) is dropped with a
    /// warning.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        let io_err = |path: &PathBuf| {
            let p = path.display().to_string();
            move |e| StoreError::Io {
                path: p.clone(),
                source: e,
            }
        };

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(io_err(&path))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(io_err(&path))?;

        let mut entries = BTreeMap::new();
        let mut cursor = 0usize;
        while cursor + 4 <= bytes.len() {
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&bytes[cursor..cursor + 4]);
            let len = u32::from_le_bytes(len_bytes) as usize;
            cursor += 4;
            if cursor + len > bytes.len() {
                warn!(path = %path.display(), "commit index has a truncated trailing record");
                break;
            }
            let record: IndexRecord = bincode::deserialize(&bytes[cursor..cursor + len])
                .map_err(|e| StoreError::Encoding(e.to_string()))?;
            cursor += len;
            entries.insert(record.height, (record.block_hash, record.vm_id));
        }

        Ok(Self {
            inner: Mutex::new(IndexInner {
                entries,
                file,
                path,
            }),
        })
    }

    /// Record a committed height. Appends durably before updating the
    /// in-memory map.
    pub fn put(&self, height: u64, block_hash: Hash, vm_id: Vec<u8>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let record = IndexRecord {
            height,
            block_hash,
            vm_id,
        };
        let payload =
            bincode::serialize(&record).map_err(|e| StoreError::Encoding(e.to_string()))?;

        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);

        let path = inner.path.display().to_string();
        inner.file.write_all(&frame).map_err(|e| StoreError::Io {
            path: path.clone(),
            source: e,
        })?;
        inner
            .file
            .sync_data()
            .map_err(|e| StoreError::Io { path, source: e })?;

        inner
            .entries
            .insert(record.height, (record.block_hash, record.vm_id));
        Ok(())
    }

    pub fn get(&self, height: u64) -> Option<(Hash, Vec<u8>)> {
        self.inner.lock().entries.get(&height).cloned()
    }

    pub fn highest_height(&self) -> Option<u64> {
        self.inner.lock().entries.keys().next_back().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// All committed entries in ascending height order.
    pub fn entries(&self) -> Vec<(u64, Hash, Vec<u8>)> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(h, (hash, id))| (*h, *hash, id.clone()))
            .collect()
    }
}
