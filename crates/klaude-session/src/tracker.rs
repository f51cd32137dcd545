// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// What the engine last knew about one file it read or wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub sha256: String,
    /// Modification time in milliseconds since the epoch, as observed when
    /// the record was taken.  Used as a cheap pre-check before re-hashing.
    pub mtime_ms: i64,
    /// Memory files (AGENTS.md and friends) are exempt from the
    /// external-change reminder; their re-emission is handled by the memory
    /// discovery reminder instead.
    pub is_memory: bool,
}

/// Path → content-hash map shared across an agent tree.
///
/// A sub-agent session shares its parent's tracker so file reads are visible
/// everywhere; cloning the handle is cheap.  Tools receive this handle, never
/// the full session.
#[derive(Debug, Clone, Default)]
pub struct FileTracker {
    inner: Arc<Mutex<HashMap<PathBuf, FileRecord>>>,
}

impl FileTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Record the observed content of `path`.  Called by tools after every
    /// successful read or write.
    pub fn record(&self, path: &Path, content: &[u8], is_memory: bool) {
        let mtime_ms = file_mtime_ms(path).unwrap_or(0);
        let record = FileRecord {
            sha256: Self::sha256_hex(content),
            mtime_ms,
            is_memory,
        };
        self.inner
            .lock()
            .expect("file tracker poisoned")
            .insert(path.to_path_buf(), record);
    }

    pub fn get(&self, path: &Path) -> Option<FileRecord> {
        self.inner
            .lock()
            .expect("file tracker poisoned")
            .get(path)
            .cloned()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.inner
            .lock()
            .expect("file tracker poisoned")
            .contains_key(path)
    }

    pub fn tracked_paths(&self) -> Vec<PathBuf> {
        self.inner
            .lock()
            .expect("file tracker poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Tracked non-memory paths whose on-disk content no longer matches the
    /// recorded hash.  Deleted files count as changed.  The mtime is checked
    /// first so unchanged files are not re-hashed every turn.
    pub fn changed_on_disk(&self) -> Vec<PathBuf> {
        let snapshot: Vec<(PathBuf, FileRecord)> = {
            let map = self.inner.lock().expect("file tracker poisoned");
            map.iter()
                .filter(|(_, r)| !r.is_memory)
                .map(|(p, r)| (p.clone(), r.clone()))
                .collect()
        };

        let mut changed = Vec::new();
        for (path, record) in snapshot {
            match std::fs::read(&path) {
                Ok(bytes) => {
                    if file_mtime_ms(&path) == Some(record.mtime_ms) {
                        continue;
                    }
                    if Self::sha256_hex(&bytes) != record.sha256 {
                        changed.push(path);
                    }
                }
                Err(_) => changed.push(path),
            }
        }
        changed.sort();
        changed
    }
}

fn file_mtime_ms(path: &Path) -> Option<i64> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime = meta.modified().ok()?;
    let dur = mtime.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(dur.as_millis() as i64)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
