//! Durable log and stable stores.
//!
//! The engine consumes two key-value-shaped persistence handles: an
//! append-only indexed entry log and a tiny kv for per-node metadata
//! (`current_term`, `voted_for`). Memory implementations back tests; file
//! implementations back real nodes, laid out as `logs.dat/` and
//! `stable.dat/` under the data directory.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::snapshot::SnapshotStore;
use crate::types::{LogEntry, LogIndex};
use crate::{RaftError, RaftResult};

/// Stable-store key holding the node's current term.
pub const KEY_CURRENT_TERM: &str = "current_term";

/// Stable-store key holding the candidate voted for in the current term.
pub const KEY_VOTED_FOR: &str = "voted_for";

/// Append-only indexed storage for log entries.
///
/// Indexes are dense in `[first_index, last_index]`; both are 0 when the
/// log is empty. Batches are durable once `store_entries` returns.
pub trait LogStore: Send {
    /// The lowest retained index, or 0 when empty.
    fn first_index(&self) -> RaftResult<LogIndex>;

    /// The highest retained index, or 0 when empty.
    fn last_index(&self) -> RaftResult<LogIndex>;

    /// Fetches one entry.
    fn get_entry(&self, index: LogIndex) -> RaftResult<Option<LogEntry>>;

    /// Appends (or overwrites) a batch of entries, fsyncing once.
    fn store_entries(&mut self, entries: &[LogEntry]) -> RaftResult<()>;

    /// Removes all entries in `[min, max]` inclusive.
    fn delete_range(&mut self, min: LogIndex, max: LogIndex) -> RaftResult<()>;
}

/// Small durable kv for Raft metadata. Crash-safe per key.
pub trait StableStore: Send {
    /// Stores a string value.
    fn set(&mut self, key: &str, value: &str) -> RaftResult<()>;

    /// Fetches a string value.
    fn get(&self, key: &str) -> RaftResult<Option<String>>;

    /// Stores an integer value.
    fn set_u64(&mut self, key: &str, value: u64) -> RaftResult<()> {
        self.set(key, &value.to_string())
    }

    /// Fetches an integer value.
    fn get_u64(&self, key: &str) -> RaftResult<Option<u64>> {
        match self.get(key)? {
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|e| RaftError::InvalidConfiguration(format!("bad u64 for {key}: {e}"))),
            None => Ok(None),
        }
    }
}

/// Determines whether a node has any durable Raft state.
///
/// Used to gate bootstrap: a node with a term, a vote, log entries, or a
/// snapshot must never be bootstrapped again.
pub fn has_existing_state(
    log: &dyn LogStore,
    stable: &dyn StableStore,
    snapshots: &dyn SnapshotStore,
) -> RaftResult<bool> {
    if stable.get_u64(KEY_CURRENT_TERM)?.unwrap_or(0) > 0 {
        return Ok(true);
    }
    if stable.get(KEY_VOTED_FOR)?.is_some_and(|v| !v.is_empty()) {
        return Ok(true);
    }
    if log.last_index()? > 0 {
        return Ok(true);
    }
    Ok(!snapshots.list()?.is_empty())
}

// ============================================================================
// Memory implementations
// ============================================================================

/// In-memory log store for tests.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    entries: BTreeMap<LogIndex, LogEntry>,
}

impl MemoryLogStore {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryLogStore {
    fn first_index(&self) -> RaftResult<LogIndex> {
        Ok(self.entries.keys().next().copied().unwrap_or(0))
    }

    fn last_index(&self) -> RaftResult<LogIndex> {
        Ok(self.entries.keys().next_back().copied().unwrap_or(0))
    }

    fn get_entry(&self, index: LogIndex) -> RaftResult<Option<LogEntry>> {
        Ok(self.entries.get(&index).cloned())
    }

    fn store_entries(&mut self, entries: &[LogEntry]) -> RaftResult<()> {
        for entry in entries {
            self.entries.insert(entry.index, entry.clone());
        }
        Ok(())
    }

    fn delete_range(&mut self, min: LogIndex, max: LogIndex) -> RaftResult<()> {
        self.entries.retain(|&i, _| i < min || i > max);
        Ok(())
    }
}

/// In-memory stable store for tests.
#[derive(Debug, Default)]
pub struct MemoryStableStore {
    values: HashMap<String, String>,
}

impl MemoryStableStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StableStore for MemoryStableStore {
    fn set(&mut self, key: &str, value: &str) -> RaftResult<()> {
        self.values.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn get(&self, key: &str) -> RaftResult<Option<String>> {
        Ok(self.values.get(key).cloned())
    }
}

// ============================================================================
// File implementations
// ============================================================================

const LOG_FILE: &str = "entries.log";
const STABLE_FILE: &str = "stable.json";

/// File-backed log store.
///
/// Entries live in a single append-only file of length-prefixed postcard
/// records, mirrored by an in-memory map that is rebuilt by scanning at
/// open. Overwrites and range deletion rewrite the file; both happen only
/// on conflict truncation and snapshot truncation, which are rare and
/// bounded.
pub struct FileLogStore {
    path: PathBuf,
    file: File,
    entries: BTreeMap<LogIndex, LogEntry>,
}

impl FileLogStore {
    /// Opens or creates the log under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> RaftResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let mut entries = BTreeMap::new();
        let size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        let mut pos = 0u64;
        let mut header = [0u8; 4];
        while pos < size {
            // A torn tail means the last batch never reached its sync;
            // drop it and keep what was acknowledged.
            if size - pos < 4 || file.read_exact(&mut header).is_err() {
                tracing::warn!(offset = pos, "discarding torn raft log tail");
                file.set_len(pos)?;
                break;
            }
            let len = u32::from_be_bytes(header) as usize;
            if pos + 4 + len as u64 > size {
                tracing::warn!(offset = pos, "discarding torn raft log tail");
                file.set_len(pos)?;
                break;
            }
            let mut body = vec![0u8; len];
            file.read_exact(&mut body)?;
            let entry: LogEntry = postcard::from_bytes(&body)?;
            entries.insert(entry.index, entry);
            pos += 4 + len as u64;
        }

        Ok(Self {
            path,
            file,
            entries,
        })
    }

    /// Rewrites the file from the in-memory map.
    fn rewrite(&mut self) -> RaftResult<()> {
        let tmp = self.path.with_extension("log.tmp");
        let mut out = File::create(&tmp)?;
        for entry in self.entries.values() {
            let body = postcard::to_allocvec(entry)?;
            out.write_all(&(body.len() as u32).to_be_bytes())?;
            out.write_all(&body)?;
        }
        out.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        self.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        Ok(())
    }
}

impl LogStore for FileLogStore {
    fn first_index(&self) -> RaftResult<LogIndex> {
        Ok(self.entries.keys().next().copied().unwrap_or(0))
    }

    fn last_index(&self) -> RaftResult<LogIndex> {
        Ok(self.entries.keys().next_back().copied().unwrap_or(0))
    }

    fn get_entry(&self, index: LogIndex) -> RaftResult<Option<LogEntry>> {
        Ok(self.entries.get(&index).cloned())
    }

    fn store_entries(&mut self, entries: &[LogEntry]) -> RaftResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        // An overwrite at an existing index means the suffix is being
        // replaced; rewrite so a scan at open never resurrects stale
        // entries.
        let overwrites = entries.iter().any(|e| self.entries.contains_key(&e.index));
        for entry in entries {
            self.entries.insert(entry.index, entry.clone());
        }
        if overwrites {
            return self.rewrite();
        }
        for entry in entries {
            let body = postcard::to_allocvec(entry)?;
            self.file.write_all(&(body.len() as u32).to_be_bytes())?;
            self.file.write_all(&body)?;
        }
        self.file.sync_all()?;
        Ok(())
    }

    fn delete_range(&mut self, min: LogIndex, max: LogIndex) -> RaftResult<()> {
        let before = self.entries.len();
        self.entries.retain(|&i, _| i < min || i > max);
        if self.entries.len() != before {
            self.rewrite()?;
        }
        Ok(())
    }
}

/// File-backed stable store: one JSON document, rewritten atomically per
/// update.
pub struct FileStableStore {
    path: PathBuf,
    values: HashMap<String, String>,
}

impl FileStableStore {
    /// Opens or creates the store under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> RaftResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(STABLE_FILE);
        let values = if path.exists() {
            let json = fs::read_to_string(&path)?;
            serde_json::from_str(&json).map_err(std::io::Error::other)?
        } else {
            HashMap::new()
        };
        Ok(Self { path, values })
    }

    fn save(&self) -> RaftResult<()> {
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&self.values).map_err(std::io::Error::other)?;
        let mut out = File::create(&tmp)?;
        out.write_all(json.as_bytes())?;
        out.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StableStore for FileStableStore {
    fn set(&mut self, key: &str, value: &str) -> RaftResult<()> {
        self.values.insert(key.to_owned(), value.to_owned());
        self.save()
    }

    fn get(&self, key: &str) -> RaftResult<Option<String>> {
        Ok(self.values.get(key).cloned())
    }
}
