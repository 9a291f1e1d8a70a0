//! File-based snapshot store.
//!
//! Snapshots live in the data-dir root, one directory per snapshot:
//!
//! ```text
//! {data_dir}/
//! ├── snap-00000000000000000003-0000000000000000012c/
//! │   ├── meta.json    <- term, index, configuration, size
//! │   └── state.bin    <- serialized state machine
//! └── snap-...tmp      <- in-flight sink, renamed on close
//! ```
//!
//! The most recent `retain` snapshots are kept; older ones are removed when
//! a newer snapshot is promoted. A sink that is canceled (or never closed)
//! leaves only a `.tmp` directory, which is swept at open.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{Configuration, LogIndex, Term};
use crate::{RaftError, RaftResult};

const META_FILE: &str = "meta.json";
const STATE_FILE: &str = "state.bin";
const SNAP_PREFIX: &str = "snap-";
const TMP_SUFFIX: &str = ".tmp";

/// Description of one stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Directory name, unique per snapshot.
    pub id: String,
    /// Term of the last entry the snapshot covers.
    pub term: Term,
    /// Index of the last entry the snapshot covers.
    pub index: LogIndex,
    /// Membership as of the snapshot.
    pub configuration: Configuration,
    /// Size of the serialized state in bytes.
    pub size: u64,
}

/// Storage for state-machine snapshots.
pub trait SnapshotStore: Send {
    /// Starts writing a new snapshot; promote with [`SnapshotSink::close`].
    fn create(
        &self,
        term: Term,
        index: LogIndex,
        configuration: &Configuration,
    ) -> RaftResult<Box<dyn SnapshotSink>>;

    /// Lists stored snapshots, newest first.
    fn list(&self) -> RaftResult<Vec<SnapshotMeta>>;

    /// Opens a stored snapshot for reading.
    fn open(&self, id: &str) -> RaftResult<(SnapshotMeta, Box<dyn Read + Send>)>;
}

/// The writing side of an in-flight snapshot.
pub trait SnapshotSink: Write + Send {
    /// The id the snapshot will have once promoted.
    fn id(&self) -> &str;

    /// Promotes the snapshot: fsync, write metadata, rename into place,
    /// garbage-collect older snapshots.
    fn close(&mut self) -> RaftResult<()>;

    /// Discards the snapshot.
    fn cancel(&mut self) -> RaftResult<()>;
}

/// Snapshot store rooted at a directory.
pub struct FileSnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl FileSnapshotStore {
    /// Creates a store under `dir`, keeping the `retain` most recent
    /// snapshots. Sweeps abandoned `.tmp` directories.
    pub fn new(dir: impl AsRef<Path>, retain: usize) -> RaftResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(SNAP_PREFIX) && name.ends_with(TMP_SUFFIX) {
                warn!(snapshot = %name, "removing abandoned snapshot");
                let _ = fs::remove_dir_all(entry.path());
            }
        }
        Ok(Self { dir, retain })
    }

    /// Removes all but the `retain` newest snapshots.
    fn gc(&self) -> RaftResult<()> {
        for stale in self.list()?.into_iter().skip(self.retain) {
            info!(snapshot = %stale.id, "removing superseded snapshot");
            let _ = fs::remove_dir_all(self.dir.join(&stale.id));
        }
        Ok(())
    }
}

/// Ids embed index and term zero-padded, so directory names stay unique
/// and scan in log order.
fn snapshot_id(term: Term, index: LogIndex) -> String {
    format!("{SNAP_PREFIX}{index:020x}-{term:020x}")
}

impl SnapshotStore for FileSnapshotStore {
    fn create(
        &self,
        term: Term,
        index: LogIndex,
        configuration: &Configuration,
    ) -> RaftResult<Box<dyn SnapshotSink>> {
        let id = snapshot_id(term, index);
        let tmp_dir = self.dir.join(format!("{id}{TMP_SUFFIX}"));
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;
        let state = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(tmp_dir.join(STATE_FILE))?;
        Ok(Box::new(FileSnapshotSink {
            store_dir: self.dir.clone(),
            tmp_dir,
            meta: SnapshotMeta {
                id,
                term,
                index,
                configuration: configuration.clone(),
                size: 0,
            },
            state: Some(state),
            retain: self.retain,
            done: false,
        }))
    }

    fn list(&self) -> RaftResult<Vec<SnapshotMeta>> {
        let mut metas = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(SNAP_PREFIX) || name.ends_with(TMP_SUFFIX) {
                continue;
            }
            let meta_path = entry.path().join(META_FILE);
            match fs::read_to_string(&meta_path) {
                Ok(json) => match serde_json::from_str::<SnapshotMeta>(&json) {
                    Ok(meta) => metas.push(meta),
                    Err(e) => warn!(snapshot = %name, error = %e, "skipping unreadable snapshot"),
                },
                Err(e) => warn!(snapshot = %name, error = %e, "skipping snapshot without metadata"),
            }
        }
        metas.sort_by(|a, b| (b.index, b.term).cmp(&(a.index, a.term)));
        Ok(metas)
    }

    fn open(&self, id: &str) -> RaftResult<(SnapshotMeta, Box<dyn Read + Send>)> {
        let dir = self.dir.join(id);
        let json = fs::read_to_string(dir.join(META_FILE))?;
        let meta: SnapshotMeta = serde_json::from_str(&json).map_err(std::io::Error::other)?;
        let state = File::open(dir.join(STATE_FILE))?;
        Ok((meta, Box::new(BufReader::new(state))))
    }
}

/// Sink writing into a `.tmp` directory until promoted.
struct FileSnapshotSink {
    store_dir: PathBuf,
    tmp_dir: PathBuf,
    meta: SnapshotMeta,
    state: Option<File>,
    retain: usize,
    done: bool,
}

impl Write for FileSnapshotSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let Some(state) = self.state.as_mut() else {
            return Err(std::io::Error::other("snapshot sink already finished"));
        };
        let n = state.write(buf)?;
        self.meta.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.state.as_mut() {
            Some(state) => state.flush(),
            None => Ok(()),
        }
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn close(&mut self) -> RaftResult<()> {
        if self.done {
            return Ok(());
        }
        let state = self
            .state
            .take()
            .ok_or_else(|| RaftError::Io(std::io::Error::other("snapshot sink already finished")))?;
        state.sync_all()?;
        drop(state);

        let json = serde_json::to_string_pretty(&self.meta).map_err(std::io::Error::other)?;
        let mut meta_file = File::create(self.tmp_dir.join(META_FILE))?;
        meta_file.write_all(json.as_bytes())?;
        meta_file.sync_all()?;

        fs::rename(&self.tmp_dir, self.store_dir.join(&self.meta.id))?;
        self.done = true;

        FileSnapshotStore {
            dir: self.store_dir.clone(),
            retain: self.retain,
        }
        .gc()
    }

    fn cancel(&mut self) -> RaftResult<()> {
        if self.done {
            return Ok(());
        }
        self.state = None;
        self.done = true;
        fs::remove_dir_all(&self.tmp_dir)?;
        Ok(())
    }
}

impl Drop for FileSnapshotSink {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> Configuration {
        Configuration::single("node0".into(), "127.0.0.1:2380".into())
    }

    fn write_snapshot(store: &FileSnapshotStore, term: Term, index: LogIndex, data: &[u8]) {
        let mut sink = store.create(term, index, &config()).unwrap();
        sink.write_all(data).unwrap();
        sink.close().unwrap();
    }

    #[test]
    fn test_create_close_open_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(tmp.path(), 2).unwrap();
        write_snapshot(&store, 3, 42, b"state bytes");

        let metas = store.list().unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].term, 3);
        assert_eq!(metas[0].index, 42);
        assert_eq!(metas[0].size, 11);

        let (meta, mut reader) = store.open(&metas[0].id).unwrap();
        assert_eq!(meta, metas[0]);
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"state bytes");
    }

    #[test]
    fn test_retains_two_newest() {
        let tmp = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(tmp.path(), 2).unwrap();
        write_snapshot(&store, 1, 10, b"a");
        write_snapshot(&store, 1, 20, b"b");
        write_snapshot(&store, 2, 30, b"c");

        let metas = store.list().unwrap();
        let indexes: Vec<_> = metas.iter().map(|m| m.index).collect();
        assert_eq!(indexes, vec![30, 20]);
    }

    #[test]
    fn test_cancel_discards() {
        let tmp = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(tmp.path(), 2).unwrap();
        let mut sink = store.create(1, 10, &config()).unwrap();
        sink.write_all(b"partial").unwrap();
        sink.cancel().unwrap();

        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_dropped_sink_is_swept() {
        let tmp = TempDir::new().unwrap();
        {
            let store = FileSnapshotStore::new(tmp.path(), 2).unwrap();
            let mut sink = store.create(1, 10, &config()).unwrap();
            sink.write_all(b"partial").unwrap();
            drop(sink);
        }
        let store = FileSnapshotStore::new(tmp.path(), 2).unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_list_orders_newest_first() {
        let tmp = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(tmp.path(), 5).unwrap();
        write_snapshot(&store, 2, 15, b"x");
        write_snapshot(&store, 1, 10, b"y");

        let metas = store.list().unwrap();
        assert_eq!(metas[0].index, 15);
        assert_eq!(metas[1].index, 10);
    }
}
