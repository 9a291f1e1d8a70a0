//! Log-structured on-disk store.
//!
//! A single append-only log file holds every write; an in-memory keydir maps
//! live keys to value positions in the file. Deletes append a tombstone.
//! The keydir is rebuilt by scanning the log at open, and `compact` rewrites
//! the log with only live entries.
//!
//! Entry layout:
//!
//! - key length as big-endian u32
//! - value length as big-endian i32, or -1 for tombstones
//! - key bytes
//! - value bytes

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{info, warn};

use crate::{KvError, KvResult, Storer};

const LOG_FILE: &str = "kv.log";
const COMPACT_FILE: &str = "kv.log.compact";

/// Position and length of a live value in the log file.
#[derive(Debug, Clone, Copy)]
struct ValueRef {
    pos: u64,
    len: u32,
}

struct Inner {
    file: File,
    keydir: BTreeMap<String, ValueRef>,
    /// Bytes occupied by superseded entries and tombstones.
    garbage: u64,
    /// Total log size in bytes.
    size: u64,
}

/// A durable key-value store backed by an append-only log.
///
/// All live keys must fit in memory. Writes are synced to disk before they
/// are acknowledged.
pub struct DiskStore {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl DiskStore {
    /// Opens or creates a store under `dir`, rebuilding the keydir from the
    /// log. Compacts first if more than half of the log is garbage.
    pub fn open(dir: impl AsRef<Path>) -> KvResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let path = dir.join(LOG_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let (keydir, garbage, size) = scan_log(&mut file)?;

        let store = Self {
            dir,
            inner: Mutex::new(Inner {
                file,
                keydir,
                garbage,
                size,
            }),
        };
        if garbage > 0 && garbage * 2 > size {
            info!(garbage, size, "compacting kv log");
            store.compact()?;
        }
        Ok(store)
    }

    /// Rewrites the log with only live entries.
    pub fn compact(&self) -> KvResult<()> {
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        let compact_path = self.dir.join(COMPACT_FILE);
        let live: Vec<(String, String)> = {
            let keys: Vec<_> = inner.keydir.keys().cloned().collect();
            let mut out = Vec::with_capacity(keys.len());
            for k in keys {
                let vref = inner.keydir[&k];
                let v = read_value(&mut inner.file, vref)?;
                out.push((k, v));
            }
            out
        };

        let mut new_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&compact_path)?;
        let mut keydir = BTreeMap::new();
        let mut size = 0u64;
        for (k, v) in live {
            let vref = append_entry(&mut new_file, &mut size, &k, Some(&v))?;
            keydir.insert(k, vref.expect("set entries carry a value ref"));
        }
        new_file.sync_all()?;
        fs::rename(&compact_path, self.dir.join(LOG_FILE))?;

        inner.file = new_file;
        inner.keydir = keydir;
        inner.garbage = 0;
        inner.size = size;
        Ok(())
    }
}

impl Storer for DiskStore {
    fn get(&self, key: &str) -> KvResult<String> {
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        match inner.keydir.get(key).copied() {
            Some(vref) => read_value(&mut inner.file, vref),
            None => Err(KvError::NotFound),
        }
    }

    fn set(&self, key: &str, value: &str) -> KvResult<()> {
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        let inner = &mut *inner;
        let vref = append_entry(&mut inner.file, &mut inner.size, key, Some(value))?;
        inner.file.sync_all()?;
        if let Some(old) = inner
            .keydir
            .insert(key.to_owned(), vref.expect("set entries carry a value ref"))
        {
            inner.garbage += entry_len(key, Some(old.len));
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> KvResult<()> {
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        let inner = &mut *inner;
        if let Some(old) = inner.keydir.remove(key) {
            append_entry(&mut inner.file, &mut inner.size, key, None)?;
            inner.file.sync_all()?;
            // The superseded entry and the tombstone itself are garbage.
            inner.garbage += entry_len(key, Some(old.len)) + entry_len(key, None);
        }
        Ok(())
    }

    fn dump(&self) -> BTreeMap<String, String> {
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        let inner = &mut *inner;
        let mut out = BTreeMap::new();
        for (k, vref) in inner.keydir.clone() {
            // A keydir entry always points at a complete record.
            if let Ok(v) = read_value(&mut inner.file, vref) {
                out.insert(k, v);
            }
        }
        out
    }

    fn clear(&self) {
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        inner.keydir.clear();
        inner.garbage = 0;
        inner.size = 0;
        let _ = inner.file.set_len(0);
        let _ = inner.file.sync_all();
    }
}

/// On-disk length of one entry.
fn entry_len(key: &str, value_len: Option<u32>) -> u64 {
    8 + key.len() as u64 + u64::from(value_len.unwrap_or(0))
}

/// Appends one entry, returning the value reference for sets.
fn append_entry(
    file: &mut File,
    size: &mut u64,
    key: &str,
    value: Option<&str>,
) -> KvResult<Option<ValueRef>> {
    let pos = *size;
    let key_bytes = key.as_bytes();
    let mut buf = Vec::with_capacity(8 + key_bytes.len() + value.map_or(0, str::len));
    buf.extend_from_slice(&(key_bytes.len() as u32).to_be_bytes());
    match value {
        Some(v) => buf.extend_from_slice(&(v.len() as i32).to_be_bytes()),
        None => buf.extend_from_slice(&(-1i32).to_be_bytes()),
    }
    buf.extend_from_slice(key_bytes);
    if let Some(v) = value {
        buf.extend_from_slice(v.as_bytes());
    }
    file.write_all(&buf)?;
    *size += buf.len() as u64;

    Ok(value.map(|v| ValueRef {
        pos: pos + 8 + key_bytes.len() as u64,
        len: v.len() as u32,
    }))
}

/// Reads a value out of the log file.
fn read_value(file: &mut File, vref: ValueRef) -> KvResult<String> {
    let mut buf = vec![0u8; vref.len as usize];
    file.seek(SeekFrom::Start(vref.pos))?;
    file.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| KvError::Corrupt {
        offset: vref.pos,
        reason: e.to_string(),
    })
}

/// Scans the whole log, building the keydir and garbage accounting.
///
/// A torn tail (crash between a write and its sync) is discarded rather
/// than rejected: everything before it was acknowledged, anything after
/// was not.
fn scan_log(file: &mut File) -> KvResult<(BTreeMap<String, ValueRef>, u64, u64)> {
    let mut keydir: BTreeMap<String, ValueRef> = BTreeMap::new();
    let mut garbage = 0u64;
    let mut size = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;

    let mut pos = 0u64;
    let mut header = [0u8; 8];
    while pos < size {
        if size - pos < 8 || file.read_exact(&mut header).is_err() {
            truncate_torn_tail(file, pos, &mut size)?;
            break;
        }
        let key_len = u32::from_be_bytes(header[0..4].try_into().expect("4 bytes"));
        let value_len = i32::from_be_bytes(header[4..8].try_into().expect("4 bytes"));

        let mut key_buf = vec![0u8; key_len as usize];
        if file.read_exact(&mut key_buf).is_err() {
            truncate_torn_tail(file, pos, &mut size)?;
            break;
        }
        let key = String::from_utf8(key_buf).map_err(|e| KvError::Corrupt {
            offset: pos,
            reason: e.to_string(),
        })?;

        if value_len < 0 {
            if let Some(old) = keydir.remove(&key) {
                garbage += entry_len(&key, Some(old.len));
            }
            garbage += entry_len(&key, None);
            pos += entry_len(&key, None);
        } else {
            let end = pos + entry_len(&key, Some(value_len as u32));
            if end > size {
                truncate_torn_tail(file, pos, &mut size)?;
                break;
            }
            let vref = ValueRef {
                pos: pos + 8 + u64::from(key_len),
                len: value_len as u32,
            };
            file.seek(SeekFrom::Current(i64::from(value_len)))?;
            if let Some(old) = keydir.insert(key.clone(), vref) {
                garbage += entry_len(&key, Some(old.len));
            }
            pos = end;
        }
    }
    Ok((keydir, garbage, size))
}

/// Cuts an incomplete trailing entry off the log.
fn truncate_torn_tail(file: &mut File, pos: u64, size: &mut u64) -> KvResult<()> {
    warn!(offset = pos, "discarding torn log tail");
    file.set_len(pos)?;
    file.seek(SeekFrom::Start(pos))?;
    *size = pos;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_get_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(tmp.path()).unwrap();
        store.set("key", "value").unwrap();
        assert_eq!(store.get("key").unwrap(), "value");
    }

    #[test]
    fn test_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = DiskStore::open(tmp.path()).unwrap();
            store.set("a", "1").unwrap();
            store.set("b", "2").unwrap();
            store.delete("a").unwrap();
        }
        let store = DiskStore::open(tmp.path()).unwrap();
        assert!(store.get("a").unwrap_err().is_not_found());
        assert_eq!(store.get("b").unwrap(), "2");
    }

    #[test]
    fn test_delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(tmp.path()).unwrap();
        store.set("key", "value").unwrap();
        store.delete("key").unwrap();
        store.delete("key").unwrap();
        assert!(store.get("key").unwrap_err().is_not_found());
    }

    #[test]
    fn test_compact_preserves_live_entries() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(tmp.path()).unwrap();
        for i in 0..10 {
            store.set("churn", &i.to_string()).unwrap();
        }
        store.set("keep", "yes").unwrap();
        store.delete("churn").unwrap();

        store.compact().unwrap();

        assert_eq!(store.get("keep").unwrap(), "yes");
        assert!(store.get("churn").unwrap_err().is_not_found());

        // And the compacted log reopens cleanly.
        drop(store);
        let store = DiskStore::open(tmp.path()).unwrap();
        assert_eq!(store.get("keep").unwrap(), "yes");
    }

    #[test]
    fn test_torn_tail_is_discarded_on_open() {
        let tmp = TempDir::new().unwrap();
        {
            let store = DiskStore::open(tmp.path()).unwrap();
            store.set("kept", "value").unwrap();
        }
        // Simulate a crash mid-append: a header promising more bytes than
        // the file holds.
        let mut file = OpenOptions::new()
            .append(true)
            .open(tmp.path().join(LOG_FILE))
            .unwrap();
        file.write_all(&[0, 0, 0, 9, 0, 0, 0]).unwrap();

        let store = DiskStore::open(tmp.path()).unwrap();
        assert_eq!(store.get("kept").unwrap(), "value");

        // The log still appends cleanly after the tail was cut.
        store.set("fresh", "write").unwrap();
        drop(store);
        let store = DiskStore::open(tmp.path()).unwrap();
        assert_eq!(store.get("fresh").unwrap(), "write");
    }

    #[test]
    fn test_clear_empties_store() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(tmp.path()).unwrap();
        store.set("key", "value").unwrap();
        store.clear();
        assert!(store.dump().is_empty());

        drop(store);
        let store = DiskStore::open(tmp.path()).unwrap();
        assert!(store.dump().is_empty());
    }

    #[test]
    fn test_dump_is_ordered() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(tmp.path()).unwrap();
        store.set("b", "2").unwrap();
        store.set("a", "1").unwrap();
        let keys: Vec<_> = store.dump().into_keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
