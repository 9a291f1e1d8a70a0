//! In-memory store.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::{KvError, KvResult, Storer};

/// An in-memory key-value store.
///
/// Reads take the shared lock, writes the exclusive lock. This is the store
/// used by nodes that rely on snapshots and the replicated log for
/// durability, and by tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of bindings.
    pub fn len(&self) -> usize {
        self.data.read().expect("kv lock poisoned").len()
    }

    /// Returns true if the store holds no bindings.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Storer for MemoryStore {
    fn get(&self, key: &str) -> KvResult<String> {
        self.data
            .read()
            .expect("kv lock poisoned")
            .get(key)
            .cloned()
            .ok_or(KvError::NotFound)
    }

    fn set(&self, key: &str, value: &str) -> KvResult<()> {
        self.data
            .write()
            .expect("kv lock poisoned")
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn delete(&self, key: &str) -> KvResult<()> {
        self.data.write().expect("kv lock poisoned").remove(key);
        Ok(())
    }

    fn dump(&self) -> BTreeMap<String, String> {
        self.data
            .read()
            .expect("kv lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn clear(&self) {
        self.data.write().expect("kv lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_set_get_roundtrip() {
        let store = MemoryStore::new();
        store.set("key", "value").unwrap();
        assert_eq!(store.get("key").unwrap(), "value");
    }

    #[test]
    fn test_get_missing_key() {
        let store = MemoryStore::new();
        assert!(store.get("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_set_overwrites() {
        let store = MemoryStore::new();
        store.set("key", "one").unwrap();
        store.set("key", "two").unwrap();
        assert_eq!(store.get("key").unwrap(), "two");
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = MemoryStore::new();
        store.set("key", "value").unwrap();
        store.delete("key").unwrap();
        store.delete("key").unwrap();
        assert!(store.get("key").unwrap_err().is_not_found());
    }

    #[test]
    fn test_dump_is_ordered() {
        let store = MemoryStore::new();
        store.set("b", "2").unwrap();
        store.set("a", "1").unwrap();
        store.set("c", "3").unwrap();

        let dump = store.dump();
        let keys: Vec<_> = dump.keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_clear_empties_store() {
        let store = MemoryStore::new();
        store.set("key", "value").unwrap();
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        let store = Arc::new(MemoryStore::new());
        store.set("key", "0").unwrap();

        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..100 {
                    store.set("key", &i.to_string()).unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        // Value must always be a complete write.
                        let v = store.get("key").unwrap();
                        assert!(v.parse::<u32>().is_ok());
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
