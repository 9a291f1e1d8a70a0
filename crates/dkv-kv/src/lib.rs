//! Key-value state layer for dkv.
//!
//! This crate holds the local mapping that the replicated state machine
//! drives. Two implementations are provided:
//!
//! - [`MemoryStore`]: an in-memory map behind a reader/writer lock.
//! - [`DiskStore`]: a log-structured on-disk map (append-only log plus an
//!   in-memory keydir).
//!
//! Consistency is the consensus layer's job: a store only promises that
//! readers never observe a partial write and that writers serialize with
//! each other.

mod disk;
mod error;
mod memory;

pub use disk::DiskStore;
pub use error::{KvError, KvResult};
pub use memory::MemoryStore;

use std::collections::BTreeMap;

/// The operations the replicated state machine needs from a local store.
///
/// `get` and `dump` are read operations and must be safe against concurrent
/// writers; `set`, `delete`, and `clear` serialize with each other.
pub trait Storer: Send + Sync {
    /// Returns the value bound to `key`.
    fn get(&self, key: &str) -> KvResult<String>;

    /// Binds `key` to `value`, overwriting any prior binding.
    fn set(&self, key: &str, value: &str) -> KvResult<()>;

    /// Removes the binding for `key`. Deleting an absent key is not an error.
    fn delete(&self, key: &str) -> KvResult<()>;

    /// Returns a stable copy of all entries at call time.
    ///
    /// The result is ordered so that snapshots taken from it are canonical.
    fn dump(&self) -> BTreeMap<String, String>;

    /// Removes every binding.
    fn clear(&self);
}
