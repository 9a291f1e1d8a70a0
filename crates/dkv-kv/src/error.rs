//! KV store error types.

use thiserror::Error;

/// Result type for store operations.
pub type KvResult<T> = Result<T, KvError>;

/// Errors that can occur in the KV state layer.
#[derive(Debug, Error)]
pub enum KvError {
    /// The requested key has no binding.
    #[error("key not found")]
    NotFound,

    /// I/O failure in a disk-backed store.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The on-disk log is damaged and cannot be replayed.
    #[error("corrupt log entry at offset {offset}: {reason}")]
    Corrupt {
        /// Byte offset of the damaged entry.
        offset: u64,
        /// What was wrong with it.
        reason: String,
    },
}

impl KvError {
    /// Returns true if this is a `NotFound` error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}
