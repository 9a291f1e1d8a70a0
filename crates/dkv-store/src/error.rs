//! Store facade error types.

use dkv_raft::RaftError;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the store facade.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested key has no binding.
    #[error("key not found")]
    KeyNotFound,

    /// The request was malformed (e.g. an empty key).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No node currently claims leadership; retry shortly.
    #[error("cluster has no leader")]
    NoLeader,

    /// `open` was called twice on the same instance.
    #[error("store is already open")]
    AlreadyOpen,

    /// An operation needing consensus ran before `open`.
    #[error("store is not open")]
    NotOpen,

    /// Consensus-level failure.
    #[error(transparent)]
    Raft(#[from] RaftError),

    /// Local state failure.
    #[error(transparent)]
    Kv(#[from] dkv_kv::KvError),

    /// Wire codec failure.
    #[error(transparent)]
    Wire(#[from] dkv_wire::WireError),

    /// I/O failure opening stores or binding the peer listener.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True for errors a client may retry, possibly after rediscovering
    /// the leader.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NoLeader => true,
            Self::Raft(e) => e.is_retryable(),
            _ => false,
        }
    }
}
