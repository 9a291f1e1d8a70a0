//! Engine error types.

use thiserror::Error;

/// Result type for engine operations.
pub type RaftResult<T> = Result<T, RaftError>;

/// Errors surfaced by the consensus engine.
#[derive(Debug, Error)]
pub enum RaftError {
    /// A proposal reached a node that is not the leader. Nothing was
    /// enqueued; retry against the leader.
    #[error("node is not the leader")]
    NotLeader,

    /// The leader stepped down before the proposal committed. The proposal
    /// may or may not eventually commit; the caller may retry.
    #[error("leadership lost while awaiting commit")]
    LeadershipLost,

    /// The operation did not complete within its deadline.
    #[error("timed out awaiting commit")]
    Timeout,

    /// The engine is shutting down; all outstanding operations are
    /// canceled.
    #[error("raft is shutting down")]
    Shutdown,

    /// The state machine rejected a committed entry. The node keeps
    /// running but its state machine has diverged; operators must
    /// intervene.
    #[error("state machine apply failed: {0}")]
    Apply(String),

    /// A membership change was submitted while another is still in flight.
    #[error("configuration change already in progress")]
    ConfigChangeInProgress,

    /// A membership change named a stale configuration index.
    #[error("configuration changed since index {expected}, now at {actual}")]
    StaleConfiguration {
        /// The index the caller based its change on.
        expected: u64,
        /// The current configuration index.
        actual: u64,
    },

    /// Bootstrap was requested on a node with durable state.
    #[error("cannot bootstrap: node already has state")]
    AlreadyHasState,

    /// The cluster configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A storage or transport I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An encode/decode failure.
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),

    /// Wire framing failure on the peer transport.
    #[error(transparent)]
    Wire(#[from] dkv_wire::WireError),

    /// A peer RPC failed at the transport level.
    #[error("transport error: {0}")]
    Transport(String),
}

impl RaftError {
    /// True for errors a caller may retry after re-finding the leader.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotLeader | Self::LeadershipLost | Self::Timeout | Self::Transport(_)
        )
    }
}
