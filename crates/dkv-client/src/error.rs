//! Client error types.

use dkv_wire::{ErrorCode, ErrorResponse};
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors a client call can produce.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered with an error status.
    #[error("server error ({code:?}): {message}")]
    Server {
        /// The status category.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },

    /// The response did not match the request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Wire codec failure.
    #[error(transparent)]
    Wire(#[from] dkv_wire::WireError),

    /// Connection-level failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS setup failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// No server with an advertised RPC address is reachable.
    #[error("no eligible endpoint: {0}")]
    NoEndpoint(String),
}

impl From<ErrorResponse> for ClientError {
    fn from(e: ErrorResponse) -> Self {
        Self::Server {
            code: e.code,
            message: e.message,
        }
    }
}

impl ClientError {
    /// True when the call may succeed against a different node (follower
    /// answered a leader-only request) or after a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Server {
                code: ErrorCode::NotLeader | ErrorCode::Unavailable,
                ..
            }
        )
    }
}
