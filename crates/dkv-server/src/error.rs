//! Server error types.

use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur while serving the public RPC surface.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Wire protocol error.
    #[error("wire protocol error: {0}")]
    Wire(#[from] dkv_wire::WireError),

    /// Store-level error.
    #[error(transparent)]
    Store(#[from] dkv_store::StoreError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// TLS material or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Bad server configuration; fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),
}
