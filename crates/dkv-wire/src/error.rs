//! Wire protocol error types.

use thiserror::Error;

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors that can occur while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum WireError {
    /// A frame body exceeded the protocol limit.
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Declared body size.
        size: usize,
        /// Protocol limit.
        max: usize,
    },

    /// A payload failed to decode.
    #[error("malformed payload: {0}")]
    Decode(#[from] postcard::Error),

    /// A snapshot stream ended mid-record or carried invalid data.
    #[error("malformed snapshot record: {0}")]
    Snapshot(String),

    /// I/O failure while streaming snapshot records.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
