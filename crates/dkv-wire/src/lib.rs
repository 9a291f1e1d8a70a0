//! Wire protocol for dkv.
//!
//! Everything that crosses a boundary is defined here:
//!
//! - [`Frame`]: the length-prefixed envelope used on both the public RPC
//!   surface and the peer transport.
//! - [`Request`] / [`Response`]: the public RPC surface (KV and membership
//!   services).
//! - [`Command`]: the record written into the replicated log.
//! - [`snapshot`]: the streaming record codec for state-machine snapshots.
//!
//! All binary encoding uses `postcard`, which is canonical and
//! deterministic; a given value always encodes to the same bytes.

mod command;
mod error;
mod frame;
mod message;
pub mod snapshot;

pub use command::Command;
pub use error::{WireError, WireResult};
pub use frame::{Frame, FRAME_HEADER_SIZE, MAX_FRAME_SIZE, read_frame, write_frame};
pub use message::{
    ErrorCode, ErrorResponse, Request, RequestId, RequestPayload, Response, ResponsePayload,
    ServerInfo,
};
