//! Public RPC surface: requests, responses, and error codes.
//!
//! Two services share the surface:
//!
//! - KV: `Get` / `Set` / `Delete`
//! - Membership: `GetServers` / `JoinServer` / `LeaveServer`

use bytes::BytesMut;
use serde::{Deserialize, Serialize};

use crate::{Frame, WireResult};

/// Correlates a response with its request on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// A request on the public RPC surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Client-chosen correlation id.
    pub id: RequestId,
    /// The operation to perform.
    pub payload: RequestPayload,
}

/// Operations a client can request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestPayload {
    /// Read the value bound to a key.
    Get {
        /// The key to read.
        key: String,
    },
    /// Bind a key to a value.
    Set {
        /// The key to bind.
        key: String,
        /// The value to bind it to.
        value: String,
    },
    /// Remove the binding for a key.
    Delete {
        /// The key to unbind.
        key: String,
    },
    /// List the cluster's voting members.
    GetServers,
    /// Add a voting member.
    JoinServer {
        /// The joining node's id.
        id: String,
        /// The joining node's peer (raft) address.
        address: String,
    },
    /// Remove a voting member.
    LeaveServer {
        /// The leaving node's id.
        id: String,
    },
}

/// A response on the public RPC surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// The id of the request this answers.
    pub id: RequestId,
    /// The result.
    pub payload: ResponsePayload,
}

/// Results of client operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponsePayload {
    /// A successful `Get`.
    Value {
        /// The value bound to the requested key.
        value: String,
    },
    /// A successful `Set`, `Delete`, `JoinServer`, or `LeaveServer`.
    Ok,
    /// A successful `GetServers`.
    Servers {
        /// One entry per voting member.
        servers: Vec<ServerInfo>,
    },
    /// A failed operation.
    Error(ErrorResponse),
}

/// A voting member as reported by the membership service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// The node's id.
    pub id: String,
    /// The node's peer (raft) address.
    pub raft_address: String,
    /// The node's advertised public RPC address; empty when the operator
    /// advertised none.
    pub rpc_address: String,
    /// True on exactly the current leader.
    pub is_leader: bool,
}

/// Error detail carried by [`ResponsePayload::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable category.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

/// Error categories on the public RPC surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The requested key has no binding. Not retryable.
    NotFound,
    /// The request was malformed (e.g. an empty key). Not retryable.
    InvalidArgument,
    /// The cluster cannot serve the request right now (no leader, lost
    /// leadership, timeout). Retryable.
    Unavailable,
    /// A membership operation reached a follower. Retry against the leader.
    NotLeader,
    /// Unexpected server-side failure.
    Internal,
}

impl Request {
    /// Decodes a request from a frame body.
    pub fn from_frame(frame: &Frame) -> WireResult<Self> {
        Ok(postcard::from_bytes(&frame.body)?)
    }

    /// Encodes the request into a frame.
    pub fn to_frame(&self) -> WireResult<Frame> {
        Ok(Frame::new(postcard::to_allocvec(self)?))
    }
}

impl Response {
    /// A successful response.
    pub fn new(id: RequestId, payload: ResponsePayload) -> Self {
        Self { id, payload }
    }

    /// An error response.
    pub fn error(id: RequestId, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            payload: ResponsePayload::Error(ErrorResponse {
                code,
                message: message.into(),
            }),
        }
    }

    /// Decodes a response from a frame body.
    pub fn from_frame(frame: &Frame) -> WireResult<Self> {
        Ok(postcard::from_bytes(&frame.body)?)
    }

    /// Encodes the response into a frame.
    pub fn to_frame(&self) -> WireResult<Frame> {
        Ok(Frame::new(postcard::to_allocvec(self)?))
    }

    /// Encodes the response directly into a write buffer.
    pub fn encode_into(&self, buf: &mut BytesMut) -> WireResult<()> {
        self.to_frame()?.encode(buf);
        Ok(())
    }
}
