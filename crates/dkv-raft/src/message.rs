//! Peer transport messages.
//!
//! Every peer exchange is a strict request/response pair carried in a
//! length-prefixed frame:
//!
//! - [`RequestVoteRequest`]: candidate to voter, during elections
//! - [`AppendEntriesRequest`]: leader to follower, replication and heartbeat
//! - [`InstallSnapshotRequest`]: leader to a follower that is too far behind
//! - [`ForwardApplyRequest`]: follower to leader, write proxying

use dkv_wire::Frame;
use serde::{Deserialize, Serialize};

use crate::types::{Configuration, LogEntry, LogIndex, NodeId, ServerAddress, Term};
use crate::{RaftError, RaftResult};

/// A request on the peer transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequest {
    /// Ask for a vote in an election.
    RequestVote(RequestVoteRequest),
    /// Replicate entries or assert leadership.
    AppendEntries(AppendEntriesRequest),
    /// Bring a lagging follower up to date wholesale.
    InstallSnapshot(InstallSnapshotRequest),
    /// Proxy a proposal from a non-leader to the leader.
    ForwardApply(ForwardApplyRequest),
}

/// A response on the peer transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResponse {
    /// Answer to [`RpcRequest::RequestVote`].
    RequestVote(RequestVoteResponse),
    /// Answer to [`RpcRequest::AppendEntries`].
    AppendEntries(AppendEntriesResponse),
    /// Answer to [`RpcRequest::InstallSnapshot`].
    InstallSnapshot(InstallSnapshotResponse),
    /// Answer to [`RpcRequest::ForwardApply`].
    ForwardApply(ForwardApplyResponse),
}

/// Vote solicitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// The candidate's term.
    pub term: Term,
    /// The candidate asking for the vote.
    pub candidate: NodeId,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

/// Vote answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// The voter's term, for the candidate to adopt if newer.
    pub term: Term,
    /// Whether the vote was granted.
    pub granted: bool,
}

/// Log replication / heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// The leader's term.
    pub term: Term,
    /// The leader's id.
    pub leader: NodeId,
    /// The leader's advertised address, so followers can route forwarded
    /// proposals without waiting for a configuration entry.
    pub leader_address: ServerAddress,
    /// Index of the entry immediately preceding `entries`.
    pub prev_log_index: LogIndex,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    /// Entries to append; empty for a heartbeat.
    pub entries: Vec<LogEntry>,
    /// The leader's commit index.
    pub leader_commit: LogIndex,
}

/// Replication answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The follower's term, for the leader to adopt if newer.
    pub term: Term,
    /// Whether the entries were appended.
    pub success: bool,
    /// The follower's last log index; lets the leader converge
    /// `next_index` in one step instead of decrementing.
    pub last_index: LogIndex,
}

/// Full-state transfer for a follower behind the log's first index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's term.
    pub term: Term,
    /// The leader's id.
    pub leader: NodeId,
    /// The leader's advertised address.
    pub leader_address: ServerAddress,
    /// Index of the last entry covered by the snapshot.
    pub last_index: LogIndex,
    /// Term of that entry.
    pub last_term: Term,
    /// Membership as of the snapshot.
    pub configuration: Configuration,
    /// The serialized state machine.
    pub data: Vec<u8>,
}

/// Snapshot install answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The follower's term.
    pub term: Term,
    /// Whether the snapshot was installed.
    pub success: bool,
}

/// A proposal proxied from a non-leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardApplyRequest {
    /// The opaque command payload.
    pub payload: Vec<u8>,
}

/// Outcome of a proxied proposal, mirroring a local apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardApplyResponse {
    /// `Ok` once committed and applied on the leader, or the error the
    /// local submitter would have seen.
    pub result: Result<(), RemoteError>,
}

/// Engine errors that survive serialization across the peer transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteError {
    /// The target was not the leader.
    NotLeader,
    /// The target lost leadership before commit.
    LeadershipLost,
    /// The target timed out awaiting commit.
    Timeout,
    /// The target is shutting down.
    Shutdown,
    /// The target's state machine rejected the entry.
    Apply(String),
    /// Anything else, stringified.
    Other(String),
}

impl From<RaftError> for RemoteError {
    fn from(e: RaftError) -> Self {
        match e {
            RaftError::NotLeader => Self::NotLeader,
            RaftError::LeadershipLost => Self::LeadershipLost,
            RaftError::Timeout => Self::Timeout,
            RaftError::Shutdown => Self::Shutdown,
            RaftError::Apply(msg) => Self::Apply(msg),
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<RemoteError> for RaftError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::NotLeader => Self::NotLeader,
            RemoteError::LeadershipLost => Self::LeadershipLost,
            RemoteError::Timeout => Self::Timeout,
            RemoteError::Shutdown => Self::Shutdown,
            RemoteError::Apply(msg) => Self::Apply(msg),
            RemoteError::Other(msg) => Self::Transport(msg),
        }
    }
}

impl RpcRequest {
    /// Encodes the request into a frame.
    pub fn to_frame(&self) -> RaftResult<Frame> {
        Ok(Frame::new(postcard::to_allocvec(self)?))
    }

    /// Decodes a request from a frame body.
    pub fn from_frame(frame: &Frame) -> RaftResult<Self> {
        Ok(postcard::from_bytes(&frame.body)?)
    }
}

impl RpcResponse {
    /// Encodes the response into a frame.
    pub fn to_frame(&self) -> RaftResult<Frame> {
        Ok(Frame::new(postcard::to_allocvec(self)?))
    }

    /// Decodes a response from a frame body.
    pub fn from_frame(frame: &Frame) -> RaftResult<Self> {
        Ok(postcard::from_bytes(&frame.body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryKind;

    #[test]
    fn test_request_frame_roundtrip() {
        let req = RpcRequest::AppendEntries(AppendEntriesRequest {
            term: 3,
            leader: "node0".into(),
            leader_address: "127.0.0.1:2380".into(),
            prev_log_index: 7,
            prev_log_term: 2,
            entries: vec![LogEntry {
                index: 8,
                term: 3,
                kind: EntryKind::Command,
                data: vec![1, 2, 3],
            }],
            leader_commit: 7,
        });
        let decoded = RpcRequest::from_frame(&req.to_frame().unwrap()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_response_frame_roundtrip() {
        let res = RpcResponse::ForwardApply(ForwardApplyResponse {
            result: Err(RemoteError::NotLeader),
        });
        let decoded = RpcResponse::from_frame(&res.to_frame().unwrap()).unwrap();
        assert_eq!(decoded, res);
    }

    #[test]
    fn test_remote_error_mapping_is_symmetric() {
        for err in [
            RaftError::NotLeader,
            RaftError::LeadershipLost,
            RaftError::Timeout,
            RaftError::Shutdown,
            RaftError::Apply("bad entry".into()),
        ] {
            let name = format!("{err:?}");
            let roundtripped: RaftError = RemoteError::from(err).into();
            assert_eq!(format!("{roundtripped:?}"), name);
        }
    }
}
