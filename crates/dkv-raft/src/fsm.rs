//! The state-machine interface the engine drives.

use std::io::Read;

use thiserror::Error;

use crate::snapshot::SnapshotSink;
use crate::types::LogEntry;

/// A state-machine level failure.
///
/// Returned from [`Fsm::apply`] when a committed entry cannot be executed
/// (undecodable payload, unknown command). The engine propagates it to the
/// submitter and keeps running; the replica is considered diverged and
/// needs operator attention.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct FsmError(pub String);

impl FsmError {
    /// Creates an error from anything string-like.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// The deterministic state machine driven by committed log entries.
///
/// `apply` is called exactly once per committed entry, in log order, from a
/// single thread. Implementations must never panic on malformed input.
pub trait Fsm: Send {
    /// Executes a committed entry.
    fn apply(&mut self, entry: &LogEntry) -> Result<(), FsmError>;

    /// Captures the current state for snapshotting.
    ///
    /// The returned handle must be able to serialize the captured state
    /// later without blocking concurrent readers of the live state.
    fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>, FsmError>;

    /// Replaces the current state with a serialized snapshot.
    fn restore(&mut self, reader: &mut dyn Read) -> Result<(), FsmError>;
}

/// A point-in-time capture of FSM state, pending serialization.
pub trait FsmSnapshot: Send {
    /// Writes the captured state to `sink`.
    ///
    /// On any write error the implementation cancels the sink (so the
    /// snapshot store discards it) and returns the error; on success it
    /// leaves the sink open for the engine to close.
    fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<(), FsmError>;
}
