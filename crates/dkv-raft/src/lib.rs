//! # dkv-raft: Raft consensus for dkv
//!
//! A self-contained Raft engine: leader election, log replication, commit
//! tracking, snapshotting, and single-server membership changes, with a
//! pluggable state machine ([`Fsm`]), pluggable persistence
//! ([`LogStore`] / [`StableStore`] / [`SnapshotStore`]), and a pluggable
//! connection factory ([`StreamLayer`]) for peer traffic.
//!
//! ## Architecture
//!
//! All consensus state is owned by one runtime thread; everything else
//! talks to it through events. No async runtime, just explicit threads
//! and channels.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Raft                             │
//! │  ┌──────────┐   ┌─────────────┐   ┌───────────────────┐  │
//! │  │ acceptor │ → │   runtime   │ → │ peer clients (1/N)│  │
//! │  │ (stream) │   │  (replica)  │   │ pooled conns      │  │
//! │  └──────────┘   └─────────────┘   └───────────────────┘  │
//! │                    │        │                            │
//! │                   FSM     log/stable/snapshot stores     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let stream = Arc::new(TcpStreamLayer::bind("127.0.0.1:2380", None, None, None)?);
//! let raft = Raft::new(id, RaftConfig::default(), fsm, log, stable, snaps, stream)?;
//! raft.bootstrap_cluster(Configuration::single(id, advertised))?;
//! raft.apply(payload, Duration::from_secs(10)).wait()?;
//! ```

mod error;
mod fsm;
mod future;
mod message;
pub(crate) mod replica;
mod runtime;
mod snapshot;
mod storage;
mod stream;
pub(crate) mod transport;
mod types;

pub use error::{RaftError, RaftResult};
pub use fsm::{Fsm, FsmError, FsmSnapshot};
pub use future::{ApplyFuture, ConfigFuture, RaftFuture};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, ForwardApplyRequest, ForwardApplyResponse,
    InstallSnapshotRequest, InstallSnapshotResponse, RemoteError, RequestVoteRequest,
    RequestVoteResponse, RpcRequest, RpcResponse,
};
pub use replica::RaftConfig;
pub use runtime::Raft;
pub use snapshot::{FileSnapshotStore, SnapshotMeta, SnapshotSink, SnapshotStore};
pub use storage::{
    FileLogStore, FileStableStore, KEY_CURRENT_TERM, KEY_VOTED_FOR, LogStore, MemoryLogStore,
    MemoryStableStore, StableStore, has_existing_state,
};
pub use stream::{Connection, StreamLayer, TcpStreamLayer};
pub use types::{
    Configuration, EntryKind, LogEntry, LogIndex, NodeId, Server, ServerAddress, Term,
};
