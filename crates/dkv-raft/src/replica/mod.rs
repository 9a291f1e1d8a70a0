//! The Raft replica core.
//!
//! All volatile consensus state lives here, owned by a single runtime
//! thread. Events come in (peer RPCs, local proposals, ticks), state
//! transitions happen synchronously, and outgoing peer sends come out;
//! the runtime performs the actual I/O. Blocking network work never
//! happens on this path.
//!
//! ```text
//! peer conns ──► Event::Rpc ─────┐
//! callers ────► Event::Apply ────┼──► Replica ──► Vec<PeerSend> ──► peer clients
//! timer ──────► tick() ──────────┘      │
//!                                       └──► log / stable / snapshot stores, FSM
//! ```
//!
//! Submodules split the protocol the way it is usually presented:
//! [`election`](self) handling in `election.rs`, log replication and
//! snapshotting in `replication.rs`.

mod election;
mod replication;

pub(crate) use replication::ConfigChange;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{info, warn};

use crate::fsm::Fsm;
use crate::future::Completer;
use crate::message::{RpcRequest, RpcResponse};
use crate::snapshot::{SnapshotMeta, SnapshotStore};
use crate::storage::{KEY_CURRENT_TERM, KEY_VOTED_FOR, LogStore, StableStore};
use crate::types::{Configuration, EntryKind, LogIndex, NodeId, Server, ServerAddress, Term};
use crate::{RaftError, RaftResult};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// How often the leader asserts itself to idle followers.
    pub heartbeat_interval: Duration,
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min: Duration,
    /// Upper bound of the randomized election timeout.
    pub election_timeout_max: Duration,
    /// Applied entries between snapshots.
    pub snapshot_threshold: u64,
    /// Entries kept in the log behind a snapshot, so slightly lagging
    /// followers can catch up without a snapshot install.
    pub trailing_logs: u64,
    /// Maximum entries per AppendEntries batch.
    pub max_append_entries: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_min: Duration::from_millis(500),
            election_timeout_max: Duration::from_millis(1000),
            snapshot_threshold: 8192,
            trailing_logs: 128,
            max_append_entries: 64,
        }
    }
}

/// The role a replica currently plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Correlation state attached to an outgoing peer RPC, echoed back with the
/// peer's answer so stale replies can be discarded.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PeerCtx {
    /// A RequestVote sent in `term`.
    Vote { term: Term },
    /// An AppendEntries sent in `term` whose last entry was `last_sent`
    /// (`last_sent == prev_log_index` for heartbeats).
    Append { term: Term, last_sent: LogIndex },
    /// An InstallSnapshot covering up to `last_index`, sent in `term`.
    Snapshot { term: Term, last_index: LogIndex },
}

/// An RPC the runtime should deliver to a peer.
pub(crate) struct PeerSend {
    pub id: NodeId,
    pub addr: ServerAddress,
    pub request: RpcRequest,
    pub ctx: PeerCtx,
}

/// Shared cell the public handle reads the current leader from.
pub(crate) type LeaderCell = Arc<Mutex<Option<(ServerAddress, NodeId)>>>;

pub(crate) struct Replica {
    pub(crate) id: NodeId,
    advertise: ServerAddress,
    config: RaftConfig,

    log: Box<dyn LogStore>,
    stable: Box<dyn StableStore>,
    snapshots: Box<dyn SnapshotStore>,
    fsm: Box<dyn Fsm>,

    role: Role,
    current_term: Term,
    voted_for: Option<NodeId>,
    leader_cell: LeaderCell,

    commit_index: LogIndex,
    last_applied: LogIndex,

    /// Index and term covered by the newest durable snapshot.
    snapshot_index: LogIndex,
    snapshot_term: Term,

    /// Membership as of the newest configuration entry in the log;
    /// effective immediately on append.
    latest_config: Configuration,
    latest_config_index: LogIndex,
    /// Membership as of the newest *committed* configuration entry.
    committed_config: Configuration,
    committed_config_index: LogIndex,

    // Candidate state
    votes: HashSet<NodeId>,

    // Leader state
    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, LogIndex>,
    in_flight: HashSet<NodeId>,
    pending_applies: BTreeMap<LogIndex, Completer<()>>,
    pending_config: Option<(LogIndex, Completer<LogIndex>)>,

    election_deadline: Instant,
    heartbeat_deadline: Instant,
}

impl Replica {
    /// Recovers a replica from its durable stores.
    ///
    /// Restores the newest snapshot into the FSM, then picks up term, vote
    /// and configuration. May block while the snapshot streams in.
    pub fn new(
        id: NodeId,
        advertise: ServerAddress,
        config: RaftConfig,
        mut fsm: Box<dyn Fsm>,
        log: Box<dyn LogStore>,
        stable: Box<dyn StableStore>,
        snapshots: Box<dyn SnapshotStore>,
        leader_cell: LeaderCell,
    ) -> RaftResult<Self> {
        let current_term = stable.get_u64(KEY_CURRENT_TERM)?.unwrap_or(0);
        let voted_for = stable
            .get(KEY_VOTED_FOR)?
            .filter(|v| !v.is_empty())
            .map(NodeId::from);

        let mut snapshot_index = 0;
        let mut snapshot_term = 0;
        let mut committed_config = Configuration::default();
        let mut committed_config_index = 0;
        if let Some(meta) = snapshots.list()?.into_iter().next() {
            let (meta, mut reader) = snapshots.open(&meta.id)?;
            info!(id = %id, index = meta.index, term = meta.term, "restoring snapshot");
            fsm.restore(&mut *reader)
                .map_err(|e| RaftError::Apply(e.to_string()))?;
            snapshot_index = meta.index;
            snapshot_term = meta.term;
            committed_config = meta.configuration;
            committed_config_index = meta.index;
        }

        let now = Instant::now();
        let mut replica = Self {
            id,
            advertise,
            config,
            log,
            stable,
            snapshots,
            fsm,
            role: Role::Follower,
            current_term,
            voted_for,
            leader_cell,
            commit_index: snapshot_index,
            last_applied: snapshot_index,
            snapshot_index,
            snapshot_term,
            latest_config: committed_config.clone(),
            latest_config_index: committed_config_index,
            committed_config,
            committed_config_index,
            votes: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            in_flight: HashSet::new(),
            pending_applies: BTreeMap::new(),
            pending_config: None,
            election_deadline: now,
            heartbeat_deadline: now,
        };
        replica.recompute_latest_config()?;
        replica.reset_election_deadline(now);
        replica.set_leader(None);
        Ok(replica)
    }

    /// Writes the one-server genesis configuration into an empty log.
    ///
    /// The node then wins its own election on the first timeout.
    pub fn bootstrap(&mut self, configuration: Configuration) -> RaftResult<()> {
        if self.current_term > 0 || self.log.last_index()? > 0 || self.snapshot_index > 0 {
            return Err(RaftError::AlreadyHasState);
        }
        if configuration.servers.is_empty() {
            return Err(RaftError::InvalidConfiguration(
                "bootstrap configuration has no servers".into(),
            ));
        }
        info!(id = %self.id, config = ?configuration, "bootstrapping cluster");
        self.set_current_term(1)?;
        let entry = crate::types::LogEntry {
            index: 1,
            term: 1,
            kind: EntryKind::Configuration,
            data: configuration.encode()?,
        };
        self.log.store_entries(&[entry])?;
        self.latest_config = configuration.clone();
        self.latest_config_index = 1;
        self.committed_config = configuration;
        self.committed_config_index = 1;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event entry points
    // ------------------------------------------------------------------

    /// Handles a synchronous peer RPC (vote, append, snapshot).
    pub fn handle_rpc(&mut self, request: RpcRequest) -> RaftResult<(RpcResponse, Vec<PeerSend>)> {
        match request {
            RpcRequest::RequestVote(req) => {
                let resp = self.handle_request_vote(&req)?;
                Ok((RpcResponse::RequestVote(resp), Vec::new()))
            }
            RpcRequest::AppendEntries(req) => {
                let resp = self.handle_append_entries(req)?;
                Ok((RpcResponse::AppendEntries(resp), Vec::new()))
            }
            RpcRequest::InstallSnapshot(req) => {
                let resp = self.handle_install_snapshot(req)?;
                Ok((RpcResponse::InstallSnapshot(resp), Vec::new()))
            }
            RpcRequest::ForwardApply(_) => {
                // Routed by the runtime through submit_apply; reaching here
                // is a programming error on the caller side.
                Err(RaftError::Transport(
                    "forward-apply must be routed through submit_apply".into(),
                ))
            }
        }
    }

    /// Handles the answer (or failure) of an RPC we sent to a peer.
    pub fn handle_peer_result(
        &mut self,
        peer: &NodeId,
        ctx: PeerCtx,
        result: Result<RpcResponse, String>,
    ) -> RaftResult<Vec<PeerSend>> {
        self.in_flight.remove(peer);
        let response = match result {
            Ok(response) => response,
            Err(reason) => {
                // The peer is unreachable or slow; the next heartbeat
                // retries.
                warn!(peer = %peer, reason = %reason, "peer rpc failed");
                return Ok(Vec::new());
            }
        };
        match (ctx, response) {
            (PeerCtx::Vote { term }, RpcResponse::RequestVote(resp)) => {
                self.handle_vote_response(peer, term, &resp)
            }
            (PeerCtx::Append { term, last_sent }, RpcResponse::AppendEntries(resp)) => {
                self.handle_append_response(peer, term, last_sent, &resp)
            }
            (PeerCtx::Snapshot { term, last_index }, RpcResponse::InstallSnapshot(resp)) => {
                self.handle_snapshot_response(peer, term, last_index, &resp)
            }
            (_, other) => {
                warn!(peer = %peer, response = ?other, "mismatched peer response");
                Ok(Vec::new())
            }
        }
    }

    /// Advances timers: election timeout on followers/candidates,
    /// heartbeat cadence on the leader.
    pub fn tick(&mut self, now: Instant) -> RaftResult<Vec<PeerSend>> {
        match self.role {
            Role::Follower | Role::Candidate => {
                if now >= self.election_deadline {
                    return self.start_election(now);
                }
                Ok(Vec::new())
            }
            Role::Leader => {
                if now >= self.heartbeat_deadline {
                    self.heartbeat_deadline = now + self.config.heartbeat_interval;
                    return self.replicate_all();
                }
                Ok(Vec::new())
            }
        }
    }

    /// The committed cluster configuration.
    pub fn configuration(&self) -> Configuration {
        self.committed_config.clone()
    }

    /// Cancels every outstanding proposal and membership change.
    pub fn fail_all_pending(&mut self, make_error: impl Fn() -> RaftError) {
        for (_, completer) in std::mem::take(&mut self.pending_applies) {
            completer.resolve(Err(make_error()));
        }
        if let Some((_, completer)) = self.pending_config.take() {
            completer.resolve(Err(make_error()));
        }
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    /// Publishes the believed leader to the shared cell.
    fn set_leader(&mut self, leader: Option<(ServerAddress, NodeId)>) {
        *self.leader_cell.lock().expect("leader cell poisoned") = leader;
    }

    fn set_current_term(&mut self, term: Term) -> RaftResult<()> {
        self.stable.set_u64(KEY_CURRENT_TERM, term)?;
        self.current_term = term;
        Ok(())
    }

    fn set_voted_for(&mut self, candidate: Option<NodeId>) -> RaftResult<()> {
        self.stable
            .set(KEY_VOTED_FOR, candidate.as_ref().map_or("", NodeId::as_str))?;
        self.voted_for = candidate;
        Ok(())
    }

    /// Observed a higher term: adopt it and fall back to follower.
    fn step_down(&mut self, term: Term, leader: Option<(ServerAddress, NodeId)>) -> RaftResult<()> {
        if term > self.current_term {
            self.set_current_term(term)?;
            self.set_voted_for(None)?;
        }
        if self.role == Role::Leader {
            info!(id = %self.id, term, "stepping down");
        }
        self.set_role(Role::Follower);
        self.votes.clear();
        self.in_flight.clear();
        self.set_leader(leader);
        self.fail_all_pending(|| RaftError::LeadershipLost);
        self.reset_election_deadline(Instant::now());
        Ok(())
    }

    fn reset_election_deadline(&mut self, now: Instant) {
        let min = self.config.election_timeout_min;
        let max = self.config.election_timeout_max;
        let jitter = if max > min {
            let span = (max - min).as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..=span))
        } else {
            Duration::ZERO
        };
        self.election_deadline = now + min + jitter;
    }

    /// Index and term of the last entry, whether in the log or compacted
    /// into the snapshot.
    pub(crate) fn last_log(&self) -> RaftResult<(LogIndex, Term)> {
        let last = self.log.last_index()?;
        if last == 0 {
            return Ok((self.snapshot_index, self.snapshot_term));
        }
        let term = self
            .term_at(last)?
            .ok_or_else(|| RaftError::Transport(format!("log entry {last} unreadable")))?;
        Ok((last.max(self.snapshot_index), term))
    }

    /// Term of the entry at `index`, or `None` if it is not available.
    pub(crate) fn term_at(&self, index: LogIndex) -> RaftResult<Option<Term>> {
        if index == 0 {
            return Ok(Some(0));
        }
        if index == self.snapshot_index {
            return Ok(Some(self.snapshot_term));
        }
        Ok(self.log.get_entry(index)?.map(|e| e.term))
    }

    /// Re-derives the effective configuration after log mutation: the
    /// newest configuration entry still in the log, else the committed one.
    fn recompute_latest_config(&mut self) -> RaftResult<()> {
        let first = self.log.first_index()?;
        let last = self.log.last_index()?;
        let mut index = last;
        while index >= first && index > 0 {
            if let Some(entry) = self.log.get_entry(index)? {
                if entry.kind == EntryKind::Configuration {
                    self.latest_config = Configuration::decode(&entry.data)?;
                    self.latest_config_index = index;
                    return Ok(());
                }
            }
            index -= 1;
        }
        self.latest_config = self.committed_config.clone();
        self.latest_config_index = self.committed_config_index;
        Ok(())
    }

    /// Adopts a configuration appended to the log (effective immediately).
    fn adopt_config(&mut self, configuration: Configuration, index: LogIndex) {
        // Forget replication state for servers that left.
        self.next_index
            .retain(|id, _| configuration.contains(id) || id == &self.id);
        self.match_index
            .retain(|id, _| configuration.contains(id) || id == &self.id);
        self.in_flight.retain(|id| configuration.contains(id));
        self.latest_config = configuration;
        self.latest_config_index = index;
    }

    fn voters_except_self(&self) -> Vec<Server> {
        self.latest_config
            .servers
            .iter()
            .filter(|s| s.id != self.id)
            .cloned()
            .collect()
    }

    pub(crate) fn advertise(&self) -> &ServerAddress {
        &self.advertise
    }

    pub(crate) fn current_term(&self) -> Term {
        self.current_term
    }

    /// Reads the newest snapshot wholesale, for an install to a lagging
    /// follower.
    fn latest_snapshot_payload(&self) -> RaftResult<Option<(SnapshotMeta, Vec<u8>)>> {
        let Some(meta) = self.snapshots.list()?.into_iter().next() else {
            return Ok(None);
        };
        let (meta, mut reader) = self.snapshots.open(&meta.id)?;
        let mut data = Vec::with_capacity(meta.size as usize);
        reader.read_to_end(&mut data)?;
        Ok(Some((meta, data)))
    }
}

#[cfg(test)]
mod tests;
