//! Log replication, commit advancement, and snapshotting.

use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::future::Completer;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RpcRequest,
};
use crate::types::{Configuration, EntryKind, LogEntry, LogIndex, NodeId, ServerAddress, Term};
use crate::{RaftError, RaftResult};

use super::{PeerCtx, PeerSend, Replica, Role};

/// A single-server membership change.
pub(crate) enum ConfigChange {
    /// Add (or re-address) a voting member.
    AddVoter {
        id: NodeId,
        address: ServerAddress,
        prev_index: LogIndex,
    },
    /// Remove a voting member.
    RemoveServer { id: NodeId, prev_index: LogIndex },
}

impl Replica {
    // ------------------------------------------------------------------
    // Proposals
    // ------------------------------------------------------------------

    /// Submits a command payload on the leader.
    ///
    /// On a non-leader the completer resolves `NotLeader` immediately and
    /// nothing is enqueued.
    pub(crate) fn submit_apply(
        &mut self,
        payload: Vec<u8>,
        completer: Completer<()>,
    ) -> RaftResult<Vec<PeerSend>> {
        if self.role != Role::Leader {
            completer.resolve(Err(RaftError::NotLeader));
            return Ok(Vec::new());
        }
        let index = self.log.last_index()?.max(self.snapshot_index) + 1;
        let entry = LogEntry {
            index,
            term: self.current_term,
            kind: EntryKind::Command,
            data: payload,
        };
        self.log.store_entries(&[entry])?;
        self.pending_applies.insert(index, completer);

        let sends = self.replicate_all()?;
        self.maybe_advance_commit()?;
        Ok(sends)
    }

    /// Submits a single-server membership change on the leader.
    pub(crate) fn submit_config_change(
        &mut self,
        change: ConfigChange,
        completer: Completer<LogIndex>,
    ) -> RaftResult<Vec<PeerSend>> {
        if self.role != Role::Leader {
            completer.resolve(Err(RaftError::NotLeader));
            return Ok(Vec::new());
        }
        if self.pending_config.is_some() {
            completer.resolve(Err(RaftError::ConfigChangeInProgress));
            return Ok(Vec::new());
        }
        let prev_index = match &change {
            ConfigChange::AddVoter { prev_index, .. }
            | ConfigChange::RemoveServer { prev_index, .. } => *prev_index,
        };
        if prev_index != 0 && prev_index != self.latest_config_index {
            completer.resolve(Err(RaftError::StaleConfiguration {
                expected: prev_index,
                actual: self.latest_config_index,
            }));
            return Ok(Vec::new());
        }

        let mut servers = self.latest_config.servers.clone();
        match change {
            ConfigChange::AddVoter { id, address, .. } => {
                info!(id = %id, address = %address, "adding voter");
                servers.retain(|s| s.id != id);
                servers.push(crate::types::Server { id, address });
            }
            ConfigChange::RemoveServer { id, .. } => {
                info!(id = %id, "removing server");
                servers.retain(|s| s.id != id);
            }
        }
        let configuration = Configuration { servers };

        let index = self.log.last_index()?.max(self.snapshot_index) + 1;
        let entry = LogEntry {
            index,
            term: self.current_term,
            kind: EntryKind::Configuration,
            data: configuration.encode()?,
        };
        self.log.store_entries(&[entry])?;

        // Single-server changes take effect as soon as they are appended.
        let last = self.log.last_index()?;
        for server in &configuration.servers {
            if server.id != self.id {
                self.next_index.entry(server.id.clone()).or_insert(last);
                self.match_index.entry(server.id.clone()).or_insert(0);
            }
        }
        self.adopt_config(configuration, index);
        self.pending_config = Some((index, completer));

        let sends = self.replicate_all()?;
        self.maybe_advance_commit()?;
        Ok(sends)
    }

    // ------------------------------------------------------------------
    // Leader side
    // ------------------------------------------------------------------

    /// Dispatches replication (or a heartbeat) to every idle peer.
    pub(super) fn replicate_all(&mut self) -> RaftResult<Vec<PeerSend>> {
        let mut sends = Vec::new();
        for server in self.voters_except_self() {
            if self.in_flight.contains(&server.id) {
                continue;
            }
            if let Some(send) = self.replicate_to(&server.id, &server.address)? {
                sends.push(send);
            }
        }
        Ok(sends)
    }

    /// Builds the next RPC for one peer: entries from `next_index`, or a
    /// snapshot install when the peer is behind the log's first retained
    /// entry.
    fn replicate_to(&mut self, id: &NodeId, addr: &ServerAddress) -> RaftResult<Option<PeerSend>> {
        let last = self.log.last_index()?.max(self.snapshot_index);
        let next = *self.next_index.get(id).unwrap_or(&(last + 1));

        if next <= self.snapshot_index {
            let Some((meta, data)) = self.latest_snapshot_payload()? else {
                return Err(RaftError::Transport(format!(
                    "peer {id} needs entries before {next} but no snapshot exists"
                )));
            };
            debug!(peer = %id, index = meta.index, "sending snapshot");
            self.in_flight.insert(id.clone());
            return Ok(Some(PeerSend {
                id: id.clone(),
                addr: addr.clone(),
                request: RpcRequest::InstallSnapshot(InstallSnapshotRequest {
                    term: self.current_term,
                    leader: self.id.clone(),
                    leader_address: self.advertise().clone(),
                    last_index: meta.index,
                    last_term: meta.term,
                    configuration: meta.configuration.clone(),
                    data,
                }),
                ctx: PeerCtx::Snapshot {
                    term: self.current_term,
                    last_index: meta.index,
                },
            }));
        }

        let prev_log_index = next - 1;
        let prev_log_term = self.term_at(prev_log_index)?.ok_or_else(|| {
            RaftError::Transport(format!("log entry {prev_log_index} unavailable"))
        })?;

        let mut entries = Vec::new();
        let mut index = next;
        while index <= self.log.last_index()? && entries.len() < self.config.max_append_entries {
            let entry = self.log.get_entry(index)?.ok_or_else(|| {
                RaftError::Transport(format!("log entry {index} unavailable"))
            })?;
            entries.push(entry);
            index += 1;
        }
        let last_sent = entries.last().map_or(prev_log_index, |e| e.index);

        self.in_flight.insert(id.clone());
        Ok(Some(PeerSend {
            id: id.clone(),
            addr: addr.clone(),
            request: RpcRequest::AppendEntries(AppendEntriesRequest {
                term: self.current_term,
                leader: self.id.clone(),
                leader_address: self.advertise().clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit_index,
            }),
            ctx: PeerCtx::Append {
                term: self.current_term,
                last_sent,
            },
        }))
    }

    /// A follower answered an AppendEntries.
    pub(super) fn handle_append_response(
        &mut self,
        peer: &NodeId,
        sent_term: Term,
        last_sent: LogIndex,
        resp: &AppendEntriesResponse,
    ) -> RaftResult<Vec<PeerSend>> {
        if resp.term > self.current_term {
            self.step_down(resp.term, None)?;
            return Ok(Vec::new());
        }
        if self.role != Role::Leader || sent_term != self.current_term {
            return Ok(Vec::new());
        }
        let Some(addr) = self.latest_config.server(peer).map(|s| s.address.clone()) else {
            return Ok(Vec::new());
        };

        if resp.success {
            self.match_index.insert(peer.clone(), last_sent);
            self.next_index.insert(peer.clone(), last_sent + 1);
            self.maybe_advance_commit()?;
            // More entries may have arrived while this batch was in
            // flight.
            if last_sent < self.log.last_index()? {
                return Ok(self.replicate_to(peer, &addr)?.into_iter().collect());
            }
            return Ok(Vec::new());
        }

        // The follower's log diverges; converge on its last index in one
        // step rather than decrementing.
        let next = *self.next_index.get(peer).unwrap_or(&(last_sent + 1));
        let backed_off = next.saturating_sub(1).min(resp.last_index + 1).max(1);
        self.next_index.insert(peer.clone(), backed_off);
        debug!(peer = %peer, next = backed_off, "append rejected, backing off");
        Ok(self.replicate_to(peer, &addr)?.into_iter().collect())
    }

    /// A follower answered an InstallSnapshot.
    pub(super) fn handle_snapshot_response(
        &mut self,
        peer: &NodeId,
        sent_term: Term,
        last_index: LogIndex,
        resp: &InstallSnapshotResponse,
    ) -> RaftResult<Vec<PeerSend>> {
        if resp.term > self.current_term {
            self.step_down(resp.term, None)?;
            return Ok(Vec::new());
        }
        if self.role != Role::Leader || sent_term != self.current_term || !resp.success {
            return Ok(Vec::new());
        }
        self.match_index.insert(peer.clone(), last_index);
        self.next_index.insert(peer.clone(), last_index + 1);
        self.maybe_advance_commit()?;
        Ok(Vec::new())
    }

    /// Advances the commit index to the highest entry replicated on a
    /// quorum, then applies.
    ///
    /// Only entries from the current term commit by counting; earlier
    /// entries commit transitively (the leader's no-op takes care of them).
    pub(super) fn maybe_advance_commit(&mut self) -> RaftResult<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let own_last = self.log.last_index()?.max(self.snapshot_index);
        let mut matches: Vec<LogIndex> = self
            .latest_config
            .servers
            .iter()
            .map(|s| {
                if s.id == self.id {
                    own_last
                } else {
                    *self.match_index.get(&s.id).unwrap_or(&0)
                }
            })
            .collect();
        if matches.is_empty() {
            return Ok(());
        }
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let quorum_index = matches[self.latest_config.quorum() - 1];

        if quorum_index > self.commit_index && self.term_at(quorum_index)? == Some(self.current_term)
        {
            self.commit_index = quorum_index;
            self.apply_committed()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Follower side
    // ------------------------------------------------------------------

    /// The leader replicated entries to us (or heartbeated).
    pub(super) fn handle_append_entries(
        &mut self,
        req: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        if req.term < self.current_term {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                last_index: self.log.last_index()?.max(self.snapshot_index),
            });
        }
        let leader = Some((req.leader_address.clone(), req.leader.clone()));
        if req.term > self.current_term || self.role != Role::Follower {
            self.step_down(req.term, leader)?;
        } else {
            self.set_leader(leader);
        }
        self.reset_election_deadline(Instant::now());

        // Consistency check on the entry preceding the batch.
        if req.prev_log_index > 0 {
            match self.term_at(req.prev_log_index)? {
                Some(term) if term == req.prev_log_term => {}
                _ => {
                    return Ok(AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        last_index: self.log.last_index()?.max(self.snapshot_index),
                    });
                }
            }
        }

        let mut appended = Vec::new();
        let mut truncated = false;
        for entry in req.entries {
            match self.term_at(entry.index)? {
                Some(term) if term == entry.term => {
                    // Already have it.
                }
                Some(_) => {
                    // Conflict: drop the divergent suffix, then take the
                    // leader's version.
                    let last = self.log.last_index()?;
                    warn!(from = entry.index, to = last, "truncating conflicting entries");
                    self.log.delete_range(entry.index, last)?;
                    truncated = true;
                    appended.push(entry);
                }
                None => appended.push(entry),
            }
        }
        if truncated {
            self.recompute_latest_config()?;
        }
        if !appended.is_empty() {
            self.log.store_entries(&appended)?;
            for entry in &appended {
                if entry.kind == EntryKind::Configuration {
                    let configuration = Configuration::decode(&entry.data)?;
                    self.adopt_config(configuration, entry.index);
                }
            }
        }

        let last_index = self.log.last_index()?.max(self.snapshot_index);
        if req.leader_commit > self.commit_index {
            self.commit_index = req.leader_commit.min(last_index);
            self.apply_committed()?;
        }

        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            last_index,
        })
    }

    /// The leader sent us a full snapshot because our log is too far
    /// behind.
    pub(super) fn handle_install_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
                success: false,
            });
        }
        let leader = Some((req.leader_address.clone(), req.leader.clone()));
        if req.term > self.current_term || self.role != Role::Follower {
            self.step_down(req.term, leader)?;
        } else {
            self.set_leader(leader);
        }
        self.reset_election_deadline(Instant::now());

        if req.last_index <= self.snapshot_index {
            // Already covered; report success so the leader moves on.
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
                success: true,
            });
        }

        info!(index = req.last_index, term = req.last_term, "installing snapshot");

        // Make it durable first, then load it.
        let mut sink = self
            .snapshots
            .create(req.last_term, req.last_index, &req.configuration)?;
        if let Err(e) = std::io::Write::write_all(&mut *sink, &req.data) {
            let _ = sink.cancel();
            return Err(RaftError::Io(e));
        }
        sink.close()?;

        self.fsm
            .restore(&mut req.data.as_slice())
            .map_err(|e| RaftError::Apply(e.to_string()))?;

        let first = self.log.first_index()?;
        let last = self.log.last_index()?;
        if last > 0 {
            self.log.delete_range(first, last)?;
        }

        self.snapshot_index = req.last_index;
        self.snapshot_term = req.last_term;
        self.last_applied = req.last_index;
        self.commit_index = self.commit_index.max(req.last_index);
        self.committed_config = req.configuration.clone();
        self.committed_config_index = req.last_index;
        self.adopt_config(req.configuration, req.last_index);

        Ok(InstallSnapshotResponse {
            term: self.current_term,
            success: true,
        })
    }

    // ------------------------------------------------------------------
    // Apply & snapshot
    // ------------------------------------------------------------------

    /// Applies every committed-but-unapplied entry, in log order.
    pub(super) fn apply_committed(&mut self) -> RaftResult<()> {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = self.log.get_entry(index)?.ok_or_else(|| {
                RaftError::Transport(format!("committed entry {index} missing from log"))
            })?;
            match entry.kind {
                EntryKind::Command => {
                    let result = self.fsm.apply(&entry);
                    if let Err(e) = &result {
                        // The entry is committed; every replica will see
                        // the same failure. Keep running, surface it.
                        error!(index, error = %e, "state machine rejected committed entry");
                    }
                    if let Some(completer) = self.pending_applies.remove(&index) {
                        completer.resolve(result.map_err(|e| RaftError::Apply(e.to_string())));
                    }
                }
                EntryKind::Configuration => {
                    let configuration = Configuration::decode(&entry.data)?;
                    self.committed_config = configuration.clone();
                    self.committed_config_index = index;
                    if let Some((change_index, completer)) = self.pending_config.take() {
                        if change_index == index {
                            completer.resolve(Ok(index));
                        } else {
                            self.pending_config = Some((change_index, completer));
                        }
                    }
                    // A leader that just committed its own removal steps
                    // down.
                    if self.role == Role::Leader && !configuration.contains(&self.id) {
                        self.last_applied = index;
                        self.step_down(self.current_term, None)?;
                        continue;
                    }
                }
                EntryKind::Noop => {}
            }
            self.last_applied = index;
        }
        self.maybe_snapshot()
    }

    /// Takes a snapshot once enough entries have been applied, then
    /// truncates the log up to it (keeping a trailing window).
    fn maybe_snapshot(&mut self) -> RaftResult<()> {
        if self.last_applied - self.snapshot_index < self.config.snapshot_threshold {
            return Ok(());
        }
        let index = self.last_applied;
        let term = self.term_at(index)?.ok_or_else(|| {
            RaftError::Transport(format!("applied entry {index} missing from log"))
        })?;
        info!(index, term, "taking snapshot");

        let capture = self
            .fsm
            .snapshot()
            .map_err(|e| RaftError::Apply(e.to_string()))?;
        let mut sink = self
            .snapshots
            .create(term, index, &self.committed_config)?;
        match capture.persist(&mut *sink) {
            Ok(()) => sink.close()?,
            Err(e) => {
                // The FSM cancels on its own write errors; make sure.
                let _ = sink.cancel();
                error!(error = %e, "snapshot persist failed");
                return Ok(());
            }
        }

        self.snapshot_index = index;
        self.snapshot_term = term;

        let cutoff = index.saturating_sub(self.config.trailing_logs);
        let first = self.log.first_index()?;
        if first > 0 && cutoff >= first {
            self.log.delete_range(first, cutoff)?;
        }
        Ok(())
    }
}
