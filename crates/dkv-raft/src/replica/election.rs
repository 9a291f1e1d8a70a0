//! Leader election.

use std::time::Instant;

use tracing::{debug, info};

use crate::RaftResult;
use crate::message::{RequestVoteRequest, RequestVoteResponse, RpcRequest};
use crate::types::{NodeId, Term};

use super::{PeerCtx, PeerSend, Replica, Role};

impl Replica {
    /// The election timeout fired: campaign for leadership.
    pub(super) fn start_election(&mut self, now: Instant) -> RaftResult<Vec<PeerSend>> {
        self.reset_election_deadline(now);

        // A node with no configuration has not been bootstrapped or joined
        // yet; a node removed from the configuration must not disrupt the
        // remaining voters.
        if self.latest_config.servers.is_empty() || !self.latest_config.contains(&self.id) {
            return Ok(Vec::new());
        }

        self.set_role(Role::Candidate);
        let term = self.current_term + 1;
        self.set_current_term(term)?;
        self.set_voted_for(Some(self.id.clone()))?;
        self.set_leader(None);
        self.votes.clear();
        self.votes.insert(self.id.clone());
        info!(id = %self.id, term, "starting election");

        if self.votes.len() >= self.latest_config.quorum() {
            // Single-voter cluster: win immediately.
            return self.become_leader();
        }

        let (last_log_index, last_log_term) = self.last_log()?;
        let request = RequestVoteRequest {
            term,
            candidate: self.id.clone(),
            last_log_index,
            last_log_term,
        };
        Ok(self
            .voters_except_self()
            .into_iter()
            .map(|server| PeerSend {
                id: server.id,
                addr: server.address,
                request: RpcRequest::RequestVote(request.clone()),
                ctx: PeerCtx::Vote { term },
            })
            .collect())
    }

    /// A candidate asked for our vote.
    pub(super) fn handle_request_vote(
        &mut self,
        req: &RequestVoteRequest,
    ) -> RaftResult<RequestVoteResponse> {
        if req.term < self.current_term {
            return Ok(RequestVoteResponse {
                term: self.current_term,
                granted: false,
            });
        }

        // A server outside the configuration must not win elections or
        // bump our term: a removed-but-running node keeps campaigning with
        // ever higher terms and would otherwise depose live leaders.
        if !self.latest_config.servers.is_empty() && !self.latest_config.contains(&req.candidate) {
            debug!(candidate = %req.candidate, "rejecting vote for non-member");
            return Ok(RequestVoteResponse {
                term: self.current_term,
                granted: false,
            });
        }

        if req.term > self.current_term {
            self.step_down(req.term, None)?;
        }

        let (last_log_index, last_log_term) = self.last_log()?;
        let log_up_to_date = req.last_log_term > last_log_term
            || (req.last_log_term == last_log_term && req.last_log_index >= last_log_index);
        let can_vote = match &self.voted_for {
            None => true,
            Some(candidate) => candidate == &req.candidate,
        };

        let granted = log_up_to_date && can_vote;
        if granted {
            self.set_voted_for(Some(req.candidate.clone()))?;
            self.reset_election_deadline(Instant::now());
            debug!(candidate = %req.candidate, term = req.term, "vote granted");
        }
        Ok(RequestVoteResponse {
            term: self.current_term,
            granted,
        })
    }

    /// A voter answered our solicitation.
    pub(super) fn handle_vote_response(
        &mut self,
        peer: &NodeId,
        sent_term: Term,
        resp: &RequestVoteResponse,
    ) -> RaftResult<Vec<PeerSend>> {
        if resp.term > self.current_term {
            self.step_down(resp.term, None)?;
            return Ok(Vec::new());
        }
        if self.role != Role::Candidate || sent_term != self.current_term || !resp.granted {
            return Ok(Vec::new());
        }

        self.votes.insert(peer.clone());
        if self.votes.len() >= self.latest_config.quorum() {
            return self.become_leader();
        }
        Ok(Vec::new())
    }

    /// Won the election: assert leadership and start replicating.
    pub(super) fn become_leader(&mut self) -> RaftResult<Vec<PeerSend>> {
        info!(id = %self.id, term = self.current_term, "became leader");
        self.set_role(Role::Leader);
        self.set_leader(Some((self.advertise().clone(), self.id.clone())));
        self.in_flight.clear();

        let last = self.log.last_index()?.max(self.snapshot_index);
        self.next_index.clear();
        self.match_index.clear();
        for server in self.voters_except_self() {
            self.next_index.insert(server.id.clone(), last + 1);
            self.match_index.insert(server.id, 0);
        }

        // A no-op in the new term lets entries from earlier terms commit.
        let entry = crate::types::LogEntry {
            index: last + 1,
            term: self.current_term,
            kind: crate::types::EntryKind::Noop,
            data: Vec::new(),
        };
        self.log.store_entries(&[entry])?;

        self.heartbeat_deadline = Instant::now() + self.config.heartbeat_interval;
        let sends = self.replicate_all()?;
        self.maybe_advance_commit()?;
        Ok(sends)
    }
}
