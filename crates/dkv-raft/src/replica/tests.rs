//! Replica state-machine tests.
//!
//! These drive the replica directly with events and peer results, no
//! networking involved: memory stores, a recording FSM, and explicit
//! instants for timers.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::fsm::{Fsm, FsmError, FsmSnapshot};
use crate::future::Completer;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
    RpcRequest, RpcResponse,
};
use crate::snapshot::{FileSnapshotStore, SnapshotSink};
use crate::storage::{MemoryLogStore, MemoryStableStore};
use crate::types::{Configuration, EntryKind, LogEntry, NodeId, Server, ServerAddress};
use crate::{RaftError, RaftResult};

use super::{LeaderCell, PeerCtx, RaftConfig, Replica, Role};

/// FSM that records every applied payload.
#[derive(Default)]
struct RecordingFsm {
    applied: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Fsm for RecordingFsm {
    fn apply(&mut self, entry: &LogEntry) -> Result<(), FsmError> {
        if entry.data == b"poison" {
            return Err(FsmError::new("poisoned entry"));
        }
        self.applied
            .lock()
            .expect("applied lock poisoned")
            .push(entry.data.clone());
        Ok(())
    }

    fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>, FsmError> {
        let applied = self.applied.lock().expect("applied lock poisoned").clone();
        Ok(Box::new(RecordingSnapshot { applied }))
    }

    fn restore(&mut self, reader: &mut dyn Read) -> Result<(), FsmError> {
        let mut raw = Vec::new();
        reader
            .read_to_end(&mut raw)
            .map_err(|e| FsmError::new(e.to_string()))?;
        let applied: Vec<Vec<u8>> = raw.split(|&b| b == b'\n').map(<[u8]>::to_vec).collect();
        *self.applied.lock().expect("applied lock poisoned") = applied;
        Ok(())
    }
}

struct RecordingSnapshot {
    applied: Vec<Vec<u8>>,
}

impl FsmSnapshot for RecordingSnapshot {
    fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<(), FsmError> {
        let joined = self.applied.join(&b'\n');
        std::io::Write::write_all(sink, &joined).map_err(|e| FsmError::new(e.to_string()))
    }
}

struct Harness {
    replica: Replica,
    applied: Arc<Mutex<Vec<Vec<u8>>>>,
    leader_cell: LeaderCell,
    _snapshots: TempDir,
}

fn test_config() -> RaftConfig {
    RaftConfig {
        heartbeat_interval: Duration::from_millis(50),
        election_timeout_min: Duration::from_millis(100),
        election_timeout_max: Duration::from_millis(100),
        snapshot_threshold: 10_000,
        trailing_logs: 16,
        max_append_entries: 64,
    }
}

fn harness(id: &str) -> Harness {
    let fsm = RecordingFsm::default();
    let applied = Arc::clone(&fsm.applied);
    let leader_cell: LeaderCell = Arc::new(Mutex::new(None));
    let snapshots = TempDir::new().expect("tempdir");
    let replica = Replica::new(
        NodeId::from(id),
        ServerAddress::new(format!("{id}.test:2380")),
        test_config(),
        Box::new(fsm),
        Box::new(MemoryLogStore::new()),
        Box::new(MemoryStableStore::new()),
        Box::new(FileSnapshotStore::new(snapshots.path(), 2).expect("snapshot store")),
        Arc::clone(&leader_cell),
    )
    .expect("replica");
    Harness {
        replica,
        applied,
        leader_cell,
        _snapshots: snapshots,
    }
}

fn three_node_config() -> Configuration {
    Configuration {
        servers: vec![
            Server {
                id: "node0".into(),
                address: "node0.test:2380".into(),
            },
            Server {
                id: "node1".into(),
                address: "node1.test:2380".into(),
            },
            Server {
                id: "node2".into(),
                address: "node2.test:2380".into(),
            },
        ],
    }
}

/// Ticks far enough in the future to force the election timeout.
fn force_election(replica: &mut Replica) -> Vec<super::PeerSend> {
    replica
        .tick(Instant::now() + Duration::from_secs(5))
        .expect("tick")
}

fn capture_apply() -> (Completer<()>, Arc<Mutex<Option<RaftResult<()>>>>) {
    let slot = Arc::new(Mutex::new(None));
    let captured = Arc::clone(&slot);
    let completer = Completer::new(move |result| {
        *captured.lock().expect("capture lock poisoned") = Some(result);
    });
    (completer, slot)
}

/// Elects `node0` leader of a three-node cluster by feeding one granted
/// vote, then acknowledges `node1`'s initial no-op replication so its
/// in-flight slot is free again.
fn elect_three_node_leader(h: &mut Harness) {
    h.replica
        .bootstrap(three_node_config())
        .expect("bootstrap three-node");
    let sends = force_election(&mut h.replica);
    assert_eq!(sends.len(), 2, "solicits both peers");
    assert_eq!(h.replica.role(), Role::Candidate);

    let term = h.replica.current_term();
    h.replica
        .handle_peer_result(
            &"node1".into(),
            PeerCtx::Vote { term },
            Ok(RpcResponse::RequestVote(RequestVoteResponse {
                term,
                granted: true,
            })),
        )
        .expect("vote result");
    assert_eq!(h.replica.role(), Role::Leader);

    // The new leader replicated its no-op (index 2, after the bootstrap
    // configuration at index 1) to both peers; ack node1's copy.
    h.replica
        .handle_peer_result(
            &"node1".into(),
            PeerCtx::Append { term, last_sent: 2 },
            Ok(RpcResponse::AppendEntries(AppendEntriesResponse {
                term,
                success: true,
                last_index: 2,
            })),
        )
        .expect("noop ack");
}

#[test]
fn test_single_node_elects_itself() {
    let mut h = harness("node0");
    h.replica
        .bootstrap(Configuration::single(
            "node0".into(),
            "node0.test:2380".into(),
        ))
        .expect("bootstrap");

    let sends = force_election(&mut h.replica);
    assert!(sends.is_empty(), "no peers to solicit");
    assert_eq!(h.replica.role(), Role::Leader);

    let leader = h.leader_cell.lock().unwrap().clone().expect("leader set");
    assert_eq!(leader.1, NodeId::from("node0"));
}

#[test]
fn test_unbootstrapped_node_does_not_campaign() {
    let mut h = harness("node0");
    let sends = force_election(&mut h.replica);
    assert!(sends.is_empty());
    assert_eq!(h.replica.role(), Role::Follower);
}

#[test]
fn test_apply_on_single_node_commits_immediately() {
    let mut h = harness("node0");
    h.replica
        .bootstrap(Configuration::single(
            "node0".into(),
            "node0.test:2380".into(),
        ))
        .expect("bootstrap");
    force_election(&mut h.replica);

    let (completer, slot) = capture_apply();
    h.replica
        .submit_apply(b"cmd-1".to_vec(), completer)
        .expect("submit");

    assert!(matches!(slot.lock().unwrap().take(), Some(Ok(()))));
    assert_eq!(*h.applied.lock().unwrap(), vec![b"cmd-1".to_vec()]);
}

#[test]
fn test_apply_on_follower_resolves_not_leader() {
    let mut h = harness("node0");
    let (completer, slot) = capture_apply();
    h.replica
        .submit_apply(b"cmd".to_vec(), completer)
        .expect("submit");
    assert!(matches!(
        slot.lock().unwrap().take(),
        Some(Err(RaftError::NotLeader))
    ));
}

#[test]
fn test_fsm_error_surfaces_to_submitter() {
    let mut h = harness("node0");
    h.replica
        .bootstrap(Configuration::single(
            "node0".into(),
            "node0.test:2380".into(),
        ))
        .expect("bootstrap");
    force_election(&mut h.replica);

    let (completer, slot) = capture_apply();
    h.replica
        .submit_apply(b"poison".to_vec(), completer)
        .expect("submit");
    assert!(matches!(
        slot.lock().unwrap().take(),
        Some(Err(RaftError::Apply(_)))
    ));
}

#[test]
fn test_three_node_commit_requires_quorum() {
    let mut h = harness("node0");
    elect_three_node_leader(&mut h);
    let term = h.replica.current_term();

    let (completer, slot) = capture_apply();
    let sends = h
        .replica
        .submit_apply(b"cmd-q".to_vec(), completer)
        .expect("submit");
    assert!(slot.lock().unwrap().is_none(), "not committed yet");

    // One follower acknowledging is a quorum of two (with the leader).
    let append_to_node1 = sends
        .iter()
        .find(|s| s.id == NodeId::from("node1"))
        .expect("append for node1");
    let last_sent = match append_to_node1.ctx {
        PeerCtx::Append { last_sent, .. } => last_sent,
        _ => panic!("expected append ctx"),
    };
    h.replica
        .handle_peer_result(
            &"node1".into(),
            PeerCtx::Append { term, last_sent },
            Ok(RpcResponse::AppendEntries(AppendEntriesResponse {
                term,
                success: true,
                last_index: last_sent,
            })),
        )
        .expect("peer result");

    assert!(matches!(slot.lock().unwrap().take(), Some(Ok(()))));
    assert_eq!(*h.applied.lock().unwrap(), vec![b"cmd-q".to_vec()]);
}

#[test]
fn test_stale_term_vote_rejected() {
    let mut h = harness("node0");
    h.replica
        .bootstrap(three_node_config())
        .expect("bootstrap");
    force_election(&mut h.replica);
    let term = h.replica.current_term();

    let (response, _) = h
        .replica
        .handle_rpc(RpcRequest::RequestVote(RequestVoteRequest {
            term: term - 1,
            candidate: "node1".into(),
            last_log_index: 100,
            last_log_term: term,
        }))
        .expect("rpc");
    match response {
        RpcResponse::RequestVote(resp) => {
            assert!(!resp.granted);
            assert_eq!(resp.term, term);
        }
        other => panic!("unexpected response {other:?}"),
    }
}

#[test]
fn test_vote_granted_once_per_term() {
    let mut h = harness("node0");
    h.replica
        .bootstrap(three_node_config())
        .expect("bootstrap");

    let vote = |replica: &mut Replica, candidate: &str| -> bool {
        let (response, _) = replica
            .handle_rpc(RpcRequest::RequestVote(RequestVoteRequest {
                term: 5,
                candidate: candidate.into(),
                last_log_index: 10,
                last_log_term: 4,
            }))
            .expect("rpc");
        match response {
            RpcResponse::RequestVote(resp) => resp.granted,
            other => panic!("unexpected response {other:?}"),
        }
    };

    assert!(vote(&mut h.replica, "node1"));
    // Same candidate, same term: re-granted (idempotent).
    assert!(vote(&mut h.replica, "node1"));
    // Different candidate, same term: refused.
    assert!(!vote(&mut h.replica, "node2"));
}

#[test]
fn test_vote_rejected_for_non_member() {
    let mut h = harness("node0");
    h.replica
        .bootstrap(three_node_config())
        .expect("bootstrap");

    let (response, _) = h
        .replica
        .handle_rpc(RpcRequest::RequestVote(RequestVoteRequest {
            term: 5,
            candidate: "node9".into(),
            last_log_index: 100,
            last_log_term: 4,
        }))
        .expect("rpc");
    match response {
        RpcResponse::RequestVote(resp) => assert!(!resp.granted),
        other => panic!("unexpected response {other:?}"),
    }
}

fn append_from_leader(
    replica: &mut Replica,
    term: u64,
    prev_log_index: u64,
    prev_log_term: u64,
    entries: Vec<LogEntry>,
    leader_commit: u64,
) -> AppendEntriesResponse {
    let (response, _) = replica
        .handle_rpc(RpcRequest::AppendEntries(AppendEntriesRequest {
            term,
            leader: "leader".into(),
            leader_address: "leader.test:2380".into(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        }))
        .expect("rpc");
    match response {
        RpcResponse::AppendEntries(resp) => resp,
        other => panic!("unexpected response {other:?}"),
    }
}

fn command_entry(index: u64, term: u64, data: &[u8]) -> LogEntry {
    LogEntry {
        index,
        term,
        kind: EntryKind::Command,
        data: data.to_vec(),
    }
}

#[test]
fn test_follower_applies_in_log_order() {
    let mut h = harness("node0");
    let resp = append_from_leader(
        &mut h.replica,
        1,
        0,
        0,
        vec![
            command_entry(1, 1, b"a"),
            command_entry(2, 1, b"b"),
            command_entry(3, 1, b"c"),
        ],
        2,
    );
    assert!(resp.success);
    assert_eq!(resp.last_index, 3);
    // Only entries up to the leader's commit index are applied.
    assert_eq!(*h.applied.lock().unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);

    let resp = append_from_leader(&mut h.replica, 1, 3, 1, vec![], 3);
    assert!(resp.success);
    assert_eq!(
        *h.applied.lock().unwrap(),
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
    );
}

#[test]
fn test_follower_rejects_gap() {
    let mut h = harness("node0");
    let resp = append_from_leader(&mut h.replica, 1, 5, 1, vec![command_entry(6, 1, b"x")], 0);
    assert!(!resp.success);
    assert_eq!(resp.last_index, 0);
}

#[test]
fn test_conflicting_suffix_is_replaced() {
    let mut h = harness("node0");
    append_from_leader(
        &mut h.replica,
        1,
        0,
        0,
        vec![command_entry(1, 1, b"a"), command_entry(2, 1, b"old")],
        1,
    );

    // A new leader in term 2 rewrites index 2.
    let resp = append_from_leader(
        &mut h.replica,
        2,
        1,
        1,
        vec![command_entry(2, 2, b"new"), command_entry(3, 2, b"tail")],
        3,
    );
    assert!(resp.success);
    assert_eq!(
        *h.applied.lock().unwrap(),
        vec![b"a".to_vec(), b"new".to_vec(), b"tail".to_vec()]
    );
}

#[test]
fn test_apply_determinism_across_replicas() {
    let sequence = vec![
        command_entry(1, 1, b"set a"),
        command_entry(2, 1, b"set b"),
        command_entry(3, 1, b"del a"),
        command_entry(4, 1, b"set c"),
    ];

    let mut first = harness("node0");
    let mut second = harness("node1");
    for h in [&mut first, &mut second] {
        let resp = append_from_leader(&mut h.replica, 1, 0, 0, sequence.clone(), 4);
        assert!(resp.success);
    }
    assert_eq!(*first.applied.lock().unwrap(), *second.applied.lock().unwrap());
}

#[test]
fn test_heartbeat_resets_election_timer() {
    let mut h = harness("node0");
    h.replica
        .bootstrap(three_node_config())
        .expect("bootstrap");

    // A heartbeat from a live leader keeps the follower from campaigning
    // at its old deadline.
    append_from_leader(&mut h.replica, 1, 0, 0, vec![], 0);
    let sends = h
        .replica
        .tick(Instant::now() + Duration::from_millis(50))
        .expect("tick");
    assert!(sends.is_empty());
    assert_eq!(h.replica.role(), Role::Follower);

    let leader = h.leader_cell.lock().unwrap().clone().expect("leader known");
    assert_eq!(leader.1, NodeId::from("leader"));
}

#[test]
fn test_higher_term_response_steps_leader_down() {
    let mut h = harness("node0");
    elect_three_node_leader(&mut h);
    let term = h.replica.current_term();

    h.replica
        .handle_peer_result(
            &"node2".into(),
            PeerCtx::Append {
                term,
                last_sent: 1,
            },
            Ok(RpcResponse::AppendEntries(AppendEntriesResponse {
                term: term + 3,
                success: false,
                last_index: 9,
            })),
        )
        .expect("peer result");

    assert_eq!(h.replica.role(), Role::Follower);
    assert_eq!(h.replica.current_term(), term + 3);
    assert!(h.leader_cell.lock().unwrap().is_none());
}

#[test]
fn test_config_change_roundtrip() {
    let mut h = harness("node0");
    h.replica
        .bootstrap(Configuration::single(
            "node0".into(),
            "node0.test:2380".into(),
        ))
        .expect("bootstrap");
    force_election(&mut h.replica);

    let slot = Arc::new(Mutex::new(None));
    let captured = Arc::clone(&slot);
    let completer = Completer::new(move |result| {
        *captured.lock().expect("capture lock poisoned") = Some(result);
    });
    h.replica
        .submit_config_change(
            super::ConfigChange::AddVoter {
                id: "node1".into(),
                address: "node1.test:2380".into(),
                prev_index: 0,
            },
            completer,
        )
        .expect("config change");

    // Commit still advances on the single live voter plus the new one
    // lagging: quorum of two needs node1. Feed its acknowledgment.
    let term = h.replica.current_term();
    let last = 3; // bootstrap config + noop + add-voter entry
    h.replica
        .handle_peer_result(
            &"node1".into(),
            PeerCtx::Append {
                term,
                last_sent: last,
            },
            Ok(RpcResponse::AppendEntries(AppendEntriesResponse {
                term,
                success: true,
                last_index: last,
            })),
        )
        .expect("peer result");

    assert!(matches!(slot.lock().unwrap().take(), Some(Ok(index)) if index == last));
    let config = h.replica.configuration();
    assert!(config.contains(&"node1".into()));
    assert_eq!(config.servers.len(), 2);
}
