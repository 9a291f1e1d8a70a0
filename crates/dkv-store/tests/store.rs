//! End-to-end store tests: real TCP on loopback, in-memory KV state,
//! durable raft state in temp directories.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dkv_kv::MemoryStore;
use dkv_raft::NodeId;
use dkv_store::{Store, reconcile};
use tempfile::TempDir;

fn random_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").to_string()
}

/// Polls `predicate` until it holds or `timeout` expires.
fn eventually(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn new_store(tmp: &TempDir, name: &str) -> Store {
    let addr = random_addr();
    Store::new(
        tmp.path(),
        addr.clone(),
        name,
        addr,
        Arc::new(MemoryStore::new()),
    )
}

#[test]
fn test_open_bootstrap_and_write() {
    let tmp = TempDir::new().unwrap();
    let mut store = new_store(&tmp, "node0");

    store.open(true).unwrap();
    assert!(matches!(
        store.open(true),
        Err(dkv_store::StoreError::AlreadyOpen)
    ));

    let leader = store.wait_for_leader(Duration::from_secs(5)).unwrap();
    assert_eq!(leader, NodeId::from("node0"));

    store.set("k", "v").unwrap();
    assert_eq!(store.get("k").unwrap(), "v");

    store.delete("k").unwrap();
    store.delete("k").unwrap();
    assert!(matches!(
        store.get("k"),
        Err(dkv_store::StoreError::KeyNotFound)
    ));

    store.shutdown().unwrap();
}

#[test]
fn test_restart_preserves_state() {
    let tmp = TempDir::new().unwrap();
    let addr = random_addr();

    {
        let mut store = Store::new(
            tmp.path(),
            addr.clone(),
            "node0",
            addr.clone(),
            Arc::new(MemoryStore::new()),
        );
        store.open(true).unwrap();
        store.wait_for_leader(Duration::from_secs(5)).unwrap();
        store.set("persist", "me").unwrap();
        store.shutdown().unwrap();
    }

    // Same data dir, fresh in-memory state: the log replays on restart.
    let mut store = Store::new(
        tmp.path(),
        addr.clone(),
        "node0",
        addr,
        Arc::new(MemoryStore::new()),
    );
    store.open(true).unwrap();
    store.wait_for_leader(Duration::from_secs(5)).unwrap();
    assert!(
        eventually(Duration::from_secs(5), || store.get("persist").is_ok()),
        "state not recovered after restart"
    );
    assert_eq!(store.get("persist").unwrap(), "me");
    store.shutdown().unwrap();
}

/// The consensus suite from the original store tests: bootstrap + joins,
/// replication to all nodes, write-via-follower forwarding, membership
/// churn, and leader failover, all against one three-node cluster.
#[test]
fn test_three_node_consensus() {
    let nodes = 3;
    let tmps: Vec<TempDir> = (0..nodes).map(|_| TempDir::new().unwrap()).collect();
    let mut stores: Vec<Arc<Store>> = Vec::with_capacity(nodes);

    // Join and bootstrap.
    for (i, tmp) in tmps.iter().enumerate() {
        let mut store = new_store(tmp, &format!("node{i}"));
        store.open(i == 0).unwrap();
        let store = Arc::new(store);
        if i == 0 {
            let id = store.wait_for_leader(Duration::from_secs(5)).unwrap();
            assert_eq!(id, NodeId::from("node0"));
        } else {
            stores[0]
                .join(format!("node{i}"), store.raft_advertise().clone())
                .unwrap();
        }
        stores.push(store);
    }

    // All three are voters; exactly the leader reports leadership.
    assert!(eventually(Duration::from_secs(5), || {
        stores[0].get_servers().map_or(0, |s| s.len()) == 3
    }));
    let (_, leader_id) = stores[0].get_leader().unwrap();
    assert_eq!(leader_id, NodeId::from("node0"));

    // At no sampled instant do two nodes claim leadership for themselves.
    for _ in 0..20 {
        let self_leaders = stores
            .iter()
            .filter(|s| {
                s.get_leader()
                    .is_some_and(|(_, id)| &id == s.raft_id())
            })
            .count();
        assert!(self_leaders <= 1, "two nodes claim leadership at once");
        std::thread::sleep(Duration::from_millis(25));
    }

    // Set on the leader, observable everywhere.
    stores[0].set("key1", "value1").unwrap();
    assert!(
        eventually(Duration::from_secs(2), || {
            stores
                .iter()
                .all(|s| s.get("key1").map_or(false, |v| v == "value1"))
        }),
        "write did not replicate to all nodes"
    );

    // Set via a follower: forwarded to the leader transparently.
    stores[1].set("key2", "value").unwrap();
    assert!(
        eventually(Duration::from_secs(10), || {
            stores
                .iter()
                .all(|s| s.get("key2").map_or(false, |v| v == "value"))
        }),
        "forwarded write did not replicate"
    );

    // Kick node1 out; it stops receiving writes.
    stores[0].leave("node1").unwrap();
    std::thread::sleep(Duration::from_millis(100));
    stores[0].set("key1", "value2").unwrap();
    assert!(
        eventually(Duration::from_secs(2), || {
            let survivors = stores[0].get("key1").map_or(false, |v| v == "value2")
                && stores[2].get("key1").map_or(false, |v| v == "value2");
            let stale = stores[1].get("key1").map_or(false, |v| v == "value1");
            survivors && stale
        }),
        "removed node should keep stale state while voters advance"
    );

    // Bring node1 back; it converges.
    stores[0]
        .join("node1", stores[1].raft_advertise().clone())
        .unwrap();
    assert!(
        eventually(Duration::from_secs(10), || {
            stores[1].get("key1").map_or(false, |v| v == "value2")
        }),
        "rejoined node did not converge"
    );

    // Leader failover: stop node0, a survivor takes over within 15s.
    stores[0].shutdown().unwrap();
    let mut next_leader = None;
    assert!(
        eventually(Duration::from_secs(15), || {
            match stores[1].get_leader() {
                Some((_, id)) if id != NodeId::from("node0") => {
                    next_leader = Some(id);
                    true
                }
                _ => false,
            }
        }),
        "no failover leader elected"
    );
    let leader = stores
        .iter()
        .find(|s| Some(s.raft_id()) == next_leader.as_ref())
        .expect("leader store");

    leader.set("key1", "value3").unwrap();
    assert!(
        eventually(Duration::from_secs(2), || {
            stores[1].get("key1").map_or(false, |v| v == "value3")
                && stores[2].get("key1").map_or(false, |v| v == "value3")
        }),
        "post-failover write did not replicate"
    );

    for store in &stores[1..] {
        store.shutdown().unwrap();
    }
}

#[test]
fn test_join_is_idempotent() {
    let tmps: Vec<TempDir> = (0..2).map(|_| TempDir::new().unwrap()).collect();

    let mut seed = new_store(&tmps[0], "node0");
    seed.open(true).unwrap();
    let seed = Arc::new(seed);
    seed.wait_for_leader(Duration::from_secs(5)).unwrap();

    let mut peer = new_store(&tmps[1], "node1");
    peer.open(false).unwrap();
    let peer = Arc::new(peer);
    let peer_addr = peer.raft_advertise().clone();

    seed.join("node1", peer_addr.clone()).unwrap();
    let before = seed.get_servers().unwrap();

    // Identical parameters: a no-op.
    seed.join("node1", peer_addr).unwrap();
    let after = seed.get_servers().unwrap();
    assert_eq!(before, after);
    assert_eq!(after.len(), 2);

    seed.shutdown().unwrap();
    peer.shutdown().unwrap();
}

#[test]
fn test_join_replaces_member_on_address_change() {
    let tmps: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();

    let mut seed = new_store(&tmps[0], "node0");
    seed.open(true).unwrap();
    let seed = Arc::new(seed);
    seed.wait_for_leader(Duration::from_secs(5)).unwrap();

    let mut peer = new_store(&tmps[1], "node1");
    peer.open(false).unwrap();
    let peer = Arc::new(peer);
    seed.join("node1", peer.raft_advertise().clone()).unwrap();

    // "node1" comes back on a different address (fresh disk, new port);
    // the old entry is replaced, not duplicated.
    peer.shutdown().unwrap();
    let mut moved = new_store(&tmps[2], "node1");
    moved.open(false).unwrap();
    let moved = Arc::new(moved);
    seed.join("node1", moved.raft_advertise().clone()).unwrap();

    let servers = seed.get_servers().unwrap();
    assert_eq!(servers.len(), 2);
    let node1 = servers
        .iter()
        .find(|s| s.id == NodeId::from("node1"))
        .unwrap();
    assert_eq!(&node1.address, moved.raft_advertise());

    seed.shutdown().unwrap();
    moved.shutdown().unwrap();
}

#[test]
fn test_writes_fail_without_quorum() {
    let tmp = TempDir::new().unwrap();
    let mut store = new_store(&tmp, "node0");
    // Never bootstrapped: no configuration, no leader.
    store.open(false).unwrap();
    let err = store.set("k", "v").unwrap_err();
    assert!(matches!(err, dkv_store::StoreError::NoLeader));
    store.shutdown().unwrap();
}

#[test]
fn test_reconciler_converges_membership() {
    let nodes = 3;
    let tmps: Vec<TempDir> = (0..nodes).map(|_| TempDir::new().unwrap()).collect();
    let mut stores: Vec<Arc<Store>> = Vec::with_capacity(nodes);

    for (i, tmp) in tmps.iter().enumerate() {
        let mut store = new_store(tmp, &format!("node{i}"));
        store.open(i == 0).unwrap();
        stores.push(Arc::new(store));
    }

    let peers: std::collections::HashMap<_, _> = stores
        .iter()
        .map(|s| (s.raft_id().clone(), s.raft_advertise().clone()))
        .collect();

    // Every node runs the reconciler; only the leader acts.
    let handles: Vec<_> = stores
        .iter()
        .map(|s| reconcile::spawn(Arc::clone(s), peers.clone(), Duration::from_millis(500)))
        .collect();

    assert!(
        eventually(Duration::from_secs(10), || {
            stores[0].get_servers().map_or(0, |s| s.len()) == 3
        }),
        "reconciler did not converge membership"
    );

    for store in &stores {
        store.shutdown().unwrap();
    }
    for handle in handles {
        let _ = handle.join();
    }
}
