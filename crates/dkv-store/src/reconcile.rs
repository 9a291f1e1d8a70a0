//! Membership reconciliation.
//!
//! Every node runs a reconciler; it no-ops unless the node currently
//! believes it is the leader. When leader, it compares the operator's
//! configured peer set against the committed configuration and joins every
//! configured peer that is missing, converging membership regardless of
//! the order peers started in. It exits when the store's shutdown signal
//! fires.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dkv_raft::{NodeId, ServerAddress};
use tracing::{info, warn};

use crate::Store;

/// Default reconciliation cadence.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Spawns the reconciliation task for `store` against the configured
/// `peers` (id → advertised peer address, including this node).
pub fn spawn(
    store: Arc<Store>,
    peers: HashMap<NodeId, ServerAddress>,
    interval: Duration,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("dkv-reconcile".into())
        .spawn(move || run(&store, &peers, interval))
        .expect("failed to spawn reconciler")
}

fn run(store: &Store, peers: &HashMap<NodeId, ServerAddress>, interval: Duration) {
    let shutdown = store.shutdown_ch();
    loop {
        if shutdown.wait_timeout(interval) {
            info!("stopped joining peers due to store shutdown");
            return;
        }
        reconcile_once(store, peers);
    }
}

/// One pass: leader-only, joins configured-but-missing voters.
fn reconcile_once(store: &Store, peers: &HashMap<NodeId, ServerAddress>) {
    let Some((_, leader_id)) = store.get_leader() else {
        warn!("no leader");
        return;
    };
    if &leader_id != store.raft_id() {
        return;
    }
    let members = match store.get_servers() {
        Ok(members) => members,
        Err(e) => {
            warn!(error = %e, "failed to get servers");
            return;
        }
    };
    for (id, addr) in peers {
        if id == store.raft_id() {
            continue;
        }
        if members.iter().any(|member| &member.id == id) {
            continue;
        }
        info!(id = %id, addr = %addr, "request peer to join");
        if let Err(e) = store.join(id.clone(), addr.clone()) {
            warn!(id = %id, addr = %addr, error = %e, "failed to join peer");
        }
    }
}
