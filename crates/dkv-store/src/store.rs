//! The consensus-backed store facade.
//!
//! Owns the FSM, the engine, the peer stream layer, and the shutdown
//! signal. Writes are serialized through the replicated log (forwarded to
//! the leader when submitted elsewhere); reads come from local applied
//! state and are deliberately stale-tolerant.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dkv_kv::{KvError, Storer};
use dkv_raft::{
    Configuration, FileLogStore, FileSnapshotStore, FileStableStore, NodeId, Raft, RaftConfig,
    RaftError, Server, ServerAddress, TcpStreamLayer, has_existing_state,
};
use dkv_wire::Command;
use rustls::{ClientConfig, ServerConfig};
use tracing::{info, warn};

use crate::fsm::KvFsm;
use crate::shutdown::Shutdown;
use crate::{StoreError, StoreResult};

/// Snapshots retained on disk.
pub const RETAIN_SNAPSHOT_COUNT: usize = 2;

/// Deadline for a write to commit, local or forwarded.
pub const APPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll cadence of [`Store::wait_for_leader`].
const LEADER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A replicated key-value store node.
///
/// Construct with [`Store::new`], optionally attach TLS configs, then
/// [`open`](Store::open) it. The facade exclusively owns the engine and
/// stream layer; call [`shutdown`](Store::shutdown) before dropping so the
/// peer listener and file handles are released deterministically.
pub struct Store {
    /// Directory holding the log store, stable store, and snapshots.
    data_dir: PathBuf,
    /// Bind address for peer traffic.
    raft_bind: String,
    /// This node's id.
    raft_id: NodeId,
    /// The peer address advertised in configuration entries.
    advertise: ServerAddress,

    storer: Arc<dyn Storer>,
    server_tls: Option<Arc<ServerConfig>>,
    client_tls: Option<Arc<ClientConfig>>,

    raft: Option<Raft>,
    shutdown: Shutdown,
}

impl Store {
    /// Creates an unopened store node.
    pub fn new(
        data_dir: impl Into<PathBuf>,
        raft_bind: impl Into<String>,
        raft_id: impl Into<NodeId>,
        advertise: impl Into<ServerAddress>,
        storer: Arc<dyn Storer>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            raft_bind: raft_bind.into(),
            raft_id: raft_id.into(),
            advertise: advertise.into(),
            storer,
            server_tls: None,
            client_tls: None,
            raft: None,
            shutdown: Shutdown::new(),
        }
    }

    /// Wraps accepted peer connections in server-side TLS.
    #[must_use]
    pub fn with_server_tls(mut self, config: Arc<ServerConfig>) -> Self {
        self.server_tls = Some(config);
        self
    }

    /// Wraps dialed peer connections in client-side TLS.
    #[must_use]
    pub fn with_client_tls(mut self, config: Arc<ClientConfig>) -> Self {
        self.client_tls = Some(config);
        self
    }

    /// This node's id.
    pub fn raft_id(&self) -> &NodeId {
        &self.raft_id
    }

    /// The advertised peer address.
    pub fn raft_advertise(&self) -> &ServerAddress {
        &self.advertise
    }

    /// Opens the node: stores, peer listener, transport, engine. When
    /// `bootstrap` is true and the node has no durable state, writes the
    /// one-server genesis configuration naming this node.
    ///
    /// Calling `open` twice on the same instance is an error.
    pub fn open(&mut self, bootstrap: bool) -> StoreResult<()> {
        if self.raft.is_some() {
            return Err(StoreError::AlreadyOpen);
        }
        std::fs::create_dir_all(&self.data_dir)?;

        let log = FileLogStore::open(self.data_dir.join("logs.dat"))?;
        let stable = FileStableStore::open(self.data_dir.join("stable.dat"))?;
        let snapshots = FileSnapshotStore::new(&self.data_dir, RETAIN_SNAPSHOT_COUNT)?;
        let fresh = !has_existing_state(&log, &stable, &snapshots)?;

        let stream = Arc::new(TcpStreamLayer::bind(
            &self.raft_bind,
            Some(self.advertise.clone()),
            self.server_tls.clone(),
            self.client_tls.clone(),
        )?);

        let fsm = KvFsm::new(Arc::clone(&self.storer));
        let raft = Raft::new(
            self.raft_id.clone(),
            RaftConfig::default(),
            Box::new(fsm),
            Box::new(log),
            Box::new(stable),
            Box::new(snapshots),
            stream,
        )?;

        if bootstrap && fresh {
            info!(id = %self.raft_id, addr = %self.advertise, "bootstrapping new raft node");
            raft.bootstrap_cluster(Configuration::single(
                self.raft_id.clone(),
                self.advertise.clone(),
            ))?;
        }
        self.raft = Some(raft);
        Ok(())
    }

    fn raft(&self) -> StoreResult<&Raft> {
        self.raft.as_ref().ok_or(StoreError::NotOpen)
    }

    /// Reads the value bound to `key` from local applied state.
    ///
    /// Deliberately stale-tolerant: the local state machine may lag the
    /// leader by an unbounded amount during partitions.
    pub fn get(&self, key: &str) -> StoreResult<String> {
        self.storer.get(key).map_err(|e| match e {
            KvError::NotFound => StoreError::KeyNotFound,
            other => StoreError::Kv(other),
        })
    }

    /// Binds `key` to `value` through the replicated log.
    pub fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.write_command(&Command::Set {
            key: key.to_owned(),
            value: value.to_owned(),
        })
    }

    /// Removes the binding for `key` through the replicated log.
    pub fn delete(&self, key: &str) -> StoreResult<()> {
        self.write_command(&Command::Delete {
            key: key.to_owned(),
        })
    }

    /// Marshals a command, routes it to the leader, and awaits commit.
    fn write_command(&self, command: &Command) -> StoreResult<()> {
        let raft = self.raft()?;
        let payload = command.encode()?;
        let Some((leader_addr, leader_id)) = raft.leader_with_id() else {
            return Err(StoreError::NoLeader);
        };
        if leader_id == self.raft_id {
            raft.apply(payload, APPLY_TIMEOUT).wait()?;
        } else {
            warn!(leader = %leader_id, key = command.key(), "not the leader, forwarding write");
            raft.forward_apply(&leader_id, &leader_addr, payload, APPLY_TIMEOUT)?;
        }
        Ok(())
    }

    /// Adds `id` at `addr` as a voter. Idempotent: an identical member is
    /// left alone; a member matching on id *or* address (but not both) is
    /// replaced. Only valid on the leader.
    pub fn join(&self, id: impl Into<NodeId>, addr: impl Into<ServerAddress>) -> StoreResult<()> {
        let raft = self.raft()?;
        let id = id.into();
        let addr = addr.into();
        info!(id = %id, addr = %addr, "received join request for remote node");

        let configuration = raft.get_configuration()?;
        for server in &configuration.servers {
            if server.id == id && server.address == addr {
                info!(id = %id, "node already member of cluster, ignoring join request");
                return Ok(());
            }
            if server.id == id || server.address == addr {
                warn!(id = %server.id, addr = %server.address, "removing conflicting member");
                raft.remove_server(server.id.clone(), 0, APPLY_TIMEOUT).wait()?;
            }
        }

        raft.add_voter(id.clone(), addr, 0, APPLY_TIMEOUT).wait()?;
        info!(id = %id, "node joined successfully");
        Ok(())
    }

    /// Removes `id` from the cluster. Only valid on the leader.
    pub fn leave(&self, id: impl Into<NodeId>) -> StoreResult<()> {
        let id = id.into();
        info!(id = %id, "received leave request for remote node");
        self.raft()?.remove_server(id, 0, APPLY_TIMEOUT).wait()?;
        Ok(())
    }

    /// The currently believed leader, or `None`.
    pub fn get_leader(&self) -> Option<(ServerAddress, NodeId)> {
        self.raft.as_ref()?.leader_with_id()
    }

    /// The committed set of voting members.
    pub fn get_servers(&self) -> StoreResult<Vec<Server>> {
        Ok(self.raft()?.get_configuration()?.servers)
    }

    /// Polls for a leader every second until one is known, `timeout`
    /// expires, or shutdown fires. Returns the leader's id.
    pub fn wait_for_leader(&self, timeout: Duration) -> StoreResult<NodeId> {
        let raft = self.raft()?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((_, id)) = raft.leader_with_id() {
                return Ok(id);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StoreError::Raft(RaftError::Timeout));
            }
            if self
                .shutdown
                .wait_timeout(remaining.min(LEADER_POLL_INTERVAL))
            {
                return Err(StoreError::Raft(RaftError::Shutdown));
            }
        }
    }

    /// Signals shutdown, stops the engine (draining the transport), and
    /// clears local state. Idempotent and safe to call concurrently.
    pub fn shutdown(&self) -> StoreResult<()> {
        self.shutdown.trigger();
        if let Some(raft) = &self.raft {
            raft.shutdown()?;
        }
        self.storer.clear();
        Ok(())
    }

    /// A signal that fires when the node begins shutting down.
    pub fn shutdown_ch(&self) -> Shutdown {
        self.shutdown.clone()
    }
}
