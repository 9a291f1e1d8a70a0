//! Server configuration.
//!
//! Everything the `dkv` binary collects from flags and environment:
//! identity, listen addresses, the initial cluster layout, the advertised
//! RPC addresses, and TLS material paths. Parse failures here are fatal at
//! startup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use dkv_raft::{NodeId, ServerAddress};

use crate::error::{ServerError, ServerResult};

/// Whether this node starts a brand new cluster or joins an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    /// Bootstrap a new cluster (the seed node writes the genesis
    /// configuration).
    New,
    /// The cluster already exists; never bootstrap.
    Existing,
}

impl FromStr for ClusterState {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "existing" => Ok(Self::Existing),
            other => Err(ServerError::Config(format!(
                "invalid initial-cluster-state {other:?}, expected \"new\" or \"existing\""
            ))),
        }
    }
}

/// Full configuration of one `dkv` node.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Unique name of this node.
    pub name: String,
    /// Bind address for peer (raft) traffic.
    pub listen_peer_address: String,
    /// Bind address for client (public RPC) traffic.
    pub listen_client_address: String,
    /// `id=raft_addr` pairs in operator order; the first entry is the
    /// bootstrap seed.
    pub initial_cluster: Vec<(NodeId, ServerAddress)>,
    /// Bootstrap gating.
    pub initial_cluster_state: ClusterState,
    /// `id -> rpc_addr` advertised to admin clients; known only to the
    /// membership handler.
    pub advertise_nodes: HashMap<NodeId, String>,
    /// Durable state directory.
    pub data_dir: PathBuf,

    /// Peer transport TLS material (empty = disabled).
    pub peer_cert_file: String,
    pub peer_key_file: String,
    pub peer_trusted_ca_file: String,

    /// Public RPC TLS material (empty = disabled).
    pub cert_file: String,
    pub key_file: String,
    pub trusted_ca_file: String,
}

impl ServerConfig {
    /// Parses a list of `id=addr` pairs, preserving order.
    pub fn parse_cluster(items: &[String]) -> ServerResult<Vec<(NodeId, ServerAddress)>> {
        if items.is_empty() {
            return Err(ServerError::Config(
                "invalid initial cluster configuration (no nodes)".into(),
            ));
        }
        let mut cluster = Vec::with_capacity(items.len());
        for item in items {
            let (id, addr) = item.split_once('=').ok_or_else(|| {
                ServerError::Config(format!("invalid initial cluster entry {item:?}"))
            })?;
            if id.is_empty() || addr.is_empty() {
                return Err(ServerError::Config(format!(
                    "invalid initial cluster entry {item:?}"
                )));
            }
            cluster.push((NodeId::from(id), ServerAddress::from(addr)));
        }
        Ok(cluster)
    }

    /// Parses `id=rpc_addr` advertise pairs; malformed entries are
    /// rejected.
    pub fn parse_advertise_nodes(items: &[String]) -> ServerResult<HashMap<NodeId, String>> {
        let mut nodes = HashMap::with_capacity(items.len());
        for item in items {
            let (id, addr) = item.split_once('=').ok_or_else(|| {
                ServerError::Config(format!("invalid advertise-nodes entry {item:?}"))
            })?;
            nodes.insert(NodeId::from(id), addr.to_owned());
        }
        Ok(nodes)
    }

    /// The node whose id leads the initial-cluster list.
    pub fn bootstrap_seed(&self) -> &NodeId {
        &self.initial_cluster[0].0
    }

    /// The peer address this node advertises, from the initial-cluster
    /// entry matching its name.
    pub fn advertised_peer(&self) -> ServerResult<&ServerAddress> {
        self.initial_cluster
            .iter()
            .find(|(id, _)| id.as_str() == self.name)
            .map(|(_, addr)| addr)
            .ok_or_else(|| {
                ServerError::Config(format!(
                    "node {:?} does not appear in the initial cluster",
                    self.name
                ))
            })
    }

    /// True when this node should write the genesis configuration.
    pub fn should_bootstrap(&self) -> bool {
        self.initial_cluster_state == ClusterState::New
            && self.bootstrap_seed().as_str() == self.name
    }

    /// The configured peer set as a map, for the reconciler.
    pub fn peer_map(&self) -> HashMap<NodeId, ServerAddress> {
        self.initial_cluster.iter().cloned().collect()
    }

    /// True when peer TLS should be enabled.
    pub fn peer_tls_enabled(&self) -> bool {
        !self.peer_cert_file.is_empty() && !self.peer_key_file.is_empty()
    }

    /// True when public RPC TLS should be enabled.
    pub fn client_tls_enabled(&self) -> bool {
        !self.cert_file.is_empty() && !self.key_file.is_empty()
    }
}
