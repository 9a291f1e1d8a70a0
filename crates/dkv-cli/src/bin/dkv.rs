//! The dkv server daemon.
//!
//! Opens (and on the seed node, bootstraps) the replicated store, spawns
//! the membership reconciler, and serves the public RPC surface until
//! SIGINT/SIGTERM.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dkv_kv::DiskStore;
use dkv_server::{
    ClusterState, RequestHandler, RpcServerConfig, Server, ServerConfig, setup_client_tls,
    setup_server_tls,
};
use dkv_store::{Store, reconcile};

/// Distributed key-value store node.
#[derive(Debug, Parser)]
#[command(name = "dkv", version, about = "Distributed Key-Value Store")]
struct Args {
    /// Unique name for this node.
    #[arg(long, env = "DKV_NAME")]
    name: String,

    /// Address to listen on for peer traffic.
    #[arg(long, env = "DKV_LISTEN_PEER_ADDRESS", default_value = "0.0.0.0:2380")]
    listen_peer_address: String,

    /// Address to listen on for client traffic.
    #[arg(long, env = "DKV_LISTEN_CLIENT_ADDRESS", default_value = "0.0.0.0:3000")]
    listen_client_address: String,

    /// Initial cluster configuration for bootstrapping, as a
    /// comma-separated list of id=raft_addr pairs. The first entry is the
    /// bootstrap seed.
    #[arg(long, env = "DKV_INITIAL_CLUSTER", value_delimiter = ',', required = true)]
    initial_cluster: Vec<String>,

    /// Initial cluster state (new, existing).
    #[arg(long, env = "DKV_INITIAL_CLUSTER_STATE")]
    initial_cluster_state: ClusterState,

    /// Nodes to advertise to admin clients, as id=rpc_addr pairs.
    #[arg(long, env = "DKV_ADVERTISE_NODES", value_delimiter = ',')]
    advertise_nodes: Vec<String>,

    /// Path to the data directory.
    #[arg(long, env = "DKV_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Path to the peer server TLS certificate file.
    #[arg(long, env = "DKV_PEER_CERT_FILE", default_value = "")]
    peer_cert_file: String,

    /// Path to the peer server TLS key file.
    #[arg(long, env = "DKV_PEER_KEY_FILE", default_value = "")]
    peer_key_file: String,

    /// Path to the peer trusted CA certificate file.
    #[arg(long, env = "DKV_PEER_TRUSTED_CA_FILE", default_value = "")]
    peer_trusted_ca_file: String,

    /// Path to the client server TLS certificate file.
    #[arg(long, env = "DKV_CERT_FILE", default_value = "")]
    cert_file: String,

    /// Path to the client server TLS key file.
    #[arg(long, env = "DKV_KEY_FILE", default_value = "")]
    key_file: String,

    /// Path to the client trusted CA certificate file.
    #[arg(long, env = "DKV_TRUSTED_CA_FILE", default_value = "")]
    trusted_ca_file: String,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        Ok(ServerConfig {
            initial_cluster: ServerConfig::parse_cluster(&self.initial_cluster)?,
            advertise_nodes: ServerConfig::parse_advertise_nodes(&self.advertise_nodes)?,
            name: self.name,
            listen_peer_address: self.listen_peer_address,
            listen_client_address: self.listen_client_address,
            initial_cluster_state: self.initial_cluster_state,
            data_dir: self.data_dir,
            peer_cert_file: self.peer_cert_file,
            peer_key_file: self.peer_key_file,
            peer_trusted_ca_file: self.peer_trusted_ca_file,
            cert_file: self.cert_file,
            key_file: self.key_file,
            trusted_ca_file: self.trusted_ca_file,
        })
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Args::parse().into_config()?;
    let advertise = config.advertised_peer()?.clone();

    // Local durable state under {data-dir}/kv; the replicated log and
    // snapshots live next to it.
    let storer = Arc::new(
        DiskStore::open(config.data_dir.join("kv")).context("open local kv store")?,
    );

    let mut store = Store::new(
        config.data_dir.clone(),
        config.listen_peer_address.clone(),
        config.name.as_str(),
        advertise,
        storer,
    );
    if config.peer_tls_enabled() {
        store = store.with_server_tls(setup_server_tls(
            &config.peer_cert_file,
            &config.peer_key_file,
            &config.peer_trusted_ca_file,
        )?);
    }
    if !config.peer_trusted_ca_file.is_empty() {
        store = store.with_client_tls(setup_client_tls(
            &config.peer_cert_file,
            &config.peer_key_file,
            &config.peer_trusted_ca_file,
        )?);
    }

    store.open(config.should_bootstrap()).context("open store")?;
    let store = Arc::new(store);
    info!(name = %config.name, "store opened");

    // Converge membership toward the configured peer set.
    let reconciler = reconcile::spawn(
        Arc::clone(&store),
        config.peer_map(),
        reconcile::RECONCILE_INTERVAL,
    );

    // Shut down cleanly on SIGINT/SIGTERM.
    #[cfg(unix)]
    {
        let shutdown = store.shutdown_ch();
        let mut signals =
            signal_hook::iterator::Signals::new([signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM])
                .context("install signal handler")?;
        std::thread::Builder::new()
            .name("dkv-signals".into())
            .spawn(move || {
                if signals.forever().next().is_some() {
                    warn!("signal received, shutting down");
                    shutdown.trigger();
                }
            })
            .context("spawn signal thread")?;
    }

    let mut rpc_config = RpcServerConfig::new(config.listen_client_address.clone());
    if config.client_tls_enabled() {
        rpc_config = rpc_config.with_tls(setup_server_tls(
            &config.cert_file,
            &config.key_file,
            &config.trusted_ca_file,
        )?);
    }
    let handler = Arc::new(RequestHandler::new(
        Arc::clone(&store),
        config.advertise_nodes.clone(),
    ));
    let server = Server::new(rpc_config, handler, store.shutdown_ch());

    let result = server.run();
    if let Err(e) = &result {
        error!(error = %e, "server failed");
    }

    if let Err(e) = store.shutdown() {
        error!(error = %e, "failed to shutdown store");
    }
    warn!("store shutdown");
    let _ = reconciler.join();

    // Give peer connections a beat to drain before the process exits.
    std::thread::sleep(Duration::from_millis(50));
    result.map_err(Into::into)
}
