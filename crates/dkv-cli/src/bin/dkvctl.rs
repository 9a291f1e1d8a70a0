//! The dkvctl admin client.
//!
//! Talks to any node's public RPC endpoint. KV commands go straight to the
//! given endpoint (the cluster forwards writes internally); membership
//! commands discover the leader first and are issued against it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rustls::ClientConfig;
use tracing_subscriber::EnvFilter;

use dkv_client::{Client, discover_leader};
use dkv_server::setup_client_tls;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Administration client for a dkv cluster.
#[derive(Debug, Parser)]
#[command(name = "dkvctl", version, about = "dkv cluster control")]
struct Args {
    /// Endpoint of any cluster node.
    #[arg(long, env = "DKV_ENDPOINT", default_value = "127.0.0.1:3000")]
    endpoint: String,

    /// Path to the client TLS certificate file.
    #[arg(long, env = "DKV_CERT_FILE", default_value = "")]
    cert_file: String,

    /// Path to the client TLS key file.
    #[arg(long, env = "DKV_KEY_FILE", default_value = "")]
    key_file: String,

    /// Path to the trusted CA certificate file.
    #[arg(long, env = "DKV_TRUSTED_CA_FILE", default_value = "")]
    trusted_ca_file: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the value bound to a key.
    Get {
        /// The key to read.
        key: String,
    },
    /// Bind a key to a value.
    Set {
        /// The key to bind.
        key: String,
        /// The value to bind it to.
        value: String,
    },
    /// Remove the binding for a key.
    Delete {
        /// The key to unbind.
        key: String,
    },
    /// Add a voting member to the cluster.
    MemberJoin {
        /// The joining node's id.
        id: String,
        /// The joining node's peer (raft) address.
        address: String,
    },
    /// Remove a voting member from the cluster.
    MemberLeave {
        /// The leaving node's id.
        id: String,
    },
    /// List the cluster's voting members.
    MemberList,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();
    let args = Args::parse();

    let tls = if args.trusted_ca_file.is_empty() {
        None
    } else {
        Some(setup_client_tls(
            &args.cert_file,
            &args.key_file,
            &args.trusted_ca_file,
        )?)
    };

    match args.command {
        Command::Get { key } => {
            let value = connect(&args.endpoint, tls)?.get(&key)?;
            println!("{value}");
        }
        Command::Set { key, value } => {
            connect(&args.endpoint, tls)?.set(&key, &value)?;
        }
        Command::Delete { key } => {
            connect(&args.endpoint, tls)?.delete(&key)?;
        }
        Command::MemberJoin { id, address } => {
            connect_leader(&args.endpoint, tls)?.join_server(&id, &address)?;
        }
        Command::MemberLeave { id } => {
            connect_leader(&args.endpoint, tls)?.leave_server(&id)?;
        }
        Command::MemberList => {
            let servers = connect(&args.endpoint, tls)?.get_servers()?;
            for server in servers {
                let role = if server.is_leader { "leader" } else { "follower" };
                println!(
                    "{}\t{}\t{}\t{}",
                    server.id, server.raft_address, server.rpc_address, role
                );
            }
        }
    }
    Ok(())
}

fn connect(endpoint: &str, tls: Option<Arc<ClientConfig>>) -> anyhow::Result<Client> {
    let client = match tls {
        Some(config) => Client::connect_tls(endpoint, config, CONNECT_TIMEOUT),
        None => Client::connect(endpoint, CONNECT_TIMEOUT),
    };
    client.with_context(|| format!("connect to {endpoint}"))
}

/// Membership changes must land on the leader; find it first, falling back
/// to the given endpoint when discovery cannot name one.
fn connect_leader(endpoint: &str, tls: Option<Arc<ClientConfig>>) -> anyhow::Result<Client> {
    match discover_leader(endpoint, tls.clone(), CONNECT_TIMEOUT) {
        Ok(leader) => connect(&leader, tls),
        Err(e) => {
            tracing::warn!(error = %e, "leader discovery failed, using endpoint directly");
            connect(endpoint, tls)
        }
    }
}
