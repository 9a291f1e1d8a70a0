//! # dkv-server: public RPC surface for dkv
//!
//! Serves the KV and membership services over the length-prefixed wire
//! protocol from `dkv-wire`, optionally behind TLS.
//!
//! ## Architecture
//!
//! A mio poll loop owns the connections; consensus-blocking operations run
//! on a small worker pool so a replicated write (up to its 10 s deadline)
//! never stalls the loop.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        dkv-server                        │
//! │  ┌──────────┐   ┌─────────────┐   ┌──────────────────┐   │
//! │  │ Listener │ → │ Connections │ → │ RequestHandler   │   │
//! │  │  (TCP)   │   │ (mio poll)  │   │ (→ Store facade) │   │
//! │  └──────────┘   └─────┬───────┘   └──────────────────┘   │
//! │                       └── workers ──┘ (Set/Delete/Join)  │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod config;
mod connection;
mod error;
mod handler;
mod pem;
mod server;
pub mod tls;

pub use config::{ClusterState, ServerConfig};
pub use error::{ServerError, ServerResult};
pub use handler::RequestHandler;
pub use server::{RpcServerConfig, Server};
pub use tls::{setup_client_tls, setup_server_tls};
