//! Client for the dkv public RPC surface.
//!
//! A blocking, one-request-at-a-time client speaking the length-prefixed
//! frame protocol, optionally over TLS. Membership writes go through
//! [`Client::join_server`] / [`Client::leave_server`] which, like every
//! other call, target a single endpoint; use [`discover_leader`] first to
//! pick the right one.

mod client;
mod error;

pub use client::{Client, discover_leader};
pub use error::{ClientError, ClientResult};
