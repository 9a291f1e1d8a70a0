//! Core identifier and log types shared across the engine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{RaftError, RaftResult};

/// A Raft term.
pub type Term = u64;

/// An index into the replicated log. Valid entries start at 1.
pub type LogIndex = u64;

/// The unique name of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Creates an id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The address peers use to reach a cluster member.
///
/// This is the *advertised* address carried in configuration entries, which
/// may differ from the address the member binds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerAddress(String);

impl ServerAddress {
    /// Creates an address from anything string-like.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// Returns the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerAddress {
    fn from(addr: &str) -> Self {
        Self(addr.to_owned())
    }
}

impl From<String> for ServerAddress {
    fn from(addr: String) -> Self {
        Self(addr)
    }
}

/// What a log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// A state-machine command; the payload is opaque to the engine.
    Command,

    /// A membership change; the payload is an encoded [`Configuration`].
    Configuration,

    /// An empty entry a new leader appends to commit entries from earlier
    /// terms.
    Noop,
}

/// One entry of the replicated log.
///
/// An entry at a given `(term, index)` is byte-identical on every replica
/// that holds it durably.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log, starting at 1.
    pub index: LogIndex,
    /// Term in which the entry was created.
    pub term: Term,
    /// What the payload is.
    pub kind: EntryKind,
    /// The payload.
    pub data: Vec<u8>,
}

/// One voting member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// The member's id.
    pub id: NodeId,
    /// The member's advertised peer address.
    pub address: ServerAddress,
}

/// The cluster membership, maintained inside the log.
///
/// Changes are themselves log entries; committing one makes it effective
/// atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// The voting members, in join order.
    pub servers: Vec<Server>,
}

impl Configuration {
    /// A configuration with a single member; used to bootstrap.
    pub fn single(id: NodeId, address: ServerAddress) -> Self {
        Self {
            servers: vec![Server { id, address }],
        }
    }

    /// Returns the member with `id`, if present.
    pub fn server(&self, id: &NodeId) -> Option<&Server> {
        self.servers.iter().find(|s| &s.id == id)
    }

    /// Returns true if `id` is a voting member.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.server(id).is_some()
    }

    /// The number of votes needed to win an election or commit an entry.
    pub fn quorum(&self) -> usize {
        self.servers.len() / 2 + 1
    }

    /// Encodes the configuration for storage in a log entry.
    pub fn encode(&self) -> RaftResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(RaftError::from)
    }

    /// Decodes a configuration from a log entry payload.
    pub fn decode(data: &[u8]) -> RaftResult<Self> {
        postcard::from_bytes(data).map_err(RaftError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_sizes() {
        let mut config = Configuration::single("node0".into(), "127.0.0.1:2380".into());
        assert_eq!(config.quorum(), 1);

        config.servers.push(Server {
            id: "node1".into(),
            address: "127.0.0.1:2381".into(),
        });
        assert_eq!(config.quorum(), 2);

        config.servers.push(Server {
            id: "node2".into(),
            address: "127.0.0.1:2382".into(),
        });
        assert_eq!(config.quorum(), 2);
    }

    #[test]
    fn test_configuration_roundtrip() {
        let config = Configuration {
            servers: vec![
                Server {
                    id: "node0".into(),
                    address: "node0.example:2380".into(),
                },
                Server {
                    id: "node1".into(),
                    address: "node1.example:2380".into(),
                },
            ],
        };
        let decoded = Configuration::decode(&config.encode().unwrap()).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_contains_and_lookup() {
        let config = Configuration::single("node0".into(), "127.0.0.1:2380".into());
        assert!(config.contains(&"node0".into()));
        assert!(!config.contains(&"node1".into()));
        assert_eq!(
            config.server(&"node0".into()).unwrap().address.as_str(),
            "127.0.0.1:2380"
        );
    }
}
