//! Request handler: routes public RPCs to the store facade.
//!
//! Two services share the surface: the KV service (`Get`/`Set`/`Delete`)
//! maps 1:1 onto facade methods, and the membership service
//! (`GetServers`/`JoinServer`/`LeaveServer`) joins the committed
//! configuration with the operator-supplied advertise map.

use std::collections::HashMap;
use std::sync::Arc;

use dkv_raft::{NodeId, RaftError};
use dkv_store::{Store, StoreError};
use dkv_wire::{
    ErrorCode, Request, RequestPayload, Response, ResponsePayload, ServerInfo,
};
use tracing::debug;

/// Routes requests to the store facade.
pub struct RequestHandler {
    store: Arc<Store>,
    /// Operator-supplied `id -> rpc address` map; nodes without an entry
    /// report an empty `rpc_address` and are filtered by admin clients.
    advertise_nodes: HashMap<NodeId, String>,
}

impl RequestHandler {
    /// Creates a handler over the facade with the advertise map.
    pub fn new(store: Arc<Store>, advertise_nodes: HashMap<NodeId, String>) -> Self {
        Self {
            store,
            advertise_nodes,
        }
    }

    /// True for operations that may block on consensus; the poll loop
    /// hands these to worker threads.
    pub fn is_blocking(request: &Request) -> bool {
        matches!(
            request.payload,
            RequestPayload::Set { .. }
                | RequestPayload::Delete { .. }
                | RequestPayload::JoinServer { .. }
                | RequestPayload::LeaveServer { .. }
        )
    }

    /// Handles one request; errors become error responses, never panics.
    pub fn handle(&self, request: Request) -> Response {
        let id = request.id;
        match self.handle_inner(request.payload) {
            Ok(payload) => Response::new(id, payload),
            Err(e) => {
                let (code, message) = error_to_wire(&e);
                debug!(code = ?code, message = %message, "request failed");
                Response::error(id, code, message)
            }
        }
    }

    fn handle_inner(&self, payload: RequestPayload) -> Result<ResponsePayload, StoreError> {
        match payload {
            RequestPayload::Get { key } => {
                require_key(&key)?;
                let value = self.store.get(&key)?;
                Ok(ResponsePayload::Value { value })
            }
            RequestPayload::Set { key, value } => {
                require_key(&key)?;
                self.store.set(&key, &value)?;
                Ok(ResponsePayload::Ok)
            }
            RequestPayload::Delete { key } => {
                require_key(&key)?;
                self.store.delete(&key)?;
                Ok(ResponsePayload::Ok)
            }
            RequestPayload::GetServers => {
                let servers = self.store.get_servers()?;
                let leader = self.store.get_leader();
                let infos = servers
                    .into_iter()
                    .map(|server| {
                        let is_leader = leader
                            .as_ref()
                            .is_some_and(|(addr, id)| id == &server.id && addr == &server.address);
                        ServerInfo {
                            rpc_address: self
                                .advertise_nodes
                                .get(&server.id)
                                .cloned()
                                .unwrap_or_default(),
                            id: server.id.as_str().to_owned(),
                            raft_address: server.address.as_str().to_owned(),
                            is_leader,
                        }
                    })
                    .collect();
                Ok(ResponsePayload::Servers { servers: infos })
            }
            RequestPayload::JoinServer { id, address } => {
                if id.is_empty() || address.is_empty() {
                    return Err(StoreError::InvalidArgument(
                        "join requires an id and an address".into(),
                    ));
                }
                self.store.join(id.as_str(), address.as_str())?;
                Ok(ResponsePayload::Ok)
            }
            RequestPayload::LeaveServer { id } => {
                if id.is_empty() {
                    return Err(StoreError::InvalidArgument("leave requires an id".into()));
                }
                self.store.leave(id.as_str())?;
                Ok(ResponsePayload::Ok)
            }
        }
    }
}

/// Rejects empty keys before they reach consensus.
fn require_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidArgument("key must not be empty".into()));
    }
    Ok(())
}

/// Classifies facade errors into the wire's status codes.
fn error_to_wire(error: &StoreError) -> (ErrorCode, String) {
    match error {
        StoreError::KeyNotFound => (ErrorCode::NotFound, error.to_string()),
        StoreError::InvalidArgument(msg) => (ErrorCode::InvalidArgument, msg.clone()),
        StoreError::NoLeader => (ErrorCode::Unavailable, error.to_string()),
        StoreError::Raft(raft) => match raft {
            RaftError::NotLeader => (ErrorCode::NotLeader, raft.to_string()),
            RaftError::LeadershipLost
            | RaftError::Timeout
            | RaftError::Shutdown
            | RaftError::Transport(_) => (ErrorCode::Unavailable, raft.to_string()),
            RaftError::InvalidConfiguration(msg) => (ErrorCode::InvalidArgument, msg.clone()),
            other => (ErrorCode::Internal, other.to_string()),
        },
        other => (ErrorCode::Internal, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dkv_kv::MemoryStore;
    use dkv_wire::RequestId;
    use std::net::TcpListener;
    use std::time::Duration;
    use tempfile::TempDir;

    fn random_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    /// A single-node cluster with an elected leader.
    fn leader_store(tmp: &TempDir) -> Arc<Store> {
        let addr = random_addr();
        let mut store = Store::new(
            tmp.path(),
            addr.clone(),
            "node0",
            addr,
            Arc::new(MemoryStore::new()),
        );
        store.open(true).unwrap();
        let store = Arc::new(store);
        store.wait_for_leader(Duration::from_secs(5)).unwrap();
        store
    }

    fn request(payload: RequestPayload) -> Request {
        Request {
            id: RequestId(1),
            payload,
        }
    }

    fn expect_error(response: Response) -> ErrorCode {
        match response.payload {
            ResponsePayload::Error(e) => e.code,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn test_kv_surface_end_to_end() {
        let tmp = TempDir::new().unwrap();
        let store = leader_store(&tmp);
        let handler = RequestHandler::new(Arc::clone(&store), HashMap::new());

        let set = handler.handle(request(RequestPayload::Set {
            key: "key".into(),
            value: "value".into(),
        }));
        assert_eq!(set.payload, ResponsePayload::Ok);

        let get = handler.handle(request(RequestPayload::Get { key: "key".into() }));
        assert_eq!(
            get.payload,
            ResponsePayload::Value {
                value: "value".into()
            }
        );

        let delete = handler.handle(request(RequestPayload::Delete { key: "key".into() }));
        assert_eq!(delete.payload, ResponsePayload::Ok);

        let missing = handler.handle(request(RequestPayload::Get { key: "key".into() }));
        assert_eq!(expect_error(missing), ErrorCode::NotFound);

        store.shutdown().unwrap();
    }

    #[test]
    fn test_empty_key_is_invalid_argument() {
        let tmp = TempDir::new().unwrap();
        let store = leader_store(&tmp);
        let handler = RequestHandler::new(Arc::clone(&store), HashMap::new());

        for payload in [
            RequestPayload::Get { key: String::new() },
            RequestPayload::Set {
                key: String::new(),
                value: "v".into(),
            },
            RequestPayload::Delete { key: String::new() },
        ] {
            let response = handler.handle(request(payload));
            assert_eq!(expect_error(response), ErrorCode::InvalidArgument);
        }

        store.shutdown().unwrap();
    }

    #[test]
    fn test_get_servers_joins_advertise_map() {
        let tmp = TempDir::new().unwrap();
        let store = leader_store(&tmp);
        let advertise = HashMap::from([(NodeId::from("node0"), "127.0.0.1:3000".to_owned())]);
        let handler = RequestHandler::new(Arc::clone(&store), advertise);

        let response = handler.handle(request(RequestPayload::GetServers));
        match response.payload {
            ResponsePayload::Servers { servers } => {
                assert_eq!(servers.len(), 1);
                assert_eq!(servers[0].id, "node0");
                assert_eq!(servers[0].rpc_address, "127.0.0.1:3000");
                assert!(servers[0].is_leader);
            }
            other => panic!("expected servers, got {other:?}"),
        }

        store.shutdown().unwrap();
    }

    #[test]
    fn test_membership_requires_arguments() {
        let tmp = TempDir::new().unwrap();
        let store = leader_store(&tmp);
        let handler = RequestHandler::new(Arc::clone(&store), HashMap::new());

        let join = handler.handle(request(RequestPayload::JoinServer {
            id: String::new(),
            address: String::new(),
        }));
        assert_eq!(expect_error(join), ErrorCode::InvalidArgument);

        let leave = handler.handle(request(RequestPayload::LeaveServer { id: String::new() }));
        assert_eq!(expect_error(leave), ErrorCode::InvalidArgument);

        store.shutdown().unwrap();
    }
}
