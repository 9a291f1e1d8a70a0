//! The blocking framed client.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use tracing::debug;

use dkv_wire::{
    Request, RequestId, RequestPayload, Response, ResponsePayload, ServerInfo, read_frame,
    write_frame,
};

use crate::{ClientError, ClientResult};

/// Default per-call deadline; must cover a forwarded replicated write.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

enum Transport {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

/// A connection to one dkv node.
pub struct Client {
    transport: Transport,
    next_id: u64,
}

impl Client {
    /// Connects in plaintext.
    pub fn connect(addr: &str, timeout: Duration) -> ClientResult<Self> {
        let socket = dial(addr, timeout)?;
        Ok(Self {
            transport: Transport::Plain(socket),
            next_id: 1,
        })
    }

    /// Connects with TLS, taking the SNI name from the host part of
    /// `addr`.
    pub fn connect_tls(
        addr: &str,
        config: Arc<ClientConfig>,
        timeout: Duration,
    ) -> ClientResult<Self> {
        let socket = dial(addr, timeout)?;
        let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
        let server_name = ServerName::try_from(host.to_owned())
            .or_else(|_| ServerName::try_from(addr.to_owned()))
            .map_err(|e| ClientError::Tls(format!("bad server name: {e}")))?;
        let conn = ClientConnection::new(config, server_name)
            .map_err(|e| ClientError::Tls(e.to_string()))?;
        Ok(Self {
            transport: Transport::Tls(Box::new(StreamOwned::new(conn, socket))),
            next_id: 1,
        })
    }

    /// Reads the value bound to `key`.
    pub fn get(&mut self, key: &str) -> ClientResult<String> {
        match self.call(RequestPayload::Get { key: key.into() })? {
            ResponsePayload::Value { value } => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    /// Binds `key` to `value`.
    pub fn set(&mut self, key: &str, value: &str) -> ClientResult<()> {
        self.expect_ok(RequestPayload::Set {
            key: key.into(),
            value: value.into(),
        })
    }

    /// Removes the binding for `key`.
    pub fn delete(&mut self, key: &str) -> ClientResult<()> {
        self.expect_ok(RequestPayload::Delete { key: key.into() })
    }

    /// Lists the cluster's voting members.
    pub fn get_servers(&mut self) -> ClientResult<Vec<ServerInfo>> {
        match self.call(RequestPayload::GetServers)? {
            ResponsePayload::Servers { servers } => Ok(servers),
            other => Err(unexpected(&other)),
        }
    }

    /// Adds a voting member; must be called on the leader.
    pub fn join_server(&mut self, id: &str, address: &str) -> ClientResult<()> {
        self.expect_ok(RequestPayload::JoinServer {
            id: id.into(),
            address: address.into(),
        })
    }

    /// Removes a voting member; must be called on the leader.
    pub fn leave_server(&mut self, id: &str) -> ClientResult<()> {
        self.expect_ok(RequestPayload::LeaveServer { id: id.into() })
    }

    fn expect_ok(&mut self, payload: RequestPayload) -> ClientResult<()> {
        match self.call(payload)? {
            ResponsePayload::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// One request/response exchange.
    fn call(&mut self, payload: RequestPayload) -> ClientResult<ResponsePayload> {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        let request = Request { id, payload };
        write_frame(&mut self.transport, &request.to_frame()?)?;

        let frame = read_frame(&mut self.transport)?;
        let response = Response::from_frame(&frame)?;
        if response.id != id {
            return Err(ClientError::Protocol(format!(
                "response id {} does not match request id {}",
                response.id.0, id.0
            )));
        }
        match response.payload {
            ResponsePayload::Error(e) => Err(e.into()),
            other => Ok(other),
        }
    }
}

fn unexpected(payload: &ResponsePayload) -> ClientError {
    ClientError::Protocol(format!("unexpected response payload: {payload:?}"))
}

fn dial(addr: &str, timeout: Duration) -> ClientResult<TcpStream> {
    let target = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| ClientError::NoEndpoint(format!("{addr} resolves to nothing")))?;
    let socket = TcpStream::connect_timeout(&target, timeout)?;
    socket.set_nodelay(true)?;
    socket.set_read_timeout(Some(DEFAULT_TIMEOUT))?;
    socket.set_write_timeout(Some(DEFAULT_TIMEOUT))?;
    Ok(socket)
}

/// Asks `endpoint` for the member list and returns the leader's advertised
/// RPC address.
///
/// Members without an advertised RPC address are skipped; admin clients
/// cannot reach them.
pub fn discover_leader(
    endpoint: &str,
    tls: Option<Arc<ClientConfig>>,
    timeout: Duration,
) -> ClientResult<String> {
    let mut client = match tls {
        Some(config) => Client::connect_tls(endpoint, config, timeout)?,
        None => Client::connect(endpoint, timeout)?,
    };
    let servers = client.get_servers()?;
    debug!(count = servers.len(), "discovered members");
    servers
        .into_iter()
        .find(|s| s.is_leader && !s.rpc_address.is_empty())
        .map(|s| s.rpc_address)
        .ok_or_else(|| {
            ClientError::NoEndpoint("no leader with an advertised rpc address".into())
        })
}
