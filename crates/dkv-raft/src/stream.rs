//! Stream layer: the peer transport's connection factory.
//!
//! Produces connections for the engine's peer traffic, optionally wrapping
//! each one in TLS, and reports the *advertised* address the engine should
//! announce to peers. A node bound to `0.0.0.0:2380` may advertise
//! `node2.example:2380`; configuration entries must carry the advertised
//! form so peers behind NAT stay reachable.
//!
//! A connection returned by `accept` or `dial` either satisfies the
//! configured TLS material or no TLS is configured; there is no silent
//! downgrade.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection, StreamOwned};

use crate::types::ServerAddress;

/// How long `accept` sleeps between polls of the listener.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A peer connection, possibly TLS-wrapped.
pub enum Connection {
    /// Plaintext TCP.
    Plain(TcpStream),
    /// Server-side TLS (accepted).
    TlsServer(Box<StreamOwned<ServerConnection, TcpStream>>),
    /// Client-side TLS (dialed).
    TlsClient(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Connection {
    fn socket(&self) -> &TcpStream {
        match self {
            Self::Plain(s) => s,
            Self::TlsServer(s) => s.get_ref(),
            Self::TlsClient(s) => s.get_ref(),
        }
    }

    /// Bounds blocking reads on the underlying socket.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket().set_read_timeout(timeout)
    }

    /// Bounds blocking writes on the underlying socket.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket().set_write_timeout(timeout)
    }

    /// Shuts the connection down in both directions.
    pub fn shutdown(&self) {
        let _ = self.socket().shutdown(std::net::Shutdown::Both);
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::TlsServer(s) => s.read(buf),
            Self::TlsClient(s) => s.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::TlsServer(s) => s.write(buf),
            Self::TlsClient(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::TlsServer(s) => s.flush(),
            Self::TlsClient(s) => s.flush(),
        }
    }
}

/// Listener/dialer pair used by the peer transport.
pub trait StreamLayer: Send + Sync {
    /// Pulls the next inbound connection, blocking until one arrives or the
    /// layer is closed.
    fn accept(&self) -> io::Result<Connection>;

    /// Dials a peer.
    fn dial(&self, addr: &ServerAddress, timeout: Duration) -> io::Result<Connection>;

    /// The address the engine should announce to peers.
    fn public_address(&self) -> ServerAddress;

    /// Unblocks `accept` and refuses further connections.
    fn close(&self);
}

/// TCP stream layer with optional TLS on both sides.
pub struct TcpStreamLayer {
    listener: TcpListener,
    advertise: ServerAddress,
    server_tls: Option<Arc<ServerConfig>>,
    client_tls: Option<Arc<ClientConfig>>,
    closed: AtomicBool,
}

impl TcpStreamLayer {
    /// Binds `bind_addr` and advertises `advertise` (or the bound address
    /// when `None`).
    pub fn bind(
        bind_addr: &str,
        advertise: Option<ServerAddress>,
        server_tls: Option<Arc<ServerConfig>>,
        client_tls: Option<Arc<ClientConfig>>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(bind_addr)?;
        listener.set_nonblocking(true)?;
        let advertise =
            advertise.unwrap_or_else(|| ServerAddress::new(listener.local_addr().map_or_else(
                |_| bind_addr.to_owned(),
                |a| a.to_string(),
            )));
        Ok(Self {
            listener,
            advertise,
            server_tls,
            client_tls,
            closed: AtomicBool::new(false),
        })
    }

    /// The locally bound address, useful when binding port 0 in tests.
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }
}

impl StreamLayer for TcpStreamLayer {
    fn accept(&self) -> io::Result<Connection> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "stream layer closed",
                ));
            }
            match self.listener.accept() {
                Ok((socket, _peer)) => {
                    socket.set_nonblocking(false)?;
                    socket.set_nodelay(true)?;
                    return match &self.server_tls {
                        Some(config) => {
                            let conn = ServerConnection::new(Arc::clone(config))
                                .map_err(io::Error::other)?;
                            Ok(Connection::TlsServer(Box::new(StreamOwned::new(
                                conn, socket,
                            ))))
                        }
                        None => Ok(Connection::Plain(socket)),
                    };
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn dial(&self, addr: &ServerAddress, timeout: Duration) -> io::Result<Connection> {
        let target = addr
            .as_str()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address resolves to nothing"))?;
        let socket = TcpStream::connect_timeout(&target, timeout)?;
        socket.set_nodelay(true)?;

        match &self.client_tls {
            Some(config) => {
                let server_name = dial_server_name(addr.as_str())?;
                let conn = ClientConnection::new(Arc::clone(config), server_name)
                    .map_err(io::Error::other)?;
                Ok(Connection::TlsClient(Box::new(StreamOwned::new(
                    conn, socket,
                ))))
            }
            None => Ok(Connection::Plain(socket)),
        }
    }

    fn public_address(&self) -> ServerAddress {
        self.advertise.clone()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Derives the TLS server name from the host part of `addr`, falling back
/// to the whole address when it does not split. Peer certificates can then
/// be issued per DNS name even when peers are reached by `ip:port`
/// literals.
fn dial_server_name(addr: &str) -> io::Result<ServerName<'static>> {
    let host = addr.rsplit_once(':').map_or(addr, |(host, _port)| host);
    ServerName::try_from(host.to_owned())
        .or_else(|_| ServerName::try_from(addr.to_owned()))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}
