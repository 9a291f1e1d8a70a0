//! TLS material loading and the non-blocking server-side TLS stream.
//!
//! [`setup_server_tls`] / [`setup_client_tls`] build rustls configs from
//! PEM files, for both the peer transport and the public RPC surface:
//!
//! - server side: cert + key; supplying a trusted CA additionally
//!   *requires and verifies* client certificates (mutual TLS).
//! - client side: optional cert + key for mutual TLS; the trusted CA
//!   becomes the root of trust for server verification.

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig, ServerConnection};

use crate::error::{ServerError, ServerResult};
use crate::pem;

/// Builds the server-side TLS config from `cert`/`key`, requiring
/// CA-verified client certificates when `ca` is non-empty.
pub fn setup_server_tls(cert: &str, key: &str, ca: &str) -> ServerResult<Arc<ServerConfig>> {
    let certs = load_certs(Path::new(cert))?;
    let key = load_private_key(Path::new(key))?;

    let builder = if ca.is_empty() {
        ServerConfig::builder().with_no_client_auth()
    } else {
        let roots = load_root_store(Path::new(ca))?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| ServerError::Tls(format!("client verifier: {e}")))?;
        ServerConfig::builder().with_client_cert_verifier(verifier)
    };
    let config = builder
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Builds the client-side TLS config: `ca` is the root of trust for the
/// server's certificate; `cert`/`key` (optional, both or neither) present
/// a client certificate for mutual TLS.
pub fn setup_client_tls(cert: &str, key: &str, ca: &str) -> ServerResult<Arc<ClientConfig>> {
    if ca.is_empty() {
        return Err(ServerError::Config(
            "client TLS requires a trusted CA file".into(),
        ));
    }
    let roots = load_root_store(Path::new(ca))?;
    let builder = ClientConfig::builder().with_root_certificates(roots);

    let config = if cert.is_empty() && key.is_empty() {
        builder.with_no_client_auth()
    } else {
        let certs = load_certs(Path::new(cert))?;
        let key = load_private_key(Path::new(key))?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| ServerError::Tls(e.to_string()))?
    };
    Ok(Arc::new(config))
}

/// Loads every certificate in a PEM file.
fn load_certs(path: &Path) -> ServerResult<Vec<CertificateDer<'static>>> {
    let pem_data = std::fs::read(path).map_err(|e| {
        ServerError::Tls(format!(
            "failed to read certificate file {}: {e}",
            path.display()
        ))
    })?;
    let certs: Vec<CertificateDer<'static>> = pem::parse_pem(&pem_data)?
        .into_iter()
        .filter(|block| block.label == "CERTIFICATE")
        .map(|block| CertificateDer::from(block.contents))
        .collect();
    if certs.is_empty() {
        return Err(ServerError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Loads the first private key in a PEM file (PKCS#8, PKCS#1, or SEC1).
fn load_private_key(path: &Path) -> ServerResult<PrivateKeyDer<'static>> {
    let pem_data = std::fs::read(path)
        .map_err(|e| ServerError::Tls(format!("failed to read key file {}: {e}", path.display())))?;
    for block in pem::parse_pem(&pem_data)? {
        let key = match block.label.as_str() {
            "PRIVATE KEY" => PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(block.contents)),
            "RSA PRIVATE KEY" => PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(block.contents)),
            "EC PRIVATE KEY" => PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(block.contents)),
            _ => continue,
        };
        return Ok(key);
    }
    Err(ServerError::Tls(format!(
        "no private key found in {}",
        path.display()
    )))
}

/// Loads a PEM CA bundle into a root store.
fn load_root_store(path: &Path) -> ServerResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| ServerError::Tls(format!("bad CA certificate: {e}")))?;
    }
    Ok(roots)
}

/// A non-blocking, TLS-wrapped client connection for the mio poll loop.
///
/// Reads and writes never block; `WouldBlock` surfaces to the caller,
/// which retries on the next readiness event.
pub struct TlsStream<S> {
    /// The underlying socket.
    pub socket: S,
    conn: ServerConnection,
    eof: bool,
}

impl<S: Read + Write> TlsStream<S> {
    /// Wraps an accepted socket.
    pub fn new(socket: S, config: Arc<ServerConfig>) -> ServerResult<Self> {
        let conn = ServerConnection::new(config)
            .map_err(|e| ServerError::Tls(format!("failed to create TLS connection: {e}")))?;
        Ok(Self {
            socket,
            conn,
            eof: false,
        })
    }

    /// Pumps TLS data both ways and reads decrypted plaintext into `buf`.
    ///
    /// Socket semantics: `Ok(0)` means the peer closed, `WouldBlock` means
    /// nothing is available yet.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.conn.wants_read() {
            match self.conn.read_tls(&mut self.socket) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        // The handshake may have produced records to send.
        self.write_tls_pending()?;
        match self.conn.reader().read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock && self.eof => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Writes plaintext (encrypted on the way out).
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.conn.writer().write(buf)?;
        self.write_tls_pending()?;
        Ok(written)
    }

    /// Flushes buffered TLS records to the socket.
    pub fn flush(&mut self) -> io::Result<()> {
        self.write_tls_pending()?;
        self.socket.flush()
    }

    /// True while encrypted records are waiting to go out.
    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    fn write_tls_pending(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.socket) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
