//! Connection state for the public RPC poll loop.

use std::io::{self, Read, Write};

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Token};

use dkv_wire::{Frame, Request, Response};

use crate::error::ServerResult;
use crate::tls::TlsStream;

const READ_CHUNK: usize = 4096;
const INITIAL_BUFFER: usize = 4096;

/// The socket, optionally TLS-wrapped.
enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// State of one client connection.
pub struct Connection {
    /// Poll registration token.
    pub token: Token,
    transport: Transport,
    /// Bytes read but not yet decoded.
    pub read_buf: BytesMut,
    /// Encoded responses not yet written.
    pub write_buf: BytesMut,
    /// Set once the peer should be dropped after the write buffer drains.
    pub closing: bool,
}

impl Connection {
    /// Wraps a plaintext socket.
    pub fn plain(token: Token, socket: TcpStream) -> Self {
        Self::new(token, Transport::Plain(socket))
    }

    /// Wraps a socket in server-side TLS.
    pub fn tls(
        token: Token,
        socket: TcpStream,
        config: std::sync::Arc<rustls::ServerConfig>,
    ) -> ServerResult<Self> {
        let stream = TlsStream::new(socket, config)?;
        Ok(Self::new(token, Transport::Tls(Box::new(stream))))
    }

    fn new(token: Token, transport: Transport) -> Self {
        Self {
            token,
            transport,
            read_buf: BytesMut::with_capacity(INITIAL_BUFFER),
            write_buf: BytesMut::with_capacity(INITIAL_BUFFER),
            closing: false,
        }
    }

    /// The underlying socket, for poll (de)registration.
    pub fn socket_mut(&mut self) -> &mut TcpStream {
        match &mut self.transport {
            Transport::Plain(socket) => socket,
            Transport::Tls(stream) => &mut stream.socket,
        }
    }

    /// Drains the socket into the read buffer.
    ///
    /// Returns `false` once the peer has closed.
    pub fn read(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let read = match &mut self.transport {
                Transport::Plain(socket) => socket.read(&mut chunk),
                Transport::Tls(stream) => stream.read(&mut chunk),
            };
            match read {
                Ok(0) => return Ok(false),
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Pushes buffered responses out.
    ///
    /// Returns `true` once everything (including pending TLS records) is
    /// flushed.
    pub fn write(&mut self) -> io::Result<bool> {
        while !self.write_buf.is_empty() {
            let written = match &mut self.transport {
                Transport::Plain(socket) => socket.write(&self.write_buf),
                Transport::Tls(stream) => stream.write(&self.write_buf),
            };
            match written {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to socket",
                    ));
                }
                Ok(n) => {
                    let _ = self.write_buf.split_to(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        match &mut self.transport {
            Transport::Plain(socket) => socket.flush()?,
            Transport::Tls(stream) => {
                stream.flush()?;
                if stream.wants_write() {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Attempts to decode one request from the read buffer.
    pub fn try_decode_request(&mut self) -> ServerResult<Option<Request>> {
        match Frame::decode(&mut self.read_buf)? {
            Some(frame) => Ok(Some(Request::from_frame(&frame)?)),
            None => Ok(None),
        }
    }

    /// Queues a response for writing.
    pub fn queue_response(&mut self, response: &Response) -> ServerResult<()> {
        response.encode_into(&mut self.write_buf)?;
        Ok(())
    }

    /// Poll interest for the current buffer state.
    pub fn interest(&self) -> Interest {
        let tls_pending = match &self.transport {
            Transport::Plain(_) => false,
            Transport::Tls(stream) => stream.wants_write(),
        };
        if self.write_buf.is_empty() && !tls_pending {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }
}
