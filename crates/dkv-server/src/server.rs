//! The public RPC server: a mio poll loop plus a worker pool.
//!
//! The poll loop owns every connection and never blocks: read-only
//! requests (`Get`, `GetServers`) are answered inline, while operations
//! that wait on consensus (`Set`, `Delete`, membership changes, each
//! allowed up to the 10 s apply deadline) are handed to worker threads.
//! Completions come back over a channel and a [`mio::Waker`] pulls the
//! loop out of `poll` to flush them.

use std::collections::HashMap;
use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, info, warn};

use dkv_store::Shutdown;
use dkv_wire::{ErrorCode, Request, Response};

use crate::connection::Connection;
use crate::error::{ServerError, ServerResult};
use crate::handler::RequestHandler;

const SERVER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;

/// Poll timeout; bounds shutdown latency.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Public RPC server configuration.
pub struct RpcServerConfig {
    /// Bind address for client traffic.
    pub listen_address: String,
    /// Server-side TLS for client connections, when configured.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Worker threads for consensus-blocking operations.
    pub workers: usize,
}

impl RpcServerConfig {
    /// Plaintext config with the default worker count.
    pub fn new(listen_address: impl Into<String>) -> Self {
        Self {
            listen_address: listen_address.into(),
            tls: None,
            workers: 4,
        }
    }

    /// Enables TLS on the client surface.
    #[must_use]
    pub fn with_tls(mut self, tls: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// A queued blocking operation.
struct Job {
    token: Token,
    request: Request,
}

/// The public RPC server. `run` blocks until the shutdown signal fires.
pub struct Server {
    config: RpcServerConfig,
    handler: Arc<RequestHandler>,
    shutdown: Shutdown,
}

impl Server {
    /// Creates a server over a handler; `shutdown` ends `run`.
    pub fn new(config: RpcServerConfig, handler: Arc<RequestHandler>, shutdown: Shutdown) -> Self {
        Self {
            config,
            handler,
            shutdown,
        }
    }

    /// Binds, serves, and returns once the shutdown signal fires.
    pub fn run(&self) -> ServerResult<()> {
        let addr = self
            .config
            .listen_address
            .parse()
            .map_err(|e| ServerError::Config(format!("bad listen address: {e}")))?;
        let mut listener = TcpListener::bind(addr)?;
        let mut poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, SERVER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        info!(address = %self.config.listen_address, "server listening");

        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>();
        let (done_tx, done_rx) = mpsc::channel::<(Token, Response)>();
        let workers = spawn_workers(
            self.config.workers,
            jobs_rx,
            done_tx,
            Arc::clone(&self.handler),
            Arc::clone(&waker),
        );

        let result = self.poll_loop(&mut poll, &listener, &jobs_tx, &done_rx);

        // Closing the job channel drains the pool.
        drop(jobs_tx);
        for worker in workers {
            let _ = worker.join();
        }
        info!("server shutdown");
        result
    }

    fn poll_loop(
        &self,
        poll: &mut Poll,
        listener: &TcpListener,
        jobs: &Sender<Job>,
        done: &Receiver<(Token, Response)>,
    ) -> ServerResult<()> {
        let mut events = Events::with_capacity(256);
        let mut connections: HashMap<Token, Connection> = HashMap::new();
        let mut next_token = FIRST_CONNECTION;

        while !self.shutdown.is_triggered() {
            if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ServerError::Io(e));
            }

            for event in events.iter() {
                match event.token() {
                    SERVER => accept_all(
                        listener,
                        poll,
                        &mut connections,
                        &mut next_token,
                        self.config.tls.as_ref(),
                    ),
                    WAKER => flush_completions(poll, &mut connections, done),
                    token => {
                        let remove = self.drive_connection(
                            poll,
                            &mut connections,
                            token,
                            event.is_readable(),
                            event.is_writable(),
                            jobs,
                        );
                        if remove {
                            drop_connection(poll, &mut connections, token);
                        }
                    }
                }
            }
            // The waker may race with poll timeouts; drain unconditionally.
            flush_completions(poll, &mut connections, done);
        }
        Ok(())
    }

    /// Handles readiness on one connection. Returns true when it should be
    /// dropped.
    fn drive_connection(
        &self,
        poll: &Poll,
        connections: &mut HashMap<Token, Connection>,
        token: Token,
        readable: bool,
        writable: bool,
        jobs: &Sender<Job>,
    ) -> bool {
        let Some(conn) = connections.get_mut(&token) else {
            return false;
        };

        if readable {
            match conn.read() {
                Ok(true) => {}
                Ok(false) => return true,
                Err(e) => {
                    debug!(error = %e, "connection read failed");
                    return true;
                }
            }
            loop {
                match conn.try_decode_request() {
                    Ok(Some(request)) => {
                        if RequestHandler::is_blocking(&request) {
                            if jobs.send(Job { token, request }).is_err() {
                                return true;
                            }
                        } else {
                            let response = self.handler.handle(request);
                            if conn.queue_response(&response).is_err() {
                                return true;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // Framing is broken; answer once and drop.
                        warn!(error = %e, "undecodable request");
                        let response = Response::error(
                            dkv_wire::RequestId(0),
                            ErrorCode::InvalidArgument,
                            e.to_string(),
                        );
                        let _ = conn.queue_response(&response);
                        conn.closing = true;
                        break;
                    }
                }
            }
        }

        if writable || readable {
            match conn.write() {
                Ok(drained) => {
                    if drained && conn.closing {
                        return true;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "connection write failed");
                    return true;
                }
            }
        }

        reregister(poll, conn);
        false
    }
}

/// Accepts every pending connection.
fn accept_all(
    listener: &TcpListener,
    poll: &Poll,
    connections: &mut HashMap<Token, Connection>,
    next_token: &mut usize,
    tls: Option<&Arc<rustls::ServerConfig>>,
) {
    loop {
        match listener.accept() {
            Ok((socket, peer)) => {
                let token = Token(*next_token);
                *next_token += 1;
                let conn = match tls {
                    Some(config) => match Connection::tls(token, socket, Arc::clone(config)) {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "failed to wrap connection in TLS");
                            continue;
                        }
                    },
                    None => Connection::plain(token, socket),
                };
                debug!(peer = %peer, token = token.0, "client connected");
                let mut conn = conn;
                if let Err(e) =
                    poll.registry()
                        .register(conn.socket_mut(), token, Interest::READABLE)
                {
                    warn!(error = %e, "failed to register connection");
                    continue;
                }
                connections.insert(token, conn);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!(error = %e, "accept failed");
                return;
            }
        }
    }
}

/// Queues finished worker responses onto their connections.
fn flush_completions(
    poll: &Poll,
    connections: &mut HashMap<Token, Connection>,
    done: &Receiver<(Token, Response)>,
) {
    while let Ok((token, response)) = done.try_recv() {
        let Some(conn) = connections.get_mut(&token) else {
            // The client went away while its write was committing.
            continue;
        };
        if conn.queue_response(&response).is_err() || conn.write().is_err() {
            drop_connection_by_ref(poll, conn);
            connections.remove(&token);
            continue;
        }
        reregister(poll, conn);
    }
}

fn reregister(poll: &Poll, conn: &mut Connection) {
    let token = conn.token;
    let interest = conn.interest();
    if let Err(e) = poll.registry().reregister(conn.socket_mut(), token, interest) {
        warn!(error = %e, "failed to reregister connection");
    }
}

fn drop_connection(poll: &Poll, connections: &mut HashMap<Token, Connection>, token: Token) {
    if let Some(mut conn) = connections.remove(&token) {
        let _ = poll.registry().deregister(conn.socket_mut());
        debug!(token = token.0, "client disconnected");
    }
}

fn drop_connection_by_ref(poll: &Poll, conn: &mut Connection) {
    let _ = poll.registry().deregister(conn.socket_mut());
}

/// Spawns the blocking-operation workers.
fn spawn_workers(
    count: usize,
    jobs: Receiver<Job>,
    done: Sender<(Token, Response)>,
    handler: Arc<RequestHandler>,
    waker: Arc<Waker>,
) -> Vec<JoinHandle<()>> {
    let jobs = Arc::new(Mutex::new(jobs));
    (0..count.max(1))
        .map(|i| {
            let jobs = Arc::clone(&jobs);
            let done = done.clone();
            let handler = Arc::clone(&handler);
            let waker = Arc::clone(&waker);
            thread::Builder::new()
                .name(format!("dkv-worker-{i}"))
                .spawn(move || {
                    loop {
                        let job = {
                            let guard = jobs.lock().expect("job queue poisoned");
                            guard.recv()
                        };
                        let Ok(job) = job else { return };
                        let response = handler.handle(job.request);
                        if done.send((job.token, response)).is_err() {
                            return;
                        }
                        let _ = waker.wake();
                    }
                })
                .expect("failed to spawn worker thread")
        })
        .collect()
}
