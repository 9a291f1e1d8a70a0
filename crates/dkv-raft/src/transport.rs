//! Peer transport: pooled outbound clients and the inbound accept loop.
//!
//! Each peer gets one sender thread with a pooled connection; requests on a
//! connection are strictly sequential, so responses correlate by position.
//! Inbound connections each get a reader thread that turns frames into
//! runtime events and writes the answers back.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::RaftResult;
use crate::message::{RpcRequest, RpcResponse};
use crate::replica::PeerCtx;
use crate::runtime::Event;
use crate::stream::{Connection, StreamLayer};
use crate::types::{NodeId, ServerAddress};

/// Dial timeout for peer connections.
pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a peer has to answer one RPC.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an idle inbound connection is kept before its thread exits.
const INBOUND_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long an inbound handler waits for the runtime to answer. Longer
/// than the forward-apply deadline so slow commits still get a response.
const REPLY_TIMEOUT: Duration = Duration::from_secs(15);

/// An RPC queued to a peer, with the correlation state echoed back in the
/// result event.
pub(crate) struct PeerJob {
    pub request: RpcRequest,
    pub ctx: PeerCtx,
}

/// Handle to one peer's sender thread.
pub(crate) struct PeerClient {
    pub addr: ServerAddress,
    jobs: Sender<PeerJob>,
    handle: Option<JoinHandle<()>>,
}

impl PeerClient {
    /// Spawns the sender thread for `peer` at `addr`.
    pub fn spawn(
        peer: NodeId,
        addr: ServerAddress,
        stream: Arc<dyn StreamLayer>,
        events: Sender<Event>,
    ) -> Self {
        let (jobs, rx) = mpsc::channel::<PeerJob>();
        let thread_addr = addr.clone();
        let handle = thread::Builder::new()
            .name(format!("raft-peer-{peer}"))
            .spawn(move || peer_loop(&peer, &thread_addr, &stream, &events, &rx))
            .expect("failed to spawn peer thread");
        Self {
            addr,
            jobs,
            handle: Some(handle),
        }
    }

    /// Queues a job; fails only when the thread has exited.
    pub fn send(&self, job: PeerJob) -> Result<(), PeerJob> {
        self.jobs.send(job).map_err(|e| e.0)
    }
}

impl Drop for PeerClient {
    fn drop(&mut self) {
        // Closing the channel lets the thread drain and exit; join off the
        // runtime path is cheap because sends are bounded by RPC_TIMEOUT.
        let (dead, _) = mpsc::channel();
        self.jobs = dead;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Sender loop: one pooled connection, one request/response at a time.
fn peer_loop(
    peer: &NodeId,
    addr: &ServerAddress,
    stream: &Arc<dyn StreamLayer>,
    events: &Sender<Event>,
    jobs: &Receiver<PeerJob>,
) {
    let mut conn: Option<Connection> = None;
    for job in jobs {
        let pooled = conn.is_some();
        let mut result = exchange(&mut conn, stream, addr, &job.request);
        if result.is_err() && pooled {
            // The pooled connection may simply have gone stale; retry once
            // on a fresh one.
            result = exchange(&mut conn, stream, addr, &job.request);
        }
        let event = Event::PeerResult {
            peer: peer.clone(),
            ctx: job.ctx,
            result: result.map_err(|e| e.to_string()),
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

/// Performs one request/response exchange, dialing if needed.
fn exchange(
    conn: &mut Option<Connection>,
    stream: &Arc<dyn StreamLayer>,
    addr: &ServerAddress,
    request: &RpcRequest,
) -> RaftResult<RpcResponse> {
    if conn.is_none() {
        let dialed = stream.dial(addr, DIAL_TIMEOUT)?;
        dialed.set_read_timeout(Some(RPC_TIMEOUT))?;
        dialed.set_write_timeout(Some(RPC_TIMEOUT))?;
        *conn = Some(dialed);
    }
    let connection = conn.as_mut().expect("connection just ensured");
    let result = (|| {
        dkv_wire::write_frame(connection, &request.to_frame()?)?;
        let frame = dkv_wire::read_frame(connection)?;
        RpcResponse::from_frame(&frame)
    })();
    if result.is_err() {
        *conn = None;
    }
    result
}

/// Accept loop: turns inbound connections into handler threads.
pub(crate) fn acceptor_loop(
    stream: &Arc<dyn StreamLayer>,
    events: &Sender<Event>,
    shutdown: &Arc<AtomicBool>,
) {
    loop {
        match stream.accept() {
            Ok(conn) => {
                let events = events.clone();
                let shutdown = Arc::clone(shutdown);
                let spawned = thread::Builder::new()
                    .name("raft-inbound".into())
                    .spawn(move || inbound_loop(conn, &events, &shutdown));
                if let Err(e) = spawned {
                    warn!(error = %e, "failed to spawn inbound handler");
                }
            }
            Err(e) => {
                if !shutdown.load(Ordering::Acquire) {
                    warn!(error = %e, "peer accept failed");
                }
                return;
            }
        }
    }
}

/// Per-connection inbound loop: frame in, event to the runtime, frame out.
fn inbound_loop(mut conn: Connection, events: &Sender<Event>, shutdown: &Arc<AtomicBool>) {
    if conn.set_read_timeout(Some(INBOUND_IDLE_TIMEOUT)).is_err() {
        return;
    }
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        let frame = match dkv_wire::read_frame(&mut conn) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "inbound connection closed");
                return;
            }
        };
        let request = match RpcRequest::from_frame(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "undecodable peer frame");
                return;
            }
        };
        let (reply, response_rx): (SyncSender<RpcResponse>, _) = mpsc::sync_channel(1);
        if events.send(Event::Rpc { request, reply }).is_err() {
            return;
        }
        let response = match response_rx.recv_timeout(REPLY_TIMEOUT) {
            Ok(response) => response,
            Err(_) => {
                warn!("runtime did not answer inbound rpc in time");
                return;
            }
        };
        let frame = match response.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode response");
                return;
            }
        };
        if let Err(e) = dkv_wire::write_frame(&mut conn, &frame) {
            debug!(error = %e, "inbound write failed");
            return;
        }
    }
}

/// One-shot request/response over a fresh connection; used for
/// forward-apply, where the response can take as long as a commit.
pub(crate) fn oneshot_rpc(
    stream: &Arc<dyn StreamLayer>,
    addr: &ServerAddress,
    request: &RpcRequest,
    timeout: Duration,
) -> RaftResult<RpcResponse> {
    let mut conn = stream.dial(addr, DIAL_TIMEOUT.min(timeout))?;
    conn.set_read_timeout(Some(timeout))?;
    conn.set_write_timeout(Some(timeout))?;
    dkv_wire::write_frame(&mut conn, &request.to_frame()?)?;
    let frame = dkv_wire::read_frame(&mut conn)?;
    let response = RpcResponse::from_frame(&frame)?;
    conn.shutdown();
    Ok(response)
}
