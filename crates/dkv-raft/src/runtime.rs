//! The engine runtime and its public handle.
//!
//! [`Raft`] is the handle the store facade owns. All consensus state lives
//! on a single runtime thread; the handle communicates with it through an
//! event channel and blocks on channel-backed futures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::fsm::Fsm;
use crate::future::{ApplyFuture, Completer, ConfigFuture, RaftFuture};
use crate::message::{
    ForwardApplyRequest, ForwardApplyResponse, RemoteError, RpcRequest, RpcResponse,
};
use crate::replica::{ConfigChange, LeaderCell, PeerCtx, PeerSend, RaftConfig, Replica};
use crate::snapshot::SnapshotStore;
use crate::storage::{LogStore, StableStore};
use crate::stream::StreamLayer;
use crate::transport::{self, PeerClient, PeerJob};
use crate::types::{Configuration, LogIndex, NodeId, ServerAddress};
use crate::{RaftError, RaftResult};

/// Runtime tick granularity; bounds timer precision.
const TICK: Duration = Duration::from_millis(20);

/// Deadline for simple control-plane round trips to the runtime thread.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Events delivered to the runtime thread.
pub(crate) enum Event {
    /// An inbound peer RPC awaiting a response.
    Rpc {
        request: RpcRequest,
        reply: SyncSender<RpcResponse>,
    },
    /// A local proposal.
    Apply {
        payload: Vec<u8>,
        completer: Completer<()>,
    },
    /// A local membership change.
    ConfigChange {
        change: ConfigChange,
        completer: Completer<LogIndex>,
    },
    /// Read the committed configuration.
    GetConfiguration { reply: SyncSender<Configuration> },
    /// Write the genesis configuration.
    Bootstrap {
        configuration: Configuration,
        reply: SyncSender<RaftResult<()>>,
    },
    /// A peer answered (or failed) an RPC we sent.
    PeerResult {
        peer: NodeId,
        ctx: PeerCtx,
        result: Result<RpcResponse, String>,
    },
    /// Stop the runtime.
    Shutdown,
}

/// The consensus engine handle.
///
/// Owns the runtime thread, the peer acceptor, and (shared) the stream
/// layer. `shutdown` is idempotent and cancels every outstanding future.
pub struct Raft {
    local_id: NodeId,
    events: Sender<Event>,
    leader_cell: LeaderCell,
    stream: Arc<dyn StreamLayer>,
    shutdown: Arc<AtomicBool>,
    runtime: Mutex<Option<JoinHandle<()>>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl Raft {
    /// Builds the engine: recovers the replica from its stores (restoring
    /// the newest snapshot into `fsm`), then starts the runtime and the
    /// peer acceptor.
    pub fn new(
        id: NodeId,
        config: RaftConfig,
        fsm: Box<dyn Fsm>,
        log: Box<dyn LogStore>,
        stable: Box<dyn StableStore>,
        snapshots: Box<dyn SnapshotStore>,
        stream: Arc<dyn StreamLayer>,
    ) -> RaftResult<Self> {
        let leader_cell: LeaderCell = Arc::new(Mutex::new(None));
        let advertise = stream.public_address();
        let replica = Replica::new(
            id.clone(),
            advertise,
            config,
            fsm,
            log,
            stable,
            snapshots,
            Arc::clone(&leader_cell),
        )?;

        let (events, inbox) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));

        let runtime = {
            let events = events.clone();
            let stream = Arc::clone(&stream);
            let shutdown = Arc::clone(&shutdown);
            let leader_cell = Arc::clone(&leader_cell);
            thread::Builder::new()
                .name(format!("raft-run-{id}"))
                .spawn(move || {
                    runtime_loop(replica, &inbox, &events, &stream, &shutdown);
                    *leader_cell.lock().expect("leader cell poisoned") = None;
                })
                .map_err(|e| RaftError::Transport(format!("spawn runtime: {e}")))?
        };

        let acceptor = {
            let events = events.clone();
            let stream = Arc::clone(&stream);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name(format!("raft-accept-{id}"))
                .spawn(move || transport::acceptor_loop(&stream, &events, &shutdown))
                .map_err(|e| RaftError::Transport(format!("spawn acceptor: {e}")))?
        };

        Ok(Self {
            local_id: id,
            events,
            leader_cell,
            stream,
            shutdown,
            runtime: Mutex::new(Some(runtime)),
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    /// Writes the one-server genesis configuration. Fails on a node with
    /// any existing durable state.
    pub fn bootstrap_cluster(&self, configuration: Configuration) -> RaftResult<()> {
        let (reply, rx) = mpsc::sync_channel(1);
        self.events
            .send(Event::Bootstrap {
                configuration,
                reply,
            })
            .map_err(|_| RaftError::Shutdown)?;
        rx.recv_timeout(CONTROL_TIMEOUT)
            .map_err(|_| RaftError::Shutdown)?
    }

    /// Submits a proposal on the leader.
    ///
    /// The future resolves with the state machine's result once the entry
    /// commits and applies locally, or with `NotLeader`,
    /// `LeadershipLost`, `Timeout`, or `Shutdown`.
    pub fn apply(&self, payload: Vec<u8>, timeout: Duration) -> ApplyFuture {
        if self.shutdown.load(Ordering::Acquire) {
            return RaftFuture::ready(Err(RaftError::Shutdown));
        }
        let (future, completer) = RaftFuture::with_timeout(timeout);
        if self
            .events
            .send(Event::Apply { payload, completer })
            .is_err()
        {
            return RaftFuture::ready(Err(RaftError::Shutdown));
        }
        future
    }

    /// Proxies a proposal to `addr` (the current leader) over the peer
    /// transport and awaits its outcome, with the same semantics a local
    /// `apply` would have there.
    pub fn forward_apply(
        &self,
        leader_id: &NodeId,
        addr: &ServerAddress,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> RaftResult<()> {
        info!(leader = %leader_id, addr = %addr, "forwarding proposal to leader");
        let request = RpcRequest::ForwardApply(ForwardApplyRequest { payload });
        match transport::oneshot_rpc(&self.stream, addr, &request, timeout)? {
            RpcResponse::ForwardApply(ForwardApplyResponse { result }) => {
                result.map_err(RaftError::from)
            }
            other => Err(RaftError::Transport(format!(
                "unexpected forward-apply response: {other:?}"
            ))),
        }
    }

    /// Adds (or re-addresses) a voting member.
    ///
    /// `prev_index` of 0 skips the optimistic-concurrency check.
    pub fn add_voter(
        &self,
        id: NodeId,
        address: ServerAddress,
        prev_index: LogIndex,
        timeout: Duration,
    ) -> ConfigFuture {
        self.config_change(
            ConfigChange::AddVoter {
                id,
                address,
                prev_index,
            },
            timeout,
        )
    }

    /// Removes a voting member.
    pub fn remove_server(
        &self,
        id: NodeId,
        prev_index: LogIndex,
        timeout: Duration,
    ) -> ConfigFuture {
        self.config_change(ConfigChange::RemoveServer { id, prev_index }, timeout)
    }

    fn config_change(&self, change: ConfigChange, timeout: Duration) -> ConfigFuture {
        if self.shutdown.load(Ordering::Acquire) {
            return RaftFuture::ready(Err(RaftError::Shutdown));
        }
        let (future, completer) = RaftFuture::with_timeout(timeout);
        if self
            .events
            .send(Event::ConfigChange { change, completer })
            .is_err()
        {
            return RaftFuture::ready(Err(RaftError::Shutdown));
        }
        future
    }

    /// The currently believed leader, or `None`.
    pub fn leader_with_id(&self) -> Option<(ServerAddress, NodeId)> {
        self.leader_cell.lock().expect("leader cell poisoned").clone()
    }

    /// The committed cluster configuration.
    pub fn get_configuration(&self) -> RaftResult<Configuration> {
        let (reply, rx) = mpsc::sync_channel(1);
        self.events
            .send(Event::GetConfiguration { reply })
            .map_err(|_| RaftError::Shutdown)?;
        rx.recv_timeout(CONTROL_TIMEOUT)
            .map_err(|_| RaftError::Shutdown)
    }

    /// This node's id.
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Stops the engine: drains the runtime, closes the peer listener, and
    /// cancels outstanding futures with `Shutdown`. Idempotent.
    pub fn shutdown(&self) -> RaftResult<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(id = %self.local_id, "raft shutting down");
        let _ = self.events.send(Event::Shutdown);
        self.stream.close();
        if let Some(handle) = self.runtime.lock().expect("runtime handle poisoned").take() {
            let _ = handle.join();
        }
        if let Some(handle) = self
            .acceptor
            .lock()
            .expect("acceptor handle poisoned")
            .take()
        {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for Raft {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// The single-owner event loop.
fn runtime_loop(
    mut replica: Replica,
    inbox: &Receiver<Event>,
    events: &Sender<Event>,
    stream: &Arc<dyn StreamLayer>,
    shutdown: &Arc<AtomicBool>,
) {
    let mut peers: HashMap<NodeId, PeerClient> = HashMap::new();

    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        let step = match inbox.recv_timeout(TICK) {
            Ok(Event::Shutdown) => break,
            Ok(event) => handle_event(&mut replica, event),
            Err(RecvTimeoutError::Timeout) => Ok(Vec::new()),
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let mut sends = match step {
            Ok(sends) => sends,
            Err(e) => {
                error!(error = %e, "fatal raft runtime error");
                break;
            }
        };
        match replica.tick(Instant::now()) {
            Ok(tick_sends) => sends.extend(tick_sends),
            Err(e) => {
                error!(error = %e, "fatal raft timer error");
                break;
            }
        }
        for send in sends {
            dispatch(&mut peers, send, stream, events);
        }
    }

    shutdown.store(true, Ordering::Release);
    replica.fail_all_pending(|| RaftError::Shutdown);
    // Dropping the clients closes their job channels and joins their
    // threads.
    peers.clear();
}

fn handle_event(replica: &mut Replica, event: Event) -> RaftResult<Vec<PeerSend>> {
    match event {
        Event::Rpc { request, reply } => match request {
            RpcRequest::ForwardApply(req) => {
                let completer = Completer::new(move |result: RaftResult<()>| {
                    let response = RpcResponse::ForwardApply(ForwardApplyResponse {
                        result: result.map_err(RemoteError::from),
                    });
                    let _ = reply.try_send(response);
                });
                replica.submit_apply(req.payload, completer)
            }
            other => {
                let (response, sends) = replica.handle_rpc(other)?;
                let _ = reply.try_send(response);
                Ok(sends)
            }
        },
        Event::Apply { payload, completer } => replica.submit_apply(payload, completer),
        Event::ConfigChange { change, completer } => {
            replica.submit_config_change(change, completer)
        }
        Event::GetConfiguration { reply } => {
            let _ = reply.try_send(replica.configuration());
            Ok(Vec::new())
        }
        Event::Bootstrap {
            configuration,
            reply,
        } => {
            let _ = reply.try_send(replica.bootstrap(configuration));
            Ok(Vec::new())
        }
        Event::PeerResult { peer, ctx, result } => replica.handle_peer_result(&peer, ctx, result),
        Event::Shutdown => Ok(Vec::new()),
    }
}

/// Routes one outgoing RPC to its peer client, (re)spawning the client as
/// needed. A job that cannot be queued is reported back as a failed peer
/// result so the replica clears its in-flight flag.
fn dispatch(
    peers: &mut HashMap<NodeId, PeerClient>,
    send: PeerSend,
    stream: &Arc<dyn StreamLayer>,
    events: &Sender<Event>,
) {
    let respawn = match peers.get(&send.id) {
        Some(client) => client.addr != send.addr,
        None => true,
    };
    if respawn {
        peers.insert(
            send.id.clone(),
            PeerClient::spawn(
                send.id.clone(),
                send.addr.clone(),
                Arc::clone(stream),
                events.clone(),
            ),
        );
    }
    let client = peers.get(&send.id).expect("client just ensured");
    let job = PeerJob {
        request: send.request,
        ctx: send.ctx,
    };
    if let Err(job) = client.send(job) {
        warn!(peer = %send.id, "peer client unavailable, dropping rpc");
        let _ = events.send(Event::PeerResult {
            peer: send.id,
            ctx: job.ctx,
            result: Err("peer client unavailable".into()),
        });
    }
}
