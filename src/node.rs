//! # High-Level Node API
//!
//! A [`Node`] wires the pieces together: the RPC actor on the socket, the
//! routing table, the identity state machine and the query engine. One node
//! actor owns every piece of mutable state; the [`Node`] handle talks to it
//! over a command channel and is cheap to clone around.
//!
//! ## Lifecycle
//!
//! A node starts **ephemeral**: random port by default, no ID announced, no
//! routing table entries. Bootstrap pings collect the outside world's view
//! of our endpoint; once the identity machine is satisfied (stable endpoint,
//! reachable, aged — or forced by the caller) the node turns **persistent**:
//! it bakes `blake3(ip || port)` into `local_id`, seeds the routing table
//! from peers met while ephemeral, and starts announcing `from_id` so other
//! tables pick it up. Sleep or an endpoint change downgrades it back.
//!
//! ## Application commands
//!
//! Commands at or above [`CMD_APP_BASE`](crate::wire::CMD_APP_BASE) are
//! surfaced through the take-once [`Node::requests`] receiver as [`Request`]
//! values; the application owes each one a `reply` or an `error`. Reserved
//! commands (`PING`, `PING_NAT`, `FIND_NODE`, `DOWN_HINT`) are answered by
//! the node actor itself.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use lru::LruCache;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::id::{random_id_in_bucket, NodeId};
use crate::nat::{endpoint_matches_id, DowngradeReason, Mode, NatState, Transition,
    HEARTBEAT_INTERVAL};
use crate::query::{self, Commit, Observation, Query, QuerySetup};
use crate::routing::{InsertOutcome, PendingEviction, RoutingTable, K, STALE_AFTER};
use crate::rpc::{DatagramSocket, InboundRequest, Message, Reply, RequestOptions, Rpc};
use crate::wire::{
    decode_addr, encode_addr, Frame, Peer, CMD_APP_BASE, CMD_DOWN_HINT, CMD_FIND_NODE,
    CMD_PING, CMD_PING_NAT, STATUS_OK, STATUS_UNKNOWN_COMMAND,
};

/// Deadline for liveness probes (bucket head, stale peers, down hints).
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Cadence of routing table maintenance.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Minimum spacing between firewall self-probes.
const NAT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Peers remembered while ephemeral, seeding the table on upgrade.
const KNOWN_PEER_CAP: usize = 128;

/// Stale peers probed per maintenance pass.
const STALE_PROBE_BATCH: usize = 8;

/// Application request queue depth.
const REQUEST_QUEUE: usize = 256;

/// Node construction options.
#[derive(Default)]
pub struct NodeOptions {
    /// Endpoints used to join the network.
    pub bootstrap: Vec<SocketAddr>,
    /// Bind address; defaults to `0.0.0.0` with a random port. Ephemeral
    /// nodes should keep the random port so recycled endpoints do not
    /// inherit stale identities.
    pub bind: Option<SocketAddr>,
    /// Bring-your-own datagram socket.
    pub socket: Option<Arc<dyn DatagramSocket>>,
    /// Peers known ahead of time.
    pub nodes: Vec<Peer>,
    /// `Some(false)` forces persistence as soon as an endpoint is known;
    /// `Some(true)` pins the node ephemeral; `None` adapts over uptime.
    pub ephemeral: Option<bool>,
    /// Caller's assertion about reachability; detection remains
    /// authoritative once traffic starts flowing.
    pub firewalled: Option<bool>,
}

/// Node lifecycle events.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    Listening(SocketAddr),
    Bootstrap,
    Ready,
    Persistent(NodeId),
    WakeUp,
}

/// Per-query options.
#[derive(Clone, Default)]
pub struct QueryOptions {
    pub commit: Commit,
    /// Replace the routing table seed with an explicit candidate list.
    pub nodes: Option<Vec<Peer>>,
}

/// An inbound application command, owed a reply.
pub struct Request {
    pub from: SocketAddr,
    pub command: u64,
    pub target: Option<NodeId>,
    pub value: Option<Vec<u8>>,
    /// The request carried a token that verified against its origin.
    pub token: bool,
    tid: u16,
    closer_nodes: Vec<Peer>,
    rpc: Rpc,
}

impl Request {
    /// Reply with `STATUS_OK` and an optional value.
    pub async fn reply(self, value: Option<Vec<u8>>) {
        self.respond(STATUS_OK, value).await;
    }

    /// Reply with an error status.
    pub async fn error(self, code: u8) {
        self.respond(code, None).await;
    }

    async fn respond(self, status: u8, value: Option<Vec<u8>>) {
        let mut frame = Frame {
            reply: true,
            tid: self.tid,
            from_id: None,
            to_id: None,
            token: None,
            target: None,
            command: self.command,
            status,
            value,
            nodes: self.closer_nodes,
        };
        let targeted = self.target.is_some();
        if !targeted {
            frame.nodes = Vec::new();
        }
        self.rpc.send_reply(frame, self.from, targeted).await;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadyState {
    Pending,
    Ready,
    Destroyed,
}

/// Synchronous view of identity state, kept fresh by the actor.
#[derive(Clone, Debug)]
struct Snapshot {
    id: Option<NodeId>,
    ephemeral: bool,
    firewalled: bool,
    public: Option<SocketAddr>,
}

enum NodeCommand {
    AddNode(SocketAddr),
    ToArray(oneshot::Sender<Vec<Peer>>),
    Refresh,
    StartQuery {
        target: NodeId,
        command: u64,
        value: Option<Vec<u8>>,
        opts: QueryOptions,
        done: oneshot::Sender<Query>,
    },
    BootstrapDone,
    /// A round-trip confirmed `peer` and/or reported our observed endpoint.
    Confirmed {
        peer: Option<Peer>,
        observed: Option<SocketAddr>,
        rtt: Option<Duration>,
    },
    EvictionProbe {
        pending: PendingEviction,
        alive: bool,
    },
    StaleProbe {
        addr: SocketAddr,
        alive: bool,
    },
    NatProbe {
        reachable: bool,
    },
    Destroy(oneshot::Sender<()>),
}

type TakeOnce<T> = StdMutex<Option<mpsc::Receiver<T>>>;

/// A DHT node: routing fabric for application-defined RPC commands.
pub struct Node {
    rpc: Rpc,
    cmd_tx: mpsc::Sender<NodeCommand>,
    events: broadcast::Sender<NodeEvent>,
    requests: TakeOnce<Request>,
    ready_rx: watch::Receiver<ReadyState>,
    snapshot: Arc<RwLock<Snapshot>>,
    destroyed: Arc<AtomicBool>,
}

impl Node {
    /// Create a node and start bootstrapping in the background.
    pub async fn new(opts: NodeOptions) -> Result<Self> {
        let socket: Arc<dyn DatagramSocket> = match opts.socket {
            Some(socket) => socket,
            None => {
                let bind = opts
                    .bind
                    .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
                Arc::new(UdpSocket::bind(bind).await?)
            }
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(REQUEST_QUEUE);
        let rpc = Rpc::spawn(socket, inbound_tx)?;
        let local_addr = rpc.local_addr();

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (obs_tx, obs_rx) = mpsc::channel(256);
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);
        let (events, _) = broadcast::channel(32);
        let (ready_tx, ready_rx) = watch::channel(ReadyState::Pending);

        let forced = opts.ephemeral == Some(false);
        let pinned_ephemeral = opts.ephemeral == Some(true);
        let nat = NatState::new(forced, opts.firewalled.unwrap_or(true));

        let snapshot = Arc::new(RwLock::new(Snapshot {
            id: None,
            ephemeral: true,
            firewalled: nat.firewalled(),
            public: None,
        }));
        let destroyed = Arc::new(AtomicBool::new(false));

        let mut known_peers = LruCache::new(NonZeroUsize::new(KNOWN_PEER_CAP).expect("cap"));
        for peer in &opts.nodes {
            known_peers.put(peer.addr, peer.id);
        }

        let actor = NodeActor {
            rpc: rpc.clone(),
            cmd_tx: cmd_tx.clone(),
            obs_tx: obs_tx.clone(),
            nat,
            pinned_ephemeral,
            table: None,
            known_peers,
            probing_eviction: HashSet::new(),
            bootstrapped: false,
            bootstrap: opts.bootstrap.clone(),
            local_addr,
            events: events.clone(),
            request_tx,
            ready_tx,
            snapshot: snapshot.clone(),
            last_nat_probe: None,
        };
        tokio::spawn(actor.run(cmd_rx, inbound_rx, obs_rx));

        let _ = events.send(NodeEvent::Listening(local_addr));
        info!(addr = %local_addr, "node listening");

        // Bootstrap in the background; ready() observes completion.
        let boot_rpc = rpc.clone();
        let boot_cmd = cmd_tx.clone();
        let targets = opts.bootstrap.clone();
        tokio::spawn(async move {
            bootstrap_task(boot_rpc, boot_cmd, targets).await;
        });

        Ok(Self {
            rpc,
            cmd_tx,
            events,
            requests: StdMutex::new(Some(request_rx)),
            ready_rx,
            snapshot,
            destroyed,
        })
    }

    /// Resolve once the initial bootstrap pass finished.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.ready_rx.clone();
        loop {
            match *rx.borrow() {
                ReadyState::Ready => return Ok(()),
                ReadyState::Destroyed => return Err(Error::Destroyed),
                ReadyState::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::Destroyed);
            }
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Take the inbound application-request receiver. Yields once.
    pub fn requests(&self) -> Option<mpsc::Receiver<Request>> {
        self.requests.lock().expect("requests lock").take()
    }

    /// One request/response round-trip.
    pub async fn request(
        &self,
        msg: Message,
        to: SocketAddr,
        opts: RequestOptions,
    ) -> Result<Reply> {
        self.ensure_ready()?;
        let reply = self.rpc.request(msg, to, opts).await?;
        self.confirm(&reply, false).await;
        Ok(reply)
    }

    /// Liveness check; feeds the endpoint self-discovery window.
    pub async fn ping(&self, to: SocketAddr) -> Result<Reply> {
        let reply = self
            .rpc
            .request(Message::new(CMD_PING), to, RequestOptions::default())
            .await?;
        self.confirm(&reply, true).await;
        Ok(reply)
    }

    /// Ping asking the responder to answer at `(to.ip, reply_port)` rather
    /// than the origin port. Sent through `opts.via` this is a firewall
    /// self-probe: the answer arriving on the primary socket proves the
    /// advertised endpoint admits unsolicited traffic.
    pub async fn ping_nat(
        &self,
        to: SocketAddr,
        reply_port: u16,
        opts: RequestOptions,
    ) -> Result<Reply> {
        let mut msg = Message::new(CMD_PING_NAT);
        msg.value = Some(reply_port.to_be_bytes().to_vec());
        let reply = self.rpc.request(msg, to, opts).await?;
        self.confirm(&reply, true).await;
        Ok(reply)
    }

    /// Start an iterative query toward `target`.
    pub async fn query(
        &self,
        target: NodeId,
        command: u64,
        value: Option<Vec<u8>>,
        opts: QueryOptions,
    ) -> Result<Query> {
        self.ensure_ready()?;
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(NodeCommand::StartQuery {
                target,
                command,
                value,
                opts,
                done: done_tx,
            })
            .await
            .map_err(|_| Error::Destroyed)?;
        done_rx.await.map_err(|_| Error::Destroyed)
    }

    /// Query using the built-in `FIND_NODE` command.
    pub async fn find_node(&self, target: NodeId, opts: QueryOptions) -> Result<Query> {
        self.query(target, CMD_FIND_NODE, None, opts).await
    }

    /// Offer an endpoint for table admission; it is pinged first.
    pub async fn add_node(&self, addr: SocketAddr) -> Result<()> {
        self.ensure_ready()?;
        self.cmd_tx
            .send(NodeCommand::AddNode(addr))
            .await
            .map_err(|_| Error::Destroyed)
    }

    /// Snapshot of the routing table contents.
    pub async fn to_array(&self) -> Result<Vec<Peer>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(NodeCommand::ToArray(tx))
            .await
            .map_err(|_| Error::Destroyed)?;
        rx.await.map_err(|_| Error::Destroyed)
    }

    /// Run a maintenance pass now.
    pub async fn refresh(&self) -> Result<()> {
        self.cmd_tx
            .send(NodeCommand::Refresh)
            .await
            .map_err(|_| Error::Destroyed)
    }

    /// Tear the node down: every pending operation fails with `Destroyed`.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(NodeCommand::Destroy(tx)).await.is_ok() {
            let _ = rx.await;
        }
        self.rpc.shutdown().await;
    }

    pub fn id(&self) -> Option<NodeId> {
        self.snapshot.read().expect("snapshot lock").id
    }

    pub fn ephemeral(&self) -> bool {
        self.snapshot.read().expect("snapshot lock").ephemeral
    }

    pub fn firewalled(&self) -> bool {
        self.snapshot.read().expect("snapshot lock").firewalled
    }

    /// Discovered public host, if the report window has settled.
    pub fn host(&self) -> Option<IpAddr> {
        self.snapshot
            .read()
            .expect("snapshot lock")
            .public
            .map(|a| a.ip())
    }

    /// Discovered public port; 0 while unknown or unstable.
    pub fn port(&self) -> u16 {
        self.snapshot
            .read()
            .expect("snapshot lock")
            .public
            .map(|a| a.port())
            .unwrap_or(0)
    }

    /// The bound socket address.
    pub fn address(&self) -> SocketAddr {
        self.rpc.local_addr()
    }

    pub fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Operations that walk or mutate the overlay require a finished
    /// bootstrap pass.
    fn ensure_ready(&self) -> Result<()> {
        if self.destroyed() {
            return Err(Error::Destroyed);
        }
        match *self.ready_rx.borrow() {
            ReadyState::Ready => Ok(()),
            ReadyState::Destroyed => Err(Error::Destroyed),
            ReadyState::Pending => Err(Error::NotBootstrapped),
        }
    }

    /// Feed reply metadata back to the actor: confirmed peers refresh the
    /// table, observed endpoints extend the self-discovery window.
    async fn confirm(&self, reply: &Reply, carries_report: bool) {
        let peer = verified_peer(reply.from_id, reply.from);
        let observed = if carries_report {
            decode_report(reply.value.as_deref())
        } else {
            None
        };
        if peer.is_none() && observed.is_none() {
            return;
        }
        let _ = self
            .cmd_tx
            .send(NodeCommand::Confirmed {
                peer,
                observed,
                rtt: Some(reply.rtt),
            })
            .await;
    }
}

/// A `from_id` only counts when the datagram origin hashes to it.
fn verified_peer(from_id: Option<NodeId>, origin: SocketAddr) -> Option<Peer> {
    let id = from_id?;
    if endpoint_matches_id(&id, origin) {
        Some(Peer { id, addr: origin })
    } else {
        trace!(%origin, claimed = %id, "from_id does not match origin, ignoring");
        None
    }
}

fn decode_report(value: Option<&[u8]>) -> Option<SocketAddr> {
    let bytes: [u8; 6] = value?.try_into().ok()?;
    Some(decode_addr(&bytes))
}

async fn bootstrap_task(rpc: Rpc, cmd_tx: mpsc::Sender<NodeCommand>, targets: Vec<SocketAddr>) {
    for addr in targets {
        match rpc
            .request(Message::new(CMD_PING), addr, RequestOptions::default())
            .await
        {
            Ok(reply) => {
                let peer = verified_peer(reply.from_id, reply.from);
                let observed = decode_report(reply.value.as_deref());
                let _ = cmd_tx
                    .send(NodeCommand::Confirmed {
                        peer,
                        observed,
                        rtt: Some(reply.rtt),
                    })
                    .await;
            }
            Err(err) => {
                debug!(%addr, error = %err, "bootstrap ping failed");
            }
        }
    }
    let _ = cmd_tx.send(NodeCommand::BootstrapDone).await;
}

struct NodeActor {
    rpc: Rpc,
    cmd_tx: mpsc::Sender<NodeCommand>,
    obs_tx: mpsc::Sender<Observation>,
    nat: NatState,
    /// Caller pinned the node ephemeral; it never upgrades.
    pinned_ephemeral: bool,
    /// Present exactly while persistent.
    table: Option<RoutingTable>,
    /// Peers met while ephemeral; becomes the table seed on upgrade.
    known_peers: LruCache<SocketAddr, NodeId>,
    /// Bucket heads currently being probed, so a full bucket triggers one
    /// probe at a time.
    probing_eviction: HashSet<SocketAddr>,
    /// The initial bootstrap pass completed (successfully or not).
    bootstrapped: bool,
    bootstrap: Vec<SocketAddr>,
    local_addr: SocketAddr,
    events: broadcast::Sender<NodeEvent>,
    request_tx: mpsc::Sender<Request>,
    ready_tx: watch::Sender<ReadyState>,
    snapshot: Arc<RwLock<Snapshot>>,
    last_nat_probe: Option<Instant>,
}

impl NodeActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<NodeCommand>,
        mut inbound_rx: mpsc::Receiver<InboundRequest>,
        mut obs_rx: mpsc::Receiver<Observation>,
    ) {
        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
        maintenance.tick().await;
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(NodeCommand::Destroy(ack)) => {
                            let _ = self.ready_tx.send(ReadyState::Destroyed);
                            let _ = ack.send(());
                            break;
                        }
                        Some(cmd) => self.on_command(cmd).await,
                        None => break,
                    }
                }
                inbound = inbound_rx.recv() => {
                    match inbound {
                        Some(request) => self.on_inbound(request).await,
                        None => break,
                    }
                }
                obs = obs_rx.recv() => {
                    if let Some(obs) = obs {
                        self.on_observation(obs);
                    }
                }
                _ = maintenance.tick() => {
                    self.maintain();
                }
                _ = heartbeat.tick() => {
                    self.on_heartbeat();
                }
            }
        }
        debug!("node actor shutting down");
    }

    async fn on_command(&mut self, cmd: NodeCommand) {
        match cmd {
            NodeCommand::AddNode(addr) => {
                let rpc = self.rpc.clone();
                let cmd_tx = self.cmd_tx.clone();
                tokio::spawn(async move {
                    if let Ok(reply) = rpc
                        .request(Message::new(CMD_PING), addr, RequestOptions::default())
                        .await
                    {
                        let _ = cmd_tx
                            .send(NodeCommand::Confirmed {
                                peer: verified_peer(reply.from_id, reply.from),
                                observed: decode_report(reply.value.as_deref()),
                                rtt: Some(reply.rtt),
                            })
                            .await;
                    }
                });
            }
            NodeCommand::ToArray(tx) => {
                let peers = self
                    .table
                    .as_ref()
                    .map(|t| t.peers())
                    .unwrap_or_default();
                let _ = tx.send(peers);
            }
            NodeCommand::Refresh => self.maintain(),
            NodeCommand::StartQuery {
                target,
                command,
                value,
                opts,
                done,
            } => {
                let query = self.start_query(target, command, value, opts);
                let _ = done.send(query);
            }
            NodeCommand::BootstrapDone => {
                self.bootstrapped = true;
                self.apply_transition();
                if *self.ready_tx.borrow() == ReadyState::Pending {
                    let _ = self.ready_tx.send(ReadyState::Ready);
                    let _ = self.events.send(NodeEvent::Bootstrap);
                    let _ = self.events.send(NodeEvent::Ready);
                }
            }
            NodeCommand::Confirmed {
                peer,
                observed,
                rtt,
            } => {
                if let Some(observed) = observed {
                    self.nat.add_report(observed);
                }
                if let Some(peer) = peer {
                    self.admit(peer, rtt);
                }
                self.publish_snapshot();
                self.apply_transition();
            }
            NodeCommand::EvictionProbe { pending, alive } => {
                self.probing_eviction.remove(&pending.oldest.addr);
                if let Some(table) = self.table.as_mut() {
                    table.apply_probe(pending, alive);
                }
            }
            NodeCommand::StaleProbe { addr, alive } => {
                if let Some(table) = self.table.as_mut() {
                    if alive {
                        table.refresh(&addr);
                    } else {
                        table.remove(&addr);
                        debug!(%addr, "evicted unresponsive peer");
                    }
                }
            }
            NodeCommand::NatProbe { reachable } => {
                if reachable {
                    self.nat.on_probe_success();
                    self.publish_snapshot();
                    self.apply_transition();
                }
            }
            NodeCommand::Destroy(_) => unreachable!("handled in run loop"),
        }
    }

    fn on_observation(&mut self, obs: Observation) {
        match obs {
            Observation::Responded(peer, rtt) => {
                if verified_peer(Some(peer.id), peer.addr).is_some() {
                    self.admit(peer, Some(rtt));
                }
            }
            Observation::Failed(addr) => {
                trace!(%addr, "query observed unresponsive peer");
            }
        }
    }

    /// Admit a confirmed peer: routing table while persistent, the known
    /// peer cache otherwise.
    fn admit(&mut self, peer: Peer, rtt: Option<Duration>) {
        let outcome = match self.table.as_mut() {
            Some(table) => table.insert(peer),
            None => {
                self.known_peers.put(peer.addr, peer.id);
                return;
            }
        };
        match outcome {
            InsertOutcome::Inserted => {
                trace!(addr = %peer.addr, "peer admitted to routing table");
            }
            InsertOutcome::Refreshed | InsertOutcome::Rejected => {}
            InsertOutcome::Full(pending) => self.probe_for_eviction(pending),
        }
        if let Some(rtt) = rtt {
            if let Some(table) = self.table.as_mut() {
                table.record_rtt(&peer.addr, rtt);
            }
        }
    }

    /// Probe a full bucket's head; the probe outcome settles the eviction.
    fn probe_for_eviction(&mut self, pending: PendingEviction) {
        if !self.probing_eviction.insert(pending.oldest.addr) {
            return;
        }
        if let Some(table) = self.table.as_mut() {
            table.mark_pinged(&pending.oldest.addr);
        }
        let rpc = self.rpc.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let alive = timeout(
                PROBE_TIMEOUT,
                rpc.request(
                    Message::new(CMD_PING),
                    pending.oldest.addr,
                    RequestOptions::default(),
                ),
            )
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
            let _ = cmd_tx
                .send(NodeCommand::EvictionProbe { pending, alive })
                .await;
        });
    }

    fn start_query(
        &self,
        target: NodeId,
        command: u64,
        value: Option<Vec<u8>>,
        opts: QueryOptions,
    ) -> Query {
        let seeds = match opts.nodes {
            Some(nodes) => nodes,
            None => match self.table.as_ref() {
                Some(table) => table.closest(&target, K),
                None => self
                    .known_peers
                    .iter()
                    .map(|(addr, id)| Peer {
                        id: *id,
                        addr: *addr,
                    })
                    .collect(),
            },
        };
        let mut skip_addrs = vec![self.local_addr];
        if let Some(public) = self.nat.adopted_endpoint() {
            skip_addrs.push(public);
        }
        let local_id = self.table.as_ref().map(|t| t.local_id());
        query::spawn(QuerySetup {
            rpc: self.rpc.clone(),
            target,
            command,
            value,
            seeds,
            bootstrap: self.bootstrap.clone(),
            local_id,
            skip_addrs,
            commit: opts.commit,
            observer: self.obs_tx.clone(),
        })
    }

    async fn on_inbound(&mut self, inbound: InboundRequest) {
        let InboundRequest {
            from,
            frame,
            token_valid,
            solicited,
        } = inbound;

        if self.nat.on_inbound_request(from, solicited) {
            self.publish_snapshot();
            self.apply_transition();
        }
        if let Some(peer) = verified_peer(frame.from_id, from) {
            self.admit(peer, None);
        }

        match frame.command {
            CMD_PING => {
                let mut reply = Frame::reply_to(&frame, STATUS_OK);
                reply.value = encode_addr(from).map(|b| b.to_vec());
                self.rpc.send_reply(reply, from, false).await;
            }
            CMD_PING_NAT => {
                let mut reply = Frame::reply_to(&frame, STATUS_OK);
                reply.value = encode_addr(from).map(|b| b.to_vec());
                let dest = frame
                    .value
                    .as_deref()
                    .and_then(|v| <[u8; 2]>::try_from(v).ok())
                    .map(|p| SocketAddr::new(from.ip(), u16::from_be_bytes(p)))
                    .unwrap_or(from);
                self.rpc.send_reply(reply, dest, false).await;
            }
            CMD_FIND_NODE => {
                let mut reply = Frame::reply_to(&frame, STATUS_OK);
                if let (Some(table), Some(target)) = (self.table.as_ref(), frame.target) {
                    reply.nodes = table.closest(&target, K);
                }
                self.rpc.send_reply(reply, from, frame.target.is_some()).await;
            }
            CMD_DOWN_HINT => {
                self.on_down_hint(&frame);
                self.rpc
                    .send_reply(Frame::reply_to(&frame, STATUS_OK), from, false)
                    .await;
            }
            command if command >= CMD_APP_BASE => {
                let closer_nodes = match (self.table.as_ref(), frame.target) {
                    (Some(table), Some(target)) => table.closest(&target, K),
                    _ => Vec::new(),
                };
                let request = Request {
                    from,
                    command,
                    target: frame.target,
                    value: frame.value.clone(),
                    token: token_valid,
                    tid: frame.tid,
                    closer_nodes,
                    rpc: self.rpc.clone(),
                };
                if let Err(e) = self.request_tx.try_send(request) {
                    trace!(%from, error = %e, "no application handler, rejecting");
                    self.rpc
                        .send_reply(
                            Frame::reply_to(&frame, STATUS_UNKNOWN_COMMAND),
                            from,
                            false,
                        )
                        .await;
                }
            }
            _ => {
                self.rpc
                    .send_reply(Frame::reply_to(&frame, STATUS_UNKNOWN_COMMAND), from, false)
                    .await;
            }
        }
    }

    /// Probe a hinted-down peer we actually know; evict on silence.
    fn on_down_hint(&mut self, frame: &Frame) {
        let Some(addr) = decode_report(frame.value.as_deref()) else {
            return;
        };
        let known = self
            .table
            .as_ref()
            .map(|t| t.contains(&addr))
            .unwrap_or(false);
        if !known {
            return;
        }
        if let Some(table) = self.table.as_mut() {
            table.mark_pinged(&addr);
        }
        let rpc = self.rpc.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let alive = timeout(
                PROBE_TIMEOUT,
                rpc.request(Message::new(CMD_PING), addr, RequestOptions::default()),
            )
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
            let _ = cmd_tx.send(NodeCommand::StaleProbe { addr, alive }).await;
        });
    }

    /// Evaluate the identity machine and carry out whatever it decided.
    fn apply_transition(&mut self) {
        if self.pinned_ephemeral {
            return;
        }
        let decision = match self.nat.evaluate() {
            Some(decision) => decision,
            None => {
                // A forced node that finished bootstrap without a single
                // report (the standing bootstrapper) identifies by its own
                // socket address.
                if self.nat.forced()
                    && self.bootstrapped
                    && self.nat.mode() == Mode::Ephemeral
                    && self.nat.stable_endpoint().is_none()
                    && !self.nat.firewalled()
                {
                    Transition::Upgrade(self.announceable_local_addr())
                } else {
                    return;
                }
            }
        };
        match decision {
            Transition::Upgrade(endpoint) => self.upgrade(endpoint),
            Transition::Downgrade(reason) => self.downgrade(reason),
        }
    }

    fn announceable_local_addr(&self) -> SocketAddr {
        let mut addr = self.local_addr;
        if addr.ip().is_unspecified() {
            addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        addr
    }

    fn upgrade(&mut self, endpoint: SocketAddr) {
        let id = NodeId::from_endpoint(endpoint);
        info!(%endpoint, id = %id, "turning persistent");
        self.nat.commit_upgrade(endpoint);

        let mut table = RoutingTable::new(id);
        let seeds: Vec<Peer> = self
            .known_peers
            .iter()
            .map(|(addr, peer_id)| Peer {
                id: *peer_id,
                addr: *addr,
            })
            .collect();
        let mut pending_probes = Vec::new();
        for peer in seeds {
            if let InsertOutcome::Full(pending) = table.insert(peer) {
                pending_probes.push(pending);
            }
        }
        self.table = Some(table);
        for pending in pending_probes {
            self.probe_for_eviction(pending);
        }
        self.publish_snapshot();

        self.rpc.set_local_id(Some(id));
        let _ = self.events.send(NodeEvent::Persistent(id));

        // Announce: walk toward our own ID so nearby tables admit us.
        let announce = self.start_query(id, CMD_FIND_NODE, None, QueryOptions::default());
        tokio::spawn(async move {
            let mut announce = announce;
            let _ = announce.finished().await;
        });
    }

    fn downgrade(&mut self, reason: DowngradeReason) {
        warn!(?reason, "downgrading to ephemeral");
        // Table peers stay useful as re-bootstrap seeds.
        if let Some(table) = self.table.take() {
            for peer in table.peers() {
                self.known_peers.put(peer.addr, peer.id);
            }
        }
        self.nat.commit_downgrade();
        self.publish_snapshot();

        self.rpc.set_local_id(None);

        let mut targets = self.bootstrap.clone();
        targets.extend(self.known_peers.iter().map(|(addr, _)| *addr));
        let boot_rpc = self.rpc.clone();
        let boot_cmd = self.cmd_tx.clone();
        tokio::spawn(async move {
            bootstrap_task(boot_rpc, boot_cmd, targets).await;
        });
    }

    fn on_heartbeat(&mut self) {
        if self.nat.heartbeat(Instant::now()) {
            let _ = self.events.send(NodeEvent::WakeUp);
            if self.nat.mode() == Mode::Persistent {
                self.downgrade(DowngradeReason::Sleep);
                return;
            }
        }
        self.apply_transition();
        self.maybe_nat_probe();
    }

    /// Active reachability check while passive evidence is missing.
    fn maybe_nat_probe(&mut self) {
        if !self.nat.firewalled() || self.nat.mode() == Mode::Persistent {
            return;
        }
        if self
            .last_nat_probe
            .is_some_and(|at| at.elapsed() < NAT_PROBE_INTERVAL)
        {
            return;
        }
        let Some(helper) = self
            .known_peers
            .iter()
            .map(|(addr, _)| *addr)
            .next()
            .or_else(|| self.bootstrap.first().copied())
        else {
            return;
        };
        self.last_nat_probe = Some(Instant::now());

        let primary_port = self.local_addr.port();
        let rpc = self.rpc.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let Ok(secondary) = UdpSocket::bind("0.0.0.0:0").await else {
                return;
            };
            let mut msg = Message::new(CMD_PING_NAT);
            msg.value = Some(primary_port.to_be_bytes().to_vec());
            let opts = RequestOptions {
                retry: false,
                via: Some(Arc::new(secondary)),
            };
            let reachable = rpc.request(msg, helper, opts).await.is_ok();
            let _ = cmd_tx.send(NodeCommand::NatProbe { reachable }).await;
        });
    }

    /// Periodic table upkeep: refresh an aging bucket, probe stale peers.
    fn maintain(&mut self) {
        let Some(table) = self.table.as_ref() else {
            return;
        };

        let aging = table.aging_buckets(STALE_AFTER);
        if !aging.is_empty() {
            let idx = aging[rand::Rng::gen_range(&mut rand::thread_rng(), 0..aging.len())];
            let target = random_id_in_bucket(&table.local_id(), idx);
            debug!(bucket = idx, "refreshing aging bucket");
            let refresh = self.start_query(target, CMD_FIND_NODE, None, QueryOptions::default());
            tokio::spawn(async move {
                let mut refresh = refresh;
                let _ = refresh.finished().await;
            });
        }

        let table = self.table.as_mut().expect("checked above");
        let stale: Vec<SocketAddr> = table
            .stale_peers(STALE_AFTER)
            .into_iter()
            .map(|p| p.addr)
            .take(STALE_PROBE_BATCH)
            .collect();
        for addr in stale {
            table.mark_pinged(&addr);
            let rpc = self.rpc.clone();
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let alive = timeout(
                    PROBE_TIMEOUT,
                    rpc.request(Message::new(CMD_PING), addr, RequestOptions::default()),
                )
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);
                let _ = cmd_tx.send(NodeCommand::StaleProbe { addr, alive }).await;
            });
        }
    }

    fn publish_snapshot(&self) {
        let mut snapshot = self.snapshot.write().expect("snapshot lock");
        snapshot.id = self.table.as_ref().map(|t| t.local_id());
        snapshot.ephemeral = self.nat.mode() == Mode::Ephemeral;
        snapshot.firewalled = self.nat.firewalled();
        snapshot.public = self
            .nat
            .adopted_endpoint()
            .or_else(|| self.nat.stable_endpoint());
    }
}
