//! # RPC Layer
//!
//! UDP request/response state machine. One actor owns the socket read loop,
//! the pending-request table, the transaction-ID allocator and the token
//! secrets; a cloneable [`Rpc`] handle issues requests and replies over a
//! command channel.
//!
//! ## Request lifecycle
//!
//! `request()` registers a pending entry (fresh `tid`, unique among pending
//! requests), sends the frame, and waits [`REQUEST_TIMEOUT`]. On timeout it
//! either resends the same `tid` once (`retry`, always on for `PING`) or
//! fails with [`Error::Timeout`]. A reply resolves the entry only when its
//! `tid` matches *and* the datagram origin equals the destination the
//! request went to.
//!
//! ## Inbound dispatch
//!
//! Frames that are not matching replies are surfaced to the node layer as
//! [`InboundRequest`]s, with the echoed token already verified against the
//! origin and with a `solicited` bit (did we recently send to this
//! endpoint?) that feeds firewall inference. Unmatched replies and unknown
//! protocol versions are dropped without a response.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::id::NodeId;
use crate::token::{TokenManager, ROTATE_INTERVAL};
use crate::wire::{peek_header, Frame, Peer, CMD_PING};

/// Deadline for a single request attempt.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Cap on concurrently pending requests per socket.
pub const MAX_INFLIGHT: usize = 2048;

/// Receive buffer; every frame fits one datagram well under this.
const RECV_BUFFER: usize = 2048;

/// Command channel capacity for the RPC actor.
const RPC_COMMAND_CHANNEL_SIZE: usize = 256;

/// Outbound endpoints remembered for the `solicited` classification.
const SENT_TO_CAP: usize = 1024;

/// How long an outbound request keeps an endpoint "recently contacted".
const SENT_TO_WINDOW: Duration = Duration::from_secs(30);

/// The abstract datagram endpoint the RPC layer runs on.
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, dest).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// What to send: an application- or protocol-level request body.
#[derive(Clone, Debug, Default)]
pub struct Message {
    pub command: u64,
    pub target: Option<NodeId>,
    pub value: Option<Vec<u8>>,
    /// Echo of a token previously received from the destination.
    pub token: Option<[u8; 32]>,
}

impl Message {
    pub fn new(command: u64) -> Self {
        Self {
            command,
            ..Self::default()
        }
    }
}

/// Per-request options.
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Resend once with the same `tid` before giving up.
    pub retry: bool,
    /// Send the request datagram through this socket instead of the node's
    /// own. Replies still resolve against the node's pending table, which is
    /// what makes firewall self-probes observable.
    pub via: Option<Arc<dyn DatagramSocket>>,
}

/// A resolved round-trip.
#[derive(Clone, Debug)]
pub struct Reply {
    pub from: SocketAddr,
    pub from_id: Option<NodeId>,
    pub status: u8,
    pub value: Option<Vec<u8>>,
    pub token: Option<[u8; 32]>,
    pub nodes: Vec<Peer>,
    pub rtt: Duration,
}

/// An inbound frame that was not a matching reply, handed to the node layer.
#[derive(Debug)]
pub struct InboundRequest {
    pub from: SocketAddr,
    pub frame: Frame,
    /// The echoed token verified against the datagram origin.
    pub token_valid: bool,
    /// We sent a request to this endpoint within the last
    /// [`SENT_TO_WINDOW`]; its traffic proves nothing about reachability.
    pub solicited: bool,
}

enum RpcCommand {
    Request {
        msg: Message,
        dest: SocketAddr,
        via: Option<Arc<dyn DatagramSocket>>,
        done: oneshot::Sender<Result<(u16, oneshot::Receiver<Result<Reply>>)>>,
    },
    Resend {
        tid: u16,
    },
    Deregister {
        tid: u16,
    },
    Reply {
        frame: Frame,
        dest: SocketAddr,
        attach_token: bool,
    },
    SetLocalId(Option<NodeId>),
    Shutdown,
}

/// Cloneable handle to the RPC actor.
#[derive(Clone)]
pub struct Rpc {
    cmd_tx: mpsc::Sender<RpcCommand>,
    local_addr: SocketAddr,
    destroyed: Arc<AtomicBool>,
}

impl Rpc {
    /// Spawn the actor over `socket`. Inbound requests are delivered to
    /// `inbound_tx`; the receiver side belongs to the node actor.
    pub fn spawn(
        socket: Arc<dyn DatagramSocket>,
        inbound_tx: mpsc::Sender<InboundRequest>,
    ) -> io::Result<Self> {
        let local_addr = socket.local_addr()?;
        let (cmd_tx, cmd_rx) = mpsc::channel(RPC_COMMAND_CHANNEL_SIZE);
        let destroyed = Arc::new(AtomicBool::new(false));
        let actor = RpcActor {
            socket,
            pending: HashMap::new(),
            next_tid: rand::random(),
            local_id: None,
            tokens: TokenManager::new(),
            sent_to: LruCache::new(NonZeroUsize::new(SENT_TO_CAP).expect("cap is non-zero")),
            inbound_tx,
        };
        tokio::spawn(actor.run(cmd_rx));
        Ok(Self {
            cmd_tx,
            local_addr,
            destroyed,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Issue a request and wait for the matching reply.
    pub async fn request(
        &self,
        msg: Message,
        dest: SocketAddr,
        opts: RequestOptions,
    ) -> Result<Reply> {
        if self.is_destroyed() {
            return Err(Error::Destroyed);
        }
        // Pings probe liveness; a single lost datagram should not read as a
        // dead peer.
        let mut retries_left = if opts.retry || msg.command == CMD_PING {
            1
        } else {
            0
        };

        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(RpcCommand::Request {
                msg,
                dest,
                via: opts.via,
                done: done_tx,
            })
            .await
            .map_err(|_| Error::Destroyed)?;
        let (tid, mut reply_rx) = done_rx.await.map_err(|_| Error::Destroyed)??;

        loop {
            match timeout(REQUEST_TIMEOUT, &mut reply_rx).await {
                Ok(Ok(result)) => return result,
                Ok(Err(_)) => return Err(Error::Destroyed),
                Err(_) if retries_left > 0 => {
                    retries_left -= 1;
                    trace!(tid, %dest, "request timed out, retrying");
                    if self.cmd_tx.send(RpcCommand::Resend { tid }).await.is_err() {
                        return Err(Error::Destroyed);
                    }
                }
                Err(_) => {
                    let _ = self.cmd_tx.send(RpcCommand::Deregister { tid }).await;
                    return Err(Error::Timeout);
                }
            }
        }
    }

    /// Send a reply frame. `attach_token` adds a fresh round-trip token for
    /// the destination, done for every reply to a targeted request.
    pub(crate) async fn send_reply(&self, frame: Frame, dest: SocketAddr, attach_token: bool) {
        let _ = self
            .cmd_tx
            .send(RpcCommand::Reply {
                frame,
                dest,
                attach_token,
            })
            .await;
    }

    /// Announce (or stop announcing) a node ID on outbound frames. Queued
    /// ahead of any request issued afterwards on the same handle.
    pub(crate) fn set_local_id(&self, id: Option<NodeId>) {
        let _ = self.cmd_tx.try_send(RpcCommand::SetLocalId(id));
    }

    /// Fail every pending request with `Destroyed` and stop the actor.
    pub(crate) async fn shutdown(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        let _ = self.cmd_tx.send(RpcCommand::Shutdown).await;
    }
}

struct PendingRequest {
    dest: SocketAddr,
    bytes: Vec<u8>,
    via: Option<Arc<dyn DatagramSocket>>,
    reply_tx: oneshot::Sender<Result<Reply>>,
    sent_at: Instant,
}

struct RpcActor {
    socket: Arc<dyn DatagramSocket>,
    pending: HashMap<u16, PendingRequest>,
    next_tid: u16,
    local_id: Option<NodeId>,
    tokens: TokenManager,
    sent_to: LruCache<SocketAddr, Instant>,
    inbound_tx: mpsc::Sender<InboundRequest>,
}

impl RpcActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RpcCommand>) {
        let mut rotate = tokio::time::interval(ROTATE_INTERVAL);
        rotate.tick().await; // skip the immediate tick
        let mut buf = vec![0u8; RECV_BUFFER];

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(RpcCommand::Request { msg, dest, via, done }) => {
                            let result = self.start_request(msg, dest, via).await;
                            let _ = done.send(result);
                        }
                        Some(RpcCommand::Resend { tid }) => {
                            self.resend(tid).await;
                        }
                        Some(RpcCommand::Deregister { tid }) => {
                            self.pending.remove(&tid);
                        }
                        Some(RpcCommand::Reply { frame, dest, attach_token }) => {
                            self.send_reply(frame, dest, attach_token).await;
                        }
                        Some(RpcCommand::SetLocalId(id)) => {
                            self.local_id = id;
                        }
                        Some(RpcCommand::Shutdown) | None => {
                            break;
                        }
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, origin)) => {
                            let datagram = buf[..len].to_vec();
                            self.on_datagram(&datagram, origin).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "socket receive failed");
                        }
                    }
                }
                _ = rotate.tick() => {
                    self.tokens.maybe_rotate();
                }
            }
        }

        debug!(pending = self.pending.len(), "rpc actor shutting down");
        for (_, entry) in self.pending.drain() {
            let _ = entry.reply_tx.send(Err(Error::Destroyed));
        }
    }

    async fn start_request(
        &mut self,
        msg: Message,
        dest: SocketAddr,
        via: Option<Arc<dyn DatagramSocket>>,
    ) -> Result<(u16, oneshot::Receiver<Result<Reply>>)> {
        if self.pending.len() >= MAX_INFLIGHT {
            return Err(Error::Overflow);
        }
        let tid = self.alloc_tid();

        let mut frame = Frame::request(tid, msg.command);
        frame.from_id = self.local_id;
        frame.target = msg.target;
        frame.value = msg.value;
        frame.token = msg.token;
        let bytes = frame.encode();

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(
            tid,
            PendingRequest {
                dest,
                bytes: bytes.clone(),
                via: via.clone(),
                reply_tx,
                sent_at: Instant::now(),
            },
        );
        self.sent_to.put(dest, Instant::now());

        if let Err(e) = self.transmit(&bytes, dest, via.as_deref()).await {
            self.pending.remove(&tid);
            return Err(Error::Socket(e));
        }
        Ok((tid, reply_rx))
    }

    async fn resend(&mut self, tid: u16) {
        let Some(entry) = self.pending.get_mut(&tid) else {
            return;
        };
        entry.sent_at = Instant::now();
        let bytes = entry.bytes.clone();
        let dest = entry.dest;
        let via = entry.via.clone();
        if let Err(e) = self.transmit(&bytes, dest, via.as_deref()).await {
            debug!(tid, %dest, error = %e, "retransmit failed");
        }
    }

    async fn send_reply(&mut self, mut frame: Frame, dest: SocketAddr, attach_token: bool) {
        frame.from_id = self.local_id;
        if attach_token {
            frame.token = Some(self.tokens.derive(dest));
        }
        let bytes = frame.encode();
        if let Err(e) = self.transmit(&bytes, dest, None).await {
            debug!(%dest, error = %e, "reply send failed");
        }
    }

    async fn transmit(
        &self,
        bytes: &[u8],
        dest: SocketAddr,
        via: Option<&dyn DatagramSocket>,
    ) -> io::Result<()> {
        match via {
            Some(socket) => socket.send_to(bytes, dest).await?,
            None => self.socket.send_to(bytes, dest).await?,
        };
        Ok(())
    }

    /// Allocate a tid unique among pending requests. Wrapping scan; the
    /// in-flight cap guarantees a free slot exists.
    fn alloc_tid(&mut self) -> u16 {
        loop {
            let tid = self.next_tid;
            self.next_tid = self.next_tid.wrapping_add(1);
            if !self.pending.contains_key(&tid) {
                return tid;
            }
        }
    }

    async fn on_datagram(&mut self, data: &[u8], origin: SocketAddr) {
        match Frame::decode(data) {
            Ok(frame) if frame.reply => self.resolve_reply(frame, origin),
            Ok(frame) => self.dispatch_request(frame, origin).await,
            Err(_) => {
                // A garbled frame still fails its pending request if the
                // intact header points at one from the right origin.
                if let Some((true, tid)) = peek_header(data) {
                    if self
                        .pending
                        .get(&tid)
                        .is_some_and(|entry| entry.dest == origin)
                    {
                        if let Some(entry) = self.pending.remove(&tid) {
                            let _ = entry.reply_tx.send(Err(Error::InvalidReply));
                        }
                        return;
                    }
                }
                trace!(%origin, len = data.len(), "dropping undecodable datagram");
            }
        }
    }

    fn resolve_reply(&mut self, frame: Frame, origin: SocketAddr) {
        let matches = self
            .pending
            .get(&frame.tid)
            .is_some_and(|entry| entry.dest == origin);
        if !matches {
            trace!(tid = frame.tid, %origin, "dropping unmatched reply");
            return;
        }
        let entry = self.pending.remove(&frame.tid).expect("checked above");
        let reply = Reply {
            from: origin,
            from_id: frame.from_id,
            status: frame.status,
            value: frame.value,
            token: frame.token,
            nodes: frame.nodes,
            rtt: entry.sent_at.elapsed(),
        };
        let _ = entry.reply_tx.send(Ok(reply));
    }

    async fn dispatch_request(&mut self, frame: Frame, origin: SocketAddr) {
        let token_valid = frame
            .token
            .as_ref()
            .map(|t| self.tokens.verify(t, origin))
            .unwrap_or(false);
        let solicited = self
            .sent_to
            .get(&origin)
            .is_some_and(|at| at.elapsed() < SENT_TO_WINDOW);
        let inbound = InboundRequest {
            from: origin,
            frame,
            token_valid,
            solicited,
        };
        // UDP gives no delivery guarantee; a full node queue drops like a
        // full NIC queue would.
        if let Err(e) = self.inbound_tx.try_send(inbound) {
            trace!(%origin, error = %e, "inbound queue full, dropping request");
        }
    }
}
