//! # Iterative Query Engine
//!
//! Walks the ID space toward a target with bounded parallelism: keep the
//! [`ALPHA`] closest untried candidates in flight, fold every reply's peer
//! list back into the candidate set, and stop when the K closest candidates
//! have all been heard from (or failed) with nothing left in the air.
//!
//! Replies stream to the caller in arrival order; the distance-ranked
//! artifacts (`closest_nodes`, `closest_replies`) are available once the
//! query finishes. An optional commit phase re-addresses the closest
//! responders with the tokens they handed out, which is how state-mutating
//! commands prove endpoint possession.
//!
//! Each query runs as one task that owns all of its state and advances on
//! request completions, rather than scattering the loop across callbacks.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::id::{distance_cmp, NodeId};
use crate::routing::K;
use crate::rpc::{Message, Reply, RequestOptions, Rpc};
use crate::wire::{encode_addr, Peer, CMD_DOWN_HINT};

/// Lookup parallelism.
pub const ALPHA: usize = 3;

/// Cap on concurrent commit requests.
pub const COMMIT_CONCURRENCY: usize = 16;

/// Stream buffer between the engine and the consumer.
const STREAM_BUFFER: usize = 64;

/// Whether and how a query runs its second phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Commit {
    /// Lookup only.
    #[default]
    None,
    /// Re-send the command to the K closest responders with their tokens.
    Auto,
}

/// Terminal artifacts of a query.
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    /// The K closest peers that responded, in distance order.
    pub closest_nodes: Vec<Peer>,
    /// The K best replies, ranked by the responder's distance to the target.
    pub closest_replies: Vec<Reply>,
}

/// Observations the engine reports back to the node actor, which owns the
/// routing table and liveness bookkeeping.
#[derive(Debug)]
pub enum Observation {
    Responded(Peer, tokio::time::Duration),
    Failed(SocketAddr),
}

/// Everything a query needs at launch.
pub(crate) struct QuerySetup {
    pub rpc: Rpc,
    pub target: NodeId,
    pub command: u64,
    pub value: Option<Vec<u8>>,
    /// Distance-sortable seed peers (routing table or caller supplied).
    pub seeds: Vec<Peer>,
    /// ID-less fallback endpoints, tried when nothing better is known.
    pub bootstrap: Vec<SocketAddr>,
    pub local_id: Option<NodeId>,
    /// Our own endpoints; never queried, never admitted as candidates.
    pub skip_addrs: Vec<SocketAddr>,
    pub commit: Commit,
    pub observer: mpsc::Sender<Observation>,
}

/// Handle to a running query: a reply stream plus terminal artifacts.
pub struct Query {
    rx: mpsc::Receiver<Reply>,
    finished_rx: watch::Receiver<bool>,
    result: Arc<Mutex<Option<QueryResult>>>,
    cancelled: Arc<AtomicBool>,
}

impl Query {
    /// Next reply, in arrival order. `None` once the stream closes.
    pub async fn next(&mut self) -> Option<Reply> {
        self.rx.recv().await
    }

    /// Wait for convergence (and commit, if any) and return the artifacts.
    pub async fn finished(&mut self) -> Result<QueryResult> {
        while !*self.finished_rx.borrow() {
            if self.finished_rx.changed().await.is_err() {
                break;
            }
        }
        self.result
            .lock()
            .expect("query result lock")
            .clone()
            .ok_or(Error::Destroyed)
    }

    /// Terminal K closest responders; `None` until the query finishes.
    pub fn closest_nodes(&self) -> Option<Vec<Peer>> {
        self.result
            .lock()
            .expect("query result lock")
            .as_ref()
            .map(|r| r.closest_nodes.clone())
    }

    /// Terminal K best replies; `None` until the query finishes.
    pub fn closest_replies(&self) -> Option<Vec<Reply>> {
        self.result
            .lock()
            .expect("query result lock")
            .as_ref()
            .map(|r| r.closest_replies.clone())
    }

    /// Stop issuing new requests and detach whatever is in flight.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CandidateState {
    Untried,
    InFlight,
    Responded,
    Failed,
}

struct Candidate {
    addr: SocketAddr,
    id: Option<NodeId>,
    state: CandidateState,
    /// Token this peer handed us, echoed back during commit.
    token: Option<[u8; 32]>,
}

impl Candidate {
    fn distance(&self, target: &NodeId) -> [u8; 32] {
        match &self.id {
            Some(id) => id.xor_distance(target),
            // Unknown IDs sort behind everything known.
            None => [0xff; 32],
        }
    }
}

pub(crate) fn spawn(setup: QuerySetup) -> Query {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let (finished_tx, finished_rx) = watch::channel(false);
    let result = Arc::new(Mutex::new(None));
    let cancelled = Arc::new(AtomicBool::new(false));

    let engine = Engine {
        setup,
        stream: tx,
        result: result.clone(),
        cancelled: cancelled.clone(),
    };
    tokio::spawn(async move {
        engine.run().await;
        let _ = finished_tx.send(true);
    });

    Query {
        rx,
        finished_rx,
        result,
        cancelled,
    }
}

struct Engine {
    setup: QuerySetup,
    stream: mpsc::Sender<Reply>,
    result: Arc<Mutex<Option<QueryResult>>>,
    cancelled: Arc<AtomicBool>,
}

impl Engine {
    async fn run(self) {
        let target = self.setup.target;
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut seen: HashSet<SocketAddr> = self.setup.skip_addrs.iter().copied().collect();

        for peer in &self.setup.seeds {
            if Some(peer.id) == self.setup.local_id {
                continue;
            }
            admit(&mut candidates, &mut seen, peer.addr, Some(peer.id));
        }
        if candidates.is_empty() {
            for addr in &self.setup.bootstrap {
                admit(&mut candidates, &mut seen, *addr, None);
            }
        }
        sort_candidates(&mut candidates, &target);

        let mut in_flight: JoinSet<(SocketAddr, Result<Reply>)> = JoinSet::new();
        let mut closest_replies: Vec<Reply> = Vec::new();

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                debug!(target = %hex_prefix(&target), "query cancelled");
                break;
            }

            while in_flight.len() < ALPHA {
                let Some(pos) = next_untried(&candidates) else {
                    break;
                };
                candidates[pos].state = CandidateState::InFlight;
                let addr = candidates[pos].addr;
                let msg = Message {
                    command: self.setup.command,
                    target: Some(target),
                    value: self.setup.value.clone(),
                    token: candidates[pos].token,
                };
                let rpc = self.setup.rpc.clone();
                in_flight.spawn(async move {
                    let reply = rpc.request(msg, addr, RequestOptions::default()).await;
                    (addr, reply)
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                // Nothing in flight and nothing untried among the closest.
                break;
            };
            let Ok((addr, outcome)) = joined else {
                continue;
            };

            if self.cancelled.load(Ordering::SeqCst) {
                // Detached: the reply (if any) is discarded.
                continue;
            }

            match outcome {
                Ok(reply) => {
                    self.on_reply(&mut candidates, &mut seen, &mut closest_replies, addr, reply)
                        .await;
                    sort_candidates(&mut candidates, &target);
                }
                Err(err) => {
                    trace!(%addr, error = %err, "query candidate failed");
                    set_state(&mut candidates, addr, CandidateState::Failed);
                    let _ = self.setup.observer.try_send(Observation::Failed(addr));
                    self.hint_down(&candidates, addr);
                }
            }
        }

        drop(in_flight);

        let closest_nodes: Vec<Peer> = candidates
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .filter_map(|c| c.id.map(|id| Peer { id, addr: c.addr }))
            .take(K)
            .collect();

        if self.setup.commit == Commit::Auto && !self.cancelled.load(Ordering::SeqCst) {
            self.commit(&candidates).await;
        }

        debug!(
            target = %hex_prefix(&target),
            responded = closest_nodes.len(),
            replies = closest_replies.len(),
            "query finished"
        );

        *self.result.lock().expect("query result lock") = Some(QueryResult {
            closest_nodes,
            closest_replies,
        });
    }

    async fn on_reply(
        &self,
        candidates: &mut Vec<Candidate>,
        seen: &mut HashSet<SocketAddr>,
        closest_replies: &mut Vec<Reply>,
        addr: SocketAddr,
        reply: Reply,
    ) {
        let target = self.setup.target;
        if let Some(cand) = candidates.iter_mut().find(|c| c.addr == addr) {
            cand.state = CandidateState::Responded;
            cand.token = reply.token.or(cand.token);
            if cand.id.is_none() {
                cand.id = reply.from_id;
            }
        }

        if let Some(id) = reply.from_id {
            let _ = self.setup.observer.try_send(Observation::Responded(
                Peer { id, addr },
                reply.rtt,
            ));
            // Rank the reply among the K best by responder distance.
            let dist = id.xor_distance(&target);
            let pos = closest_replies
                .iter()
                .position(|r| {
                    let other = r.from_id.expect("ranked replies carry ids");
                    distance_cmp(&dist, &other.xor_distance(&target)).is_lt()
                })
                .unwrap_or(closest_replies.len());
            if pos < K {
                closest_replies.insert(pos, reply.clone());
                closest_replies.truncate(K);
            }
        }

        for peer in &reply.nodes {
            if Some(peer.id) == self.setup.local_id {
                continue;
            }
            admit(candidates, seen, peer.addr, Some(peer.id));
        }

        // Arrival order, not distance order.
        let _ = self.stream.send(reply).await;
    }

    /// Tell the nearest responsive peer that `failed` looks dead.
    fn hint_down(&self, candidates: &[Candidate], failed: SocketAddr) {
        let Some(bytes) = encode_addr(failed) else {
            return;
        };
        let Some(nearest) = candidates
            .iter()
            .find(|c| c.state == CandidateState::Responded)
            .map(|c| c.addr)
        else {
            return;
        };
        let rpc = self.setup.rpc.clone();
        let mut msg = Message::new(CMD_DOWN_HINT);
        msg.value = Some(bytes.to_vec());
        tokio::spawn(async move {
            let _ = rpc.request(msg, nearest, RequestOptions::default()).await;
        });
    }

    async fn commit(&self, candidates: &[Candidate]) {
        let targets: Vec<(SocketAddr, Option<[u8; 32]>)> = candidates
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .take(K)
            .map(|c| (c.addr, c.token))
            .collect();
        if targets.is_empty() {
            return;
        }
        debug!(
            target = %hex_prefix(&self.setup.target),
            peers = targets.len(),
            "query commit phase"
        );

        let mut join_set: JoinSet<Result<Reply>> = JoinSet::new();
        let mut pending = targets.into_iter();
        let mut next = pending.next();
        loop {
            while join_set.len() < COMMIT_CONCURRENCY {
                let Some((addr, token)) = next.take() else {
                    break;
                };
                next = pending.next();
                let msg = Message {
                    command: self.setup.command,
                    target: Some(self.setup.target),
                    value: self.setup.value.clone(),
                    token,
                };
                let rpc = self.setup.rpc.clone();
                join_set.spawn(async move { rpc.request(msg, addr, RequestOptions::default()).await });
            }
            let Some(joined) = join_set.join_next().await else {
                break;
            };
            // Commit failures are tolerated; successful replies stream out.
            if let Ok(Ok(reply)) = joined {
                let _ = self.stream.send(reply).await;
            }
        }
    }
}

fn admit(
    candidates: &mut Vec<Candidate>,
    seen: &mut HashSet<SocketAddr>,
    addr: SocketAddr,
    id: Option<NodeId>,
) {
    if !seen.insert(addr) {
        return;
    }
    candidates.push(Candidate {
        addr,
        id,
        state: CandidateState::Untried,
        token: None,
    });
}

fn sort_candidates(candidates: &mut [Candidate], target: &NodeId) {
    candidates.sort_by(|a, b| {
        distance_cmp(&a.distance(target), &b.distance(target))
            .then_with(|| addr_bytes(&a.addr).cmp(&addr_bytes(&b.addr)))
    });
}

fn addr_bytes(addr: &SocketAddr) -> (Vec<u8>, u16) {
    let ip = match addr.ip() {
        std::net::IpAddr::V4(ip) => ip.octets().to_vec(),
        std::net::IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    (ip, addr.port())
}

/// Index of the closest untried candidate within the current K closest.
fn next_untried(candidates: &[Candidate]) -> Option<usize> {
    candidates
        .iter()
        .take(K)
        .position(|c| c.state == CandidateState::Untried)
}

fn set_state(candidates: &mut [Candidate], addr: SocketAddr, state: CandidateState) {
    if let Some(cand) = candidates.iter_mut().find(|c| c.addr == addr) {
        cand.state = state;
    }
}

fn hex_prefix(id: &NodeId) -> String {
    hex::encode(&id.as_bytes()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::InboundRequest;
    use crate::wire::{Frame, STATUS_OK};
    use std::sync::Arc;
    use tokio::net::UdpSocket;

    fn setup_for(rpc: Rpc, target: NodeId) -> (QuerySetup, mpsc::Receiver<Observation>) {
        let (observer, observer_rx) = mpsc::channel(64);
        (
            QuerySetup {
                rpc,
                target,
                command: crate::wire::CMD_FIND_NODE,
                value: None,
                seeds: Vec::new(),
                bootstrap: Vec::new(),
                local_id: None,
                skip_addrs: Vec::new(),
                commit: Commit::None,
                observer,
            },
            observer_rx,
        )
    }

    async fn rpc_pair() -> (Rpc, mpsc::Receiver<InboundRequest>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = mpsc::channel(64);
        (Rpc::spawn(Arc::new(socket), tx).unwrap(), rx)
    }

    /// A peer that answers FIND_NODE with a fixed node list and identity.
    fn responder(
        mut inbound: mpsc::Receiver<InboundRequest>,
        rpc: Rpc,
        id: NodeId,
        nodes: Vec<Peer>,
    ) {
        tokio::spawn(async move {
            while let Some(request) = inbound.recv().await {
                let mut reply = Frame::reply_to(&request.frame, STATUS_OK);
                reply.from_id = Some(id);
                reply.nodes = nodes.clone();
                rpc.send_reply(reply, request.from, false).await;
            }
        });
    }

    #[tokio::test]
    async fn empty_seed_terminates_immediately() {
        let (rpc, _rx) = rpc_pair().await;
        let (setup, _obs) = setup_for(rpc, NodeId::from_bytes([7; 32]));
        let mut query = spawn(setup);
        assert!(query.next().await.is_none());
        let result = query.finished().await.expect("finished");
        assert!(result.closest_nodes.is_empty());
        assert!(result.closest_replies.is_empty());
    }

    #[tokio::test]
    async fn lookup_walks_through_learned_candidates() {
        let (client, _client_rx) = rpc_pair().await;
        let (far, far_rx) = rpc_pair().await;
        let (near, near_rx) = rpc_pair().await;

        let target = NodeId::from_bytes([0xAA; 32]);
        let near_id = NodeId::from_endpoint(near.local_addr());
        let far_id = NodeId::from_endpoint(far.local_addr());

        // far knows near; near knows nobody new.
        responder(
            far_rx,
            far.clone(),
            far_id,
            vec![Peer {
                id: near_id,
                addr: near.local_addr(),
            }],
        );
        responder(near_rx, near.clone(), near_id, Vec::new());

        let (mut setup, _obs) = setup_for(client, target);
        setup.seeds = vec![Peer {
            id: far_id,
            addr: far.local_addr(),
        }];
        let mut query = spawn(setup);

        let mut streamed = 0;
        while query.next().await.is_some() {
            streamed += 1;
        }
        assert_eq!(streamed, 2, "both peers replied");

        let result = query.finished().await.expect("finished");
        let ids: Vec<NodeId> = result.closest_nodes.iter().map(|p| p.id).collect();
        assert!(ids.contains(&near_id));
        assert!(ids.contains(&far_id));
        assert_eq!(result.closest_replies.len(), 2);
    }

    #[tokio::test]
    async fn failures_surface_as_observations_not_errors() {
        let (client, _client_rx) = rpc_pair().await;
        let hole = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dead = hole.local_addr().unwrap();

        let target = NodeId::from_bytes([0x55; 32]);
        let (mut setup, mut observations) = setup_for(client, target);
        setup.seeds = vec![Peer {
            id: NodeId::from_endpoint(dead),
            addr: dead,
        }];
        let mut query = spawn(setup);

        assert!(query.next().await.is_none());
        let result = query.finished().await.expect("finished");
        assert!(result.closest_nodes.is_empty());
        match observations.recv().await {
            Some(Observation::Failed(addr)) => assert_eq!(addr, dead),
            other => panic!("expected failure observation, got {other:?}"),
        }
    }
}
