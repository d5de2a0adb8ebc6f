//! # K-Bucket Routing Table
//!
//! 256 buckets indexed by the length of the prefix a peer's ID shares with
//! the local ID. Each bucket holds up to [`K`] peers ordered least-recently
//! seen → most-recently seen.
//!
//! Inserting into a full bucket never evicts immediately: the caller gets a
//! [`PendingEviction`] naming the bucket head, probes it, and reports back
//! via [`RoutingTable::apply_probe`]. A live head stays (the candidate is
//! dropped), a dead head makes room.
//!
//! Invariants:
//! - every peer sits in the bucket its ID prefixes to,
//! - a peer (keyed by endpoint) appears in at most one bucket,
//! - no bucket exceeds [`K`] entries.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::time::{Duration, Instant};

use crate::id::{bucket_index, distance_cmp, NodeId};
use crate::wire::Peer;

/// Bucket capacity and lookup width.
pub const K: usize = 20;

/// Peers not heard from within this window are probed by maintenance.
pub const STALE_AFTER: Duration = Duration::from_secs(15 * 60);

/// Number of RTT samples retained per peer.
const RTT_RING: usize = 4;

/// A peer record plus the liveness metadata the table tracks for it.
#[derive(Clone, Debug)]
pub struct PeerEntry {
    pub peer: Peer,
    pub last_seen: Instant,
    pub last_pinged: Instant,
    pub added: Instant,
    rtt: [Option<Duration>; RTT_RING],
    rtt_next: usize,
}

impl PeerEntry {
    fn new(peer: Peer, now: Instant) -> Self {
        Self {
            peer,
            last_seen: now,
            last_pinged: now,
            added: now,
            rtt: [None; RTT_RING],
            rtt_next: 0,
        }
    }

    fn record_rtt(&mut self, sample: Duration) {
        self.rtt[self.rtt_next] = Some(sample);
        self.rtt_next = (self.rtt_next + 1) % RTT_RING;
    }

    /// Mean of the retained RTT samples, if any exist.
    pub fn rtt(&self) -> Option<Duration> {
        let samples: Vec<Duration> = self.rtt.iter().flatten().copied().collect();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<Duration>() / samples.len() as u32)
    }
}

/// Result of an insert attempt.
#[derive(Debug)]
pub enum InsertOutcome {
    /// The peer joined its bucket.
    Inserted,
    /// The peer was already present; recency refreshed.
    Refreshed,
    /// The bucket is full. Probe `oldest`; report with `apply_probe`.
    Full(PendingEviction),
    /// The peer is us, or its ID does not route anywhere useful.
    Rejected,
}

/// A displacement decision waiting on a probe of the bucket head.
#[derive(Clone, Debug)]
pub struct PendingEviction {
    pub bucket: usize,
    pub oldest: Peer,
    pub candidate: Peer,
}

#[derive(Default)]
struct Bucket {
    entries: Vec<PeerEntry>,
}

pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
    // endpoint → bucket index, so endpoint-keyed ops avoid scanning
    by_addr: HashMap<SocketAddr, usize>,
    k: usize,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        Self::with_k(local_id, K)
    }

    pub fn with_k(local_id: NodeId, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(256);
        buckets.resize_with(256, Bucket::default);
        Self {
            local_id,
            buckets,
            by_addr: HashMap::new(),
            k,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.by_addr.contains_key(addr)
    }

    pub fn insert(&mut self, peer: Peer) -> InsertOutcome {
        if peer.id == self.local_id {
            return InsertOutcome::Rejected;
        }
        let idx = bucket_index(&self.local_id, &peer.id);
        let now = Instant::now();

        // An endpoint re-announcing under a new ID moves buckets; drop the
        // stale record first so the endpoint stays unique table-wide.
        if let Some(&old_idx) = self.by_addr.get(&peer.addr) {
            let stale_id = self.buckets[old_idx]
                .entries
                .iter()
                .find(|e| e.peer.addr == peer.addr)
                .map(|e| e.peer.id);
            if stale_id != Some(peer.id) {
                self.remove(&peer.addr);
            }
        }

        let bucket = &mut self.buckets[idx];
        if let Some(pos) = bucket.entries.iter().position(|e| e.peer.addr == peer.addr) {
            let mut entry = bucket.entries.remove(pos);
            entry.last_seen = now;
            bucket.entries.push(entry);
            return InsertOutcome::Refreshed;
        }

        if bucket.entries.len() < self.k {
            bucket.entries.push(PeerEntry::new(peer, now));
            self.by_addr.insert(peer.addr, idx);
            return InsertOutcome::Inserted;
        }

        let oldest = bucket.entries[0].peer;
        InsertOutcome::Full(PendingEviction {
            bucket: idx,
            oldest,
            candidate: peer,
        })
    }

    /// Settle a [`PendingEviction`] after probing the bucket head.
    pub fn apply_probe(&mut self, pending: PendingEviction, oldest_alive: bool) {
        if oldest_alive {
            self.refresh(&pending.oldest.addr);
            return;
        }
        self.remove(&pending.oldest.addr);
        let bucket = &self.buckets[pending.bucket];
        if bucket.entries.len() < self.k && !self.contains(&pending.candidate.addr) {
            // Re-route through insert: the candidate may belong elsewhere now.
            let _ = self.insert(pending.candidate);
        }
    }

    /// Move a peer to the most-recently-seen end of its bucket.
    pub fn refresh(&mut self, addr: &SocketAddr) -> bool {
        let Some(&idx) = self.by_addr.get(addr) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];
        if let Some(pos) = bucket.entries.iter().position(|e| e.peer.addr == *addr) {
            let mut entry = bucket.entries.remove(pos);
            entry.last_seen = Instant::now();
            bucket.entries.push(entry);
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, addr: &SocketAddr) -> bool {
        let Some(idx) = self.by_addr.remove(addr) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];
        if let Some(pos) = bucket.entries.iter().position(|e| e.peer.addr == *addr) {
            bucket.entries.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn record_rtt(&mut self, addr: &SocketAddr, sample: Duration) {
        if let Some(entry) = self.entry_mut(addr) {
            entry.record_rtt(sample);
        }
    }

    pub fn mark_pinged(&mut self, addr: &SocketAddr) {
        if let Some(entry) = self.entry_mut(addr) {
            entry.last_pinged = Instant::now();
        }
    }

    fn entry_mut(&mut self, addr: &SocketAddr) -> Option<&mut PeerEntry> {
        let idx = *self.by_addr.get(addr)?;
        self.buckets[idx]
            .entries
            .iter_mut()
            .find(|e| e.peer.addr == *addr)
    }

    /// Up to `n` peers of minimal XOR distance to `target`.
    ///
    /// Deterministic for a frozen table: total order is distance first, then
    /// endpoint bytes.
    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<Peer> {
        if n == 0 {
            return Vec::new();
        }
        let mut all: Vec<Peer> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| e.peer))
            .collect();
        all.sort_by(|a, b| cmp_by_distance(a, b, target));
        all.truncate(n);
        all
    }

    /// Peers whose last confirmed traffic is older than `threshold`.
    pub fn stale_peers(&self, threshold: Duration) -> Vec<Peer> {
        let now = Instant::now();
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter())
            .filter(|e| now.duration_since(e.last_seen) > threshold)
            .map(|e| e.peer)
            .collect()
    }

    /// Indices of non-empty buckets containing peers older than `threshold`,
    /// candidates for a refresh walk.
    pub fn aging_buckets(&self, threshold: Duration) -> Vec<usize> {
        let now = Instant::now();
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                b.entries
                    .iter()
                    .any(|e| now.duration_since(e.last_seen) > threshold)
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| e.peer))
            .collect()
    }

    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.entries.clear();
        }
        self.by_addr.clear();
    }

    #[cfg(test)]
    fn bucket_of(&self, addr: &SocketAddr) -> Option<usize> {
        self.by_addr.get(addr).copied()
    }
}

/// Total order used everywhere peers are ranked against a target.
pub fn cmp_by_distance(a: &Peer, b: &Peer, target: &NodeId) -> std::cmp::Ordering {
    let da = a.id.xor_distance(target);
    let db = b.id.xor_distance(target);
    distance_cmp(&da, &db).then_with(|| addr_key(&a.addr).cmp(&addr_key(&b.addr)))
}

fn addr_key(addr: &SocketAddr) -> (Vec<u8>, u16) {
    let ip = match addr.ip() {
        std::net::IpAddr::V4(ip) => ip.octets().to_vec(),
        std::net::IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    (ip, addr.port())
}
