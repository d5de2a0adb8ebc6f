//! # Identity / NAT State Machine
//!
//! Tracks everything needed to decide whether this node may hold a stable,
//! endpoint-derived identity: what the world says our endpoint is, whether
//! anyone can reach us unsolicited, and whether the host just woke from
//! sleep with stale state.
//!
//! The machine is pure: it owns no sockets and no timers. The node actor
//! feeds it observations (`add_report`, `on_inbound_request`, `heartbeat`)
//! and asks it for transitions (`evaluate`), then commits the outcome. That
//! keeps every transition unit-testable under a paused clock.

use std::collections::VecDeque;
use std::net::SocketAddr;

use tokio::time::{Duration, Instant};
use tracing::debug;

/// Size of the sliding window of external endpoint reports.
pub const REPORT_WINDOW: usize = 10;

/// Reports that must agree before an endpoint component counts as stable.
pub const AGREE_THRESHOLD: usize = 3;

/// Minimum uptime before an unforced node may turn persistent.
pub const T_ADAPT: Duration = Duration::from_secs(20 * 60);

/// Wall-clock period of the sleep-detection heartbeat.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Monotonic slack beyond the heartbeat interval that signals a sleep.
pub const SLEEP_THRESHOLD: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Ephemeral,
    Persistent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DowngradeReason {
    Sleep,
    EndpointChanged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Upgrade(SocketAddr),
    Downgrade(DowngradeReason),
}

pub struct NatState {
    mode: Mode,
    /// Caller passed `ephemeral: false`: skip the uptime gate and accept the
    /// first uncontradicted endpoint report.
    forced: bool,
    firewalled: bool,
    reports: VecDeque<SocketAddr>,
    started: Instant,
    last_heartbeat: Option<Instant>,
    /// Endpoint baked into the current persistent identity.
    adopted: Option<SocketAddr>,
}

impl NatState {
    pub fn new(forced: bool, firewalled: bool) -> Self {
        Self {
            mode: Mode::Ephemeral,
            forced,
            firewalled,
            reports: VecDeque::with_capacity(REPORT_WINDOW),
            started: Instant::now(),
            last_heartbeat: None,
            adopted: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn firewalled(&self) -> bool {
        self.firewalled
    }

    /// Whether the caller forced persistence at construction.
    pub fn forced(&self) -> bool {
        self.forced
    }

    pub fn adopted_endpoint(&self) -> Option<SocketAddr> {
        self.adopted
    }

    /// Record a responder's view of our endpoint (from a PING reply).
    pub fn add_report(&mut self, observed: SocketAddr) {
        if self.reports.len() == REPORT_WINDOW {
            self.reports.pop_front();
        }
        self.reports.push_back(observed);
    }

    /// An inbound request arrived from `from`. The RPC layer classifies it
    /// as solicited when we contacted that endpoint recently. Returns true
    /// when the request flips the firewall verdict: an unsolicited request
    /// means the world can reach us.
    pub fn on_inbound_request(&mut self, from: SocketAddr, solicited: bool) -> bool {
        if solicited || !self.firewalled {
            return false;
        }
        debug!(%from, "unsolicited inbound request, clearing firewalled");
        self.firewalled = false;
        true
    }

    /// A PING_NAT self-probe round-tripped through our advertised endpoint.
    pub fn on_probe_success(&mut self) {
        self.firewalled = false;
    }

    /// The modal reported endpoint, if enough of the window agrees.
    ///
    /// Host and port stabilize independently; an unstable port clears the
    /// whole inference until the window settles again.
    pub fn stable_endpoint(&self) -> Option<SocketAddr> {
        let threshold = if self.forced { 1 } else { AGREE_THRESHOLD };
        let host = modal(self.reports.iter().map(|a| a.ip()), threshold)?;
        let port = modal(
            self.reports
                .iter()
                .filter(|a| a.ip() == host)
                .map(|a| a.port()),
            threshold,
        )?;
        Some(SocketAddr::new(host, port))
    }

    /// Decide whether a mode transition is due. The caller performs the side
    /// effects and then commits via [`NatState::commit_upgrade`] /
    /// [`NatState::commit_downgrade`].
    pub fn evaluate(&self) -> Option<Transition> {
        match self.mode {
            Mode::Ephemeral => {
                let endpoint = self.stable_endpoint()?;
                if self.firewalled {
                    return None;
                }
                if !self.forced && self.started.elapsed() < T_ADAPT {
                    return None;
                }
                Some(Transition::Upgrade(endpoint))
            }
            Mode::Persistent => {
                let current = self.stable_endpoint()?;
                if Some(current) != self.adopted {
                    Some(Transition::Downgrade(DowngradeReason::EndpointChanged))
                } else {
                    None
                }
            }
        }
    }

    pub fn commit_upgrade(&mut self, endpoint: SocketAddr) {
        self.mode = Mode::Persistent;
        self.adopted = Some(endpoint);
    }

    pub fn commit_downgrade(&mut self) {
        self.mode = Mode::Ephemeral;
        self.adopted = None;
        self.reports.clear();
        // Reachability must be re-proven at the new endpoint.
        self.firewalled = true;
        self.started = Instant::now();
    }

    /// Feed one heartbeat tick. Returns true when the monotonic gap since
    /// the previous tick says the host slept through at least one interval.
    pub fn heartbeat(&mut self, now: Instant) -> bool {
        let slept = match self.last_heartbeat {
            Some(prev) => now.duration_since(prev) > HEARTBEAT_INTERVAL + SLEEP_THRESHOLD,
            None => false,
        };
        self.last_heartbeat = Some(now);
        slept
    }
}

fn modal<T: Copy + Eq>(items: impl Iterator<Item = T>, threshold: usize) -> Option<T> {
    let mut counts: Vec<(T, usize)> = Vec::new();
    for item in items {
        match counts.iter_mut().find(|(v, _)| *v == item) {
            Some((_, n)) => *n += 1,
            None => counts.push((item, 1)),
        }
    }
    counts
        .into_iter()
        .max_by_key(|(_, n)| *n)
        .filter(|(_, n)| *n >= threshold)
        .map(|(v, _)| v)
}

/// True when `claimed` is the ID a node at `origin` must have.
pub fn endpoint_matches_id(claimed: &crate::id::NodeId, origin: SocketAddr) -> bool {
    crate::id::NodeId::from_endpoint(origin) == *claimed
}
