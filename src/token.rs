//! # Round-Trip Tokens
//!
//! A token is a keyed-blake3 MAC over the endpoint a datagram was received
//! from. Handing one back in a later request proves the sender can receive
//! traffic at that endpoint; it proves nothing else.
//!
//! Two secrets are live at any time. Rotation shifts the current secret into
//! the previous slot, so a token stays valid between [`ROTATE_INTERVAL`] and
//! twice that, regardless of when inside the epoch it was issued.

use std::net::{IpAddr, SocketAddr};

use tokio::time::{Duration, Instant};

/// How often [`TokenManager::maybe_rotate`] replaces the current secret.
pub const ROTATE_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct TokenManager {
    current: [u8; 32],
    previous: [u8; 32],
    rotated_at: Instant,
}

impl TokenManager {
    pub fn new() -> Self {
        Self {
            current: rand::random(),
            previous: rand::random(),
            rotated_at: Instant::now(),
        }
    }

    /// Derive the token for `addr` under the current secret.
    pub fn derive(&self, addr: SocketAddr) -> [u8; 32] {
        mac(&self.current, addr)
    }

    /// A token is valid if either live secret produces it for `addr`.
    pub fn verify(&self, token: &[u8; 32], addr: SocketAddr) -> bool {
        mac(&self.current, addr) == *token || mac(&self.previous, addr) == *token
    }

    /// Shift current → previous and draw a fresh secret.
    pub fn rotate(&mut self) {
        self.previous = self.current;
        self.current = rand::random();
        self.rotated_at = Instant::now();
    }

    /// Rotate if the current epoch has run its course.
    pub fn maybe_rotate(&mut self) {
        if self.rotated_at.elapsed() >= ROTATE_INTERVAL {
            self.rotate();
        }
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

fn mac(secret: &[u8; 32], addr: SocketAddr) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_keyed(secret);
    match addr.ip() {
        IpAddr::V4(ip) => hasher.update(&ip.octets()),
        IpAddr::V6(ip) => hasher.update(&ip.octets()),
    };
    hasher.update(&addr.port().to_be_bytes());
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn derive_verify_roundtrip() {
        let mgr = TokenManager::new();
        let a = addr("192.0.2.1:4000");
        let token = mgr.derive(a);
        assert!(mgr.verify(&token, a));
    }

    #[test]
    fn token_is_bound_to_the_endpoint() {
        let mgr = TokenManager::new();
        let token = mgr.derive(addr("192.0.2.1:4000"));
        assert!(!mgr.verify(&token, addr("192.0.2.2:4000")));
        assert!(!mgr.verify(&token, addr("192.0.2.1:4001")));
    }

    #[test]
    fn one_rotation_keeps_old_tokens_valid() {
        let mut mgr = TokenManager::new();
        let a = addr("192.0.2.1:4000");
        let token = mgr.derive(a);
        mgr.rotate();
        assert!(mgr.verify(&token, a));
        mgr.rotate();
        assert!(!mgr.verify(&token, a));
    }

    #[test]
    fn forged_tokens_fail() {
        let mgr = TokenManager::new();
        assert!(!mgr.verify(&[0u8; 32], addr("192.0.2.1:4000")));
    }
}
