//! # Node IDs and the XOR Metric
//!
//! A [`NodeId`] is a 256-bit identifier. Persistent nodes derive theirs from
//! the public endpoint they are reachable at: `blake3(ip || port)`. Because
//! the derivation is deterministic, any peer can check a claimed ID against
//! the datagram origin it actually observed.
//!
//! Distances between IDs are bitwise XOR interpreted as an unsigned integer;
//! smaller is closer. The routing table indexes peers by the length of the
//! prefix their ID shares with the local ID.

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// A 256-bit node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 32]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the ID a node reachable at `addr` must carry.
    ///
    /// Hashes the raw IP octets followed by the big-endian port, so the ID is
    /// stable for as long as the public endpoint is.
    pub fn from_endpoint(addr: SocketAddr) -> Self {
        let mut hasher = blake3::Hasher::new();
        match addr.ip() {
            IpAddr::V4(ip) => hasher.update(&ip.octets()),
            IpAddr::V6(ip) => hasher.update(&ip.octets()),
        };
        hasher.update(&addr.port().to_be_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn xor_distance(&self, other: &NodeId) -> [u8; 32] {
        let mut dist = [0u8; 32];
        for i in 0..32 {
            dist[i] = self.0[i] ^ other.0[i];
        }
        dist
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

/// Compare two XOR distances as 256-bit unsigned integers.
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> Ordering {
    for i in 0..32 {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Number of leading bits `a` and `b` share, i.e. the routing bucket index.
///
/// Identical IDs map to 255, the last bucket.
pub fn bucket_index(a: &NodeId, b: &NodeId) -> usize {
    let dist = a.xor_distance(b);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    255
}

/// Produce an ID sharing exactly `bucket_idx` prefix bits with `local`.
///
/// Used by table maintenance to aim `find_node` walks into a specific bucket.
pub fn random_id_in_bucket(local: &NodeId, bucket_idx: usize) -> NodeId {
    debug_assert!(bucket_idx < 256);
    let mut distance = [0u8; 32];
    rand::Rng::fill(&mut rand::thread_rng(), &mut distance[..]);

    let byte_idx = bucket_idx / 8;
    let bit_pos = bucket_idx % 8;

    // First bucket_idx bits of the distance must be zero, bit bucket_idx set.
    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }
    let target_bit = 0x80u8 >> bit_pos;
    let random_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = local.0[i] ^ distance[i];
    }
    NodeId(out)
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}..)", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<[u8; 32]> for NodeId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<NodeId> for [u8; 32] {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; 32])
    }

    #[test]
    fn endpoint_derivation_is_deterministic() {
        let a: SocketAddr = "203.0.113.7:4000".parse().unwrap();
        let b: SocketAddr = "203.0.113.7:4001".parse().unwrap();
        assert_eq!(NodeId::from_endpoint(a), NodeId::from_endpoint(a));
        assert_ne!(NodeId::from_endpoint(a), NodeId::from_endpoint(b));
    }

    #[test]
    fn distance_orders_lexicographically() {
        let origin = id(0x00);
        let near = id(0x01);
        let far = id(0x80);
        let dn = origin.xor_distance(&near);
        let df = origin.xor_distance(&far);
        assert_eq!(distance_cmp(&dn, &df), Ordering::Less);
        assert_eq!(distance_cmp(&dn, &dn), Ordering::Equal);
    }

    #[test]
    fn bucket_index_counts_shared_prefix() {
        let local = id(0x00);
        let mut other = [0u8; 32];
        other[0] = 0x80;
        assert_eq!(bucket_index(&local, &NodeId::from_bytes(other)), 0);

        let mut other = [0u8; 32];
        other[1] = 0x40;
        assert_eq!(bucket_index(&local, &NodeId::from_bytes(other)), 9);

        assert_eq!(bucket_index(&local, &local), 255);
    }

    #[test]
    fn random_id_lands_in_requested_bucket() {
        let local = NodeId::from_endpoint("192.0.2.1:9000".parse().unwrap());
        for bucket in [0usize, 1, 7, 8, 42, 200, 255] {
            let generated = random_id_in_bucket(&local, bucket);
            assert_eq!(bucket_index(&local, &generated), bucket, "bucket {bucket}");
        }
    }
}
