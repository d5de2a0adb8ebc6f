//! # Kadence - Kademlia RPC Substrate
//!
//! Kadence is a UDP routing fabric for peer-to-peer applications: a
//! Kademlia distributed hash table that carries application-defined RPC
//! commands instead of interpreting values itself. Applications lay custom
//! key/value, discovery or coordination protocols on top of it.
//!
//! ## What it provides
//!
//! - **Routing table**: 256 k-buckets keyed by 256-bit endpoint-derived
//!   node IDs, XOR metric, probe-before-evict bucket pressure
//! - **RPC transport**: request/response over UDP datagrams with
//!   transaction IDs, timeouts, retries and round-trip tokens
//! - **Query engine**: α-parallel iterative lookups with an optional
//!   commit phase against the closest responders
//! - **Identity self-discovery**: nodes start ephemeral and turn
//!   persistent once their public endpoint is stable and reachable;
//!   sleep and endpoint drift downgrade them again
//!
//! ## Architecture
//!
//! State is owned by actors: the RPC actor owns the socket, pending table
//! and token secrets; the node actor owns the routing table and identity
//! machine. Public handles ([`Node`], queries) communicate with them over
//! async channels and are cheap to clone.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `id` | Node IDs, XOR metric, bucket math |
//! | `wire` | Frame codec and reserved commands/statuses |
//! | `token` | Round-trip token derivation and rotation |
//! | `routing` | K-bucket routing table |
//! | `rpc` | UDP request/response state machine |
//! | `query` | Iterative lookup and commit |
//! | `nat` | Ephemeral/persistent identity state machine |

mod error;
mod id;
mod nat;
mod node;
mod query;
mod routing;
mod rpc;
mod token;
mod wire;

pub use error::{Error, Result};
pub use id::{bucket_index, distance_cmp, random_id_in_bucket, NodeId};
pub use nat::{HEARTBEAT_INTERVAL, SLEEP_THRESHOLD, T_ADAPT};
pub use node::{Node, NodeEvent, NodeOptions, QueryOptions, Request};
pub use query::{Commit, Query, QueryResult, ALPHA};
pub use routing::{InsertOutcome, PeerEntry, RoutingTable, K, STALE_AFTER};
pub use rpc::{
    DatagramSocket, Message, Reply, RequestOptions, Rpc, MAX_INFLIGHT, REQUEST_TIMEOUT,
};
pub use token::{TokenManager, ROTATE_INTERVAL};
pub use wire::{
    Frame, Peer, CMD_APP_BASE, CMD_DOWN_HINT, CMD_FIND_NODE, CMD_PING, CMD_PING_NAT,
    STATUS_APP_BASE, STATUS_INVALID_TOKEN, STATUS_OK, STATUS_UNKNOWN_COMMAND,
};
