//! Error taxonomy for the RPC substrate.
//!
//! These are local errors; protocol-level failures travel inside reply
//! frames as status codes and resolve the request normally.

use thiserror::Error;

/// Errors surfaced by node, RPC and query operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The request (including any retry) went unanswered.
    #[error("request timed out")]
    Timeout,

    /// The node was destroyed while the operation was pending.
    #[error("node destroyed")]
    Destroyed,

    /// The in-flight request cap was reached.
    #[error("too many in-flight requests")]
    Overflow,

    /// A frame matched a pending transaction but could not be decoded.
    #[error("malformed reply for pending transaction")]
    InvalidReply,

    /// The operation requires a completed bootstrap.
    #[error("node is not bootstrapped")]
    NotBootstrapped,

    /// Frame decoding failed.
    #[error("frame decode: {0}")]
    Decode(&'static str),

    /// Underlying datagram socket failure.
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
