//! Error types surfaced by the public API.
//!
//! Only failures the caller can act on are returned: misuse of the
//! lifecycle (`InvalidState`), the acceptor failing to bind, or a connect
//! attempt that could not be completed. Per-peer trouble after a connection
//! is established (read errors, malformed frames, timeouts) is handled
//! internally by disconnecting the offending peer and is never propagated.

use std::io;
use std::net::IpAddr;
use thiserror::Error;

/// Errors returned by [`PeerManager`](crate::PeerManager) lifecycle and
/// connection methods.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// A method was called in a state it is not allowed in, for example
    /// changing the port or connecting while the engine is running. No
    /// state was mutated.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Neither a dual-stack acceptor nor separate v6/v4 acceptors could be
    /// created on this system.
    #[error("no usable listening socket (v6: {v6}; v4: {v4})")]
    Unsupported { v6: io::Error, v4: io::Error },

    /// The acceptor could not be bound.
    #[error("failed to bind acceptor: {0}")]
    Bind(#[source] io::Error),

    /// The handshake with the first contact did not complete.
    #[error("connection to {address}:{port} failed: {reason}")]
    ConnectionFailed {
        address: IpAddr,
        port: u16,
        reason: String,
    },
}
