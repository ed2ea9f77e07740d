//! Domain types for the overlay: peer identities and peer records.
//!
//! A `PeerId` is a 128-bit UUID generated once at startup and immutable for
//! the lifetime of a process instance. A `Peer` is the local view of another
//! member of the mesh: where it listens, and how many hops away it is.
//! The hop count doubles as the liveness flag, `DISTANCE_MAX` (0xFF) marks a
//! peer that is currently unreachable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// Identifier handed out by the listener registries. Monotonically
/// increasing, never reused within a process lifetime.
pub type ListenerId = u64;

/// Reserved distance value meaning "disconnected / unknown".
pub const DISTANCE_MAX: u8 = u8::MAX;

// ---------------------------------------------------------------------------
// PeerId
// ---------------------------------------------------------------------------

/// A unique identifier for a member of the overlay.
///
/// Generated with UUID v4 when the peer manager is constructed. Two process
/// instances always have different ids, even on the same machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(uuid::Uuid);

impl PeerId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Reconstructs an id from its 16 raw bytes (as read off the wire).
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Uuid::from_bytes(bytes))
    }

    /// Returns the 16 raw bytes of the id.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

/// A member of the overlay distinct from the local node.
///
/// `distance` is the number of relay hops between the local node and this
/// peer: `0` means a direct TCP connection, anything in `1..DISTANCE_MAX`
/// means traffic is relayed through a bridge, and `DISTANCE_MAX` means the
/// peer is currently unreachable.
///
/// `Peer` values are snapshots: the authoritative table lives inside the
/// peer manager and is only mutated by its event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    id: PeerId,
    address: IpAddr,
    port: u16,
    distance: u8,
}

impl Peer {
    pub fn new(id: PeerId, address: IpAddr, port: u16, distance: u8) -> Self {
        Self {
            id,
            address,
            port,
            distance,
        }
    }

    /// The peer's unique identifier.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// The address the peer was last seen at.
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// The port the peer accepts connections on (not the ephemeral port of
    /// an established socket).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Hop count from the local node. See [`DISTANCE_MAX`].
    pub fn distance(&self) -> u8 {
        self.distance
    }

    /// True while the peer is reachable, directly or through a bridge.
    pub fn is_connected(&self) -> bool {
        self.distance != DISTANCE_MAX
    }

    /// True iff a direct TCP connection to this peer exists.
    pub fn is_direct(&self) -> bool {
        self.distance == 0
    }

    pub(crate) fn set_distance(&mut self, distance: u8) {
        self.distance = distance;
    }

    pub(crate) fn set_endpoint(&mut self, address: IpAddr, port: u16) {
        self.address = address;
        self.port = port;
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.id, self.address, self.port)
    }
}

/// Builds the `Peer` value representing the local node itself: loopback
/// address, the configured listen port, distance zero.
pub(crate) fn local_peer_record(id: PeerId, port: u16) -> Peer {
    Peer::new(id, IpAddr::V4(Ipv4Addr::LOCALHOST), port, 0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_generate_is_unique() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b, "two generated PeerIds should be different");
    }

    #[test]
    fn peer_id_byte_roundtrip() {
        let id = PeerId::generate();
        let copy = PeerId::from_bytes(*id.as_bytes());
        assert_eq!(id, copy);
    }

    #[test]
    fn distance_semantics() {
        let id = PeerId::generate();
        let mut peer = Peer::new(id, IpAddr::V4(Ipv4Addr::LOCALHOST), 3479, 0);
        assert!(peer.is_connected());
        assert!(peer.is_direct());

        peer.set_distance(2);
        assert!(peer.is_connected());
        assert!(!peer.is_direct());

        peer.set_distance(DISTANCE_MAX);
        assert!(!peer.is_connected());
    }
}
