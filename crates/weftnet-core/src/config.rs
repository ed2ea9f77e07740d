//! Construction-time configuration for a peer manager.
//!
//! Nothing here is persisted; every knob is supplied when the manager is
//! built and fixed for its lifetime (except the port, which may be changed
//! while the engine is stopped).

use std::time::Duration;

/// Default listening port of the overlay.
pub const DEFAULT_PORT: u16 = 3479;

/// Tuning knobs for the I/O engine and the overlay timers.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// TCP port the acceptor binds to. `0` lets the OS pick one; the chosen
    /// port is then visible through `PeerManager::port()`.
    pub port: u16,

    /// Capacity of the per-connection read buffer.
    pub buffer_size: usize,

    /// How often a `keep_alive` frame is sent to every connected peer.
    pub keep_alive_interval: Duration,

    /// How often the timeout sweep runs over all connections.
    pub timeout_sweep_interval: Duration,

    /// A peer from which no byte arrived for this long is force-closed by
    /// the next sweep.
    pub peer_timeout: Duration,

    /// Upper bound on a single frame's declared payload length. A peer
    /// announcing more is treated as misbehaving and disconnected.
    pub max_frame_size: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            buffer_size: 1024,
            keep_alive_interval: Duration::from_millis(5_000),
            timeout_sweep_interval: Duration::from_millis(54_000),
            peer_timeout: Duration::from_millis(120_000),
            max_frame_size: 1_048_576,
        }
    }
}

impl NetworkConfig {
    /// Default configuration on a specific port.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }
}
