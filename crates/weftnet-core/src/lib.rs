//! # weftnet-core
//!
//! Byte-level layer of the weftnet peer-to-peer overlay: the wire codec,
//! the TCP I/O engine, and the peer manager with its membership table,
//! distance-vector routing, and bridged (relayed) delivery.
//!
//! Most applications want the typed API in the `weftnet` crate instead;
//! this crate is the right level when raw byte payloads are enough.
//!
//! ```no_run
//! use weftnet_core::{NetworkConfig, PeerManager};
//!
//! # async fn example() -> Result<(), weftnet_core::NetworkError> {
//! let node = PeerManager::new(NetworkConfig::with_port(4000));
//! node.add_data_listener(|_, source, bytes, broadcast| {
//!     println!("{} bytes from {source} (broadcast: {broadcast})", bytes.len());
//! });
//! node.awake().await?;
//! node.send_to_all(b"hello mesh");
//! # Ok(())
//! # }
//! ```

pub mod config;
mod engine;
pub mod error;
pub mod manager;
pub mod types;
pub mod wire;

pub use config::{NetworkConfig, DEFAULT_PORT};
pub use error::NetworkError;
pub use manager::{
    ConnectionListener, ConnectionPredicate, DataListener, DisconnectionListener, PeerManager,
};
pub use types::{ListenerId, Peer, PeerId, DISTANCE_MAX};
pub use wire::{Opcode, IO_PROTOCOL_ID_1, IO_PROTOCOL_ID_2};
