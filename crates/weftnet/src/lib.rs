//! # weftnet
//!
//! Embeddable peer-to-peer overlay with typed publish/subscribe.
//!
//! Any node can join an existing mesh by contacting one member; the mesh
//! then tells it about everyone else, direct connections are established
//! where possible, and relaying bridges the gaps. Application code
//! subscribes by type and publishes values; framing, routing, fan-out,
//! liveness, and teardown are handled underneath (see `weftnet-core`).
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use weftnet::Network;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct ChatLine {
//!     from: String,
//!     text: String,
//! }
//! weftnet::declare_type!(ChatLine);
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let node = Network::with_port(4000);
//! node.add_data_listener::<ChatLine>(|event| {
//!     println!("<{}> {}", event.data.from, event.data.text);
//! });
//! node.connect("192.168.1.20".parse()?, 4000).await?;
//! node.send_object(&ChatLine {
//!     from: "me".into(),
//!     text: "hello mesh".into(),
//! })?;
//! # Ok(())
//! # }
//! ```

mod identity;
mod network;
mod object_builder;
mod packet;

pub use identity::{type_name_hash, NetType};
pub use network::{
    DataEvent, Network, NetworkListener, SendError, TypeListenerId, UnlistenedTypeListener,
};
pub use object_builder::DataListener;
pub use packet::Packet;

// The byte-level layer, re-exported for embedders that need it.
pub use weftnet_core::{
    ListenerId, NetworkConfig, NetworkError, Opcode, Peer, PeerId, PeerManager, DEFAULT_PORT,
    DISTANCE_MAX,
};
