//! The typed overlay API.
//!
//! [`Network`] wraps a `weftnet-core` [`PeerManager`] and interprets every
//! delivered payload as an 8-byte big-endian type hash followed by one
//! MessagePack value:
//!
//! ```text
//! +------------------+---------------------------+
//! | type hash (8 B)  | serialized value          |
//! +------------------+---------------------------+
//! ```
//!
//! The hash selects the per-type dispatch record registered through
//! [`Network::add_data_listener`]; the record deserializes the value once
//! and fans it out to its listeners. The distinguished packet hash marks a
//! batch of `(hash, value)` pairs dispatched in order.

use crate::identity::NetType;
use crate::object_builder::{AnyBuilder, DataListener, ListenerTable, ObjectBuilder};
use crate::packet::{packet_hash, Packet};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tracing::{debug, trace, warn};
use weftnet_core::{ListenerId, NetworkConfig, NetworkError, Peer, PeerId, PeerManager};

/// Failure to hand a value to the overlay: the value could not be encoded.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("failed to encode outgoing value: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

/// Identifies a typed data listener: the listener id together with the
/// hash of the type it listens to, so it can be removed without naming
/// the type again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeListenerId {
    id: ListenerId,
    type_hash: u64,
}

impl TypeListenerId {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn type_hash(&self) -> u64 {
        self.type_hash
    }
}

/// Everything a typed data listener receives for one value.
pub struct DataEvent<'a, T> {
    /// The network that delivered the value; usable for replying from
    /// inside the listener.
    pub network: &'a Network,
    /// The peer the value came from.
    pub source: &'a Peer,
    /// The deserialized value, shared by every listener of this type.
    pub data: &'a T,
    /// True when the value was addressed to this node alone (`send_to`),
    /// false when it was broadcast (`send_to_all`).
    pub is_private: bool,
    /// Id of the listener currently being invoked, so a listener can
    /// remove itself.
    pub listener_id: ListenerId,
}

/// Listener for connections and disconnections at the typed level.
pub type NetworkListener = Box<dyn FnMut(&Network, &Peer) + Send>;

/// Fallback invoked for values whose type hash has no registered
/// listener. Receives the raw remainder of the payload and the hash; when
/// it consumes exactly one MessagePack value, packet unwrapping continues
/// behind it.
pub type UnlistenedTypeListener =
    Box<dyn FnMut(&Network, &Peer, &mut &[u8], bool, u64) + Send>;

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

struct NetInner {
    manager: PeerManager,
    next_listener_id: AtomicU64,
    builders: Mutex<HashMap<u64, Arc<dyn AnyBuilder>>>,
    unlistened: Mutex<Option<UnlistenedTypeListener>>,
    co_listeners: Mutex<ListenerTable<NetworkListener>>,
    dc_listeners: Mutex<ListenerTable<NetworkListener>>,
}

/// Handle to one overlay node with typed publish/subscribe on top.
///
/// Cheap to clone; all clones drive the same node. See the crate docs for
/// a walkthrough.
#[derive(Clone)]
pub struct Network {
    inner: Arc<NetInner>,
}

impl Network {
    /// Creates a stopped node with the given configuration.
    pub fn new(config: NetworkConfig) -> Self {
        let inner = Arc::new(NetInner {
            manager: PeerManager::new(config),
            next_listener_id: AtomicU64::new(0),
            builders: Mutex::new(HashMap::new()),
            unlistened: Mutex::new(None),
            co_listeners: Mutex::new(ListenerTable::new()),
            dc_listeners: Mutex::new(ListenerTable::new()),
        });
        let network = Self { inner };
        network.register_manager_listeners();
        network
    }

    /// Creates a stopped node listening on `port` with default settings.
    pub fn with_port(port: u16) -> Self {
        Self::new(NetworkConfig::with_port(port))
    }

    /// Wires the manager-level events into the typed layer. The closures
    /// hold a weak reference; they go quiet once the last handle is gone.
    fn register_manager_listeners(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.manager.add_connection_listener(move |_, peer| {
            if let Some(network) = Network::upgrade(&weak) {
                network.fire_connection(peer);
            }
        });

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .manager
            .add_disconnection_listener(move |_, peer| {
                if let Some(network) = Network::upgrade(&weak) {
                    network.fire_disconnection(peer);
                }
            });

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .manager
            .add_data_listener(move |_, source, bytes, sent_to_all| {
                if let Some(network) = Network::upgrade(&weak) {
                    network.dispatch(source, bytes, sent_to_all);
                }
            });
    }

    fn upgrade(weak: &Weak<NetInner>) -> Option<Network> {
        weak.upgrade().map(|inner| Network { inner })
    }

    // -- lifecycle (delegated to the peer manager) --------------------------

    /// Starts a new mesh on the configured port.
    pub async fn awake(&self) -> Result<(), NetworkError> {
        self.inner.manager.awake().await
    }

    /// Starts a new mesh and returns once it shut down again.
    pub async fn sync_awake(&self) -> Result<(), NetworkError> {
        self.inner.manager.sync_awake().await
    }

    /// Joins an existing mesh through one known member.
    pub async fn connect(&self, address: IpAddr, port: u16) -> Result<(), NetworkError> {
        self.inner.manager.connect(address, port).await
    }

    /// Joins an existing mesh and returns once disconnected from it.
    pub async fn sync_connect(&self, address: IpAddr, port: u16) -> Result<(), NetworkError> {
        self.inner.manager.sync_connect(address, port).await
    }

    /// Leaves the mesh, announcing the departure to every neighbor.
    /// Idempotent.
    pub async fn disconnect(&self) {
        self.inner.manager.disconnect().await
    }

    /// Waits until the node has stopped.
    pub async fn join(&self) {
        self.inner.manager.join().await
    }

    pub fn is_running(&self) -> bool {
        self.inner.manager.is_running()
    }

    pub fn port(&self) -> u16 {
        self.inner.manager.port()
    }

    pub fn set_port(&self, port: u16) -> Result<(), NetworkError> {
        self.inner.manager.set_port(port)
    }

    /// The peer record describing this node.
    pub fn self_peer(&self) -> Peer {
        self.inner.manager.self_peer()
    }

    /// This node's identity.
    pub fn id(&self) -> PeerId {
        self.inner.manager.id()
    }

    /// Snapshot of every known peer.
    pub fn peers(&self) -> Vec<Peer> {
        self.inner.manager.peers()
    }

    /// Snapshot of one peer, if known.
    pub fn peer(&self, id: &PeerId) -> Option<Peer> {
        self.inner.manager.peer(id)
    }

    /// Installs the incoming-connection predicate; a candidate answered
    /// with `false` receives `connection_refused` and never reaches any
    /// listener.
    pub fn set_connection_predicate(&self, predicate: impl Fn(&Peer) -> bool + Send + 'static) {
        self.inner.manager.set_connection_predicate(predicate)
    }

    /// Removes the predicate, accepting any connection again.
    pub fn remove_connection_predicate(&self) {
        self.inner.manager.remove_connection_predicate()
    }

    // -- typed sending ------------------------------------------------------

    /// Sends a value to every member of the mesh.
    pub fn send_object<T: NetType + Serialize>(&self, value: &T) -> Result<(), SendError> {
        let bytes = encode_value(value)?;
        debug!(name = %T::universal_name(), "sending object to all");
        self.inner.manager.send_to_all(&bytes);
        Ok(())
    }

    /// Sends a value to one specific member, relayed if necessary.
    pub fn send_object_to<T: NetType + Serialize>(
        &self,
        peer: &Peer,
        value: &T,
    ) -> Result<(), SendError> {
        let bytes = encode_value(value)?;
        debug!(name = %T::universal_name(), peer = %peer.id(), "sending private object");
        self.inner.manager.send_to(peer, &bytes);
        Ok(())
    }

    /// Invokes the local listeners for `T` as if the value had arrived
    /// from the network, originating from this node. Does not touch the
    /// network and never calls the unlistened-type fallback.
    pub fn send_object_to_self<T: NetType + 'static>(&self, value: &T, is_private: bool) {
        let builder = self
            .inner
            .builders
            .lock()
            .unwrap()
            .get(&T::hash_code())
            .cloned();
        let Some(builder) = builder else {
            warn!(name = %T::universal_name(), "self-send for a type without listeners");
            return;
        };
        match builder.as_any().downcast_ref::<ObjectBuilder<T>>() {
            Some(typed) => {
                debug!(name = %T::universal_name(), "self-sending");
                let me = self.self_peer();
                typed.fire(self, &me, value, is_private);
            }
            None => warn!(
                name = %T::universal_name(),
                "type hash collision, self-send dropped"
            ),
        }
    }

    /// Broadcasts a packet of typed values.
    pub fn send_packet(&self, packet: &Packet) {
        debug!(items = packet.len(), "sending packet to all");
        self.inner.manager.send_to_all(&packet.wire_bytes());
    }

    /// Sends a packet of typed values to one specific member.
    pub fn send_packet_to(&self, peer: &Peer, packet: &Packet) {
        debug!(items = packet.len(), peer = %peer.id(), "sending private packet");
        self.inner.manager.send_to(peer, &packet.wire_bytes());
    }

    // -- listeners ----------------------------------------------------------

    /// Registers a listener fired for every newly connected peer.
    pub fn add_connection_listener(
        &self,
        listener: impl FnMut(&Network, &Peer) + Send + 'static,
    ) -> ListenerId {
        let id = self.next_listener_id();
        self.inner
            .co_listeners
            .lock()
            .unwrap()
            .add(id, Box::new(listener));
        id
    }

    /// Unregisters a connection listener. Safe to call from inside any
    /// listener; takes effect at the next event.
    pub fn remove_connection_listener(&self, id: ListenerId) -> bool {
        self.inner.co_listeners.lock().unwrap().remove(id)
    }

    /// Registers a listener fired once for every peer leaving the mesh.
    pub fn add_disconnection_listener(
        &self,
        listener: impl FnMut(&Network, &Peer) + Send + 'static,
    ) -> ListenerId {
        let id = self.next_listener_id();
        self.inner
            .dc_listeners
            .lock()
            .unwrap()
            .add(id, Box::new(listener));
        id
    }

    /// Unregisters a disconnection listener.
    pub fn remove_disconnection_listener(&self, id: ListenerId) -> bool {
        self.inner.dc_listeners.lock().unwrap().remove(id)
    }

    /// Registers a listener for values of type `T`, creating the dispatch
    /// record for `T` on first use.
    pub fn add_data_listener<T>(
        &self,
        listener: impl FnMut(DataEvent<'_, T>) + Send + 'static,
    ) -> TypeListenerId
    where
        T: NetType + DeserializeOwned + 'static,
    {
        let type_hash = T::hash_code();
        let id = self.next_listener_id();
        let mut builders = self.inner.builders.lock().unwrap();
        let entry = builders.entry(type_hash).or_insert_with(|| {
            debug!(name = %T::universal_name(), "registering type for listening");
            Arc::new(ObjectBuilder::<T>::new())
        });
        match entry.as_any().downcast_ref::<ObjectBuilder<T>>() {
            Some(builder) => {
                builder.add_listener(id, Box::new(listener) as DataListener<T>)
            }
            None => warn!(
                name = %T::universal_name(),
                "type hash collision, listener dropped"
            ),
        }
        TypeListenerId { id, type_hash }
    }

    /// Unregisters a data listener for `T`. Unlike the connection and
    /// disconnection variants this is also safe from within the listener
    /// itself. Removing an id under a type that was never registered is a
    /// warned no-op.
    pub fn remove_data_listener<T: NetType>(&self, id: ListenerId) -> bool {
        let builder = self
            .inner
            .builders
            .lock()
            .unwrap()
            .get(&T::hash_code())
            .cloned();
        match builder {
            Some(builder) => builder.remove_listener(id),
            None => {
                warn!(
                    name = %T::universal_name(),
                    id,
                    "removing a listener for a type that was never registered"
                );
                false
            }
        }
    }

    /// Unregisters a data listener by its [`TypeListenerId`], without
    /// naming the type.
    pub fn remove_data_listener_id(&self, id: TypeListenerId) -> bool {
        let builder = self
            .inner
            .builders
            .lock()
            .unwrap()
            .get(&id.type_hash())
            .cloned();
        match builder {
            Some(builder) => builder.remove_listener(id.id()),
            None => {
                warn!(
                    type_hash = id.type_hash(),
                    id = id.id(),
                    "removing a listener for an unknown type hash"
                );
                false
            }
        }
    }

    /// Sets the fallback for values of unregistered types.
    pub fn set_unlistened_type_listener(
        &self,
        listener: impl FnMut(&Network, &Peer, &mut &[u8], bool, u64) + Send + 'static,
    ) {
        *self.inner.unlistened.lock().unwrap() = Some(Box::new(listener));
    }

    /// Removes every listener of type `T`.
    pub fn clear_all<T: NetType>(&self) {
        let builder = self
            .inner
            .builders
            .lock()
            .unwrap()
            .get(&T::hash_code())
            .cloned();
        match builder {
            Some(builder) => builder.clear(),
            None => warn!(
                name = %T::universal_name(),
                "clearing listeners for a type that was never registered"
            ),
        }
    }

    /// Removes every data, connection, and disconnection listener and
    /// forgets all type registrations.
    pub fn clear_any(&self) {
        debug!("clearing all listeners");
        self.inner.co_listeners.lock().unwrap().clear();
        self.inner.dc_listeners.lock().unwrap().clear();
        self.inner.builders.lock().unwrap().clear();
    }

    fn next_listener_id(&self) -> ListenerId {
        self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed)
    }

    // -- dispatch -----------------------------------------------------------

    /// Entry point for raw payload delivered by the peer manager.
    fn dispatch(&self, source: &Peer, bytes: &[u8], sent_to_all: bool) {
        let Some(hash_bytes) = bytes.get(..8) else {
            warn!(
                peer = %source.id(),
                len = bytes.len(),
                "payload too short for a type hash, dropping"
            );
            return;
        };
        let hash = u64::from_be_bytes(hash_bytes.try_into().unwrap());
        let mut input = &bytes[8..];

        if hash == packet_hash() {
            trace!(peer = %source.id(), "unwrapping packet");
            while !input.is_empty() {
                let Some(inner_bytes) = input.get(..8) else {
                    warn!(peer = %source.id(), "truncated packet envelope, dropping the rest");
                    break;
                };
                let inner_hash = u64::from_be_bytes(inner_bytes.try_into().unwrap());
                input = &input[8..];
                if inner_hash == packet_hash() {
                    warn!(peer = %source.id(), "nested packet rejected");
                    break;
                }
                if !self.dispatch_one(inner_hash, &mut input, source, sent_to_all) {
                    break;
                }
            }
        } else {
            self.dispatch_one(hash, &mut input, source, sent_to_all);
        }
    }

    /// Dispatches one `(hash, value)` pair. Returns whether the value was
    /// consumed from `input`, which is what allows packet unwrapping to
    /// continue past it.
    fn dispatch_one(
        &self,
        hash: u64,
        input: &mut &[u8],
        source: &Peer,
        sent_to_all: bool,
    ) -> bool {
        let builder = self.inner.builders.lock().unwrap().get(&hash).cloned();
        match builder {
            Some(builder) => match builder.build_and_call(self, source, input, sent_to_all) {
                Ok(true) => true,
                Ok(false) => self.call_unlistened(hash, input, source, sent_to_all),
                Err(e) => {
                    warn!(
                        type_hash = hash,
                        peer = %source.id(),
                        error = %e,
                        "failed to deserialize incoming value"
                    );
                    false
                }
            },
            None => self.call_unlistened(hash, input, source, sent_to_all),
        }
    }

    /// Offers a value of an unregistered type to the fallback listener.
    fn call_unlistened(
        &self,
        hash: u64,
        input: &mut &[u8],
        source: &Peer,
        sent_to_all: bool,
    ) -> bool {
        let listener = self.inner.unlistened.lock().unwrap().take();
        match listener {
            Some(mut listener) => {
                warn!(type_hash = hash, "value of an unlistened type, calling default listener");
                listener(self, source, input, sent_to_all, hash);
                let mut slot = self.inner.unlistened.lock().unwrap();
                if slot.is_none() {
                    *slot = Some(listener);
                }
                true
            }
            None => {
                warn!(type_hash = hash, peer = %source.id(), "value of an unlistened type, dropping");
                false
            }
        }
    }

    // -- listener fan-out ---------------------------------------------------

    fn fire_connection(&self, peer: &Peer) {
        let mut active = {
            let mut table = self.inner.co_listeners.lock().unwrap();
            table.flush();
            table.take_active()
        };
        for (_, listener) in active.iter_mut() {
            listener(self, peer);
        }
        self.inner.co_listeners.lock().unwrap().restore(active);
    }

    fn fire_disconnection(&self, peer: &Peer) {
        let mut active = {
            let mut table = self.inner.dc_listeners.lock().unwrap();
            table.flush();
            table.take_active()
        };
        for (_, listener) in active.iter_mut() {
            listener(self, peer);
        }
        self.inner.dc_listeners.lock().unwrap().restore(active);
    }
}

fn encode_value<T: NetType + Serialize>(value: &T) -> Result<Vec<u8>, SendError> {
    let encoded = rmp_serde::to_vec_named(value)?;
    let mut out = Vec::with_capacity(8 + encoded.len());
    out.extend_from_slice(&T::hash_code().to_be_bytes());
    out.extend_from_slice(&encoded);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn stopped_network() -> Network {
        Network::with_port(0)
    }

    #[test]
    fn self_send_reaches_local_listeners() {
        let network = stopped_network();
        let seen: Arc<Mutex<Vec<(String, bool)>>> = Arc::default();
        let sink = Arc::clone(&seen);
        network.add_data_listener::<String>(move |event| {
            sink.lock()
                .unwrap()
                .push((event.data.clone(), event.is_private));
        });

        network.send_object_to_self(&"hello".to_string(), false);
        network.send_object_to_self(&"secret".to_string(), true);

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![("hello".to_string(), false), ("secret".to_string(), true)]
        );
    }

    #[test]
    fn self_send_source_is_the_local_peer() {
        let network = stopped_network();
        let local = network.id();
        let seen: Arc<Mutex<Vec<PeerId>>> = Arc::default();
        let sink = Arc::clone(&seen);
        network.add_data_listener::<i32>(move |event| {
            sink.lock().unwrap().push(event.source.id());
        });
        network.send_object_to_self(&7i32, false);
        assert_eq!(*seen.lock().unwrap(), vec![local]);
    }

    #[test]
    fn self_send_without_listeners_is_a_no_op() {
        let network = stopped_network();
        network.send_object_to_self(&3u8, false);
    }

    #[test]
    fn listener_can_remove_itself_from_its_callback() {
        let network = stopped_network();
        let count = Arc::new(Mutex::new(0u32));
        let sink = Arc::clone(&count);
        network.add_data_listener::<u32>(move |event| {
            *sink.lock().unwrap() += 1;
            let me = event.listener_id;
            event.network.remove_data_listener::<u32>(me);
        });

        network.send_object_to_self(&1u32, false);
        // The removal took effect at the message boundary.
        network.send_object_to_self(&2u32, false);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn listener_can_add_a_listener_from_its_callback() {
        let network = stopped_network();
        let second_calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&second_calls);
        let armed = Arc::new(Mutex::new(false));
        let armed_flag = Arc::clone(&armed);
        network.add_data_listener::<u32>(move |event| {
            let mut armed = armed_flag.lock().unwrap();
            if !*armed {
                *armed = true;
                let counter = Arc::clone(&counter);
                event.network.add_data_listener::<u32>(move |_| {
                    *counter.lock().unwrap() += 1;
                });
            }
        });

        network.send_object_to_self(&1u32, false);
        assert_eq!(*second_calls.lock().unwrap(), 0, "not visible yet");
        network.send_object_to_self(&2u32, false);
        assert_eq!(*second_calls.lock().unwrap(), 1, "visible at the next message");
    }

    #[test]
    fn removing_a_pending_listener_cancels_it() {
        let network = stopped_network();
        let calls = Arc::new(Mutex::new(0u32));
        let sink = Arc::clone(&calls);
        let id = network.add_data_listener::<u64>(move |_| {
            *sink.lock().unwrap() += 1;
        });
        assert!(network.remove_data_listener_id(id));
        network.send_object_to_self(&1u64, false);
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn removing_under_an_unregistered_type_is_a_warned_no_op() {
        let network = stopped_network();
        assert!(!network.remove_data_listener::<f64>(123));
    }

    #[test]
    fn clear_all_drops_one_type_only() {
        let network = stopped_network();
        let ints = Arc::new(Mutex::new(0u32));
        let strings = Arc::new(Mutex::new(0u32));
        let int_sink = Arc::clone(&ints);
        let string_sink = Arc::clone(&strings);
        network.add_data_listener::<i32>(move |_| *int_sink.lock().unwrap() += 1);
        network.add_data_listener::<String>(move |_| *string_sink.lock().unwrap() += 1);

        network.clear_all::<i32>();
        network.send_object_to_self(&1i32, false);
        network.send_object_to_self(&"x".to_string(), false);

        assert_eq!(*ints.lock().unwrap(), 0);
        assert_eq!(*strings.lock().unwrap(), 1);
    }

    #[test]
    fn clear_any_forgets_all_registrations() {
        let network = stopped_network();
        let calls = Arc::new(Mutex::new(0u32));
        let sink = Arc::clone(&calls);
        network.add_data_listener::<i32>(move |_| *sink.lock().unwrap() += 1);
        network.clear_any();
        network.send_object_to_self(&1i32, false);
        assert_eq!(*calls.lock().unwrap(), 0);
    }
}
