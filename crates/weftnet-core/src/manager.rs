//! Peer manager: membership, routing, and the overlay protocol.
//!
//! One event-loop task owns every piece of protocol state: the membership
//! table, the routing maps, the per-peer socket handles, and the listener
//! registries. Socket tasks, timers, and the public API all talk to it
//! through a single mpsc channel, so state mutation is strictly
//! single-threaded while the API stays callable from anywhere.
//!
//! # Event Loop
//!
//! ```text
//! loop {
//!     select! {
//!         event (frame / handshake / command) => dispatch
//!         keep-alive tick  => probe every connected peer
//!         sweep tick       => drop peers silent for too long
//!     }
//! }
//! ```
//!
//! Frames carry one of the fifteen opcodes of [`Opcode`]; the handlers in
//! this module implement their semantics, including mesh bootstrap over
//! `retrieve_peers`/`peers_list`, bridged delivery over
//! `forward_to`/`forwarding_to`, and distance-vector maintenance over
//! `update_distance`/`retrieve_distance`.

use crate::config::NetworkConfig;
use crate::engine::{self, DialContext, Event, Origin, PeerIo};
use crate::error::NetworkError;
use crate::types::{local_peer_record, ListenerId, Peer, PeerId, DISTANCE_MAX};
use crate::wire::{self, Opcode, PeerEndpoint, WireError};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Listener for newly connected peers (direct or bridged).
pub type ConnectionListener = Box<dyn FnMut(&PeerManager, &Peer) + Send>;

/// Listener for peers leaving the mesh. Fires exactly once per peer.
pub type DisconnectionListener = Box<dyn FnMut(&PeerManager, &Peer) + Send>;

/// Listener for application payload. Receives the sending peer, the raw
/// bytes, and whether they were broadcast (`true`) or addressed to this
/// node alone (`false`).
pub type DataListener = Box<dyn FnMut(&PeerManager, &Peer, &[u8], bool) + Send>;

/// Filter consulted for every handshaken incoming connection. Returning
/// `false` sends `connection_refused` and drops the peer before any
/// listener fires.
pub type ConnectionPredicate = Box<dyn Fn(&Peer) -> bool + Send>;

/// Requests the public API enqueues onto the event loop.
pub(crate) enum Command {
    SendToAll(Vec<u8>),
    SendTo(PeerId, Vec<u8>),
    AddConnectionListener(ListenerId, ConnectionListener),
    RemoveConnectionListener(ListenerId),
    AddDisconnectionListener(ListenerId, DisconnectionListener),
    RemoveDisconnectionListener(ListenerId),
    AddDataListener(ListenerId, DataListener),
    RemoveDataListener(ListenerId),
    ClearConnectionListeners,
    ClearDisconnectionListeners,
    ClearDataListeners,
    Disconnect,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State reachable from any thread: configuration, identity, and the
/// membership snapshot. Only the event loop ever writes `peers`.
pub(crate) struct Shared {
    pub(crate) config: NetworkConfig,
    pub(crate) local_id: PeerId,
    port: AtomicU16,
    running: AtomicBool,
    peers: RwLock<HashMap<PeerId, Peer>>,
    predicate: Mutex<Option<ConnectionPredicate>>,
    next_listener_id: AtomicU64,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    engine: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    pub(crate) fn port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    /// Applies the connection predicate to an incoming candidate.
    pub(crate) fn accepts(&self, candidate: &Peer) -> bool {
        match self.predicate.lock().unwrap().as_ref() {
            Some(predicate) => predicate(candidate),
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// PeerManager
// ---------------------------------------------------------------------------

/// Handle to one overlay node.
///
/// Cheap to clone; all clones drive the same instance. Methods may be
/// called from any thread or task. State-changing calls are enqueued onto
/// the manager's event loop, so their effects become visible at the next
/// loop iteration rather than on return.
#[derive(Clone)]
pub struct PeerManager {
    shared: Arc<Shared>,
}

impl PeerManager {
    /// Creates a stopped manager with a freshly generated identity.
    pub fn new(config: NetworkConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            local_id: PeerId::generate(),
            port: AtomicU16::new(config.port),
            config,
            running: AtomicBool::new(false),
            peers: RwLock::new(HashMap::new()),
            predicate: Mutex::new(None),
            next_listener_id: AtomicU64::new(0),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            engine: Mutex::new(None),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// The peer record describing this node: its id, the loopback address,
    /// and the listening port.
    pub fn self_peer(&self) -> Peer {
        local_peer_record(self.shared.local_id, self.shared.port())
    }

    /// This node's identity.
    pub fn id(&self) -> PeerId {
        self.shared.local_id
    }

    /// Snapshot of every known peer, this node excluded. Entries at
    /// [`DISTANCE_MAX`] are awaiting route rediscovery.
    pub fn peers(&self) -> Vec<Peer> {
        self.shared.peers.read().unwrap().values().cloned().collect()
    }

    /// Snapshot of one peer, if known.
    pub fn peer(&self, id: &PeerId) -> Option<Peer> {
        self.shared.peers.read().unwrap().get(id).cloned()
    }

    /// True while the event loop is running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// The listening port: the configured one while stopped, the actually
    /// bound one once awake (relevant when configured as 0).
    pub fn port(&self) -> u16 {
        self.shared.port()
    }

    /// Changes the listening port for the next start.
    pub fn set_port(&self, port: u16) -> Result<(), NetworkError> {
        if self.is_running() {
            return Err(NetworkError::InvalidState(
                "cannot change the port while running",
            ));
        }
        self.shared.port.store(port, Ordering::Release);
        Ok(())
    }

    /// Installs the incoming-connection predicate.
    pub fn set_connection_predicate(
        &self,
        predicate: impl Fn(&Peer) -> bool + Send + 'static,
    ) {
        *self.shared.predicate.lock().unwrap() = Some(Box::new(predicate));
    }

    /// Removes the predicate, going back to accepting any connection.
    pub fn remove_connection_predicate(&self) {
        *self.shared.predicate.lock().unwrap() = None;
    }

    // -- lifecycle ----------------------------------------------------------

    /// Starts a new mesh: binds the acceptors and spawns the event loop.
    ///
    /// Fails with `InvalidState` when already running (or already shut
    /// down; an instance runs at most once), and with a bind error when no
    /// acceptor could be created.
    pub async fn awake(&self) -> Result<(), NetworkError> {
        let events_rx = self
            .shared
            .events_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(NetworkError::InvalidState("already started"))?;

        let (listeners, port) = match engine::bind_acceptors(self.shared.port()).await {
            Ok(bound) => bound,
            Err(e) => {
                *self.shared.events_rx.lock().unwrap() = Some(events_rx);
                return Err(e);
            }
        };
        self.shared.port.store(port, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);
        info!(id = %self.shared.local_id, port, "overlay awake");

        let mut acceptors = Vec::with_capacity(listeners.len());
        for listener in listeners {
            acceptors.push(tokio::spawn(engine::accept_loop(
                listener,
                Arc::clone(&self.shared),
                self.shared.events_tx.clone(),
            )));
        }

        let run = Run::new(self.clone(), acceptors);
        let handle = tokio::spawn(run.run(events_rx));
        *self.shared.engine.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Like [`awake`](Self::awake), but returns only once the mesh shut
    /// down again.
    pub async fn sync_awake(&self) -> Result<(), NetworkError> {
        self.awake().await?;
        self.join().await;
        Ok(())
    }

    /// Joins an existing mesh through one known member.
    ///
    /// Starts the engine, performs the handshake with the first contact,
    /// and kicks off the `retrieve_peers` bootstrap. Not allowed while
    /// already running. When the first contact cannot be reached, the
    /// engine is shut down again and the error returned.
    pub async fn connect(&self, address: IpAddr, port: u16) -> Result<(), NetworkError> {
        if self.is_running() {
            return Err(NetworkError::InvalidState("already running"));
        }
        self.awake().await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        tokio::spawn(engine::dial(
            Arc::clone(&self.shared),
            self.shared.events_tx.clone(),
            address,
            port,
            None,
            DialContext::Api { reply: reply_tx },
        ));

        match reply_rx.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                self.disconnect().await;
                self.join().await;
                Err(e)
            }
            Err(_) => Err(NetworkError::InvalidState("engine stopped during connect")),
        }
    }

    /// Like [`connect`](Self::connect), but returns only once disconnected
    /// from the mesh (or with the connection error).
    pub async fn sync_connect(&self, address: IpAddr, port: u16) -> Result<(), NetworkError> {
        self.connect(address, port).await?;
        self.join().await;
        Ok(())
    }

    /// Leaves the mesh: announces the departure to every neighbor, then
    /// closes all sockets and stops the event loop. Idempotent; returns
    /// immediately when not running.
    pub async fn disconnect(&self) {
        if !self.is_running() {
            return;
        }
        let _ = self
            .shared
            .events_tx
            .send(Event::Command(Command::Disconnect));
    }

    /// Waits until the event loop has stopped. Returns immediately when it
    /// was never started.
    pub async fn join(&self) {
        let handle = self.shared.engine.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    // -- sending ------------------------------------------------------------

    /// Sends raw bytes to every member of the mesh.
    pub fn send_to_all(&self, data: &[u8]) {
        let _ = self
            .shared
            .events_tx
            .send(Event::Command(Command::SendToAll(data.to_vec())));
    }

    /// Sends raw bytes to one specific member, relayed over a bridge when
    /// no direct link exists.
    pub fn send_to(&self, peer: &Peer, data: &[u8]) {
        let _ = self
            .shared
            .events_tx
            .send(Event::Command(Command::SendTo(peer.id(), data.to_vec())));
    }

    // -- listeners ----------------------------------------------------------

    /// Registers a listener fired for every newly connected peer.
    pub fn add_connection_listener(
        &self,
        listener: impl FnMut(&PeerManager, &Peer) + Send + 'static,
    ) -> ListenerId {
        let id = self.next_listener_id();
        self.command(Command::AddConnectionListener(id, Box::new(listener)));
        id
    }

    /// Unregisters a connection listener. Takes effect at the next event
    /// loop iteration.
    pub fn remove_connection_listener(&self, id: ListenerId) {
        self.command(Command::RemoveConnectionListener(id));
    }

    /// Registers a listener fired once for every peer leaving the mesh.
    pub fn add_disconnection_listener(
        &self,
        listener: impl FnMut(&PeerManager, &Peer) + Send + 'static,
    ) -> ListenerId {
        let id = self.next_listener_id();
        self.command(Command::AddDisconnectionListener(id, Box::new(listener)));
        id
    }

    /// Unregisters a disconnection listener.
    pub fn remove_disconnection_listener(&self, id: ListenerId) {
        self.command(Command::RemoveDisconnectionListener(id));
    }

    /// Registers a listener for application payload.
    pub fn add_data_listener(
        &self,
        listener: impl FnMut(&PeerManager, &Peer, &[u8], bool) + Send + 'static,
    ) -> ListenerId {
        let id = self.next_listener_id();
        self.command(Command::AddDataListener(id, Box::new(listener)));
        id
    }

    /// Unregisters a data listener.
    pub fn remove_data_listener(&self, id: ListenerId) {
        self.command(Command::RemoveDataListener(id));
    }

    /// Removes all data listeners.
    pub fn clear_data_listeners(&self) {
        self.command(Command::ClearDataListeners);
    }

    /// Removes all connection listeners.
    pub fn clear_connection_listeners(&self) {
        self.command(Command::ClearConnectionListeners);
    }

    /// Removes all disconnection listeners.
    pub fn clear_disconnection_listeners(&self) {
        self.command(Command::ClearDisconnectionListeners);
    }

    /// Removes every listener of every kind.
    pub fn clear_any(&self) {
        self.clear_data_listeners();
        self.clear_connection_listeners();
        self.clear_disconnection_listeners();
    }

    fn next_listener_id(&self) -> ListenerId {
        self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed)
    }

    fn command(&self, command: Command) {
        let _ = self.shared.events_tx.send(Event::Command(command));
    }
}

// ---------------------------------------------------------------------------
// Event loop state
// ---------------------------------------------------------------------------

/// The local node as the routing tables see it.
struct LocalPeer {
    peer: Peer,
    /// For every reachable peer: the directly connected neighbor traffic
    /// toward it goes through. Direct peers map to themselves.
    path_via: HashMap<PeerId, PeerId>,
    /// `bridging_for[a]` holds the peers we relay a's traffic to and from;
    /// the relation is kept symmetric.
    bridging_for: HashMap<PeerId, HashSet<PeerId>>,
}

/// A failed dial waiting for the mesh to answer with `forwarding_to` or
/// `cant_connect`.
struct PendingDial {
    endpoint: PeerEndpoint,
    via: PeerId,
}

struct Run {
    shared: Arc<Shared>,
    manager: PeerManager,
    local: LocalPeer,
    /// Socket-side state per directly connected peer, keyed by id.
    io: HashMap<PeerId, PeerIo>,
    pending: HashMap<PeerId, PendingDial>,
    co_listeners: HashMap<ListenerId, ConnectionListener>,
    dc_listeners: HashMap<ListenerId, DisconnectionListener>,
    data_listeners: HashMap<ListenerId, DataListener>,
    acceptors: Vec<JoinHandle<()>>,
}

impl Run {
    fn new(manager: PeerManager, acceptors: Vec<JoinHandle<()>>) -> Self {
        let shared = Arc::clone(&manager.shared);
        let local = LocalPeer {
            peer: local_peer_record(shared.local_id, shared.port()),
            path_via: HashMap::new(),
            bridging_for: HashMap::new(),
        };
        Self {
            shared,
            manager,
            local,
            io: HashMap::new(),
            pending: HashMap::new(),
            co_listeners: HashMap::new(),
            dc_listeners: HashMap::new(),
            data_listeners: HashMap::new(),
            acceptors,
        }
    }

    fn local_id(&self) -> PeerId {
        self.local.peer.id()
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        let mut keep_alive = interval(self.shared.config.keep_alive_interval);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = interval(self.shared.config.timeout_sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => {
                        if self.handle_event(event).is_break() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = keep_alive.tick() => self.emit_keep_alives(),
                _ = sweep.tick() => self.sweep_timeouts(),
            }
        }
        self.shutdown().await;
    }

    fn handle_event(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Established {
                stream,
                address,
                hello,
                origin,
            } => self.on_established(stream, address, hello, origin),
            Event::DialFailed {
                address,
                port,
                expected,
                ctx,
                reason,
            } => self.on_dial_failed(address, port, expected, ctx, reason),
            Event::Frame {
                from,
                opcode,
                payload,
            } => self.on_frame(from, opcode, payload),
            Event::Closed { from } => self.process_disconnect(from, true),
            Event::Command(command) => return self.on_command(command),
        }
        ControlFlow::Continue(())
    }

    // -- connection management ---------------------------------------------

    fn on_established(
        &mut self,
        stream: tokio::net::TcpStream,
        address: IpAddr,
        hello: wire::Hello,
        origin: Origin,
    ) {
        let id = hello.id;
        if id == self.local_id() || self.io.contains_key(&id) {
            // Self-connections are dropped; for a duplicate link the
            // existing connection keeps serving.
            debug!(peer = %id, "dropping redundant connection");
            if let Origin::Dialed(DialContext::Api { reply }) = origin {
                let _ = reply.send(Ok(id));
            }
            return;
        }

        let io = engine::spawn_peer_tasks(
            stream,
            id,
            self.shared.events_tx.clone(),
            self.shared.config.buffer_size,
            self.shared.config.max_frame_size,
        );
        self.io.insert(id, io);
        self.pending.remove(&id);

        let newly = {
            let mut peers = self.shared.peers.write().unwrap();
            match peers.entry(id) {
                Entry::Occupied(mut entry) => {
                    let peer = entry.get_mut();
                    let newly = !peer.is_connected();
                    peer.set_distance(0);
                    peer.set_endpoint(address, hello.port);
                    newly
                }
                Entry::Vacant(entry) => {
                    entry.insert(Peer::new(id, address, hello.port, 0));
                    true
                }
            }
        };

        // A direct link supersedes any bridge previously relaying for us.
        let old_via = self.local.path_via.insert(id, id);
        if let Some(via) = old_via {
            if via != id {
                debug!(peer = %id, bridge = %via, "direct link replaces bridge");
                self.send_frame(&via, Opcode::StopForwarding, &wire::id_payload(&id));
            }
        }

        info!(peer = %id, %address, port = hello.port, "peer connected");
        if newly {
            if let Some(peer) = self.peer_snapshot(&id) {
                self.fire_connection(&peer);
            }
        }

        if let Origin::Dialed(DialContext::Api { reply }) = origin {
            // First contact: ask it for the rest of the mesh.
            self.send_frame(&id, Opcode::RetrievePeers, &[]);
            let _ = reply.send(Ok(id));
        }
    }

    fn on_dial_failed(
        &mut self,
        address: IpAddr,
        port: u16,
        expected: Option<PeerId>,
        ctx: DialContext,
        reason: String,
    ) {
        match ctx {
            DialContext::Api { reply } => {
                let _ = reply.send(Err(NetworkError::ConnectionFailed {
                    address,
                    port,
                    reason,
                }));
            }
            DialContext::Bootstrap { via } => {
                // Cannot reach the advertised peer directly; ask the peer
                // that advertised it to find us a bridge.
                let Some(id) = expected else { return };
                debug!(peer = %id, %via, "direct connection failed, requesting a bridge");
                self.pending.insert(
                    id,
                    PendingDial {
                        endpoint: PeerEndpoint { id, address, port },
                        via,
                    },
                );
                let payload = wire::connect_to_payload(&PeerEndpoint { id, address, port });
                self.send_frame(&via, Opcode::ConnectTo, &payload);
            }
            DialContext::Requested { via } => {
                // The reverse connection ordered by a bridge failed as
                // well; register the mirror relay with that bridge.
                let Some(id) = expected else { return };
                debug!(peer = %id, %via, "reverse connection failed, registering bridge");
                self.pending.insert(
                    id,
                    PendingDial {
                        endpoint: PeerEndpoint { id, address, port },
                        via,
                    },
                );
                self.send_frame(&via, Opcode::ForwardTo, &wire::id_payload(&id));
            }
        }
    }

    /// Removes one peer and repairs everything that depended on it. The
    /// membership entry is the once-only guard: a second call for the same
    /// peer finds nothing and returns.
    fn process_disconnect(&mut self, id: PeerId, locally_initiated: bool) {
        if let Some(io) = self.io.remove(&id) {
            io.abort();
        }
        let removed = self.shared.peers.write().unwrap().remove(&id);
        let Some(peer) = removed else {
            return;
        };
        info!(peer = %peer, "peer disconnected");

        self.local.path_via.remove(&id);

        // Peers routed through the lost one become unreachable until a
        // neighbor answers retrieve_distance with a fresh route.
        let orphans: Vec<PeerId> = self
            .local
            .path_via
            .iter()
            .filter(|(_, via)| **via == id)
            .map(|(q, _)| *q)
            .collect();
        if !orphans.is_empty() {
            let mut peers = self.shared.peers.write().unwrap();
            for q in &orphans {
                if let Some(p) = peers.get_mut(q) {
                    p.set_distance(DISTANCE_MAX);
                }
            }
        }
        for q in &orphans {
            self.local.path_via.remove(q);
            let payload = wire::id_payload(q);
            let neighbors: Vec<PeerId> = self.io.keys().copied().collect();
            for n in neighbors {
                self.send_frame(&n, Opcode::RetrieveDistance, &payload);
            }
        }

        self.local.bridging_for.remove(&id);
        for set in self.local.bridging_for.values_mut() {
            set.remove(&id);
        }
        self.local.bridging_for.retain(|_, set| !set.is_empty());
        self.pending.retain(|_, dial| dial.via != id);

        self.fire_disconnection(&peer);

        if locally_initiated {
            let payload = wire::id_payload(&id);
            let neighbors: Vec<PeerId> = self.io.keys().copied().collect();
            for n in neighbors {
                self.send_frame(&n, Opcode::PeerDisconnection, &payload);
            }
        }
    }

    // -- frame dispatch -----------------------------------------------------

    fn on_frame(&mut self, from: PeerId, opcode: Opcode, payload: Vec<u8>) {
        if let Some(io) = self.io.get_mut(&from) {
            io.last_seen = tokio::time::Instant::now();
        } else {
            // Raced with a disconnect; the peer is already gone.
            return;
        }

        let result = match opcode {
            Opcode::SendTo => self.on_send_to(from, &payload),
            Opcode::SendToAll => self.on_send_to_all(from, &payload),
            Opcode::ForwardTo => self.on_forward_to(from, &payload),
            Opcode::StopForwarding => self.on_stop_forwarding(from, &payload),
            Opcode::ForwardingTo => self.on_forwarding_to(from, &payload),
            Opcode::ConnectTo => self.on_connect_to(from, &payload),
            Opcode::CantConnect => self.on_cant_connect(from, &payload),
            Opcode::UpdateDistance => self.on_update_distance(from, &payload),
            Opcode::RetrieveDistance => self.on_retrieve_distance(from, &payload),
            Opcode::RetrievePeers => {
                self.on_retrieve_peers(from);
                Ok(())
            }
            Opcode::PeersList => self.on_peers_list(from, &payload),
            Opcode::PeerDisconnection => self.on_peer_disconnection(from, &payload),
            Opcode::KeepAlive => {
                trace!(peer = %from, "keep_alive");
                Ok(())
            }
            Opcode::ConnectionAccepted | Opcode::ConnectionRefused => {
                debug!(peer = %from, "stray handshake answer, ignoring");
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(peer = %from, opcode = ?opcode, error = %e, "malformed frame, disconnecting peer");
            self.process_disconnect(from, true);
        }
    }

    fn on_send_to(&mut self, from: PeerId, payload: &[u8]) -> Result<(), WireError> {
        let (sender, target, data_offset) = wire::parse_send_to(payload)?;
        if target == self.local_id() {
            let data = wire::restore(&payload[data_offset..])?;
            let source = self.peer_or_placeholder(sender);
            self.fire_data(&source, &data, false);
        } else if let Some(next) = self.next_hop(&target) {
            trace!(%target, via = %next, "relaying send_to");
            self.send_frame(&next, Opcode::SendTo, payload);
        } else {
            trace!(%target, peer = %from, "no route for send_to, dropping");
        }
        Ok(())
    }

    fn on_send_to_all(&mut self, from: PeerId, payload: &[u8]) -> Result<(), WireError> {
        let data = wire::restore(payload)?;
        self.forward_if_needed(from, Opcode::SendToAll, payload);
        let source = self.peer_or_placeholder(from);
        self.fire_data(&source, &data, true);
        Ok(())
    }

    fn on_forward_to(&mut self, from: PeerId, payload: &[u8]) -> Result<(), WireError> {
        let subject = wire::parse_id_payload(payload)?;
        if subject == self.local_id() || subject == from {
            return Ok(());
        }
        let distance = self.distance_of(&subject);
        if distance == DISTANCE_MAX {
            self.send_frame(&from, Opcode::CantConnect, &wire::id_payload(&subject));
        } else {
            debug!(for_peer = %from, toward = %subject, "bridging");
            self.local
                .bridging_for
                .entry(subject)
                .or_default()
                .insert(from);
            self.local
                .bridging_for
                .entry(from)
                .or_default()
                .insert(subject);
            self.send_frame(
                &from,
                Opcode::ForwardingTo,
                &wire::distance_payload(distance, &subject),
            );
        }
        Ok(())
    }

    fn on_stop_forwarding(&mut self, from: PeerId, payload: &[u8]) -> Result<(), WireError> {
        let subject = wire::parse_id_payload(payload)?;
        debug!(for_peer = %from, toward = %subject, "bridge released");
        for (a, b) in [(from, subject), (subject, from)] {
            if let Some(set) = self.local.bridging_for.get_mut(&a) {
                set.remove(&b);
                if set.is_empty() {
                    self.local.bridging_for.remove(&a);
                }
            }
        }
        Ok(())
    }

    fn on_forwarding_to(&mut self, from: PeerId, payload: &[u8]) -> Result<(), WireError> {
        let (distance, subject) = wire::parse_distance_payload(payload)?;
        if let Some(pending) = self.pending.remove(&subject) {
            if distance >= DISTANCE_MAX - 1 {
                debug!(peer = %subject, "bridge reports the peer unreachable");
                return Ok(());
            }
            self.register_bridged(subject, pending.endpoint, distance + 1, from);
        } else {
            // Already known; at most an improved route.
            self.improve_route(subject, distance, from);
        }
        Ok(())
    }

    fn on_connect_to(&mut self, from: PeerId, payload: &[u8]) -> Result<(), WireError> {
        let endpoint = wire::parse_connect_to(payload)?;
        if endpoint.id == self.local_id() || endpoint.id == from {
            return Ok(());
        }

        let distance = self.distance_of(&endpoint.id);
        if distance != DISTANCE_MAX {
            // We already reach the subject: offer ourselves as the bridge,
            // and tell the subject to try the requester from its side.
            self.send_frame(
                &from,
                Opcode::ForwardingTo,
                &wire::distance_payload(distance, &endpoint.id),
            );
            if let Some(requester) = self.peer_snapshot(&from) {
                let back = PeerEndpoint {
                    id: from,
                    address: requester.address(),
                    port: requester.port(),
                };
                if let Some(next) = self.next_hop(&endpoint.id) {
                    self.send_frame(&next, Opcode::ConnectTo, &wire::connect_to_payload(&back));
                }
            }
        } else if !self.pending.contains_key(&endpoint.id) && !self.io.contains_key(&endpoint.id) {
            // Unknown subject: attempt the connection ourselves.
            debug!(peer = %endpoint.id, ordered_by = %from, "attempting requested connection");
            tokio::spawn(engine::dial(
                Arc::clone(&self.shared),
                self.shared.events_tx.clone(),
                endpoint.address,
                endpoint.port,
                Some(endpoint.id),
                DialContext::Requested { via: from },
            ));
        }
        Ok(())
    }

    fn on_cant_connect(&mut self, from: PeerId, payload: &[u8]) -> Result<(), WireError> {
        let subject = wire::parse_id_payload(payload)?;
        if self.pending.remove(&subject).is_some() {
            info!(peer = %subject, via = %from, "peer unreachable, dropping");
        }
        Ok(())
    }

    fn on_update_distance(&mut self, from: PeerId, payload: &[u8]) -> Result<(), WireError> {
        let (distance, subject) = wire::parse_distance_payload(payload)?;
        self.improve_route(subject, distance, from);
        Ok(())
    }

    fn on_retrieve_distance(&mut self, from: PeerId, payload: &[u8]) -> Result<(), WireError> {
        let subject = wire::parse_id_payload(payload)?;
        let distance = self.distance_of(&subject);
        self.send_frame(
            &from,
            Opcode::UpdateDistance,
            &wire::distance_payload(distance, &subject),
        );
        Ok(())
    }

    fn on_retrieve_peers(&mut self, from: PeerId) {
        let list: Vec<PeerEndpoint> = {
            let peers = self.shared.peers.read().unwrap();
            peers
                .values()
                .filter(|p| p.id() != from && p.is_connected())
                .map(|p| PeerEndpoint {
                    id: p.id(),
                    address: p.address(),
                    port: p.port(),
                })
                .collect()
        };
        debug!(peer = %from, count = list.len(), "answering retrieve_peers");
        self.send_frame(&from, Opcode::PeersList, &wire::peers_list_payload(list.iter()));
    }

    fn on_peers_list(&mut self, from: PeerId, payload: &[u8]) -> Result<(), WireError> {
        let list = wire::parse_peers_list(payload)?;
        debug!(peer = %from, count = list.len(), "received peers_list");
        for endpoint in list {
            if endpoint.id == self.local_id()
                || self.distance_of(&endpoint.id) != DISTANCE_MAX
                || self.pending.contains_key(&endpoint.id)
                || self.io.contains_key(&endpoint.id)
            {
                continue;
            }
            tokio::spawn(engine::dial(
                Arc::clone(&self.shared),
                self.shared.events_tx.clone(),
                endpoint.address,
                endpoint.port,
                Some(endpoint.id),
                DialContext::Bootstrap { via: from },
            ));
        }
        Ok(())
    }

    fn on_peer_disconnection(&mut self, from: PeerId, payload: &[u8]) -> Result<(), WireError> {
        let subject = wire::parse_id_payload(payload)?;
        if subject == self.local_id() {
            return Ok(());
        }
        if self.shared.peers.read().unwrap().contains_key(&subject) {
            self.forward_if_needed(from, Opcode::PeerDisconnection, payload);
            self.process_disconnect(subject, false);
        }
        Ok(())
    }

    // -- commands -----------------------------------------------------------

    fn on_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::SendToAll(data) => {
                let payload = wire::send_to_all_payload(&data);
                let neighbors: Vec<PeerId> = self.io.keys().copied().collect();
                for n in neighbors {
                    self.send_frame(&n, Opcode::SendToAll, &payload);
                }
            }
            Command::SendTo(target, data) => {
                let payload = wire::send_to_payload(&self.local_id(), &target, &data);
                if let Some(next) = self.next_hop(&target) {
                    self.send_frame(&next, Opcode::SendTo, &payload);
                } else {
                    trace!(%target, "no route for send_to, dropping");
                }
            }
            Command::AddConnectionListener(id, listener) => {
                self.co_listeners.insert(id, listener);
            }
            Command::RemoveConnectionListener(id) => {
                self.co_listeners.remove(&id);
            }
            Command::AddDisconnectionListener(id, listener) => {
                self.dc_listeners.insert(id, listener);
            }
            Command::RemoveDisconnectionListener(id) => {
                self.dc_listeners.remove(&id);
            }
            Command::AddDataListener(id, listener) => {
                self.data_listeners.insert(id, listener);
            }
            Command::RemoveDataListener(id) => {
                self.data_listeners.remove(&id);
            }
            Command::ClearConnectionListeners => self.co_listeners.clear(),
            Command::ClearDisconnectionListeners => self.dc_listeners.clear(),
            Command::ClearDataListeners => self.data_listeners.clear(),
            Command::Disconnect => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    // -- routing helpers ----------------------------------------------------

    /// Registers a peer reached over a bridge and announces the relay to
    /// the bridge with `forward_to`.
    fn register_bridged(
        &mut self,
        id: PeerId,
        endpoint: PeerEndpoint,
        distance: u8,
        via: PeerId,
    ) {
        let newly = {
            let mut peers = self.shared.peers.write().unwrap();
            match peers.entry(id) {
                Entry::Occupied(mut entry) => {
                    let peer = entry.get_mut();
                    if peer.is_direct() {
                        // A direct connection won the race.
                        return;
                    }
                    let newly = !peer.is_connected();
                    if newly || distance < peer.distance() {
                        peer.set_distance(distance);
                        peer.set_endpoint(endpoint.address, endpoint.port);
                    }
                    newly
                }
                Entry::Vacant(entry) => {
                    entry.insert(Peer::new(id, endpoint.address, endpoint.port, distance));
                    true
                }
            }
        };

        self.local.path_via.insert(id, via);
        self.send_frame(&via, Opcode::ForwardTo, &wire::id_payload(&id));
        info!(peer = %id, bridge = %via, distance, "peer connected over bridge");
        if newly {
            if let Some(peer) = self.peer_snapshot(&id) {
                self.fire_connection(&peer);
            }
        }
    }

    /// Adopts a shorter route toward `subject` through the neighbor `via`
    /// and lets everyone we bridge for toward `subject` know.
    fn improve_route(&mut self, subject: PeerId, reported: u8, via: PeerId) {
        if subject == self.local_id() || reported == DISTANCE_MAX {
            return;
        }
        let new_distance = reported.saturating_add(1);
        if new_distance == DISTANCE_MAX {
            return;
        }

        let updated = {
            let mut peers = self.shared.peers.write().unwrap();
            match peers.get_mut(&subject) {
                Some(peer) if new_distance < peer.distance() => {
                    peer.set_distance(new_distance);
                    true
                }
                _ => false,
            }
        };
        if !updated {
            return;
        }

        debug!(peer = %subject, %via, distance = new_distance, "route updated");
        self.local.path_via.insert(subject, via);
        let payload = wire::distance_payload(new_distance, &subject);
        let dependents: Vec<PeerId> = self
            .local
            .bridging_for
            .get(&subject)
            .map(|set| set.iter().copied().filter(|q| *q != via).collect())
            .unwrap_or_default();
        for q in dependents {
            self.send_frame(&q, Opcode::UpdateDistance, &payload);
        }
    }

    /// Relays a broadcast-style frame to every peer we bridge for on
    /// behalf of `source`; this is the loop-avoidance rule, traffic only
    /// flows along registered relays.
    fn forward_if_needed(&mut self, source: PeerId, opcode: Opcode, payload: &[u8]) {
        let targets: Vec<PeerId> = self
            .local
            .bridging_for
            .get(&source)
            .map(|set| set.iter().copied().filter(|q| *q != source).collect())
            .unwrap_or_default();
        for q in targets {
            trace!(%source, to = %q, ?opcode, "relaying as bridge");
            self.send_frame(&q, opcode, payload);
        }
    }

    /// The directly connected neighbor to use for `target`, if any.
    fn next_hop(&self, target: &PeerId) -> Option<PeerId> {
        let via = self.local.path_via.get(target)?;
        self.io.contains_key(via).then_some(*via)
    }

    fn distance_of(&self, id: &PeerId) -> u8 {
        self.shared
            .peers
            .read()
            .unwrap()
            .get(id)
            .map(|p| p.distance())
            .unwrap_or(DISTANCE_MAX)
    }

    fn peer_snapshot(&self, id: &PeerId) -> Option<Peer> {
        self.shared.peers.read().unwrap().get(id).cloned()
    }

    /// Source attribution for delivered data. The placeholder only shows
    /// up when data raced ahead of membership convergence.
    fn peer_or_placeholder(&self, id: PeerId) -> Peer {
        self.peer_snapshot(&id).unwrap_or_else(|| {
            debug!(peer = %id, "data from a peer not yet in the membership table");
            Peer::new(
                id,
                IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                0,
                DISTANCE_MAX,
            )
        })
    }

    fn send_frame(&mut self, to: &PeerId, opcode: Opcode, payload: &[u8]) {
        match self.io.get(to) {
            Some(io) => io.send_frame(opcode, payload),
            None => trace!(peer = %to, ?opcode, "dropping frame for unconnected peer"),
        }
    }

    // -- timers -------------------------------------------------------------

    fn emit_keep_alives(&mut self) {
        trace!(peers = self.io.len(), "sending keep_alives");
        for io in self.io.values() {
            io.send_frame(Opcode::KeepAlive, &[]);
        }
    }

    fn sweep_timeouts(&mut self) {
        let timeout = self.shared.config.peer_timeout;
        let expired: Vec<PeerId> = self
            .io
            .iter()
            .filter(|(_, io)| io.last_seen.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            warn!(peer = %id, "peer timed out");
            self.process_disconnect(id, true);
        }
    }

    // -- listener fan-out ---------------------------------------------------

    fn fire_connection(&mut self, peer: &Peer) {
        let manager = self.manager.clone();
        for listener in self.co_listeners.values_mut() {
            listener(&manager, peer);
        }
    }

    fn fire_disconnection(&mut self, peer: &Peer) {
        let manager = self.manager.clone();
        for listener in self.dc_listeners.values_mut() {
            listener(&manager, peer);
        }
    }

    fn fire_data(&mut self, source: &Peer, data: &[u8], sent_to_all: bool) {
        let manager = self.manager.clone();
        for listener in self.data_listeners.values_mut() {
            listener(&manager, source, data, sent_to_all);
        }
    }

    // -- shutdown -----------------------------------------------------------

    async fn shutdown(&mut self) {
        info!(id = %self.local_id(), "leaving the mesh");
        let payload = wire::id_payload(&self.local_id());
        for io in self.io.values() {
            io.send_frame(Opcode::PeerDisconnection, &payload);
        }
        for acceptor in self.acceptors.drain(..) {
            acceptor.abort();
        }

        let peers: Vec<Peer> = {
            let mut table = self.shared.peers.write().unwrap();
            table.drain().map(|(_, peer)| peer).collect()
        };
        for (_, io) in std::mem::take(&mut self.io) {
            io.close_gracefully().await;
        }
        for peer in &peers {
            self.fire_disconnection(peer);
        }

        self.local.path_via.clear();
        self.local.bridging_for.clear();
        self.pending.clear();
        self.shared.running.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> NetworkConfig {
        NetworkConfig::with_port(0)
    }

    #[tokio::test]
    async fn awake_twice_is_invalid_state() {
        let manager = PeerManager::new(test_config());
        manager.awake().await.unwrap();
        assert!(manager.is_running());
        assert!(matches!(
            manager.awake().await,
            Err(NetworkError::InvalidState(_))
        ));
        manager.disconnect().await;
        manager.join().await;
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn port_zero_resolves_after_awake() {
        let manager = PeerManager::new(test_config());
        manager.awake().await.unwrap();
        assert_ne!(manager.port(), 0);
        manager.disconnect().await;
        manager.join().await;
    }

    #[tokio::test]
    async fn set_port_while_running_is_rejected() {
        let manager = PeerManager::new(test_config());
        assert!(manager.set_port(4100).is_ok());
        assert_eq!(manager.port(), 4100);
        manager.set_port(0).unwrap();
        manager.awake().await.unwrap();
        assert!(matches!(
            manager.set_port(4200),
            Err(NetworkError::InvalidState(_))
        ));
        manager.disconnect().await;
        manager.join().await;
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let manager = PeerManager::new(test_config());
        // Not running yet: both calls return immediately.
        manager.disconnect().await;
        manager.disconnect().await;
        manager.awake().await.unwrap();
        manager.disconnect().await;
        manager.disconnect().await;
        manager.join().await;
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn connect_to_unreachable_address_fails_and_stops() {
        let manager = PeerManager::new(test_config());
        // A port nobody listens on; the dial must fail quickly.
        let unused = {
            let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().port()
        };
        let err = manager
            .connect("127.0.0.1".parse().unwrap(), unused)
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::ConnectionFailed { .. }));
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn self_peer_is_loopback() {
        let manager = PeerManager::new(test_config());
        let me = manager.self_peer();
        assert!(me.address().is_loopback());
        assert_eq!(me.id(), manager.id());
        assert!(me.is_direct());
    }
}
