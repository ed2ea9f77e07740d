//! I/O engine: acceptors, handshakes, and per-peer socket tasks.
//!
//! The engine owns everything that touches a socket. Each established
//! connection gets two tasks:
//!
//! - a reader that reassembles frames and feeds them to the peer manager's
//!   event loop as [`Event::Frame`]s,
//! - a writer that drains the peer's outbound queue, so writes to one slow
//!   peer never block traffic to another.
//!
//! Handshakes (both accepted and dialed) also run in their own tasks and
//! report back through the same event channel, keeping all membership
//! mutation inside the event loop.

use crate::manager::{Command, Shared};
use crate::types::{Peer, PeerId};
use crate::wire::{self, encode_frame, Hello, Opcode, WireError};
use crate::NetworkError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

/// How long a dial may take to establish the TCP connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the hello/answer exchange may take once a socket exists.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Why a dial was started; decides what happens when it fails.
pub(crate) enum DialContext {
    /// `connect()` called by the embedding application.
    Api {
        reply: oneshot::Sender<Result<PeerId, NetworkError>>,
    },
    /// A peer advertised in a `peers_list` from `via`.
    Bootstrap { via: PeerId },
    /// A reverse connection ordered by a `connect_to` from `via`.
    Requested { via: PeerId },
}

pub(crate) enum Origin {
    Inbound,
    Dialed(DialContext),
}

/// Everything the peer manager's event loop reacts to.
pub(crate) enum Event {
    /// A handshake completed; the stream is ready for frame traffic.
    Established {
        stream: TcpStream,
        address: IpAddr,
        hello: Hello,
        origin: Origin,
    },
    /// A dial did not produce a connection.
    DialFailed {
        address: IpAddr,
        port: u16,
        expected: Option<PeerId>,
        ctx: DialContext,
        reason: String,
    },
    /// One reassembled frame from a connected peer.
    Frame {
        from: PeerId,
        opcode: Opcode,
        payload: Vec<u8>,
    },
    /// A peer's socket closed or its reader hit a protocol error.
    Closed { from: PeerId },
    /// A request from the public API.
    Command(Command),
}

// ---------------------------------------------------------------------------
// Acceptors
// ---------------------------------------------------------------------------

/// Binds the listening sockets: IPv6 first, plus a separate IPv4 acceptor
/// when the OS does not fold v4 into the v6 socket. Falls back to v4-only
/// where v6 is unavailable. Returns the acceptors and the actual port.
pub(crate) async fn bind_acceptors(
    port: u16,
) -> Result<(Vec<TcpListener>, u16), NetworkError> {
    match TcpListener::bind((Ipv6Addr::UNSPECIFIED, port)).await {
        Ok(v6) => {
            let actual = v6.local_addr().map_err(NetworkError::Bind)?.port();
            match TcpListener::bind((Ipv4Addr::UNSPECIFIED, actual)).await {
                Ok(v4) => Ok((vec![v6, v4], actual)),
                Err(e) => {
                    // Dual-stack systems report the port as taken by the v6
                    // socket; a single acceptor covers both families there.
                    debug!(error = %e, "no separate v4 acceptor, relying on the v6 socket");
                    Ok((vec![v6], actual))
                }
            }
        }
        Err(v6_err) => match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(v4) => {
                let actual = v4.local_addr().map_err(NetworkError::Bind)?.port();
                warn!(error = %v6_err, "IPv6 unavailable, accepting IPv4 only");
                Ok((vec![v4], actual))
            }
            Err(v4_err) => Err(NetworkError::Unsupported {
                v6: v6_err,
                v4: v4_err,
            }),
        },
    }
}

/// Accept loop for one acceptor. Each incoming socket gets its own
/// handshake task so a stalled remote cannot hold up the listener.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    events_tx: mpsc::UnboundedSender<Event>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                trace!(peer = %remote, "accepted TCP connection");
                let shared = Arc::clone(&shared);
                let events_tx = events_tx.clone();
                tokio::spawn(async move {
                    handshake_inbound(stream, remote, shared, events_tx).await;
                });
            }
            Err(e) => {
                // Accept errors are usually transient (fd exhaustion and the
                // like); keep the acceptor alive.
                warn!(error = %e, "failed to accept TCP connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Runs the accepting side of the handshake: exchange hellos, check the
/// magic, consult the connection predicate, answer with
/// `connection_accepted` or `connection_refused`.
async fn handshake_inbound(
    mut stream: TcpStream,
    remote: SocketAddr,
    shared: Arc<Shared>,
    events_tx: mpsc::UnboundedSender<Event>,
) {
    let exchange = async {
        let hello = Hello {
            id: shared.local_id,
            port: shared.port(),
        };
        wire::write_hello(&mut stream, &hello).await?;
        wire::read_hello(&mut stream).await
    };
    let hello = match timeout(HANDSHAKE_TIMEOUT, exchange).await {
        Ok(Ok(hello)) => hello,
        Ok(Err(WireError::BadMagic { got_1, got_2 })) => {
            // Not one of us; drop without an answer.
            debug!(peer = %remote, got_1, got_2, "protocol magic mismatch, dropping");
            return;
        }
        Ok(Err(e)) => {
            debug!(peer = %remote, error = %e, "inbound handshake failed");
            return;
        }
        Err(_) => {
            debug!(peer = %remote, "inbound handshake timed out");
            return;
        }
    };

    if hello.id == shared.local_id {
        debug!(peer = %remote, "dropping connection presenting our own id");
        return;
    }

    let address = remote.ip().to_canonical();
    let candidate = Peer::new(hello.id, address, hello.port, 0);
    if !shared.accepts(&candidate) {
        debug!(peer = %candidate, "connection refused by predicate");
        let _ = wire::write_frame(&mut stream, Opcode::ConnectionRefused, &[]).await;
        return;
    }
    if wire::write_frame(&mut stream, Opcode::ConnectionAccepted, &[])
        .await
        .is_err()
    {
        return;
    }

    let _ = events_tx.send(Event::Established {
        stream,
        address,
        hello,
        origin: Origin::Inbound,
    });
}

// ---------------------------------------------------------------------------
// Dialing
// ---------------------------------------------------------------------------

/// Dials `address:port`, runs the connecting side of the handshake, and
/// reports the outcome to the event loop. `expected` is the id advertised
/// for the target, when one is known.
pub(crate) async fn dial(
    shared: Arc<Shared>,
    events_tx: mpsc::UnboundedSender<Event>,
    address: IpAddr,
    port: u16,
    expected: Option<PeerId>,
    ctx: DialContext,
) {
    let attempt = async {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((address, port)))
            .await
            .map_err(|_| "connect timed out".to_string())?
            .map_err(|e| e.to_string())?;
        handshake_outbound(stream, &shared).await
    };

    match attempt.await {
        Ok((stream, hello)) => {
            if let Some(expected) = expected {
                if expected != hello.id {
                    debug!(%expected, got = %hello.id, "peer answered with a different id");
                }
            }
            let _ = events_tx.send(Event::Established {
                stream,
                address,
                hello,
                origin: Origin::Dialed(ctx),
            });
        }
        Err(reason) => {
            debug!(%address, port, reason, "dial failed");
            let _ = events_tx.send(Event::DialFailed {
                address,
                port,
                expected,
                ctx,
                reason,
            });
        }
    }
}

/// Connecting side of the handshake: exchange hellos, then wait for the
/// acceptor's verdict.
async fn handshake_outbound(
    mut stream: TcpStream,
    shared: &Shared,
) -> Result<(TcpStream, Hello), String> {
    let exchange = async {
        let hello = Hello {
            id: shared.local_id,
            port: shared.port(),
        };
        wire::write_hello(&mut stream, &hello).await?;
        let peer_hello = wire::read_hello(&mut stream).await?;
        let (answer, _) = wire::read_frame(&mut stream, 64).await?;
        Ok::<_, WireError>((peer_hello, answer))
    };
    match timeout(HANDSHAKE_TIMEOUT, exchange).await {
        Ok(Ok((hello, Opcode::ConnectionAccepted))) => Ok((stream, hello)),
        Ok(Ok((_, Opcode::ConnectionRefused))) => Err("connection refused by peer".into()),
        Ok(Ok((_, other))) => Err(format!("unexpected handshake answer: {other:?}")),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("handshake timed out".into()),
    }
}

// ---------------------------------------------------------------------------
// Per-peer socket tasks
// ---------------------------------------------------------------------------

/// Socket-side state of one connected peer, kept in the event loop's arena
/// keyed by [`PeerId`] (never inside the membership table, whose entries
/// are plain snapshots).
pub(crate) struct PeerIo {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    /// When the last byte from this peer arrived; drives the timeout sweep.
    pub(crate) last_seen: Instant,
}

impl PeerIo {
    /// Enqueues one frame. A send to a peer that is going away is dropped
    /// silently, matching the delivery contract.
    pub(crate) fn send_frame(&self, opcode: Opcode, payload: &[u8]) {
        let _ = self.tx.send(encode_frame(opcode, payload));
    }

    /// Tears the connection down without letting queued frames drain.
    pub(crate) fn abort(self) {
        self.reader.abort();
        self.writer.abort();
    }

    /// Closes the connection after giving queued frames a moment to drain,
    /// used by the orderly shutdown path.
    pub(crate) async fn close_gracefully(self) {
        let PeerIo {
            tx, reader, writer, ..
        } = self;
        reader.abort();
        drop(tx);
        let _ = timeout(Duration::from_secs(1), writer).await;
    }
}

/// Spawns the reader and writer tasks for an established connection.
pub(crate) fn spawn_peer_tasks(
    stream: TcpStream,
    id: PeerId,
    events_tx: mpsc::UnboundedSender<Event>,
    buffer_size: usize,
    max_frame_size: u32,
) -> PeerIo {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let reader = tokio::spawn(async move {
        let mut reader = BufReader::with_capacity(buffer_size, read_half);
        loop {
            match wire::read_frame(&mut reader, max_frame_size).await {
                Ok((opcode, payload)) => {
                    if events_tx
                        .send(Event::Frame {
                            from: id,
                            opcode,
                            payload,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(WireError::ConnectionClosed) => {
                    trace!(peer = %id, "connection closed");
                    let _ = events_tx.send(Event::Closed { from: id });
                    break;
                }
                Err(e) => {
                    warn!(peer = %id, error = %e, "dropping peer after read error");
                    let _ = events_tx.send(Event::Closed { from: id });
                    break;
                }
            }
        }
    });

    let writer = tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        while let Some(frame) = rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                // The reader surfaces the disconnect; nothing to report here.
                break;
            }
        }
    });

    PeerIo {
        tx,
        reader,
        writer,
        last_seen: Instant::now(),
    }
}
