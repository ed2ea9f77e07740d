//! End-to-end mesh scenarios over real localhost sockets.
//!
//! Every test builds a small mesh on ephemeral ports, exercises the typed
//! API, and polls for convergence instead of assuming timing.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use weftnet::{DataEvent, Network, NetworkConfig, PeerId};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn localhost() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

/// Polls `cond` until it holds or the deadline passes.
async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// A received value together with its privacy flag and source.
#[derive(Debug, Clone, PartialEq)]
struct Received<T> {
    data: T,
    is_private: bool,
    source: PeerId,
}

/// Registers a listener for `T` that appends everything it sees.
fn collect<T>(network: &Network) -> Arc<Mutex<Vec<Received<T>>>>
where
    T: weftnet::NetType + serde::de::DeserializeOwned + Clone + Send + 'static,
{
    let seen: Arc<Mutex<Vec<Received<T>>>> = Arc::default();
    let sink = Arc::clone(&seen);
    network.add_data_listener::<T>(move |event: DataEvent<'_, T>| {
        sink.lock().unwrap().push(Received {
            data: event.data.clone(),
            is_private: event.is_private,
            source: event.source.id(),
        });
    });
    seen
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ChatLine {
    from: String,
    text: String,
}
weftnet::declare_type!(ChatLine);

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_node_string_exchange() {
    init_tracing();
    let a = Network::with_port(0);
    let b = Network::with_port(0);
    let received = collect::<String>(&a);

    a.awake().await.unwrap();
    b.connect(localhost(), a.port()).await.unwrap();

    b.send_object(&"hello".to_string()).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || !received.lock().unwrap().is_empty()).await,
        "a never received the broadcast"
    );
    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].data, "hello");
    assert_eq!(received[0].source, b.id());
    // A broadcast is not private, even in a two-node mesh.
    assert!(!received[0].is_private);

    b.disconnect().await;
    a.disconnect().await;
    b.join().await;
    a.join().await;
}

#[tokio::test]
async fn three_node_broadcast_reaches_everyone_once() {
    init_tracing();
    let a = Network::with_port(0);
    let b = Network::with_port(0);
    let c = Network::with_port(0);
    let at_a = collect::<i32>(&a);
    let at_b = collect::<i32>(&b);

    a.awake().await.unwrap();
    b.connect(localhost(), a.port()).await.unwrap();
    c.connect(localhost(), a.port()).await.unwrap();

    // B and C learn of each other through A's peers_list and connect
    // directly.
    let b_id = b.id();
    let c_id = c.id();
    assert!(
        wait_until(Duration::from_secs(5), || {
            b.peer(&c_id).is_some_and(|p| p.is_direct())
                && c.peer(&b_id).is_some_and(|p| p.is_direct())
        })
        .await,
        "mesh did not converge to a full triangle"
    );
    // Membership symmetry at quiescence.
    assert_eq!(a.peers().len(), 2);
    assert_eq!(b.peers().len(), 2);
    assert_eq!(c.peers().len(), 2);

    c.send_object(&42i32).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            !at_a.lock().unwrap().is_empty() && !at_b.lock().unwrap().is_empty()
        })
        .await,
        "broadcast did not reach both peers"
    );
    // No duplicates trickle in afterwards.
    tokio::time::sleep(Duration::from_millis(300)).await;
    for (name, seen) in [("a", &at_a), ("b", &at_b)] {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1, "{name} received the broadcast more than once");
        assert_eq!(seen[0].data, 42);
        assert!(!seen[0].is_private);
        assert_eq!(seen[0].source, c_id);
    }

    for node in [&a, &b, &c] {
        node.disconnect().await;
        node.join().await;
    }
}

#[tokio::test]
async fn relay_bridges_two_peers_that_cannot_connect() {
    init_tracing();
    let a = Network::with_port(0);
    let b = Network::with_port(0);
    let c = Network::with_port(0);
    let (a_id, b_id, c_id) = (a.id(), b.id(), c.id());

    // A and C refuse each other's connections, so B has to bridge.
    a.set_connection_predicate(move |peer| peer.id() == b_id);
    c.set_connection_predicate(move |peer| peer.id() != a_id);

    let at_a = collect::<String>(&a);
    let broadcasts_at_a = collect::<i32>(&a);

    a.awake().await.unwrap();
    b.connect(localhost(), a.port()).await.unwrap();
    c.connect(localhost(), b.port()).await.unwrap();

    // Both ends settle on a distance-1 route through B.
    assert!(
        wait_until(Duration::from_secs(5), || {
            c.peer(&a_id)
                .is_some_and(|p| p.is_connected() && p.distance() == 1)
                && a.peer(&c_id)
                    .is_some_and(|p| p.is_connected() && p.distance() == 1)
        })
        .await,
        "bridge was not established"
    );

    // Private object from C arrives at A with C as its source.
    let target = c.peer(&a_id).unwrap();
    c.send_object_to(&target, &"relay".to_string()).unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || !at_a.lock().unwrap().is_empty()).await,
        "relayed object never arrived"
    );
    {
        let seen = at_a.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].data, "relay");
        assert!(seen[0].is_private);
        assert_eq!(seen[0].source, c_id);
    }

    // Broadcasts cross the bridge as well, exactly once.
    c.send_object(&7i32).unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            !broadcasts_at_a.lock().unwrap().is_empty()
        })
        .await,
        "broadcast never crossed the bridge"
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    {
        let seen = broadcasts_at_a.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].is_private);
    }

    for node in [&a, &b, &c] {
        node.disconnect().await;
        node.join().await;
    }
}

#[tokio::test]
async fn graceful_leave_is_announced_exactly_once() {
    init_tracing();
    let a = Network::with_port(0);
    let b = Network::with_port(0);
    let c = Network::with_port(0);
    let a_id = a.id();

    let departures_at_b: Arc<Mutex<Vec<PeerId>>> = Arc::default();
    let departures_at_c: Arc<Mutex<Vec<PeerId>>> = Arc::default();
    for (node, sink) in [(&b, &departures_at_b), (&c, &departures_at_c)] {
        let sink = Arc::clone(sink);
        node.add_disconnection_listener(move |_, peer| {
            sink.lock().unwrap().push(peer.id());
        });
    }
    let at_c = collect::<String>(&c);

    a.awake().await.unwrap();
    b.connect(localhost(), a.port()).await.unwrap();
    c.connect(localhost(), a.port()).await.unwrap();
    let (b_id, c_id) = (b.id(), c.id());
    assert!(
        wait_until(Duration::from_secs(5), || {
            b.peer(&c_id).is_some_and(|p| p.is_direct())
                && c.peer(&b_id).is_some_and(|p| p.is_direct())
        })
        .await
    );

    a.disconnect().await;
    a.join().await;

    assert!(
        wait_until(Duration::from_secs(5), || {
            departures_at_b.lock().unwrap().contains(&a_id)
                && departures_at_c.lock().unwrap().contains(&a_id)
        })
        .await,
        "departure was not announced"
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    for (name, sink) in [("b", &departures_at_b), ("c", &departures_at_c)] {
        let events = sink.lock().unwrap();
        assert_eq!(
            events.iter().filter(|id| **id == a_id).count(),
            1,
            "{name} saw the departure more than once"
        );
    }
    assert!(b.peer(&a_id).is_none(), "a still in b's membership");
    assert!(c.peer(&a_id).is_none(), "a still in c's membership");

    // The surviving pair keeps working.
    b.send_object(&"after".to_string()).unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || !at_c.lock().unwrap().is_empty()).await,
        "mesh broken after the departure"
    );

    b.disconnect().await;
    c.disconnect().await;
    b.join().await;
    c.join().await;
}

#[tokio::test]
async fn silent_peer_times_out() {
    init_tracing();
    let long = Duration::from_secs(3600);
    // A never sends keep-alives; B has an aggressive timeout.
    let a = Network::new(NetworkConfig {
        port: 0,
        keep_alive_interval: long,
        peer_timeout: long,
        timeout_sweep_interval: long,
        ..NetworkConfig::default()
    });
    let b = Network::new(NetworkConfig {
        port: 0,
        keep_alive_interval: long,
        peer_timeout: Duration::from_millis(400),
        timeout_sweep_interval: Duration::from_millis(100),
        ..NetworkConfig::default()
    });
    let (a_id, b_id) = (a.id(), b.id());

    let departures_at_a: Arc<Mutex<Vec<PeerId>>> = Arc::default();
    let departures_at_b: Arc<Mutex<Vec<PeerId>>> = Arc::default();
    for (node, sink) in [(&a, &departures_at_a), (&b, &departures_at_b)] {
        let sink = Arc::clone(sink);
        node.add_disconnection_listener(move |_, peer| {
            sink.lock().unwrap().push(peer.id());
        });
    }

    a.awake().await.unwrap();
    b.connect(localhost(), a.port()).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || a.peer(&b_id).is_some()).await);

    // B's sweep closes the silent link; A observes the EOF.
    assert!(
        wait_until(Duration::from_secs(5), || {
            departures_at_b.lock().unwrap().as_slice() == [a_id].as_slice()
                && departures_at_a.lock().unwrap().as_slice() == [b_id].as_slice()
        })
        .await,
        "timeout disconnect did not propagate to both sides"
    );

    a.disconnect().await;
    b.disconnect().await;
    a.join().await;
    b.join().await;
}

#[tokio::test]
async fn packets_deliver_values_in_order() {
    init_tracing();
    let a = Network::with_port(0);
    let b = Network::with_port(0);
    let strings = collect::<String>(&a);
    let ints = collect::<i32>(&a);
    let lines = collect::<ChatLine>(&a);

    a.awake().await.unwrap();
    b.connect(localhost(), a.port()).await.unwrap();

    let mut packet = weftnet::Packet::new();
    packet
        .append(&"first".to_string())
        .unwrap()
        .append(&2i32)
        .unwrap()
        .append(&ChatLine {
            from: "b".into(),
            text: "third".into(),
        })
        .unwrap();
    b.send_packet(&packet);

    assert!(
        wait_until(Duration::from_secs(5), || {
            !strings.lock().unwrap().is_empty()
                && !ints.lock().unwrap().is_empty()
                && !lines.lock().unwrap().is_empty()
        })
        .await,
        "packet contents never arrived"
    );
    assert_eq!(strings.lock().unwrap()[0].data, "first");
    assert_eq!(ints.lock().unwrap()[0].data, 2);
    assert_eq!(lines.lock().unwrap()[0].data.text, "third");
    assert!(!ints.lock().unwrap()[0].is_private);

    // A private packet carries the private flag instead.
    let target = b.peers().into_iter().next().unwrap();
    let mut private = weftnet::Packet::new();
    private.append(&9i32).unwrap();
    b.send_packet_to(&target, &private);
    assert!(
        wait_until(Duration::from_secs(5), || ints.lock().unwrap().len() == 2).await,
        "private packet never arrived"
    );
    assert!(ints.lock().unwrap()[1].is_private);

    a.disconnect().await;
    b.disconnect().await;
    a.join().await;
    b.join().await;
}

#[tokio::test]
async fn unlistened_types_reach_the_fallback() {
    init_tracing();
    let a = Network::with_port(0);
    let b = Network::with_port(0);
    let hashes: Arc<Mutex<Vec<u64>>> = Arc::default();
    let sink = Arc::clone(&hashes);
    a.set_unlistened_type_listener(move |_, _, _, _, hash| {
        sink.lock().unwrap().push(hash);
    });

    a.awake().await.unwrap();
    b.connect(localhost(), a.port()).await.unwrap();

    b.send_object(&123u64).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || !hashes.lock().unwrap().is_empty()).await,
        "fallback never fired"
    );
    assert_eq!(
        hashes.lock().unwrap()[0],
        <u64 as weftnet::NetType>::hash_code()
    );

    a.disconnect().await;
    b.disconnect().await;
    a.join().await;
    b.join().await;
}

#[tokio::test]
async fn equivalent_type_spellings_interoperate() {
    init_tracing();

    // Two distinct Rust types whose declared names differ only in
    // whitespace and `::` spelling hash identically and therefore share a
    // wire identity.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct SpellingOne(String);
    weftnet::declare_type!(SpellingOne, "Outer<ns::Inner>");

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct SpellingTwo(String);
    weftnet::declare_type!(SpellingTwo, "Outer< ns :: Inner >");

    use weftnet::NetType;
    assert_eq!(SpellingOne::hash_code(), SpellingTwo::hash_code());

    let a = Network::with_port(0);
    let b = Network::with_port(0);
    let seen = collect::<SpellingTwo>(&a);

    a.awake().await.unwrap();
    b.connect(localhost(), a.port()).await.unwrap();

    b.send_object(&SpellingOne("same type on the wire".into()))
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || !seen.lock().unwrap().is_empty()).await,
        "equivalent spelling was not delivered"
    );
    assert_eq!(seen.lock().unwrap()[0].data.0, "same type on the wire");

    a.disconnect().await;
    b.disconnect().await;
    a.join().await;
    b.join().await;
}

#[tokio::test]
async fn rejected_peers_are_never_advertised() {
    init_tracing();
    let a = Network::with_port(0);
    let b = Network::with_port(0);
    let c = Network::with_port(0);
    let (b_id, c_id) = (b.id(), c.id());

    // A only talks to B; C's join through A must fail outright.
    a.set_connection_predicate(move |peer| peer.id() == b_id);

    a.awake().await.unwrap();
    b.connect(localhost(), a.port()).await.unwrap();

    let err = c.connect(localhost(), a.port()).await.unwrap_err();
    assert!(matches!(err, weftnet::NetworkError::ConnectionFailed { .. }));
    assert!(!c.is_running());

    // The refused peer never shows up in anyone's membership.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(a.peer(&c_id).is_none());
    assert!(b.peer(&c_id).is_none());

    a.disconnect().await;
    b.disconnect().await;
    a.join().await;
    b.join().await;
}
