//! End-to-end session tests over loopback UDP: real managers, real I/O
//! threads, a recording handler standing in for the game layer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;

use netplay::{
    ConnectionState, DisconnectReason, NetConfig, NetworkChannel, NetworkHandler, NetworkManager,
    Peer,
};

/// One observed handler notification.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Connected { peer_id: u16, client_data: u32 },
    Disconnected { peer_id: u16, reason: DisconnectReason },
    Packet { channel: NetworkChannel, payload: Vec<u8> },
}

/// Handler that records every notification for later assertions.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn payloads(&self, channel: NetworkChannel) -> Vec<Vec<u8>> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Packet { channel: c, payload } if *c == channel => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// Poll until the predicate holds or the deadline passes.
    fn wait_for(&self, timeout: Duration, predicate: impl Fn(&[Event]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if predicate(&self.events.lock()) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn wait_connected(&self, timeout: Duration) -> bool {
        self.wait_for(timeout, |events| {
            events.iter().any(|e| matches!(e, Event::Connected { .. }))
        })
    }

    fn wait_disconnected(&self, timeout: Duration, reason: DisconnectReason) -> bool {
        self.wait_for(timeout, |events| {
            events
                .iter()
                .any(|e| matches!(e, Event::Disconnected { reason: r, .. } if *r == reason))
        })
    }

    fn wait_payload(&self, timeout: Duration, payload: &[u8]) -> bool {
        self.wait_for(timeout, |events| {
            events
                .iter()
                .any(|e| matches!(e, Event::Packet { payload: p, .. } if p == payload))
        })
    }
}

impl NetworkHandler for Recorder {
    fn on_peer_connected(&self, peer: &Peer, client_data: u32) {
        self.events.lock().push(Event::Connected {
            peer_id: peer.id().value(),
            client_data,
        });
    }

    fn on_peer_disconnected(&self, peer: &Peer, reason: DisconnectReason) {
        self.events.lock().push(Event::Disconnected {
            peer_id: peer.id().value(),
            reason,
        });
    }

    fn on_packet_received(&self, _peer: &Peer, channel: NetworkChannel, payload: &[u8]) {
        self.events.lock().push(Event::Packet {
            channel,
            payload: payload.to_vec(),
        });
    }
}

/// Opt-in log output for debugging test runs (RUST_LOG=netplay=trace).
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Fast-timeout tuning so failure paths resolve within test budgets.
fn test_config() -> NetConfig {
    NetConfig {
        connect_timeout: Duration::from_millis(800),
        connect_resend_interval: Duration::from_millis(50),
        ping_interval: Duration::from_millis(100),
        peer_timeout: Duration::from_secs(2),
        ..NetConfig::default()
    }
}

const WAIT: Duration = Duration::from_secs(5);

fn start_server(config: NetConfig) -> Result<(NetworkManager, Arc<Recorder>, u16)> {
    init_tracing();
    let recorder = Recorder::new();
    let mut server = NetworkManager::with_config(config);
    assert!(server.create_server(recorder.clone(), 0));
    let port = server.local_addr().context("server has no local addr")?.port();
    Ok((server, recorder, port))
}

fn start_client(port: u16, client_data: u32) -> (NetworkManager, Arc<Recorder>) {
    let recorder = Recorder::new();
    let mut client = NetworkManager::with_config(test_config());
    assert!(client.create_client(recorder.clone(), "127.0.0.1", port, client_data));
    (client, recorder)
}

#[test]
fn test_connect_and_exchange_on_both_channels() -> Result<()> {
    let (server, server_events, port) = start_server(test_config())?;
    let (client, client_events) = start_client(port, 77);

    assert!(server_events.wait_connected(WAIT), "server saw no client");
    assert!(client_events.wait_connected(WAIT), "client never connected");
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(server.state(), ConnectionState::Listening);

    // Handshake client data reaches the server handler
    assert!(server_events
        .events()
        .iter()
        .any(|e| matches!(e, Event::Connected { client_data: 77, .. })));

    // Server -> client on the reliable channel
    let peer = *server.peers().first().context("no server-side peer")?;
    server.send_to_peer(&peer, NetworkChannel::Main, b"welcome");
    assert!(client_events.wait_payload(WAIT, b"welcome"));

    // Client -> server on both channels
    let server_peer = *client.peers().first().context("no client-side peer")?;
    client.send_to_peer(&server_peer, NetworkChannel::Main, b"hello");
    client.send_to_peer(&server_peer, NetworkChannel::UnreliableUpdates, b"pos:1");
    assert!(server_events.wait_payload(WAIT, b"hello"));

    assert!(server.peer_count() == 1);
    Ok(())
}

#[test]
fn test_reliable_channel_preserves_send_order() -> Result<()> {
    let (server, server_events, port) = start_server(test_config())?;
    let (client, client_events) = start_client(port, 0);
    assert!(server_events.wait_connected(WAIT));
    assert!(client_events.wait_connected(WAIT));

    let peer = *server.peers().first().context("no server-side peer")?;
    let sent: Vec<Vec<u8>> = (0u8..20).map(|i| vec![b'm', i]).collect();
    for payload in &sent {
        server.send_to_peer(&peer, NetworkChannel::Main, payload);
    }

    let last = sent.last().unwrap().clone();
    assert!(client_events.wait_payload(WAIT, &last));
    assert_eq!(client_events.payloads(NetworkChannel::Main), sent);

    drop(client);
    drop(server);
    Ok(())
}

#[test]
fn test_unreliable_channel_never_duplicates() -> Result<()> {
    let (server, server_events, port) = start_server(test_config())?;
    let (_client, client_events) = start_client(port, 0);
    assert!(server_events.wait_connected(WAIT));
    assert!(client_events.wait_connected(WAIT));

    let peer = *server.peers().first().context("no server-side peer")?;
    let sent: Vec<Vec<u8>> = (0u8..10).map(|i| vec![b'u', i]).collect();
    for payload in &sent {
        server.send_to_peer(&peer, NetworkChannel::UnreliableUpdates, payload);
    }

    let last = sent.last().unwrap().clone();
    assert!(client_events.wait_payload(WAIT, &last));

    // Loss is tolerated, duplication is not
    let received = client_events.payloads(NetworkChannel::UnreliableUpdates);
    for payload in &received {
        assert_eq!(received.iter().filter(|p| *p == payload).count(), 1);
        assert!(sent.contains(payload));
    }
    Ok(())
}

#[test]
fn test_dial_with_no_server_times_out() {
    init_tracing();
    let recorder = Recorder::new();
    let mut client = NetworkManager::with_config(test_config());
    // Reserve a port with no one serving it
    let parked = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let dead_port = parked.local_addr().unwrap().port();
    drop(parked);

    assert!(client.create_client(recorder.clone(), "127.0.0.1", dead_port, 0));
    assert_eq!(client.state(), ConnectionState::Connecting);

    assert!(recorder.wait_disconnected(WAIT, DisconnectReason::TimedOut));
    assert!(recorder.wait_for(WAIT, |_| client.state() == ConnectionState::None));
}

#[test]
fn test_capacity_overflow_rejected_without_overflowing_table() -> Result<()> {
    let config = NetConfig {
        max_peers: 2,
        ..test_config()
    };
    let (server, server_events, port) = start_server(config)?;

    let (_c1, e1) = start_client(port, 1);
    let (_c2, e2) = start_client(port, 2);
    assert!(e1.wait_connected(WAIT));
    assert!(e2.wait_connected(WAIT));

    let (_c3, e3) = start_client(port, 3);
    assert!(e3.wait_disconnected(WAIT, DisconnectReason::ServerFull));
    assert!(!e3.events().iter().any(|e| matches!(e, Event::Connected { .. })));

    // Exactly the first two made it in
    assert_eq!(server.peer_count(), 2);
    let connected = server_events
        .events()
        .iter()
        .filter(|e| matches!(e, Event::Connected { .. }))
        .count();
    assert_eq!(connected, 2);
    Ok(())
}

#[test]
fn test_kick_surfaces_reason_on_both_sides() -> Result<()> {
    let (server, server_events, port) = start_server(test_config())?;
    let (client, client_events) = start_client(port, 0);
    assert!(server_events.wait_connected(WAIT));
    assert!(client_events.wait_connected(WAIT));

    let peer = *server.peers().first().context("no server-side peer")?;
    server.kick_client(&peer, DisconnectReason::Kicked);

    assert!(server_events.wait_disconnected(WAIT, DisconnectReason::Kicked));
    assert!(client_events.wait_disconnected(WAIT, DisconnectReason::Kicked));
    assert!(server_events.wait_for(WAIT, |_| server.peer_count() == 0));
    assert!(client_events.wait_for(WAIT, |_| client.state() == ConnectionState::None));
    Ok(())
}

#[test]
fn test_send_after_kick_is_silently_dropped() -> Result<()> {
    let (server, server_events, port) = start_server(test_config())?;
    let (_client, client_events) = start_client(port, 0);
    assert!(server_events.wait_connected(WAIT));
    assert!(client_events.wait_connected(WAIT));

    let peer = *server.peers().first().context("no server-side peer")?;
    server.kick_client(&peer, DisconnectReason::Kicked);
    assert!(server_events.wait_disconnected(WAIT, DisconnectReason::Kicked));

    // The handle the caller still holds has raced with the disconnect
    server.send_to_peer(&peer, NetworkChannel::Main, b"too late");
    std::thread::sleep(Duration::from_millis(200));
    assert!(!client_events
        .events()
        .iter()
        .any(|e| matches!(e, Event::Packet { payload, .. } if payload == b"too late")));
    Ok(())
}

#[test]
fn test_send_to_all_reaches_survivors_of_concurrent_kick() -> Result<()> {
    let (server, server_events, port) = start_server(test_config())?;
    let clients: Vec<_> = (0u32..3).map(|i| start_client(port, i)).collect();
    for (_, events) in &clients {
        assert!(events.wait_connected(WAIT));
    }
    assert!(server_events.wait_for(WAIT, |_| server.peer_count() == 3));

    // Kick one peer and fan out immediately; the I/O thread processes the
    // kick first, so the broadcast sees a consistent two-peer snapshot
    let kicked = *server.peers().first().context("no peers to kick")?;
    server.kick_client(&kicked, DisconnectReason::Kicked);
    server.send_to_all(NetworkChannel::Main, b"fanout");

    // Exactly the two survivors receive the payload; the kicked client's
    // session is already over and sees nothing
    let mut deliveries = 0;
    for (_, events) in &clients {
        if events.wait_payload(Duration::from_secs(2), b"fanout") {
            deliveries += 1;
        }
    }
    assert_eq!(deliveries, 2);
    Ok(())
}

#[test]
fn test_dispose_notifies_remote_and_is_idempotent() -> Result<()> {
    let (server, server_events, port) = start_server(test_config())?;
    let (mut client, client_events) = start_client(port, 0);
    assert!(server_events.wait_connected(WAIT));
    assert!(client_events.wait_connected(WAIT));

    client.dispose();
    assert_eq!(client.state(), ConnectionState::None);
    assert_eq!(client.peer_count(), 0);

    // The goodbye datagram lets the server clean up without waiting for
    // the liveness timeout
    assert!(server_events.wait_disconnected(WAIT, DisconnectReason::Disconnected));
    assert!(server_events.wait_for(WAIT, |_| server.peer_count() == 0));

    client.dispose();
    assert_eq!(client.state(), ConnectionState::None);
    Ok(())
}

#[test]
fn test_rtt_estimate_appears() -> Result<()> {
    let (server, server_events, port) = start_server(test_config())?;
    let (_client, client_events) = start_client(port, 0);
    assert!(server_events.wait_connected(WAIT));
    assert!(client_events.wait_connected(WAIT));

    let peer = *server.peers().first().context("no server-side peer")?;
    assert!(server_events.wait_for(WAIT, |_| server.peer_rtt(&peer).is_some()));
    Ok(())
}
