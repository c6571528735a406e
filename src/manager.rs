//! Network Manager
//!
//! The session façade the rest of the application talks to. One manager
//! instance governs one session: a client dialing a remote host, or a
//! server accepting up to a fixed number of peers. The manager owns the
//! shared session state, spawns the I/O worker thread on `create_*` and
//! tears it down with signal-then-join in `dispose()`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::channel::NetworkChannel;
use crate::handler::{DisconnectReason, NetworkHandler};
use crate::host::Host;
use crate::peer::{Peer, PeerTable};
use crate::protocol::MAX_PAYLOAD;
use crate::worker::{self, Command, WorkerContext};

/// Default ceiling for simultaneously connected peers.
pub const MAX_PEER_COUNT: usize = 64;

/// Default service-loop period.
pub const SERVICE_INTERVAL: Duration = Duration::from_millis(4);

/// Transport tuning knobs. The defaults suit a low-latency game session;
/// tests shrink the timeouts.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Maximum simultaneously connected peers (server role).
    pub max_peers: usize,
    /// Period of the I/O thread's service loop.
    pub service_interval: Duration,
    /// How long a client keeps dialing before giving up.
    pub connect_timeout: Duration,
    /// Interval between connect-request retransmissions while dialing.
    pub connect_resend_interval: Duration,
    /// Interval between liveness pings to each peer.
    pub ping_interval: Duration,
    /// Drop a peer after this long without inbound traffic.
    pub peer_timeout: Duration,
    /// Transmission budget per reliable payload before the peer is
    /// declared lost.
    pub max_transmissions: u32,
    /// Out-of-order reliable packets buffered per peer.
    pub reorder_capacity: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            max_peers: MAX_PEER_COUNT,
            service_interval: SERVICE_INTERVAL,
            connect_timeout: Duration::from_secs(5),
            connect_resend_interval: Duration::from_millis(250),
            ping_interval: Duration::from_millis(500),
            peer_timeout: Duration::from_secs(5),
            max_transmissions: 10,
            reorder_capacity: 256,
        }
    }
}

/// Session lifecycle state.
///
/// Valid transitions: `None -> Listening` (server created), `None ->
/// Connecting` (client created), `Connecting -> Connected` (dial
/// accepted), `Connecting -> None` (dial failed or timed out), and any
/// state back to `None` on `dispose()` or session loss. A manager is
/// single-role for its lifetime; switching roles requires `dispose()`
/// followed by a fresh `create_*` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session: no socket, no I/O thread.
    None,
    /// Server bound and accepting connections.
    Listening,
    /// Client dialing; outcome pending.
    Connecting,
    /// Client connected to the server.
    Connected,
}

/// State touched by both the application thread and the I/O thread,
/// guarded by one mutex held only for short critical sections.
pub(crate) struct SessionShared {
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Connected-peer bookkeeping.
    pub peers: PeerTable,
}

/// Handle to the running I/O worker.
struct WorkerHandle {
    thread: JoinHandle<()>,
    commands: mpsc::UnboundedSender<Command>,
    stop: Arc<AtomicBool>,
}

/// The multiplayer session manager.
///
/// Send/kick calls are asynchronous requests carried out by the I/O
/// thread; they tolerate racing against disconnection and never panic.
/// Failure surfaces either as a `false` return from `create_*` or as a
/// handler notification, never as an exception-like escape.
pub struct NetworkManager {
    config: NetConfig,
    shared: Arc<Mutex<SessionShared>>,
    worker: Option<WorkerHandle>,
    local_addr: Option<SocketAddr>,
}

impl NetworkManager {
    /// Manager with default tuning.
    pub fn new() -> Self {
        Self::with_config(NetConfig::default())
    }

    /// Manager with explicit tuning.
    pub fn with_config(config: NetConfig) -> Self {
        let shared = Arc::new(Mutex::new(SessionShared {
            state: ConnectionState::None,
            peers: PeerTable::new(config.max_peers),
        }));
        Self {
            config,
            shared,
            worker: None,
            local_addr: None,
        }
    }

    /// Open a client session: bind an ephemeral socket, start dialing
    /// `address:port` and spawn the I/O thread. Returns `false` without
    /// side effects when a session is already active or the socket cannot
    /// be set up; the eventual outcome of the dial is reported to
    /// `handler` on the I/O thread. `client_data` is passed through the
    /// handshake opaquely.
    pub fn create_client(
        &mut self,
        handler: Arc<dyn NetworkHandler>,
        address: &str,
        port: u16,
        client_data: u32,
    ) -> bool {
        if !self.prepare_session() {
            warn!("create_client rejected: session already active");
            return false;
        }

        let remote = match (address, port).to_socket_addrs().ok().and_then(|mut addrs| addrs.next()) {
            Some(addr) => addr,
            None => {
                warn!("Cannot resolve {}:{}", address, port);
                return false;
            }
        };
        let bind_addr = match remote {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = match std::net::UdpSocket::bind(bind_addr) {
            Ok(socket) => socket,
            Err(err) => {
                warn!("Failed to bind client socket: {}", err);
                return false;
            }
        };

        let host = Host::new_client(remote, client_data, self.config.clone(), Instant::now());
        if !self.start_worker(socket, host, handler, ConnectionState::Connecting) {
            return false;
        }
        info!("Client session dialing {}", remote);
        true
    }

    /// Open a server session bound to `port` (0 picks an ephemeral port,
    /// discoverable via [`local_addr`](Self::local_addr)). Same return
    /// contract as [`create_client`](Self::create_client), with the dial
    /// replaced by bind-and-listen.
    pub fn create_server(&mut self, handler: Arc<dyn NetworkHandler>, port: u16) -> bool {
        if !self.prepare_session() {
            warn!("create_server rejected: session already active");
            return false;
        }

        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = match std::net::UdpSocket::bind(bind_addr) {
            Ok(socket) => socket,
            Err(err) => {
                warn!("Failed to bind server socket on port {}: {}", port, err);
                return false;
            }
        };

        let host = Host::new_server(self.config.clone());
        if !self.start_worker(socket, host, handler, ConnectionState::Listening) {
            return false;
        }
        info!(
            "Server listening on {}",
            self.local_addr
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| format!("port {port}"))
        );
        true
    }

    /// End the session: signal the I/O thread, join it, release the
    /// socket and clear the peer collection. Idempotent and infallible;
    /// safe to call with no session active and safe to call twice.
    pub fn dispose(&mut self) {
        if let Some(handle) = self.worker.take() {
            handle.stop.store(true, Ordering::Release);
            let _ = handle.commands.send(Command::Shutdown);
            if handle.thread.join().is_err() {
                error!("I/O thread panicked during shutdown");
            }
        }

        let mut session = self.shared.lock();
        session.peers.clear();
        session.state = ConnectionState::None;
        drop(session);
        self.local_addr = None;
    }

    /// Current session state. Safe to call from the application thread at
    /// any time, including concurrently with I/O thread event processing.
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Enqueue `data` for delivery to `peer` under `channel`'s policy.
    /// A no-op when no session is active, when the payload exceeds
    /// [`MAX_PAYLOAD`] or when the peer has disconnected since the caller
    /// last observed it; sends are allowed to race with disconnection.
    pub fn send_to_peer(&self, peer: &Peer, channel: NetworkChannel, data: &[u8]) {
        if !self.check_payload(data) {
            return;
        }
        if let Some(handle) = &self.worker {
            let _ = handle.commands.send(Command::Send {
                peer: peer.id(),
                channel,
                payload: data.to_vec(),
            });
        }
    }

    /// Enqueue `data` for every connected peer. The fan-out happens on
    /// the I/O thread against one consistent snapshot of the peer set.
    pub fn send_to_all(&self, channel: NetworkChannel, data: &[u8]) {
        if !self.check_payload(data) {
            return;
        }
        if let Some(handle) = &self.worker {
            let _ = handle.commands.send(Command::Broadcast {
                channel,
                payload: data.to_vec(),
            });
        }
    }

    /// Request disconnection of `peer`, carrying `reason` to the remote
    /// endpoint and to the local handler. Asynchronous: the confirming
    /// "peer disconnected" notification arrives via the handler.
    pub fn kick_client(&self, peer: &Peer, reason: DisconnectReason) {
        if let Some(handle) = &self.worker {
            let _ = handle.commands.send(Command::Kick {
                peer: peer.id(),
                reason,
            });
        }
    }

    /// Local socket address of the active session, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of currently connected peers.
    pub fn peer_count(&self) -> usize {
        self.shared.lock().peers.len()
    }

    /// Snapshot of the currently connected peers.
    pub fn peers(&self) -> Vec<Peer> {
        self.shared.lock().peers.snapshot()
    }

    /// Smoothed round-trip estimate for a connected peer, once measured.
    pub fn peer_rtt(&self, peer: &Peer) -> Option<Duration> {
        self.shared.lock().peers.get(peer.id()).and_then(|entry| entry.rtt)
    }

    /// Ready the manager for a fresh `create_*` call. Reaps a worker
    /// whose session already ended on its own (failed dial, remote
    /// close); refuses when a session is still active.
    fn prepare_session(&mut self) -> bool {
        if self.worker.is_some() && self.state() == ConnectionState::None {
            self.dispose();
        }
        self.worker.is_none() && self.state() == ConnectionState::None
    }

    fn start_worker(
        &mut self,
        socket: std::net::UdpSocket,
        host: Host,
        handler: Arc<dyn NetworkHandler>,
        initial_state: ConnectionState,
    ) -> bool {
        if let Err(err) = socket.set_nonblocking(true) {
            warn!("Failed to make socket nonblocking: {}", err);
            return false;
        }
        self.local_addr = socket.local_addr().ok();

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));

        // State goes in before the thread exists so the worker can only
        // ever transition it forward
        {
            let mut session = self.shared.lock();
            session.state = initial_state;
            session.peers = PeerTable::new(self.config.max_peers);
        }

        let ctx = WorkerContext {
            socket,
            host,
            shared: self.shared.clone(),
            handler,
            commands: command_rx,
            stop: stop.clone(),
            service_interval: self.config.service_interval,
        };
        let thread = match std::thread::Builder::new()
            .name("netplay-io".into())
            .spawn(move || worker::run(ctx))
        {
            Ok(thread) => thread,
            Err(err) => {
                error!("Failed to spawn I/O thread: {}", err);
                self.shared.lock().state = ConnectionState::None;
                self.local_addr = None;
                return false;
            }
        };

        self.worker = Some(WorkerHandle {
            thread,
            commands: command_tx,
            stop,
        });
        true
    }

    fn check_payload(&self, data: &[u8]) -> bool {
        if data.len() > MAX_PAYLOAD {
            warn!(
                "Dropping oversized send of {} bytes (limit {})",
                data.len(),
                MAX_PAYLOAD
            );
            return false;
        }
        true
    }
}

impl Default for NetworkManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;

    impl NetworkHandler for NullHandler {
        fn on_peer_connected(&self, _peer: &Peer, _client_data: u32) {}
        fn on_peer_disconnected(&self, _peer: &Peer, _reason: DisconnectReason) {}
        fn on_packet_received(&self, _peer: &Peer, _channel: NetworkChannel, _payload: &[u8]) {}
    }

    #[test]
    fn test_initial_state() {
        let manager = NetworkManager::new();
        assert_eq!(manager.state(), ConnectionState::None);
        assert_eq!(manager.peer_count(), 0);
        assert!(manager.local_addr().is_none());
    }

    #[test]
    fn test_dispose_without_session_is_noop() {
        let mut manager = NetworkManager::new();
        manager.dispose();
        manager.dispose();
        assert_eq!(manager.state(), ConnectionState::None);
    }

    #[test]
    fn test_send_without_session_is_noop() {
        let manager = NetworkManager::new();
        let peer = Peer::new(crate::peer::PeerId(0), "127.0.0.1:9999".parse().unwrap());
        manager.send_to_peer(&peer, NetworkChannel::Main, b"dropped");
        manager.send_to_all(NetworkChannel::UnreliableUpdates, b"dropped");
        manager.kick_client(&peer, DisconnectReason::Kicked);
    }

    #[test]
    fn test_second_session_rejected_until_dispose() {
        let mut manager = NetworkManager::new();
        assert!(manager.create_server(Arc::new(NullHandler), 0));
        assert_eq!(manager.state(), ConnectionState::Listening);
        assert!(manager.local_addr().is_some());

        // Single-role for its lifetime: no second session while active
        assert!(!manager.create_server(Arc::new(NullHandler), 0));
        assert!(!manager.create_client(Arc::new(NullHandler), "127.0.0.1", 1, 0));

        manager.dispose();
        assert_eq!(manager.state(), ConnectionState::None);
        assert!(manager.create_server(Arc::new(NullHandler), 0));
        manager.dispose();
    }

    #[test]
    fn test_dispose_joins_thread_and_clears_state() {
        let mut manager = NetworkManager::new();
        assert!(manager.create_server(Arc::new(NullHandler), 0));
        manager.dispose();
        assert_eq!(manager.state(), ConnectionState::None);
        assert_eq!(manager.peer_count(), 0);
        assert!(manager.local_addr().is_none());
        // Second dispose is equivalent to the first
        manager.dispose();
        assert_eq!(manager.state(), ConnectionState::None);
    }

    #[test]
    fn test_unresolvable_address_rejected_synchronously() {
        let mut manager = NetworkManager::new();
        assert!(!manager.create_client(Arc::new(NullHandler), "definitely-not-a-host.invalid", 7777, 0));
        assert_eq!(manager.state(), ConnectionState::None);
        assert!(manager.worker.is_none());
    }

    #[test]
    fn test_oversized_payload_dropped() {
        let manager = NetworkManager::new();
        let data = vec![0u8; MAX_PAYLOAD + 1];
        // Must not panic, with or without a session
        manager.send_to_all(NetworkChannel::Main, &data);
    }
}
