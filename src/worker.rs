//! I/O Worker Thread
//!
//! One worker per active session. The spawned thread runs a
//! current-thread tokio runtime for its whole life, multiplexing the
//! fixed-period service tick, the command channel from the application
//! thread and socket readiness. It is the only code that touches the
//! socket and the host after creation.
//!
//! Locking discipline: peer-table and state mutations happen in short
//! critical sections; handler callbacks are always invoked with no lock
//! held, so a slow handler can delay event dispatch but never deadlock an
//! application-thread call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::channel::NetworkChannel;
use crate::handler::{DisconnectReason, NetworkHandler};
use crate::host::{Host, HostEvent};
use crate::manager::{ConnectionState, SessionShared};
use crate::peer::PeerId;
use crate::protocol::{self, MAX_DATAGRAM};

/// Requests from the application thread, carried out on the I/O thread.
pub(crate) enum Command {
    /// Deliver a payload to one peer on a channel.
    Send {
        peer: PeerId,
        channel: NetworkChannel,
        payload: Vec<u8>,
    },
    /// Deliver a payload to every connected peer on a channel.
    Broadcast {
        channel: NetworkChannel,
        payload: Vec<u8>,
    },
    /// Disconnect a peer with a reason.
    Kick {
        peer: PeerId,
        reason: DisconnectReason,
    },
    /// End the session; the loop exits after processing this.
    Shutdown,
}

/// Everything the worker thread owns for one session.
pub(crate) struct WorkerContext {
    /// Bound, nonblocking socket handed over by the manager.
    pub socket: std::net::UdpSocket,
    /// The transport state machine.
    pub host: Host,
    /// State shared with the application thread.
    pub shared: Arc<Mutex<SessionShared>>,
    /// Notification sink, invoked on this thread.
    pub handler: Arc<dyn NetworkHandler>,
    /// Command channel from the manager.
    pub commands: mpsc::UnboundedReceiver<Command>,
    /// Set by `dispose()`; checked once per loop iteration.
    pub stop: Arc<AtomicBool>,
    /// Fixed service period.
    pub service_interval: Duration,
}

/// Thread entry point. Builds the runtime and runs the service loop to
/// completion; the session is finalized even when setup fails.
pub(crate) fn run(ctx: WorkerContext) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("Failed to build I/O runtime: {}", err);
            finalize(&ctx.shared);
            return;
        }
    };
    runtime.block_on(service_loop(ctx));
}

async fn service_loop(ctx: WorkerContext) {
    let WorkerContext {
        socket,
        mut host,
        shared,
        handler,
        mut commands,
        stop,
        service_interval,
    } = ctx;

    let socket = match UdpSocket::from_std(socket) {
        Ok(socket) => socket,
        Err(err) => {
            error!("Failed to register socket with runtime: {}", err);
            finalize(&shared);
            return;
        }
    };

    let mut tick = interval(service_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }

        tokio::select! {
            _ = tick.tick() => {
                host.service(Instant::now());
            }
            command = commands.recv() => {
                match command {
                    Some(Command::Send { peer, channel, payload }) => {
                        host.queue_send(peer, channel, payload, Instant::now());
                    }
                    Some(Command::Broadcast { channel, payload }) => {
                        host.broadcast(channel, &payload, Instant::now());
                    }
                    Some(Command::Kick { peer, reason }) => {
                        host.kick(peer, reason);
                    }
                    Some(Command::Shutdown) | None => break,
                }
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, addr)) => match protocol::decode(&buf[..len]) {
                        Ok(packet) => host.handle_packet(addr, packet, Instant::now()),
                        Err(err) => debug!("Dropped datagram from {}: {}", addr, err),
                    },
                    // Transient (e.g. ICMP unreachable surfacing); keep serving
                    Err(err) => debug!("Socket receive error: {}", err),
                }
            }
        }

        flush(&socket, &mut host).await;
        if dispatch(&mut host, &shared, handler.as_ref()) {
            break;
        }
    }

    // Best-effort goodbyes before the socket closes
    host.shutdown();
    flush(&socket, &mut host).await;
    finalize(&shared);
    info!("I/O thread stopped");
}

/// Put every queued datagram on the wire.
async fn flush(socket: &UdpSocket, host: &mut Host) {
    for (addr, packet) in host.drain_outgoing() {
        match protocol::encode(&packet) {
            Ok(bytes) => {
                if let Err(err) = socket.send_to(&bytes, addr).await {
                    debug!("Send to {} failed: {}", addr, err);
                }
            }
            Err(err) => warn!("Failed to encode outgoing packet: {}", err),
        }
    }
}

/// Apply host events to the shared session state and notify the handler.
/// Returns true when the session is over and the loop should exit.
fn dispatch(
    host: &mut Host,
    shared: &Arc<Mutex<SessionShared>>,
    handler: &dyn NetworkHandler,
) -> bool {
    let mut session_over = false;

    for event in host.drain_events() {
        match event {
            HostEvent::Connected { peer, client_data } => {
                {
                    let mut session = shared.lock();
                    if host.is_client() {
                        session.state = ConnectionState::Connected;
                    }
                    if let Err(err) = session.peers.insert(peer) {
                        warn!("Dropping {}: {}", peer.id(), err);
                        continue;
                    }
                }
                handler.on_peer_connected(&peer, client_data);
            }
            HostEvent::ConnectFailed { peer, reason } => {
                shared.lock().state = ConnectionState::None;
                handler.on_peer_disconnected(&peer, reason);
                session_over = true;
            }
            HostEvent::Disconnected { peer, reason } => {
                {
                    let mut session = shared.lock();
                    session.peers.remove(peer.id());
                    // Losing the server ends a client session
                    if host.is_client() {
                        session.state = ConnectionState::None;
                        session_over = true;
                    }
                }
                handler.on_peer_disconnected(&peer, reason);
            }
            HostEvent::Packet {
                peer,
                channel,
                payload,
            } => {
                handler.on_packet_received(&peer, channel, &payload);
            }
            HostEvent::RttUpdated { peer, rtt } => {
                shared.lock().peers.set_rtt(peer.id(), rtt);
            }
        }
    }

    session_over
}

/// Leave the shared state the way `dispose()` expects to find it.
fn finalize(shared: &Arc<Mutex<SessionShared>>) {
    let mut session = shared.lock();
    session.peers.clear();
    session.state = ConnectionState::None;
}
