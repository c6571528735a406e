//! Transport Host
//!
//! The connection/handshake/liveness state machine for one session, in
//! either the client (dialing) or server (accepting) role. The host never
//! touches a socket or the system clock: the I/O worker feeds it decoded
//! packets together with an explicit `Instant` and flushes the datagrams
//! it queues. That keeps every handshake and reliability rule testable by
//! shuttling packets between two hosts in memory.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::channel::{Delivery, NetworkChannel};
use crate::handler::DisconnectReason;
use crate::manager::NetConfig;
use crate::peer::{Peer, PeerId};
use crate::protocol::{Packet, PacketBody, PROTOCOL_VERSION};
use crate::reliability::{ReliableEndpoint, UnreliableEndpoint};

/// Fallback retransmission timeout before the first RTT sample.
const DEFAULT_RTO: Duration = Duration::from_millis(200);
/// Clamp bounds for the RTT-derived retransmission timeout.
const MIN_RTO: Duration = Duration::from_millis(100);
const MAX_RTO: Duration = Duration::from_secs(1);

/// Transport events surfaced to the worker for dispatch.
#[derive(Debug)]
pub(crate) enum HostEvent {
    /// A peer completed the handshake.
    Connected {
        /// The new peer.
        peer: Peer,
        /// Opaque handshake value (zero on the client side).
        client_data: u32,
    },
    /// The client's connection attempt ended without a session.
    ConnectFailed {
        /// Handle for the endpoint that was being dialed.
        peer: Peer,
        /// Why the attempt failed.
        reason: DisconnectReason,
    },
    /// A connected peer left.
    Disconnected {
        /// The departed peer.
        peer: Peer,
        /// Why it left.
        reason: DisconnectReason,
    },
    /// Application payload delivered by a channel endpoint.
    Packet {
        /// Originating peer.
        peer: Peer,
        /// Channel the payload arrived on.
        channel: NetworkChannel,
        /// Application bytes.
        payload: Vec<u8>,
    },
    /// Fresh round-trip estimate for a peer.
    RttUpdated {
        /// The measured peer.
        peer: Peer,
        /// Smoothed estimate.
        rtt: Duration,
    },
}

/// Session role, fixed for the host's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// Client dial progress.
#[derive(Debug)]
struct Dial {
    server_addr: SocketAddr,
    client_data: u32,
    nonce: u64,
    started: Instant,
    last_sent: Instant,
}

/// Per-peer transport state, owned exclusively by the I/O thread.
struct RemotePeer {
    peer: Peer,
    /// Nonce of the accepted handshake, kept to answer retransmitted
    /// connect requests idempotently (server role).
    accept_nonce: Option<u64>,
    main: ReliableEndpoint,
    updates: UnreliableEndpoint,
    last_recv: Instant,
    last_ping_sent: Instant,
    outstanding_ping: Option<(u32, Instant)>,
    ping_counter: u32,
    srtt: Option<Duration>,
}

impl RemotePeer {
    fn new(peer: Peer, accept_nonce: Option<u64>, config: &NetConfig, now: Instant) -> Self {
        Self {
            peer,
            accept_nonce,
            main: ReliableEndpoint::new(config.reorder_capacity),
            updates: UnreliableEndpoint::new(),
            last_recv: now,
            last_ping_sent: now,
            outstanding_ping: None,
            ping_counter: 0,
            srtt: None,
        }
    }

    /// Retransmission timeout derived from the smoothed RTT.
    fn rto(&self) -> Duration {
        match self.srtt {
            Some(srtt) => (srtt * 2).clamp(MIN_RTO, MAX_RTO),
            None => DEFAULT_RTO,
        }
    }

    fn observe_rtt(&mut self, sample: Duration) {
        // Standard 7/8 smoothing
        self.srtt = Some(match self.srtt {
            Some(srtt) => (srtt * 7 + sample) / 8,
            None => sample,
        });
    }
}

/// The transport host state machine.
pub(crate) struct Host {
    role: Role,
    config: NetConfig,
    peers: HashMap<PeerId, RemotePeer>,
    by_addr: HashMap<SocketAddr, PeerId>,
    next_peer_id: u16,
    dial: Option<Dial>,
    events: Vec<HostEvent>,
    outgoing: Vec<(SocketAddr, Packet)>,
}

impl Host {
    /// Client-role host: queues the first connect request immediately and
    /// keeps dialing until answered or timed out.
    pub fn new_client(
        server_addr: SocketAddr,
        client_data: u32,
        config: NetConfig,
        now: Instant,
    ) -> Self {
        let nonce: u64 = rand::random();
        let mut host = Self {
            role: Role::Client,
            config,
            peers: HashMap::new(),
            by_addr: HashMap::new(),
            next_peer_id: 1,
            dial: Some(Dial {
                server_addr,
                client_data,
                nonce,
                started: now,
                last_sent: now,
            }),
            events: Vec::new(),
            outgoing: Vec::new(),
        };
        debug!("Dialing {} (nonce {})", server_addr, hex::encode(nonce.to_be_bytes()));
        host.send(server_addr, PacketBody::ConnectRequest { client_data, nonce });
        host
    }

    /// Server-role host: accepts up to `max_peers` concurrent peers.
    pub fn new_server(config: NetConfig) -> Self {
        Self {
            role: Role::Server,
            config,
            peers: HashMap::new(),
            by_addr: HashMap::new(),
            next_peer_id: 1,
            dial: None,
            events: Vec::new(),
            outgoing: Vec::new(),
        }
    }

    pub fn is_client(&self) -> bool {
        self.role == Role::Client
    }

    /// Transport events produced since the last drain.
    pub fn drain_events(&mut self) -> Vec<HostEvent> {
        std::mem::take(&mut self.events)
    }

    /// Datagrams queued since the last drain.
    pub fn drain_outgoing(&mut self) -> Vec<(SocketAddr, Packet)> {
        std::mem::take(&mut self.outgoing)
    }

    fn send(&mut self, addr: SocketAddr, body: PacketBody) {
        self.outgoing.push((addr, Packet::new(body)));
    }

    /// Feed one decoded datagram.
    pub fn handle_packet(&mut self, addr: SocketAddr, packet: Packet, now: Instant) {
        if packet.version != PROTOCOL_VERSION {
            // Answer mismatched dials politely; drop everything else
            if matches!(packet.body, PacketBody::ConnectRequest { .. }) {
                self.send(
                    addr,
                    PacketBody::ConnectReject {
                        reason: DisconnectReason::IncompatibleProtocol.as_u8(),
                    },
                );
            } else {
                debug!("Dropped version {} packet from {}", packet.version, addr);
            }
            return;
        }

        match packet.body {
            PacketBody::ConnectRequest { client_data, nonce } => {
                self.on_connect_request(addr, client_data, nonce, now);
            }
            PacketBody::ConnectAccept { nonce } => {
                self.on_connect_accept(addr, nonce, now);
            }
            PacketBody::ConnectReject { reason } => {
                self.on_connect_reject(addr, DisconnectReason::from_u8(reason));
            }
            PacketBody::Disconnect { reason } => {
                if let Some(&id) = self.by_addr.get(&addr) {
                    self.remove_peer(id, DisconnectReason::from_u8(reason));
                }
            }
            PacketBody::Ping { nonce } => {
                if let Some(&id) = self.by_addr.get(&addr) {
                    self.touch(id, now);
                    self.send(addr, PacketBody::Pong { nonce });
                }
            }
            PacketBody::Pong { nonce } => {
                if let Some(&id) = self.by_addr.get(&addr) {
                    self.touch(id, now);
                    self.on_pong(id, nonce, now);
                }
            }
            PacketBody::Data { channel, seq, payload } => {
                if let Some(&id) = self.by_addr.get(&addr) {
                    self.touch(id, now);
                    self.on_data(id, channel, seq, payload);
                } else {
                    trace!("Data from unknown {}", addr);
                }
            }
            PacketBody::Ack { channel, seq } => {
                if let Some(&id) = self.by_addr.get(&addr) {
                    self.touch(id, now);
                    self.on_ack(id, channel, seq);
                }
            }
        }
    }

    fn touch(&mut self, id: PeerId, now: Instant) {
        if let Some(remote) = self.peers.get_mut(&id) {
            remote.last_recv = now;
        }
    }

    fn on_connect_request(&mut self, addr: SocketAddr, client_data: u32, nonce: u64, now: Instant) {
        if self.role != Role::Server {
            debug!("Ignoring connect request from {} in client role", addr);
            return;
        }

        // Handshake retransmit from an already-accepted peer
        if let Some(&id) = self.by_addr.get(&addr) {
            if let Some(remote) = self.peers.get_mut(&id) {
                if remote.accept_nonce == Some(nonce) {
                    remote.last_recv = now;
                    self.send(addr, PacketBody::ConnectAccept { nonce });
                } else {
                    // A different attempt from an occupied address; let the
                    // stale session time out first
                    debug!("Ignoring re-dial from occupied address {}", addr);
                }
            }
            return;
        }

        if self.peers.len() >= self.config.max_peers {
            info!("Rejecting {}: server full ({} peers)", addr, self.peers.len());
            self.send(
                addr,
                PacketBody::ConnectReject {
                    reason: DisconnectReason::ServerFull.as_u8(),
                },
            );
            return;
        }

        let id = PeerId(self.next_peer_id);
        self.next_peer_id = self.next_peer_id.wrapping_add(1);
        let peer = Peer::new(id, addr);
        self.peers
            .insert(id, RemotePeer::new(peer, Some(nonce), &self.config, now));
        self.by_addr.insert(addr, id);
        self.send(addr, PacketBody::ConnectAccept { nonce });
        info!("Accepted {} from {}", id, addr);
        self.events.push(HostEvent::Connected { peer, client_data });
    }

    fn on_connect_accept(&mut self, addr: SocketAddr, nonce: u64, now: Instant) {
        let dial = match self.dial.take() {
            Some(dial) => dial,
            None => return,
        };
        if addr != dial.server_addr || nonce != dial.nonce {
            debug!("Ignoring stray connect accept from {}", addr);
            self.dial = Some(dial);
            return;
        }

        let id = PeerId(0);
        let peer = Peer::new(id, addr);
        self.peers
            .insert(id, RemotePeer::new(peer, None, &self.config, now));
        self.by_addr.insert(addr, id);
        info!("Connected to {}", addr);
        self.events.push(HostEvent::Connected {
            peer,
            client_data: 0,
        });
    }

    fn on_connect_reject(&mut self, addr: SocketAddr, reason: DisconnectReason) {
        let dial = match self.dial.take() {
            Some(dial) => dial,
            None => return,
        };
        if addr != dial.server_addr {
            self.dial = Some(dial);
            return;
        }
        info!("Connection to {} rejected: {:?}", addr, reason);
        self.events.push(HostEvent::ConnectFailed {
            peer: Peer::new(PeerId(0), dial.server_addr),
            reason,
        });
    }

    fn on_pong(&mut self, id: PeerId, nonce: u32, now: Instant) {
        let remote = match self.peers.get_mut(&id) {
            Some(remote) => remote,
            None => return,
        };
        if let Some((expected, sent_at)) = remote.outstanding_ping {
            if expected == nonce {
                remote.outstanding_ping = None;
                remote.observe_rtt(now.duration_since(sent_at));
                let peer = remote.peer;
                if let Some(rtt) = remote.srtt {
                    self.events.push(HostEvent::RttUpdated { peer, rtt });
                }
            }
        }
    }

    fn on_data(&mut self, id: PeerId, channel_byte: u8, seq: u32, payload: Vec<u8>) {
        let channel = match NetworkChannel::from_u8(channel_byte) {
            Some(channel) => channel,
            None => {
                debug!("Dropped data on unknown channel {}", channel_byte);
                return;
            }
        };
        let remote = match self.peers.get_mut(&id) {
            Some(remote) => remote,
            None => return,
        };
        let peer = remote.peer;
        let addr = peer.addr();

        match channel.delivery() {
            Delivery::ReliableOrdered => {
                let result = remote.main.receive(seq, payload);
                if let Some(ack) = result.ack {
                    self.send(
                        addr,
                        PacketBody::Ack {
                            channel: channel.as_u8(),
                            seq: ack,
                        },
                    );
                }
                for delivered in result.deliver {
                    self.events.push(HostEvent::Packet {
                        peer,
                        channel,
                        payload: delivered,
                    });
                }
            }
            Delivery::UnreliableSequenced => {
                if remote.updates.accept(seq) {
                    self.events.push(HostEvent::Packet {
                        peer,
                        channel,
                        payload,
                    });
                }
            }
        }
    }

    fn on_ack(&mut self, id: PeerId, channel_byte: u8, seq: u32) {
        if NetworkChannel::from_u8(channel_byte).map(NetworkChannel::delivery)
            != Some(Delivery::ReliableOrdered)
        {
            return;
        }
        if let Some(remote) = self.peers.get_mut(&id) {
            remote.main.acknowledge(seq);
        }
    }

    /// Enqueue an application payload for one peer, honoring the
    /// channel's delivery policy. Unknown peers are tolerated: the caller
    /// may hold a handle whose peer has already disconnected.
    pub fn queue_send(&mut self, id: PeerId, channel: NetworkChannel, payload: Vec<u8>, now: Instant) {
        let remote = match self.peers.get_mut(&id) {
            Some(remote) => remote,
            None => {
                trace!("Dropping send to departed {}", id);
                return;
            }
        };
        let addr = remote.peer.addr();
        let seq = match channel.delivery() {
            Delivery::ReliableOrdered => remote.main.queue_send(payload.clone(), now),
            Delivery::UnreliableSequenced => remote.updates.next_send_seq(),
        };
        self.send(
            addr,
            PacketBody::Data {
                channel: channel.as_u8(),
                seq,
                payload,
            },
        );
    }

    /// Fan a payload out to every connected peer against one consistent
    /// snapshot of the peer set.
    pub fn broadcast(&mut self, channel: NetworkChannel, payload: &[u8], now: Instant) {
        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            self.queue_send(id, channel, payload.to_vec(), now);
        }
    }

    /// Request disconnection of a peer: best-effort goodbye datagram,
    /// immediate removal, local disconnect event with the given reason.
    pub fn kick(&mut self, id: PeerId, reason: DisconnectReason) {
        let addr = match self.peers.get(&id) {
            Some(remote) => remote.peer.addr(),
            None => return,
        };
        self.send(
            addr,
            PacketBody::Disconnect {
                reason: reason.as_u8(),
            },
        );
        self.remove_peer(id, reason);
    }

    fn remove_peer(&mut self, id: PeerId, reason: DisconnectReason) {
        if let Some(remote) = self.peers.remove(&id) {
            self.by_addr.remove(&remote.peer.addr());
            info!("{} left: {:?}", id, reason);
            self.events.push(HostEvent::Disconnected {
                peer: remote.peer,
                reason,
            });
        }
    }

    /// One fixed-period service pass: dial retries, retransmissions,
    /// liveness pings and timeout bookkeeping.
    pub fn service(&mut self, now: Instant) {
        self.service_dial(now);

        let mut lost: Vec<PeerId> = Vec::new();
        let mut sends: Vec<(SocketAddr, PacketBody)> = Vec::new();

        for (&id, remote) in self.peers.iter_mut() {
            if now.duration_since(remote.last_recv) > self.config.peer_timeout {
                warn!("{} timed out", id);
                lost.push(id);
                continue;
            }

            let rto = remote.rto();
            let retransmits =
                remote
                    .main
                    .due_retransmits(now, rto, self.config.max_transmissions);
            if retransmits.exhausted {
                warn!("{} unreachable: retry budget exhausted", id);
                lost.push(id);
                continue;
            }
            for (seq, payload) in retransmits.resend {
                trace!("Retransmitting seq {} to {}", seq, id);
                sends.push((
                    remote.peer.addr(),
                    PacketBody::Data {
                        channel: NetworkChannel::Main.as_u8(),
                        seq,
                        payload,
                    },
                ));
            }

            if now.duration_since(remote.last_ping_sent) >= self.config.ping_interval {
                remote.ping_counter = remote.ping_counter.wrapping_add(1);
                let nonce = remote.ping_counter;
                remote.last_ping_sent = now;
                remote.outstanding_ping = Some((nonce, now));
                sends.push((remote.peer.addr(), PacketBody::Ping { nonce }));
            }
        }

        for (addr, body) in sends {
            self.send(addr, body);
        }
        for id in lost {
            self.remove_peer(id, DisconnectReason::TimedOut);
        }
    }

    fn service_dial(&mut self, now: Instant) {
        let dial = match self.dial.as_mut() {
            Some(dial) => dial,
            None => return,
        };
        if now.duration_since(dial.started) > self.config.connect_timeout {
            let server_addr = dial.server_addr;
            self.dial = None;
            warn!("Connection attempt to {} timed out", server_addr);
            self.events.push(HostEvent::ConnectFailed {
                peer: Peer::new(PeerId(0), server_addr),
                reason: DisconnectReason::TimedOut,
            });
            return;
        }
        if now.duration_since(dial.last_sent) >= self.config.connect_resend_interval {
            dial.last_sent = now;
            let addr = dial.server_addr;
            let body = PacketBody::ConnectRequest {
                client_data: dial.client_data,
                nonce: dial.nonce,
            };
            self.send(addr, body);
        }
    }

    /// Best-effort goodbye to every peer, then forget them all. Run once
    /// on session teardown; no local events are emitted for these.
    pub fn shutdown(&mut self) {
        let reason = match self.role {
            Role::Client => DisconnectReason::Disconnected,
            Role::Server => DisconnectReason::ServerStopped,
        };
        let addrs: Vec<SocketAddr> = self.peers.values().map(|r| r.peer.addr()).collect();
        for addr in addrs {
            self.send(
                addr,
                PacketBody::Disconnect {
                    reason: reason.as_u8(),
                },
            );
        }
        self.peers.clear();
        self.by_addr.clear();
        self.dial = None;
    }
}
