//! Handler Interface
//!
//! The capability the session layer hands to the transport. All three
//! notifications are invoked on the I/O thread with no internal lock held;
//! implementations must return promptly and must not call back into
//! blocking transport operations.

use crate::channel::NetworkChannel;
use crate::peer::Peer;

/// Why a peer left the session, carried with disconnect notifications and
/// kick requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    /// Orderly goodbye from the remote endpoint.
    Disconnected,
    /// A client's connection attempt was refused or could not complete.
    ConnectionFailed,
    /// No traffic from the peer within the liveness window.
    TimedOut,
    /// The server has no free peer slot.
    ServerFull,
    /// Handshake protocol version mismatch.
    IncompatibleProtocol,
    /// The server is shutting down.
    ServerStopped,
    /// The application requested the disconnect.
    Kicked,
}

impl DisconnectReason {
    /// Wire representation.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse the wire byte. Unknown values degrade to a plain goodbye
    /// rather than failing the datagram.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => DisconnectReason::ConnectionFailed,
            2 => DisconnectReason::TimedOut,
            3 => DisconnectReason::ServerFull,
            4 => DisconnectReason::IncompatibleProtocol,
            5 => DisconnectReason::ServerStopped,
            6 => DisconnectReason::Kicked,
            _ => DisconnectReason::Disconnected,
        }
    }
}

/// Asynchronous transport notifications, delivered on the I/O thread.
///
/// Ordering per peer: `on_peer_connected` first, then any number of
/// `on_packet_received` in transport order, then `on_peer_disconnected`
/// last. No ordering is guaranteed across different peers.
pub trait NetworkHandler: Send + Sync + 'static {
    /// A peer completed the handshake. On a server this fires once per
    /// accepted client (with the client's opaque handshake data); on a
    /// client it fires once for the server endpoint when the outbound
    /// connection is accepted.
    fn on_peer_connected(&self, peer: &Peer, client_data: u32);

    /// A peer left: orderly goodbye, kick, timeout or failed connect
    /// attempt. Always the last notification for that peer.
    fn on_peer_disconnected(&self, peer: &Peer, reason: DisconnectReason);

    /// A payload arrived from a connected peer. The slice is only valid
    /// for the duration of the call.
    fn on_packet_received(&self, peer: &Peer, channel: NetworkChannel, payload: &[u8]);
}
