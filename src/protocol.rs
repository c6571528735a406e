//! Wire Protocol
//!
//! Datagram format for the transport session. Every datagram carries
//! exactly one `Packet`, serialized with bincode. Handshake, liveness and
//! acknowledgment traffic shares the socket with application payloads;
//! application data always targets exactly one channel.

use serde::{Deserialize, Serialize};

/// First bytes of every datagram; anything else is dropped on the floor.
pub const PROTOCOL_MAGIC: u16 = 0x4E50;

/// Bumped on every incompatible wire change. Mismatches are rejected
/// during the handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound for an encoded datagram. Conservative single-MTU sizing;
/// this transport does not fragment.
pub const MAX_DATAGRAM: usize = 1280;

/// Largest application payload accepted for a single send.
pub const MAX_PAYLOAD: usize = 1152;

/// Wire protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (should not happen for well-formed packets).
    #[error("Failed to encode packet: {0}")]
    Encode(#[source] bincode::Error),

    /// The datagram is not a well-formed packet.
    #[error("Failed to decode packet: {0}")]
    Decode(#[source] bincode::Error),

    /// The datagram does not start with the protocol magic.
    #[error("Bad protocol magic")]
    BadMagic,

    /// Datagram or payload exceeds the single-datagram bound.
    #[error("Oversized packet of {0} bytes")]
    PayloadTooLarge(usize),
}

/// One datagram on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Always [`PROTOCOL_MAGIC`].
    pub magic: u16,
    /// Always [`PROTOCOL_VERSION`] for traffic we emit.
    pub version: u8,
    /// The actual message.
    pub body: PacketBody,
}

impl Packet {
    /// Wrap a body with the current magic and version.
    pub fn new(body: PacketBody) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            body,
        }
    }
}

/// Message variants carried by a [`Packet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketBody {
    /// Client dials the server. Retransmitted until answered or timed out.
    /// `client_data` is opaque application data passed through the
    /// handshake; `nonce` ties the eventual answer to this attempt.
    ConnectRequest {
        /// Opaque application handshake value.
        client_data: u32,
        /// Attempt nonce, echoed back in the accept.
        nonce: u64,
    },

    /// Server accepted the connection. Echoes the request nonce.
    ConnectAccept {
        /// Nonce from the request being answered.
        nonce: u64,
    },

    /// Server refused the connection.
    ConnectReject {
        /// Encoded [`DisconnectReason`](crate::DisconnectReason).
        reason: u8,
    },

    /// Orderly goodbye, sent best-effort by either side.
    Disconnect {
        /// Encoded [`DisconnectReason`](crate::DisconnectReason).
        reason: u8,
    },

    /// Liveness probe.
    Ping {
        /// Matched against the answering pong.
        nonce: u32,
    },

    /// Answer to a ping, echoing its nonce.
    Pong {
        /// Nonce from the ping being answered.
        nonce: u32,
    },

    /// Application payload on one channel.
    Data {
        /// Encoded [`NetworkChannel`](crate::NetworkChannel).
        channel: u8,
        /// Channel sequence number.
        seq: u32,
        /// Application bytes.
        payload: Vec<u8>,
    },

    /// Acknowledges one reliable `Data` sequence.
    Ack {
        /// Encoded [`NetworkChannel`](crate::NetworkChannel).
        channel: u8,
        /// Sequence being acknowledged.
        seq: u32,
    },
}

/// Serialize a packet into datagram bytes.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
    let bytes = bincode::serialize(packet).map_err(ProtocolError::Encode)?;
    debug_assert!(bytes.len() <= MAX_DATAGRAM);
    Ok(bytes)
}

/// Parse one datagram. Rejects foreign magic and oversized payloads
/// without ever panicking. Version mismatches are passed through: the
/// handshake layer answers them with a reject instead of dropping them
/// silently.
pub fn decode(bytes: &[u8]) -> Result<Packet, ProtocolError> {
    if bytes.len() > MAX_DATAGRAM {
        return Err(ProtocolError::PayloadTooLarge(bytes.len()));
    }
    let packet: Packet = bincode::deserialize(bytes).map_err(ProtocolError::Decode)?;
    if packet.magic != PROTOCOL_MAGIC {
        return Err(ProtocolError::BadMagic);
    }
    if let PacketBody::Data { ref payload, .. } = packet.body {
        if payload.len() > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge(payload.len()));
        }
    }
    Ok(packet)
}
