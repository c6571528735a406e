//! Logical Delivery Channels
//!
//! A session multiplexes a small, fixed set of logical streams over one
//! socket. Each channel has a delivery policy chosen at design time, not
//! per message: control traffic must never be lost or reordered, while
//! high-frequency state updates prefer low latency over guarantees.

/// Number of logical channels multiplexed over a session.
pub const CHANNEL_COUNT: usize = 2;

/// Identifies one logical delivery stream within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NetworkChannel {
    /// Reliable, ordered control stream.
    Main,
    /// Unreliable, sequenced stream for high-frequency state updates.
    UnreliableUpdates,
}

/// Delivery guarantees attached to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Every payload arrives exactly once, in send order, or the peer is
    /// reported disconnected.
    ReliableOrdered,
    /// Payloads may be dropped; stale arrivals are discarded so nothing is
    /// delivered twice or after a newer payload.
    UnreliableSequenced,
}

impl NetworkChannel {
    /// Delivery policy for this channel. Fixed at compile time.
    pub fn delivery(self) -> Delivery {
        match self {
            NetworkChannel::Main => Delivery::ReliableOrdered,
            NetworkChannel::UnreliableUpdates => Delivery::UnreliableSequenced,
        }
    }

    /// Wire representation.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse the wire byte. Unknown values are a protocol error upstream.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(NetworkChannel::Main),
            1 => Some(NetworkChannel::UnreliableUpdates),
            _ => None,
        }
    }
}
