//! # Netplay Transport
//!
//! Multiplayer transport layer: one [`NetworkManager`] runs one session
//! (a client dialing a remote host, or a server accepting peers) over UDP
//! with per-channel delivery guarantees, and reports everything that
//! happens through a [`NetworkHandler`] on a dedicated I/O thread.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      NETPLAY TRANSPORT                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  manager.rs     - NetworkManager facade, session state       │
//! │  worker.rs      - dedicated I/O thread service loop          │
//! │  host.rs        - handshake/liveness/dispatch state machine  │
//! │  reliability.rs - per-channel delivery policy state          │
//! │  protocol.rs    - datagram wire format                       │
//! │  peer.rs        - peer handles and bookkeeping               │
//! │  channel.rs     - logical channels and their policies        │
//! │  handler.rs     - notification interface, disconnect reasons │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Threading Contract
//!
//! Exactly two actors touch a session: the application thread (the public
//! API) and one background I/O thread that exclusively owns the socket
//! and transport state. The peer collection and connection state they
//! share sit behind one mutex held only for short critical sections,
//! never across a handler callback or a socket operation. `dispose()` is
//! signal-then-join: when it returns, the I/O thread is gone and the
//! socket is released.
//!
//! ## Channels
//!
//! [`NetworkChannel::Main`] is reliable and ordered: a payload arrives
//! exactly once in send order, or the peer is reported disconnected.
//! [`NetworkChannel::UnreliableUpdates`] is unreliable and sequenced:
//! payloads may be dropped, but none is delivered twice or after a newer
//! one. Use it for frequent, loss-tolerant state and keep control
//! traffic off its latency path.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod channel;
pub mod handler;
pub mod manager;
pub mod peer;
pub mod protocol;

mod host;
mod reliability;
mod worker;

// Re-export the public surface
pub use channel::{Delivery, NetworkChannel, CHANNEL_COUNT};
pub use handler::{DisconnectReason, NetworkHandler};
pub use manager::{ConnectionState, NetConfig, NetworkManager, MAX_PEER_COUNT, SERVICE_INTERVAL};
pub use peer::{Peer, PeerId};
pub use protocol::{MAX_PAYLOAD, PROTOCOL_VERSION};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
