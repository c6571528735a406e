//! Peer Handles and Bookkeeping
//!
//! A `Peer` is the opaque handle one remote endpoint is known by for the
//! lifetime of its connection. The manager's `PeerTable` is the sole owner
//! of peer bookkeeping; callers only ever borrow a `Peer` for the duration
//! of a call or callback.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Manager-assigned peer slot identity. Stable for the lifetime of the
/// connection; never reassigned to another endpoint while this one is
/// connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub(crate) u16);

impl PeerId {
    /// Raw slot value, for diagnostics and logging.
    pub fn value(self) -> u16 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Handle to one remote endpoint of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    id: PeerId,
    addr: SocketAddr,
}

impl Peer {
    pub(crate) fn new(id: PeerId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    /// Slot identity assigned by the manager.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Remote socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Bookkeeping for one connected peer.
#[derive(Debug, Clone)]
pub(crate) struct PeerEntry {
    /// Public handle.
    pub peer: Peer,
    /// Smoothed round-trip estimate, for diagnostics.
    pub rtt: Option<Duration>,
}

/// Peer table errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub(crate) enum PeerTableError {
    /// Every slot is taken.
    #[error("Peer table is full")]
    TableFull,
}

/// The manager-owned peer collection, guarded by the shared session mutex.
///
/// Invariant: `len() <= capacity` for every reachable sequence of
/// insertions and removals.
#[derive(Debug)]
pub(crate) struct PeerTable {
    entries: BTreeMap<PeerId, PeerEntry>,
    capacity: usize,
}

impl PeerTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity,
        }
    }

    /// Insert a freshly connected peer. Fails when the table is at
    /// capacity; the handshake layer rejects before this fires, so a full
    /// table here means a bookkeeping bug upstream.
    pub fn insert(&mut self, peer: Peer) -> Result<(), PeerTableError> {
        if self.entries.len() >= self.capacity {
            return Err(PeerTableError::TableFull);
        }
        self.entries.insert(peer.id(), PeerEntry { peer, rtt: None });
        Ok(())
    }

    /// Remove a peer. Returns the handle when it was present.
    pub fn remove(&mut self, id: PeerId) -> Option<Peer> {
        self.entries.remove(&id).map(|entry| entry.peer)
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerEntry> {
        self.entries.get(&id)
    }

    /// Record a fresh round-trip estimate for diagnostics.
    pub fn set_rtt(&mut self, id: PeerId, rtt: Duration) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.rtt = Some(rtt);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of all connected peer handles.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.entries.values().map(|entry| entry.peer).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: u16) -> Peer {
        Peer::new(PeerId(id), format!("127.0.0.1:{}", 40000 + id).parse().unwrap())
    }

    #[test]
    fn test_capacity_enforced() {
        let mut table = PeerTable::new(2);
        table.insert(peer(0)).unwrap();
        table.insert(peer(1)).unwrap();
        assert_eq!(table.insert(peer(2)), Err(PeerTableError::TableFull));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_frees_slot() {
        let mut table = PeerTable::new(1);
        table.insert(peer(0)).unwrap();
        assert!(table.remove(PeerId(0)).is_some());
        assert!(table.is_empty());
        table.insert(peer(1)).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_missing_is_none() {
        let mut table = PeerTable::new(4);
        assert!(table.remove(PeerId(9)).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_rtt_tracking() {
        let mut table = PeerTable::new(4);
        table.insert(peer(0)).unwrap();
        assert_eq!(table.get(PeerId(0)).unwrap().rtt, None);

        table.set_rtt(PeerId(0), Duration::from_millis(23));
        assert_eq!(table.get(PeerId(0)).unwrap().rtt, Some(Duration::from_millis(23)));

        // Unknown peers are ignored
        table.set_rtt(PeerId(7), Duration::from_millis(1));
    }

    #[test]
    fn test_snapshot_lists_all() {
        let mut table = PeerTable::new(8);
        for i in 0..3 {
            table.insert(peer(i)).unwrap();
        }
        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.iter().any(|p| p.id() == PeerId(1)));
    }
}
