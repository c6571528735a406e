//! Channel Reliability Policy
//!
//! Per-peer, per-channel endpoint state. The reliable-ordered endpoint
//! guarantees exactly-once, in-order delivery (or the peer is declared
//! lost); the unreliable-sequenced endpoint trades guarantees for latency
//! and only filters duplicates and stale arrivals. Both are pure state
//! machines: the host feeds them sequences and an explicit clock.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// Wrapping comparison: is `a` strictly newer than `b`?
pub(crate) fn seq_newer(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < u32::MAX / 2
}

/// One payload awaiting acknowledgment.
#[derive(Debug)]
struct PendingSend {
    seq: u32,
    payload: Vec<u8>,
    last_sent: Instant,
    transmissions: u32,
}

/// Result of feeding an inbound reliable `Data` packet.
#[derive(Debug, Default)]
pub(crate) struct ReliableReceive {
    /// Payloads now deliverable, in order.
    pub deliver: Vec<Vec<u8>>,
    /// Sequence to acknowledge, when the packet was accepted or is a
    /// duplicate of one already accepted.
    pub ack: Option<u32>,
}

/// Retransmission pass outcome.
#[derive(Debug, Default)]
pub(crate) struct Retransmits {
    /// Sequence/payload pairs to put back on the wire.
    pub resend: Vec<(u32, Vec<u8>)>,
    /// A payload exhausted its retry budget; the peer is lost.
    pub exhausted: bool,
}

/// Reliable-ordered endpoint state for one channel of one peer.
#[derive(Debug)]
pub(crate) struct ReliableEndpoint {
    next_seq: u32,
    unacked: VecDeque<PendingSend>,
    expected_seq: u32,
    reorder: BTreeMap<u32, Vec<u8>>,
    reorder_capacity: usize,
}

impl ReliableEndpoint {
    pub fn new(reorder_capacity: usize) -> Self {
        Self {
            next_seq: 0,
            unacked: VecDeque::new(),
            expected_seq: 0,
            reorder: BTreeMap::new(),
            reorder_capacity,
        }
    }

    /// Assign the next outgoing sequence and keep the payload for
    /// retransmission until acknowledged.
    pub fn queue_send(&mut self, payload: Vec<u8>, now: Instant) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.unacked.push_back(PendingSend {
            seq,
            payload,
            last_sent: now,
            transmissions: 1,
        });
        seq
    }

    /// Drop the acknowledged payload from the retransmit queue.
    pub fn acknowledge(&mut self, seq: u32) {
        self.unacked.retain(|pending| pending.seq != seq);
    }

    /// Feed an inbound `Data` sequence. Duplicates are re-acknowledged so
    /// the sender stops retransmitting; out-of-order arrivals are buffered
    /// up to the reorder bound and acknowledged; arrivals past the bound
    /// are dropped unacknowledged and will be retransmitted later.
    pub fn receive(&mut self, seq: u32, payload: Vec<u8>) -> ReliableReceive {
        let mut result = ReliableReceive::default();

        if seq == self.expected_seq {
            result.ack = Some(seq);
            result.deliver.push(payload);
            self.expected_seq = self.expected_seq.wrapping_add(1);
            // Drain buffered successors now in order
            while let Some(next) = self.reorder.remove(&self.expected_seq) {
                result.deliver.push(next);
                self.expected_seq = self.expected_seq.wrapping_add(1);
            }
        } else if seq_newer(seq, self.expected_seq) {
            if self.reorder.contains_key(&seq) {
                result.ack = Some(seq);
            } else if self.reorder.len() < self.reorder_capacity {
                self.reorder.insert(seq, payload);
                result.ack = Some(seq);
            }
        } else {
            // Already delivered; the ack must have been lost
            result.ack = Some(seq);
        }

        result
    }

    /// Collect payloads whose retransmission timer expired. `rto` is the
    /// current retransmission timeout for the peer.
    pub fn due_retransmits(
        &mut self,
        now: Instant,
        rto: Duration,
        max_transmissions: u32,
    ) -> Retransmits {
        let mut result = Retransmits::default();
        for pending in self.unacked.iter_mut() {
            if now.duration_since(pending.last_sent) < rto {
                continue;
            }
            if pending.transmissions >= max_transmissions {
                result.exhausted = true;
                break;
            }
            pending.last_sent = now;
            pending.transmissions += 1;
            result.resend.push((pending.seq, pending.payload.clone()));
        }
        result
    }

    /// Payloads still awaiting acknowledgment.
    pub fn in_flight(&self) -> usize {
        self.unacked.len()
    }
}

/// Unreliable-sequenced endpoint state for one channel of one peer.
#[derive(Debug, Default)]
pub(crate) struct UnreliableEndpoint {
    next_seq: u32,
    last_delivered: Option<u32>,
}

impl UnreliableEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next outgoing sequence. Nothing is retained; loss is
    /// acceptable on this channel.
    pub fn next_send_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// Newest-wins filter: accept only sequences newer than the last one
    /// delivered, so duplicates and stale arrivals are discarded.
    pub fn accept(&mut self, seq: u32) -> bool {
        match self.last_delivered {
            Some(last) if !seq_newer(seq, last) => false,
            _ => {
                self.last_delivered = Some(seq);
                true
            }
        }
    }
}
