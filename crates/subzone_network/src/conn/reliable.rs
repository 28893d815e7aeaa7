//! Sliding windows for the reliable stream, one per direction.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use subzone_protocol::SequenceNr;

/// An outgoing reliable payload waiting for its sequence number.
pub(crate) struct Unsent {
    pub payload: Vec<u8>,
    /// Whether this payload is a sized-data chunk (0x0A). Sized wrappers are
    /// tracked so acks can pump the producer.
    pub is_sized: bool,
}

/// A sent-but-unacked wire item. `wire` is the fully framed 0x03 datagram so
/// retransmissions are byte-identical.
pub(crate) struct InFlight {
    pub seq: SequenceNr,
    pub wire: Vec<u8>,
    pub first_send: Instant,
    pub last_send: Instant,
    pub sends: u32,
    pub is_sized: bool,
}

/// Outgoing side: the unsent queue plus the in-flight window. Sequence
/// numbers are assigned only when an item moves to the wire.
#[derive(Default)]
pub(crate) struct SendWindow {
    pub unsent: VecDeque<Unsent>,
    pub inflight: VecDeque<InFlight>,
    next_seq: SequenceNr,
}

impl SendWindow {
    pub(crate) fn queue(&mut self, payload: Vec<u8>, is_sized: bool) {
        self.unsent.push_back(Unsent { payload, is_sized });
    }

    /// Assigns the next wire sequence number.
    pub(crate) fn assign_seq(&mut self) -> SequenceNr {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.next();
        seq
    }

    /// Removes and returns the in-flight item acked by `seq`. Unknown
    /// sequence numbers return `None`; acks are idempotent.
    pub(crate) fn ack(&mut self, seq: SequenceNr) -> Option<InFlight> {
        let pos = self.inflight.iter().position(|i| i.seq == seq)?;
        self.inflight.remove(pos)
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.unsent.is_empty() && self.inflight.is_empty()
    }
}

/// What [`RecvWindow::accept`] decided about an incoming reliable.
pub(crate) struct Accepted {
    /// In-order payloads now deliverable (the new packet and anything it
    /// unblocked from the stash), in sequence order.
    pub delivered: Vec<Bytes>,
    /// The packet was a duplicate or out of window. It is still acked.
    pub duplicate: bool,
}

/// Incoming side: the next expected sequence number and a bounded stash of
/// out-of-order packets.
pub(crate) struct RecvWindow {
    next_in: SequenceNr,
    window: u32,
    stash: FxHashMap<u32, Bytes>,
}

impl RecvWindow {
    pub(crate) fn new(window: u32) -> Self {
        Self {
            next_in: SequenceNr(0),
            window,
            stash: FxHashMap::default(),
        }
    }

    /// Accepts one reliable packet. Every packet is acked by the caller
    /// regardless of the outcome; at most one payload per sequence number is
    /// ever delivered.
    pub(crate) fn accept(&mut self, seq: SequenceNr, payload: Bytes) -> Accepted {
        if seq == self.next_in {
            let mut delivered = vec![payload];
            self.next_in = self.next_in.next();
            // Drain anything now contiguous.
            while let Some(stashed) = self.stash.remove(&self.next_in.0) {
                delivered.push(stashed);
                self.next_in = self.next_in.next();
            }
            return Accepted {
                delivered,
                duplicate: false,
            };
        }

        // Not the expected one: stash if ahead but within the window,
        // otherwise it is old or absurd and gets dropped (the ack will stop
        // the peer retransmitting).
        if seq.in_window(self.next_in, self.window) {
            let duplicate = self.stash.insert(seq.0, payload).is_some();
            Accepted {
                delivered: Vec::new(),
                duplicate,
            }
        } else {
            Accepted {
                delivered: Vec::new(),
                duplicate: true,
            }
        }
    }

    pub(crate) fn next_expected(&self) -> SequenceNr {
        self.next_in
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn b(v: u8) -> Bytes {
        Bytes::from(vec![v])
    }

    #[test]
    fn in_order_delivery() {
        let mut w = RecvWindow::new(64);
        assert_eq!(w.accept(SequenceNr(0), b(0)).delivered.len(), 1);
        assert_eq!(w.accept(SequenceNr(1), b(1)).delivered.len(), 1);
        assert_eq!(w.next_expected(), SequenceNr(2));
    }

    #[test]
    fn reorder_drains_stash_in_order() {
        let mut w = RecvWindow::new(64);
        assert!(w.accept(SequenceNr(2), b(2)).delivered.is_empty());
        assert!(w.accept(SequenceNr(1), b(1)).delivered.is_empty());

        let out = w.accept(SequenceNr(0), b(0));
        let vals: Vec<u8> = out.delivered.iter().map(|d| d[0]).collect();
        assert_eq!(vals, vec![0, 1, 2]);
        assert_eq!(w.next_expected(), SequenceNr(3));
    }

    #[test]
    fn duplicates_are_not_redelivered() {
        let mut w = RecvWindow::new(64);
        assert!(!w.accept(SequenceNr(0), b(0)).duplicate);
        let again = w.accept(SequenceNr(0), b(0));
        assert!(again.duplicate);
        assert!(again.delivered.is_empty());

        // A duplicate of something still in the stash, too.
        assert!(!w.accept(SequenceNr(5), b(5)).duplicate);
        assert!(w.accept(SequenceNr(5), b(5)).duplicate);
    }

    #[test]
    fn out_of_window_is_dropped() {
        let mut w = RecvWindow::new(64);
        let out = w.accept(SequenceNr(64), b(9));
        assert!(out.duplicate);
        assert!(out.delivered.is_empty());

        // Nothing was stashed: delivering 0..=63 does not surface seq 64's
        // dropped payload.
        for s in 0..64u32 {
            w.accept(SequenceNr(s), b(s as u8));
        }
        assert_eq!(w.next_expected(), SequenceNr(64));
    }

    #[test]
    fn wraparound_crosses_zero() {
        let start = SequenceNr(u32::MAX - 1);
        let mut w = RecvWindow {
            next_in: start,
            window: 64,
            stash: FxHashMap::default(),
        };

        // Deliver out of order across the wrap point.
        assert!(w.accept(SequenceNr(0), b(2)).delivered.is_empty());
        assert!(w.accept(SequenceNr(u32::MAX), b(1)).delivered.is_empty());
        let out = w.accept(start, b(0));
        let vals: Vec<u8> = out.delivered.iter().map(|d| d[0]).collect();
        assert_eq!(vals, vec![0, 1, 2]);
        assert_eq!(w.next_expected(), SequenceNr(1));
    }

    #[test]
    fn send_window_acks_are_idempotent() {
        let mut w = SendWindow::default();
        let now = Instant::now();
        let seq = w.assign_seq();
        w.inflight.push_back(InFlight {
            seq,
            wire: vec![0],
            first_send: now,
            last_send: now,
            sends: 1,
            is_sized: false,
        });

        assert!(w.ack(seq).is_some());
        assert!(w.ack(seq).is_none());
        assert!(w.ack(SequenceNr(999)).is_none());
        assert!(w.is_drained());
    }
}
