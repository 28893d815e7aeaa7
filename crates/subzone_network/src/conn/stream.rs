//! Big-data assembly (incoming) and sized-data producer state (outgoing).

use rustc_hash::FxHashSet;
use tracing::debug;

/// Reassembles 0x08/0x09 big-data transfers.
///
/// Once the accumulator would exceed the cap the assembler enters discard
/// mode: chunks keep being acked by the reliable layer as usual but their
/// payload is dropped, and only the next 0x09 tail resets the state. A 0x08
/// seen while discarding never starts a fresh transfer.
pub(crate) struct BigAssembler {
    buf: Vec<u8>,
    cap: usize,
    discarding: bool,
}

impl BigAssembler {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
            discarding: false,
        }
    }

    pub(crate) fn chunk(&mut self, data: &[u8]) {
        if self.discarding {
            return;
        }
        if self.buf.len() + data.len() > self.cap {
            debug!(cap = self.cap, "big data transfer exceeds cap, discarding");
            self.buf = Vec::new();
            self.discarding = true;
            return;
        }
        self.buf.extend_from_slice(data);
    }

    /// Final chunk. Returns the assembled transfer, or `None` if it was
    /// being discarded (which also re-arms the assembler).
    pub(crate) fn tail(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        if self.discarding {
            self.discarding = false;
            return None;
        }
        if self.buf.len() + data.len() > self.cap {
            debug!(cap = self.cap, "big data tail exceeds cap, dropping transfer");
            self.buf = Vec::new();
            return None;
        }
        let mut out = std::mem::take(&mut self.buf);
        out.extend_from_slice(data);
        Some(out)
    }

    #[cfg(test)]
    pub(crate) fn is_discarding(&self) -> bool {
        self.discarding
    }
}

/// Outgoing sized-data transfer state. The producer itself (the lazy byte
/// source) is owned by the engine so its blocking reads can run on a
/// worker; the connection core only tracks wire progress.
pub(crate) struct SizedOut {
    pub total: u32,
    /// Bytes handed to the reliable layer so far.
    pub offset: u32,
    /// Set by 0x0B or teardown. Once set, no new chunk is ever queued.
    pub cancelled: bool,
    /// A worker read is outstanding; its result arrives via
    /// `sized_chunk_read`.
    pub read_pending: bool,
    /// Sequence numbers of unacked reliable wrappers carrying 0x0A chunks.
    pub wrapper_seqs: FxHashSet<u32>,
    /// Unsent sized payloads currently queued in the send window.
    pub queued_unsent: usize,
}

impl SizedOut {
    pub(crate) fn new(total: u32) -> Self {
        Self {
            total,
            offset: 0,
            cancelled: false,
            read_pending: false,
            wrapper_seqs: FxHashSet::default(),
            queued_unsent: 0,
        }
    }

    pub(crate) fn fully_queued(&self) -> bool {
        self.offset >= self.total
    }

    /// Whether every queued chunk has left the building and been acked.
    pub(crate) fn complete(&self) -> bool {
        self.fully_queued() && self.wrapper_seqs.is_empty() && self.queued_unsent == 0
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn exact_cap_delivers() {
        let mut a = BigAssembler::new(8);
        a.chunk(&[1, 2, 3, 4]);
        assert_eq!(a.tail(&[5, 6, 7, 8]).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn cap_plus_one_discards_until_tail() {
        let mut a = BigAssembler::new(8);
        a.chunk(&[0; 8]);
        a.chunk(&[0; 1]); // cap + 1: discard mode
        assert!(a.is_discarding());

        // A new chunk while discarding is NOT a fresh transfer.
        a.chunk(&[9; 4]);
        assert!(a.is_discarding());

        // The tail resets but delivers nothing.
        assert_eq!(a.tail(&[1]), None);
        assert!(!a.is_discarding());

        // Next transfer is clean.
        a.chunk(&[1, 2]);
        assert_eq!(a.tail(&[3]).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn oversized_tail_drops_transfer() {
        let mut a = BigAssembler::new(4);
        a.chunk(&[1, 2, 3]);
        assert_eq!(a.tail(&[4, 5]), None);
        // Re-armed immediately, not stuck in discard.
        a.chunk(&[7]);
        assert_eq!(a.tail(&[8]).unwrap(), vec![7, 8]);
    }

    #[test]
    fn sized_completion_tracking() {
        let mut s = SizedOut::new(10);
        assert!(!s.complete());
        s.offset = 10;
        s.wrapper_seqs.insert(3);
        assert!(s.fully_queued());
        assert!(!s.complete());
        s.wrapper_seqs.remove(&3);
        assert!(s.complete());
    }
}
