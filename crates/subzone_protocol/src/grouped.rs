//! Grouped (0x00 0x0E) packet assembly and disassembly.
//!
//! A grouped packet concatenates sub-packets, each prefixed with a one-byte
//! length. Items are capped at [`MAX_GROUPED_ITEM`] bytes and the whole
//! datagram at [`MAX_PACKET_SIZE`].

use anyhow::ensure;

use crate::{MAX_GROUPED_ITEM, MAX_PACKET_SIZE};

/// Iterates over the items of a grouped packet body (the bytes after the
/// `0x00 0x0E` header).
#[derive(Copy, Clone, Debug)]
pub struct GroupedIter<'a> {
    rest: &'a [u8],
}

impl<'a> GroupedIter<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self { rest: body }
    }
}

impl<'a> Iterator for GroupedIter<'a> {
    type Item = anyhow::Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }

        let len = self.rest[0] as usize;
        if self.rest.len() < 1 + len {
            // Poison the iterator so a malformed tail yields exactly one error.
            self.rest = &[];
            return Some(Err(anyhow::anyhow!(
                "grouped item length {len} overruns packet"
            )));
        }

        let item = &self.rest[1..1 + len];
        self.rest = &self.rest[1 + len..];
        Some(Ok(item))
    }
}

/// Builds a grouped packet body item by item, respecting both the per-item
/// and whole-datagram caps.
///
/// `max_total` bounds the full datagram size: the two header bytes plus every
/// `1 + len` item. Pass [`MAX_PACKET_SIZE`] for a top-level grouped packet, or
/// something smaller when the result must nest inside other framing (for
/// example a reliable header, or another grouped packet's 255-byte item cap).
#[derive(Clone, Debug)]
pub struct GroupedWriter {
    body: Vec<u8>,
    max_total: usize,
    count: usize,
}

impl GroupedWriter {
    pub fn new(max_total: usize) -> Self {
        debug_assert!(max_total > 2);
        Self {
            body: Vec::new(),
            max_total,
            count: 0,
        }
    }

    /// Whether `item` would fit without exceeding any cap.
    pub fn fits(&self, item: &[u8]) -> bool {
        item.len() <= MAX_GROUPED_ITEM && 2 + self.body.len() + 1 + item.len() <= self.max_total
    }

    /// Appends one item. Fails if the item is oversized or the datagram would
    /// exceed the cap.
    pub fn push(&mut self, item: &[u8]) -> anyhow::Result<()> {
        ensure!(self.fits(item), "grouped item of {} bytes does not fit", item.len());
        self.body.push(item.len() as u8);
        self.body.extend_from_slice(item);
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The body bytes (without the `0x00 0x0E` header).
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::frame::CorePacket;

    #[test]
    fn round_trip() {
        let mut w = GroupedWriter::new(MAX_PACKET_SIZE);
        w.push(&[1, 2, 3]).unwrap();
        w.push(&[]).unwrap();
        w.push(&[0xFF; 255]).unwrap();

        let body = w.into_body();
        let items: Vec<_> = GroupedIter::new(&body).collect::<anyhow::Result<_>>().unwrap();
        assert_eq!(items, vec![&[1u8, 2, 3][..], &[], &[0xFF; 255]]);
    }

    #[test]
    fn rejects_oversized_item() {
        let mut w = GroupedWriter::new(MAX_PACKET_SIZE);
        assert!(w.push(&[0; 256]).is_err());
    }

    #[test]
    fn respects_datagram_cap() {
        let mut w = GroupedWriter::new(MAX_PACKET_SIZE);
        // 2 header + 4 * (1 + 128) = 518; a fifth does not fit.
        for _ in 0..4 {
            w.push(&[0; 128]).unwrap();
        }
        assert!(!w.fits(&[0; 128]));
        assert!(w.push(&[0; 128]).is_err());
        assert_eq!(w.count(), 4);
    }

    #[test]
    fn truncated_item_yields_one_error() {
        let body = [3, 1, 2]; // claims 3 bytes, only 2 present
        let mut iter = GroupedIter::new(&body);
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }

    #[test]
    fn nests_inside_core_framing() {
        let mut w = GroupedWriter::new(MAX_PACKET_SIZE);
        w.push(&[0x06, 0, 1, 0, 2, 0, 0, 0, 0, 0]).unwrap();
        let body = w.into_body();

        let datagram = CorePacket::Grouped { data: &body }.to_vec();
        let CorePacket::Grouped { data } = CorePacket::decode(&datagram).unwrap() else {
            panic!("expected grouped");
        };
        assert_eq!(GroupedIter::new(data).count(), 1);
    }
}
