//! Reliable-stream sequence numbers.

use std::fmt;

use derive_more::{From, Into};

/// A 32-bit reliable sequence number.
///
/// Sequence numbers wrap at 2^32, so there is no total order; all window
/// tests are modular. `Ord` is deliberately not implemented.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default, Debug, From, Into)]
pub struct SequenceNr(pub u32);

impl SequenceNr {
    /// The sequence number following this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Signed modular distance from `other` to `self`.
    ///
    /// Positive when `self` is ahead of `other`, negative when behind. The
    /// result is meaningful as long as the two numbers are within 2^31 of
    /// each other, which the receive window guarantees.
    pub fn distance(self, other: Self) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    /// Whether `self` lies in `[start, start + window)` modulo 2^32.
    pub fn in_window(self, start: Self, window: u32) -> bool {
        self.0.wrapping_sub(start.0) < window
    }
}

impl fmt::Display for SequenceNr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_wraps_at_u32_max() {
        let near_max = SequenceNr(u32::MAX - 1);

        assert!(near_max.in_window(near_max, 64));
        assert!(SequenceNr(u32::MAX).in_window(near_max, 64));
        assert!(SequenceNr(5).in_window(near_max, 64));
        assert!(!SequenceNr(near_max.0 - 1).in_window(near_max, 64));
        assert!(!SequenceNr(near_max.0.wrapping_add(64)).in_window(near_max, 64));
    }

    #[test]
    fn distance_is_signed() {
        assert_eq!(SequenceNr(5).distance(SequenceNr(3)), 2);
        assert_eq!(SequenceNr(3).distance(SequenceNr(5)), -2);
        assert_eq!(SequenceNr(1).distance(SequenceNr(u32::MAX)), 2);
    }

    #[test]
    fn next_wraps() {
        assert_eq!(SequenceNr(u32::MAX).next(), SequenceNr(0));
    }
}
