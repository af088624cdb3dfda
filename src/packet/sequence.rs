use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

/// A packet's 16-bit sequence number. Sequence numbers wrap around after 65535, so they are
///  compared using the signed difference between them (serial number arithmetic): `a` is newer
///  than `b` if `a - b`, interpreted as an `i16`, is positive.
///
/// This is well-defined only for numbers that are less than 2^15 apart, which is why the
///  receive window is capped below that.
///
/// NB: `SequenceNumber` deliberately does not implement `Ord` since the wrap-aware order is
///      not transitive
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct SequenceNumber(u16);

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub const fn from_raw(raw: u16) -> SequenceNumber {
        SequenceNumber(raw)
    }

    pub const fn to_raw(self) -> u16 {
        self.0
    }

    pub fn next(self) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(1))
    }

    pub fn prev(self) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_sub(1))
    }

    pub fn wrapping_add(self, n: u16) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(n))
    }

    /// signed distance from `other` to `self`, i.e. how many steps `self` is ahead of `other`
    pub fn distance_from(self, other: SequenceNumber) -> i16 {
        self.0.wrapping_sub(other.0) as i16
    }

    pub fn is_newer_than(self, other: SequenceNumber) -> bool {
        self.distance_from(other) > 0
    }

    pub fn serial_cmp(self, other: SequenceNumber) -> Ordering {
        self.distance_from(other).cmp(&0)
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
