use std::cmp::Ordering;
use std::fmt;

/// 16-bit wraparound update counter.
///
/// Ordering follows RFC 1982 serial number arithmetic: `a < b` iff
/// `a != b` and `(b - a) mod 2^16 < 2^15`. Two values exactly `2^15`
/// apart are unordered, so only [`PartialOrd`] is implemented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SequenceNumber(u16);

impl SequenceNumber {
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u16 {
        self.0
    }

    /// Advance by one, wrapping 0xFFFF to 0.
    pub fn increment(&mut self) -> Self {
        self.0 = self.0.wrapping_add(1);
        *self
    }

    /// The successor without mutating `self`.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<Ordering> {
        if self.0 == other.0 {
            return Some(Ordering::Equal);
        }
        let forward = other.0.wrapping_sub(self.0);
        match forward.cmp(&0x8000) {
            Ordering::Less => Some(Ordering::Less),
            Ordering::Greater => Some(Ordering::Greater),
            Ordering::Equal => None,
        }
    }
}

impl From<u16> for SequenceNumber {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
