//! Wrap-aware 32-bit sequence numbers.
//!
//! TCP sequence space is a ring of 2^32 values.  Two numbers are compared by
//! the sign of their wrapping difference, so `0xffff_fff0 < 0x0000_0010` holds
//! as long as the two are less than 2^31 apart, which every window in this
//! crate guarantees.
//!
//! ```text
//!            a          b
//!  ──────────┼──────────┼──────▶  (mod 2^32)
//!            └ b - a ───┘  interpreted as i32 > 0  ⇒  a < b
//! ```
//!
//! Only `PartialOrd` is implemented: the relation is not transitive across
//! the whole ring, so a total `Ord` would be a lie.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// A TCP sequence number with modular comparison and arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SequenceNumber(u32);

impl SequenceNumber {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Raw 32-bit value as carried on the wire.
    pub const fn value(self) -> u32 {
        self.0
    }

    /// The later of two sequence numbers in wrap-around space.
    pub fn max(self, other: Self) -> Self {
        if self >= other {
            self
        } else {
            other
        }
    }

    /// The earlier of two sequence numbers in wrap-around space.
    pub fn min(self, other: Self) -> Self {
        if self <= other {
            self
        } else {
            other
        }
    }
}

impl From<u32> for SequenceNumber {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some((self.0.wrapping_sub(other.0) as i32).cmp(&0))
    }
}

impl Add<u32> for SequenceNumber {
    type Output = SequenceNumber;

    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u32> for SequenceNumber {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u32> for SequenceNumber {
    type Output = SequenceNumber;

    fn sub(self, rhs: u32) -> Self::Output {
        Self(self.0.wrapping_sub(rhs))
    }
}

impl SubAssign<u32> for SequenceNumber {
    fn sub_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_sub(rhs);
    }
}

/// Distance in bytes from `rhs` up to `self`.
///
/// Callers must ensure `rhs <= self`; otherwise the result is the (huge)
/// wrapped distance.
impl Sub<SequenceNumber> for SequenceNumber {
    type Output = u32;

    fn sub(self, rhs: SequenceNumber) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: u32) -> SequenceNumber {
        SequenceNumber::new(v)
    }

    #[test]
    fn plain_ordering() {
        assert!(s(1) < s(2));
        assert!(s(2) > s(1));
        assert!(s(5) <= s(5));
        assert!(s(5) >= s(5));
    }

    #[test]
    fn ordering_across_wrap() {
        let high = s(u32::MAX - 10);
        let low = s(10);
        assert!(high < low);
        assert!(low > high);
        assert_eq!(high + 21, low);
    }

    #[test]
    fn difference_across_wrap() {
        let high = s(u32::MAX - 4);
        let low = s(5);
        assert_eq!(low - high, 10);
        assert_eq!(low - 10u32, high);
    }

    #[test]
    fn max_and_min_follow_modular_order() {
        let high = s(u32::MAX);
        let low = s(3);
        assert_eq!(high.max(low), low);
        assert_eq!(high.min(low), high);
    }

    #[test]
    fn add_assign_wraps() {
        let mut x = s(u32::MAX);
        x += 2;
        assert_eq!(x.value(), 1);
        x -= 2;
        assert_eq!(x.value(), u32::MAX);
    }
}
