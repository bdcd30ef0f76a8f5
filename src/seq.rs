use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

/// A packet's position in a channel's send or receive order.
///
/// Sequence numbers are wrap-around: 0 follows after FFFFFFFF. All comparisons use the
///  signed difference of the raw values, so ordering is meaningful as long as the compared
///  numbers are less than half the number space apart - which the bounded send and receive
///  windows guarantee. At exactly half the number space the sign of the difference is
///  ambiguous; the tie is broken by raw magnitude so that `a.is_after(b)` and `b.is_after(a)`
///  can never both hold.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SeqNum(u32);

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl SeqNum {
    pub const ZERO: SeqNum = SeqNum(0);

    const HALF_RANGE: u32 = 1 << 31;

    pub fn from_raw(value: u32) -> SeqNum {
        SeqNum(value)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn next(self) -> SeqNum {
        SeqNum(self.0.wrapping_add(1))
    }

    pub fn plus(self, n: u32) -> SeqNum {
        SeqNum(self.0.wrapping_add(n))
    }

    /// signed modular distance from `other` to `self` - positive if `self` was issued later
    pub fn diff(self, other: SeqNum) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    /// `true` if `self` was issued more recently than `other` under wrap-around semantics
    pub fn is_after(self, other: SeqNum) -> bool {
        (self.0 > other.0 && self.0 - other.0 <= Self::HALF_RANGE)
            || (self.0 < other.0 && other.0 - self.0 > Self::HALF_RANGE)
    }

    pub fn seq_cmp(self, other: SeqNum) -> Ordering {
        if self.0 == other.0 {
            Ordering::Equal
        }
        else if self.is_after(other) {
            Ordering::Greater
        }
        else {
            Ordering::Less
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::adjacent(1, 0, true)]
    #[case::adjacent_reverse(0, 1, false)]
    #[case::equal(7, 7, false)]
    #[case::wraparound(0, u32::MAX, true)]
    #[case::wraparound_reverse(u32::MAX, 0, false)]
    #[case::far_ahead(1000, 0, true)]
    #[case::half_range_tiebreak(1 << 31, 0, true)]
    #[case::half_range_tiebreak_reverse(0, 1 << 31, false)]
    fn test_is_after(#[case] a: u32, #[case] b: u32, #[case] expected: bool) {
        assert_eq!(SeqNum::from_raw(a).is_after(SeqNum::from_raw(b)), expected);
    }

    #[rstest]
    #[case::simple(5, 3, 2)]
    #[case::negative(3, 5, -2)]
    #[case::wraparound(1, u32::MAX, 2)]
    #[case::wraparound_negative(u32::MAX, 1, -2)]
    fn test_diff(#[case] a: u32, #[case] b: u32, #[case] expected: i32) {
        assert_eq!(SeqNum::from_raw(a).diff(SeqNum::from_raw(b)), expected);
    }

    #[rstest]
    fn test_tiebreak_is_consistent() {
        // exactly half the number space apart: classification must not be symmetric
        let a = SeqNum::from_raw(0);
        let b = SeqNum::from_raw(1 << 31);
        assert_ne!(a.is_after(b), b.is_after(a));
        assert_ne!(a.seq_cmp(b), b.seq_cmp(a));
    }

    #[rstest]
    fn test_next_wraps() {
        assert_eq!(SeqNum::from_raw(u32::MAX).next(), SeqNum::ZERO);
        assert_eq!(SeqNum::from_raw(3).plus(4), SeqNum::from_raw(7));
        assert_eq!(SeqNum::from_raw(u32::MAX).plus(2), SeqNum::from_raw(1));
    }
}
