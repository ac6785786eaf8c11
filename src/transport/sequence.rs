use std::fmt::{Debug, Display, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut};

/// The size of the sequence number space. Sequence numbers wrap at this modulus, and
///  windows compare positions by signed circular distance, so the usable window width is
///  bounded by half the modulus in theory and by the configured window size in practice.
pub const SEQ_MODULUS: u16 = 1024;

/// A sequence number in the fixed modulus space. Ordering is only meaningful through
///  [`SeqNum::circular_distance`], never through `Ord`.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct SeqNum(u16);

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
impl Debug for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl SeqNum {
    pub const ZERO: SeqNum = SeqNum(0);

    pub fn from_raw(value: u16) -> SeqNum {
        SeqNum(value % SEQ_MODULUS)
    }

    pub fn to_raw(self) -> u16 {
        self.0
    }

    pub fn next(self) -> SeqNum {
        SeqNum((self.0 + 1) % SEQ_MODULUS)
    }

    pub fn plus(self, n: u16) -> SeqNum {
        SeqNum((self.0 + n % SEQ_MODULUS) % SEQ_MODULUS)
    }

    /// The ring index of this sequence in a dense buffer of the given width.
    pub fn slot_index(self, width: u16) -> usize {
        (self.0 % width) as usize
    }

    /// Signed circular distance from `other` to `self`: how far `self` is ahead of
    ///  `other` in the modulus space, in the range `-N/2 ..= N/2 - 1`.
    ///
    /// Zero means equal, positive means `self` is ahead, negative means behind.
    pub fn circular_distance(self, other: SeqNum) -> i16 {
        let half = SEQ_MODULUS / 2;
        let raw = (self.0 + SEQ_MODULUS - other.0) % SEQ_MODULUS;
        if raw < half {
            raw as i16
        }
        else {
            raw as i16 - SEQ_MODULUS as i16
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<SeqNum> {
        let raw = buf.try_get_u16()?;
        if raw >= SEQ_MODULUS {
            bail!("sequence number {} is outside the modulus space", raw);
        }
        Ok(SeqNum(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::equal(5, 5, 0)]
    #[case::ahead_one(6, 5, 1)]
    #[case::behind_one(5, 6, -1)]
    #[case::wrap_ahead(2, 1020, 6)]
    #[case::wrap_behind(1020, 2, -6)]
    #[case::max_ahead(511, 0, 511)]
    #[case::max_behind(512, 0, -512)]
    fn test_circular_distance(#[case] a: u16, #[case] b: u16, #[case] expected: i16) {
        assert_eq!(SeqNum::from_raw(a).circular_distance(SeqNum::from_raw(b)), expected);
    }

    #[test]
    fn test_next_wraps() {
        assert_eq!(SeqNum::from_raw(SEQ_MODULUS - 1).next(), SeqNum::ZERO);
        assert_eq!(SeqNum::from_raw(7).next(), SeqNum::from_raw(8));
    }

    #[rstest]
    #[case(0)]
    #[case(513)]
    #[case(1023)]
    fn test_ser_round_trip(#[case] raw: u16) {
        let mut buf = bytes::BytesMut::new();
        SeqNum::from_raw(raw).ser(&mut buf);
        let mut b: &[u8] = &buf;
        assert_eq!(SeqNum::try_deser(&mut b).unwrap(), SeqNum::from_raw(raw));
    }

    #[test]
    fn test_deser_rejects_out_of_modulus() {
        let mut b: &[u8] = &SEQ_MODULUS.to_be_bytes();
        assert!(SeqNum::try_deser(&mut b).is_err());
    }

    #[rstest]
    #[case(0, 8, 0)]
    #[case(7, 8, 7)]
    #[case(8, 8, 0)]
    #[case(1023, 8, 7)]
    fn test_slot_index(#[case] raw: u16, #[case] width: u16, #[case] expected: usize) {
        assert_eq!(SeqNum::from_raw(raw).slot_index(width), expected);
    }
}
