//! Primitive read/write of typed fields to/from a byte buffer. Fixed-width integers go
//!  through `bytes` / `bytes-varint` directly; the helpers here cover the variable-length
//!  field kinds the protocol uses.

use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

/// An upper bound for decoded variable-length fields so a corrupt length prefix cannot
///  trigger a huge allocation.
pub const MAX_FIELD_LEN: usize = 64 * 1024;

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let bytes = try_get_byte_field(buf)?;
    Ok(String::from_utf8(bytes)?)
}

pub fn put_byte_field(buf: &mut impl BufMut, field: &[u8]) {
    buf.put_usize_varint(field.len());
    buf.put_slice(field);
}

pub fn try_get_byte_field(buf: &mut impl Buf) -> anyhow::Result<Vec<u8>> {
    let len = buf.try_get_usize_varint()?;
    if len > MAX_FIELD_LEN {
        bail!("field length {} exceeds the maximum of {}", len, MAX_FIELD_LEN);
    }
    if buf.remaining() < len {
        bail!("field is truncated: {} bytes announced, {} available", len, buf.remaining());
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}

/// Reads exactly `N` bytes, for fixed-size fields like keys and signatures.
pub fn try_get_array<const N: usize>(buf: &mut impl Buf) -> anyhow::Result<[u8; N]> {
    if buf.remaining() < N {
        bail!("fixed field is truncated: {} bytes expected, {} available", N, buf.remaining());
    }
    let mut bytes = [0u8; N];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::empty("")]
    #[case::ascii("pilot")]
    #[case::utf8("größter Käfer")]
    fn test_string_round_trip(#[case] s: &str) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);
        let mut b: &[u8] = &buf;
        assert_eq!(try_get_string(&mut b).unwrap(), s);
        assert!(b.is_empty());
    }

    #[test]
    fn test_truncated_field_is_an_error() {
        let mut buf = BytesMut::new();
        put_byte_field(&mut buf, &[1, 2, 3, 4]);
        let mut b: &[u8] = &buf[..3];
        assert!(try_get_byte_field(&mut b).is_err());
    }

    #[test]
    fn test_oversized_length_prefix_is_an_error() {
        let mut buf = BytesMut::new();
        bytes_varint::VarIntSupportMut::put_usize_varint(&mut buf, MAX_FIELD_LEN + 1);
        let mut b: &[u8] = &buf;
        assert!(try_get_byte_field(&mut b).is_err());
    }

    #[test]
    fn test_fixed_array() {
        let mut b: &[u8] = &[9, 8, 7];
        assert_eq!(try_get_array::<2>(&mut b).unwrap(), [9, 8]);
        assert!(try_get_array::<2>(&mut b).is_err());
    }
}
