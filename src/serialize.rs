// Copyright 2026 Commlink Contributors

//! Payload serialization primitives.
//!
//! All multi-byte integers on the wire are little-endian.  Variable-length
//! data uses a vint length prefix: 7 bits of value per byte, the high bit
//! set on every byte except the last.  A short string therefore costs one
//! length byte instead of a fixed four.  Strings are UTF-8 with no
//! terminator; byte arrays are raw bytes.
//!
//! Decoding never panics on short input.  Every decode function returns
//! `CommError::Truncated` when the buffer runs out, so callers can treat a
//! partial payload as an error rather than a crash.

use bytes::{Buf, BufMut};

use crate::error::CommError;

/// Longest legal vint encoding of a u64 (10 bytes of 7 bits each).
const VINT_MAX_BYTES: usize = 10;

/// Number of bytes `value` occupies as a vint.
pub fn vint_len(value: u64) -> usize {
    let mut len = 1;
    let mut v = value >> 7;
    while v != 0 {
        len += 1;
        v >>= 7;
    }
    len
}

/// Appends `value` as a vint.
pub fn encode_vint<B: BufMut>(dst: &mut B, mut value: u64) {
    while value >= 0x80 {
        dst.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Reads a vint, consuming its bytes.
pub fn decode_vint<B: Buf>(src: &mut B) -> Result<u64, CommError> {
    let mut value: u64 = 0;
    for i in 0..VINT_MAX_BYTES {
        if !src.has_remaining() {
            return Err(CommError::Truncated("vint"));
        }
        let byte = src.get_u8();
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            if i == VINT_MAX_BYTES - 1 && byte > 0x01 {
                return Err(CommError::Protocol(String::from(
                    "vint exceeds 64 bits",
                )));
            }
            return Ok(value);
        }
    }
    Err(CommError::Protocol(String::from("vint exceeds 64 bits")))
}

/// Encoded size of `s`: vint length prefix plus the UTF-8 bytes.
pub fn string_len(s: &str) -> usize {
    vint_len(s.len() as u64) + s.len()
}

/// Appends a length-prefixed UTF-8 string, no terminator.
pub fn encode_string<B: BufMut>(dst: &mut B, s: &str) {
    encode_vint(dst, s.len() as u64);
    dst.put_slice(s.as_bytes());
}

/// Reads a length-prefixed UTF-8 string.
pub fn decode_string<B: Buf>(src: &mut B) -> Result<String, CommError> {
    let bytes = decode_bytes(src)?;
    String::from_utf8(bytes)
        .map_err(|_| CommError::Protocol(String::from("string is not UTF-8")))
}

/// Encoded size of a byte array: vint length prefix plus the data.
pub fn bytes_len(data: &[u8]) -> usize {
    vint_len(data.len() as u64) + data.len()
}

/// Appends a length-prefixed byte array.
pub fn encode_bytes<B: BufMut>(dst: &mut B, data: &[u8]) {
    encode_vint(dst, data.len() as u64);
    dst.put_slice(data);
}

/// Reads a length-prefixed byte array.
pub fn decode_bytes<B: Buf>(src: &mut B) -> Result<Vec<u8>, CommError> {
    let len = decode_vint(src)? as usize;
    if src.remaining() < len {
        return Err(CommError::Truncated("byte array"));
    }
    let mut data = vec![0u8; len];
    src.copy_to_slice(&mut data);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};
    use quickcheck::quickcheck;

    #[test]
    fn vint_boundaries() {
        for (value, expected_len) in
            [(0u64, 1), (0x7f, 1), (0x80, 2), (0x3fff, 2), (0x4000, 3), (u64::MAX, 10)]
        {
            let mut buf = BytesMut::new();
            encode_vint(&mut buf, value);
            assert_eq!(buf.len(), expected_len, "value {:#x}", value);
            assert_eq!(vint_len(value), expected_len);
            let mut src = buf.freeze();
            assert_eq!(decode_vint(&mut src).unwrap(), value);
            assert!(!src.has_remaining());
        }
    }

    #[test]
    fn empty_buffer_is_truncated() {
        let mut src = Bytes::new();
        assert!(matches!(
            decode_vint(&mut src),
            Err(CommError::Truncated(_))
        ));
    }

    #[test]
    fn string_truncated_mid_data() {
        let mut buf = BytesMut::new();
        encode_string(&mut buf, "hello world");
        let mut short = buf.freeze().slice(0..4);
        assert!(matches!(
            decode_string(&mut short),
            Err(CommError::Truncated(_))
        ));
    }

    #[test]
    fn string_round_trip_positions_cursor() {
        let mut buf = BytesMut::new();
        encode_string(&mut buf, "lock/attr");
        encode_string(&mut buf, "");
        encode_vint(&mut buf, 42);
        let mut src = buf.freeze();
        assert_eq!(decode_string(&mut src).unwrap(), "lock/attr");
        assert_eq!(decode_string(&mut src).unwrap(), "");
        assert_eq!(decode_vint(&mut src).unwrap(), 42);
        assert!(!src.has_remaining());
    }

    #[test]
    fn invalid_utf8_is_a_protocol_error() {
        let mut buf = BytesMut::new();
        encode_bytes(&mut buf, &[0xff, 0xfe]);
        let mut src = buf.freeze();
        assert!(matches!(
            decode_string(&mut src),
            Err(CommError::Protocol(_))
        ));
    }

    quickcheck! {
        fn vint_round_trips(value: u64) -> bool {
            let mut buf = BytesMut::new();
            encode_vint(&mut buf, value);
            let mut src = buf.freeze();
            decode_vint(&mut src).unwrap() == value && !src.has_remaining()
        }

        fn byte_arrays_round_trip(data: Vec<u8>) -> bool {
            let mut buf = BytesMut::new();
            encode_bytes(&mut buf, &data);
            assert_eq!(buf.len(), bytes_len(&data));
            let mut src = buf.freeze();
            decode_bytes(&mut src).unwrap() == data
        }

        fn strings_round_trip(s: String) -> bool {
            let mut buf = BytesMut::new();
            encode_string(&mut buf, &s);
            assert_eq!(buf.len(), string_len(&s));
            let mut src = buf.freeze();
            decode_string(&mut src).unwrap() == s
        }
    }
}
