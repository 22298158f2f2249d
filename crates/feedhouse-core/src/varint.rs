//! Variable-length Integer Encoding (Varint)
//!
//! Stored message frames prefix their header block and payload with lengths.
//! Instead of always spending 8 bytes on a length, varints use only as many bytes
//! as needed:
//! - Small lengths (0-127) use just 1 byte
//! - Larger lengths use 2-10 bytes depending on magnitude
//! - Each byte uses 7 bits for data and 1 bit as a "continuation" flag
//!
//! Most headers are well under 16KB, so a frame usually spends 2 bytes on its
//! header length and 1-3 bytes on its payload length.
//!
//! Decoding is fallible: frames can arrive from other nodes through the raw
//! append path, so a truncated or oversized varint is reported as an error
//! instead of panicking.
//!
//! ## Usage
//! ```ignore
//! let mut buf = BytesMut::new();
//! encode_varint_u64(&mut buf, 300);
//! let value = decode_varint_u64(&mut buf.as_ref())?;  // Returns 300
//! ```

use bytes::{Buf, BufMut};

use crate::{Error, Result};

/// Longest valid encoding of a u64
pub const MAX_VARINT_LEN: usize = 10;

/// Encode an unsigned integer as a varint
pub fn encode_varint_u64(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;

        if value != 0 {
            byte |= 0x80; // Set continuation bit
        }

        buf.put_u8(byte);

        if value == 0 {
            break;
        }
    }
}

/// Decode a varint to an unsigned integer
pub fn decode_varint_u64(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0;

    loop {
        if !buf.has_remaining() {
            return Err(Error::Truncated("varint ended early".to_string()));
        }

        let byte = buf.get_u8();
        value |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            break;
        }

        shift += 7;

        if shift >= 64 {
            return Err(Error::Truncated("varint too large".to_string()));
        }
    }

    Ok(value)
}

/// Number of bytes `encode_varint_u64` writes for `value`
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_varint_small() {
        let mut buf = BytesMut::new();
        encode_varint_u64(&mut buf, 5);

        assert_eq!(buf.len(), 1);
        let mut cursor = buf.as_ref();
        assert_eq!(decode_varint_u64(&mut cursor).unwrap(), 5);
    }

    #[test]
    fn test_varint_multi_byte() {
        let mut buf = BytesMut::new();
        encode_varint_u64(&mut buf, 300);

        assert_eq!(buf.len(), 2);
        assert_eq!(buf.as_ref(), &[0xAC, 0x02]);
    }

    #[test]
    fn test_varint_len_matches_encoding() {
        for value in [0u64, 1, 127, 128, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            encode_varint_u64(&mut buf, value);
            assert_eq!(varint_len(value), buf.len(), "length mismatch for {value}");
        }
        assert_eq!(varint_len(u64::MAX), MAX_VARINT_LEN);
    }

    #[test]
    fn test_varint_truncated() {
        // Continuation bit set but no following byte
        let data = [0x80u8];
        let mut cursor = &data[..];
        assert!(matches!(
            decode_varint_u64(&mut cursor),
            Err(Error::Truncated(_))
        ));
    }

    #[test]
    fn test_varint_too_large() {
        let data = [0xFFu8; 11];
        let mut cursor = &data[..];
        assert!(decode_varint_u64(&mut cursor).is_err());
    }
}
