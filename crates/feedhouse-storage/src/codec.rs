//! Stored Frame Format
//!
//! Every message inside a bucket is stored as one self-describing frame:
//!
//! ```text
//! ┌──────────────┬───────────────┬───────────────┬──────────────┬───────────┐
//! │ header len   │ header (JSON) │ payload len   │ payload      │ CRC32     │
//! │ varint       │ N bytes       │ varint        │ M bytes      │ 4 bytes LE│
//! └──────────────┴───────────────┴───────────────┴──────────────┴───────────┘
//! ```
//!
//! The header is the JSON form of `MessageHeader` (path, type, timestamp, server,
//! remote origin, user headers). The CRC covers every byte before the trailer.
//!
//! Frames are replayed byte for byte: `Bucket::append_raw` copies a frame produced
//! elsewhere without re-encoding it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use feedhouse_core::varint::{decode_varint_u64, encode_varint_u64, varint_len};
use feedhouse_core::{Error as CoreError, Message, MessageHeader};

use crate::error::Result;

const CRC_LEN: usize = 4;

/// Serialize a message into a stored frame
pub fn encode(message: &Message) -> Result<Bytes> {
    let header = serde_json::to_vec(&message.header()).map_err(CoreError::from)?;
    let payload = &message.payload;

    let len = varint_len(header.len() as u64)
        + header.len()
        + varint_len(payload.len() as u64)
        + payload.len()
        + CRC_LEN;
    let mut buf = BytesMut::with_capacity(len);

    encode_varint_u64(&mut buf, header.len() as u64);
    buf.put_slice(&header);
    encode_varint_u64(&mut buf, payload.len() as u64);
    buf.put_slice(payload);

    let crc = crc32fast::hash(&buf[..]);
    buf.put_u32_le(crc);

    Ok(buf.freeze())
}

/// Parse a stored frame back into a message
pub fn decode(frame: &[u8]) -> Result<Message> {
    let (header, payload) = split(frame)?;

    let header: MessageHeader = serde_json::from_slice(header)
        .map_err(|e| CoreError::MalformedHeader(e.to_string()))?;

    Ok(Message::from_parts(header, Bytes::copy_from_slice(payload)))
}

fn split(frame: &[u8]) -> Result<(&[u8], &[u8])> {
    if frame.len() < CRC_LEN {
        return Err(CoreError::Truncated(format!("frame of {} bytes", frame.len())).into());
    }

    let body_len = frame.len() - CRC_LEN;
    let (body, mut trailer) = frame.split_at(body_len);
    if crc32fast::hash(body) != trailer.get_u32_le() {
        return Err(CoreError::CrcMismatch.into());
    }

    let mut cursor = body;
    let header = take_prefixed(&mut cursor, "header")?;
    let payload = take_prefixed(&mut cursor, "payload")?;

    if !cursor.is_empty() {
        return Err(CoreError::Truncated(format!(
            "{} unexpected bytes after payload",
            cursor.len()
        ))
        .into());
    }

    Ok((header, payload))
}

fn take_prefixed<'a>(cursor: &mut &'a [u8], what: &str) -> Result<&'a [u8]> {
    let len = decode_varint_u64(cursor)? as usize;
    if cursor.len() < len {
        return Err(CoreError::Truncated(format!(
            "{what} declares {len} bytes, {} present",
            cursor.len()
        ))
        .into());
    }
    let remaining: &'a [u8] = *cursor;
    let (value, rest) = remaining.split_at(len);
    *cursor = rest;
    Ok(value)
}
