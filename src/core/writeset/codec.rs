// src/core/writeset/codec.rs

//! Wire framing for write sets.
//!
//! Layout: a 4-byte magic, a format version byte, the bincode-encoded
//! [`WriteSet`], and a trailing CRC-64 over everything before it. The
//! checksum is verified before decoding so a corrupt action never reaches
//! the apply path.

use crate::core::writeset::WriteSet;
use bincode::config;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{CRC_64_REDIS, Crc};
use thiserror::Error;

const WIRE_MAGIC: &[u8] = b"SYWS";
const WIRE_VERSION: u8 = 1;

const CHECKSUM_ALGO: Crc<u64> = Crc::<u64>::new(&CRC_64_REDIS);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),

    #[error("bad magic bytes")]
    BadMagic,

    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    #[error("checksum mismatch: frame is corrupt")]
    ChecksumMismatch,

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),
}

/// Encodes a write set into a framed, checksummed byte buffer.
pub fn encode(ws: &WriteSet) -> Result<Bytes, CodecError> {
    let payload = bincode::encode_to_vec(ws, config::standard())
        .map_err(|e| CodecError::Encode(e.to_string()))?;

    let mut buf = BytesMut::with_capacity(WIRE_MAGIC.len() + 1 + payload.len() + 8);
    buf.put_slice(WIRE_MAGIC);
    buf.put_u8(WIRE_VERSION);
    buf.put_slice(&payload);

    let checksum = CHECKSUM_ALGO.checksum(&buf);
    buf.put_u64_le(checksum);
    Ok(buf.freeze())
}

/// Verifies and decodes a framed write set.
pub fn decode(data: &[u8]) -> Result<WriteSet, CodecError> {
    let header_len = WIRE_MAGIC.len() + 1;
    if data.len() < header_len + 8 {
        return Err(CodecError::Truncated(data.len()));
    }

    let (frame, checksum_part) = data.split_at(data.len() - 8);
    let expected = CHECKSUM_ALGO.checksum(frame);
    let found = (&checksum_part[..]).get_u64_le();
    if expected != found {
        return Err(CodecError::ChecksumMismatch);
    }

    if &frame[..WIRE_MAGIC.len()] != WIRE_MAGIC {
        return Err(CodecError::BadMagic);
    }
    let version = frame[WIRE_MAGIC.len()];
    if version != WIRE_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let (ws, consumed) = bincode::decode_from_slice(&frame[header_len..], config::standard())
        .map_err(|e| CodecError::Decode(e.to_string()))?;
    if consumed != frame.len() - header_len {
        return Err(CodecError::Decode(format!(
            "trailing garbage: {} bytes left",
            frame.len() - header_len - consumed
        )));
    }
    Ok(ws)
}
