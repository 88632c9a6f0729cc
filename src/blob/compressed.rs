//! Compressed buffers
//!
//! Format: `[MAGIC:4 "CBUF"][METHOD:1][RAW_LEN:8 LE][CONTENT_ID:20][PAYLOAD]`
//!
//! The content id is the hash of the decompressed bytes; the blob id of the
//! buffer is the hash of the whole encoded buffer.

use crate::common::hash::HASH_LEN;
use crate::common::{ContentId, Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

const MAGIC: [u8; 4] = *b"CBUF";
const HEADER_LEN: usize = 4 + 1 + 8 + HASH_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionMethod {
    Stored = 0,
    Lz4 = 1,
}

impl TryFrom<u8> for CompressionMethod {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionMethod::Stored),
            1 => Ok(CompressionMethod::Lz4),
            other => Err(Error::Corrupted(format!("unknown compression method {}", other))),
        }
    }
}

/// A decoded buffer
#[derive(Debug, Clone)]
pub struct DecodedBuffer {
    pub content_id: ContentId,
    pub method: CompressionMethod,
    pub raw: Bytes,
}

/// Does `data` start with a compressed buffer header?
pub fn is_compressed_buffer(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN && data[..4] == MAGIC
}

/// Encode `raw` as a compressed buffer
pub fn encode(raw: &[u8], method: CompressionMethod) -> Result<Bytes> {
    let payload = match method {
        CompressionMethod::Stored => raw.to_vec(),
        CompressionMethod::Lz4 => {
            if raw.len() > i32::MAX as usize {
                return Err(Error::Internal("buffer too large for lz4 block".into()));
            }
            lz4::block::compress(raw, None, false)?
        }
    };

    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_slice(&MAGIC);
    out.put_u8(method as u8);
    out.put_u64_le(raw.len() as u64);
    out.put_slice(ContentId::from_blob(raw).as_bytes());
    out.put_slice(&payload);
    Ok(out.freeze())
}

/// Decode a compressed buffer and verify the hash of its content
pub fn decode(data: &[u8]) -> Result<DecodedBuffer> {
    if !is_compressed_buffer(data) {
        return Err(Error::Corrupted("not a compressed buffer".into()));
    }
    let method = CompressionMethod::try_from(data[4])?;
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&data[5..13]);
    let raw_len = u64::from_le_bytes(len_bytes);
    let mut id_bytes = [0u8; HASH_LEN];
    id_bytes.copy_from_slice(&data[13..HEADER_LEN]);
    let content_id = ContentId::from_bytes(id_bytes);
    let payload = &data[HEADER_LEN..];

    let raw = match method {
        CompressionMethod::Stored => payload.to_vec(),
        CompressionMethod::Lz4 => {
            let size = i32::try_from(raw_len)
                .map_err(|_| Error::Corrupted(format!("raw length {} too large", raw_len)))?;
            lz4::block::decompress(payload, Some(size))
                .map_err(|e| Error::Corrupted(format!("lz4: {}", e)))?
        }
    };

    if raw.len() as u64 != raw_len {
        return Err(Error::Corrupted(format!(
            "decompressed {} bytes, header says {}",
            raw.len(),
            raw_len
        )));
    }
    let actual = ContentId::from_blob(&raw);
    if actual != content_id {
        return Err(Error::HashMismatch {
            expected: content_id.into(),
            actual: actual.into(),
        });
    }

    Ok(DecodedBuffer {
        content_id,
        method,
        raw: Bytes::from(raw),
    })
}
