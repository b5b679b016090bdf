//! Versioned, self-describing encoding for persisted entries.
//!
//! ```text
//! +-------+---------+------------+-------------+---------+
//! | LCTE  | version | header_len | JSON header | payload |
//! | 4 B   | u16 LE  | u32 LE     | header_len  | rest    |
//! +-------+---------+------------+-------------+---------+
//! ```
//!
//! The header is JSON so new metadata fields can be added without breaking
//! older files: unknown fields are ignored and missing ones take defaults.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::entry::{CacheEntry, CacheKey, EntryMetadata};

pub const MAGIC: &[u8; 4] = b"LCTE";
pub const FORMAT_VERSION: u16 = 1;

const PREAMBLE_LEN: usize = 4 + 2 + 4;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoded entry truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Bad magic bytes")]
    BadMagic,

    #[error("Unsupported format version {0} (newest known is {FORMAT_VERSION})")]
    UnsupportedVersion(u16),

    #[error("Malformed header: {0}")]
    Header(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct Header {
    key: CacheKey,
    #[serde(default)]
    metadata: EntryMetadata,
}

/// Encode an entry into a self-describing buffer.
pub fn encode(entry: &CacheEntry) -> Result<Bytes, CodecError> {
    let header = serde_json::to_vec(&Header {
        key: entry.key.clone(),
        metadata: entry.metadata.clone(),
    })?;

    let mut buf = BytesMut::with_capacity(PREAMBLE_LEN + header.len() + entry.payload.len());
    buf.put_slice(MAGIC);
    buf.put_u16_le(FORMAT_VERSION);
    buf.put_u32_le(header.len() as u32);
    buf.put_slice(&header);
    buf.put_slice(&entry.payload);
    Ok(buf.freeze())
}

/// Decode a buffer produced by [`encode`] (any version up to the current one).
pub fn decode(mut data: Bytes) -> Result<CacheEntry, CodecError> {
    if data.len() < PREAMBLE_LEN {
        return Err(CodecError::Truncated {
            needed: PREAMBLE_LEN,
            available: data.len(),
        });
    }
    if &data[..4] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    data.advance(4);

    let version = data.get_u16_le();
    if version == 0 || version > FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let header_len = data.get_u32_le() as usize;
    if data.len() < header_len {
        return Err(CodecError::Truncated {
            needed: header_len,
            available: data.len(),
        });
    }
    let header: Header = serde_json::from_slice(&data[..header_len])?;
    let payload = data.split_off(header_len);

    Ok(CacheEntry {
        key: header.key,
        payload,
        metadata: header.metadata,
    })
}
