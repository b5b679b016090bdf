//! Compression for archived entries.
//!
//! Entries bound for the archive are encoded with [`codec`](crate::cache::codec)
//! and then zstd-compressed. Decompression reverses the pipeline.

use bytes::Bytes;
use thiserror::Error;

use crate::cache::codec::{self, CodecError};
use crate::cache::entry::CacheEntry;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Zstd failed: {0}")]
    ZstdError(#[from] std::io::Error),

    #[error("Codec failed: {0}")]
    Codec(#[from] CodecError),
}

/// The compression engine for archive blobs.
#[derive(Debug, Clone)]
pub struct Compressor {
    level: i32,
}

impl Compressor {
    pub fn new(level: i32) -> Self {
        Self {
            level: level.clamp(1, 22),
        }
    }

    /// Encode and compress an entry into an archive blob.
    pub fn pack(&self, entry: &CacheEntry) -> Result<Bytes, CompressionError> {
        let encoded = codec::encode(entry)?;
        Ok(Bytes::from(self.zstd_compress(&encoded)?))
    }

    /// Decompress and decode an archive blob.
    pub fn unpack(&self, blob: &[u8]) -> Result<CacheEntry, CompressionError> {
        let raw = self.zstd_decompress(blob)?;
        Ok(codec::decode(Bytes::from(raw))?)
    }

    fn zstd_compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let compressed = zstd::encode_all(data, self.level)?;
        Ok(compressed)
    }

    fn zstd_decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let decompressed = zstd::decode_all(data)?;
        Ok(decompressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::{CacheKey, EntryMetadata, RequestFeatures};

    #[test]
    fn test_zstd_roundtrip() {
        let compressor = Compressor::new(3);
        let data = vec![42u8; 4096];

        let compressed = compressor.zstd_compress(&data).unwrap();
        assert!(compressed.len() < data.len());

        let decompressed = compressor.zstd_decompress(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_pack_unpack_entry() {
        let compressor = Compressor::new(3);
        let entry = CacheEntry::new(
            CacheKey::for_request("m", "why is the sky blue"),
            "Rayleigh scattering. ".repeat(50),
            EntryMetadata::new(RequestFeatures::default(), 7),
        );

        let blob = compressor.pack(&entry).unwrap();
        assert!(blob.len() < entry.payload.len());
        assert_eq!(compressor.unpack(&blob).unwrap(), entry);
    }

    #[test]
    fn test_unpack_garbage_fails() {
        let compressor = Compressor::new(3);
        assert!(compressor.unpack(b"definitely not zstd").is_err());
    }
}
