//! Compression pipeline for durable mirror payloads.
//!
//! Serialized JSON above the configured threshold is zstd-compressed before
//! it reaches the store. Decoding sniffs the zstd frame magic, so compressed
//! and plain payloads can coexist in one store.

use thiserror::Error;

use crate::config::MirrorConfig;

/// zstd frame magic number (little endian 0xFD2FB528).
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Zstd compression failed: {0}")]
    ZstdError(#[from] std::io::Error),
}

/// The compression engine for mirror payloads.
#[derive(Debug, Clone)]
pub struct Compressor {
    enabled: bool,
    threshold: usize,
    level: i32,
}

impl Compressor {
    pub fn new(config: &MirrorConfig) -> Self {
        Self {
            enabled: config.zstd_compression,
            threshold: config.compress_threshold_bytes,
            level: config.zstd_level,
        }
    }

    /// Prepare a serialized payload for storage.
    pub fn encode(&self, payload: Vec<u8>) -> Result<Vec<u8>, CompressionError> {
        if self.enabled && payload.len() > self.threshold {
            self.zstd_compress(&payload)
        } else {
            Ok(payload)
        }
    }

    /// Reverse [`Compressor::encode`].
    pub fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if Self::is_compressed(stored) {
            self.zstd_decompress(stored)
        } else {
            Ok(stored.to_vec())
        }
    }

    pub fn is_compressed(data: &[u8]) -> bool {
        data.starts_with(&ZSTD_MAGIC)
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

    fn compressor(threshold: usize) -> Compressor {
        Compressor::new(&MirrorConfig {
            compress_threshold_bytes: threshold,
            ..MirrorConfig::default()
        })
    }

    #[test]
    fn test_small_payload_stored_plain() {
        let c = compressor(64);
        let data = br#"{"theme":"light"}"#.to_vec();
        let encoded = c.encode(data.clone()).unwrap();
        assert_eq!(encoded, data);
        assert!(!Compressor::is_compressed(&encoded));
    }

    #[test]
    fn test_large_payload_compressed_and_restored() {
        let c = compressor(64);
        let data = serde_json::to_vec(&vec!["repeated-asset-chunk"; 200]).unwrap();

        let encoded = c.encode(data.clone()).unwrap();
        assert!(Compressor::is_compressed(&encoded));
        assert!(encoded.len() < data.len());

        assert_eq!(c.decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_corrupt_frame_is_an_error() {
        let c = compressor(64);
        let mut bogus = ZSTD_MAGIC.to_vec();
        bogus.extend_from_slice(&[0xFF; 8]);
        assert!(c.decode(&bogus).is_err());
    }
}
