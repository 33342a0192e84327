//! Chunk checksums.
//!
//! A checksum always covers the raw chunk bytes, before compression. Reading
//! a chunk back therefore exercises the whole decode path: a wrong codec,
//! a truncated payload or a flipped bit on the device all show up as a
//! mismatch against the value recorded in the chunk index.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Digest used for chunk checksums, chosen per pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// CRC-32 (IEEE)
    #[default]
    Crc32,
    /// XXH3, 64-bit
    Xxh3,
    /// First 8 bytes of BLAKE3
    Blake3,
    /// Nothing recorded; every read verifies
    None,
}

impl ChecksumAlgorithm {
    /// 64-bit digest of `data`.
    pub fn digest(self, data: &[u8]) -> u64 {
        match self {
            ChecksumAlgorithm::Crc32 => u64::from(crc32fast::hash(data)),
            ChecksumAlgorithm::Xxh3 => xxhash_rust::xxh3::xxh3_64(data),
            ChecksumAlgorithm::Blake3 => {
                let hash = blake3::hash(data);
                let mut prefix = [0u8; 8];
                prefix.copy_from_slice(&hash.as_bytes()[..8]);
                u64::from_le_bytes(prefix)
            }
            ChecksumAlgorithm::None => 0,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChecksumAlgorithm::Crc32 => "crc32",
            ChecksumAlgorithm::Xxh3 => "xxh3",
            ChecksumAlgorithm::Blake3 => "blake3",
            ChecksumAlgorithm::None => "none",
        })
    }
}

/// Recorded digest of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    /// Digest that produced `value`
    pub algorithm: ChecksumAlgorithm,
    /// Digest value
    pub value: u64,
}

impl Checksum {
    /// Wraps a known value.
    pub fn new(algorithm: ChecksumAlgorithm, value: u64) -> Self {
        Self { algorithm, value }
    }

    /// Whether `data` hashes to this value.
    pub fn matches(&self, data: &[u8]) -> bool {
        self.algorithm.digest(data) == self.value
    }
}

/// Checksum of `data`.
pub fn compute(algorithm: ChecksumAlgorithm, data: &[u8]) -> Checksum {
    Checksum::new(algorithm, algorithm.digest(data))
}

/// Checks `data` against a recorded checksum, logging the mismatch.
pub fn verify(recorded: &Checksum, data: &[u8]) -> bool {
    let actual = recorded.algorithm.digest(data);
    if actual != recorded.value {
        debug!(
            algorithm = %recorded.algorithm,
            recorded = recorded.value,
            actual,
            len = data.len(),
            "chunk checksum mismatch"
        );
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGESTS: [ChecksumAlgorithm; 3] = [
        ChecksumAlgorithm::Crc32,
        ChecksumAlgorithm::Xxh3,
        ChecksumAlgorithm::Blake3,
    ];

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(ChecksumAlgorithm::Crc32.digest(b"123456789"), 0xCBF4_3926);
        assert_eq!(ChecksumAlgorithm::Crc32.digest(&[]), 0);
    }

    #[test]
    fn test_single_bit_flip_in_chunk() {
        let chunk: Vec<u8> = (0..64 * 1024u32).map(|i| (i * 31 % 251) as u8).collect();
        for algorithm in DIGESTS {
            let recorded = compute(algorithm, &chunk);
            assert!(recorded.matches(&chunk));
            for pos in [0, chunk.len() / 2, chunk.len() - 1] {
                let mut damaged = chunk.clone();
                damaged[pos] ^= 0x01;
                assert!(!verify(&recorded, &damaged), "{algorithm} missed flip at {pos}");
            }
        }
    }

    #[test]
    fn test_truncated_chunk_rejected() {
        let chunk = b"chunk payload that gets cut short".to_vec();
        for algorithm in DIGESTS {
            let recorded = compute(algorithm, &chunk);
            assert!(!verify(&recorded, &chunk[..chunk.len() - 1]));
        }
    }

    #[test]
    fn test_none_accepts_anything() {
        let recorded = compute(ChecksumAlgorithm::None, b"raw");
        assert_eq!(recorded.value, 0);
        assert!(verify(&recorded, b"something else"));
    }

    #[test]
    fn test_names_match_config_spelling() {
        for algorithm in DIGESTS {
            let json = serde_json::to_string(&algorithm).unwrap();
            assert_eq!(json, format!("\"{}\"", algorithm));
        }
        assert_eq!(ChecksumAlgorithm::default(), ChecksumAlgorithm::Crc32);
    }
}
