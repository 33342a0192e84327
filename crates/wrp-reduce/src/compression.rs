//! Codec capability interface with LZ4 and Zstd implementations.
//!
//! Every codec is reached through [`Compressor`], so the selection policy only
//! ever deals with a [`CodecId`] and never with a codec library directly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ReduceError;

/// Identifier of a codec, as recorded in the chunk index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CodecId {
    /// No compression (passthrough); decompression is skipped on read
    None,
    /// LZ4 block format with prepended size — hot path, low CPU
    #[default]
    Lz4,
    /// Zstandard — higher ratio, level-dependent CPU cost
    Zstd,
}

impl CodecId {
    /// All codecs in a stable order.
    pub fn all() -> &'static [CodecId] {
        &[CodecId::None, CodecId::Lz4, CodecId::Zstd]
    }

    /// Lowercase name used in descriptors and config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            CodecId::None => "none",
            CodecId::Lz4 => "lz4",
            CodecId::Zstd => "zstd",
        }
    }

    /// Default level for the codec when none is given.
    pub fn default_level(&self) -> i32 {
        match self {
            CodecId::None | CodecId::Lz4 => 0,
            CodecId::Zstd => 3,
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodecId {
    type Err = ReduceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" | "passthrough" => Ok(CodecId::None),
            "lz4" => Ok(CodecId::Lz4),
            "zstd" | "zstandard" => Ok(CodecId::Zstd),
            other => Err(ReduceError::UnknownCodec(other.to_string())),
        }
    }
}

/// A codec plus level, parsed from `"<codec>"` or `"<codec>:<level>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodecSpec {
    /// Codec to use
    pub codec: CodecId,
    /// Codec level (ignored by codecs without levels)
    pub level: i32,
}

impl CodecSpec {
    /// Spec with the codec's default level.
    pub fn new(codec: CodecId) -> Self {
        Self {
            codec,
            level: codec.default_level(),
        }
    }
}

impl FromStr for CodecSpec {
    type Err = ReduceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((codec, level)) => {
                let codec: CodecId = codec.parse()?;
                let level = level
                    .trim()
                    .parse::<i32>()
                    .map_err(|_| ReduceError::UnknownCodec(s.to_string()))?;
                Ok(Self { codec, level })
            }
            None => Ok(Self::new(s.parse()?)),
        }
    }
}

impl fmt::Display for CodecSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.codec {
            CodecId::Zstd => write!(f, "{}:{}", self.codec, self.level),
            _ => write!(f, "{}", self.codec),
        }
    }
}

/// Capability interface every codec implements.
pub trait Compressor: Send + Sync {
    /// Identifier recorded alongside compressed payloads.
    fn id(&self) -> CodecId;

    /// Compress `data` at the given level.
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, ReduceError>;

    /// Decompress a payload produced by [`Compressor::compress`].
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, ReduceError>;
}

/// Stores bytes unchanged.
#[derive(Debug, Default)]
pub struct Passthrough;

impl Compressor for Passthrough {
    fn id(&self) -> CodecId {
        CodecId::None
    }

    fn compress(&self, data: &[u8], _level: i32) -> Result<Vec<u8>, ReduceError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, ReduceError> {
        Ok(data.to_vec())
    }
}

/// LZ4 block codec (size-prepended).
#[derive(Debug, Default)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn id(&self) -> CodecId {
        CodecId::Lz4
    }

    fn compress(&self, data: &[u8], _level: i32) -> Result<Vec<u8>, ReduceError> {
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, ReduceError> {
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| ReduceError::DecompressionFailed(e.to_string()))
    }
}

/// Zstandard codec.
#[derive(Debug, Default)]
pub struct ZstdCompressor;

impl ZstdCompressor {
    const MIN_LEVEL: i32 = 1;
    const MAX_LEVEL: i32 = 22;
}

impl Compressor for ZstdCompressor {
    fn id(&self) -> CodecId {
        CodecId::Zstd
    }

    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, ReduceError> {
        let level = level.clamp(Self::MIN_LEVEL, Self::MAX_LEVEL);
        zstd::encode_all(data, level).map_err(|e| ReduceError::CompressionFailed(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, ReduceError> {
        zstd::decode_all(data).map_err(|e| ReduceError::DecompressionFailed(e.to_string()))
    }
}

static PASSTHROUGH: Passthrough = Passthrough;
static LZ4: Lz4Compressor = Lz4Compressor;
static ZSTD: ZstdCompressor = ZstdCompressor;

/// Look up the codec implementation for an identifier.
pub fn compressor(id: CodecId) -> &'static dyn Compressor {
    match id {
        CodecId::None => &PASSTHROUGH,
        CodecId::Lz4 => &LZ4,
        CodecId::Zstd => &ZSTD,
    }
}

/// Compress `data` with the given codec and level.
pub fn compress(data: &[u8], codec: CodecId, level: i32) -> Result<Vec<u8>, ReduceError> {
    compressor(codec).compress(data, level)
}

/// Decompress `data` using the codec that produced it.
pub fn decompress(data: &[u8], codec: CodecId) -> Result<Vec<u8>, ReduceError> {
    compressor(codec).decompress(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_lz4_roundtrip(data in prop::collection::vec(0u8..=255, 0..100_000)) {
            let c = compress(&data, CodecId::Lz4, 0).unwrap();
            prop_assert_eq!(decompress(&c, CodecId::Lz4).unwrap(), data);
        }

        #[test]
        fn prop_zstd_roundtrip(data in prop::collection::vec(0u8..=255, 0..100_000), level in 1i32..10) {
            let c = compress(&data, CodecId::Zstd, level).unwrap();
            prop_assert_eq!(decompress(&c, CodecId::Zstd).unwrap(), data);
        }
    }

    #[test]
    fn empty_roundtrips() {
        for &codec in CodecId::all() {
            let c = compress(&[], codec, codec.default_level()).unwrap();
            assert_eq!(decompress(&c, codec).unwrap(), b"");
        }
    }

    #[test]
    fn passthrough_is_identity() {
        let data = b"raw bytes stay raw";
        assert_eq!(compress(data, CodecId::None, 0).unwrap(), data);
    }

    #[test]
    fn zstd_level_is_clamped() {
        let data = vec![7u8; 4096];
        let c = compress(&data, CodecId::Zstd, 99).unwrap();
        assert_eq!(decompress(&c, CodecId::Zstd).unwrap(), data);
        let c = compress(&data, CodecId::Zstd, -5).unwrap();
        assert_eq!(decompress(&c, CodecId::Zstd).unwrap(), data);
    }

    #[test]
    fn corrupt_lz4_fails() {
        let err = decompress(&[16, 0, 0, 0, 0xff], CodecId::Lz4).unwrap_err();
        assert!(matches!(err, ReduceError::DecompressionFailed(_)));
    }

    #[test]
    fn codec_id_parse_and_display() {
        assert_eq!("LZ4".parse::<CodecId>().unwrap(), CodecId::Lz4);
        assert_eq!("zstd".parse::<CodecId>().unwrap(), CodecId::Zstd);
        assert_eq!("none".parse::<CodecId>().unwrap(), CodecId::None);
        assert!("brotli".parse::<CodecId>().is_err());
        assert_eq!(CodecId::Zstd.to_string(), "zstd");
    }

    #[test]
    fn codec_spec_parse() {
        let spec: CodecSpec = "zstd:9".parse().unwrap();
        assert_eq!(spec.codec, CodecId::Zstd);
        assert_eq!(spec.level, 9);
        assert_eq!(spec.to_string(), "zstd:9");

        let spec: CodecSpec = "zstd".parse().unwrap();
        assert_eq!(spec.level, 3);

        let spec: CodecSpec = "lz4".parse().unwrap();
        assert_eq!(spec.to_string(), "lz4");

        assert!("zstd:high".parse::<CodecSpec>().is_err());
    }

    #[test]
    fn compressor_ids_match() {
        for &codec in CodecId::all() {
            assert_eq!(compressor(codec).id(), codec);
        }
    }
}
