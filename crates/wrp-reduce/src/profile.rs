//! Compression profiles: a codec paired with a chunk size class.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::compression::{CodecId, CodecSpec};

/// Chunk size classes the selector chooses between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChunkSizeClass {
    /// 4KB — small records, highest per-chunk overhead
    Small,
    /// 64KB — balanced default
    Medium,
    /// 1MB — bulk, best ratio for highly redundant data
    Large,
}

impl ChunkSizeClass {
    /// Returns the size in bytes.
    pub fn as_bytes(&self) -> usize {
        match self {
            ChunkSizeClass::Small => 4096,
            ChunkSizeClass::Medium => 65536,
            ChunkSizeClass::Large => 1_048_576,
        }
    }

    /// Returns the matching class for the given byte count, or None if unsupported.
    pub fn from_bytes(bytes: usize) -> Option<ChunkSizeClass> {
        match bytes {
            4096 => Some(ChunkSizeClass::Small),
            65536 => Some(ChunkSizeClass::Medium),
            1_048_576 => Some(ChunkSizeClass::Large),
            _ => None,
        }
    }

    /// Returns the largest class not exceeding `bytes`, falling back to Small.
    pub fn at_most(bytes: usize) -> ChunkSizeClass {
        Self::all()
            .iter()
            .rev()
            .copied()
            .find(|c| c.as_bytes() <= bytes)
            .unwrap_or(ChunkSizeClass::Small)
    }

    /// Returns all classes in ascending order.
    pub fn all() -> &'static [ChunkSizeClass] {
        &[
            ChunkSizeClass::Small,
            ChunkSizeClass::Medium,
            ChunkSizeClass::Large,
        ]
    }
}

impl fmt::Display for ChunkSizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkSizeClass::Small => write!(f, "4KB"),
            ChunkSizeClass::Medium => write!(f, "64KB"),
            ChunkSizeClass::Large => write!(f, "1MB"),
        }
    }
}

/// Codec + chunk-size pair chosen for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompressionProfile {
    /// Codec applied to every chunk
    pub codec: CodecId,
    /// Codec level
    pub level: i32,
    /// Chunk size class used by the ingestor
    pub chunk_size: ChunkSizeClass,
}

impl CompressionProfile {
    /// Creates a profile.
    pub const fn new(codec: CodecId, level: i32, chunk_size: ChunkSizeClass) -> Self {
        Self {
            codec,
            level,
            chunk_size,
        }
    }

    /// Pass-through profile with the given chunk size.
    pub const fn no_compression(chunk_size: ChunkSizeClass) -> Self {
        Self::new(CodecId::None, 0, chunk_size)
    }

    /// Fast codec, mid-size chunks. Used when the cost model cannot answer.
    pub const fn safe_default() -> Self {
        Self::new(CodecId::Lz4, 0, ChunkSizeClass::Medium)
    }

    /// Profile for an explicit codec spec.
    pub fn from_spec(spec: CodecSpec, chunk_size: ChunkSizeClass) -> Self {
        Self::new(spec.codec, spec.level, chunk_size)
    }

    /// True when chunks are stored uncompressed.
    pub fn is_passthrough(&self) -> bool {
        self.codec == CodecId::None
    }

    /// Codec and level of this profile.
    pub fn spec(&self) -> CodecSpec {
        CodecSpec {
            codec: self.codec,
            level: self.level,
        }
    }
}

impl Default for CompressionProfile {
    fn default() -> Self {
        Self::safe_default()
    }
}

impl fmt::Display for CompressionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.spec(), self.chunk_size)
    }
}
