//! Empirical cost model: expected (ratio, time, CPU) per profile and distribution class.
//!
//! The default table is derived from the compression parameter study: low
//! entropy favors high-ratio/high-CPU codecs, near-random data favors fast
//! codecs or pass-through.

use serde::{Deserialize, Serialize};

use crate::compression::CodecId;
use crate::error::ReduceError;
use crate::profile::{ChunkSizeClass, CompressionProfile};
use crate::stats::DistributionClass;

/// Measured cost of a profile on one distribution class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostVector {
    /// Compression ratio (raw / compressed)
    pub ratio: f64,
    /// Compression time per MiB of input
    pub compress_ms_per_mib: f64,
    /// Decompression time per MiB of output
    pub decompress_ms_per_mib: f64,
    /// CPU utilisation while compressing
    pub cpu_percent: f64,
}

/// One row of the cost table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostEntry {
    /// Distribution class the measurement applies to
    pub class: DistributionClass,
    /// Profile measured
    pub profile: CompressionProfile,
    /// Measured cost
    pub cost: CostVector,
}

impl CostEntry {
    #[allow(clippy::too_many_arguments)]
    const fn new(
        class: DistributionClass,
        codec: CodecId,
        level: i32,
        chunk_size: ChunkSizeClass,
        ratio: f64,
        compress_ms_per_mib: f64,
        decompress_ms_per_mib: f64,
        cpu_percent: f64,
    ) -> Self {
        Self {
            class,
            profile: CompressionProfile::new(codec, level, chunk_size),
            cost: CostVector {
                ratio,
                compress_ms_per_mib,
                decompress_ms_per_mib,
                cpu_percent,
            },
        }
    }
}

/// Lookup table keyed by distribution class. Row order is significant: it is
/// the final tie-break when ratio and time are equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    entries: Vec<CostEntry>,
}

impl CostModel {
    /// Build a model from explicit rows.
    pub fn new(entries: Vec<CostEntry>) -> Self {
        Self { entries }
    }

    /// The built-in table.
    pub fn empirical() -> Self {
        use ChunkSizeClass::*;
        use CodecId::*;
        use DistributionClass::*;

        Self::new(vec![
            CostEntry::new(Constant, Zstd, 19, Large, 180.0, 9.0, 0.4, 99.0),
            CostEntry::new(Constant, Zstd, 3, Large, 150.0, 1.1, 0.4, 98.0),
            CostEntry::new(Constant, Lz4, 0, Large, 120.0, 0.4, 0.2, 97.0),
            CostEntry::new(LowEntropy, Zstd, 9, Large, 4.6, 18.0, 1.9, 99.0),
            CostEntry::new(LowEntropy, Zstd, 3, Medium, 4.4, 4.5, 1.8, 98.0),
            CostEntry::new(LowEntropy, Lz4, 0, Medium, 2.9, 1.2, 0.5, 96.0),
            CostEntry::new(Clustered, Zstd, 3, Medium, 2.4, 5.0, 2.2, 98.0),
            CostEntry::new(Clustered, Zstd, 1, Medium, 2.3, 3.1, 2.1, 97.0),
            CostEntry::new(Clustered, Lz4, 0, Medium, 1.7, 1.5, 0.6, 95.0),
            CostEntry::new(Spread, Zstd, 1, Medium, 1.2, 3.5, 2.4, 97.0),
            CostEntry::new(Spread, Lz4, 0, Medium, 1.15, 1.4, 0.6, 95.0),
            CostEntry::new(Random, None, 0, Large, 1.0, 0.05, 0.05, 5.0),
            CostEntry::new(Random, Lz4, 0, Medium, 0.996, 1.0, 0.3, 94.0),
        ])
    }

    /// Parse a model from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self, ReduceError> {
        serde_json::from_str(json).map_err(|e| ReduceError::InvalidCostModel(e.to_string()))
    }

    /// Serialize the model to JSON.
    pub fn to_json(&self) -> Result<String, ReduceError> {
        serde_json::to_string_pretty(self).map_err(|e| ReduceError::InvalidCostModel(e.to_string()))
    }

    /// Rows for one class, in table order.
    pub fn candidates(&self, class: DistributionClass) -> impl Iterator<Item = &CostEntry> {
        self.entries.iter().filter(move |e| e.class == class)
    }

    /// True if at least one row covers the class.
    pub fn covers(&self, class: DistributionClass) -> bool {
        self.candidates(class).next().is_some()
    }

    /// All rows.
    pub fn entries(&self) -> &[CostEntry] {
        &self.entries
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Is the table empty?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CostModel {
    fn default() -> Self {
        Self::empirical()
    }
}
