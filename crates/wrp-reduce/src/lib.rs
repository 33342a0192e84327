#![warn(missing_docs)]

//! IOWarp assimilation reduction layer: codec capability interface (LZ4/Zstd),
//! sample statistics and cost-model driven compression parameter selection.
//!
//! Selection path: Sample chunks → Statistics → Distribution class → Cost model → Trial → Profile

pub mod compression;
pub mod cost_model;
pub mod error;
pub mod profile;
pub mod selector;
pub mod stats;

pub use compression::{compressor, CodecId, CodecSpec, Compressor, Lz4Compressor, Passthrough, ZstdCompressor};
pub use cost_model::{CostEntry, CostModel, CostVector};
pub use error::ReduceError;
pub use profile::{ChunkSizeClass, CompressionProfile};
pub use selector::{CompressionSelector, SelectionReport, SelectorConfig};
pub use stats::{byte_entropy, DistributionClass, SampleStats};
