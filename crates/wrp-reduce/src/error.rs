//! Error types for the wrp-reduce subsystem

use crate::stats::DistributionClass;

/// All errors that can occur during codec and selection operations
#[derive(Debug, thiserror::Error)]
pub enum ReduceError {
    /// Compression operation failed
    #[error("Compression failed: {0}")]
    CompressionFailed(String),
    /// Decompression operation failed
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
    /// Codec identifier or codec spec string was not recognized
    #[error("Unknown codec: {0}")]
    UnknownCodec(String),
    /// The cost model has no entry for the observed distribution class
    #[error("No cost-model entry for distribution class {class}")]
    SelectorModelUnavailable {
        /// Class observed in the sample
        class: DistributionClass,
    },
    /// Cost model table could not be parsed
    #[error("Invalid cost model: {0}")]
    InvalidCostModel(String),
}
