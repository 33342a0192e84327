//! Error types for the assimilation engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use wrp_reduce::ReduceError;
use wrp_storage::StorageError;

use crate::job::JobId;

/// Result type alias for engine operations.
pub type CaeResult<T> = Result<T, CaeError>;

/// Coarse failure classification reported in a failed job's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed descriptor; nothing was touched
    InvalidContext,
    /// Source could not be opened or read
    SourceUnreachable,
    /// Requested range extends past the end of the source
    RangeOutOfBounds,
    /// HDF5 dataset does not exist
    DatasetNotFound,
    /// HDF5 dataset element type cannot be streamed as bytes
    UnsupportedDatatype,
    /// No cost-model entry for the sample (recovered by fallback)
    SelectorModelUnavailable,
    /// Static pool id does not exist
    PoolNotFound,
    /// Pool or backing device could not be created
    PoolCreationFailed,
    /// Destination tag already bound and the policy forbids reuse
    TagConflict,
    /// I/O or codec failure while writing chunks
    WriteFailure,
    /// Stored data did not match its checksum on read-back
    ChecksumMismatch,
    /// A configured timeout expired
    Timeout,
    /// The job was cancelled
    Cancelled,
    /// The job named in `depends_on` did not complete
    DependencyFailed,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::InvalidContext => "invalid_context",
            ErrorKind::SourceUnreachable => "source_unreachable",
            ErrorKind::RangeOutOfBounds => "range_out_of_bounds",
            ErrorKind::DatasetNotFound => "dataset_not_found",
            ErrorKind::UnsupportedDatatype => "unsupported_datatype",
            ErrorKind::SelectorModelUnavailable => "selector_model_unavailable",
            ErrorKind::PoolNotFound => "pool_not_found",
            ErrorKind::PoolCreationFailed => "pool_creation_failed",
            ErrorKind::TagConflict => "tag_conflict",
            ErrorKind::WriteFailure => "write_failure",
            ErrorKind::ChecksumMismatch => "checksum_mismatch",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::DependencyFailed => "dependency_failed",
        };
        f.write_str(s)
    }
}

/// Error variants for engine operations.
#[derive(Debug, Error)]
pub enum CaeError {
    /// A descriptor field could not be parsed or the fields are inconsistent.
    #[error("Invalid context: {field}: {reason}")]
    InvalidContext {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// Source could not be opened or read.
    #[error("Source unreachable: {src}: {reason}")]
    SourceUnreachable {
        /// Source URI
        src: String,
        /// Underlying failure
        reason: String,
    },

    /// Requested byte range exceeds the source.
    #[error("Range [{offset}:{size}] out of bounds for {src} ({extent} bytes)")]
    RangeOutOfBounds {
        /// Source URI
        src: String,
        /// Requested start
        offset: u64,
        /// Requested length
        size: u64,
        /// Actual source size
        extent: u64,
    },

    /// HDF5 dataset missing from the file.
    #[error("Dataset '{dataset}' not found in {file}")]
    DatasetNotFound {
        /// HDF5 file path
        file: String,
        /// Dataset path
        dataset: String,
    },

    /// HDF5 dataset has an element type that cannot be chunked as raw bytes.
    #[error("Unsupported datatype {datatype} for dataset '{dataset}'")]
    UnsupportedDatatype {
        /// Dataset path
        dataset: String,
        /// Datatype description
        datatype: String,
    },

    /// Codec or selector failure.
    #[error("Reduction error: {0}")]
    Reduce(#[from] ReduceError),

    /// Storage layer failure.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A configured timeout expired.
    #[error("Timed out during {stage} after {after_ms} ms")]
    Timeout {
        /// Pipeline stage that timed out
        stage: &'static str,
        /// Configured limit
        after_ms: u64,
    },

    /// The job was cancelled.
    #[error("Job cancelled")]
    Cancelled,

    /// The job this one waited on failed or was cancelled.
    #[error("Dependency {job} did not complete: {reason}")]
    DependencyFailed {
        /// Job waited on
        job: JobId,
        /// Its final state
        reason: String,
    },

    /// Engine configuration is unusable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A pipeline task died unexpectedly.
    #[error("Pipeline task failed: {0}")]
    Task(String),
}

impl CaeError {
    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaeError::InvalidContext { .. } | CaeError::Config(_) => ErrorKind::InvalidContext,
            CaeError::SourceUnreachable { .. } => ErrorKind::SourceUnreachable,
            CaeError::RangeOutOfBounds { .. } => ErrorKind::RangeOutOfBounds,
            CaeError::DatasetNotFound { .. } => ErrorKind::DatasetNotFound,
            CaeError::UnsupportedDatatype { .. } => ErrorKind::UnsupportedDatatype,
            CaeError::Reduce(ReduceError::SelectorModelUnavailable { .. }) => {
                ErrorKind::SelectorModelUnavailable
            }
            CaeError::Reduce(_) => ErrorKind::WriteFailure,
            CaeError::Storage(e) => match e {
                StorageError::PoolNotFound { .. } | StorageError::TagNotFound { .. } => {
                    ErrorKind::PoolNotFound
                }
                StorageError::PoolCreationFailed { .. } => ErrorKind::PoolCreationFailed,
                StorageError::TagConflict { .. } => ErrorKind::TagConflict,
                StorageError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
                StorageError::LeaseTimeout { .. } => ErrorKind::Timeout,
                StorageError::InvalidTag { .. } => ErrorKind::InvalidContext,
                StorageError::IoError(_)
                | StorageError::Codec(_)
                | StorageError::OutOfSpace { .. }
                | StorageError::ReadOutOfBounds { .. }
                | StorageError::CorruptIndex { .. }
                | StorageError::OutOfOrder { .. }
                | StorageError::SerializationError { .. } => ErrorKind::WriteFailure,
            },
            CaeError::Timeout { .. } => ErrorKind::Timeout,
            CaeError::Cancelled => ErrorKind::Cancelled,
            CaeError::DependencyFailed { .. } => ErrorKind::DependencyFailed,
            CaeError::Task(_) => ErrorKind::WriteFailure,
        }
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        CaeError::InvalidContext {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn unreachable(src: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        CaeError::SourceUnreachable {
            src: src.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<std::io::Error> for CaeError {
    fn from(e: std::io::Error) -> Self {
        CaeError::Storage(StorageError::IoError(e))
    }
}
