//! Error types for the storage subsystem.

use thiserror::Error;

use wrp_reduce::ReduceError;

use crate::pool::PoolId;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Codec failure while encoding or decoding a chunk.
    #[error("Codec error: {0}")]
    Codec(#[from] ReduceError),

    /// No block device in the pool has room for the write.
    #[error("Out of space on {bdev}: requested {requested} bytes")]
    OutOfSpace {
        /// Label of the last device tried.
        bdev: String,
        /// Size of the rejected write.
        requested: u64,
    },

    /// Read beyond the written extent of a block device.
    #[error("Read out of bounds on {bdev}: offset {offset} + {len} exceeds {size}")]
    ReadOutOfBounds {
        /// Device label.
        bdev: String,
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: u64,
        /// Bytes written to the device.
        size: u64,
    },

    /// Data corruption detected on read-back.
    #[error("Checksum mismatch in {pool_id} at offset {offset}: expected {expected:#x}, actual {actual:#x}")]
    ChecksumMismatch {
        /// Pool holding the chunk.
        pool_id: PoolId,
        /// Logical offset of the chunk.
        offset: u64,
        /// Checksum recorded in the chunk index.
        expected: u64,
        /// Checksum of the decoded bytes.
        actual: u64,
    },

    /// Chunk index log is corrupted or has an unexpected format.
    #[error("Corrupted chunk index: {reason}")]
    CorruptIndex {
        /// Description of the corruption.
        reason: String,
    },

    /// A record would break the contiguous offset ordering of the index.
    #[error("Out-of-order chunk: expected offset {expected}, got {actual}")]
    OutOfOrder {
        /// Next offset the index accepts.
        expected: u64,
        /// Offset that was offered.
        actual: u64,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {reason}")]
    SerializationError {
        /// Description of the error.
        reason: String,
    },

    /// Tag string is not of the form `namespace::name`.
    #[error("Invalid tag '{tag}': {reason}")]
    InvalidTag {
        /// The offending tag.
        tag: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Static resolution named a pool that does not exist.
    #[error("Pool not found: {pool_id}")]
    PoolNotFound {
        /// The pool that was not found.
        pool_id: PoolId,
    },

    /// A pool or its backing device could not be created.
    #[error("Pool creation failed: {reason}")]
    PoolCreationFailed {
        /// Description of the failure.
        reason: String,
    },

    /// The tag is already bound and the re-assimilation policy forbids reuse,
    /// or a static pool is bound to another tag.
    #[error("Tag conflict on '{tag}': {reason}")]
    TagConflict {
        /// The conflicting tag.
        tag: String,
        /// Description of the conflict.
        reason: String,
    },

    /// No pool is bound to the tag.
    #[error("Tag not found: {tag}")]
    TagNotFound {
        /// The tag that was looked up.
        tag: String,
    },

    /// Waiting for the per-tag lease took too long.
    #[error("Timed out waiting for lease on tag '{tag}'")]
    LeaseTimeout {
        /// The contended tag.
        tag: String,
    },
}

impl StorageError {
    pub(crate) fn serialization(e: impl std::fmt::Display) -> Self {
        StorageError::SerializationError {
            reason: e.to_string(),
        }
    }
}
