#![warn(missing_docs)]

//! IOWarp assimilation storage layer: typed block devices, a replayable chunk
//! index, tag-addressed pools and the registry that resolves tags to pools.
//!
//! Write path: Tag → Registry resolve (lease) → Pool → Bdev append → Index append → Bind

pub mod bdev;
pub mod checksum;
pub mod error;
pub mod index;
pub mod placement;
pub mod pool;
pub mod registry;
pub mod tag;

pub use bdev::{create_bdev, Bdev, BdevConfig, BdevType, FileBdev, MemoryBdev};
pub use checksum::{Checksum, ChecksumAlgorithm};
pub use error::{StorageError, StorageResult};
pub use index::{ChunkIndex, ChunkLocation, ChunkRecord, INDEX_MAGIC, INDEX_VERSION};
pub use placement::{
    LeastLoaded, LocalFirst, NodeId, NodeLoad, PlacementKind, PlacementPolicy, RoundRobin,
};
pub use pool::{encode_chunk, EncodedChunk, Pool, PoolId};
pub use registry::{
    LocalRegistry, PoolHandle, PoolQuery, PoolRegistry, Reassimilation, RegistryConfig,
    Resolution, TagLease,
};
pub use tag::Tag;
