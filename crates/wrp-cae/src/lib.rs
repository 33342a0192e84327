#![warn(missing_docs)]

//! IOWarp Context Assimilation Engine.
//!
//! Pulls external data (raw files, byte ranges, HDF5 datasets, existing tags)
//! into tagged pools, chunk by chunk, choosing compression parameters from a
//! sample of each source.
//!
//! Job path: Descriptor → Ingestor → Selector → Pool resolution → Compress → Append → Bind

pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod ingest;
pub mod job;
pub mod logging;

pub use config::{CaeConfig, RuntimeMode, StorageConfig, TimeoutConfig};
pub use context::{ContextBuilder, ContextInterface};
pub use descriptor::{AssimilationCtx, Format, JobDescriptor, Source};
pub use error::{CaeError, CaeResult, ErrorKind};
pub use ingest::{
    ChunkSource, DatasetFilter, DatasetInfo, DatasetLayout, FileSource, Hdf5Catalog,
    Hdf5Datatype, Hdf5FileSource, Hdf5Source, IngestorFactory, RawChunk, StaticCatalog, TagSource,
};
#[cfg(feature = "hdf5")]
pub use ingest::NativeCatalog;
pub use job::{JobFailure, JobHandle, JobId, JobObserver, JobReport, JobState, NoopObserver};
pub use logging::LogFormat;
