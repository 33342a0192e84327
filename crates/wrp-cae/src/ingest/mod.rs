//! Format ingestors.
//!
//! An ingestor turns a parsed [`Source`] into a lazy, finite sequence of raw
//! chunks with gapless, increasing offsets. Sources are opened read-only and
//! released when the sequence is exhausted or the ingestor is dropped.

pub mod binary;
pub mod hdf5;
#[cfg(feature = "hdf5")]
pub mod native;
pub mod tag;

use std::sync::Arc;

use wrp_storage::PoolRegistry;

use crate::descriptor::Source;
use crate::error::CaeResult;

pub use binary::FileSource;
pub use self::hdf5::{
    DatasetFilter, DatasetInfo, DatasetLayout, Hdf5Catalog, Hdf5Datatype, Hdf5FileSource,
    Hdf5Source, StaticCatalog,
};
#[cfg(feature = "hdf5")]
pub use native::NativeCatalog;
pub use tag::TagSource;

/// One chunk of source bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    /// Offset relative to the start of the ingested extent
    pub offset: u64,
    /// Chunk bytes
    pub data: Vec<u8>,
}

impl RawChunk {
    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Lazy chunk stream over one source.
pub trait ChunkSource: Send {
    /// Total bytes the stream will yield.
    fn extent(&self) -> u64;

    /// Next chunk, or None once the extent has been covered.
    fn next_chunk(&mut self) -> CaeResult<Option<RawChunk>>;

    /// Changes the size of chunks not yet produced. Sources whose boundaries
    /// are dictated by the data layout ignore it.
    fn set_chunk_size(&mut self, _chunk_size: usize) {}
}

/// Opens ingestors for every supported scheme.
#[derive(Clone)]
pub struct IngestorFactory {
    catalog: Arc<dyn Hdf5Catalog>,
    registry: Arc<dyn PoolRegistry>,
}

impl IngestorFactory {
    /// Factory over an HDF5 catalog and the registry existing tags are read from.
    pub fn new(catalog: Arc<dyn Hdf5Catalog>, registry: Arc<dyn PoolRegistry>) -> Self {
        Self { catalog, registry }
    }

    /// Opens `source` with the given chunk size. Blocking.
    pub fn open(&self, source: &Source, chunk_size: usize) -> CaeResult<Box<dyn ChunkSource>> {
        let chunk_size = chunk_size.max(1);
        Ok(match source {
            Source::File { path } => Box::new(FileSource::open(path, chunk_size)?),
            Source::Range { path, offset, size } => {
                Box::new(FileSource::open_range(path, *offset, *size, chunk_size)?)
            }
            Source::Hdf5 {
                file,
                dataset: Some(dataset),
                ..
            } => Box::new(Hdf5Source::open(
                self.catalog.clone(),
                file,
                dataset,
                chunk_size,
            )?),
            Source::Hdf5 {
                file,
                dataset: None,
                filter,
            } => Box::new(Hdf5FileSource::open(
                self.catalog.clone(),
                file,
                filter,
                chunk_size,
            )?),
            Source::Tag(tag) => Box::new(TagSource::open(self.registry.as_ref(), tag)?),
        })
    }
}
