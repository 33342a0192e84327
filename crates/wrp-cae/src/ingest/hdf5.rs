//! HDF5 dataset ingestion.
//!
//! Parsing HDF5 files is left to the catalog behind [`Hdf5Catalog`]; this
//! module only walks the layout it reports. Chunked datasets are emitted one
//! native chunk at a time, contiguous ones in element-aligned pieces of the
//! requested size. A whole-file source walks every dataset the catalog lists
//! that passes the job's [`DatasetFilter`], in path order, as one stream.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use glob::{MatchOptions, Pattern};
use tracing::{debug, warn};

use super::{ChunkSource, RawChunk};
use crate::error::{CaeError, CaeResult};

/// Element type of a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hdf5Datatype {
    /// Signed or unsigned integer of `size` bytes
    Integer {
        /// Element size in bytes
        size: usize,
    },
    /// IEEE float of `size` bytes
    Float {
        /// Element size in bytes
        size: usize,
    },
    /// Fixed-length string
    FixedString {
        /// Element size in bytes
        size: usize,
    },
    /// Opaque fixed-size blob
    Opaque {
        /// Element size in bytes
        size: usize,
    },
    /// Variable-length string (heap references, not inline bytes)
    VarLenString,
    /// Compound type with named fields
    Compound {
        /// Field names
        fields: Vec<String>,
    },
    /// Object or region reference
    Reference,
}

impl Hdf5Datatype {
    /// Bytes per element, or None if the type cannot be streamed as raw bytes.
    pub fn element_size(&self) -> Option<usize> {
        match self {
            Hdf5Datatype::Integer { size }
            | Hdf5Datatype::Float { size }
            | Hdf5Datatype::FixedString { size }
            | Hdf5Datatype::Opaque { size } => Some(*size).filter(|s| *s > 0),
            Hdf5Datatype::VarLenString
            | Hdf5Datatype::Compound { .. }
            | Hdf5Datatype::Reference => None,
        }
    }
}

impl fmt::Display for Hdf5Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hdf5Datatype::Integer { size } => write!(f, "int{}", size * 8),
            Hdf5Datatype::Float { size } => write!(f, "float{}", size * 8),
            Hdf5Datatype::FixedString { size } => write!(f, "string[{}]", size),
            Hdf5Datatype::Opaque { size } => write!(f, "opaque[{}]", size),
            Hdf5Datatype::VarLenString => write!(f, "vlen string"),
            Hdf5Datatype::Compound { fields } => write!(f, "compound{{{}}}", fields.join(",")),
            Hdf5Datatype::Reference => write!(f, "reference"),
        }
    }
}

/// Storage layout of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetLayout {
    /// One contiguous extent
    Contiguous,
    /// Native chunks of `chunk_elements` elements, stored in order
    Chunked {
        /// Elements per chunk
        chunk_elements: u64,
    },
}

/// What the catalog knows about a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetInfo {
    /// Element type
    pub datatype: Hdf5Datatype,
    /// Total number of elements
    pub elements: u64,
    /// Storage layout
    pub layout: DatasetLayout,
}

/// Include/exclude glob patterns over dataset paths.
///
/// `*` stays within one group level, `**` crosses levels. An empty include
/// list admits everything; exclusion always wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DatasetFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

const DATASET_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

fn compile(field: &'static str, patterns: &[impl AsRef<str>]) -> CaeResult<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p.as_ref())
                .map_err(|e| CaeError::invalid(field, format!("'{}': {}", p.as_ref(), e)))
        })
        .collect()
}

impl DatasetFilter {
    /// Compiles both pattern lists; a malformed pattern is `InvalidContext`.
    pub fn new(include: &[impl AsRef<str>], exclude: &[impl AsRef<str>]) -> CaeResult<Self> {
        Ok(Self {
            include: compile("include_patterns", include)?,
            exclude: compile("exclude_patterns", exclude)?,
        })
    }

    /// No patterns at all.
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// Whether `dataset` is walked.
    pub fn matches(&self, dataset: &str) -> bool {
        let included = self.include.is_empty()
            || self
                .include
                .iter()
                .any(|p| p.matches_with(dataset, DATASET_MATCH));
        included
            && !self
                .exclude
                .iter()
                .any(|p| p.matches_with(dataset, DATASET_MATCH))
    }

    /// Include patterns as written.
    pub fn include_patterns(&self) -> Vec<String> {
        self.include.iter().map(|p| p.as_str().to_string()).collect()
    }

    /// Exclude patterns as written.
    pub fn exclude_patterns(&self) -> Vec<String> {
        self.exclude.iter().map(|p| p.as_str().to_string()).collect()
    }
}

impl fmt::Display for DatasetFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "include [{}] exclude [{}]",
            self.include_patterns().join(", "),
            self.exclude_patterns().join(", ")
        )
    }
}

/// Boundary to an HDF5 implementation.
pub trait Hdf5Catalog: Send + Sync {
    /// Paths of every dataset in the file, sorted.
    fn list(&self, file: &Path) -> CaeResult<Vec<String>>;

    /// Describes a dataset; `DatasetNotFound` if it does not exist.
    fn describe(&self, file: &Path, dataset: &str) -> CaeResult<DatasetInfo>;

    /// Reads `len` bytes of the dataset's raw storage starting at byte `offset`.
    fn read(&self, file: &Path, dataset: &str, offset: u64, len: usize) -> CaeResult<Vec<u8>>;
}

/// In-memory catalog, populated explicitly.
#[derive(Default)]
pub struct StaticCatalog {
    datasets: DashMap<(PathBuf, String), (DatasetInfo, Arc<Vec<u8>>)>,
}

impl StaticCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a dataset. `data.len()` must equal `elements * element size`
    /// for supported types.
    pub fn insert(
        &self,
        file: impl Into<PathBuf>,
        dataset: &str,
        datatype: Hdf5Datatype,
        layout: DatasetLayout,
        data: Vec<u8>,
    ) {
        let elements = match datatype.element_size() {
            Some(size) => data.len() as u64 / size as u64,
            None => 0,
        };
        let info = DatasetInfo {
            datatype,
            elements,
            layout,
        };
        self.datasets
            .insert((file.into(), dataset.to_string()), (info, Arc::new(data)));
    }

    fn entry(&self, file: &Path, dataset: &str) -> CaeResult<(DatasetInfo, Arc<Vec<u8>>)> {
        self.datasets
            .get(&(file.to_path_buf(), dataset.to_string()))
            .map(|r| r.value().clone())
            .ok_or_else(|| CaeError::DatasetNotFound {
                file: file.display().to_string(),
                dataset: dataset.to_string(),
            })
    }
}

impl Hdf5Catalog for StaticCatalog {
    fn list(&self, file: &Path) -> CaeResult<Vec<String>> {
        let mut names: Vec<String> = self
            .datasets
            .iter()
            .filter(|e| e.key().0 == file)
            .map(|e| e.key().1.clone())
            .collect();
        if names.is_empty() {
            return Err(CaeError::unreachable(
                format!("hdf5::{}", file.display()),
                "file not in catalog",
            ));
        }
        names.sort();
        Ok(names)
    }

    fn describe(&self, file: &Path, dataset: &str) -> CaeResult<DatasetInfo> {
        self.entry(file, dataset).map(|(info, _)| info)
    }

    fn read(&self, file: &Path, dataset: &str, offset: u64, len: usize) -> CaeResult<Vec<u8>> {
        let (_, data) = self.entry(file, dataset)?;
        let start = offset as usize;
        data.get(start..start.saturating_add(len))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                CaeError::unreachable(
                    format!("hdf5::{}:{}", file.display(), dataset),
                    format!("read [{}, +{}) past end of dataset", offset, len),
                )
            })
    }
}

/// Chunk stream over one dataset.
pub struct Hdf5Source {
    catalog: Arc<dyn Hdf5Catalog>,
    file: PathBuf,
    dataset: String,
    element_size: u64,
    layout: DatasetLayout,
    extent: u64,
    pos: u64,
    chunk_size: usize,
}

impl Hdf5Source {
    /// Looks the dataset up and validates its type.
    pub fn open(
        catalog: Arc<dyn Hdf5Catalog>,
        file: &Path,
        dataset: &str,
        chunk_size: usize,
    ) -> CaeResult<Self> {
        let info = catalog.describe(file, dataset)?;
        let element_size = info
            .datatype
            .element_size()
            .ok_or_else(|| CaeError::UnsupportedDatatype {
                dataset: dataset.to_string(),
                datatype: info.datatype.to_string(),
            })? as u64;
        if let DatasetLayout::Chunked { chunk_elements: 0 } = info.layout {
            return Err(CaeError::unreachable(
                format!("hdf5::{}:{}", file.display(), dataset),
                "chunked layout with zero-sized chunks",
            ));
        }
        debug!(
            file = %file.display(),
            dataset,
            datatype = %info.datatype,
            elements = info.elements,
            layout = ?info.layout,
            "opened hdf5 source"
        );
        Ok(Self {
            catalog,
            file: file.to_path_buf(),
            dataset: dataset.to_string(),
            element_size,
            layout: info.layout,
            extent: info.elements * element_size,
            pos: 0,
            chunk_size,
        })
    }

    fn piece_len(&self) -> u64 {
        match self.layout {
            DatasetLayout::Chunked { chunk_elements } => chunk_elements * self.element_size,
            DatasetLayout::Contiguous => {
                let elements = (self.chunk_size as u64 / self.element_size).max(1);
                elements * self.element_size
            }
        }
    }
}

impl ChunkSource for Hdf5Source {
    fn extent(&self) -> u64 {
        self.extent
    }

    fn next_chunk(&mut self) -> CaeResult<Option<RawChunk>> {
        let remaining = self.extent - self.pos;
        if remaining == 0 {
            return Ok(None);
        }
        let len = remaining.min(self.piece_len()) as usize;
        let data = self.catalog.read(&self.file, &self.dataset, self.pos, len)?;
        if data.len() != len {
            return Err(CaeError::unreachable(
                format!("hdf5::{}:{}", self.file.display(), self.dataset),
                format!("short read at {}: {} of {} bytes", self.pos, data.len(), len),
            ));
        }
        let chunk = RawChunk {
            offset: self.pos,
            data,
        };
        self.pos += len as u64;
        Ok(Some(chunk))
    }

    fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size;
    }
}

/// Chunk stream over every selected dataset of one file, back to back.
pub struct Hdf5FileSource {
    file: PathBuf,
    datasets: VecDeque<(String, Hdf5Source)>,
    base: u64,
    extent: u64,
}

impl Hdf5FileSource {
    /// Lists the file, applies `filter` and opens each selected dataset.
    /// Datasets whose element type cannot be streamed are skipped.
    pub fn open(
        catalog: Arc<dyn Hdf5Catalog>,
        file: &Path,
        filter: &DatasetFilter,
        chunk_size: usize,
    ) -> CaeResult<Self> {
        let mut datasets = VecDeque::new();
        for name in catalog.list(file)? {
            if !filter.matches(&name) {
                continue;
            }
            match Hdf5Source::open(catalog.clone(), file, &name, chunk_size) {
                Ok(source) => datasets.push_back((name, source)),
                Err(CaeError::UnsupportedDatatype { dataset, datatype }) => {
                    warn!(file = %file.display(), %dataset, %datatype, "skipping dataset");
                }
                Err(e) => return Err(e),
            }
        }
        if datasets.is_empty() {
            return Err(CaeError::DatasetNotFound {
                file: file.display().to_string(),
                dataset: filter.to_string(),
            });
        }
        let extent = datasets.iter().map(|(_, s)| s.extent()).sum();
        debug!(
            file = %file.display(),
            datasets = datasets.len(),
            extent,
            "opened hdf5 file walk"
        );
        Ok(Self {
            file: file.to_path_buf(),
            datasets,
            base: 0,
            extent,
        })
    }

    /// Datasets still to be streamed, in order.
    pub fn remaining(&self) -> Vec<&str> {
        self.datasets.iter().map(|(name, _)| name.as_str()).collect()
    }
}

impl ChunkSource for Hdf5FileSource {
    fn extent(&self) -> u64 {
        self.extent
    }

    fn next_chunk(&mut self) -> CaeResult<Option<RawChunk>> {
        while let Some((name, source)) = self.datasets.front_mut() {
            if let Some(mut chunk) = source.next_chunk()? {
                chunk.offset += self.base;
                return Ok(Some(chunk));
            }
            self.base += source.extent();
            debug!(file = %self.file.display(), dataset = %name, end = self.base, "dataset done");
            self.datasets.pop_front();
        }
        Ok(None)
    }

    fn set_chunk_size(&mut self, chunk_size: usize) {
        for (_, source) in self.datasets.iter_mut() {
            source.set_chunk_size(chunk_size);
        }
    }
}
