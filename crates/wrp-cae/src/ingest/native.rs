//! [`Hdf5Catalog`] backed by libhdf5.
//!
//! Numeric datasets are read whole through the library's type conversion and
//! handed out as little-endian bytes; the last dataset read is cached so a
//! chunk walk does not reopen the file per chunk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ::hdf5 as h5;
use h5::types::{FloatSize, IntSize, TypeDescriptor};
use parking_lot::Mutex;
use tracing::debug;

use super::hdf5::{DatasetInfo, DatasetLayout, Hdf5Catalog, Hdf5Datatype};
use crate::error::{CaeError, CaeResult};

type CacheKey = (PathBuf, String);

/// Catalog reading real HDF5 files.
#[derive(Default)]
pub struct NativeCatalog {
    cache: Mutex<Option<(CacheKey, Arc<Vec<u8>>)>>,
}

impl NativeCatalog {
    /// Catalog with an empty read cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn open_file(file: &Path) -> CaeResult<h5::File> {
        h5::File::open(file).map_err(|e| CaeError::unreachable(format!("hdf5::{}", file.display()), e))
    }

    fn open_dataset(file: &Path, dataset: &str) -> CaeResult<h5::Dataset> {
        let handle = Self::open_file(file)?;
        handle.dataset(dataset).map_err(|_| CaeError::DatasetNotFound {
            file: file.display().to_string(),
            dataset: dataset.to_string(),
        })
    }

    fn contents(&self, file: &Path, dataset: &str) -> CaeResult<Arc<Vec<u8>>> {
        let key = (file.to_path_buf(), dataset.to_string());
        if let Some((cached, data)) = self.cache.lock().as_ref() {
            if *cached == key {
                return Ok(data.clone());
            }
        }

        let ds = Self::open_dataset(file, dataset)?;
        let descriptor = descriptor_of(&ds, file, dataset)?;
        let data = Arc::new(
            read_le(&ds, &descriptor)
                .map_err(|e| CaeError::unreachable(format!("hdf5::{}:{}", file.display(), dataset), e))?,
        );
        debug!(file = %file.display(), dataset, bytes = data.len(), "read hdf5 dataset");
        *self.cache.lock() = Some((key, data.clone()));
        Ok(data)
    }
}

fn descriptor_of(ds: &h5::Dataset, file: &Path, dataset: &str) -> CaeResult<TypeDescriptor> {
    ds.dtype()
        .and_then(|t| t.to_descriptor())
        .map_err(|e| CaeError::unreachable(format!("hdf5::{}:{}", file.display(), dataset), e))
}

fn datatype_of(descriptor: &TypeDescriptor, dataset: &str) -> CaeResult<Hdf5Datatype> {
    match descriptor {
        TypeDescriptor::Integer(_) | TypeDescriptor::Unsigned(_) => Ok(Hdf5Datatype::Integer {
            size: descriptor.size(),
        }),
        TypeDescriptor::Float(_) => Ok(Hdf5Datatype::Float {
            size: descriptor.size(),
        }),
        TypeDescriptor::VarLenAscii | TypeDescriptor::VarLenUnicode => Ok(Hdf5Datatype::VarLenString),
        TypeDescriptor::Compound(compound) => Ok(Hdf5Datatype::Compound {
            fields: compound.fields.iter().map(|f| f.name.clone()).collect(),
        }),
        other => Err(CaeError::UnsupportedDatatype {
            dataset: dataset.to_string(),
            datatype: other.to_string(),
        }),
    }
}

macro_rules! le_bytes {
    ($ds:expr, $t:ty) => {
        $ds.read_raw::<$t>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect::<Vec<u8>>()
    };
}

fn read_le(ds: &h5::Dataset, descriptor: &TypeDescriptor) -> h5::Result<Vec<u8>> {
    Ok(match descriptor {
        TypeDescriptor::Integer(IntSize::U1) => le_bytes!(ds, i8),
        TypeDescriptor::Integer(IntSize::U2) => le_bytes!(ds, i16),
        TypeDescriptor::Integer(IntSize::U4) => le_bytes!(ds, i32),
        TypeDescriptor::Integer(IntSize::U8) => le_bytes!(ds, i64),
        TypeDescriptor::Unsigned(IntSize::U1) => le_bytes!(ds, u8),
        TypeDescriptor::Unsigned(IntSize::U2) => le_bytes!(ds, u16),
        TypeDescriptor::Unsigned(IntSize::U4) => le_bytes!(ds, u32),
        TypeDescriptor::Unsigned(IntSize::U8) => le_bytes!(ds, u64),
        TypeDescriptor::Float(FloatSize::U4) => le_bytes!(ds, f32),
        TypeDescriptor::Float(FloatSize::U8) => le_bytes!(ds, f64),
        other => return Err(h5::Error::from(format!("cannot stream {} as bytes", other))),
    })
}

fn walk(group: &h5::Group, out: &mut Vec<String>) -> h5::Result<()> {
    for ds in group.datasets()? {
        out.push(ds.name());
    }
    for child in group.groups()? {
        walk(&child, out)?;
    }
    Ok(())
}

impl Hdf5Catalog for NativeCatalog {
    fn list(&self, file: &Path) -> CaeResult<Vec<String>> {
        let handle = Self::open_file(file)?;
        let mut names = Vec::new();
        walk(&handle, &mut names)
            .map_err(|e| CaeError::unreachable(format!("hdf5::{}", file.display()), e))?;
        names.sort();
        Ok(names)
    }

    fn describe(&self, file: &Path, dataset: &str) -> CaeResult<DatasetInfo> {
        let ds = Self::open_dataset(file, dataset)?;
        let datatype = datatype_of(&descriptor_of(&ds, file, dataset)?, dataset)?;
        let layout = match ds.chunk() {
            Some(dims) if dims.len() == 1 && dims[0] > 0 => DatasetLayout::Chunked {
                chunk_elements: dims[0] as u64,
            },
            _ => DatasetLayout::Contiguous,
        };
        Ok(DatasetInfo {
            datatype,
            elements: ds.size() as u64,
            layout,
        })
    }

    fn read(&self, file: &Path, dataset: &str, offset: u64, len: usize) -> CaeResult<Vec<u8>> {
        let data = self.contents(file, dataset)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::ingest::test_util::drain;
    use crate::ingest::{ChunkSource, DatasetFilter, Hdf5FileSource, Hdf5Source};

    fn sample_file(dir: &Path) -> PathBuf {
        let path = dir.join("run.h5");
        let file = h5::File::create(&path).unwrap();
        let fields = file.create_group("fields").unwrap();
        let temp: Vec<f32> = (0..1000).map(|i| i as f32 * 0.5).collect();
        fields
            .new_dataset::<f32>()
            .shape(1000)
            .chunk(250)
            .create("temp")
            .unwrap()
            .write_raw(&temp)
            .unwrap();
        let ids: Vec<u16> = (0..300).collect();
        fields
            .new_dataset::<u16>()
            .shape(300)
            .create("ids")
            .unwrap()
            .write_raw(&ids)
            .unwrap();
        path
    }

    #[test]
    fn test_native_describe_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_file(dir.path());
        let catalog = Arc::new(NativeCatalog::new());

        assert_eq!(
            catalog.list(&path).unwrap(),
            vec!["/fields/ids".to_string(), "/fields/temp".to_string()]
        );
        let info = catalog.describe(&path, "/fields/temp").unwrap();
        assert_eq!(info.datatype, Hdf5Datatype::Float { size: 4 });
        assert_eq!(info.elements, 1000);
        assert_eq!(info.layout, DatasetLayout::Chunked { chunk_elements: 250 });

        let mut source = Hdf5Source::open(catalog.clone(), &path, "/fields/temp", 4096).unwrap();
        let chunks = drain(&mut source);
        assert_eq!(chunks.len(), 4);
        let bytes: Vec<u8> = chunks.into_iter().flat_map(|c| c.data).collect();
        let expected: Vec<u8> = (0..1000).flat_map(|i| (i as f32 * 0.5).to_le_bytes()).collect();
        assert_eq!(bytes, expected);

        let err = catalog.describe(&path, "/fields/missing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DatasetNotFound);
    }

    #[test]
    fn test_native_file_walk() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_file(dir.path());
        let catalog = Arc::new(NativeCatalog::new());
        let filter = DatasetFilter::new(&["/fields/*"], &["/fields/temp"]).unwrap();
        let source = Hdf5FileSource::open(catalog, &path, &filter, 4096).unwrap();
        assert_eq!(source.remaining(), vec!["/fields/ids"]);
        assert_eq!(source.extent(), 600);

        let missing = NativeCatalog::new().list(&dir.path().join("absent.h5")).unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::SourceUnreachable);
    }
}
