//! Flat-file ingestion, whole file or a byte range.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{ChunkSource, RawChunk};
use crate::error::{CaeError, CaeResult};

/// Sequential reader over `[start, start + extent)` of a file.
pub struct FileSource {
    path: PathBuf,
    file: Option<File>,
    extent: u64,
    pos: u64,
    chunk_size: usize,
}

impl FileSource {
    /// Whole file.
    pub fn open(path: &Path, chunk_size: usize) -> CaeResult<Self> {
        let (file, len) = open_regular(path)?;
        debug!(path = %path.display(), len, chunk_size, "opened binary source");
        Ok(Self::new(path, file, len, chunk_size))
    }

    /// `size` bytes starting at `offset`. Fails with `RangeOutOfBounds` before
    /// reading anything if the range passes the end of the file.
    pub fn open_range(path: &Path, offset: u64, size: u64, chunk_size: usize) -> CaeResult<Self> {
        let (mut file, len) = open_regular(path)?;
        let in_bounds = offset.checked_add(size).is_some_and(|end| end <= len);
        if !in_bounds {
            return Err(CaeError::RangeOutOfBounds {
                src: format!("range::{}[{}:{}]", path.display(), offset, size),
                offset,
                size,
                extent: len,
            });
        }
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| CaeError::unreachable(path.display(), e))?;
        debug!(path = %path.display(), offset, size, chunk_size, "opened range source");
        Ok(Self::new(path, file, size, chunk_size))
    }

    fn new(path: &Path, file: File, extent: u64, chunk_size: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            file: Some(file),
            extent,
            pos: 0,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Whether the file handle is still held.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }
}

fn open_regular(path: &Path) -> CaeResult<(File, u64)> {
    let file = File::open(path).map_err(|e| CaeError::unreachable(path.display(), e))?;
    let meta = file
        .metadata()
        .map_err(|e| CaeError::unreachable(path.display(), e))?;
    if !meta.is_file() {
        return Err(CaeError::unreachable(path.display(), "not a regular file"));
    }
    Ok((file, meta.len()))
}

impl ChunkSource for FileSource {
    fn extent(&self) -> u64 {
        self.extent
    }

    fn next_chunk(&mut self) -> CaeResult<Option<RawChunk>> {
        let remaining = self.extent - self.pos;
        if remaining == 0 {
            self.file = None;
            return Ok(None);
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(None);
        };
        let len = remaining.min(self.chunk_size as u64) as usize;
        let mut data = vec![0u8; len];
        if let Err(e) = file.read_exact(&mut data) {
            self.file = None;
            return Err(CaeError::unreachable(
                self.path.display(),
                format!("read at offset {} failed: {}", self.pos, e),
            ));
        }
        let chunk = RawChunk {
            offset: self.pos,
            data,
        };
        self.pos += len as u64;
        if self.pos == self.extent {
            self.file = None;
        }
        Ok(Some(chunk))
    }

    fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size.max(1);
    }
}
