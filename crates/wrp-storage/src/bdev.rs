//! Block devices backing a pool.
//!
//! A bdev is append-only from the pool's point of view: chunks are written at
//! the current end and never rewritten in place. Reads are positional.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{StorageError, StorageResult};

/// Kind of backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BdevType {
    /// Regular file on a local filesystem
    File,
    /// Process memory; contents are lost on drop
    #[default]
    Memory,
}

impl std::fmt::Display for BdevType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BdevType::File => write!(f, "file"),
            BdevType::Memory => write!(f, "memory"),
        }
    }
}

/// Append-only block device.
pub trait Bdev: Send + Sync {
    /// Kind of device.
    fn bdev_type(&self) -> BdevType;

    /// Human-readable label used in logs and errors.
    fn label(&self) -> &str;

    /// Append `data` and return the offset it was written at.
    fn append(&self, data: &[u8]) -> StorageResult<u64>;

    /// Read `len` bytes starting at `offset`.
    fn read(&self, offset: u64, len: u64) -> StorageResult<Vec<u8>>;

    /// Make previous appends durable.
    fn sync(&self) -> StorageResult<()>;

    /// Bytes written so far.
    fn used_bytes(&self) -> u64;

    /// Maximum size, or None if unbounded.
    fn capacity_bytes(&self) -> Option<u64>;
}

/// Configuration for the devices a registry attaches to new pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BdevConfig {
    /// Device kind
    pub bdev_type: BdevType,
    /// Per-device capacity limit in bytes (None = unbounded)
    pub capacity_bytes: Option<u64>,
    /// Root directory for file-backed pools
    pub root: Option<PathBuf>,
    /// Devices a pool may grow to when the earlier ones fill up (None = no limit)
    pub max_per_pool: Option<usize>,
}

impl Default for BdevConfig {
    fn default() -> Self {
        Self {
            bdev_type: BdevType::Memory,
            capacity_bytes: None,
            root: None,
            max_per_pool: None,
        }
    }
}

fn check_capacity(
    label: &str,
    used: u64,
    requested: usize,
    capacity: Option<u64>,
) -> StorageResult<()> {
    if let Some(cap) = capacity {
        if used + requested as u64 > cap {
            return Err(StorageError::OutOfSpace {
                bdev: label.to_string(),
                requested: requested as u64,
            });
        }
    }
    Ok(())
}

fn check_bounds(label: &str, offset: u64, len: u64, size: u64) -> StorageResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(StorageError::ReadOutOfBounds {
            bdev: label.to_string(),
            offset,
            len,
            size,
        }),
    }
}

/// In-memory device.
pub struct MemoryBdev {
    label: String,
    data: RwLock<Vec<u8>>,
    capacity: Option<u64>,
}

impl MemoryBdev {
    /// Creates an empty memory device.
    pub fn new(label: impl Into<String>, capacity: Option<u64>) -> Self {
        Self {
            label: label.into(),
            data: RwLock::new(Vec::new()),
            capacity,
        }
    }
}

impl Bdev for MemoryBdev {
    fn bdev_type(&self) -> BdevType {
        BdevType::Memory
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn append(&self, data: &[u8]) -> StorageResult<u64> {
        let mut buf = self.data.write();
        check_capacity(&self.label, buf.len() as u64, data.len(), self.capacity)?;
        let offset = buf.len() as u64;
        buf.extend_from_slice(data);
        trace!(bdev = %self.label, offset, len = data.len(), "memory append");
        Ok(offset)
    }

    fn read(&self, offset: u64, len: u64) -> StorageResult<Vec<u8>> {
        let buf = self.data.read();
        check_bounds(&self.label, offset, len, buf.len() as u64)?;
        let start = offset as usize;
        Ok(buf[start..start + len as usize].to_vec())
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }

    fn used_bytes(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn capacity_bytes(&self) -> Option<u64> {
        self.capacity
    }
}

/// File-backed device.
pub struct FileBdev {
    label: String,
    path: PathBuf,
    file: File,
    len: AtomicU64,
    append_lock: Mutex<()>,
    capacity: Option<u64>,
}

impl FileBdev {
    /// Opens (or creates) the file at `path`. Existing contents are kept and
    /// new appends go after them.
    pub fn open(path: impl AsRef<Path>, capacity: Option<u64>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();
        debug!(path = %path.display(), len, "opened file bdev");
        Ok(Self {
            label: path.display().to_string(),
            path,
            file,
            len: AtomicU64::new(len),
            append_lock: Mutex::new(()),
            capacity,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Bdev for FileBdev {
    fn bdev_type(&self) -> BdevType {
        BdevType::File
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn append(&self, data: &[u8]) -> StorageResult<u64> {
        let _guard = self.append_lock.lock();
        let offset = self.len.load(Ordering::Acquire);
        check_capacity(&self.label, offset, data.len(), self.capacity)?;
        self.file.write_all_at(data, offset)?;
        self.len.store(offset + data.len() as u64, Ordering::Release);
        trace!(bdev = %self.label, offset, len = data.len(), "file append");
        Ok(offset)
    }

    fn read(&self, offset: u64, len: u64) -> StorageResult<Vec<u8>> {
        check_bounds(&self.label, offset, len, self.len.load(Ordering::Acquire))?;
        let mut buf = vec![0u8; len as usize];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    fn sync(&self) -> StorageResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn used_bytes(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    fn capacity_bytes(&self) -> Option<u64> {
        self.capacity
    }
}

/// Creates a device of the configured type. `path` is required for file devices.
pub fn create_bdev(
    config: &BdevConfig,
    label: &str,
    path: Option<&Path>,
) -> StorageResult<Box<dyn Bdev>> {
    match config.bdev_type {
        BdevType::Memory => Ok(Box::new(MemoryBdev::new(label, config.capacity_bytes))),
        BdevType::File => {
            let path = path.ok_or_else(|| StorageError::PoolCreationFailed {
                reason: format!("file bdev '{}' has no path", label),
            })?;
            Ok(Box::new(FileBdev::open(path, config.capacity_bytes)?))
        }
    }
}
