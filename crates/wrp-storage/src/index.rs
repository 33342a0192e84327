//! Per-pool chunk index.
//!
//! The index is the authoritative list of committed chunks for a pool. Records
//! are appended in strictly increasing, contiguous logical offset order. When
//! backed by a file (`index.log`) every append is made durable before it is
//! acknowledged, and replaying the log yields the identical record sequence.
//!
//! On-disk layout:
//!
//! ```text
//! header:  magic u32 LE | version u8 | 3 reserved bytes
//! record:  len u32 LE | crc32 u32 LE | bincode(ChunkRecord)
//! ```
//!
//! A record cut short at the tail (crash mid-append) is dropped on replay and
//! truncated away. A complete record whose CRC does not match is corruption.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use wrp_reduce::CodecId;

use crate::checksum::Checksum;
use crate::error::{StorageError, StorageResult};

/// Magic number at the start of every index log ("WIDX").
pub const INDEX_MAGIC: u32 = 0x5849_4457;
/// Current index log format version.
pub const INDEX_VERSION: u8 = 1;

const HEADER_LEN: usize = 8;
const RECORD_PREFIX_LEN: usize = 8;

/// Physical location of a stored chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkLocation {
    /// Index of the bdev within the pool
    pub bdev: u16,
    /// Byte offset within that bdev
    pub offset: u64,
}

/// One committed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Logical offset of the raw bytes within the tag
    pub offset: u64,
    /// Raw length in bytes
    pub length: u64,
    /// Codec the payload was stored with
    pub codec: CodecId,
    /// Stored payload size
    pub compressed_size: u64,
    /// Checksum of the raw bytes
    pub checksum: Checksum,
    /// Where the payload lives
    pub location: ChunkLocation,
}

impl ChunkRecord {
    /// Exclusive end of the logical range covered by this record.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Encode a record as it appears in the log (prefix included).
pub fn encode_record(record: &ChunkRecord) -> StorageResult<Vec<u8>> {
    let body = bincode::serialize(record).map_err(StorageError::serialization)?;
    let mut out = Vec::with_capacity(RECORD_PREFIX_LEN + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn encode_header() -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&INDEX_MAGIC.to_le_bytes());
    header[4] = INDEX_VERSION;
    header
}

/// Decode a full log image. Returns the records and the byte length of the
/// valid prefix (anything after it is a torn tail).
pub fn decode_log(bytes: &[u8]) -> StorageResult<(Vec<ChunkRecord>, usize)> {
    if bytes.len() < HEADER_LEN {
        return Err(StorageError::CorruptIndex {
            reason: format!("header truncated ({} bytes)", bytes.len()),
        });
    }
    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != INDEX_MAGIC {
        return Err(StorageError::CorruptIndex {
            reason: format!("bad magic {:#x}", magic),
        });
    }
    if bytes[4] != INDEX_VERSION {
        return Err(StorageError::CorruptIndex {
            reason: format!("unsupported version {}", bytes[4]),
        });
    }

    let mut records: Vec<ChunkRecord> = Vec::new();
    let mut pos = HEADER_LEN;
    loop {
        let rest = &bytes[pos..];
        if rest.is_empty() {
            break;
        }
        if rest.len() < RECORD_PREFIX_LEN {
            warn!(offset = pos, "dropping torn index record prefix");
            break;
        }
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let crc = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
        if rest.len() < RECORD_PREFIX_LEN + len {
            warn!(offset = pos, len, "dropping torn index record");
            break;
        }
        let body = &rest[RECORD_PREFIX_LEN..RECORD_PREFIX_LEN + len];
        let actual = crc32fast::hash(body);
        if actual != crc {
            return Err(StorageError::CorruptIndex {
                reason: format!(
                    "record crc mismatch at byte {}: expected {:#x}, actual {:#x}",
                    pos, crc, actual
                ),
            });
        }
        let record: ChunkRecord = bincode::deserialize(body).map_err(|e| {
            StorageError::CorruptIndex {
                reason: format!("undecodable record at byte {}: {}", pos, e),
            }
        })?;
        let expected = records.last().map(ChunkRecord::end).unwrap_or(0);
        if record.offset != expected {
            return Err(StorageError::CorruptIndex {
                reason: format!(
                    "non-contiguous record at byte {}: expected offset {}, found {}",
                    pos, expected, record.offset
                ),
            });
        }
        records.push(record);
        pos += RECORD_PREFIX_LEN + len;
    }
    Ok((records, pos))
}

struct LogWriter {
    file: File,
    path: PathBuf,
}

impl LogWriter {
    fn append(&mut self, bytes: &[u8]) -> StorageResult<()> {
        self.file.write_all(bytes)?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Ordered list of committed chunk records, optionally persisted.
pub struct ChunkIndex {
    records: Vec<ChunkRecord>,
    log: Option<LogWriter>,
}

impl ChunkIndex {
    /// Volatile index for memory pools.
    pub fn in_memory() -> Self {
        Self {
            records: Vec::new(),
            log: None,
        }
    }

    /// Creates a fresh log at `path`, replacing any existing file.
    pub fn create(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&encode_header())?;
        file.sync_all()?;
        debug!(path = %path.display(), "created chunk index");
        Ok(Self {
            records: Vec::new(),
            log: Some(LogWriter { file, path }),
        })
    }

    /// Opens an existing log and replays it. A torn tail is truncated away so
    /// later appends land on a record boundary.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut bytes = Vec::new();
        File::open(&path)?.read_to_end(&mut bytes)?;
        let (records, valid_len) = decode_log(&bytes)?;

        let file = OpenOptions::new().write(true).open(&path)?;
        if valid_len < bytes.len() {
            warn!(
                path = %path.display(),
                dropped = bytes.len() - valid_len,
                "truncating torn index tail"
            );
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }
        drop(file);
        let file = OpenOptions::new().append(true).open(&path)?;

        debug!(path = %path.display(), records = records.len(), "replayed chunk index");
        Ok(Self {
            records,
            log: Some(LogWriter { file, path }),
        })
    }

    /// Opens the log at `path` if present, otherwise creates it.
    pub fn open_or_create(path: impl AsRef<Path>) -> StorageResult<Self> {
        if path.as_ref().exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    /// Appends a record. Its offset must equal [`next_offset`](Self::next_offset).
    pub fn append(&mut self, record: ChunkRecord) -> StorageResult<()> {
        let expected = self.next_offset();
        if record.offset != expected {
            return Err(StorageError::OutOfOrder {
                expected,
                actual: record.offset,
            });
        }
        if let Some(log) = self.log.as_mut() {
            log.append(&encode_record(&record)?)?;
        }
        self.records.push(record);
        Ok(())
    }

    /// Offset the next record must start at.
    pub fn next_offset(&self) -> u64 {
        self.records.last().map(ChunkRecord::end).unwrap_or(0)
    }

    /// All committed records in order.
    pub fn records(&self) -> &[ChunkRecord] {
        &self.records
    }

    /// Record covering logical offset `offset`, if any.
    pub fn find(&self, offset: u64) -> Option<&ChunkRecord> {
        let idx = self.records.partition_point(|r| r.end() <= offset);
        self.records.get(idx).filter(|r| r.offset <= offset)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if no chunk has been committed.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sum of stored payload sizes.
    pub fn stored_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.compressed_size).sum()
    }

    /// Path of the backing log, if persisted.
    pub fn path(&self) -> Option<&Path> {
        self.log.as_ref().map(|l| l.path.as_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{compute, ChecksumAlgorithm};

    fn record(offset: u64, length: u64, bdev_offset: u64) -> ChunkRecord {
        ChunkRecord {
            offset,
            length,
            codec: CodecId::Lz4,
            compressed_size: length / 2,
            checksum: compute(ChecksumAlgorithm::Crc32, &offset.to_le_bytes()),
            location: ChunkLocation {
                bdev: 0,
                offset: bdev_offset,
            },
        }
    }

    #[test]
    fn test_append_enforces_contiguity() {
        let mut index = ChunkIndex::in_memory();
        index.append(record(0, 100, 0)).unwrap();
        index.append(record(100, 50, 50)).unwrap();
        assert_eq!(index.next_offset(), 150);

        let err = index.append(record(200, 10, 75)).unwrap_err();
        assert!(matches!(
            err,
            StorageError::OutOfOrder {
                expected: 150,
                actual: 200
            }
        ));
        assert!(index.append(record(0, 10, 0)).is_err());
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_find() {
        let mut index = ChunkIndex::in_memory();
        index.append(record(0, 100, 0)).unwrap();
        index.append(record(100, 100, 50)).unwrap();
        assert_eq!(index.find(0).map(|r| r.offset), Some(0));
        assert_eq!(index.find(99).map(|r| r.offset), Some(0));
        assert_eq!(index.find(100).map(|r| r.offset), Some(100));
        assert!(index.find(200).is_none());
    }

    #[test]
    fn test_persist_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.log");
        let written: Vec<ChunkRecord> = (0..5).map(|i| record(i * 64, 64, i * 32)).collect();
        {
            let mut index = ChunkIndex::create(&path).unwrap();
            for r in &written {
                index.append(*r).unwrap();
            }
        }
        let mut index = ChunkIndex::open(&path).unwrap();
        assert_eq!(index.records(), written.as_slice());
        index.append(record(320, 10, 160)).unwrap();
        drop(index);
        let index = ChunkIndex::open(&path).unwrap();
        assert_eq!(index.len(), 6);
        assert_eq!(index.stored_bytes(), 5 * 32 + 5);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.log");
        {
            let mut index = ChunkIndex::create(&path).unwrap();
            index.append(record(0, 64, 0)).unwrap();
            index.append(record(64, 64, 32)).unwrap();
        }
        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 3]).unwrap();

        let mut index = ChunkIndex::open(&path).unwrap();
        assert_eq!(index.len(), 1);
        index.append(record(64, 64, 32)).unwrap();
        drop(index);
        assert_eq!(ChunkIndex::open(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_crc_mismatch_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.log");
        {
            let mut index = ChunkIndex::create(&path).unwrap();
            index.append(record(0, 64, 0)).unwrap();
            index.append(record(64, 64, 32)).unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_LEN + RECORD_PREFIX_LEN + 2] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            ChunkIndex::open(&path),
            Err(StorageError::CorruptIndex { .. })
        ));
    }

    #[test]
    fn test_bad_header() {
        assert!(matches!(
            decode_log(&[0u8; 4]),
            Err(StorageError::CorruptIndex { .. })
        ));
        let mut header = encode_header();
        header[0] = 0;
        assert!(decode_log(&header).is_err());
        let mut header = encode_header();
        header[4] = 99;
        assert!(decode_log(&header).is_err());
        let (records, len) = decode_log(&encode_header()).unwrap();
        assert!(records.is_empty());
        assert_eq!(len, HEADER_LEN);
    }

    #[test]
    fn test_open_or_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.log");
        let mut index = ChunkIndex::open_or_create(&path).unwrap();
        index.append(record(0, 8, 0)).unwrap();
        drop(index);
        let index = ChunkIndex::open_or_create(&path).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.path(), Some(path.as_path()));
    }
}
