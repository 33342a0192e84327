//! Pools: a set of block devices plus the chunk index describing them.

use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};
use wrp_reduce::compression::{compress, decompress};
use wrp_reduce::{CodecId, CompressionProfile};

use crate::bdev::{create_bdev, Bdev, BdevConfig};
use crate::checksum::{compute, Checksum, ChecksumAlgorithm};
use crate::error::{StorageError, StorageResult};
use crate::index::{ChunkIndex, ChunkLocation, ChunkRecord};
use crate::placement::NodeId;

/// Pool identifier, unique within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolId(pub u64);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool-{}", self.0)
    }
}

/// A chunk ready to be written: payload in its stored form plus the checksum
/// of the raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    /// Codec the payload is stored with
    pub codec: CodecId,
    /// Stored bytes
    pub payload: Vec<u8>,
    /// Length of the raw bytes
    pub raw_len: u64,
    /// Checksum of the raw bytes
    pub checksum: Checksum,
}

/// Compress `raw` with the profile's codec. If the result is not smaller than
/// the input the chunk is stored uncompressed instead.
pub fn encode_chunk(
    raw: &[u8],
    profile: CompressionProfile,
    algorithm: ChecksumAlgorithm,
) -> StorageResult<EncodedChunk> {
    let checksum = compute(algorithm, raw);
    let (codec, payload) = match profile.codec {
        CodecId::None => (CodecId::None, raw.to_vec()),
        codec => {
            let compressed = compress(raw, codec, profile.level)?;
            if compressed.len() < raw.len() {
                (codec, compressed)
            } else {
                trace!(%codec, raw = raw.len(), compressed = compressed.len(), "storing chunk uncompressed");
                (CodecId::None, raw.to_vec())
            }
        }
    };
    Ok(EncodedChunk {
        codec,
        payload,
        raw_len: raw.len() as u64,
        checksum,
    })
}

/// Storage container bound to at most one tag.
pub struct Pool {
    id: PoolId,
    node: NodeId,
    bdevs: RwLock<Vec<Box<dyn Bdev>>>,
    index: Mutex<ChunkIndex>,
    checksum: ChecksumAlgorithm,
    dir: Option<PathBuf>,
    growth: Option<BdevConfig>,
}

impl Pool {
    /// Assembles a pool from its parts.
    pub fn new(
        id: PoolId,
        node: NodeId,
        bdevs: Vec<Box<dyn Bdev>>,
        index: ChunkIndex,
        checksum: ChecksumAlgorithm,
        dir: Option<PathBuf>,
    ) -> Self {
        Self {
            id,
            node,
            bdevs: RwLock::new(bdevs),
            index: Mutex::new(index),
            checksum,
            dir,
            growth: None,
        }
    }

    /// Lets the pool create `bdev-N` devices from `config` once every attached
    /// device is full. File devices are created in the pool directory.
    pub fn with_growth(mut self, config: BdevConfig) -> Self {
        self.growth = Some(config);
        self
    }

    /// Pool identifier.
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Node the pool lives on.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Checksum algorithm applied to new chunks.
    pub fn checksum_algorithm(&self) -> ChecksumAlgorithm {
        self.checksum
    }

    /// Directory holding the pool's files, for file-backed pools.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Adds another device; later appends spill onto it when earlier ones are full.
    pub fn attach_bdev(&self, bdev: Box<dyn Bdev>) {
        let mut bdevs = self.bdevs.write();
        debug!(pool = %self.id, bdev = bdev.label(), "attached bdev");
        bdevs.push(bdev);
    }

    /// Number of attached devices.
    pub fn bdev_count(&self) -> usize {
        self.bdevs.read().len()
    }

    /// Writes `chunk` at logical `offset` and commits its record to the index.
    ///
    /// Devices are tried in order; one that is out of space is skipped. When
    /// all are full a growable pool adds a device. The payload is synced
    /// before the index record is appended.
    pub fn append_chunk(&self, offset: u64, chunk: &EncodedChunk) -> StorageResult<ChunkRecord> {
        let mut index = self.index.lock();
        let expected = index.next_offset();
        if offset != expected {
            return Err(StorageError::OutOfOrder {
                expected,
                actual: offset,
            });
        }

        let (bdev, bdev_offset) = self.write_payload(&chunk.payload)?;
        let record = ChunkRecord {
            offset,
            length: chunk.raw_len,
            codec: chunk.codec,
            compressed_size: chunk.payload.len() as u64,
            checksum: chunk.checksum,
            location: ChunkLocation {
                bdev: bdev as u16,
                offset: bdev_offset,
            },
        };
        index.append(record)?;
        trace!(pool = %self.id, offset, bdev, bdev_offset, "chunk committed");
        Ok(record)
    }

    /// Called with the index lock held, so appends never race each other.
    fn write_payload(&self, payload: &[u8]) -> StorageResult<(usize, u64)> {
        let mut full: Option<StorageError> = None;
        {
            let bdevs = self.bdevs.read();
            for (i, bdev) in bdevs.iter().enumerate() {
                match bdev.append(payload) {
                    Ok(at) => {
                        bdev.sync()?;
                        return Ok((i, at));
                    }
                    Err(e @ StorageError::OutOfSpace { .. }) => full = Some(e),
                    Err(e) => return Err(e),
                }
            }
        }
        let full = full.unwrap_or(StorageError::OutOfSpace {
            bdev: format!("{} (no bdevs)", self.id),
            requested: payload.len() as u64,
        });

        let Some(config) = &self.growth else {
            return Err(full);
        };
        if config
            .capacity_bytes
            .is_some_and(|cap| payload.len() as u64 > cap)
        {
            return Err(full);
        }
        let mut bdevs = self.bdevs.write();
        if config.max_per_pool.is_some_and(|max| bdevs.len() >= max) {
            return Err(full);
        }
        let n = bdevs.len();
        let label = format!("{}/bdev-{}", self.id, n);
        let path = self.dir.as_ref().map(|d| d.join(format!("bdev-{}.dat", n)));
        let bdev = create_bdev(config, &label, path.as_deref())?;
        let at = bdev.append(payload)?;
        bdev.sync()?;
        info!(pool = %self.id, bdev = %label, "pool grew a bdev");
        bdevs.push(bdev);
        Ok((n, at))
    }

    /// Stored payload of a record, as written.
    pub fn read_payload(&self, record: &ChunkRecord) -> StorageResult<Vec<u8>> {
        let bdevs = self.bdevs.read();
        let bdev = bdevs
            .get(record.location.bdev as usize)
            .ok_or_else(|| StorageError::CorruptIndex {
                reason: format!(
                    "{} record at {} names missing bdev {}",
                    self.id, record.offset, record.location.bdev
                ),
            })?;
        bdev.read(record.location.offset, record.compressed_size)
    }

    /// Decoded raw bytes of a record, verified against its checksum.
    pub fn read_chunk(&self, record: &ChunkRecord) -> StorageResult<Vec<u8>> {
        let payload = self.read_payload(record)?;
        let raw = match record.codec {
            CodecId::None => payload,
            codec => decompress(&payload, codec)?,
        };
        let actual = compute(record.checksum.algorithm, &raw);
        if actual.value != record.checksum.value || raw.len() as u64 != record.length {
            return Err(StorageError::ChecksumMismatch {
                pool_id: self.id,
                offset: record.offset,
                expected: record.checksum.value,
                actual: actual.value,
            });
        }
        Ok(raw)
    }

    /// Concatenated raw bytes of every committed chunk.
    pub fn read_all(&self) -> StorageResult<Vec<u8>> {
        let records = self.records();
        let mut out = Vec::with_capacity(records.last().map(|r| r.end()).unwrap_or(0) as usize);
        for record in &records {
            out.extend_from_slice(&self.read_chunk(record)?);
        }
        Ok(out)
    }

    /// Reads back every chunk and checks its checksum. Returns the number of
    /// chunks verified.
    pub fn verify(&self) -> StorageResult<usize> {
        let records = self.records();
        for record in &records {
            self.read_chunk(record)?;
        }
        debug!(pool = %self.id, chunks = records.len(), "pool verified");
        Ok(records.len())
    }

    /// Snapshot of the committed records.
    pub fn records(&self) -> Vec<ChunkRecord> {
        self.index.lock().records().to_vec()
    }

    /// Number of committed chunks.
    pub fn chunk_count(&self) -> usize {
        self.index.lock().len()
    }

    /// Offset the next chunk must start at; equals the logical size.
    pub fn next_offset(&self) -> u64 {
        self.index.lock().next_offset()
    }

    /// Sum of stored payload sizes.
    pub fn stored_bytes(&self) -> u64 {
        self.index.lock().stored_bytes()
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("bdevs", &self.bdev_count())
            .field("chunks", &self.chunk_count())
            .finish()
    }
}
