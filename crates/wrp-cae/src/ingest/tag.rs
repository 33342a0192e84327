//! Re-ingestion of an existing tag.

use wrp_storage::{ChunkRecord, PoolHandle, PoolRegistry, Tag};

use super::{ChunkSource, RawChunk};
use crate::error::{CaeError, CaeResult};

/// Decoded chunks of a bound tag, one per stored record.
pub struct TagSource {
    handle: PoolHandle,
    records: Vec<ChunkRecord>,
    next: usize,
    base: u64,
    extent: u64,
}

impl TagSource {
    /// Snapshots the tag's chunk index.
    pub fn open(registry: &dyn PoolRegistry, tag: &Tag) -> CaeResult<Self> {
        let handle = registry
            .lookup(tag)
            .ok_or_else(|| CaeError::unreachable(format!("iowarp::{}", tag), "tag is not bound"))?;
        let records = handle.records();
        let base = records.first().map(|r| r.offset).unwrap_or(0);
        let extent = records.last().map(|r| r.end()).unwrap_or(0) - base;
        Ok(Self {
            handle,
            records,
            next: 0,
            base,
            extent,
        })
    }
}

impl ChunkSource for TagSource {
    fn extent(&self) -> u64 {
        self.extent
    }

    fn next_chunk(&mut self) -> CaeResult<Option<RawChunk>> {
        let Some(record) = self.records.get(self.next) else {
            return Ok(None);
        };
        let data = self.handle.read_chunk(record)?;
        self.next += 1;
        Ok(Some(RawChunk {
            offset: record.offset - self.base,
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::ingest::test_util::drain;
    use wrp_reduce::{ChunkSizeClass, CodecId, CompressionProfile};
    use wrp_storage::{encode_chunk, LocalRegistry, PoolQuery, Reassimilation};

    #[tokio::test]
    async fn test_reads_back_decoded_chunks() {
        let registry = LocalRegistry::in_memory();
        let tag = Tag::parse("ns::src").unwrap();
        let mut res = registry
            .resolve(&tag, PoolQuery::Dynamic, Reassimilation::Reject)
            .await
            .unwrap();
        let profile = CompressionProfile::new(CodecId::Zstd, 3, ChunkSizeClass::Small);
        let parts: [&[u8]; 2] = [&[1u8; 500], &[2u8; 300]];
        let mut offset = 0;
        for part in parts {
            let chunk = encode_chunk(part, profile, res.handle().checksum_algorithm()).unwrap();
            offset = res.handle().append_chunk(offset, &chunk).unwrap().end();
        }
        registry.bind(&mut res).await.unwrap();
        drop(res);

        let mut source = TagSource::open(&registry, &tag).unwrap();
        assert_eq!(source.extent(), 800);
        let chunks = drain(&mut source);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].data, vec![2u8; 300]);
    }

    #[test]
    fn test_unbound_tag_unreachable() {
        let registry = LocalRegistry::in_memory();
        let err = TagSource::open(&registry, &Tag::parse("ns::missing").unwrap())
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::SourceUnreachable);
    }
}
