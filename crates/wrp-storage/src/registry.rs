//! Tag registry and pool resolver.
//!
//! The registry owns every pool and the tag → pool bindings. Resolution takes
//! a per-tag lease so at most one job creates or writes a tag at a time, while
//! different tags proceed independently. A tag is bound to a freshly created
//! pool only once the first chunk has been committed (or the job completes
//! with no data); a job that fails before that abandons the pool.
//!
//! File-backed pools record their tag in a `TAG` file together with a bind
//! generation. A replace writes the new pool's `TAG` before removing the old
//! pool, so a crash in between leaves two claims; recovery keeps the one with
//! the higher generation.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::bdev::{create_bdev, Bdev, BdevConfig, BdevType, FileBdev};
use crate::checksum::ChecksumAlgorithm;
use crate::error::{StorageError, StorageResult};
use crate::index::ChunkIndex;
use crate::placement::{NodeId, NodeLoad, PlacementKind, PlacementPolicy};
use crate::pool::{Pool, PoolId};
use crate::tag::Tag;

const INDEX_FILE: &str = "index.log";
const TAG_FILE: &str = "TAG";

/// How the destination pool is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PoolQuery {
    /// Reuse the tag's pool or create one through the placement policy
    #[default]
    Dynamic,
    /// Use exactly this pool
    Static(PoolId),
}

/// What to do when the destination tag is already bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Reassimilation {
    /// Fail with a tag conflict
    #[default]
    Reject,
    /// Add chunks after the existing ones
    Append,
    /// Write into a new pool and drop the old one once the first chunk lands
    Replace,
}

impl fmt::Display for Reassimilation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reassimilation::Reject => write!(f, "reject"),
            Reassimilation::Append => write!(f, "append"),
            Reassimilation::Replace => write!(f, "replace"),
        }
    }
}

impl FromStr for Reassimilation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reject" => Ok(Reassimilation::Reject),
            "append" => Ok(Reassimilation::Append),
            "replace" => Ok(Reassimilation::Replace),
            other => Err(format!("unknown overwrite policy '{}'", other)),
        }
    }
}

/// Shared handle to a pool owned by a registry.
#[derive(Clone)]
pub struct PoolHandle(Arc<Pool>);

impl PoolHandle {
    /// Wraps a pool.
    pub fn new(pool: Pool) -> Self {
        Self(Arc::new(pool))
    }

    /// True if both handles refer to the same pool instance.
    pub fn same_pool(&self, other: &PoolHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::ops::Deref for PoolHandle {
    type Target = Pool;

    fn deref(&self) -> &Pool {
        &self.0
    }
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolHandle({})", self.0.id())
    }
}

type TagLocks = Arc<DashMap<Tag, Arc<Mutex<()>>>>;

/// Exclusive right to create or write a tag. Released on drop.
pub struct TagLease {
    tag: Tag,
    guard: Option<OwnedMutexGuard<()>>,
    locks: TagLocks,
}

impl TagLease {
    /// The leased tag.
    pub fn tag(&self) -> &Tag {
        &self.tag
    }
}

impl Drop for TagLease {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: nobody holds or waits for the tag.
        self.locks
            .remove_if(&self.tag, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl fmt::Debug for TagLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TagLease({})", self.tag)
    }
}

/// Result of resolving a tag for a job. Holds the tag lease for as long as
/// it lives.
#[derive(Debug)]
pub struct Resolution {
    handle: PoolHandle,
    lease: TagLease,
    pending_bind: bool,
    created: bool,
    replaces: Option<PoolId>,
    base_offset: u64,
}

impl Resolution {
    /// Pool the job writes into.
    pub fn handle(&self) -> &PoolHandle {
        &self.handle
    }

    /// Destination tag.
    pub fn tag(&self) -> &Tag {
        self.lease.tag()
    }

    /// The tag → pool binding still has to be committed.
    pub fn pending_bind(&self) -> bool {
        self.pending_bind
    }

    /// The pool was created by this resolution.
    pub fn created(&self) -> bool {
        self.created
    }

    /// Pool that binding will drop (replace policy).
    pub fn replaces(&self) -> Option<PoolId> {
        self.replaces
    }

    /// Logical offset the job's first chunk is written at.
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }
}

/// Registry of pools and tag bindings.
#[async_trait]
pub trait PoolRegistry: Send + Sync {
    /// Acquires the tag lease and selects the destination pool.
    async fn resolve(
        &self,
        tag: &Tag,
        query: PoolQuery,
        policy: Reassimilation,
    ) -> StorageResult<Resolution>;

    /// Commits the tag → pool binding of a resolution. No-op if already bound.
    async fn bind(&self, resolution: &mut Resolution) -> StorageResult<()>;

    /// Gives up a resolution whose binding was never committed, removing a
    /// pool it created.
    async fn abandon(&self, resolution: Resolution) -> StorageResult<()>;

    /// Pool bound to the tag.
    fn lookup(&self, tag: &Tag) -> Option<PoolHandle>;

    /// Pool by id, bound or not.
    fn pool(&self, id: PoolId) -> Option<PoolHandle>;

    /// Creates an unbound pool through the placement policy.
    async fn create_pool(&self) -> StorageResult<PoolHandle>;

    /// Unbinds the tag and removes its pool.
    async fn destroy(&self, tag: &Tag) -> StorageResult<PoolId>;

    /// All bindings, sorted by tag.
    fn tags(&self) -> Vec<(Tag, PoolId)>;

    /// Per-node load, sorted by node id.
    fn node_loads(&self) -> Vec<NodeLoad>;
}

/// Configuration for a [`LocalRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Devices attached to new pools
    pub bdev: BdevConfig,
    /// Checksum for new chunks
    pub checksum: ChecksumAlgorithm,
    /// Node placement policy
    pub placement: PlacementKind,
    /// Number of storage nodes
    pub nodes: u32,
    /// Node this process runs on
    pub local_node: u32,
    /// Maximum wait for a contended tag lease (None = wait forever)
    pub lease_timeout_ms: Option<u64>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            bdev: BdevConfig::default(),
            checksum: ChecksumAlgorithm::Crc32,
            placement: PlacementKind::LeastLoaded,
            nodes: 1,
            local_node: 0,
            lease_timeout_ms: None,
        }
    }
}

/// In-process registry. File-backed pools are recovered from the storage
/// root on construction.
pub struct LocalRegistry {
    config: RegistryConfig,
    placement: Box<dyn PlacementPolicy>,
    pools: DashMap<PoolId, PoolHandle>,
    bindings: DashMap<Tag, PoolId>,
    pool_tags: DashMap<PoolId, Tag>,
    tag_locks: TagLocks,
    next_id: AtomicU64,
    generation: AtomicU64,
}

impl LocalRegistry {
    /// Creates a registry. With file devices, existing pools under the
    /// storage root are reopened and their bindings restored.
    pub fn new(config: RegistryConfig) -> StorageResult<Self> {
        if config.nodes == 0 {
            return Err(StorageError::PoolCreationFailed {
                reason: "registry configured with zero nodes".to_string(),
            });
        }
        let placement = config.placement.build(NodeId(config.local_node));
        let registry = Self {
            placement,
            pools: DashMap::new(),
            bindings: DashMap::new(),
            pool_tags: DashMap::new(),
            tag_locks: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            generation: AtomicU64::new(1),
            config,
        };
        if registry.config.bdev.bdev_type == BdevType::File {
            let root = registry.root()?.to_path_buf();
            fs::create_dir_all(&root).map_err(|e| StorageError::PoolCreationFailed {
                reason: format!("cannot create storage root {}: {}", root.display(), e),
            })?;
            registry.recover(&root)?;
        }
        Ok(registry)
    }

    /// In-memory registry with default settings.
    pub fn in_memory() -> Self {
        Self {
            placement: PlacementKind::LeastLoaded.build(NodeId(0)),
            pools: DashMap::new(),
            bindings: DashMap::new(),
            pool_tags: DashMap::new(),
            tag_locks: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            generation: AtomicU64::new(1),
            config: RegistryConfig::default(),
        }
    }

    /// Registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn root(&self) -> StorageResult<&Path> {
        self.config
            .bdev
            .root
            .as_deref()
            .ok_or_else(|| StorageError::PoolCreationFailed {
                reason: "file bdevs need a storage root".to_string(),
            })
    }

    fn pool_dir(root: &Path, node: NodeId, id: PoolId) -> PathBuf {
        root.join(node.to_string()).join(id.to_string())
    }

    async fn acquire(&self, tag: &Tag) -> StorageResult<TagLease> {
        let lock = self
            .tag_locks
            .entry(tag.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = match self.config.lease_timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), lock.lock_owned())
                .await
                .map_err(|_| StorageError::LeaseTimeout {
                    tag: tag.to_string(),
                })?,
            None => lock.lock_owned().await,
        };
        debug!(%tag, "tag lease acquired");
        Ok(TagLease {
            tag: tag.clone(),
            guard: Some(guard),
            locks: self.tag_locks.clone(),
        })
    }

    fn new_pool(&self) -> StorageResult<PoolHandle> {
        let node = self
            .placement
            .place(&self.node_loads())
            .ok_or_else(|| StorageError::PoolCreationFailed {
                reason: "placement policy found no node".to_string(),
            })?;
        let id = PoolId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let creation = |e: StorageError| StorageError::PoolCreationFailed {
            reason: format!("{}: {}", id, e),
        };

        let pool = match self.config.bdev.bdev_type {
            BdevType::Memory => {
                let bdev = create_bdev(&self.config.bdev, &format!("{}/bdev-0", id), None)
                    .map_err(creation)?;
                Pool::new(
                    id,
                    node,
                    vec![bdev],
                    ChunkIndex::in_memory(),
                    self.config.checksum,
                    None,
                )
            }
            BdevType::File => {
                let dir = Self::pool_dir(self.root()?, node, id);
                fs::create_dir_all(&dir).map_err(|e| creation(e.into()))?;
                let bdev = create_bdev(
                    &self.config.bdev,
                    &format!("{}/bdev-0", id),
                    Some(&dir.join("bdev-0.dat")),
                )
                .map_err(creation)?;
                let index = ChunkIndex::create(dir.join(INDEX_FILE)).map_err(creation)?;
                Pool::new(id, node, vec![bdev], index, self.config.checksum, Some(dir))
            }
        };

        let handle = PoolHandle::new(pool.with_growth(self.config.bdev.clone()));
        self.pools.insert(id, handle.clone());
        info!(pool = %id, %node, policy = self.placement.name(), "pool created");
        Ok(handle)
    }

    fn remove_pool(&self, id: PoolId) {
        self.pool_tags.remove(&id);
        if let Some((_, handle)) = self.pools.remove(&id) {
            if let Some(dir) = handle.dir() {
                if let Err(e) = fs::remove_dir_all(dir) {
                    warn!(pool = %id, dir = %dir.display(), error = %e, "failed to remove pool files");
                }
            }
            debug!(pool = %id, "pool removed");
        }
    }

    /// Writes the pool's `TAG` file under a fresh bind generation.
    fn persist_binding(&self, handle: &PoolHandle, tag: &Tag) -> StorageResult<()> {
        if let Some(dir) = handle.dir() {
            let generation = self.generation.fetch_add(1, Ordering::SeqCst);
            let tmp = dir.join(format!("{}.tmp", TAG_FILE));
            fs::write(&tmp, format!("{}\n{}\n", tag, generation))?;
            fs::rename(&tmp, dir.join(TAG_FILE))?;
        }
        Ok(())
    }

    fn recover(&self, root: &Path) -> StorageResult<()> {
        let mut max_id = 0u64;
        let mut max_generation = 0u64;
        let mut claims: HashMap<Tag, (u64, PoolId)> = HashMap::new();
        for node_entry in fs::read_dir(root)? {
            let node_path = node_entry?.path();
            let Some(node) = parse_suffix(&node_path, "node-") else {
                continue;
            };
            for pool_entry in fs::read_dir(&node_path)? {
                let pool_path = pool_entry?.path();
                let Some(raw_id) = parse_suffix(&pool_path, "pool-") else {
                    continue;
                };
                let id = PoolId(raw_id);
                max_id = max_id.max(raw_id);
                match self.reopen_pool(&pool_path, NodeId(node as u32), id) {
                    Ok(Some((tag, generation))) => {
                        max_generation = max_generation.max(generation);
                        self.settle_claim(&mut claims, tag, generation, id);
                    }
                    Ok(None) => {
                        debug!(pool = %id, "removing unbound pool left by an earlier run");
                        if let Err(e) = fs::remove_dir_all(&pool_path) {
                            warn!(pool = %id, error = %e, "failed to remove stale pool");
                        }
                    }
                    Err(e) => warn!(pool = %id, error = %e, "skipping unreadable pool"),
                }
            }
        }
        for (tag, (_, id)) in claims {
            self.bindings.insert(tag.clone(), id);
            self.pool_tags.insert(id, tag);
        }
        self.next_id.store(max_id + 1, Ordering::SeqCst);
        self.generation.store(max_generation + 1, Ordering::SeqCst);
        info!(root = %root.display(), pools = self.pools.len(), tags = self.bindings.len(), "registry recovered");
        Ok(())
    }

    /// Keeps the newest of two pools claiming one tag and removes the other.
    /// Equal generations (files without one) fall back to the higher pool id.
    fn settle_claim(
        &self,
        claims: &mut HashMap<Tag, (u64, PoolId)>,
        tag: Tag,
        generation: u64,
        id: PoolId,
    ) {
        match claims.entry(tag) {
            Entry::Vacant(slot) => {
                slot.insert((generation, id));
            }
            Entry::Occupied(mut slot) => {
                let held = *slot.get();
                let stale = if (generation, id) > held {
                    slot.insert((generation, id));
                    held.1
                } else {
                    id
                };
                warn!(
                    tag = %slot.key(),
                    kept = %slot.get().1,
                    dropped = %stale,
                    "tag claimed by two pools, keeping the newest binding"
                );
                self.remove_pool(stale);
            }
        }
    }

    /// Opens a pool directory. Returns None for a pool that never got a tag.
    fn reopen_pool(&self, dir: &Path, node: NodeId, id: PoolId) -> StorageResult<Option<(Tag, u64)>> {
        let tag_path = dir.join(TAG_FILE);
        if !tag_path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&tag_path)?;
        let mut lines = contents.lines();
        let tag = Tag::parse(lines.next().unwrap_or_default().trim())?;
        let generation = lines
            .next()
            .and_then(|g| g.trim().parse().ok())
            .unwrap_or(0);

        let mut bdev_paths: Vec<(u64, PathBuf)> = fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "dat"))
            .filter_map(|p| {
                let stem = p.file_stem()?.to_str()?;
                let n = stem.strip_prefix("bdev-")?.parse().ok()?;
                Some((n, p))
            })
            .collect();
        bdev_paths.sort();
        let mut bdevs: Vec<Box<dyn Bdev>> = Vec::with_capacity(bdev_paths.len());
        for (_, path) in &bdev_paths {
            bdevs.push(Box::new(FileBdev::open(path, self.config.bdev.capacity_bytes)?));
        }
        let index = ChunkIndex::open(dir.join(INDEX_FILE))?;
        let pool = Pool::new(
            id,
            node,
            bdevs,
            index,
            self.config.checksum,
            Some(dir.to_path_buf()),
        )
        .with_growth(self.config.bdev.clone());
        self.pools.insert(id, PoolHandle::new(pool));
        Ok(Some((tag, generation)))
    }

    fn existing_binding(&self, tag: &Tag) -> Option<PoolId> {
        self.bindings.get(tag).map(|r| *r.value())
    }

    fn handle_of(&self, id: PoolId) -> StorageResult<PoolHandle> {
        self.pools
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(StorageError::PoolNotFound { pool_id: id })
    }
}

fn parse_suffix(path: &Path, prefix: &str) -> Option<u64> {
    if !path.is_dir() {
        return None;
    }
    path.file_name()?.to_str()?.strip_prefix(prefix)?.parse().ok()
}

fn conflict(tag: &Tag, reason: String) -> StorageError {
    StorageError::TagConflict {
        tag: tag.to_string(),
        reason,
    }
}

#[async_trait]
impl PoolRegistry for LocalRegistry {
    async fn resolve(
        &self,
        tag: &Tag,
        query: PoolQuery,
        policy: Reassimilation,
    ) -> StorageResult<Resolution> {
        let lease = self.acquire(tag).await?;
        let bound = self.existing_binding(tag);

        let (handle, pending_bind, created, replaces) = match query {
            PoolQuery::Dynamic => match (bound, policy) {
                (None, _) => (self.new_pool()?, true, true, None),
                (Some(id), Reassimilation::Reject) => {
                    return Err(conflict(
                        tag,
                        format!("already bound to {} and overwrite policy is reject", id),
                    ))
                }
                (Some(id), Reassimilation::Append) => (self.handle_of(id)?, false, false, None),
                (Some(id), Reassimilation::Replace) => (self.new_pool()?, true, true, Some(id)),
            },
            PoolQuery::Static(id) => {
                let handle = self.handle_of(id)?;
                let owner = self.pool_tags.get(&id).map(|r| r.value().clone());
                match (owner, bound, policy) {
                    (Some(owner), _, _) if &owner != tag => {
                        return Err(conflict(tag, format!("{} is bound to '{}'", id, owner)))
                    }
                    (Some(_), _, Reassimilation::Append) => (handle, false, false, None),
                    (Some(_), _, p) => {
                        return Err(conflict(
                            tag,
                            format!("already bound to static {} and overwrite policy is {}", id, p),
                        ))
                    }
                    (None, None, _) => (handle, true, false, None),
                    (None, Some(old), Reassimilation::Replace) => (handle, true, false, Some(old)),
                    (None, Some(old), p) => {
                        return Err(conflict(
                            tag,
                            format!("already bound to {} and overwrite policy is {}", old, p),
                        ))
                    }
                }
            }
        };

        let base_offset = handle.next_offset();
        debug!(%tag, pool = %handle.id(), created, pending_bind, base_offset, "tag resolved");
        Ok(Resolution {
            handle,
            lease,
            pending_bind,
            created,
            replaces,
            base_offset,
        })
    }

    async fn bind(&self, resolution: &mut Resolution) -> StorageResult<()> {
        if !resolution.pending_bind {
            return Ok(());
        }
        let tag = resolution.tag().clone();
        let id = resolution.handle.id();
        self.persist_binding(&resolution.handle, &tag)?;
        self.bindings.insert(tag.clone(), id);
        self.pool_tags.insert(id, tag.clone());
        if let Some(old) = resolution.replaces.take() {
            self.remove_pool(old);
            info!(%tag, pool = %id, replaced = %old, "tag rebound");
        } else {
            info!(%tag, pool = %id, "tag bound");
        }
        resolution.pending_bind = false;
        Ok(())
    }

    async fn abandon(&self, resolution: Resolution) -> StorageResult<()> {
        if resolution.pending_bind && resolution.created {
            let id = resolution.handle.id();
            self.remove_pool(id);
            info!(tag = %resolution.tag(), pool = %id, "abandoned unbound pool");
        }
        Ok(())
    }

    fn lookup(&self, tag: &Tag) -> Option<PoolHandle> {
        let id = self.existing_binding(tag)?;
        self.pools.get(&id).map(|r| r.value().clone())
    }

    fn pool(&self, id: PoolId) -> Option<PoolHandle> {
        self.pools.get(&id).map(|r| r.value().clone())
    }

    async fn create_pool(&self) -> StorageResult<PoolHandle> {
        self.new_pool()
    }

    async fn destroy(&self, tag: &Tag) -> StorageResult<PoolId> {
        let _lease = self.acquire(tag).await?;
        let (_, id) = self
            .bindings
            .remove(tag)
            .ok_or_else(|| StorageError::TagNotFound {
                tag: tag.to_string(),
            })?;
        self.remove_pool(id);
        info!(%tag, pool = %id, "tag destroyed");
        Ok(id)
    }

    fn tags(&self) -> Vec<(Tag, PoolId)> {
        let mut tags: Vec<(Tag, PoolId)> = self
            .bindings
            .iter()
            .map(|r| (r.key().clone(), *r.value()))
            .collect();
        tags.sort();
        tags
    }

    fn node_loads(&self) -> Vec<NodeLoad> {
        let mut loads: Vec<NodeLoad> = (0..self.config.nodes)
            .map(|n| NodeLoad {
                node: NodeId(n),
                pools: 0,
                stored_bytes: 0,
            })
            .collect();
        for entry in self.pools.iter() {
            let pool = entry.value();
            if let Some(load) = loads.iter_mut().find(|l| l.node == pool.node()) {
                load.pools += 1;
                load.stored_bytes += pool.stored_bytes();
            }
        }
        loads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::encode_chunk;
    use wrp_reduce::{ChunkSizeClass, CompressionProfile};

    fn tag(s: &str) -> Tag {
        Tag::parse(s).unwrap()
    }

    fn write(handle: &PoolHandle, offset: u64, data: &[u8]) {
        let profile = CompressionProfile::no_compression(ChunkSizeClass::Small);
        let chunk = encode_chunk(data, profile, handle.checksum_algorithm()).unwrap();
        handle.append_chunk(offset, &chunk).unwrap();
    }

    #[tokio::test]
    async fn test_dynamic_creates_pending_pool() {
        let registry = LocalRegistry::in_memory();
        let t = tag("ns::a");
        let mut res = registry
            .resolve(&t, PoolQuery::Dynamic, Reassimilation::Reject)
            .await
            .unwrap();
        assert!(res.created());
        assert!(res.pending_bind());
        assert!(registry.lookup(&t).is_none());

        write(res.handle(), 0, b"hello");
        registry.bind(&mut res).await.unwrap();
        assert!(!res.pending_bind());
        let bound = registry.lookup(&t).unwrap();
        assert!(bound.same_pool(res.handle()));
        assert_eq!(registry.tags(), vec![(t, res.handle().id())]);
    }

    #[tokio::test]
    async fn test_reject_policy_conflicts() {
        let registry = LocalRegistry::in_memory();
        let t = tag("ns::a");
        let mut res = registry
            .resolve(&t, PoolQuery::Dynamic, Reassimilation::Reject)
            .await
            .unwrap();
        registry.bind(&mut res).await.unwrap();
        drop(res);

        let before = registry.tags();
        let err = registry
            .resolve(&t, PoolQuery::Dynamic, Reassimilation::Reject)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::TagConflict { .. }));
        assert_eq!(registry.tags(), before);
    }

    #[tokio::test]
    async fn test_append_reuses_pool() {
        let registry = LocalRegistry::in_memory();
        let t = tag("ns::a");
        let mut res = registry
            .resolve(&t, PoolQuery::Dynamic, Reassimilation::Reject)
            .await
            .unwrap();
        write(res.handle(), 0, b"abcd");
        registry.bind(&mut res).await.unwrap();
        let first = res.handle().clone();
        drop(res);

        let res = registry
            .resolve(&t, PoolQuery::Dynamic, Reassimilation::Append)
            .await
            .unwrap();
        assert!(res.handle().same_pool(&first));
        assert!(!res.pending_bind());
        assert_eq!(res.base_offset(), 4);
    }

    #[tokio::test]
    async fn test_replace_drops_old_pool_on_bind() {
        let registry = LocalRegistry::in_memory();
        let t = tag("ns::a");
        let mut res = registry
            .resolve(&t, PoolQuery::Dynamic, Reassimilation::Reject)
            .await
            .unwrap();
        write(res.handle(), 0, b"old");
        registry.bind(&mut res).await.unwrap();
        let old = res.handle().id();
        drop(res);

        let mut res = registry
            .resolve(&t, PoolQuery::Dynamic, Reassimilation::Replace)
            .await
            .unwrap();
        assert_eq!(res.replaces(), Some(old));
        assert_eq!(registry.lookup(&t).unwrap().id(), old);
        write(res.handle(), 0, b"new");
        registry.bind(&mut res).await.unwrap();
        assert!(registry.pool(old).is_none());
        assert_eq!(registry.lookup(&t).unwrap().read_all().unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_abandon_removes_created_pool() {
        let registry = LocalRegistry::in_memory();
        let t = tag("ns::a");
        let res = registry
            .resolve(&t, PoolQuery::Dynamic, Reassimilation::Reject)
            .await
            .unwrap();
        let id = res.handle().id();
        registry.abandon(res).await.unwrap();
        assert!(registry.pool(id).is_none());
        assert!(registry.lookup(&t).is_none());
        assert!(registry.tags().is_empty());
    }

    #[tokio::test]
    async fn test_static_pool_rules() {
        let registry = LocalRegistry::in_memory();
        let missing = registry
            .resolve(&tag("ns::a"), PoolQuery::Static(PoolId(99)), Reassimilation::Reject)
            .await
            .unwrap_err();
        assert!(matches!(missing, StorageError::PoolNotFound { pool_id: PoolId(99) }));

        let pool = registry.create_pool().await.unwrap();
        let mut res = registry
            .resolve(&tag("ns::a"), PoolQuery::Static(pool.id()), Reassimilation::Reject)
            .await
            .unwrap();
        assert!(res.handle().same_pool(&pool));
        assert!(!res.created());
        registry.bind(&mut res).await.unwrap();
        drop(res);

        let other = registry
            .resolve(&tag("ns::b"), PoolQuery::Static(pool.id()), Reassimilation::Append)
            .await
            .unwrap_err();
        assert!(matches!(other, StorageError::TagConflict { .. }));

        let again = registry
            .resolve(&tag("ns::a"), PoolQuery::Static(pool.id()), Reassimilation::Append)
            .await
            .unwrap();
        assert!(again.handle().same_pool(&pool));
    }

    #[tokio::test]
    async fn test_abandon_static_keeps_pool() {
        let registry = LocalRegistry::in_memory();
        let pool = registry.create_pool().await.unwrap();
        let res = registry
            .resolve(&tag("ns::a"), PoolQuery::Static(pool.id()), Reassimilation::Reject)
            .await
            .unwrap();
        registry.abandon(res).await.unwrap();
        assert!(registry.pool(pool.id()).is_some());
    }

    #[tokio::test]
    async fn test_lease_serializes_same_tag() {
        let registry = LocalRegistry::new(RegistryConfig {
            lease_timeout_ms: Some(50),
            ..Default::default()
        })
        .unwrap();
        let t = tag("ns::a");
        let held = registry
            .resolve(&t, PoolQuery::Dynamic, Reassimilation::Reject)
            .await
            .unwrap();
        let err = registry
            .resolve(&t, PoolQuery::Dynamic, Reassimilation::Reject)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::LeaseTimeout { .. }));

        let other = registry
            .resolve(&tag("ns::b"), PoolQuery::Dynamic, Reassimilation::Reject)
            .await;
        assert!(other.is_ok());
        registry.abandon(held).await.unwrap();
        assert!(registry
            .resolve(&t, PoolQuery::Dynamic, Reassimilation::Reject)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_destroy() {
        let registry = LocalRegistry::in_memory();
        let t = tag("ns::a");
        let mut res = registry
            .resolve(&t, PoolQuery::Dynamic, Reassimilation::Reject)
            .await
            .unwrap();
        registry.bind(&mut res).await.unwrap();
        let id = res.handle().id();
        drop(res);
        assert_eq!(registry.destroy(&t).await.unwrap(), id);
        assert!(registry.pool(id).is_none());
        assert!(matches!(
            registry.destroy(&t).await,
            Err(StorageError::TagNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_placement_spreads_pools() {
        let registry = LocalRegistry::new(RegistryConfig {
            nodes: 3,
            placement: PlacementKind::RoundRobin,
            ..Default::default()
        })
        .unwrap();
        let mut nodes = Vec::new();
        for _ in 0..3 {
            nodes.push(registry.create_pool().await.unwrap().node());
        }
        assert_eq!(nodes, vec![NodeId(0), NodeId(1), NodeId(2)]);
        assert!(registry.node_loads().iter().all(|l| l.pools == 1));
    }

    #[test]
    fn test_zero_nodes_rejected() {
        let result = LocalRegistry::new(RegistryConfig {
            nodes: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(StorageError::PoolCreationFailed { .. })));
    }

    fn file_config(root: &Path, capacity: Option<u64>) -> RegistryConfig {
        RegistryConfig {
            bdev: BdevConfig {
                bdev_type: BdevType::File,
                capacity_bytes: capacity,
                root: Some(root.to_path_buf()),
                max_per_pool: None,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_file_registry_recovers_bindings() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(dir.path(), None);
        let t = tag("sim::field");
        let id;
        {
            let registry = LocalRegistry::new(config.clone()).unwrap();
            let mut res = registry
                .resolve(&t, PoolQuery::Dynamic, Reassimilation::Reject)
                .await
                .unwrap();
            write(res.handle(), 0, b"persisted");
            registry.bind(&mut res).await.unwrap();
            id = res.handle().id();

            // Never bound: dropped on recovery.
            let _stray = registry.create_pool().await.unwrap();
        }

        let registry = LocalRegistry::new(config).unwrap();
        let handle = registry.lookup(&t).unwrap();
        assert_eq!(handle.id(), id);
        assert_eq!(handle.read_all().unwrap(), b"persisted");
        assert_eq!(registry.tags().len(), 1);
        let next = registry.create_pool().await.unwrap();
        assert!(next.id() > id);
    }

    #[tokio::test]
    async fn test_interrupted_replace_keeps_newest_binding() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(dir.path(), None);
        let t = tag("ns::a");
        let (old, new);
        {
            let registry = LocalRegistry::new(config.clone()).unwrap();
            let mut res = registry
                .resolve(&t, PoolQuery::Dynamic, Reassimilation::Reject)
                .await
                .unwrap();
            write(res.handle(), 0, b"old");
            registry.bind(&mut res).await.unwrap();
            old = res.handle().id();
            drop(res);

            let res = registry
                .resolve(&t, PoolQuery::Dynamic, Reassimilation::Replace)
                .await
                .unwrap();
            write(res.handle(), 0, b"new");
            // New TAG on disk, process gone before the old pool is removed.
            registry.persist_binding(res.handle(), &t).unwrap();
            new = res.handle().id();
        }
        assert!(LocalRegistry::pool_dir(dir.path(), NodeId(0), old).exists());

        let registry = LocalRegistry::new(config).unwrap();
        assert_eq!(registry.tags(), vec![(t.clone(), new)]);
        assert_eq!(registry.lookup(&t).unwrap().read_all().unwrap(), b"new");
        assert!(registry.pool(old).is_none());
        assert!(!LocalRegistry::pool_dir(dir.path(), NodeId(0), old).exists());
        let err = registry
            .resolve(&t, PoolQuery::Static(old), Reassimilation::Append)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PoolNotFound { .. }));
    }

    #[tokio::test]
    async fn test_interrupted_static_replace_outranks_newer_pool_id() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(dir.path(), None);
        let t = tag("ns::a");
        let (target, bound);
        {
            let registry = LocalRegistry::new(config.clone()).unwrap();
            let spare = registry.create_pool().await.unwrap();
            target = spare.id();
            let mut res = registry
                .resolve(&t, PoolQuery::Dynamic, Reassimilation::Reject)
                .await
                .unwrap();
            write(res.handle(), 0, b"first");
            registry.bind(&mut res).await.unwrap();
            bound = res.handle().id();
            drop(res);
            assert!(target < bound);

            let res = registry
                .resolve(&t, PoolQuery::Static(target), Reassimilation::Replace)
                .await
                .unwrap();
            write(res.handle(), 0, b"second");
            registry.persist_binding(res.handle(), &t).unwrap();
        }

        let registry = LocalRegistry::new(config).unwrap();
        assert_eq!(registry.lookup(&t).unwrap().id(), target);
        assert!(registry.pool(bound).is_none());
        assert_eq!(registry.lookup(&t).unwrap().read_all().unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_tag_locks_pruned_when_released() {
        let registry = LocalRegistry::in_memory();
        let t = tag("ns::a");

        let res = registry
            .resolve(&t, PoolQuery::Dynamic, Reassimilation::Reject)
            .await
            .unwrap();
        assert_eq!(registry.tag_locks.len(), 1);
        registry.abandon(res).await.unwrap();
        assert!(registry.tag_locks.is_empty());

        let mut res = registry
            .resolve(&t, PoolQuery::Dynamic, Reassimilation::Reject)
            .await
            .unwrap();
        registry.bind(&mut res).await.unwrap();
        drop(res);
        let err = registry
            .resolve(&t, PoolQuery::Dynamic, Reassimilation::Reject)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::TagConflict { .. }));
        assert!(registry.tag_locks.is_empty());

        registry.destroy(&t).await.unwrap();
        assert!(registry.tag_locks.is_empty());
    }

    #[tokio::test]
    async fn test_tag_lock_kept_while_contended() {
        let registry = Arc::new(LocalRegistry::in_memory());
        let t = tag("ns::a");
        let held = registry
            .resolve(&t, PoolQuery::Dynamic, Reassimilation::Reject)
            .await
            .unwrap();

        let waiter = {
            let registry = registry.clone();
            let t = t.clone();
            tokio::spawn(async move {
                registry
                    .resolve(&t, PoolQuery::Dynamic, Reassimilation::Reject)
                    .await
                    .map(|res| res.handle().id())
            })
        };
        tokio::task::yield_now().await;
        registry.abandon(held).await.unwrap();
        assert_eq!(registry.tag_locks.len(), 1);
        assert!(waiter.await.unwrap().is_ok());
        assert!(registry.tag_locks.is_empty());
    }

    #[tokio::test]
    async fn test_file_pool_grows_and_recovers_bdevs() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(dir.path(), Some(16));
        let t = tag("ns::grown");
        let data: Vec<u8> = (0..40u8).collect();
        {
            let registry = LocalRegistry::new(config.clone()).unwrap();
            let mut res = registry
                .resolve(&t, PoolQuery::Dynamic, Reassimilation::Reject)
                .await
                .unwrap();
            for (i, part) in data.chunks(8).enumerate() {
                write(res.handle(), i as u64 * 8, part);
            }
            registry.bind(&mut res).await.unwrap();
            assert_eq!(res.handle().bdev_count(), 3);
            let pool_dir = res.handle().dir().unwrap().to_path_buf();
            assert!(pool_dir.join("bdev-2.dat").exists());
        }

        let registry = LocalRegistry::new(config).unwrap();
        let pool = registry.lookup(&t).unwrap();
        assert_eq!(pool.bdev_count(), 3);
        assert_eq!(pool.read_all().unwrap(), data);
        write(&pool, 40, &[7u8; 16]);
        assert_eq!(pool.bdev_count(), 4);
    }

    #[test]
    fn test_reassimilation_parse() {
        assert_eq!("append".parse::<Reassimilation>(), Ok(Reassimilation::Append));
        assert!("merge".parse::<Reassimilation>().is_err());
        assert_eq!(Reassimilation::default(), Reassimilation::Reject);
    }
}
