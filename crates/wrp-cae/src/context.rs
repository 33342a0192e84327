//! Assimilation orchestrator.
//!
//! Each submitted job runs on its own tokio task, bounded by a worker
//! semaphore:
//!
//! ```text
//! Validated → Resolving → Ingesting ⇄ Writing → Completed | Failed
//! ```
//!
//! The source is opened and sampled on a blocking thread before the tag is
//! resolved, so a job with a bad source never creates a pool. After
//! resolution a blocking reader feeds a bounded channel while the job task
//! compresses and appends chunks in order. The tag binding is committed after
//! the first chunk lands; a job that fails before that abandons its pool.
//!
//! A job naming another in `depends_on` waits for it before taking a worker
//! permit, and fails with `DependencyFailed` unless it completed.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use wrp_reduce::{ChunkSizeClass, CodecSpec, CompressionProfile, CompressionSelector, CostModel};
use wrp_storage::{
    encode_chunk, ChunkRecord, LocalRegistry, PoolHandle, PoolRegistry, Resolution, StorageError,
    Tag,
};

use crate::config::{CaeConfig, RuntimeMode};
use crate::descriptor::{AssimilationCtx, JobDescriptor, Source};
use crate::error::{CaeError, CaeResult};
use crate::ingest::{ChunkSource, Hdf5Catalog, IngestorFactory, RawChunk};
use crate::job::{JobFailure, JobHandle, JobId, JobObserver, JobReport, JobState, NoopObserver};

struct Inner {
    config: CaeConfig,
    registry: Arc<dyn PoolRegistry>,
    ingestors: IngestorFactory,
    selector: CompressionSelector,
    workers: Arc<Semaphore>,
    jobs: DashMap<JobId, JobHandle>,
    next_job: AtomicU64,
}

impl Inner {
    fn resolve_timeout(&self) -> Option<Duration> {
        self.config.timeouts.resolve_ms.map(Duration::from_millis)
    }

    fn chunk_io_timeout(&self) -> Option<Duration> {
        self.config.timeouts.chunk_io_ms.map(Duration::from_millis)
    }
}

/// Builder for [`ContextInterface`].
pub struct ContextBuilder {
    config: CaeConfig,
    registry: Option<Arc<dyn PoolRegistry>>,
    catalog: Option<Arc<dyn Hdf5Catalog>>,
    cost_model: Option<Arc<CostModel>>,
}

impl ContextBuilder {
    /// Uses an existing registry instead of building a local one. Required in
    /// client mode.
    pub fn registry(mut self, registry: Arc<dyn PoolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Catalog HDF5 sources are read through. Defaults to the HDF5 library
    /// when built with the `hdf5` feature, else to an empty
    /// [`StaticCatalog`](crate::ingest::StaticCatalog).
    pub fn hdf5_catalog(mut self, catalog: Arc<dyn Hdf5Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Cost model for compression selection. Defaults to
    /// [`CostModel::empirical`].
    pub fn cost_model(mut self, model: Arc<CostModel>) -> Self {
        self.cost_model = Some(model);
        self
    }

    /// Validates the configuration and assembles the engine.
    pub fn build(self) -> CaeResult<ContextInterface> {
        self.config.validate()?;

        let registry: Arc<dyn PoolRegistry> = match (self.registry, self.config.runtime_mode) {
            (Some(registry), _) => registry,
            (None, RuntimeMode::Server) => {
                Arc::new(LocalRegistry::new(self.config.registry_config())?)
            }
            (None, RuntimeMode::Client) => {
                return Err(CaeError::Config(
                    "client mode requires an injected pool registry".into(),
                ))
            }
        };
        let catalog = self.catalog.unwrap_or_else(default_catalog);
        let model = self
            .cost_model
            .unwrap_or_else(|| Arc::new(CostModel::empirical()));

        info!(
            mode = ?self.config.runtime_mode,
            workers = self.config.max_concurrent_jobs,
            pipeline_depth = self.config.pipeline_depth,
            "assimilation engine ready"
        );

        Ok(ContextInterface {
            inner: Arc::new(Inner {
                ingestors: IngestorFactory::new(catalog, registry.clone()),
                selector: CompressionSelector::new(self.config.selector.clone(), model),
                workers: Arc::new(Semaphore::new(self.config.max_concurrent_jobs)),
                jobs: DashMap::new(),
                next_job: AtomicU64::new(1),
                registry,
                config: self.config,
            }),
        })
    }
}

#[cfg(feature = "hdf5")]
fn default_catalog() -> Arc<dyn Hdf5Catalog> {
    Arc::new(crate::ingest::NativeCatalog::new())
}

#[cfg(not(feature = "hdf5"))]
fn default_catalog() -> Arc<dyn Hdf5Catalog> {
    Arc::new(crate::ingest::StaticCatalog::new())
}

/// Entry point for submitting and tracking assimilation jobs.
#[derive(Clone)]
pub struct ContextInterface {
    inner: Arc<Inner>,
}

impl ContextInterface {
    /// Starts a builder.
    pub fn builder(config: CaeConfig) -> ContextBuilder {
        ContextBuilder {
            config,
            registry: None,
            catalog: None,
            cost_model: None,
        }
    }

    /// Engine with default collaborators.
    pub fn new(config: CaeConfig) -> CaeResult<Self> {
        Self::builder(config).build()
    }

    /// Engine configuration.
    pub fn config(&self) -> &CaeConfig {
        &self.inner.config
    }

    /// Registry jobs resolve tags through.
    pub fn registry(&self) -> &Arc<dyn PoolRegistry> {
        &self.inner.registry
    }

    /// Queues a job and returns immediately. Must be called from within a
    /// tokio runtime.
    pub fn submit(&self, ctx: AssimilationCtx) -> JobHandle {
        self.submit_observed(ctx, Arc::new(NoopObserver))
    }

    /// Parses a wire descriptor and submits it.
    pub fn submit_descriptor(&self, descriptor: JobDescriptor) -> CaeResult<JobHandle> {
        let ctx = AssimilationCtx::try_from(descriptor)?;
        Ok(self.submit(ctx))
    }

    /// Like [`submit`](Self::submit), reporting progress to `observer`.
    pub fn submit_observed(&self, ctx: AssimilationCtx, observer: Arc<dyn JobObserver>) -> JobHandle {
        // Looked up now so a later prune cannot hide it.
        let dependency = ctx.depends_on().map(|dep| (dep, self.job(dep)));
        let id = JobId(self.inner.next_job.fetch_add(1, Ordering::Relaxed));
        let (handle, tx) = JobHandle::new(id);
        self.inner.jobs.insert(id, handle.clone());

        let run = JobRun {
            handle: handle.clone(),
            state: Arc::new(tx),
            observer,
            progress: Arc::new(Mutex::new(Progress::default())),
        };
        debug!(job = %id, src = %ctx.source(), dst = %ctx.destination(), "job submitted");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let source = ctx.source().to_string();
            let tag = ctx.destination().clone();
            let job = tokio::spawn(run_job(inner, ctx, dependency, run.clone()));
            if let Err(e) = job.await {
                // The job task panicked or was aborted before publishing a
                // terminal state.
                if !run.state.borrow().is_terminal() {
                    let err = CaeError::Task(e.to_string());
                    warn!(job = %run.handle.id(), error = %err, "job task died");
                    run.publish(JobState::Failed(run.failure(source, tag, &err)));
                }
            }
        });
        handle
    }

    /// Current state of a job.
    pub fn status(&self, handle: &JobHandle) -> JobState {
        handle.state()
    }

    /// Requests cancellation. Takes effect at the next chunk boundary.
    pub fn cancel(&self, handle: &JobHandle) {
        debug!(job = %handle.id(), "cancel requested");
        handle.cancel();
    }

    /// Waits for a job to reach a terminal state.
    pub async fn wait(&self, handle: &JobHandle) -> JobState {
        handle.wait().await
    }

    /// Handle of a job submitted to this engine.
    pub fn job(&self, id: JobId) -> Option<JobHandle> {
        self.inner.jobs.get(&id).map(|h| h.value().clone())
    }

    /// Ids of jobs that have not finished yet.
    pub fn active_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .inner
            .jobs
            .iter()
            .filter(|e| !e.value().state().is_terminal())
            .map(|e| *e.key())
            .collect();
        ids.sort();
        ids
    }

    /// Drops finished jobs from the job table. Returns how many were removed.
    pub fn prune_finished(&self) -> usize {
        let before = self.inner.jobs.len();
        self.inner.jobs.retain(|_, h| !h.state().is_terminal());
        before - self.inner.jobs.len()
    }

    /// Cancels every running job. Returns how many were still active.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for entry in self.inner.jobs.iter() {
            if !entry.value().state().is_terminal() {
                entry.value().cancel();
                cancelled += 1;
            }
        }
        debug!(cancelled, "cancel requested for all jobs");
        cancelled
    }

    /// Replays a tag: decompresses every chunk in offset order.
    pub async fn read_tag(&self, tag: &Tag) -> CaeResult<Vec<u8>> {
        let pool = self.bound_pool(tag)?;
        joined(tokio::task::spawn_blocking(move || -> CaeResult<Vec<u8>> { Ok(pool.read_all()?) }).await)
    }

    /// Reads every chunk of a tag back and checks it against its checksum.
    /// Returns the number of chunks verified.
    pub async fn verify_tag(&self, tag: &Tag) -> CaeResult<usize> {
        let pool = self.bound_pool(tag)?;
        joined(tokio::task::spawn_blocking(move || -> CaeResult<usize> { Ok(pool.verify()?) }).await)
    }

    fn bound_pool(&self, tag: &Tag) -> CaeResult<PoolHandle> {
        self.inner.registry.lookup(tag).ok_or_else(|| {
            CaeError::Storage(StorageError::TagNotFound {
                tag: tag.to_string(),
            })
        })
    }
}

#[derive(Debug, Default)]
struct Progress {
    committed: usize,
    last_end: Option<u64>,
    bytes_ingested: u64,
    bytes_written: u64,
}

#[derive(Clone)]
struct JobRun {
    handle: JobHandle,
    state: Arc<watch::Sender<JobState>>,
    observer: Arc<dyn JobObserver>,
    progress: Arc<Mutex<Progress>>,
}

impl JobRun {
    fn publish(&self, state: JobState) {
        self.observer.on_state(&self.handle, &state);
        self.state.send_replace(state);
    }

    fn committed(&self) -> usize {
        self.progress.lock().committed
    }

    fn token(&self) -> &CancellationToken {
        self.handle.token()
    }

    fn failure(&self, source: String, tag: Tag, err: &CaeError) -> JobFailure {
        let progress = self.progress.lock();
        let retryable = progress.committed == 0
            && match err {
                CaeError::Timeout { stage, .. } => *stage != WRITE_STAGE,
                CaeError::Storage(StorageError::LeaseTimeout { .. }) => true,
                _ => false,
            };
        JobFailure {
            kind: err.kind(),
            message: err.to_string(),
            source,
            tag,
            last_committed_offset: progress.last_end,
            committed_chunks: progress.committed,
            retryable,
        }
    }
}

const READ_STAGE: &str = "read";
const WRITE_STAGE: &str = "write";
const RESOLVE_STAGE: &str = "resolve";

type Dependency = (JobId, Option<JobHandle>);

async fn run_job(inner: Arc<Inner>, ctx: AssimilationCtx, dependency: Option<Dependency>, run: JobRun) {
    let state = match execute(&inner, &ctx, dependency, &run).await {
        Ok(report) => JobState::Completed(report),
        Err(err) => {
            let failure = run.failure(ctx.source().to_string(), ctx.destination().clone(), &err);
            warn!(
                job = %run.handle.id(),
                tag = %ctx.destination(),
                kind = %failure.kind,
                committed = failure.committed_chunks,
                error = %err,
                "job failed"
            );
            JobState::Failed(failure)
        }
    };
    run.publish(state);
}

async fn within<F: Future>(limit: Option<Duration>, stage: &'static str, fut: F) -> CaeResult<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| CaeError::Timeout {
                stage,
                after_ms: limit.as_millis() as u64,
            }),
        None => Ok(fut.await),
    }
}

fn joined<T>(result: Result<CaeResult<T>, JoinError>) -> CaeResult<T> {
    result.map_err(|e| CaeError::Task(e.to_string()))?
}

/// Source opened and sampled, with the profile chosen for it.
struct Prepared {
    source: Box<dyn ChunkSource>,
    sample: Vec<RawChunk>,
    profile: CompressionProfile,
    adaptive: bool,
    fell_back: bool,
}

fn prepare(inner: &Inner, source: &Source, hint: Option<CodecSpec>) -> CaeResult<Prepared> {
    let sample_size = ChunkSizeClass::at_most(inner.config.chunk_size_hint);
    let mut chunks = inner.ingestors.open(source, sample_size.as_bytes())?;

    if let Some(spec) = hint {
        return Ok(Prepared {
            source: chunks,
            sample: Vec::new(),
            profile: CompressionProfile::from_spec(spec, sample_size),
            adaptive: false,
            fell_back: false,
        });
    }

    let mut sample = Vec::new();
    while sample.len() < inner.selector.config().sample_chunks.max(1) {
        match chunks.next_chunk()? {
            Some(chunk) => sample.push(chunk),
            None => break,
        }
    }
    let report = inner
        .selector
        .select(sample.iter().map(|c| c.data.as_slice()));
    chunks.set_chunk_size(report.profile.chunk_size.as_bytes());

    Ok(Prepared {
        source: chunks,
        sample,
        profile: report.profile,
        adaptive: report.adaptive,
        fell_back: report.fell_back,
    })
}

fn spawn_reader(
    mut source: Box<dyn ChunkSource>,
    sample: Vec<RawChunk>,
    depth: usize,
    token: CancellationToken,
) -> mpsc::Receiver<CaeResult<RawChunk>> {
    let (tx, rx) = mpsc::channel(depth);
    tokio::task::spawn_blocking(move || {
        for chunk in sample {
            if tx.blocking_send(Ok(chunk)).is_err() {
                return;
            }
        }
        while !token.is_cancelled() {
            let next = match source.next_chunk() {
                Ok(Some(chunk)) => Ok(chunk),
                Ok(None) => return,
                Err(e) => Err(e),
            };
            let failed = next.is_err();
            if tx.blocking_send(next).is_err() || failed {
                return;
            }
        }
    });
    rx
}

async fn await_dependency(dependency: Dependency, token: &CancellationToken) -> CaeResult<()> {
    let (id, handle) = dependency;
    let handle = handle
        .ok_or_else(|| CaeError::invalid("depends_on", format!("unknown job {}", id)))?;
    debug!(dependency = %id, "waiting for dependency");
    let state = tokio::select! {
        state = handle.wait() => state,
        _ = token.cancelled() => return Err(CaeError::Cancelled),
    };
    match state {
        JobState::Completed(_) => Ok(()),
        other => Err(CaeError::DependencyFailed {
            job: id,
            reason: other
                .failure()
                .map(|f| format!("{}: {}", f.kind, f.message))
                .unwrap_or_else(|| other.to_string()),
        }),
    }
}

#[instrument(skip_all, fields(job = %run.handle.id(), tag = %ctx.destination()))]
async fn execute(
    inner: &Arc<Inner>,
    ctx: &AssimilationCtx,
    dependency: Option<Dependency>,
    run: &JobRun,
) -> CaeResult<JobReport> {
    let token = run.token().clone();
    if let Some(dependency) = dependency {
        await_dependency(dependency, &token).await?;
    }
    let _permit = tokio::select! {
        permit = inner.workers.clone().acquire_owned() => {
            permit.map_err(|e| CaeError::Task(e.to_string()))?
        }
        _ = token.cancelled() => return Err(CaeError::Cancelled),
    };
    if token.is_cancelled() {
        return Err(CaeError::Cancelled);
    }

    let prepared = {
        let io_timeout = inner.chunk_io_timeout();
        let inner = inner.clone();
        let source = ctx.source().clone();
        let hint = ctx.compression_hint();
        let open = tokio::task::spawn_blocking(move || prepare(&inner, &source, hint));
        joined(within(io_timeout, READ_STAGE, open).await?)?
    };
    debug!(
        extent = prepared.source.extent(),
        profile = %prepared.profile,
        adaptive = prepared.adaptive,
        "source opened"
    );

    run.publish(JobState::Resolving);
    let policy = ctx.overwrite().unwrap_or(inner.config.reassimilation);
    let resolve = inner
        .registry
        .resolve(ctx.destination(), ctx.pool_query(), policy);
    let mut resolution = tokio::select! {
        res = within(inner.resolve_timeout(), RESOLVE_STAGE, resolve) => res??,
        _ = token.cancelled() => return Err(CaeError::Cancelled),
    };
    info!(
        pool = %resolution.handle().id(),
        node = %resolution.handle().node(),
        created = resolution.created(),
        base_offset = resolution.base_offset(),
        %policy,
        "destination resolved"
    );

    let profile = prepared.profile;
    let adaptive = prepared.adaptive;
    let fell_back = prepared.fell_back;
    if let Err(err) = write_chunks(inner, run, &mut resolution, prepared).await {
        if resolution.pending_bind() {
            let pool = resolution.handle().id();
            if let Err(e) = inner.registry.abandon(resolution).await {
                warn!(%pool, error = %e, "failed to abandon pending pool");
            }
        }
        return Err(err);
    }

    // Empty sources bind here; everything else bound after its first chunk.
    inner.registry.bind(&mut resolution).await?;

    let pool = resolution.handle().clone();
    if inner.config.verify_after_write {
        let verify = pool.clone();
        let verified =
            joined(tokio::task::spawn_blocking(move || -> CaeResult<usize> { Ok(verify.verify()?) }).await)?;
        debug!(chunks = verified, "read-back verification passed");
    }

    let report = {
        let progress = run.progress.lock();
        let ratio = if progress.bytes_written == 0 {
            1.0
        } else {
            progress.bytes_ingested as f64 / progress.bytes_written as f64
        };
        JobReport {
            tag: ctx.destination().clone(),
            pool,
            bytes_ingested: progress.bytes_ingested,
            bytes_written: progress.bytes_written,
            ratio,
            chunks: progress.committed,
            start_offset: resolution.base_offset(),
            end_offset: progress.last_end.unwrap_or(resolution.base_offset()),
            profile,
            adaptive,
            fell_back,
        }
    };
    info!(
        pool = %report.pool_id(),
        chunks = report.chunks,
        bytes_ingested = report.bytes_ingested,
        bytes_written = report.bytes_written,
        ratio = report.ratio,
        "job completed"
    );
    Ok(report)
}

async fn write_chunks(
    inner: &Arc<Inner>,
    run: &JobRun,
    resolution: &mut Resolution,
    prepared: Prepared,
) -> CaeResult<()> {
    let token = run.token().clone();
    let base = resolution.base_offset();
    let profile = prepared.profile;
    let adaptive = prepared.adaptive;
    let io_timeout = inner.chunk_io_timeout();
    let mut chunks = spawn_reader(
        prepared.source,
        prepared.sample,
        inner.config.pipeline_depth,
        token.clone(),
    );

    loop {
        if token.is_cancelled() {
            return Err(CaeError::Cancelled);
        }
        run.publish(JobState::Ingesting {
            committed_chunks: run.committed(),
        });
        let Some(chunk) = within(io_timeout, READ_STAGE, chunks.recv()).await? else {
            if token.is_cancelled() {
                return Err(CaeError::Cancelled);
            }
            return Ok(());
        };
        let chunk = chunk?;

        run.publish(JobState::Writing {
            committed_chunks: run.committed(),
        });
        let pool = resolution.handle().clone();
        let offset = base + chunk.offset;
        let raw_len = chunk.data.len() as u64;
        let write = {
            let inner = inner.clone();
            tokio::task::spawn_blocking(move || -> CaeResult<ChunkRecord> {
                let profile = if adaptive {
                    inner.selector.profile_for_chunk(&chunk.data, profile.chunk_size)
                } else {
                    profile
                };
                let encoded = encode_chunk(&chunk.data, profile, pool.checksum_algorithm())?;
                Ok(pool.append_chunk(offset, &encoded)?)
            })
        };
        let record = joined(within(io_timeout, WRITE_STAGE, write).await?)?;

        {
            let mut progress = run.progress.lock();
            progress.committed += 1;
            progress.last_end = Some(record.end());
            progress.bytes_ingested += raw_len;
            progress.bytes_written += record.compressed_size;
        }
        debug!(
            offset = record.offset,
            length = record.length,
            stored = record.compressed_size,
            codec = %record.codec,
            "chunk committed"
        );

        if resolution.pending_bind() {
            inner.registry.bind(resolution).await?;
            debug!(pool = %resolution.handle().id(), "tag bound");
        }
        run.observer.on_commit(&run.handle, &record);
    }
}
