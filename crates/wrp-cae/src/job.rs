//! Job identity, state and handles.

use std::fmt;
use std::str::FromStr;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use wrp_reduce::CompressionProfile;
use wrp_storage::{ChunkRecord, PoolHandle, PoolId, Tag};

use crate::error::ErrorKind;

/// Job identifier, unique per engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = String;

    /// Accepts `job-7` or a bare `7`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim();
        let digits = digits.strip_prefix("job-").unwrap_or(digits);
        digits
            .parse()
            .map(JobId)
            .map_err(|_| format!("'{}' is not a job id", s))
    }
}

/// Summary of a completed job.
#[derive(Debug, Clone)]
pub struct JobReport {
    /// Destination tag
    pub tag: Tag,
    /// Pool the chunks went to
    pub pool: PoolHandle,
    /// Raw bytes read from the source
    pub bytes_ingested: u64,
    /// Stored bytes written
    pub bytes_written: u64,
    /// `bytes_ingested / bytes_written` (1.0 for an empty job)
    pub ratio: f64,
    /// Chunks committed
    pub chunks: usize,
    /// First logical offset written
    pub start_offset: u64,
    /// Exclusive end of the written range
    pub end_offset: u64,
    /// Profile chosen for the job
    pub profile: CompressionProfile,
    /// Codec was re-evaluated per chunk
    pub adaptive: bool,
    /// The cost model had no entry and the fallback profile was used
    pub fell_back: bool,
}

impl JobReport {
    /// Id of the destination pool.
    pub fn pool_id(&self) -> PoolId {
        self.pool.id()
    }
}

/// Details of a failed job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    /// Error classification
    pub kind: ErrorKind,
    /// Diagnostic message
    pub message: String,
    /// Source URI
    pub source: String,
    /// Destination tag
    pub tag: Tag,
    /// Exclusive end of the last committed chunk, None if nothing was written
    pub last_committed_offset: Option<u64>,
    /// Chunks committed before the failure (they are kept)
    pub committed_chunks: usize,
    /// Resubmitting is safe: nothing was written and the failure was transient
    pub retryable: bool,
}

/// Job lifecycle.
#[derive(Debug, Clone)]
pub enum JobState {
    /// Accepted, waiting for a worker
    Validated,
    /// Resolving the destination pool
    Resolving,
    /// Reading the next chunk
    Ingesting {
        /// Chunks committed so far
        committed_chunks: usize,
    },
    /// Compressing and writing a chunk
    Writing {
        /// Chunks committed so far
        committed_chunks: usize,
    },
    /// Finished successfully
    Completed(JobReport),
    /// Finished with an error
    Failed(JobFailure),
}

impl JobState {
    /// Completed or Failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed(_) | JobState::Failed(_))
    }

    /// Short state name.
    pub fn name(&self) -> &'static str {
        match self {
            JobState::Validated => "validated",
            JobState::Resolving => "resolving",
            JobState::Ingesting { .. } => "ingesting",
            JobState::Writing { .. } => "writing",
            JobState::Completed(_) => "completed",
            JobState::Failed(_) => "failed",
        }
    }

    /// The report, if completed.
    pub fn report(&self) -> Option<&JobReport> {
        match self {
            JobState::Completed(report) => Some(report),
            _ => None,
        }
    }

    /// The failure, if failed.
    pub fn failure(&self) -> Option<&JobFailure> {
        match self {
            JobState::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Failed(failure) => write!(f, "failed ({})", failure.kind),
            other => f.write_str(other.name()),
        }
    }
}

/// Caller's handle on a submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    cancel: CancellationToken,
    state: watch::Receiver<JobState>,
}

impl JobHandle {
    pub(crate) fn new(id: JobId) -> (Self, watch::Sender<JobState>) {
        let (tx, rx) = watch::channel(JobState::Validated);
        (
            Self {
                id,
                cancel: CancellationToken::new(),
                state: rx,
            },
            tx,
        )
    }

    /// Job id.
    pub fn id(&self) -> JobId {
        self.id
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Current state.
    pub fn state(&self) -> JobState {
        self.state.borrow().clone()
    }

    /// Waits until the job is terminal.
    pub async fn wait(&self) -> JobState {
        let mut rx = self.state.clone();
        if let Ok(state) = rx.wait_for(JobState::is_terminal).await {
            return state.clone();
        }
        // Sender gone: the last published state is final.
        self.state.borrow().clone()
    }

    /// Requests cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Hooks into job progress. Called on the job's task.
pub trait JobObserver: Send + Sync {
    /// A chunk was durably committed.
    fn on_commit(&self, _job: &JobHandle, _record: &ChunkRecord) {}

    /// The job moved to a new state.
    fn on_state(&self, _job: &JobHandle, _state: &JobState) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl JobObserver for NoopObserver {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_parse() {
        assert_eq!("job-7".parse::<JobId>(), Ok(JobId(7)));
        assert_eq!(" 12 ".parse::<JobId>(), Ok(JobId(12)));
        assert!("job-".parse::<JobId>().is_err());
        assert!("task-3".parse::<JobId>().is_err());
        assert_eq!(JobId(4).to_string().parse::<JobId>(), Ok(JobId(4)));
    }

    fn failure() -> JobFailure {
        JobFailure {
            kind: ErrorKind::Cancelled,
            message: "Job cancelled".into(),
            source: "file::/a".into(),
            tag: Tag::parse("ns::t").unwrap(),
            last_committed_offset: Some(3 * 4096),
            committed_chunks: 3,
            retryable: false,
        }
    }

    #[test]
    fn test_state_names() {
        assert!(!JobState::Validated.is_terminal());
        assert!(!JobState::Writing { committed_chunks: 1 }.is_terminal());
        let failed = JobState::Failed(failure());
        assert!(failed.is_terminal());
        assert_eq!(failed.to_string(), "failed (cancelled)");
        assert_eq!(failed.failure().unwrap().committed_chunks, 3);
        assert!(failed.report().is_none());
        assert_eq!(JobState::Resolving.to_string(), "resolving");
    }

    #[tokio::test]
    async fn test_handle_wait_and_cancel() {
        let (handle, tx) = JobHandle::new(JobId(1));
        assert_eq!(handle.id().to_string(), "job-1");
        assert!(matches!(handle.state(), JobState::Validated));

        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(handle.token().is_cancelled());

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait().await })
        };
        tx.send_replace(JobState::Resolving);
        tx.send_replace(JobState::Failed(failure()));
        let state = waiter.await.unwrap();
        assert_eq!(state.failure().unwrap().kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_wait_after_sender_dropped() {
        let (handle, tx) = JobHandle::new(JobId(2));
        drop(tx);
        assert!(matches!(handle.wait().await, JobState::Validated));
    }
}
