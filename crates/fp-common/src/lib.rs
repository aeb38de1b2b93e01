use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

pub mod logging;

// ============================================================================
// Job Types
// ============================================================================

/// Outcome of running a single job: a JSON value on success, a job-level
/// error otherwise.
pub type JobResult = Result<serde_json::Value, JobError>;

/// Error produced by (or on behalf of) a single job.
///
/// Job-level errors are always delivered through the job's result handle.
/// They never terminate the worker that ran the job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job failed: {0}")]
    Failed(String),

    /// The payload could not be classified as runnable work.
    #[error("job payload is not runnable: {0}")]
    Unsupported(&'static str),

    /// A blocking closure panicked inside the executor.
    #[error("blocking job panicked: {0}")]
    Panicked(String),

    /// The worker executing the job was cancelled before it finished.
    #[error("worker was cancelled before the job finished")]
    Abandoned,
}

impl JobError {
    pub fn failed(msg: impl Into<String>) -> Self {
        JobError::Failed(msg.into())
    }
}

/// How a job's work is expressed. Classified once at construction so the
/// executor dispatches with a plain match.
pub enum JobKind {
    /// Awaited directly on the scheduler.
    Future(BoxFuture<'static, JobResult>),
    /// Off-loaded to the blocking executor so it cannot stall other workers.
    Blocking(Box<dyn FnOnce() -> JobResult + Send + 'static>),
    /// Rejected at execution time with `JobError::Unsupported`.
    Unsupported(&'static str),
}

impl fmt::Debug for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Future(_) => f.write_str("JobKind::Future"),
            JobKind::Blocking(_) => f.write_str("JobKind::Blocking"),
            JobKind::Unsupported(s) => write!(f, "JobKind::Unsupported({})", s),
        }
    }
}

/// A unit of work bundled with the oneshot sender its outcome is delivered
/// through. Consumed by exactly one worker.
#[derive(Debug)]
pub struct Job {
    pub kind: JobKind,
    pub result_tx: oneshot::Sender<JobResult>,
}

impl Job {
    /// Wrap an async unit of work.
    pub fn future<F>(fut: F) -> (Self, JobHandle)
    where
        F: Future<Output = JobResult> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = Self {
            kind: JobKind::Future(Box::pin(fut)),
            result_tx: tx,
        };
        (job, JobHandle { rx })
    }

    /// Wrap a blocking closure.
    pub fn blocking<F>(f: F) -> (Self, JobHandle)
    where
        F: FnOnce() -> JobResult + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = Self {
            kind: JobKind::Blocking(Box::new(f)),
            result_tx: tx,
        };
        (job, JobHandle { rx })
    }

    /// A payload the submitter could not express as runnable work. The pool
    /// resolves its handle with `JobError::Unsupported` instead of crashing
    /// the worker that dequeued it.
    pub fn unsupported(shape: &'static str) -> (Self, JobHandle) {
        let (tx, rx) = oneshot::channel();
        let job = Self {
            kind: JobKind::Unsupported(shape),
            result_tx: tx,
        };
        (job, JobHandle { rx })
    }
}

/// The submitter's side of a job: await `result()` for the value or error.
#[derive(Debug)]
pub struct JobHandle {
    rx: oneshot::Receiver<JobResult>,
}

impl JobHandle {
    /// Wait for the job's outcome.
    ///
    /// If the worker executing the job was hard-cancelled, the sender is
    /// dropped and this resolves to `JobError::Abandoned` rather than
    /// waiting forever.
    pub async fn result(self) -> JobResult {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(JobError::Abandoned),
        }
    }
}

/// Item flowing through the shared pool queue.
#[derive(Debug)]
pub enum PoolMessage {
    /// A job for whichever worker dequeues it first.
    Job(Job),
    /// Sentinel asking the receiving worker to exit. Never re-enqueued or
    /// propagated by the worker that consumes it.
    Close,
}

// ============================================================================
// Load Signal
// ============================================================================

/// Read-only view of queue pressure, polled once per scaling tick.
pub trait QueueLoad: Send + Sync {
    /// Number of jobs waiting to be picked up by a worker.
    fn waiting_jobs(&self) -> usize;

    /// Whether new submissions are currently paused. While paused, an empty
    /// pool is not bootstrapped back up by the scaling loop.
    fn is_paused(&self) -> bool;
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Worker pool configuration. Immutable after construction.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool name, used in logs and stats.
    pub name: String,
    /// Lower bound on pool size. Must be at least 1 and below `max_size`.
    pub min_size: u32,
    /// Upper bound on pool size.
    pub max_size: u32,
    /// Sleep between scaling decisions.
    pub autoscale_interval: Duration,
    /// Capacity of the rolling load-score history.
    pub history_len: usize,
    /// Seed for hard-kill victim sampling. `None` seeds from the OS.
    pub rng_seed: Option<u64>,
    pub tuning: ScaleTuning,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            min_size: 1,
            max_size: 16,
            autoscale_interval: Duration::from_secs(5),
            history_len: 12,
            rng_seed: None,
            tuning: ScaleTuning::default(),
        }
    }
}

/// Tuning constants for the scaling decision table.
///
/// The defaults are empirically tuned; treat them as a starting point rather
/// than load-bearing values.
#[derive(Debug, Clone)]
pub struct ScaleTuning {
    /// Load score above which the pool is considered congested.
    pub surge_score: f64,
    /// Load score above which the pool is considered busy.
    pub busy_score: f64,
    /// Headroom fraction applied when congestion comes with a sustained
    /// upward trend across the history windows.
    pub surge_trend_rate: f64,
    /// Headroom fraction applied on congestion without a confirmed trend.
    pub surge_rate: f64,
    /// Headroom fraction applied while busy.
    pub busy_rate: f64,
    /// Headroom fraction applied while warm (light load, still rising).
    pub warm_rate: f64,
    /// Base fraction of the distance to `min_size` reclaimed while idle.
    pub idle_rate: f64,
    /// Adjustment applied as the idle averages fall below the calm
    /// thresholds.
    pub idle_step: f64,
    /// Final adjustment once the full-history average is calm as well.
    pub idle_final_step: f64,
    /// Newest-quarter average below this counts as calm.
    pub calm_quarter_threshold: f64,
    /// Newer-half average below this counts as calm.
    pub calm_half_threshold: f64,
    /// Full-history average below this counts as calm.
    pub calm_avg_threshold: f64,
}

impl Default for ScaleTuning {
    fn default() -> Self {
        Self {
            surge_score: 2.0,
            busy_score: 1.0,
            surge_trend_rate: 1.0,
            surge_rate: 0.6,
            busy_rate: 0.3,
            warm_rate: 0.05,
            idle_rate: 0.1,
            idle_step: 0.2,
            idle_final_step: 0.1,
            calm_quarter_threshold: 0.1,
            calm_half_threshold: 0.1,
            calm_avg_threshold: 0.2,
        }
    }
}

// ============================================================================
// Stats Types
// ============================================================================

/// Point-in-time snapshot of a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolStats {
    pub pool: String,
    pub workers: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub waiting_jobs: u64,
    pub paused: bool,
    pub autoscaler_running: bool,
    pub snapshot_at: DateTime<Utc>,
}
