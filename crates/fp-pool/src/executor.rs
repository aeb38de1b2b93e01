//! Job execution adapter and the bounded blocking executor.
//!
//! One dequeued job runs to completion here and its outcome is delivered to
//! the job's result handle. Nothing in this module propagates an error back
//! into the worker loop.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

use fp_common::{Job, JobError, JobKind, JobResult};

/// Bounded executor for blocking closures.
///
/// Caps how many blocking jobs may occupy spawn_blocking threads at once, so
/// a burst of slow blocking work cannot exhaust the runtime's blocking pool.
/// Shared and host-supplied; the pool only submits work to it.
pub struct BlockingExecutor {
    permits: Arc<Semaphore>,
}

impl BlockingExecutor {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    async fn run(&self, f: Box<dyn FnOnce() -> JobResult + Send + 'static>) -> JobResult {
        let _permit = self.permits.acquire().await.expect("semaphore closed");
        run_blocking(f).await
    }
}

async fn run_blocking(f: Box<dyn FnOnce() -> JobResult + Send + 'static>) -> JobResult {
    match tokio::task::spawn_blocking(f).await {
        Ok(outcome) => outcome,
        Err(e) => Err(JobError::Panicked(e.to_string())),
    }
}

/// Run one job and deliver its outcome through the result handle.
pub(crate) async fn run_job(job: Job, blocking: Option<&BlockingExecutor>) {
    let Job { kind, result_tx } = job;

    let outcome = match kind {
        JobKind::Future(fut) => fut.await,
        JobKind::Blocking(f) => match blocking {
            Some(executor) => executor.run(f).await,
            None => run_blocking(f).await,
        },
        JobKind::Unsupported(shape) => Err(JobError::Unsupported(shape)),
    };

    match &outcome {
        Ok(_) => metrics::counter!("pool.jobs_succeeded_total").increment(1),
        Err(_) => metrics::counter!("pool.jobs_failed_total").increment(1),
    }

    // The submitter may have given up on the result; that is not the
    // worker's problem.
    if result_tx.send(outcome).is_err() {
        debug!("job result receiver dropped before delivery");
    }
}
