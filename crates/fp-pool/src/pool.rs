//! WorkerPool - auto-scaling pool of queue-consuming workers
//!
//! Workers are anonymous and interchangeable: each one loops dequeue ->
//! classify -> execute until it receives a close sentinel, the queue closes,
//! or it is cancelled. The pool owns only the worker set; the queue and the
//! load signal are host-supplied collaborators.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use rand::SeedableRng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fp_common::{PoolConfig, PoolMessage, QueueLoad, WorkerPoolStats};
use fp_queue::JobQueue;

use crate::error::PoolError;
use crate::executor::{run_job, BlockingExecutor};
use crate::scaler;
use crate::Result;

/// Auto-scaling worker pool.
pub struct WorkerPool {
    pub(crate) config: PoolConfig,
    pub(crate) queue: Arc<dyn JobQueue>,
    pub(crate) load: Arc<dyn QueueLoad>,
    blocking: Option<Arc<BlockingExecutor>>,

    /// Live worker ids. An id is marked live before its task is spawned and
    /// removed by the worker itself on exit; cardinality is the
    /// authoritative pool size.
    live: Arc<DashSet<u64>>,

    /// Join handles for hard cancellation, keyed by worker id.
    handles: Arc<DashMap<u64, JoinHandle<()>>>,

    next_worker_id: AtomicU64,

    /// Scaling loop handle; populated by `start_workers`.
    autoscaler: parking_lot::Mutex<Option<JoinHandle<()>>>,

    /// Victim sampling for hard removal. Seedable for deterministic tests.
    rng: parking_lot::Mutex<StdRng>,
}

impl WorkerPool {
    /// Build a pool over a queue and a load signal.
    ///
    /// Fails with `PoolError::Config` when the size bounds or the history
    /// length are unusable.
    pub fn new(
        config: PoolConfig,
        queue: Arc<dyn JobQueue>,
        load: Arc<dyn QueueLoad>,
    ) -> Result<Self> {
        if config.min_size == 0 {
            return Err(PoolError::Config("min_size must be at least 1".to_string()));
        }
        if config.min_size >= config.max_size {
            return Err(PoolError::Config(format!(
                "min_size ({}) must be below max_size ({})",
                config.min_size, config.max_size
            )));
        }
        if config.history_len == 0 {
            return Err(PoolError::Config(
                "history_len must be at least 1".to_string(),
            ));
        }
        if config.autoscale_interval.is_zero() {
            return Err(PoolError::Config(
                "autoscale_interval must be non-zero".to_string(),
            ));
        }

        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            config,
            queue,
            load,
            blocking: None,
            live: Arc::new(DashSet::new()),
            handles: Arc::new(DashMap::new()),
            next_worker_id: AtomicU64::new(0),
            autoscaler: parking_lot::Mutex::new(None),
            rng: parking_lot::Mutex::new(rng),
        })
    }

    /// Attach a bounded executor for blocking jobs. Without one, blocking
    /// jobs fall through to the runtime's spawn_blocking pool uncapped.
    pub fn with_blocking_executor(mut self, executor: Arc<BlockingExecutor>) -> Self {
        self.blocking = Some(executor);
        self
    }

    /// Current number of live workers.
    pub fn size(&self) -> usize {
        self.live.len()
    }

    /// Whether the scaling loop is currently running.
    pub fn is_autoscaling(&self) -> bool {
        self.autoscaler
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Bring the pool up to at least `min_size` workers and start the
    /// scaling loop if it is not already running. Safe to call repeatedly.
    pub fn start_workers(self: &Arc<Self>) {
        let current = self.size();
        let min = self.config.min_size as usize;
        if current < min {
            self.make_workers(min - current);
        }
        self.start_autoscaler();
        info!(
            pool = %self.config.name,
            workers = self.size(),
            min_size = self.config.min_size,
            max_size = self.config.max_size,
            "worker pool started"
        );
    }

    fn start_autoscaler(self: &Arc<Self>) {
        let mut slot = self.autoscaler.lock();
        if let Some(handle) = slot.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        let pool = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            scaler::run_autoscaler(pool).await;
        }));
    }

    /// Stop the scaling loop without touching running workers. Idempotent;
    /// an in-flight tick is abandoned.
    pub fn close_auto_scale_worker(&self) {
        if let Some(handle) = self.autoscaler.lock().take() {
            handle.abort();
            info!(pool = %self.config.name, "auto-scale loop stopped");
        }
    }

    /// Spawn `n` new workers.
    pub(crate) fn make_workers(&self, n: usize) {
        for _ in 0..n {
            let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);

            // Mark live before spawning so a worker that exits instantly
            // still balances its own removal.
            self.live.insert(id);

            let pool_name: Arc<str> = Arc::from(self.config.name.as_str());
            let queue = Arc::clone(&self.queue);
            let blocking = self.blocking.clone();
            let live = Arc::clone(&self.live);
            let handles = Arc::clone(&self.handles);

            let handle = tokio::spawn(Self::run_worker(
                id, pool_name, queue, blocking, live, handles,
            ));

            self.handles.insert(id, handle);
            if !self.live.contains(&id) {
                // The worker already exited; drop the stale handle.
                self.handles.remove(&id);
            }
        }

        if n > 0 {
            debug!(
                pool = %self.config.name,
                spawned = n,
                workers = self.size(),
                "workers spawned"
            );
            metrics::gauge!("pool.workers").set(self.size() as f64);
        }
    }

    /// Worker loop. Job failures are captured into the job's result handle;
    /// only a close sentinel, a closed queue, or cancellation ends the loop.
    async fn run_worker(
        id: u64,
        pool_name: Arc<str>,
        queue: Arc<dyn JobQueue>,
        blocking: Option<Arc<BlockingExecutor>>,
        live: Arc<DashSet<u64>>,
        handles: Arc<DashMap<u64, JoinHandle<()>>>,
    ) {
        debug!(pool = %pool_name, worker_id = id, "worker started");

        loop {
            match queue.recv().await {
                Ok(PoolMessage::Job(job)) => {
                    run_job(job, blocking.as_deref()).await;
                    queue.job_done();
                }
                Ok(PoolMessage::Close) => {
                    queue.job_done();
                    debug!(pool = %pool_name, worker_id = id, "close sentinel received");
                    break;
                }
                Err(_) => {
                    debug!(pool = %pool_name, worker_id = id, "queue closed");
                    break;
                }
            }
        }

        live.remove(&id);
        handles.remove(&id);
        metrics::gauge!("pool.workers").set(live.len() as f64);
        debug!(pool = %pool_name, worker_id = id, "worker exited");
    }

    /// Resize the pool by a signed delta, clamped into
    /// `[min_size, max_size]`. Growth spawns workers immediately; shrinkage
    /// enqueues one close sentinel per removed worker and waits for the
    /// queue to accept each one (not for the workers to exit).
    ///
    /// Returns the clamped target size. Concurrent calls are not serialized;
    /// callers that need exact targets must avoid overlapping calls.
    pub async fn scale(&self, n: i64) -> usize {
        let current = self.size() as i64;
        if n == 0 {
            return current as usize;
        }

        let target = (current + n).clamp(self.config.min_size as i64, self.config.max_size as i64);
        let delta = target - current;

        if delta > 0 {
            info!(pool = %self.config.name, current, target, "scaling up");
            self.make_workers(delta as usize);
            metrics::counter!("pool.scale_up_total").increment(delta as u64);
        } else if delta < 0 {
            info!(pool = %self.config.name, current, target, "scaling down");
            for _ in 0..-delta {
                if let Err(e) = self.queue.send(PoolMessage::Close).await {
                    warn!(pool = %self.config.name, error = %e, "failed to enqueue close sentinel");
                    break;
                }
            }
            metrics::counter!("pool.scale_down_total").increment((-delta) as u64);
        }

        target as usize
    }

    /// Non-blocking variant of `scale`. Soft shrinkage enqueues close
    /// sentinels without waiting for queue capacity; hard shrinkage cancels
    /// a randomly chosen subset of live workers instead, abandoning their
    /// in-flight jobs.
    pub fn scale_nowait(&self, n: i64, soft: bool) -> usize {
        let current = self.size() as i64;
        if n == 0 {
            return current as usize;
        }

        let target = (current + n).clamp(self.config.min_size as i64, self.config.max_size as i64);
        let delta = target - current;

        if delta > 0 {
            info!(pool = %self.config.name, current, target, "scaling up");
            self.make_workers(delta as usize);
            metrics::counter!("pool.scale_up_total").increment(delta as u64);
        } else if delta < 0 {
            if soft {
                info!(pool = %self.config.name, current, target, "scaling down (no-wait)");
                self.enqueue_close_nowait((-delta) as usize);
            } else {
                info!(pool = %self.config.name, current, target, "scaling down (hard)");
                self.kill_workers((-delta) as usize);
            }
            metrics::counter!("pool.scale_down_total").increment((-delta) as u64);
        }

        target as usize
    }

    /// Gracefully shut the pool down: one close sentinel per worker, then
    /// wait until every worker has drained its in-flight job and exited.
    pub async fn close_workers(&self) {
        let current = self.size();
        info!(pool = %self.config.name, workers = current, "closing worker pool");

        for _ in 0..current {
            if let Err(e) = self.queue.send(PoolMessage::Close).await {
                // A closed queue ends the workers on its own.
                warn!(pool = %self.config.name, error = %e, "failed to enqueue close sentinel");
                break;
            }
        }

        while self.size() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        info!(pool = %self.config.name, "worker pool drained");
    }

    /// Gracefully shut the pool down without waiting: the sentinels are
    /// enqueued fire-and-forget and workers exit as they reach them.
    pub fn close_workers_nowait_soft(&self) {
        let current = self.size();
        info!(pool = %self.config.name, workers = current, "closing worker pool (no-wait)");
        self.enqueue_close_nowait(current);
    }

    /// Cancel every worker immediately. In-flight jobs are abandoned; their
    /// handles resolve with `JobError::Abandoned`.
    pub fn close_workers_hard(&self) {
        let ids: Vec<u64> = self.live.iter().map(|e| *e).collect();
        info!(pool = %self.config.name, workers = ids.len(), "cancelling all workers");
        for id in ids {
            self.cancel_worker(id);
        }
        metrics::gauge!("pool.workers").set(0.0);
    }

    /// Point-in-time snapshot for monitoring.
    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            pool: self.config.name.clone(),
            workers: self.size() as u32,
            min_size: self.config.min_size,
            max_size: self.config.max_size,
            waiting_jobs: self.load.waiting_jobs() as u64,
            paused: self.load.is_paused(),
            autoscaler_running: self.is_autoscaling(),
            snapshot_at: Utc::now(),
        }
    }

    fn enqueue_close_nowait(&self, count: usize) {
        for _ in 0..count {
            if let Err(e) = self.queue.try_send(PoolMessage::Close) {
                warn!(pool = %self.config.name, error = %e, "close sentinel rejected");
                break;
            }
        }
    }

    /// Cancel a random sample of live workers.
    fn kill_workers(&self, count: usize) {
        let victims: Vec<u64> = {
            let mut rng = self.rng.lock();
            self.live.iter().map(|e| *e).choose_multiple(&mut *rng, count)
        };
        for id in victims {
            self.cancel_worker(id);
        }
        metrics::gauge!("pool.workers").set(self.size() as f64);
    }

    fn cancel_worker(&self, id: u64) {
        if let Some((_, handle)) = self.handles.remove(&id) {
            handle.abort();
        }
        self.live.remove(&id);
        debug!(pool = %self.config.name, worker_id = id, "worker cancelled");
    }
}
