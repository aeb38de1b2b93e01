//! FlexPool Development Driver
//!
//! All-in-one binary for local experimentation: wires an in-memory queue to
//! an auto-scaling worker pool, feeds it a stream of demo jobs (async and
//! blocking), reports pool stats periodically, and walks through a graceful
//! shutdown on ctrl-c.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};

use fp_common::logging::init_logging;
use fp_common::{Job, PoolConfig};
use fp_pool::{BlockingExecutor, WorkerPool};
use fp_queue::{InMemoryQueue, JobQueue};

/// FlexPool development driver
#[derive(Parser, Debug)]
#[command(name = "fp-dev")]
#[command(about = "FlexPool development driver - in-memory queue + auto-scaling pool")]
struct Args {
    /// Minimum pool size
    #[arg(long, env = "FP_MIN_WORKERS", default_value = "2")]
    min_workers: u32,

    /// Maximum pool size
    #[arg(long, env = "FP_MAX_WORKERS", default_value = "16")]
    max_workers: u32,

    /// Scaling tick interval in milliseconds
    #[arg(long, env = "FP_SCALE_INTERVAL_MS", default_value = "2000")]
    scale_interval_ms: u64,

    /// Capacity of the in-memory queue
    #[arg(long, env = "FP_QUEUE_CAPACITY", default_value = "512")]
    queue_capacity: usize,

    /// Concurrent blocking jobs allowed in the executor
    #[arg(long, env = "FP_BLOCKING_LIMIT", default_value = "8")]
    blocking_limit: usize,

    /// Demo jobs submitted per second (0 disables the producer)
    #[arg(long, env = "FP_JOBS_PER_SEC", default_value = "20")]
    jobs_per_sec: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let queue = Arc::new(InMemoryQueue::new(args.queue_capacity));
    let config = PoolConfig {
        name: "fp-dev".to_string(),
        min_size: args.min_workers,
        max_size: args.max_workers,
        autoscale_interval: Duration::from_millis(args.scale_interval_ms),
        ..PoolConfig::default()
    };

    let pool = WorkerPool::new(config, queue.clone(), queue.clone())?
        .with_blocking_executor(Arc::new(BlockingExecutor::new(args.blocking_limit)));
    let pool = Arc::new(pool);

    pool.start_workers();

    let completed = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));

    // Demo producer: a steady mix of async and blocking jobs.
    let producer = {
        let queue = queue.clone();
        let completed = completed.clone();
        let failed = failed.clone();
        let jobs_per_sec = args.jobs_per_sec;

        tokio::spawn(async move {
            if jobs_per_sec == 0 {
                return;
            }
            let period_ms = (1000 / jobs_per_sec).max(1);
            let mut ticker = tokio::time::interval(Duration::from_millis(period_ms));
            let mut seq: u64 = 0;

            loop {
                ticker.tick().await;
                seq += 1;

                let (job, handle) = if seq % 5 == 0 {
                    Job::blocking(move || {
                        std::thread::sleep(Duration::from_millis(50));
                        Ok(json!({ "seq": seq, "kind": "blocking" }))
                    })
                } else {
                    Job::future(async move {
                        tokio::time::sleep(Duration::from_millis(25)).await;
                        Ok(json!({ "seq": seq, "kind": "async" }))
                    })
                };

                if let Err(e) = queue.submit(job).await {
                    warn!(error = %e, "queue rejected demo job, stopping producer");
                    break;
                }

                let completed = completed.clone();
                let failed = failed.clone();
                tokio::spawn(async move {
                    match handle.result().await {
                        Ok(_) => completed.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                });
            }
        })
    };

    // Stats reporter.
    let reporter = {
        let pool = pool.clone();
        let completed = completed.clone();
        let failed = failed.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                let stats = pool.stats();
                info!(
                    workers = stats.workers,
                    waiting_jobs = stats.waiting_jobs,
                    completed = completed.load(Ordering::Relaxed),
                    failed = failed.load(Ordering::Relaxed),
                    autoscaler = stats.autoscaler_running,
                    "pool status"
                );
            }
        })
    };

    info!(
        min_workers = args.min_workers,
        max_workers = args.max_workers,
        scale_interval_ms = args.scale_interval_ms,
        "fp-dev running, press ctrl-c to shut down"
    );
    signal::ctrl_c().await?;
    info!("shutdown requested");

    // Shutdown order matters: stop the scaling loop first so the bootstrap
    // branch cannot respawn workers, hold intake, then drain.
    producer.abort();
    pool.close_auto_scale_worker();
    queue.pause();
    pool.close_workers().await;
    reporter.abort();

    info!(
        completed = completed.load(Ordering::Relaxed),
        failed = failed.load(Ordering::Relaxed),
        "fp-dev stopped"
    );
    Ok(())
}
