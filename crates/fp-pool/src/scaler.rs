//! Feedback-driven scaling loop.
//!
//! Each tick turns queue pressure into a load score (waiting jobs per
//! worker), records it in a bounded rolling history, and moves the pool a
//! fraction of the distance toward the relevant size bound. Comparing the
//! newest-quarter, newer-half, and full-history averages distinguishes a
//! sustained backlog trend from a momentary spike, so the aggressive rate
//! only fires when congestion is confirmed across every window.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info};

use fp_common::ScaleTuning;

use crate::pool::WorkerPool;

/// Periodic scaling loop. Runs until the task is cancelled via
/// `WorkerPool::close_auto_scale_worker`.
pub(crate) async fn run_autoscaler(pool: Arc<WorkerPool>) {
    let interval = pool.config.autoscale_interval;
    let mut history = VecDeque::with_capacity(pool.config.history_len);

    info!(
        pool = %pool.config.name,
        interval_ms = interval.as_millis() as u64,
        history_len = pool.config.history_len,
        "auto-scale loop started"
    );

    loop {
        tokio::time::sleep(interval).await;
        tick(&pool, &mut history).await;
    }
}

/// One scaling decision.
pub(crate) async fn tick(pool: &WorkerPool, history: &mut VecDeque<f64>) {
    let current = pool.size();

    // Bootstrap: an empty pool comes back up to the floor, unless intake is
    // paused and there is nothing to come back for.
    if current == 0 {
        if pool.load.is_paused() {
            debug!(pool = %pool.config.name, "pool empty and intake paused");
            return;
        }
        pool.scale(pool.config.min_size as i64).await;
        return;
    }

    let waiting = pool.load.waiting_jobs();
    let score = waiting as f64 / current as f64;

    if history.len() == pool.config.history_len {
        history.pop_front();
    }
    history.push_back(score);

    metrics::gauge!("pool.load_score").set(score);
    metrics::gauge!("pool.waiting_jobs").set(waiting as f64);

    let delta = decide_delta(
        score,
        history,
        current as i64,
        pool.config.min_size as i64,
        pool.config.max_size as i64,
        &pool.config.tuning,
    );

    if delta != 0 {
        debug!(
            pool = %pool.config.name,
            score,
            workers = current,
            delta,
            "scaling decision"
        );
        pool.scale(delta).await;
    }
}

/// Signed worker delta for one load sample against the rolling history.
///
/// `history` must already contain `score` as its newest sample. Positive
/// ranges round up (scale-up commits to at least the pure fraction) and
/// negative ranges round down (scale-down removes at least as many).
pub fn decide_delta(
    score: f64,
    history: &VecDeque<f64>,
    current: i64,
    min_size: i64,
    max_size: i64,
    tuning: &ScaleTuning,
) -> i64 {
    let samples: Vec<f64> = history.iter().copied().collect();
    let avg = mean(&samples);
    let half_avg = mean(&samples[samples.len() / 2..]);
    let quarter_avg = mean(&samples[samples.len() * 3 / 4..]);

    let (range, rate) = if score > tuning.surge_score
        && score > quarter_avg
        && quarter_avg > half_avg
        && half_avg > avg
    {
        // Congested and rising across every window.
        (max_size - current, tuning.surge_trend_rate)
    } else if score > tuning.surge_score {
        (max_size - current, tuning.surge_rate)
    } else if score >= tuning.busy_score {
        (max_size - current, tuning.busy_rate)
    } else if score > 0.0 && score > quarter_avg {
        (max_size - current, tuning.warm_rate)
    } else {
        // Idle drift toward the floor. The nested adjustments speed the
        // shrink up once the calm has lasted long enough to show in the
        // wider windows.
        let mut rate = tuning.idle_rate;
        if quarter_avg < tuning.calm_quarter_threshold {
            rate += tuning.idle_step;
            if half_avg < tuning.calm_half_threshold {
                rate -= tuning.idle_step;
                if avg < tuning.calm_avg_threshold {
                    rate -= tuning.idle_final_step;
                }
            }
        }
        (min_size - current, rate)
    };

    if range > 0 {
        (range as f64 * rate).ceil() as i64
    } else {
        (range as f64 * rate).floor() as i64
    }
}

fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use fp_common::{PoolConfig, QueueLoad};
    use fp_queue::InMemoryQueue;

    use crate::pool::WorkerPool;

    fn tuning() -> ScaleTuning {
        ScaleTuning::default()
    }

    fn history_of(samples: &[f64]) -> VecDeque<f64> {
        samples.iter().copied().collect()
    }

    #[test]
    fn congestion_with_trend_scales_to_max() {
        // 20 waiting jobs over 5 workers, every window rising below the
        // current score.
        let history = history_of(&[1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 3.0, 3.0, 4.0]);
        let delta = decide_delta(4.0, &history, 5, 3, 8, &tuning());
        assert_eq!(delta, 3); // ceil((8 - 5) * 1.0)
    }

    #[test]
    fn congestion_without_trend_uses_reduced_rate() {
        // High score but the history is flat, so the trend gate stays shut.
        let history = history_of(&[4.0, 4.0, 4.0, 4.0]);
        let delta = decide_delta(4.0, &history, 5, 3, 8, &tuning());
        assert_eq!(delta, 2); // ceil((8 - 5) * 0.6)
    }

    #[test]
    fn busy_score_moves_a_third_of_headroom() {
        let history = history_of(&[1.5]);
        let delta = decide_delta(1.5, &history, 4, 3, 13, &tuning());
        assert_eq!(delta, 3); // ceil((13 - 4) * 0.3)
    }

    #[test]
    fn warm_score_rounds_up_to_one() {
        // score in (0, 1] and above the newest-quarter average: tiny rate,
        // but scale-up still rounds toward adding a worker.
        let history = history_of(&[0.1, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1, 0.5]);
        let delta = decide_delta(0.5, &history, 4, 3, 8, &tuning());
        assert_eq!(delta, 1); // ceil((8 - 4) * 0.05)
    }

    #[test]
    fn idle_history_drifts_toward_min() {
        let history = history_of(&[0.0, 0.0, 0.0, 0.0]);
        // quarter < 0.1 -> +0.2, half < 0.1 -> -0.2, avg < 0.2 -> -0.1:
        // net rate 0.0, so a freshly idle pool holds its size this tick.
        let delta = decide_delta(0.0, &history, 8, 3, 10, &tuning());
        assert_eq!(delta, 0);
    }

    #[test]
    fn recently_busy_idle_pool_shrinks() {
        // Quarter average is calm but the wider windows still remember load,
        // so only the first adjustment applies.
        let history = history_of(&[3.0, 3.0, 3.0, 0.0]);
        let delta = decide_delta(0.0, &history, 8, 3, 10, &tuning());
        assert_eq!(delta, -2); // floor((3 - 8) * 0.3)
    }

    #[test]
    fn shrink_never_overshoots_min() {
        let history = history_of(&[0.0]);
        let delta = decide_delta(0.0, &history, 4, 3, 8, &tuning());
        assert!(4 + delta >= 3);
    }

    #[test]
    fn at_max_size_no_growth_is_decided() {
        let history = history_of(&[5.0]);
        let delta = decide_delta(5.0, &history, 8, 3, 8, &tuning());
        assert_eq!(delta, 0);
    }

    /// Load signal the tests can steer independently of the queue.
    struct FakeLoad {
        waiting: AtomicUsize,
        paused: AtomicBool,
    }

    impl FakeLoad {
        fn new(waiting: usize) -> Self {
            Self {
                waiting: AtomicUsize::new(waiting),
                paused: AtomicBool::new(false),
            }
        }
    }

    impl QueueLoad for FakeLoad {
        fn waiting_jobs(&self) -> usize {
            self.waiting.load(Ordering::SeqCst)
        }

        fn is_paused(&self) -> bool {
            self.paused.load(Ordering::SeqCst)
        }
    }

    fn test_pool(load: Arc<FakeLoad>) -> Arc<WorkerPool> {
        let queue = Arc::new(InMemoryQueue::new(64));
        let config = PoolConfig {
            name: "scaler-test".to_string(),
            min_size: 3,
            max_size: 8,
            ..PoolConfig::default()
        };
        Arc::new(WorkerPool::new(config, queue, load).unwrap())
    }

    #[tokio::test]
    async fn congestion_tick_scales_pool_to_max() {
        let load = Arc::new(FakeLoad::new(20));
        let pool = test_pool(load);
        pool.make_workers(5);

        let mut history = history_of(&[1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 3.0, 3.0]);
        tick(&pool, &mut history).await;

        assert_eq!(pool.size(), 8);
        assert_eq!(*history.back().unwrap(), 4.0);
    }

    #[tokio::test]
    async fn empty_pool_bootstraps_to_min() {
        let load = Arc::new(FakeLoad::new(0));
        let pool = test_pool(load);

        let mut history = VecDeque::new();
        tick(&pool, &mut history).await;

        assert_eq!(pool.size(), 3);
        // Bootstrap does not record a sample.
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn paused_empty_pool_stays_empty() {
        let load = Arc::new(FakeLoad::new(0));
        load.paused.store(true, Ordering::SeqCst);
        let pool = test_pool(load);

        let mut history = VecDeque::new();
        tick(&pool, &mut history).await;

        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn history_stays_bounded() {
        let load = Arc::new(FakeLoad::new(0));
        let pool = test_pool(load);
        pool.make_workers(3);

        let cap = pool.config.history_len;
        let mut history = VecDeque::with_capacity(cap);
        for _ in 0..cap * 3 {
            tick(&pool, &mut history).await;
        }
        assert_eq!(history.len(), cap);
    }
}
