//! Shared job queue abstraction for FlexPool.
//!
//! Workers consume `PoolMessage`s from a `JobQueue`; producers push jobs and
//! the pool pushes close sentinels through the same channel. The in-memory
//! implementation is the default for embedded/dev use; other backends can be
//! plugged in behind the same trait.

use async_trait::async_trait;
use fp_common::{Job, PoolMessage};

pub mod error;
pub mod memory;

pub use error::QueueError;
pub use memory::InMemoryQueue;

pub type Result<T> = std::result::Result<T, QueueError>;

/// A multi-producer multi-consumer queue of pool messages.
///
/// Any idle worker may pick up any pending item; delivery is exclusive (one
/// item goes to exactly one worker). `job_done` must be called once per item
/// returned from `recv`, including close sentinels.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Wait for the next item. Returns `QueueError::Closed` once the queue
    /// is closed and drained.
    async fn recv(&self) -> Result<PoolMessage>;

    /// Enqueue an item, waiting for capacity if the queue is bounded.
    async fn send(&self, msg: PoolMessage) -> Result<()>;

    /// Enqueue an item without waiting. Fails with `QueueError::Full` when
    /// at capacity; the rejected message is dropped (a dropped job resolves
    /// its handle with `JobError::Abandoned`).
    fn try_send(&self, msg: PoolMessage) -> Result<()>;

    /// Mark the most recently received item as fully processed. Backs the
    /// unfinished-work accounting.
    fn job_done(&self);

    /// Convenience wrapper for submitting a job.
    async fn submit(&self, job: Job) -> Result<()> {
        self.send(PoolMessage::Job(job)).await
    }
}
