//! Bounded in-memory queue backed by a tokio mpsc channel.
//!
//! Multiple workers share the receiving side through an async mutex; the
//! lock is held only while waiting for the next item, so dequeueing stays
//! fair across workers. Depth and unfinished counters back the load signal
//! read by the scaling loop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use fp_common::{PoolMessage, QueueLoad};

use crate::error::QueueError;
use crate::{JobQueue, Result};

pub struct InMemoryQueue {
    /// Taken on `close()`; `None` means no new items are accepted.
    tx: parking_lot::Mutex<Option<mpsc::Sender<PoolMessage>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<PoolMessage>>,

    /// Jobs enqueued and not yet picked up by a worker. Close sentinels are
    /// not counted; they are pool plumbing, not load.
    depth: AtomicUsize,

    /// Items enqueued and not yet marked done, including items currently
    /// being processed.
    unfinished: AtomicUsize,

    paused: AtomicBool,
}

impl InMemoryQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            depth: AtomicUsize::new(0),
            unfinished: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
        }
    }

    /// Stop accepting new items. Workers drain what is already queued and
    /// then observe `QueueError::Closed`.
    pub fn close(&self) {
        if self.tx.lock().take().is_some() {
            debug!("in-memory queue closed");
        }
    }

    /// Stop the pool's scaling loop from bootstrapping while intake is held.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Items enqueued and not yet marked done.
    pub fn unfinished(&self) -> usize {
        self.unfinished.load(Ordering::SeqCst)
    }

    fn sender(&self) -> Result<mpsc::Sender<PoolMessage>> {
        self.tx.lock().clone().ok_or(QueueError::Closed)
    }

    fn record_enqueued(&self, msg: &PoolMessage) {
        if matches!(msg, PoolMessage::Job(_)) {
            self.depth.fetch_add(1, Ordering::SeqCst);
        }
        self.unfinished.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn recv(&self) -> Result<PoolMessage> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(msg) => {
                if matches!(msg, PoolMessage::Job(_)) {
                    self.depth.fetch_sub(1, Ordering::SeqCst);
                }
                Ok(msg)
            }
            None => Err(QueueError::Closed),
        }
    }

    async fn send(&self, msg: PoolMessage) -> Result<()> {
        let tx = self.sender()?;
        // Count before handing the message over; a receiver that dequeues
        // immediately must not observe a negative depth.
        self.record_enqueued(&msg);
        if let Err(e) = tx.send(msg).await {
            if matches!(e.0, PoolMessage::Job(_)) {
                self.depth.fetch_sub(1, Ordering::SeqCst);
            }
            self.unfinished.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    fn try_send(&self, msg: PoolMessage) -> Result<()> {
        let tx = self.sender()?;
        self.record_enqueued(&msg);
        if let Err(e) = tx.try_send(msg) {
            let (msg, err) = match e {
                mpsc::error::TrySendError::Full(m) => (m, QueueError::Full),
                mpsc::error::TrySendError::Closed(m) => (m, QueueError::Closed),
            };
            if matches!(msg, PoolMessage::Job(_)) {
                self.depth.fetch_sub(1, Ordering::SeqCst);
            }
            self.unfinished.fetch_sub(1, Ordering::SeqCst);
            return Err(err);
        }
        Ok(())
    }

    fn job_done(&self) {
        self.unfinished.fetch_sub(1, Ordering::SeqCst);
    }
}

impl QueueLoad for InMemoryQueue {
    fn waiting_jobs(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fp_common::{Job, JobError};

    fn noop_job() -> Job {
        let (job, _handle) = Job::future(async { Ok(serde_json::json!(null)) });
        job
    }

    #[tokio::test]
    async fn depth_tracks_jobs_not_sentinels() {
        let queue = InMemoryQueue::new(8);
        queue.send(PoolMessage::Job(noop_job())).await.unwrap();
        queue.send(PoolMessage::Close).await.unwrap();

        assert_eq!(queue.waiting_jobs(), 1);
        assert_eq!(queue.unfinished(), 2);

        let first = queue.recv().await.unwrap();
        assert!(matches!(first, PoolMessage::Job(_)));
        assert_eq!(queue.waiting_jobs(), 0);
        queue.job_done();

        let second = queue.recv().await.unwrap();
        assert!(matches!(second, PoolMessage::Close));
        queue.job_done();
        assert_eq!(queue.unfinished(), 0);
    }

    #[tokio::test]
    async fn try_send_full_queue_is_rejected() {
        let queue = InMemoryQueue::new(1);
        queue.try_send(PoolMessage::Close).unwrap();
        let err = queue.try_send(PoolMessage::Close).unwrap_err();
        assert_eq!(err, QueueError::Full);
        // The rejected sentinel must not leak into the accounting.
        assert_eq!(queue.unfinished(), 1);
    }

    #[tokio::test]
    async fn closed_queue_drains_then_reports_closed() {
        let queue = InMemoryQueue::new(8);
        queue.send(PoolMessage::Close).await.unwrap();
        queue.close();

        assert!(matches!(queue.recv().await, Ok(PoolMessage::Close)));
        assert_eq!(queue.recv().await.unwrap_err(), QueueError::Closed);
        assert_eq!(
            queue.send(PoolMessage::Close).await.unwrap_err(),
            QueueError::Closed
        );
    }

    #[tokio::test]
    async fn dropped_job_resolves_handle_as_abandoned() {
        let queue = InMemoryQueue::new(1);
        queue.try_send(PoolMessage::Close).unwrap();

        let (job, handle) = Job::future(async { Ok(serde_json::json!(1)) });
        let err = queue.try_send(PoolMessage::Job(job)).unwrap_err();
        assert_eq!(err, QueueError::Full);
        assert!(matches!(handle.result().await, Err(JobError::Abandoned)));
    }

    #[tokio::test]
    async fn pause_is_visible_through_load_signal() {
        let queue = InMemoryQueue::new(4);
        assert!(!queue.is_paused());
        queue.pause();
        assert!(queue.is_paused());
        queue.resume();
        assert!(!queue.is_paused());
    }
}
