//! `SnapshotQueue`: a bounded-concurrency FIFO job queue with
//! `idle()`/`stop(drain)` semantics.
//!
//! Grounded in the teacher's mpsc-channel-plus-semaphore worker pool
//! (`WorkerPool`/`BatchProcessor`), generalized from N dedicated workers
//! each owning a browser to a single shared semaphore gating access to the
//! one `BrowserController` PercyCore owns.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

pub struct SnapshotQueue {
    semaphore: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    idle_notify: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

impl SnapshotQueue {
    pub fn new(concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            pending: Arc::new(AtomicUsize::new(0)),
            idle_notify: Arc::new(Notify::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Enqueues `job`; starts immediately if `active < concurrency`, else
    /// waits its turn. FIFO is provided by `tokio::sync::Semaphore`'s
    /// fair-queueing of waiters.
    pub async fn push<F, T>(&self, job: F) -> Result<T, crate::error::PercyError>
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(crate::error::PercyError::NotRunningError);
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        let semaphore = self.semaphore.clone();
        let pending = self.pending.clone();
        let idle_notify = self.idle_notify.clone();

        let handle = tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            let result = job.await;
            if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle_notify.notify_waiters();
            }
            result
        });

        handle.await.map_err(|e| {
            warn!("snapshot job panicked: {e}");
            crate::error::PercyError::SnapshotDiscoveryError(e.to_string())
        })
    }

    /// Resolves when `active == 0` and the queue is empty.
    pub async fn idle(&self) {
        loop {
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.idle_notify.notified();
            // Re-check after registering interest to avoid missing a
            // notification fired between the load above and this await.
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Waits for current jobs then rejects new pushes. `drain=false` does
    /// not cancel already-running jobs but stops accepting new ones
    /// immediately either way.
    pub async fn stop(&self, drain: bool) {
        self.stopped.store(true, Ordering::SeqCst);
        if drain {
            self.idle().await;
        }
        debug!("snapshot queue stopped (drain={drain})");
    }

    pub fn active_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn idle_resolves_immediately_on_empty_queue() {
        let queue = SnapshotQueue::new(2);
        tokio::time::timeout(Duration::from_millis(100), queue.idle())
            .await
            .expect("idle() should resolve promptly");
    }

    #[tokio::test]
    async fn idle_waits_for_in_flight_jobs() {
        let queue = Arc::new(SnapshotQueue::new(2));
        let queue_clone = queue.clone();
        let handle = tokio::spawn(async move {
            queue_clone
                .push(async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                })
                .await
                .unwrap();
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.active_count(), 1);
        queue.idle().await;
        assert_eq!(queue.active_count(), 0);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn push_rejected_after_stop() {
        let queue = SnapshotQueue::new(1);
        queue.stop(true).await;
        let result = queue.push(async { 1 }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let queue = Arc::new(SnapshotQueue::new(1));
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let queue = queue.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .push(async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
