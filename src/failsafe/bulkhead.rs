//! Bulkhead admission control
//!
//! At most `max_concurrent` calls hold a permit. Admitted plus waiting calls
//! are capped at `2 × max_concurrent`; waiters are served in FIFO order
//! (tokio's semaphore is fair) and anything beyond the cap is rejected
//! immediately. A waiter that is not admitted within
//! `max_wait_time` gives up and leaves the queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::BulkheadConfig;
use crate::{Error, Result};

/// Concurrency limiter with a bounded wait queue
#[derive(Debug)]
pub struct Bulkhead {
    name: String,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    queued: AtomicUsize,
    admitted: AtomicU64,
    rejected: AtomicU64,
    wait_timeouts: AtomicU64,
}

/// Admission permit; dropping it admits the next waiter
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

/// Decrements the queue depth when a waiter leaves, however it leaves
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Bulkhead {
    /// Create a bulkhead
    #[must_use]
    pub fn new(name: &str, config: BulkheadConfig) -> Self {
        let permits = config.max_concurrent.max(1);
        Self {
            name: name.to_string(),
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            queued: AtomicUsize::new(0),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            wait_timeouts: AtomicU64::new(0),
        }
    }

    /// Wait for admission.
    ///
    /// # Errors
    ///
    /// [`Error::BulkheadRejected`] when the queue is full,
    /// [`Error::BulkheadWaitTimeout`] when `max_wait_time` elapses first.
    pub async fn acquire(&self) -> Result<BulkheadPermit> {
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            self.admitted.fetch_add(1, Ordering::Relaxed);
            return Ok(BulkheadPermit { _permit: permit });
        }

        let max_queue = self.config.max_queue();
        let reserved = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                (depth < max_queue).then_some(depth + 1)
            });
        if reserved.is_err() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            telemetry_metrics::counter!(
                "resilience_bulkhead_rejections_total",
                "resource" => self.name.clone()
            )
            .increment(1);
            warn!(resource = %self.name, max_queue, "Bulkhead full, rejecting call");
            return Err(Error::BulkheadRejected(self.name.clone()));
        }
        let _slot = QueueSlot(&self.queued);

        let started = Instant::now();
        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        match tokio::time::timeout(self.config.max_wait_time, acquire).await {
            Ok(Ok(permit)) => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
                debug!(
                    resource = %self.name,
                    waited_ms = started.elapsed().as_millis(),
                    "Admitted from bulkhead queue"
                );
                Ok(BulkheadPermit { _permit: permit })
            }
            Ok(Err(_closed)) => Err(Error::Shutdown(self.name.clone())),
            Err(_) => {
                self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
                telemetry_metrics::counter!(
                    "resilience_bulkhead_wait_timeouts_total",
                    "resource" => self.name.clone()
                )
                .increment(1);
                warn!(resource = %self.name, "Bulkhead wait timed out");
                Err(Error::BulkheadWaitTimeout {
                    name: self.name.clone(),
                    waited: started.elapsed(),
                })
            }
        }
    }

    /// Calls currently holding a permit
    pub fn active(&self) -> usize {
        self.config
            .max_concurrent
            .max(1)
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Calls currently waiting for admission
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// `true` when both the permits and the queue are exhausted
    pub fn is_saturated(&self) -> bool {
        self.semaphore.available_permits() == 0 && self.queued() >= self.config.max_queue()
    }

    /// Occupancy snapshot
    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            max_concurrent: self.config.max_concurrent,
            max_queue: self.config.max_queue(),
            active: self.active(),
            queued: self.queued(),
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Clear counters. Permits and waiters are unaffected.
    pub fn reset_stats(&self) {
        self.admitted.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
        self.wait_timeouts.store(0, Ordering::Relaxed);
    }
}

/// Bulkhead occupancy snapshot
#[derive(Debug, Clone, Serialize)]
pub struct BulkheadMetrics {
    /// Permit count
    pub max_concurrent: usize,
    /// Queue bound
    pub max_queue: usize,
    /// Calls holding a permit
    pub active: usize,
    /// Calls waiting
    pub queued: usize,
    /// Calls admitted
    pub admitted: u64,
    /// Calls rejected because the queue was full
    pub rejected: u64,
    /// Calls that gave up waiting
    pub wait_timeouts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn bulkhead(max_concurrent: usize, wait_ms: u64) -> Arc<Bulkhead> {
        Arc::new(Bulkhead::new(
            "db",
            BulkheadConfig {
                max_concurrent,
                max_wait_time: Duration::from_millis(wait_ms),
            },
        ))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_queues_then_rejects() {
        let bh = bulkhead(2, 10_000);

        let first = bh.acquire().await.unwrap();
        let second = bh.acquire().await.unwrap();
        assert_eq!(bh.active(), 2);

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let bh = Arc::clone(&bh);
                tokio::spawn(async move { bh.acquire().await.map(|_| ()) })
            })
            .collect();
        settle().await;
        assert_eq!(bh.queued(), 2);
        assert!(bh.is_saturated());

        let err = bh.acquire().await.unwrap_err();
        assert!(matches!(err, Error::BulkheadRejected(ref name) if name == "db"));

        drop(first);
        drop(second);
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }

        let metrics = bh.metrics();
        assert_eq!(metrics.admitted, 4);
        assert_eq!(metrics.rejected, 1);
        assert_eq!(metrics.queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_leaves_queue() {
        let bh = bulkhead(1, 50);
        let _held = bh.acquire().await.unwrap();

        let err = bh.acquire().await.unwrap_err();
        match err {
            Error::BulkheadWaitTimeout { waited, .. } => {
                assert_eq!(waited, Duration::from_millis(50));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(bh.queued(), 0);
        assert_eq!(bh.metrics().wait_timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_dispatches_fifo() {
        let bh = bulkhead(2, 10_000);
        let held = bh.acquire().await.unwrap();
        let other = bh.acquire().await.unwrap();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..2 {
            let bh = Arc::clone(&bh);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _permit = bh.acquire().await.unwrap();
                order.lock().push(i);
            }));
            settle().await;
        }

        assert_eq!(bh.queued(), 2);

        // The oldest waiter takes the first released slot
        drop(held);
        settle().await;
        assert_eq!(order.lock().first(), Some(&0));

        drop(other);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1]);
    }
}
