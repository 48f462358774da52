//! Provider health probing and latency tracking
//!
//! - [`HealthProbe`]: injected liveness check, invoked by the failover
//!   manager's health-check task once per provider per round
//! - [`LatencyWindow`]: bounded sliding window of response-time samples

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// Default number of samples kept by a [`LatencyWindow`]
pub const DEFAULT_WINDOW_CAPACITY: usize = 100;

/// Liveness check for a single provider.
///
/// An `Ok(())` marks the provider healthy; any error marks it unhealthy.
/// Closures of the form `Fn(String) -> impl Future<Output = Result<()>>`
/// implement this trait directly.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe `provider`
    async fn check(&self, provider: &str) -> Result<()>;
}

#[async_trait]
impl<F, Fut> HealthProbe for F
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn check(&self, provider: &str) -> Result<()> {
        (self)(provider.to_string()).await
    }
}

/// Probe that always reports healthy.
///
/// Used when no liveness check has been registered for a resource, so that
/// failover is driven by per-call outcomes only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProbe;

#[async_trait]
impl HealthProbe for NoopProbe {
    async fn check(&self, _provider: &str) -> Result<()> {
        Ok(())
    }
}

/// Bounded FIFO window of latency samples
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl LatencyWindow {
    /// Create a window holding at most `capacity` samples
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record a sample, evicting the oldest when full
    pub fn record(&mut self, latency: Duration) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
    }

    /// Mean of the retained samples, zero when empty
    #[must_use]
    pub fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().sum();
        #[allow(clippy::cast_possible_truncation)]
        let count = self.samples.len() as u32;
        total / count
    }

    /// Number of retained samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// `true` when no samples are retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Drop all samples
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_window_average() {
        let mut window = LatencyWindow::new(10);
        assert_eq!(window.average(), Duration::ZERO);

        window.record(Duration::from_millis(10));
        window.record(Duration::from_millis(20));
        window.record(Duration::from_millis(30));

        assert_eq!(window.len(), 3);
        assert_eq!(window.average(), Duration::from_millis(20));
    }

    #[test]
    fn test_latency_window_capacity() {
        let mut window = LatencyWindow::new(5);

        for i in 1..=10 {
            window.record(Duration::from_millis(i * 10));
        }

        // Keeps 60, 70, 80, 90, 100
        assert_eq!(window.len(), 5);
        assert_eq!(window.average(), Duration::from_millis(80));

        window.clear();
        assert!(window.is_empty());
    }

    #[tokio::test]
    async fn test_closure_probe() {
        let probe = |provider: String| async move {
            if provider == "down" {
                Err(crate::Error::operation(anyhow::anyhow!("connection refused")))
            } else {
                Ok(())
            }
        };

        assert!(probe.check("up").await.is_ok());
        assert!(probe.check("down").await.is_err());
        assert!(NoopProbe.check("anything").await.is_ok());
    }
}
