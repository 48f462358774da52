//! Retry logic with exponential backoff

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::time::sleep;
use tracing::debug;

use crate::Result;
use crate::config::RetryConfig;

/// Retry policy
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Maximum delay
    pub max_delay: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Randomize delays
    pub jitter: bool,
    stats: Arc<RetryStats>,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
            stats: Arc::new(RetryStats::default()),
        }
    }

    /// Un-jittered delay to wait after attempt `attempt` (1-based) fails:
    /// `min(base_delay × multiplier^(attempt-1), max_delay)`
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let delay_nanos = self.base_delay.as_nanos() as f64 * factor;
        #[allow(clippy::cast_precision_loss)]
        let max_nanos = self.max_delay.as_nanos() as f64;
        if !delay_nanos.is_finite() || delay_nanos >= max_nanos {
            return self.max_delay;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay_nanos = delay_nanos.round() as u64;
        Duration::from_nanos(delay_nanos)
    }

    /// Delay to wait after attempt `attempt` fails, jitter applied
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        if self.jitter {
            delay.mul_f64(rand::rng().random_range(0.5..=1.0))
        } else {
            delay
        }
    }

    /// Accumulated retry statistics
    #[must_use]
    pub fn stats(&self) -> RetryMetrics {
        self.stats.snapshot()
    }

    /// Clear retry statistics
    pub fn reset_stats(&self) {
        self.stats.reset();
    }
}

/// Execute a future with retry logic.
///
/// `f` receives the 1-based attempt number. Every error is retried until
/// `max_attempts` is reached; the last error is then returned.
///
/// # Errors
///
/// Returns the last error from `f` if all attempts are exhausted.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, name: &str, mut f: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let stats = &policy.stats;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        stats.total_attempts.fetch_add(1, Ordering::Relaxed);

        match f(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    stats.successful_retries.fetch_add(1, Ordering::Relaxed);
                    debug!(operation = name, attempt, "Succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= policy.max_attempts {
                    stats.failed_retries.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        operation = name,
                        attempts = attempt,
                        error = %e,
                        "Max retry attempts reached"
                    );
                    return Err(e);
                }

                let delay = policy.delay_for_attempt(attempt);
                stats.record_delay(delay);
                telemetry_metrics::counter!(
                    "resilience_retries_total",
                    "resource" => name.to_string(),
                    "kind" => e.kind().as_str()
                )
                .increment(1);
                debug!(
                    operation = name,
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "Retrying after backoff"
                );
                sleep(delay).await;
            }
        }
    }
}

#[derive(Debug, Default)]
struct RetryStats {
    total_attempts: AtomicU64,
    successful_retries: AtomicU64,
    failed_retries: AtomicU64,
    delays: AtomicU64,
    total_delay_micros: AtomicU64,
}

impl RetryStats {
    fn record_delay(&self, delay: Duration) {
        self.delays.fetch_add(1, Ordering::Relaxed);
        self.total_delay_micros.fetch_add(
            u64::try_from(delay.as_micros()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    fn snapshot(&self) -> RetryMetrics {
        let delays = self.delays.load(Ordering::Relaxed);
        let total = self.total_delay_micros.load(Ordering::Relaxed);
        RetryMetrics {
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
            successful_retries: self.successful_retries.load(Ordering::Relaxed),
            failed_retries: self.failed_retries.load(Ordering::Relaxed),
            average_retry_delay: if delays == 0 {
                Duration::ZERO
            } else {
                Duration::from_micros(total / delays)
            },
        }
    }

    fn reset(&self) {
        self.total_attempts.store(0, Ordering::Relaxed);
        self.successful_retries.store(0, Ordering::Relaxed);
        self.failed_retries.store(0, Ordering::Relaxed);
        self.delays.store(0, Ordering::Relaxed);
        self.total_delay_micros.store(0, Ordering::Relaxed);
    }
}

/// Retry statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryMetrics {
    /// Attempts made, first attempts included
    pub total_attempts: u64,
    /// Calls that succeeded after at least one retry
    pub successful_retries: u64,
    /// Calls that exhausted every attempt
    pub failed_retries: u64,
    /// Mean delay slept between attempts
    #[serde(with = "humantime_serde")]
    pub average_retry_delay: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use pretty_assertions::assert_eq;

    fn policy(jitter: bool) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            jitter,
        })
    }

    #[test]
    fn test_backoff_schedule() {
        let p = policy(false);
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(200));
        // Delay before attempt 4
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(p.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(p.delay_for_attempt(5), Duration::from_millis(1000));
        assert_eq!(p.delay_for_attempt(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_bounds() {
        let p = policy(true);
        for _ in 0..200 {
            let d = p.delay_for_attempt(3);
            assert!(d >= Duration::from_millis(200), "{d:?}");
            assert!(d <= Duration::from_millis(400), "{d:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let p = policy(false);
        let started = tokio::time::Instant::now();

        let result = with_retry(&p, "db", |attempt| async move {
            if attempt < 3 {
                Err(Error::operation(anyhow::anyhow!("transient")))
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        // 100ms + 200ms of backoff
        assert_eq!(started.elapsed(), Duration::from_millis(300));

        let stats = p.stats();
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.successful_retries, 1);
        assert_eq!(stats.failed_retries, 0);
        assert_eq!(stats.average_retry_delay, Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_last_error_when_exhausted() {
        let p = policy(false);

        let err = with_retry(&p, "db", |attempt| async move {
            Err::<(), _>(Error::operation(anyhow::anyhow!("failure #{attempt}")))
        })
        .await
        .unwrap_err();

        assert!(err.to_string().contains("failure #4"));
        let stats = p.stats();
        assert_eq!(stats.total_attempts, 4);
        assert_eq!(stats.failed_retries, 1);

        p.reset_stats();
        assert_eq!(p.stats(), RetryMetrics::default());
    }
}
