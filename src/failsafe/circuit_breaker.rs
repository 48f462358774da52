//! Circuit breaker implementation
//!
//! ```text
//! Closed   → Open:     failure_threshold counting failures
//! Open     → HalfOpen: next call after reset_timeout
//! HalfOpen → Closed:   half_open_attempts consecutive successes
//! HalfOpen → Open:     any counting failure
//! ```

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::health::LatencyWindow;
use crate::config::CircuitBreakerConfig;
use crate::{Error, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed (allowing requests)
    Closed,
    /// Circuit is open (blocking requests)
    Open,
    /// Circuit is half-open (allowing trial requests)
    HalfOpen,
}

impl CircuitState {
    /// Label used in logs and metrics
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    const fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of a breaker's state
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    /// Current state
    pub state: CircuitState,
    /// Counting failures since the breaker last closed
    pub failure_count: u32,
    /// When the last failure was observed
    pub last_failure_time: Option<Instant>,
    /// Earliest instant an open breaker admits a trial call
    pub next_attempt_time: Option<Instant>,
    /// Successes in the current half-open trial
    pub consecutive_half_open_successes: u32,
    /// Calls that reached the operation
    pub total_calls: u64,
    /// Calls that succeeded
    pub successful_calls: u64,
    /// Calls that failed, counted or not
    pub failed_calls: u64,
    /// Calls rejected while open
    pub rejected_calls: u64,
    /// When the state last changed
    pub last_state_change: Instant,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            next_attempt_time: None,
            consecutive_half_open_successes: 0,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
            last_state_change: Instant::now(),
        }
    }
}

/// Derived breaker metrics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// `failed_calls / total_calls`
    pub failure_rate: f64,
    /// `successful_calls / total_calls`
    pub success_rate: f64,
    /// Mean over the last 100 response times
    #[serde(with = "humantime_serde")]
    pub average_response_time: Duration,
    /// Time since the last state change
    #[serde(with = "humantime_serde")]
    pub time_in_current_state: Duration,
    /// Counting failures since the breaker last closed
    pub failure_count: u32,
    /// Calls that reached the operation
    pub total_calls: u64,
    /// Calls that succeeded
    pub successful_calls: u64,
    /// Calls that failed
    pub failed_calls: u64,
    /// Calls rejected while open
    pub rejected_calls: u64,
}

struct Inner {
    state: CircuitBreakerState,
    response_times: LatencyWindow,
}

/// Circuit breaker for dependency protection
pub struct CircuitBreaker {
    /// Dependency name
    name: String,
    /// Configuration
    config: CircuitBreakerConfig,
    /// State and response-time window, mutated together
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in the closed state
    #[must_use]
    pub fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        telemetry_metrics::gauge!("resilience_circuit_state", "breaker" => name.to_string())
            .set(CircuitState::Closed.gauge_value());
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitBreakerState::new(),
                response_times: LatencyWindow::default(),
            }),
        }
    }

    /// Breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` through the breaker.
    ///
    /// Fails fast with [`Error::CircuitOpen`] while open. When a per-call
    /// timeout is configured the operation races it and loses with
    /// [`Error::Timeout`].
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.try_acquire()?;

        let started = Instant::now();
        let outcome = match self.config.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    name: self.name.clone(),
                    timeout,
                }),
            },
            None => operation().await,
        };
        let elapsed = started.elapsed();

        match &outcome {
            Ok(_) => self.record_success(elapsed),
            Err(e) => self.record_failure(e, elapsed),
        }
        outcome
    }

    /// Admit a call, moving Open → HalfOpen once the cooldown has elapsed
    fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if inner.state.state == CircuitState::Open {
            let next_attempt = inner.state.next_attempt_time.unwrap_or(now);
            if now < next_attempt {
                inner.state.rejected_calls += 1;
                drop(inner);
                telemetry_metrics::counter!(
                    "resilience_circuit_rejections_total",
                    "breaker" => self.name.clone()
                )
                .increment(1);
                debug!(breaker = %self.name, "Circuit open, rejecting call");
                return Err(Error::CircuitOpen {
                    name: self.name.clone(),
                    remaining: next_attempt - now,
                });
            }
            self.transition_to(&mut inner, CircuitState::HalfOpen);
        }

        inner.state.total_calls += 1;
        Ok(())
    }

    /// Record a successful call
    pub fn record_success(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        inner.response_times.record(elapsed);
        inner.state.successful_calls += 1;

        match inner.state.state {
            CircuitState::Closed => {
                inner.state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.state.consecutive_half_open_successes += 1;
                let successes = inner.state.consecutive_half_open_successes;
                debug!(
                    breaker = %self.name,
                    successes,
                    threshold = self.config.half_open_attempts,
                    "Success in half-open state"
                );
                if successes >= self.config.half_open_attempts {
                    self.transition_to(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                tracing::trace!(breaker = %self.name, "Success recorded in open state (ignored)");
            }
        }
    }

    /// Record a failed call. Failures the classifier rejects are counted
    /// in `failed_calls` but leave the state machine untouched.
    pub fn record_failure(&self, error: &Error, elapsed: Duration) {
        let counts = self
            .config
            .classifier
            .as_ref()
            .is_none_or(|c| c.counts(error));

        let mut inner = self.inner.lock();
        inner.response_times.record(elapsed);
        inner.state.failed_calls += 1;

        if !counts {
            debug!(breaker = %self.name, kind = %error.kind(), "Failure not classified, state unchanged");
            return;
        }

        let now = Instant::now();
        inner.state.last_failure_time = Some(now);

        match inner.state.state {
            CircuitState::Closed => {
                inner.state.failure_count += 1;
                let failures = inner.state.failure_count;
                warn!(
                    breaker = %self.name,
                    failures,
                    threshold = self.config.failure_threshold,
                    error = %error,
                    "Failure in closed state"
                );
                if failures >= self.config.failure_threshold {
                    self.transition_to(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.state.failure_count += 1;
                warn!(breaker = %self.name, error = %error, "Failure in half-open state, reopening circuit");
                self.transition_to(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {
                tracing::trace!(breaker = %self.name, "Failure recorded in open state (ignored)");
            }
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state.state
    }

    /// Full state snapshot
    pub fn snapshot(&self) -> CircuitBreakerState {
        self.inner.lock().state.clone()
    }

    /// Derived metrics
    #[allow(clippy::cast_precision_loss)]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        let s = &inner.state;
        let (failure_rate, success_rate) = if s.total_calls == 0 {
            (0.0, 0.0)
        } else {
            (
                s.failed_calls as f64 / s.total_calls as f64,
                s.successful_calls as f64 / s.total_calls as f64,
            )
        };

        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: s.state,
            failure_rate,
            success_rate,
            average_response_time: inner.response_times.average(),
            time_in_current_state: s.last_state_change.elapsed(),
            failure_count: s.failure_count,
            total_calls: s.total_calls,
            successful_calls: s.successful_calls,
            failed_calls: s.failed_calls,
            rejected_calls: s.rejected_calls,
        }
    }

    /// `true` unless the breaker is open
    pub fn is_available(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Time until an open breaker admits a trial call; zero otherwise
    pub fn remaining_timeout(&self) -> Duration {
        let inner = self.inner.lock();
        match (inner.state.state, inner.state.next_attempt_time) {
            (CircuitState::Open, Some(next)) => next.saturating_duration_since(Instant::now()),
            _ => Duration::ZERO,
        }
    }

    /// Operator override: open the breaker for a full `reset_timeout`
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        warn!(breaker = %self.name, "Circuit breaker forced open");
        self.transition_to(&mut inner, CircuitState::Open);
        // Re-arm the cooldown even if the breaker was already open
        inner.state.next_attempt_time = Some(Instant::now() + self.config.reset_timeout);
    }

    /// Operator override: close the breaker
    pub fn force_closed(&self) {
        let mut inner = self.inner.lock();
        info!(breaker = %self.name, "Circuit breaker forced closed");
        self.transition_to(&mut inner, CircuitState::Closed);
    }

    /// Return to `Closed` with all counters and samples cleared
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitBreakerState::new();
        inner.response_times.clear();
        drop(inner);
        telemetry_metrics::gauge!("resilience_circuit_state", "breaker" => self.name.clone())
            .set(CircuitState::Closed.gauge_value());
        info!(breaker = %self.name, "Circuit breaker reset");
    }

    /// Human-readable status line
    pub fn status_message(&self) -> String {
        let snapshot = self.snapshot();
        match snapshot.state {
            CircuitState::Closed => format!("Dependency '{}' circuit breaker is closed", self.name),
            CircuitState::HalfOpen => format!(
                "Dependency '{}' circuit breaker is half-open, testing recovery ({}/{} successes)",
                self.name, snapshot.consecutive_half_open_successes, self.config.half_open_attempts
            ),
            CircuitState::Open if snapshot.failure_count == 0 => format!(
                "Dependency '{}' circuit breaker is open, retry in {} seconds",
                self.name,
                self.remaining_timeout().as_secs()
            ),
            CircuitState::Open => format!(
                "Dependency '{}' circuit breaker is open after {} failures, retry in {} seconds",
                self.name,
                snapshot.failure_count,
                self.remaining_timeout().as_secs()
            ),
        }
    }

    /// Transition to a new state. Caller holds the lock.
    fn transition_to(&self, inner: &mut Inner, new_state: CircuitState) {
        let old_state = inner.state.state;
        if old_state == new_state {
            return;
        }

        let now = Instant::now();
        let state = &mut inner.state;
        state.state = new_state;
        state.last_state_change = now;

        match new_state {
            CircuitState::Closed => {
                state.failure_count = 0;
                state.consecutive_half_open_successes = 0;
                state.next_attempt_time = None;
                info!(breaker = %self.name, from = %old_state, "Circuit breaker closed");
            }
            CircuitState::Open => {
                state.consecutive_half_open_successes = 0;
                state.next_attempt_time = Some(now + self.config.reset_timeout);
                warn!(
                    breaker = %self.name,
                    from = %old_state,
                    failures = state.failure_count,
                    reset_timeout_ms = self.config.reset_timeout.as_millis(),
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                state.failure_count = 0;
                state.consecutive_half_open_successes = 0;
                debug!(breaker = %self.name, "Circuit breaker half-open");
            }
        }

        telemetry_metrics::counter!(
            "resilience_circuit_transitions_total",
            "breaker" => self.name.clone(),
            "from" => old_state.as_str(),
            "to" => new_state.as_str()
        )
        .increment(1);
        telemetry_metrics::gauge!("resilience_circuit_state", "breaker" => self.name.clone())
            .set(new_state.gauge_value());
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::config::ErrorClassifier;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(failure_threshold: u32, reset_timeout_ms: u64, half_open_attempts: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            reset_timeout: Duration::from_millis(reset_timeout_ms),
            half_open_attempts,
            ..Default::default()
        }
    }

    async fn fail(cb: &CircuitBreaker) -> Result<()> {
        cb.execute(|| async { Err(Error::operation(anyhow::anyhow!("boom"))) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32> {
        cb.execute(|| async { Ok(7) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = CircuitBreaker::new("db", config(3, 1000, 2));

        for _ in 0..2 {
            assert!(fail(&cb).await.is_err());
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 2);

        let before = Instant::now();
        assert!(fail(&cb).await.is_err());

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(
            snapshot.next_attempt_time,
            Some(before + Duration::from_millis(1000))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new("db", config(3, 1000, 2));

        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        succeed(&cb).await.unwrap();
        assert_eq!(cb.snapshot().failure_count, 0);

        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_fails_fast_without_invoking() {
        let cb = CircuitBreaker::new("db", config(1, 1000, 1));
        fail(&cb).await.unwrap_err();

        let invoked = AtomicU32::new(0);
        let err = cb
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(err.is_circuit_open());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.snapshot().rejected_calls, 1);
        assert_eq!(cb.remaining_timeout(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_before_operation_runs() {
        let cb = CircuitBreaker::new("db", config(1, 500, 2));
        fail(&cb).await.unwrap_err();

        tokio::time::advance(Duration::from_millis(500)).await;

        let observed = cb
            .execute(|| async { Ok(cb.state()) })
            .await
            .unwrap();
        assert_eq!(observed, CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("db", config(2, 1000, 3));
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();

        tokio::time::advance(Duration::from_millis(1000)).await;
        succeed(&cb).await.unwrap();
        succeed(&cb).await.unwrap();
        assert_eq!(cb.snapshot().consecutive_half_open_successes, 2);

        fail(&cb).await.unwrap_err();
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.consecutive_half_open_successes, 0);
        assert_eq!(snapshot.failure_count, 1);
        assert!(cb.status_message().contains("open after 1 failures"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let cb = CircuitBreaker::new(
            "slow",
            CircuitBreakerConfig {
                failure_threshold: 1,
                timeout: Some(Duration::from_millis(100)),
                ..Default::default()
            },
        );

        let err = cb
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclassified_failures_do_not_trip() {
        let cb = CircuitBreaker::new(
            "api",
            CircuitBreakerConfig {
                failure_threshold: 1,
                classifier: Some(ErrorClassifier::only(&[ErrorKind::Timeout])),
                ..Default::default()
            },
        );

        for _ in 0..5 {
            let err = fail(&cb).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Operation);
        }

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.failed_calls, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_is_idempotent() {
        let cb = CircuitBreaker::new("db", config(1, 1000, 1));
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        for _ in 0..2 {
            cb.reset();
            let s = cb.snapshot();
            assert_eq!(s.state, CircuitState::Closed);
            assert_eq!(s.failure_count, 0);
            assert_eq!(s.consecutive_half_open_successes, 0);
            assert_eq!(s.total_calls, 0);
            assert_eq!(s.failed_calls, 0);
            assert_eq!(cb.metrics().average_response_time, Duration::ZERO);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_open_and_closed() {
        let cb = CircuitBreaker::new("db", config(5, 2000, 1));

        cb.force_open();
        assert!(!cb.is_available());
        assert!(!cb.status_message().contains("failures"));
        assert!(fail(&cb).await.unwrap_err().is_circuit_open());

        cb.force_closed();
        assert!(cb.is_available());
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_rates() {
        let cb = CircuitBreaker::new("db", config(10, 1000, 1));
        succeed(&cb).await.unwrap();
        succeed(&cb).await.unwrap();
        succeed(&cb).await.unwrap();
        fail(&cb).await.unwrap_err();

        let metrics = cb.metrics();
        assert_eq!(metrics.total_calls, 4);
        assert!((metrics.success_rate - 0.75).abs() < f64::EPSILON);
        assert!((metrics.failure_rate - 0.25).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_message() {
        let cb = CircuitBreaker::new("ledger", config(2, 30_000, 2));
        assert!(cb.status_message().contains("closed"));

        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        let message = cb.status_message();
        assert!(message.contains("Dependency 'ledger'"));
        assert!(message.contains("open after 2 failures"));
        assert!(message.contains("retry in 30 seconds"));
    }
}
