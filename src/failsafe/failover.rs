//! Multi-provider failover with health probing
//!
//! A [`FailoverManager`] owns a prioritized provider list for one logical
//! dependency. Calls go to the current provider and move down the list on
//! failure. A background task probes every provider on an interval and
//! switches the current provider away from unhealthy ones, and back to the
//! primary once it has been healthy for `failback_threshold` rounds.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::health::HealthProbe;
use crate::config::FailoverConfig;
use crate::{Error, Result};

/// Requests kept for latency and error-rate accounting
const HISTORY_CAPACITY: usize = 1000;

/// Window over which per-provider error rates are computed
const ERROR_RATE_WINDOW: Duration = Duration::from_secs(300);

/// Provider snapshot
#[derive(Debug, Clone, Serialize)]
pub struct Provider {
    /// Provider name
    pub name: String,
    /// Result of the last health probe
    pub is_available: bool,
    /// Lower is preferred; the primary is 0
    pub priority: u32,
    /// When the provider was last probed
    pub last_health_check: Option<DateTime<Utc>>,
    /// Failed probes in a row
    pub consecutive_failures: u32,
    /// Healthy probes in a row
    pub consecutive_successes: u32,
    /// Latency of the last probe
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// Failed share of this provider's requests over the last 5 minutes
    pub error_rate: f64,
    /// Free-form annotations
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Provider {
    fn new(name: &str, priority: u32) -> Self {
        Self {
            name: name.to_string(),
            is_available: true,
            priority,
            last_health_check: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            latency: Duration::ZERO,
            error_rate: 0.0,
            metadata: HashMap::new(),
        }
    }
}

/// Per-call routing overrides
#[derive(Debug, Clone, Default)]
pub struct FailoverOptions {
    /// Route to this provider only
    pub forced_provider: Option<String>,
    /// Try the selected provider once and return its error unchanged
    pub skip_failover: bool,
}

/// Failover metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct FailoverMetrics {
    /// Manager name
    pub name: String,
    /// Provider receiving new calls
    pub current_provider: String,
    /// Switches away from the current provider
    pub failover_count: u64,
    /// Switches back to the primary
    pub failback_count: u64,
    /// Provider attempts made
    pub total_requests: u64,
    /// Attempts that succeeded
    pub successful_requests: u64,
    /// Attempts that failed
    pub failed_requests: u64,
    /// Mean attempt latency over the request history
    #[serde(with = "humantime_serde")]
    pub average_latency: Duration,
    /// Providers by priority
    pub providers: Vec<Provider>,
}

#[derive(Debug, Clone)]
struct RequestRecord {
    provider: String,
    success: bool,
    latency: Duration,
    at: Instant,
}

struct Inner {
    /// Sorted by priority
    providers: Vec<Provider>,
    current: String,
    failover_count: u64,
    failback_count: u64,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    history: VecDeque<RequestRecord>,
}

impl Inner {
    fn new(config: &FailoverConfig) -> Self {
        let providers = config
            .providers()
            .zip(0u32..)
            .map(|(name, priority)| Provider::new(name, priority))
            .collect();
        Self {
            providers,
            current: config.primary_provider.clone(),
            failover_count: 0,
            failback_count: 0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    fn provider(&self, name: &str) -> Option<&Provider> {
        self.providers.iter().find(|p| p.name == name)
    }

    fn provider_mut(&mut self, name: &str) -> Option<&mut Provider> {
        self.providers.iter_mut().find(|p| p.name == name)
    }

    /// Best available provider by priority, skipping `exclude`
    fn best_available(&self, exclude: &[String]) -> Option<String> {
        self.providers
            .iter()
            .filter(|p| p.is_available && !exclude.contains(&p.name))
            .min_by_key(|p| p.priority)
            .map(|p| p.name.clone())
    }

    #[allow(clippy::cast_precision_loss)]
    fn error_rate(&self, provider: &str, now: Instant) -> f64 {
        let (total, failed) = self
            .history
            .iter()
            .filter(|r| r.provider == provider && now.duration_since(r.at) <= ERROR_RATE_WINDOW)
            .fold((0u64, 0u64), |(total, failed), r| {
                (total + 1, failed + u64::from(!r.success))
            });
        if total == 0 {
            0.0
        } else {
            failed as f64 / total as f64
        }
    }

    fn average_latency(&self) -> Duration {
        if self.history.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.history.iter().map(|r| r.latency).sum();
        let count = u32::try_from(self.history.len()).unwrap_or(u32::MAX);
        total / count
    }
}

/// Routes calls across a prioritized set of providers
pub struct FailoverManager {
    name: String,
    config: FailoverConfig,
    probe: Arc<dyn HealthProbe>,
    inner: Mutex<Inner>,
    paused: AtomicBool,
    destroyed: AtomicBool,
    shutdown: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl FailoverManager {
    /// Create a manager with the primary as the current provider.
    /// Health checks do not run until [`start_health_checks`](Self::start_health_checks).
    #[must_use]
    pub fn new(name: &str, config: FailoverConfig, probe: Arc<dyn HealthProbe>) -> Self {
        let inner = Inner::new(&config);
        for provider in &inner.providers {
            set_available_gauge(name, &provider.name, true);
        }
        Self {
            name: name.to_string(),
            config,
            probe,
            inner: Mutex::new(inner),
            paused: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            health_task: Mutex::new(None),
        }
    }

    /// Manager name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    /// Provider receiving new calls
    pub fn current_provider(&self) -> String {
        self.inner.lock().current.clone()
    }

    /// Snapshot of one provider
    pub fn provider(&self, name: &str) -> Option<Provider> {
        let inner = self.inner.lock();
        let mut provider = inner.provider(name)?.clone();
        provider.error_rate = inner.error_rate(name, Instant::now());
        Some(provider)
    }

    /// Run `operation` against the current provider, failing over to the
    /// next available one on error.
    ///
    /// `operation` receives the provider name and may be invoked up to
    /// `max_retries` times, once per distinct provider.
    ///
    /// # Errors
    ///
    /// - [`Error::Shutdown`] after [`destroy`](Self::destroy)
    /// - [`Error::ProviderNotFound`] for an unknown forced provider
    /// - the operation's own error when a provider is forced or failover is skipped
    /// - [`Error::AllProvidersExhausted`] otherwise
    pub async fn execute<T, F, Fut>(&self, mut operation: F, options: &FailoverOptions) -> Result<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(Error::Shutdown(self.name.clone()));
        }

        let single_shot = options.forced_provider.is_some() || options.skip_failover;
        let mut provider = match &options.forced_provider {
            Some(forced) => {
                if self.inner.lock().provider(forced).is_none() {
                    return Err(Error::ProviderNotFound(forced.clone()));
                }
                forced.clone()
            }
            None => self.current_provider(),
        };

        let mut tried: Vec<String> = Vec::new();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            tried.push(provider.clone());

            let started = Instant::now();
            let result = operation(provider.clone()).await;
            self.record_request(&provider, result.is_ok(), started.elapsed());

            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) if single_shot => return Err(e),
                Err(e) => e,
            };

            let next = if attempts < self.config.max_retries {
                self.inner.lock().best_available(&tried)
            } else {
                None
            };
            let Some(next) = next else {
                warn!(
                    failover = %self.name,
                    attempts,
                    error = %error,
                    "All providers exhausted"
                );
                return Err(Error::AllProvidersExhausted {
                    name: self.name.clone(),
                    attempts,
                    source: Some(Box::new(error)),
                });
            };

            warn!(
                failover = %self.name,
                from = %provider,
                to = %next,
                error = %error,
                "Provider failed, trying next"
            );
            tokio::time::sleep(self.config.retry_delay).await;
            provider = next;
        }
    }

    fn record_request(&self, provider: &str, success: bool, latency: Duration) {
        let mut inner = self.inner.lock();
        inner.total_requests += 1;
        if success {
            inner.successful_requests += 1;
        } else {
            inner.failed_requests += 1;
        }
        if inner.history.len() >= HISTORY_CAPACITY {
            inner.history.pop_front();
        }
        inner.history.push_back(RequestRecord {
            provider: provider.to_string(),
            success,
            latency,
            at: Instant::now(),
        });
    }

    /// Probe every provider once, concurrently, then apply failover and
    /// failback decisions.
    pub async fn check_health(&self) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }

        let names: Vec<String> = self
            .inner
            .lock()
            .providers
            .iter()
            .map(|p| p.name.clone())
            .collect();
        let deadline = self.config.health_check_timeout;

        let probes = names.iter().map(|provider| async move {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(deadline, self.probe.check(provider)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    name: provider.clone(),
                    timeout: deadline,
                }),
            };
            (provider, outcome, started.elapsed())
        });
        let results = join_all(probes).await;

        let checked_at = Utc::now();
        let mut inner = self.inner.lock();
        for (name, outcome, latency) in results {
            let Some(provider) = inner.provider_mut(name) else {
                continue;
            };
            let was_available = provider.is_available;
            provider.last_health_check = Some(checked_at);
            provider.latency = latency;
            match outcome {
                Ok(()) => {
                    provider.is_available = true;
                    provider.consecutive_successes += 1;
                    provider.consecutive_failures = 0;
                }
                Err(e) => {
                    provider.is_available = false;
                    provider.consecutive_failures += 1;
                    provider.consecutive_successes = 0;
                    debug!(failover = %self.name, provider = %name, error = %e, "Health probe failed");
                }
            }
            if was_available != provider.is_available {
                info!(
                    failover = %self.name,
                    provider = %name,
                    available = provider.is_available,
                    "Provider availability changed"
                );
                set_available_gauge(&self.name, name, provider.is_available);
            }
        }
        self.evaluate(&mut inner);
    }

    /// Fail over away from an unavailable current provider, or fail back
    /// to a recovered primary. Caller holds the lock.
    fn evaluate(&self, inner: &mut Inner) {
        let primary = &self.config.primary_provider;
        let current_available = inner
            .provider(&inner.current)
            .is_some_and(|p| p.is_available);

        if !current_available {
            let exclude = [inner.current.clone()];
            if let Some(next) = inner.best_available(&exclude) {
                self.switch_to(inner, next, SwitchKind::Failover);
            } else {
                warn!(failover = %self.name, "No available provider to fail over to");
            }
            return;
        }

        if inner.current != *primary {
            let recovered = inner.provider(primary).is_some_and(|p| {
                p.is_available && p.consecutive_successes >= self.config.failback_threshold
            });
            if recovered {
                self.switch_to(inner, primary.clone(), SwitchKind::Failback);
            }
        }
    }

    fn switch_to(&self, inner: &mut Inner, provider: String, kind: SwitchKind) {
        let from = std::mem::replace(&mut inner.current, provider);
        match kind {
            SwitchKind::Failover => {
                inner.failover_count += 1;
                warn!(failover = %self.name, from = %from, to = %inner.current, "Failed over");
                telemetry_metrics::counter!(
                    "resilience_failover_total",
                    "failover" => self.name.clone(),
                    "from" => from,
                    "to" => inner.current.clone()
                )
                .increment(1);
            }
            SwitchKind::Failback => {
                inner.failback_count += 1;
                info!(failover = %self.name, from = %from, to = %inner.current, "Failed back to primary");
                telemetry_metrics::counter!(
                    "resilience_failback_total",
                    "failover" => self.name.clone(),
                    "from" => from
                )
                .increment(1);
            }
        }
    }

    /// Switch to `target`, or to the best available provider other than
    /// the current one.
    ///
    /// # Errors
    ///
    /// [`Error::ProviderNotFound`] for an unknown target,
    /// [`Error::AllProvidersExhausted`] when no other provider is available.
    pub fn force_failover(&self, target: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock();
        let next = match target {
            Some(name) => {
                if inner.provider(name).is_none() {
                    return Err(Error::ProviderNotFound(name.to_string()));
                }
                if inner.current == name {
                    return Ok(());
                }
                name.to_string()
            }
            None => {
                let exclude = [inner.current.clone()];
                inner
                    .best_available(&exclude)
                    .ok_or_else(|| Error::AllProvidersExhausted {
                        name: self.name.clone(),
                        attempts: 0,
                        source: None,
                    })?
            }
        };
        self.switch_to(&mut inner, next, SwitchKind::Failover);
        Ok(())
    }

    /// Switch back to the primary. No-op when it is already current.
    pub fn force_failback(&self) {
        let mut inner = self.inner.lock();
        if inner.current != self.config.primary_provider {
            self.switch_to(&mut inner, self.config.primary_provider.clone(), SwitchKind::Failback);
        }
    }

    /// Spawn the periodic health-check task. Subsequent calls are no-ops.
    ///
    /// The task holds a weak reference and exits once the manager is
    /// dropped or destroyed.
    pub fn start_health_checks(self: &Arc<Self>) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let mut task = self.health_task.lock();
        if task.is_some() {
            return;
        }

        let manager = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let interval = self.config.health_check_interval;
        let name = self.name.clone();

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        if !manager.paused.load(Ordering::Acquire) {
                            manager.check_health().await;
                        }
                    }
                    () = shutdown.cancelled() => {
                        break;
                    }
                }
            }
            debug!(failover = %name, "Health check task stopped");
        }));
        debug!(failover = %self.name, interval_ms = interval.as_millis(), "Health checks started");
    }

    /// Skip probe rounds until resumed
    pub fn pause_health_checks(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Resume probe rounds
    pub fn resume_health_checks(&self) {
        self.paused.store(false, Ordering::Release);
    }

    /// `true` while probe rounds are skipped
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Stop the health-check task and release request history. Later
    /// calls to [`execute`](Self::execute) fail with [`Error::Shutdown`].
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
        }
        self.inner.lock().history = VecDeque::new();
        info!(failover = %self.name, "Failover manager destroyed");
    }

    /// `true` once [`destroy`](Self::destroy) has run
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Attach a metadata value to a provider
    pub fn set_provider_metadata(
        &self,
        provider: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .provider_mut(provider)
            .ok_or_else(|| Error::ProviderNotFound(provider.to_string()))?;
        entry.metadata.insert(key.to_string(), value);
        Ok(())
    }

    /// `true` while at least one provider is available
    pub fn is_healthy(&self) -> bool {
        self.inner.lock().providers.iter().any(|p| p.is_available)
    }

    /// Metrics snapshot
    pub fn metrics(&self) -> FailoverMetrics {
        let inner = self.inner.lock();
        let now = Instant::now();
        let providers = inner
            .providers
            .iter()
            .map(|p| {
                let mut provider = p.clone();
                provider.error_rate = inner.error_rate(&p.name, now);
                provider
            })
            .collect();

        FailoverMetrics {
            name: self.name.clone(),
            current_provider: inner.current.clone(),
            failover_count: inner.failover_count,
            failback_count: inner.failback_count,
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            average_latency: inner.average_latency(),
            providers,
        }
    }

    /// Restore the primary, mark every provider available and clear
    /// counters and history. Provider metadata is kept.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let mut fresh = Inner::new(&self.config);
        for provider in &mut fresh.providers {
            if let Some(old) = inner.provider_mut(&provider.name) {
                provider.metadata = std::mem::take(&mut old.metadata);
            }
            set_available_gauge(&self.name, &provider.name, true);
        }
        *inner = fresh;
        info!(failover = %self.name, "Failover manager reset");
    }
}

impl Drop for FailoverManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for FailoverManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverManager")
            .field("name", &self.name)
            .field("current_provider", &self.current_provider())
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy)]
enum SwitchKind {
    Failover,
    Failback,
}

fn set_available_gauge(failover: &str, provider: &str, available: bool) {
    telemetry_metrics::gauge!(
        "resilience_provider_available",
        "failover" => failover.to_string(),
        "provider" => provider.to_string()
    )
    .set(if available { 1.0 } else { 0.0 });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::failsafe::health::NoopProbe;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU32;

    type DownSet = Arc<Mutex<HashSet<String>>>;

    fn config(failback_threshold: u32) -> FailoverConfig {
        FailoverConfig {
            primary_provider: "a".into(),
            fallback_providers: vec!["b".into(), "c".into()],
            health_check_interval: Duration::from_secs(1),
            health_check_timeout: Duration::from_millis(200),
            max_retries: 3,
            retry_delay: Duration::from_millis(10),
            failback_threshold,
        }
    }

    fn switchable(failback_threshold: u32) -> (Arc<FailoverManager>, DownSet) {
        let down: DownSet = Arc::new(Mutex::new(HashSet::new()));
        let probe_down = Arc::clone(&down);
        let probe = move |provider: String| {
            let down = Arc::clone(&probe_down);
            async move {
                if down.lock().contains(&provider) {
                    Err(Error::operation(anyhow::anyhow!("{provider} down")))
                } else {
                    Ok(())
                }
            }
        };
        let manager = FailoverManager::new("payments", config(failback_threshold), Arc::new(probe));
        (Arc::new(manager), down)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_over_on_unhealthy_probe() {
        let (fm, down) = switchable(3);
        assert_eq!(fm.current_provider(), "a");

        down.lock().insert("a".into());
        fm.check_health().await;

        assert_eq!(fm.current_provider(), "b");
        let metrics = fm.metrics();
        assert_eq!(metrics.failover_count, 1);
        let a = fm.provider("a").unwrap();
        assert!(!a.is_available);
        assert_eq!(a.consecutive_failures, 1);
        assert!(a.last_health_check.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_back_after_threshold() {
        let (fm, down) = switchable(3);
        down.lock().insert("a".into());
        fm.check_health().await;
        assert_eq!(fm.current_provider(), "b");

        down.lock().clear();
        fm.check_health().await;
        fm.check_health().await;
        assert_eq!(fm.current_provider(), "b");

        fm.check_health().await;
        assert_eq!(fm.current_provider(), "a");
        assert_eq!(fm.metrics().failback_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_moves_to_next_provider() {
        let fm = FailoverManager::new("payments", config(3), Arc::new(NoopProbe));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let result = fm
            .execute(
                |provider| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.lock().push(provider.clone());
                        if provider == "a" {
                            Err(Error::operation(anyhow::anyhow!("a failed")))
                        } else {
                            Ok(provider)
                        }
                    }
                },
                &FailoverOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(result, "b");
        assert_eq!(*seen.lock(), vec!["a".to_string(), "b".to_string()]);
        let metrics = fm.metrics();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.failed_requests, 1);
        assert_eq!(metrics.providers[0].error_rate, 1.0);
        assert_eq!(metrics.providers[1].error_rate, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_carries_last_error() {
        let fm = FailoverManager::new("payments", config(3), Arc::new(NoopProbe));
        let calls = AtomicU32::new(0);

        let err = fm
            .execute(
                |provider| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err::<(), _>(Error::operation(anyhow::anyhow!("{provider} failed"))) }
                },
                &FailoverOptions::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            Error::AllProvidersExhausted { attempts, source, .. } => {
                assert_eq!(attempts, 3);
                assert!(source.unwrap().to_string().contains("c failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_provider_returns_original_error() {
        let fm = FailoverManager::new("payments", config(3), Arc::new(NoopProbe));
        let options = FailoverOptions {
            forced_provider: Some("c".into()),
            skip_failover: false,
        };

        let err = fm
            .execute(
                |_| async { Err::<(), _>(Error::operation(anyhow::anyhow!("boom"))) },
                &options,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Operation);
        assert_eq!(fm.metrics().total_requests, 1);

        let unknown = FailoverOptions {
            forced_provider: Some("z".into()),
            skip_failover: false,
        };
        let err = fm.execute(|_| async { Ok(()) }, &unknown).await.unwrap_err();
        assert!(matches!(err, Error::ProviderNotFound(ref name) if name == "z"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_checks_and_destroy() {
        let (fm, down) = switchable(3);
        down.lock().insert("a".into());
        fm.start_health_checks();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fm.current_provider(), "b");

        fm.destroy();
        let err = fm.execute(|_| async { Ok(()) }, &FailoverOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_checks_do_not_probe() {
        let (fm, down) = switchable(3);
        down.lock().insert("a".into());
        fm.pause_health_checks();
        fm.start_health_checks();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(fm.current_provider(), "a");

        fm.resume_health_checks();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fm.current_provider(), "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_and_reset() {
        let fm = FailoverManager::new("payments", config(3), Arc::new(NoopProbe));
        fm.force_failover(None).unwrap();
        assert_eq!(fm.current_provider(), "b");
        fm.force_failover(Some("c")).unwrap();
        assert_eq!(fm.current_provider(), "c");
        assert!(fm.force_failover(Some("z")).is_err());

        fm.force_failback();
        assert_eq!(fm.current_provider(), "a");

        fm.set_provider_metadata("b", "region", serde_json::json!("eu-west-1"))
            .unwrap();
        fm.reset();
        let metrics = fm.metrics();
        assert_eq!(metrics.failover_count, 0);
        assert_eq!(metrics.failback_count, 0);
        assert_eq!(metrics.current_provider, "a");
        assert_eq!(
            metrics.providers[1].metadata.get("region"),
            Some(&serde_json::json!("eu-west-1"))
        );
        assert!(fm.is_healthy());
    }

    #[test]
    fn test_forcing_current_provider_is_noop() {
        let fm = FailoverManager::new("payments", config(3), Arc::new(NoopProbe));
        fm.force_failover(Some("a")).unwrap();
        assert_eq!(fm.current_provider(), "a");
        assert_eq!(fm.metrics().failover_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_rate_window_and_history_cap() {
        let fm = FailoverManager::new("payments", config(3), Arc::new(NoopProbe));
        fm.record_request("a", false, Duration::from_millis(5));
        assert_eq!(fm.provider("a").unwrap().error_rate, 1.0);

        tokio::time::sleep(ERROR_RATE_WINDOW + Duration::from_secs(1)).await;
        assert_eq!(fm.provider("a").unwrap().error_rate, 0.0);

        for _ in 0..HISTORY_CAPACITY + 500 {
            fm.record_request("b", true, Duration::from_millis(5));
        }
        assert_eq!(fm.inner.lock().history.len(), HISTORY_CAPACITY);
        let metrics = fm.metrics();
        assert_eq!(metrics.total_requests, 1501);
        assert_eq!(metrics.failed_requests, 1);
    }
}
