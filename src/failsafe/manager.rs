//! Per-resource resilience pipeline
//!
//! ```text
//! cache → bulkhead → retry → timeout → circuit breaker → failover → operation
//! ```
//!
//! Every stage except the breaker and the retry loop is optional and
//! enabled by its sub-config in [`ResilienceConfig`].

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};

use super::bulkhead::{Bulkhead, BulkheadMetrics, BulkheadPermit};
use super::circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics};
use super::failover::{FailoverManager, FailoverMetrics, FailoverOptions};
use super::health::NoopProbe;
use super::retry::{RetryMetrics, RetryPolicy, with_retry};
use crate::cache::{CacheStatsSnapshot, TtlCache};
use crate::config::{ResilienceConfig, RetryConfig};
use crate::{Error, Result};

/// What the operation is being asked to do on this invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based retry attempt
    pub number: u32,
    /// Provider chosen by failover, or the forced provider when no
    /// failover is configured
    pub provider: Option<String>,
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Key for the result cache
    pub cache_key: Option<String>,
    /// Route to this provider only
    pub forced_provider: Option<String>,
    /// Bypass the cache for both lookup and store
    pub skip_cache: bool,
    /// Try a single provider and return its error unchanged
    pub skip_failover: bool,
    /// Caller context, recorded on the execution span
    pub context: HashMap<String, String>,
}

impl ExecuteOptions {
    /// Cache the result under `key`
    #[must_use]
    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Route to `provider` only
    #[must_use]
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.forced_provider = Some(provider.into());
        self
    }

    /// Bypass the cache
    #[must_use]
    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    /// Disable provider failover for this call
    #[must_use]
    pub fn skip_failover(mut self) -> Self {
        self.skip_failover = true;
        self
    }

    /// Add a context entry
    #[must_use]
    pub fn context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Default)]
struct TimeoutStats {
    total: AtomicU64,
    timeouts: AtomicU64,
}

/// Timeout stage counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimeoutMetrics {
    /// Attempts raced against the deadline
    pub total: u64,
    /// Attempts that lost
    pub timeouts: u64,
}

/// Aggregated metrics for one resource
#[derive(Debug, Clone, Serialize)]
pub struct ResilienceMetrics {
    /// Resource name
    pub name: String,
    /// Breaker metrics
    pub circuit_breaker: CircuitBreakerMetrics,
    /// Failover metrics, when failover is configured
    pub failover: Option<FailoverMetrics>,
    /// Retry counters
    pub retry: RetryMetrics,
    /// Timeout counters
    pub timeout: TimeoutMetrics,
    /// Bulkhead occupancy, when a bulkhead is configured
    pub bulkhead: Option<BulkheadMetrics>,
    /// Cache statistics, when a cache is configured
    pub cache: Option<CacheStatsSnapshot>,
    /// Fallback invocations
    pub fallbacks: u64,
}

/// Health of one pipeline stage
#[derive(Debug, Clone, Serialize)]
pub struct SubsystemHealth {
    /// Stage verdict
    pub healthy: bool,
    /// Human-readable detail
    pub detail: String,
}

/// Consolidated health verdict
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Resource name
    pub name: String,
    /// `true` when every subsystem is healthy
    pub healthy: bool,
    /// Per-stage detail, keyed by stage name
    pub subsystems: BTreeMap<String, SubsystemHealth>,
}

/// Composes every resilience stage for one named resource
pub struct ResilienceManager {
    name: String,
    config: ResilienceConfig,
    circuit_breaker: Arc<CircuitBreaker>,
    failover: Option<Arc<FailoverManager>>,
    retry: RetryPolicy,
    bulkhead: Option<Bulkhead>,
    cache: Option<TtlCache>,
    timeouts: TimeoutStats,
    fallbacks: AtomicU64,
}

impl ResilienceManager {
    /// Build a manager that owns its breaker and failover manager.
    ///
    /// Failover health checks are not started; use a
    /// [`ResilienceRegistry`](crate::ResilienceRegistry) to share
    /// components and run probes.
    #[must_use]
    pub fn new(name: &str, config: ResilienceConfig) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            name,
            config.circuit_breaker.clone().unwrap_or_default(),
        ));
        let failover = config.failover.clone().map(|failover| {
            Arc::new(FailoverManager::new(name, failover, Arc::new(NoopProbe)))
        });
        Self::with_components(name, config, breaker, failover)
    }

    /// Build a manager around existing components
    #[must_use]
    pub fn with_components(
        name: &str,
        config: ResilienceConfig,
        circuit_breaker: Arc<CircuitBreaker>,
        failover: Option<Arc<FailoverManager>>,
    ) -> Self {
        // Without a retry config every call gets a single attempt
        let retry = RetryPolicy::new(config.retry.as_ref().unwrap_or(&RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        }));
        let bulkhead = config
            .bulkhead
            .as_ref()
            .map(|bulkhead| Bulkhead::new(name, bulkhead.clone()));
        let cache = config.cache.as_ref().map(|cache| TtlCache::new(name, cache));

        Self {
            name: name.to_string(),
            config,
            circuit_breaker,
            failover,
            retry,
            bulkhead,
            cache,
            timeouts: TimeoutStats::default(),
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Resource name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// The breaker guarding every attempt
    #[must_use]
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    /// The failover manager, when configured
    #[must_use]
    pub fn failover(&self) -> Option<&Arc<FailoverManager>> {
        self.failover.as_ref()
    }

    /// The result cache, when configured
    #[must_use]
    pub fn cache(&self) -> Option<&TtlCache> {
        self.cache.as_ref()
    }

    /// Run `operation` through the full pipeline.
    ///
    /// The `Clone + Sync + 'static` bound on `T` is what the result cache
    /// needs. Use [`execute_uncached`](Self::execute_uncached) for values
    /// that cannot be cached.
    ///
    /// # Errors
    ///
    /// Bulkhead errors are returned before any attempt is made. Otherwise
    /// the error of the last attempt is returned once retries are exhausted.
    pub async fn execute<T, F, Fut>(&self, operation: F, options: ExecuteOptions) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(Attempt) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let span = self.span(&options);
        async {
            let cache_key = self.cache_key(&options);
            if let Some(hit) = self.cached(cache_key) {
                return Ok(hit);
            }

            let _permit = self.admit().await?;
            let value = self.run_attempts(&operation, &options).await?;
            self.store(cache_key, &value);
            Ok(value)
        }
        .instrument(span)
        .await
    }

    /// Run `operation` through every stage except the cache. The result
    /// type carries no bounds.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub async fn execute_uncached<T, F, Fut>(&self, operation: F, options: ExecuteOptions) -> Result<T>
    where
        F: Fn(Attempt) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let span = self.span(&options);
        async {
            let _permit = self.admit().await?;
            self.run_attempts(&operation, &options).await
        }
        .instrument(span)
        .await
    }

    /// Like [`execute`](Self::execute), but once retries are exhausted the
    /// last error is handed to `fallback`. Fallback results are not cached.
    pub async fn execute_with_fallback<T, F, Fut, Fb, FbFut>(
        &self,
        operation: F,
        options: ExecuteOptions,
        fallback: Fb,
    ) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(Attempt) -> Fut,
        Fut: Future<Output = Result<T>>,
        Fb: FnOnce(Error) -> FbFut,
        FbFut: Future<Output = Result<T>>,
    {
        let span = self.span(&options);
        async {
            let cache_key = self.cache_key(&options);
            if let Some(hit) = self.cached(cache_key) {
                return Ok(hit);
            }

            let permit = self.admit().await?;
            match self.run_attempts(&operation, &options).await {
                Ok(value) => {
                    self.store(cache_key, &value);
                    Ok(value)
                }
                Err(e) => {
                    drop(permit);
                    self.fallbacks.fetch_add(1, Ordering::Relaxed);
                    telemetry_metrics::counter!(
                        "resilience_fallbacks_total",
                        "resource" => self.name.clone()
                    )
                    .increment(1);
                    warn!(resource = %self.name, error = %e, "Retries exhausted, using fallback");
                    fallback(e).await
                }
            }
        }
        .instrument(span)
        .await
    }

    fn span(&self, options: &ExecuteOptions) -> tracing::Span {
        info_span!(
            "resilience.execute",
            resource = %self.name,
            context = ?options.context
        )
    }

    fn cache_key<'a>(&self, options: &'a ExecuteOptions) -> Option<&'a str> {
        if options.skip_cache || self.cache.is_none() {
            return None;
        }
        options.cache_key.as_deref()
    }

    fn cached<T>(&self, key: Option<&str>) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let (cache, key) = self.cache.as_ref().zip(key)?;
        let hit = cache.get::<T>(key);
        if hit.is_some() {
            debug!(resource = %self.name, key, "Serving cached result");
        }
        hit
    }

    fn store<T>(&self, key: Option<&str>, value: &T)
    where
        T: Clone + Send + Sync + 'static,
    {
        if let Some((cache, key)) = self.cache.as_ref().zip(key) {
            cache.insert(key, value.clone());
        }
    }

    async fn admit(&self) -> Result<Option<BulkheadPermit>> {
        match &self.bulkhead {
            Some(bulkhead) => bulkhead.acquire().await.map(Some),
            None => Ok(None),
        }
    }

    async fn run_attempts<T, F, Fut>(&self, operation: &F, options: &ExecuteOptions) -> Result<T>
    where
        F: Fn(Attempt) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        with_retry(&self.retry, &self.name, move |number| {
            self.attempt(operation, options, number)
        })
        .await
    }

    /// One retry attempt: timeout around the breaker-gated call
    async fn attempt<T, F, Fut>(&self, operation: &F, options: &ExecuteOptions, number: u32) -> Result<T>
    where
        F: Fn(Attempt) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guarded = self
            .circuit_breaker
            .execute(|| self.dispatch(operation, options, number));
        let Some(timeout) = self.config.timeout else {
            return guarded.await;
        };

        self.timeouts.total.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        if let Ok(result) = tokio::time::timeout(timeout, guarded).await {
            return result;
        }

        self.timeouts.timeouts.fetch_add(1, Ordering::Relaxed);
        telemetry_metrics::counter!("resilience_timeouts_total", "resource" => self.name.clone())
            .increment(1);
        warn!(
            resource = %self.name,
            attempt = number,
            timeout_ms = timeout.as_millis(),
            "Attempt timed out"
        );
        let err = Error::Timeout {
            name: self.name.clone(),
            timeout,
        };
        // The breaker's own future was dropped before it could record
        self.circuit_breaker.record_failure(&err, started.elapsed());
        Err(err)
    }

    async fn dispatch<T, F, Fut>(&self, operation: &F, options: &ExecuteOptions, number: u32) -> Result<T>
    where
        F: Fn(Attempt) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(failover) = &self.failover else {
            return operation(Attempt {
                number,
                provider: options.forced_provider.clone(),
            })
            .await;
        };

        let routing = FailoverOptions {
            forced_provider: options.forced_provider.clone(),
            skip_failover: options.skip_failover,
        };
        failover
            .execute(
                |provider| {
                    operation(Attempt {
                        number,
                        provider: Some(provider),
                    })
                },
                &routing,
            )
            .await
    }

    /// Aggregated metrics
    pub fn metrics(&self) -> ResilienceMetrics {
        ResilienceMetrics {
            name: self.name.clone(),
            circuit_breaker: self.circuit_breaker.metrics(),
            failover: self.failover.as_ref().map(|f| f.metrics()),
            retry: self.retry.stats(),
            timeout: TimeoutMetrics {
                total: self.timeouts.total.load(Ordering::Relaxed),
                timeouts: self.timeouts.timeouts.load(Ordering::Relaxed),
            },
            bulkhead: self.bulkhead.as_ref().map(Bulkhead::metrics),
            cache: self.cache.as_ref().map(TtlCache::stats),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }

    /// Consolidated health verdict
    pub fn health(&self) -> HealthReport {
        let mut subsystems = BTreeMap::new();
        subsystems.insert(
            "circuit_breaker".to_string(),
            SubsystemHealth {
                healthy: self.circuit_breaker.is_available(),
                detail: self.circuit_breaker.status_message(),
            },
        );
        if let Some(failover) = &self.failover {
            let healthy = failover.is_healthy() && !failover.is_destroyed();
            subsystems.insert(
                "failover".to_string(),
                SubsystemHealth {
                    healthy,
                    detail: format!("current provider '{}'", failover.current_provider()),
                },
            );
        }
        if let Some(bulkhead) = &self.bulkhead {
            let metrics = bulkhead.metrics();
            subsystems.insert(
                "bulkhead".to_string(),
                SubsystemHealth {
                    healthy: !bulkhead.is_saturated(),
                    detail: format!(
                        "{}/{} active, {}/{} queued",
                        metrics.active, metrics.max_concurrent, metrics.queued, metrics.max_queue
                    ),
                },
            );
        }

        HealthReport {
            name: self.name.clone(),
            healthy: subsystems.values().all(|s| s.healthy),
            subsystems,
        }
    }

    /// Clear all sub-component state
    pub fn reset(&self) {
        self.circuit_breaker.reset();
        if let Some(failover) = &self.failover {
            failover.reset();
        }
        self.retry.reset_stats();
        if let Some(bulkhead) = &self.bulkhead {
            bulkhead.reset_stats();
        }
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        self.timeouts.total.store(0, Ordering::Relaxed);
        self.timeouts.timeouts.store(0, Ordering::Relaxed);
        self.fallbacks.store(0, Ordering::Relaxed);
        info!(resource = %self.name, "Resilience manager reset");
    }
}

impl std::fmt::Debug for ResilienceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceManager")
            .field("name", &self.name)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("failover", &self.failover)
            .finish_non_exhaustive()
    }
}
