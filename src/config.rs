//! Configuration management

use std::{collections::HashMap, fmt, path::Path, sync::Arc, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Resilience configuration per named resource
    pub resources: HashMap<String, ResilienceConfig>,
}

impl Config {
    /// Load configuration from an optional YAML file, then `RESILIENCE_`
    /// prefixed environment variables (`__` separates nested keys).
    ///
    /// Every resource is validated before the config is returned.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("RESILIENCE_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate all configured resources
    pub fn validate(&self) -> Result<()> {
        for (name, resource) in &self.resources {
            resource
                .validate()
                .map_err(|e| Error::Config(format!("resource '{name}': {e}")))?;
        }
        Ok(())
    }

    /// Look up the configuration for a named resource
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ResilienceConfig> {
        self.resources.get(name)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (`text` or `json`)
    pub format: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
        }
    }
}

/// Decides whether a failure counts toward a circuit breaker's state.
///
/// Failures the classifier rejects still propagate to the caller.
#[derive(Clone)]
pub struct ErrorClassifier(Arc<dyn Fn(&Error) -> bool + Send + Sync>);

impl ErrorClassifier {
    /// Build a classifier from a predicate
    pub fn new(predicate: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    /// Count only the given error kinds
    #[must_use]
    pub fn only(kinds: &[crate::ErrorKind]) -> Self {
        let kinds = kinds.to_vec();
        Self::new(move |err| kinds.contains(&err.kind()))
    }

    /// Whether `err` counts
    #[must_use]
    pub fn counts(&self, err: &Error) -> bool {
        (self.0)(err)
    }
}

impl fmt::Debug for ErrorClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorClassifier(..)")
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Counting failures before opening
    pub failure_threshold: u32,
    /// Time to wait in open state before a trial call
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    /// Observation window (informational)
    #[serde(with = "humantime_serde")]
    pub monitoring_period: Duration,
    /// Per-call deadline
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Consecutive half-open successes needed to close
    pub half_open_attempts: u32,
    /// Which failures count; all of them when unset
    #[serde(skip)]
    pub classifier: Option<ErrorClassifier>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            monitoring_period: Duration::from_secs(60),
            timeout: None,
            half_open_attempts: 3,
            classifier: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Validate value ranges
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::Config("failure_threshold must be > 0".into()));
        }
        if self.half_open_attempts == 0 {
            return Err(Error::Config("half_open_attempts must be > 0".into()));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::Config("circuit breaker timeout must be > 0".into()));
        }
        Ok(())
    }
}

/// Failover configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Preferred provider
    pub primary_provider: String,
    /// Fallback providers, in priority order
    pub fallback_providers: Vec<String>,
    /// Interval between health probe rounds
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    /// Deadline for a single health probe
    #[serde(with = "humantime_serde")]
    pub health_check_timeout: Duration,
    /// Total attempts across providers per call
    pub max_retries: u32,
    /// Delay between provider attempts
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Consecutive healthy probes on the primary before failing back
    pub failback_threshold: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            primary_provider: "primary".to_string(),
            fallback_providers: Vec::new(),
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            failback_threshold: 3,
        }
    }
}

impl FailoverConfig {
    /// All providers, primary first
    pub fn providers(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary_provider.as_str())
            .chain(self.fallback_providers.iter().map(String::as_str))
    }

    /// Validate value ranges and provider names
    pub fn validate(&self) -> Result<()> {
        if self.primary_provider.is_empty() {
            return Err(Error::Config("primary_provider must not be empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for provider in self.providers() {
            if !seen.insert(provider) {
                return Err(Error::Config(format!("duplicate provider '{provider}'")));
            }
        }
        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be > 0".into()));
        }
        if self.failback_threshold == 0 {
            return Err(Error::Config("failback_threshold must be > 0".into()));
        }
        if self.health_check_interval.is_zero() {
            return Err(Error::Config("health_check_interval must be > 0".into()));
        }
        Ok(())
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Upper bound for any delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in [0.5, 1.0]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Validate value ranges
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be > 0".into()));
        }
        if self.backoff_multiplier < 1.0 || !self.backoff_multiplier.is_finite() {
            return Err(Error::Config("backoff_multiplier must be >= 1".into()));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::Config("base_delay must not exceed max_delay".into()));
        }
        Ok(())
    }
}

/// Bulkhead configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Concurrent in-flight executions
    pub max_concurrent: usize,
    /// How long a queued call may wait for admission
    #[serde(with = "humantime_serde")]
    pub max_wait_time: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_wait_time: Duration::from_secs(5),
        }
    }
}

impl BulkheadConfig {
    /// Waiters allowed in the admission queue. Admitted plus waiting calls
    /// never exceed `2 × max_concurrent`.
    #[must_use]
    pub fn max_queue(&self) -> usize {
        self.max_concurrent
    }

    /// Validate value ranges
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::Config("max_concurrent must be > 0".into()));
        }
        Ok(())
    }
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Time-to-live for cached results
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Maximum number of entries before expired entries are swept
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            max_entries: 10_000,
        }
    }
}

/// Per-resource resilience configuration. Every stage is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Circuit breaker stage
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Failover stage
    pub failover: Option<FailoverConfig>,
    /// Retry stage
    pub retry: Option<RetryConfig>,
    /// Per-attempt deadline
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Bulkhead stage
    pub bulkhead: Option<BulkheadConfig>,
    /// Result cache stage
    pub cache: Option<CacheConfig>,
}

impl ResilienceConfig {
    /// Validate every configured stage
    pub fn validate(&self) -> Result<()> {
        if let Some(cb) = &self.circuit_breaker {
            cb.validate()?;
        }
        if let Some(failover) = &self.failover {
            failover.validate()?;
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        if let Some(bulkhead) = &self.bulkhead {
            bulkhead.validate()?;
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::Config("timeout must be > 0".into()));
        }
        Ok(())
    }
}

/// Named configurations for common resource kinds
pub mod presets {
    use std::time::Duration;

    use super::{
        BulkheadConfig, CacheConfig, CircuitBreakerConfig, ResilienceConfig, RetryConfig,
    };

    /// Relational database access
    #[must_use]
    pub fn database() -> ResilienceConfig {
        ResilienceConfig {
            circuit_breaker: Some(CircuitBreakerConfig {
                failure_threshold: 5,
                reset_timeout: Duration::from_secs(30),
                monitoring_period: Duration::from_secs(60),
                timeout: Some(Duration::from_secs(5)),
                half_open_attempts: 3,
                classifier: None,
            }),
            failover: None,
            retry: Some(RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(2),
                backoff_multiplier: 2.0,
                jitter: true,
            }),
            timeout: Some(Duration::from_secs(10)),
            bulkhead: Some(BulkheadConfig {
                max_concurrent: 20,
                max_wait_time: Duration::from_secs(5),
            }),
            cache: None,
        }
    }

    /// Third-party HTTP APIs (payments, webhooks)
    #[must_use]
    pub fn external_api() -> ResilienceConfig {
        ResilienceConfig {
            circuit_breaker: Some(CircuitBreakerConfig {
                failure_threshold: 3,
                reset_timeout: Duration::from_secs(60),
                monitoring_period: Duration::from_secs(120),
                timeout: Some(Duration::from_secs(10)),
                half_open_attempts: 2,
                classifier: None,
            }),
            failover: None,
            retry: Some(RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
                backoff_multiplier: 2.0,
                jitter: true,
            }),
            timeout: Some(Duration::from_secs(15)),
            bulkhead: Some(BulkheadConfig {
                max_concurrent: 10,
                max_wait_time: Duration::from_secs(10),
            }),
            cache: Some(CacheConfig {
                ttl: Duration::from_secs(30),
                max_entries: 1_000,
            }),
        }
    }

    /// In-memory or networked cache lookups
    #[must_use]
    pub fn cache() -> ResilienceConfig {
        ResilienceConfig {
            circuit_breaker: Some(CircuitBreakerConfig {
                failure_threshold: 10,
                reset_timeout: Duration::from_secs(10),
                monitoring_period: Duration::from_secs(30),
                timeout: Some(Duration::from_secs(1)),
                half_open_attempts: 5,
                classifier: None,
            }),
            failover: None,
            retry: Some(RetryConfig {
                max_attempts: 2,
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(500),
                backoff_multiplier: 2.0,
                jitter: false,
            }),
            timeout: Some(Duration::from_secs(2)),
            bulkhead: None,
            cache: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_presets_are_valid() {
        presets::database().validate().unwrap();
        presets::external_api().validate().unwrap();
        presets::cache().validate().unwrap();
    }

    #[test]
    fn test_load_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resilience.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r"
logging:
  level: debug
resources:
  payments:
    timeout: 2s
    circuit_breaker:
      failure_threshold: 4
      reset_timeout: 45s
      timeout: 500ms
    failover:
      primary_provider: stripe
      fallback_providers: [adyen, braintree]
      failback_threshold: 2
    retry:
      max_attempts: 5
      base_delay: 200ms
      max_delay: 3s
      jitter: false
    bulkhead:
      max_concurrent: 4
"
        )
        .unwrap();
        drop(f);

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.logging.level, "debug");

        let payments = config.resource("payments").unwrap();
        assert_eq!(payments.timeout, Some(Duration::from_secs(2)));

        let cb = payments.circuit_breaker.as_ref().unwrap();
        assert_eq!(cb.failure_threshold, 4);
        assert_eq!(cb.reset_timeout, Duration::from_secs(45));
        assert_eq!(cb.timeout, Some(Duration::from_millis(500)));
        assert_eq!(cb.half_open_attempts, 3);

        let failover = payments.failover.as_ref().unwrap();
        assert_eq!(
            failover.providers().collect::<Vec<_>>(),
            vec!["stripe", "adyen", "braintree"]
        );
        assert_eq!(failover.failback_threshold, 2);

        let retry = payments.retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 5);
        assert!(!retry.jitter);
        assert!((retry.backoff_multiplier - 2.0).abs() < f64::EPSILON);

        let bulkhead = payments.bulkhead.as_ref().unwrap();
        assert_eq!(bulkhead.max_queue(), 4);
        assert!(payments.cache.is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Some(Path::new("/nonexistent/resilience.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_load_rejects_invalid_resource() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(
            &path,
            "resources:\n  db:\n    retry:\n      max_attempts: 0\n",
        )
        .unwrap();

        let err = Config::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("resource 'db'"));
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn test_failover_rejects_duplicate_providers() {
        let config = FailoverConfig {
            primary_provider: "a".into(),
            fallback_providers: vec!["b".into(), "a".into()],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate provider 'a'"));
    }

    #[test]
    fn test_retry_validation() {
        let config = RetryConfig {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RetryConfig {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_classifier_only() {
        let classifier = ErrorClassifier::only(&[crate::ErrorKind::Timeout]);
        let timeout = Error::Timeout {
            name: "x".into(),
            timeout: Duration::from_millis(1),
        };
        assert!(classifier.counts(&timeout));
        assert!(!classifier.counts(&Error::operation(anyhow::anyhow!("bad input"))));
    }
}
