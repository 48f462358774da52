//! Resilience Orchestrator
//!
//! In-process resilience layer for calls to unreliable dependencies.
//!
//! # Features
//!
//! - **Circuit breaking**: per-dependency state machine with half-open trials
//! - **Failover**: prioritized providers, health probing, automatic failback
//! - **Retry**: exponential backoff with jitter
//! - **Bulkheads**: bounded concurrency with a FIFO wait queue
//! - **Caching**: short-lived TTL result cache
//! - **Registries**: one shared instance per resource name
//!
//! # Pipeline
//!
//! ```text
//! cache → bulkhead → retry → timeout → circuit breaker → failover → operation
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod registry;

pub use cache::{CacheStatsSnapshot, TtlCache};
pub use config::{Config, ErrorClassifier, ResilienceConfig, presets};
pub use error::{Error, ErrorKind, Result};
pub use failsafe::{
    Attempt, CircuitBreaker, CircuitState, ExecuteOptions, FailoverManager, HealthProbe,
    NoopProbe, ResilienceManager,
};
pub use registry::{CircuitBreakerRegistry, FailoverRegistry, ResilienceRegistry};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`. `format` selects `"json"` or
/// plain text output.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))
}
