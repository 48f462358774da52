//! Error types for the resilience runtime

use std::time::Duration;

use thiserror::Error;

/// Result type alias for the resilience runtime
pub type Result<T> = std::result::Result<T, Error>;

/// Resilience runtime errors
#[derive(Error, Debug)]
pub enum Error {
    /// Circuit breaker is open and the cooldown has not elapsed; the operation never ran
    #[error("Circuit breaker '{name}' is open (retry in {}ms)", remaining.as_millis())]
    CircuitOpen {
        /// Breaker name
        name: String,
        /// Time left until the breaker allows a trial call
        remaining: Duration,
    },

    /// Attempt exceeded its deadline
    #[error("Operation '{name}' timed out after {}ms", timeout.as_millis())]
    Timeout {
        /// Resource or breaker name
        name: String,
        /// The deadline that was exceeded
        timeout: Duration,
    },

    /// Bulkhead admission queue was full
    #[error("Bulkhead '{0}' is full")]
    BulkheadRejected(String),

    /// Queued too long without being admitted
    #[error("Bulkhead '{name}' wait timed out after {}ms", waited.as_millis())]
    BulkheadWaitTimeout {
        /// Resource name
        name: String,
        /// How long the call waited in the queue
        waited: Duration,
    },

    /// Failover ran out of providers or attempts
    #[error("All providers exhausted for '{name}' after {attempts} attempt(s)")]
    AllProvidersExhausted {
        /// Failover manager name
        name: String,
        /// Attempts made across providers
        attempts: u32,
        /// Last underlying failure, if any provider was tried
        #[source]
        source: Option<Box<Error>>,
    },

    /// The wrapped business operation failed
    #[error("Operation failed: {0}")]
    Operation(#[from] anyhow::Error),

    /// Provider not registered with the failover manager
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Component was destroyed
    #[error("'{0}' has been shut down")]
    Shutdown(String),
}

/// Closed classification of [`Error`] variants, used by breaker
/// classifiers and as a metrics label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// [`Error::CircuitOpen`]
    CircuitOpen,
    /// [`Error::Timeout`]
    Timeout,
    /// [`Error::BulkheadRejected`]
    BulkheadRejected,
    /// [`Error::BulkheadWaitTimeout`]
    BulkheadWaitTimeout,
    /// [`Error::AllProvidersExhausted`]
    AllProvidersExhausted,
    /// [`Error::Operation`]
    Operation,
    /// [`Error::ProviderNotFound`]
    ProviderNotFound,
    /// [`Error::Config`]
    Config,
    /// [`Error::Shutdown`]
    Shutdown,
}

impl ErrorKind {
    /// Stable label for logs and metrics
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CircuitOpen => "circuit_open",
            Self::Timeout => "timeout",
            Self::BulkheadRejected => "bulkhead_rejected",
            Self::BulkheadWaitTimeout => "bulkhead_wait_timeout",
            Self::AllProvidersExhausted => "all_providers_exhausted",
            Self::Operation => "operation",
            Self::ProviderNotFound => "provider_not_found",
            Self::Config => "config",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Wrap a business failure
    pub fn operation(err: impl Into<anyhow::Error>) -> Self {
        Self::Operation(err.into())
    }

    /// Variant classification
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::BulkheadRejected(_) => ErrorKind::BulkheadRejected,
            Self::BulkheadWaitTimeout { .. } => ErrorKind::BulkheadWaitTimeout,
            Self::AllProvidersExhausted { .. } => ErrorKind::AllProvidersExhausted,
            Self::Operation(_) => ErrorKind::Operation,
            Self::ProviderNotFound(_) => ErrorKind::ProviderNotFound,
            Self::Config(_) => ErrorKind::Config,
            Self::Shutdown(_) => ErrorKind::Shutdown,
        }
    }

    /// `true` for [`Error::Timeout`]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// `true` for [`Error::CircuitOpen`]
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}
