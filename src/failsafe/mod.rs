//! Failsafe mechanisms: circuit breaker, failover, retry, bulkhead, and the
//! manager that composes them

mod bulkhead;
mod circuit_breaker;
mod failover;
mod health;
mod manager;
mod retry;
pub mod wrap;

pub use bulkhead::{Bulkhead, BulkheadMetrics, BulkheadPermit};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerMetrics, CircuitBreakerState, CircuitState,
};
pub use failover::{FailoverManager, FailoverMetrics, FailoverOptions, Provider};
pub use health::{DEFAULT_WINDOW_CAPACITY, HealthProbe, LatencyWindow, NoopProbe};
pub use manager::{
    Attempt, ExecuteOptions, HealthReport, ResilienceManager, ResilienceMetrics,
    SubsystemHealth, TimeoutMetrics,
};
pub use retry::{RetryMetrics, RetryPolicy, with_retry};
