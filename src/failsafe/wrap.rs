//! Higher-order wrappers
//!
//! Each wrapper turns an operation into an equivalent closure that routes
//! every call through a shared component, so call sites keep a plain
//! `Fn() -> Future` shape.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use super::circuit_breaker::CircuitBreaker;
use super::manager::{Attempt, ExecuteOptions, ResilienceManager};
use crate::Result;

/// Guard `operation` with `breaker`
pub fn with_circuit_breaker<T, F, Fut>(
    breaker: Arc<CircuitBreaker>,
    operation: F,
) -> impl Fn() -> BoxFuture<'static, Result<T>> + Clone + Send + Sync
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let operation = Arc::new(operation);
    move || {
        let breaker = Arc::clone(&breaker);
        let operation = Arc::clone(&operation);
        async move { breaker.execute(|| operation()).await }.boxed()
    }
}

/// Run `operation` through `manager`'s full pipeline with `options`
/// applied to every call
pub fn with_resilience<T, F, Fut>(
    manager: Arc<ResilienceManager>,
    options: ExecuteOptions,
    operation: F,
) -> impl Fn() -> BoxFuture<'static, Result<T>> + Clone + Send + Sync
where
    T: Clone + Send + Sync + 'static,
    F: Fn(Attempt) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let operation = Arc::new(operation);
    move || {
        let manager = Arc::clone(&manager);
        let operation = Arc::clone(&operation);
        let options = options.clone();
        async move { manager.execute(&*operation, options).await }.boxed()
    }
}
