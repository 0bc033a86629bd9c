//! Graceful degradation helpers.
//!
//! Wrap a dependency call with a fallback so that a failing dependency
//! produces a defined degraded answer instead of an error. The fallback
//! policy is the caller's: the rate limiter falls back to "allow", the
//! heartbeat path falls back to a plain acknowledgment.

use std::future::Future;
use tracing::warn;

/// Result of a call that may have been served by its fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Degraded<T> {
    Primary(T),
    Fallback(T),
}

impl<T> Degraded<T> {
    pub fn into_inner(self) -> T {
        match self {
            Degraded::Primary(v) | Degraded::Fallback(v) => v,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Degraded::Fallback(_))
    }
}

/// Await `fut`; on error log it and return `fallback`.
pub async fn with_fallback<T, E, Fut>(dependency: &'static str, fut: Fut, fallback: T) -> Degraded<T>
where
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_fallback_fn(dependency, fut, |_| fallback).await
}

/// Await `fut`; on error log it and compute the fallback from the error.
pub async fn with_fallback_fn<T, E, Fut, F>(
    dependency: &'static str,
    fut: Fut,
    fallback: F,
) -> Degraded<T>
where
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    F: FnOnce(&E) -> T,
{
    match fut.await {
        Ok(value) => Degraded::Primary(value),
        Err(e) => {
            warn!(
                target: "bc.resilience",
                dependency = dependency,
                error = %e,
                "Dependency failed, serving degraded response"
            );
            crate::observability::metrics::record_degraded(dependency);
            Degraded::Fallback(fallback(&e))
        }
    }
}
