//! Resilience primitives: retry with backoff, circuit breaking and
//! graceful degradation. Every store and network call goes through them.

pub mod circuit_breaker;
pub mod degradation;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitState,
};
pub use degradation::{with_fallback, with_fallback_fn, Degraded};
pub use retry::{retry_async, RetryPolicy};

/// Breaker name for the durable store.
pub const STATE_STORE_CIRCUIT: &str = "state-store";

/// Breaker name for the identity provider's JWKS endpoint.
pub const IDENTITY_PROVIDER_CIRCUIT: &str = "identity-provider";
