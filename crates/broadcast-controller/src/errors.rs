//! Broadcast Controller error types.
//!
//! Every error maps onto a stable wire code and a client-safe message.
//! Internal details are logged server-side but never sent to clients.

use crate::auth::AuthorizationError;
use crate::store::StoreError;
use thiserror::Error;

/// Coarse error taxonomy used for propagation and degradation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed or out-of-range input. Never retried.
    Validation,
    /// Bad, expired or forged token, or identity mismatch.
    Authorization,
    /// Session or connection absent (or no longer active).
    NotFound,
    /// Listener or session limits reached. No retry-after.
    Capacity,
    /// Per-identifier rate limit hit. Carries a retry-after.
    RateLimitExceeded,
    /// Transient dependency failure.
    Retryable,
    /// Unexpected failure.
    Internal,
}

impl ErrorCategory {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Authorization => "authorization",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Capacity => "capacity",
            ErrorCategory::RateLimitExceeded => "rate_limited",
            ErrorCategory::Retryable => "retryable",
            ErrorCategory::Internal => "internal",
        }
    }
}

/// Service-wide error type.
///
/// Wire codes:
/// - `InvalidParameter`: `INVALID_PARAMETER`
/// - `Unauthorized`: `UNAUTHORIZED`
/// - `Forbidden`: `FORBIDDEN`
/// - `SessionNotFound`: `SESSION_NOT_FOUND`
/// - `ConnectionNotFound`: `CONNECTION_NOT_FOUND`
/// - `SessionInactive`: `SESSION_INACTIVE`
/// - `CapacityExceeded`: `CAPACITY_EXCEEDED`
/// - `RateLimitExceeded`: `RATE_LIMIT_EXCEEDED`
/// - `ServiceUnavailable`, retryable `Store`: `SERVICE_UNAVAILABLE`
/// - `Internal`, other `Store`: `INTERNAL_ERROR`
#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(AuthorizationError),

    /// Authenticated but not permitted (e.g. listener issuing a speaker action).
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Session inactive: {0}")]
    SessionInactive(String),

    #[error("Session {session_id} at capacity ({max_listeners} listeners)")]
    CapacityExceeded {
        session_id: String,
        max_listeners: i64,
    },

    #[error("Rate limit exceeded for {operation}, retry after {retry_after_seconds}s")]
    RateLimitExceeded {
        operation: &'static str,
        retry_after_seconds: u64,
    },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BroadcastError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            BroadcastError::InvalidParameter(_) => ErrorCategory::Validation,
            BroadcastError::Unauthorized(_) | BroadcastError::Forbidden(_) => {
                ErrorCategory::Authorization
            }
            BroadcastError::SessionNotFound(_)
            | BroadcastError::ConnectionNotFound(_)
            | BroadcastError::SessionInactive(_) => ErrorCategory::NotFound,
            BroadcastError::CapacityExceeded { .. } => ErrorCategory::Capacity,
            BroadcastError::RateLimitExceeded { .. } => ErrorCategory::RateLimitExceeded,
            BroadcastError::ServiceUnavailable(_) => ErrorCategory::Retryable,
            BroadcastError::Store(e) if e.is_retryable() => ErrorCategory::Retryable,
            BroadcastError::Store(_) | BroadcastError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Returns the stable wire code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            BroadcastError::InvalidParameter(_) => "INVALID_PARAMETER",
            BroadcastError::Unauthorized(AuthorizationError::IdentityMismatch)
            | BroadcastError::Forbidden(_) => "FORBIDDEN",
            BroadcastError::Unauthorized(_) => "UNAUTHORIZED",
            BroadcastError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            BroadcastError::ConnectionNotFound(_) => "CONNECTION_NOT_FOUND",
            BroadcastError::SessionInactive(_) => "SESSION_INACTIVE",
            BroadcastError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            BroadcastError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            BroadcastError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            BroadcastError::Store(e) if e.is_retryable() => "SERVICE_UNAVAILABLE",
            BroadcastError::Store(_) | BroadcastError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            BroadcastError::InvalidParameter(msg) => msg.clone(),
            BroadcastError::Unauthorized(AuthorizationError::IdentityMismatch)
            | BroadcastError::Forbidden(_) => "This action is not permitted".to_string(),
            BroadcastError::Unauthorized(_) => "Authentication failed".to_string(),
            BroadcastError::SessionNotFound(_) => "Session not found".to_string(),
            BroadcastError::ConnectionNotFound(_) => "Connection not found".to_string(),
            BroadcastError::SessionInactive(_) => "Session is no longer active".to_string(),
            BroadcastError::CapacityExceeded { .. } => {
                "Session has reached its listener limit".to_string()
            }
            BroadcastError::RateLimitExceeded {
                retry_after_seconds,
                ..
            } => format!("Too many requests, retry in {retry_after_seconds} seconds"),
            BroadcastError::ServiceUnavailable(_) => {
                "Service temporarily unavailable, please retry".to_string()
            }
            BroadcastError::Store(e) if e.is_retryable() => {
                "Service temporarily unavailable, please retry".to_string()
            }
            BroadcastError::Store(_) | BroadcastError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }

    /// Seconds the client should wait, for rate-limit errors only.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            BroadcastError::RateLimitExceeded {
                retry_after_seconds,
                ..
            } => Some(*retry_after_seconds),
            _ => None,
        }
    }
}

impl From<StoreError> for BroadcastError {
    fn from(err: StoreError) -> Self {
        BroadcastError::Store(err)
    }
}

impl From<AuthorizationError> for BroadcastError {
    fn from(err: AuthorizationError) -> Self {
        if err.is_provider_unavailable() {
            BroadcastError::ServiceUnavailable("identity provider unavailable".to_string())
        } else {
            BroadcastError::Unauthorized(err)
        }
    }
}
