//! Identity token verification for speaker connections.
//!
//! Speakers present a signed identity token at connect and at refresh.
//! Listeners are anonymous and never reach this module.
//!
//! The specific rejection reason is logged and counted server-side; callers
//! only ever see a generic unauthorized signal.

pub mod claims;
pub mod jwks;
pub mod jwt;

pub use claims::IdentityClaims;
pub use jwks::{Jwk, JwksClient};
pub use jwt::JwtAuthorizer;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Why a token was rejected.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("no identity token presented")]
    MissingToken,

    #[error("identity token is malformed")]
    MalformedToken,

    #[error("identity token signed by an unknown key")]
    UnknownKey,

    #[error("identity token signature is invalid")]
    BadSignature,

    #[error("identity token has expired")]
    Expired,

    #[error("identity token audience mismatch")]
    WrongAudience,

    #[error("identity token issuer mismatch")]
    WrongIssuer,

    #[error("identity token has the wrong token_use")]
    WrongTokenUse,

    /// Valid token whose subject does not own the session.
    #[error("identity does not own the session")]
    IdentityMismatch,

    /// Signing keys could not be fetched; says nothing about the token.
    #[error("identity provider unavailable")]
    ProviderUnavailable,
}

impl AuthorizationError {
    /// Stable reason label for logs and metrics.
    pub const fn reason(self) -> &'static str {
        match self {
            AuthorizationError::MissingToken => "missing_token",
            AuthorizationError::MalformedToken => "malformed",
            AuthorizationError::UnknownKey => "unknown_key",
            AuthorizationError::BadSignature => "bad_signature",
            AuthorizationError::Expired => "expired",
            AuthorizationError::WrongAudience => "wrong_audience",
            AuthorizationError::WrongIssuer => "wrong_issuer",
            AuthorizationError::WrongTokenUse => "wrong_token_use",
            AuthorizationError::IdentityMismatch => "identity_mismatch",
            AuthorizationError::ProviderUnavailable => "provider_unavailable",
        }
    }

    pub const fn is_provider_unavailable(self) -> bool {
        matches!(self, AuthorizationError::ProviderUnavailable)
    }
}

/// A verified speaker identity.
#[derive(Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    /// Subject of the token; compared against a session's `speakerId`.
    pub user_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

impl fmt::Debug for VerifiedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifiedIdentity")
            .field("user_id", &"[REDACTED]")
            .field("email", &self.email.as_ref().map(|_| "[REDACTED]"))
            .field("name", &self.name.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Verifies bearer tokens into identities.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthorizationError>;
}
