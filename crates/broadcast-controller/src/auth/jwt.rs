//! Identity token verification against the provider's JWKS.
//!
//! # Security
//!
//! - Tokens are size-checked before parsing (via `common::jwt`)
//! - Only RS256 and EdDSA are accepted, and the key's type must match
//! - `exp`, `iss`, `aud` and `token_use` are all enforced
//! - `iat` may not be further in the future than the clock skew allows
//! - Rejection reasons are logged; callers get a generic error

use super::claims::IdentityClaims;
use super::jwks::{Jwk, JwksClient};
use super::{AuthorizationError, IdentityVerifier, VerifiedIdentity};
use crate::config::Config;
use crate::observability::metrics;
use async_trait::async_trait;
use common::clock::Clock;
use common::jwt::{decode_ed25519_public_key_jwk, peek_header, validate_iat_at};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

pub struct JwtAuthorizer {
    jwks_client: Arc<JwksClient>,
    issuer: String,
    audience: String,
    token_use: String,
    clock_skew: Duration,
    clock: Arc<dyn Clock>,
}

impl JwtAuthorizer {
    pub fn new(
        jwks_client: Arc<JwksClient>,
        issuer: String,
        audience: String,
        token_use: String,
        clock_skew: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jwks_client,
            issuer,
            audience,
            token_use,
            clock_skew,
            clock,
        }
    }

    pub fn from_config(config: &Config, jwks_client: Arc<JwksClient>, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            jwks_client,
            config.token_issuer.clone(),
            config.token_audience.clone(),
            config.token_use.clone(),
            Duration::from_secs(config.clock_skew_seconds),
            clock,
        )
    }

    async fn verify_inner(&self, token: &str) -> Result<IdentityClaims, AuthorizationError> {
        if token.trim().is_empty() {
            return Err(AuthorizationError::MissingToken);
        }

        let header = peek_header(token).map_err(|e| {
            tracing::debug!(target: "bc.auth.jwt", error = ?e, "Token header rejected");
            AuthorizationError::MalformedToken
        })?;
        let algorithm = match header.alg.as_str() {
            "RS256" => Algorithm::RS256,
            "EdDSA" => Algorithm::EdDSA,
            other => {
                tracing::debug!(target: "bc.auth.jwt", alg = %other, "Unsupported token algorithm");
                return Err(AuthorizationError::MalformedToken);
            }
        };

        let jwk = self.jwks_client.get_key(&header.kid).await?;
        let decoding_key = decoding_key_for(&jwk, algorithm)?;

        let skew_secs = i64::try_from(self.clock_skew.as_secs()).unwrap_or(i64::MAX);
        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        // Expiry is checked below against the injected clock
        validation.validate_exp = false;

        let claims = decode::<IdentityClaims>(token, &decoding_key, &validation)
            .map_err(|e| {
                tracing::debug!(target: "bc.auth.jwt", error = %e, "Token verification failed");
                map_decode_error(e.kind())
            })?
            .claims;

        let now = self.clock.now_secs();
        if claims.exp.saturating_add(skew_secs) < now {
            return Err(AuthorizationError::Expired);
        }
        validate_iat_at(claims.iat, self.clock_skew, now).map_err(|e| {
            tracing::debug!(target: "bc.auth.jwt", error = ?e, "Token iat validation failed");
            AuthorizationError::MalformedToken
        })?;
        if claims.token_use.as_deref() != Some(self.token_use.as_str()) {
            return Err(AuthorizationError::WrongTokenUse);
        }

        Ok(claims)
    }
}

#[async_trait]
impl IdentityVerifier for JwtAuthorizer {
    #[instrument(skip_all)]
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthorizationError> {
        match self.verify_inner(token).await {
            Ok(claims) => {
                metrics::record_token_validation("success");
                tracing::debug!(target: "bc.auth.jwt", "Token validated successfully");
                Ok(VerifiedIdentity {
                    user_id: claims.sub,
                    email: claims.email,
                    name: claims.name,
                })
            }
            Err(e) => {
                metrics::record_token_validation(e.reason());
                tracing::info!(
                    target: "bc.auth.jwt",
                    reason = e.reason(),
                    "Identity token rejected"
                );
                Err(e)
            }
        }
    }
}

fn decoding_key_for(jwk: &Jwk, algorithm: Algorithm) -> Result<DecodingKey, AuthorizationError> {
    let expected_kty = match algorithm {
        Algorithm::EdDSA => "OKP",
        _ => "RSA",
    };
    if jwk.kty != expected_kty {
        tracing::warn!(target: "bc.auth.jwt", kty = %jwk.kty, "JWK type does not match token algorithm");
        return Err(AuthorizationError::MalformedToken);
    }
    if let Some(alg) = &jwk.alg {
        let expected_alg = match algorithm {
            Algorithm::EdDSA => "EdDSA",
            _ => "RS256",
        };
        if alg != expected_alg {
            tracing::warn!(target: "bc.auth.jwt", alg = %alg, "JWK algorithm does not match token");
            return Err(AuthorizationError::MalformedToken);
        }
    }

    match algorithm {
        Algorithm::EdDSA => {
            let x = jwk.x.as_deref().ok_or_else(|| {
                tracing::error!(target: "bc.auth.jwt", kid = %jwk.kid, "JWK missing x field");
                AuthorizationError::UnknownKey
            })?;
            let bytes = decode_ed25519_public_key_jwk(x).map_err(|e| {
                tracing::error!(target: "bc.auth.jwt", error = %e, "Invalid public key encoding");
                AuthorizationError::UnknownKey
            })?;
            Ok(DecodingKey::from_ed_der(&bytes))
        }
        _ => {
            let (Some(n), Some(e)) = (jwk.n.as_deref(), jwk.e.as_deref()) else {
                tracing::error!(target: "bc.auth.jwt", kid = %jwk.kid, "JWK missing RSA components");
                return Err(AuthorizationError::UnknownKey);
            };
            DecodingKey::from_rsa_components(n, e).map_err(|e| {
                tracing::error!(target: "bc.auth.jwt", error = %e, "Invalid RSA components");
                AuthorizationError::UnknownKey
            })
        }
    }
}

fn map_decode_error(kind: &ErrorKind) -> AuthorizationError {
    match kind {
        ErrorKind::InvalidSignature => AuthorizationError::BadSignature,
        ErrorKind::ExpiredSignature => AuthorizationError::Expired,
        ErrorKind::InvalidAudience => AuthorizationError::WrongAudience,
        ErrorKind::InvalidIssuer => AuthorizationError::WrongIssuer,
        _ => AuthorizationError::MalformedToken,
    }
}
