//! JWT header helpers used before signature verification.
//!
//! - Tokens are size-checked BEFORE parsing
//! - The header is decoded only to find the `kid` and `alg` for JWKS lookup
//! - Error messages are generic; detail goes to debug logs
//!
//! ```rust,ignore
//! use common::jwt::{peek_header, validate_iat_at, DEFAULT_CLOCK_SKEW};
//!
//! let header = peek_header(token)?;
//! let key = jwks.get_key(&header.kid).await?;
//! // ... verify signature with `key` ...
//! validate_iat_at(claims.iat, DEFAULT_CLOCK_SKEW, clock.now_secs())?;
//! ```

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Maximum accepted token size in bytes (8KB).
///
/// Typical identity tokens are well under 2KB. Anything larger is rejected
/// before base64 decoding or signature work.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Default tolerance for `iat` values ahead of local time (5 minutes).
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Upper bound on configurable clock skew (10 minutes).
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(600);

/// Errors from header inspection and `iat` checks.
///
/// Every variant displays the same text so callers can forward it safely.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    #[error("The identity token is invalid or expired")]
    TokenTooLarge,

    #[error("The identity token is invalid or expired")]
    MalformedToken,

    #[error("The identity token is invalid or expired")]
    MissingKid,

    #[error("The identity token is invalid or expired")]
    IatTooFarInFuture,
}

/// The parts of a JWT header needed to pick a verification key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHeader {
    pub kid: String,
    pub alg: String,
}

#[derive(Deserialize)]
struct RawHeader {
    #[serde(default)]
    kid: Option<serde_json::Value>,
    #[serde(default)]
    alg: Option<String>,
}

/// Decode the JWT header without verifying the signature.
///
/// # Errors
///
/// - `TokenTooLarge` if the token exceeds [`MAX_JWT_SIZE_BYTES`]
/// - `MalformedToken` if the token is not three dot-separated parts, or the
///   header is not base64url JSON, or `alg` is missing
/// - `MissingKid` if `kid` is absent, empty, or not a string
pub fn peek_header(token: &str) -> Result<TokenHeader, JwtValidationError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(JwtValidationError::TokenTooLarge);
    }

    let mut parts = token.split('.');
    let (Some(header_part), Some(_), Some(_), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        tracing::debug!(target: "common.jwt", "Token rejected: invalid JWT format");
        return Err(JwtValidationError::MalformedToken);
    };

    let header_bytes = URL_SAFE_NO_PAD.decode(header_part).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to decode JWT header base64");
        JwtValidationError::MalformedToken
    })?;

    let raw: RawHeader = serde_json::from_slice(&header_bytes).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to parse JWT header JSON");
        JwtValidationError::MalformedToken
    })?;

    let kid = raw
        .kid
        .as_ref()
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or(JwtValidationError::MissingKid)?;

    let alg = raw.alg.ok_or(JwtValidationError::MalformedToken)?;

    Ok(TokenHeader { kid, alg })
}

/// Extract just the `kid` from a token header.
///
/// # Errors
///
/// Same as [`peek_header`].
pub fn extract_kid(token: &str) -> Result<String, JwtValidationError> {
    peek_header(token).map(|h| h.kid)
}

/// Reject tokens whose `iat` is more than `clock_skew` ahead of `now`.
///
/// `iat` and `now` are Unix epoch seconds.
///
/// # Errors
///
/// Returns `IatTooFarInFuture` when `iat > now + clock_skew`.
pub fn validate_iat_at(iat: i64, clock_skew: Duration, now: i64) -> Result<(), JwtValidationError> {
    let clock_skew_secs = i64::try_from(clock_skew.as_secs()).unwrap_or(i64::MAX);
    let max_iat = now.saturating_add(clock_skew_secs);

    if iat > max_iat {
        tracing::debug!(
            target: "common.jwt",
            iat = iat,
            now = now,
            max_allowed = max_iat,
            "Token rejected: iat too far in the future"
        );
        return Err(JwtValidationError::IatTooFarInFuture);
    }

    Ok(())
}

/// Decode the `x` member of an OKP (Ed25519) JWK into raw key bytes.
///
/// # Errors
///
/// Returns `base64::DecodeError` if `x` is not unpadded base64url.
pub fn decode_ed25519_public_key_jwk(x_b64url: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(x_b64url)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn token_with_header(header: &str) -> String {
        format!("{}.payload.signature", URL_SAFE_NO_PAD.encode(header))
    }

    #[test]
    fn test_peek_header_valid_token() {
        let token = token_with_header(r#"{"alg":"RS256","typ":"JWT","kid":"idp-2024"}"#);

        let header = peek_header(&token).unwrap();
        assert_eq!(header.kid, "idp-2024");
        assert_eq!(header.alg, "RS256");
    }

    #[test]
    fn test_peek_header_missing_kid() {
        let token = token_with_header(r#"{"alg":"EdDSA","typ":"JWT"}"#);
        assert_eq!(peek_header(&token), Err(JwtValidationError::MissingKid));
    }

    #[test]
    fn test_peek_header_empty_or_numeric_kid() {
        let empty = token_with_header(r#"{"alg":"EdDSA","kid":""}"#);
        let numeric = token_with_header(r#"{"alg":"EdDSA","kid":12345}"#);

        assert_eq!(peek_header(&empty), Err(JwtValidationError::MissingKid));
        assert_eq!(peek_header(&numeric), Err(JwtValidationError::MissingKid));
    }

    #[test]
    fn test_peek_header_missing_alg() {
        let token = token_with_header(r#"{"kid":"k1"}"#);
        assert_eq!(peek_header(&token), Err(JwtValidationError::MalformedToken));
    }

    #[test]
    fn test_peek_header_malformed_inputs() {
        assert_eq!(peek_header(""), Err(JwtValidationError::MalformedToken));
        assert_eq!(peek_header("not-a-jwt"), Err(JwtValidationError::MalformedToken));
        assert_eq!(
            peek_header("a.b.c.d"),
            Err(JwtValidationError::MalformedToken)
        );
        assert_eq!(
            peek_header("!!!invalid!!!.payload.signature"),
            Err(JwtValidationError::MalformedToken)
        );
        assert_eq!(
            peek_header(&token_with_header("not-json")),
            Err(JwtValidationError::MalformedToken)
        );
    }

    #[test]
    fn test_oversized_token_rejected_before_parsing() {
        let oversized = "a".repeat(MAX_JWT_SIZE_BYTES + 1);
        assert_eq!(
            extract_kid(&oversized),
            Err(JwtValidationError::TokenTooLarge)
        );
    }

    #[test]
    fn test_token_at_size_limit_is_accepted() {
        let header_b64 = URL_SAFE_NO_PAD.encode(r#"{"alg":"EdDSA","kid":"key"}"#);
        let remaining = MAX_JWT_SIZE_BYTES - header_b64.len() - 2;
        let payload_len = remaining / 2;
        let token = format!(
            "{}.{}.{}",
            header_b64,
            "a".repeat(payload_len),
            "b".repeat(remaining - payload_len)
        );
        assert_eq!(token.len(), MAX_JWT_SIZE_BYTES);

        assert_eq!(extract_kid(&token).unwrap(), "key");
    }

    #[test]
    fn test_validate_iat_boundary() {
        let now = 1_700_000_000_i64;

        assert!(validate_iat_at(now - 3600, DEFAULT_CLOCK_SKEW, now).is_ok());
        assert!(validate_iat_at(now + 300, DEFAULT_CLOCK_SKEW, now).is_ok());
        assert_eq!(
            validate_iat_at(now + 301, DEFAULT_CLOCK_SKEW, now),
            Err(JwtValidationError::IatTooFarInFuture)
        );
    }

    #[test]
    fn test_error_messages_are_generic() {
        let messages: Vec<String> = [
            JwtValidationError::TokenTooLarge,
            JwtValidationError::MalformedToken,
            JwtValidationError::MissingKid,
            JwtValidationError::IatTooFarInFuture,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();

        assert!(messages.iter().all(|m| m == "The identity token is invalid or expired"));
    }

    #[test]
    fn test_decode_ed25519_public_key_jwk() {
        let x = URL_SAFE_NO_PAD.encode([7u8; 32]);
        assert_eq!(decode_ed25519_public_key_jwk(&x).unwrap(), vec![7u8; 32]);
        assert!(decode_ed25519_public_key_jwk("!!!").is_err());
    }
}
