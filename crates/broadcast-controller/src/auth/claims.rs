//! Identity token claims.
//!
//! `sub`, `email` and `name` identify a person and are redacted in Debug
//! output.

use serde::Deserialize;
use std::fmt;

/// Claims read from a verified identity token.
///
/// `aud` and `iss` are checked by the decoder and not kept here.
#[derive(Clone, Deserialize)]
pub struct IdentityClaims {
    pub sub: String,

    /// Expiration (Unix epoch seconds).
    pub exp: i64,

    /// Issued-at (Unix epoch seconds).
    pub iat: i64,

    /// Token type marker, e.g. `id` or `access`.
    #[serde(default)]
    pub token_use: Option<String>,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub name: Option<String>,
}

impl fmt::Debug for IdentityClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityClaims")
            .field("sub", &"[REDACTED]")
            .field("exp", &self.exp)
            .field("iat", &self.iat)
            .field("token_use", &self.token_use)
            .field("email", &self.email.as_ref().map(|_| "[REDACTED]"))
            .field("name", &self.name.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}
