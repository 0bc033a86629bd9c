//! Builder for signed speaker identity tokens.

use crate::crypto_fixtures::TestKeypair;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Map, Value};

pub const TEST_ISSUER: &str = "https://idp.test";
pub const TEST_AUDIENCE: &str = "broadcast-app";

/// Builds an EdDSA identity token. Defaults produce a token that a
/// verifier configured with [`TEST_ISSUER`] / [`TEST_AUDIENCE`] accepts
/// at `issued_at`.
#[derive(Debug, Clone)]
pub struct TestTokenBuilder {
    subject: String,
    issuer: String,
    audience: String,
    token_use: Option<String>,
    email: Option<String>,
    issued_at: i64,
    lifetime_secs: i64,
    extra: Map<String, Value>,
}

impl TestTokenBuilder {
    pub fn new(issued_at: i64) -> Self {
        Self {
            subject: "speaker-1".to_string(),
            issuer: TEST_ISSUER.to_string(),
            audience: TEST_AUDIENCE.to_string(),
            token_use: Some("id".to_string()),
            email: None,
            issued_at,
            lifetime_secs: 3600,
            extra: Map::new(),
        }
    }

    pub fn for_user(mut self, subject: &str) -> Self {
        self.subject = subject.to_string();
        self
    }

    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.issuer = issuer.to_string();
        self
    }

    pub fn with_audience(mut self, audience: &str) -> Self {
        self.audience = audience.to_string();
        self
    }

    pub fn with_token_use(mut self, token_use: Option<&str>) -> Self {
        self.token_use = token_use.map(ToString::to_string);
        self
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    /// Negative lifetimes produce an already-expired token.
    pub fn expires_in(mut self, secs: i64) -> Self {
        self.lifetime_secs = secs;
        self
    }

    pub fn with_claim(mut self, name: &str, value: Value) -> Self {
        self.extra.insert(name.to_string(), value);
        self
    }

    pub fn claims(&self) -> Value {
        let mut claims = json!({
            "sub": self.subject,
            "iss": self.issuer,
            "aud": self.audience,
            "iat": self.issued_at,
            "exp": self.issued_at + self.lifetime_secs,
        });
        if let Value::Object(map) = &mut claims {
            if let Some(token_use) = &self.token_use {
                map.insert("token_use".to_string(), json!(token_use));
            }
            if let Some(email) = &self.email {
                map.insert("email".to_string(), json!(email));
            }
            map.extend(self.extra.clone());
        }
        claims
    }

    /// Sign with `key`, stamping its `kid` into the header.
    pub fn sign(&self, key: &TestKeypair) -> String {
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(key.kid.clone());
        encode(&header, &self.claims(), &EncodingKey::from_ed_der(&key.pkcs8))
            .expect("test token should sign")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_claims() {
        let claims = TestTokenBuilder::new(1_700_000_000).claims();

        assert_eq!(claims["sub"], "speaker-1");
        assert_eq!(claims["exp"], 1_700_003_600);
        assert_eq!(claims["token_use"], "id");
    }

    #[test]
    fn test_token_use_can_be_dropped() {
        let claims = TestTokenBuilder::new(0).with_token_use(None).claims();

        assert!(claims.get("token_use").is_none());
    }

    #[test]
    fn test_signed_token_has_three_segments() {
        let key = TestKeypair::from_seed(3, "key-3").unwrap();
        let token = TestTokenBuilder::new(0).sign(&key);

        assert_eq!(token.split('.').count(), 3);
    }
}
