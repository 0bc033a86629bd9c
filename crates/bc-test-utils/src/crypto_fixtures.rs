//! Deterministic Ed25519 signing keys for identity token tests.
//!
//! The same seed always yields the same keypair, so JWKS documents and
//! tokens are reproducible across runs.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FixtureError {
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),
}

/// An Ed25519 keypair published under a key id.
#[derive(Clone)]
pub struct TestKeypair {
    pub kid: String,
    /// PKCS#8 v1 private key document.
    pub pkcs8: Vec<u8>,
    /// Raw public key, base64url without padding (the JWK `x` member).
    pub public_x: String,
}

impl TestKeypair {
    /// Derive a keypair from `seed`.
    pub fn from_seed(seed: u8, kid: &str) -> Result<Self, FixtureError> {
        let mut seed_bytes = [0u8; 32];
        for (i, byte) in seed_bytes.iter_mut().enumerate() {
            *byte = seed.wrapping_mul(31).wrapping_add(i as u8);
        }

        let pair = Ed25519KeyPair::from_seed_unchecked(&seed_bytes)
            .map_err(|e| FixtureError::Crypto(format!("Failed to derive test keypair: {e:?}")))?;

        Ok(Self {
            kid: kid.to_string(),
            pkcs8: build_pkcs8_from_seed(&seed_bytes),
            public_x: URL_SAFE_NO_PAD.encode(pair.public_key().as_ref()),
        })
    }

    /// Public half as a JWK object.
    pub fn jwk(&self) -> Value {
        json!({
            "kty": "OKP",
            "crv": "Ed25519",
            "kid": self.kid,
            "x": self.public_x,
            "alg": "EdDSA",
            "use": "sig"
        })
    }
}

/// JWKS document publishing `keys`.
pub fn jwks_document(keys: &[&TestKeypair]) -> Value {
    json!({ "keys": keys.iter().map(|k| k.jwk()).collect::<Vec<_>>() })
}

/// PKCS#8 v1 (RFC 5208) wrapping of a raw Ed25519 seed.
fn build_pkcs8_from_seed(seed: &[u8; 32]) -> Vec<u8> {
    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&[0x02, 0x01, 0x00]);
    // AlgorithmIdentifier { 1.3.101.112 }
    pkcs8.extend_from_slice(&[0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70]);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(seed);
    pkcs8
}
