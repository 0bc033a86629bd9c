//! JWKS client for fetching and caching the identity provider's signing keys.
//!
//! Keys are cached for a configurable TTL. A token signed with a `kid` the
//! cache does not know triggers an early refresh (key rotation), rate limited
//! by a minimum spacing so junk `kid`s cannot hammer the provider. If a
//! refresh fails while an expired cache still holds the requested key, the
//! stale key is served.
//!
//! Fetches go through the `identity-provider` circuit breaker.

use super::AuthorizationError;
use crate::observability::metrics;
use crate::resilience::{CircuitBreaker, CircuitBreakerError};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

/// HTTP timeout for one JWKS fetch.
const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON Web Key. RSA keys carry `n`/`e`, Ed25519 (`OKP`) keys carry `x`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Jwk {
    pub kty: String,
    pub kid: String,

    #[serde(default)]
    pub alg: Option<String>,

    #[serde(default, rename = "use")]
    pub key_use: Option<String>,

    #[serde(default)]
    pub n: Option<String>,

    #[serde(default)]
    pub e: Option<String>,

    #[serde(default)]
    pub crv: Option<String>,

    #[serde(default)]
    pub x: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwksResponse {
    pub keys: Vec<Jwk>,
}

struct CachedJwks {
    keys: HashMap<String, Jwk>,
    expires_at: Instant,
}

pub struct JwksClient {
    jwks_url: String,
    http_client: reqwest::Client,
    cache: RwLock<Option<CachedJwks>>,
    cache_ttl: Duration,
    min_refresh_interval: Duration,
    /// Serializes refreshes and remembers when the last one ran.
    last_refresh: Mutex<Option<Instant>>,
    breaker: Arc<CircuitBreaker>,
}

impl JwksClient {
    pub fn new(
        jwks_url: String,
        cache_ttl: Duration,
        min_refresh_interval: Duration,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(JWKS_FETCH_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(target: "bc.auth.jwks", error = %e, "Failed to build HTTP client with custom config, using defaults");
                reqwest::Client::new()
            });

        Self {
            jwks_url,
            http_client,
            cache: RwLock::new(None),
            cache_ttl,
            min_refresh_interval,
            last_refresh: Mutex::new(None),
            breaker,
        }
    }

    /// Look up a signing key by `kid`, refreshing the cache when needed.
    ///
    /// # Errors
    ///
    /// - `UnknownKey` if the key is absent after a refresh (or a refresh was
    ///   skipped because one ran too recently).
    /// - `ProviderUnavailable` if keys are needed but cannot be fetched.
    #[instrument(skip(self), fields(kid = %kid))]
    pub async fn get_key(&self, kid: &str) -> Result<Jwk, AuthorizationError> {
        let (fresh, cached_key) = {
            let cache = self.cache.read().await;
            match cache.as_ref() {
                Some(c) => (c.expires_at > Instant::now(), c.keys.get(kid).cloned()),
                None => (false, None),
            }
        };

        if fresh {
            if let Some(key) = cached_key {
                tracing::debug!(target: "bc.auth.jwks", "JWKS cache hit");
                return Ok(key);
            }
            if !self.refresh_allowed().await {
                tracing::debug!(target: "bc.auth.jwks", "Unknown kid, refresh too recent");
                return Err(AuthorizationError::UnknownKey);
            }
        }

        match self.refresh_cache().await {
            Ok(()) => {}
            Err(e) => {
                if let Some(stale) = cached_key {
                    tracing::warn!(
                        target: "bc.auth.jwks",
                        "JWKS refresh failed, serving stale key"
                    );
                    metrics::record_degraded("identity-provider");
                    return Ok(stale);
                }
                return Err(e);
            }
        }

        let cache = self.cache.read().await;
        cache
            .as_ref()
            .and_then(|c| c.keys.get(kid).cloned())
            .ok_or_else(|| {
                tracing::warn!(target: "bc.auth.jwks", "Key not found in JWKS after refresh");
                AuthorizationError::UnknownKey
            })
    }

    async fn refresh_allowed(&self) -> bool {
        let last = self.last_refresh.lock().await;
        last.map_or(true, |at| at.elapsed() >= self.min_refresh_interval)
    }

    #[instrument(skip(self))]
    async fn refresh_cache(&self) -> Result<(), AuthorizationError> {
        let mut last_refresh = self.last_refresh.lock().await;

        // Another caller may have refreshed while we waited for the lock
        if let Some(at) = *last_refresh {
            let cache_fresh = self
                .cache
                .read()
                .await
                .as_ref()
                .is_some_and(|c| c.expires_at > Instant::now());
            if cache_fresh && at.elapsed() < self.min_refresh_interval {
                return Ok(());
            }
        }

        let result = self
            .breaker
            .call(|_| true, || self.fetch())
            .await
            .map_err(|e| match e {
                CircuitBreakerError::Open { .. } => {
                    tracing::warn!(target: "bc.auth.jwks", "Identity provider circuit open");
                    AuthorizationError::ProviderUnavailable
                }
                CircuitBreakerError::Inner(inner) => inner,
            });
        *last_refresh = Some(Instant::now());

        let keys = match result {
            Ok(keys) => {
                metrics::record_jwks_refresh("success");
                keys
            }
            Err(e) => {
                metrics::record_jwks_refresh("error");
                return Err(e);
            }
        };

        tracing::info!(
            target: "bc.auth.jwks",
            key_count = keys.len(),
            "JWKS cache refreshed"
        );

        let mut cache = self.cache.write().await;
        *cache = Some(CachedJwks {
            keys,
            expires_at: Instant::now() + self.cache_ttl,
        });
        Ok(())
    }

    async fn fetch(&self) -> Result<HashMap<String, Jwk>, AuthorizationError> {
        tracing::debug!(target: "bc.auth.jwks", url = %self.jwks_url, "Fetching JWKS");

        let response = self
            .http_client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(target: "bc.auth.jwks", error = %e, "Failed to fetch JWKS");
                AuthorizationError::ProviderUnavailable
            })?;

        if !response.status().is_success() {
            tracing::error!(
                target: "bc.auth.jwks",
                status = %response.status(),
                "JWKS endpoint returned error"
            );
            return Err(AuthorizationError::ProviderUnavailable);
        }

        let jwks: JwksResponse = response.json().await.map_err(|e| {
            tracing::error!(target: "bc.auth.jwks", error = %e, "Failed to parse JWKS response");
            AuthorizationError::ProviderUnavailable
        })?;

        Ok(jwks
            .keys
            .into_iter()
            .filter(|k| k.key_use.as_deref().map_or(true, |u| u == "sig"))
            .map(|key| (key.kid.clone(), key))
            .collect())
    }
}
