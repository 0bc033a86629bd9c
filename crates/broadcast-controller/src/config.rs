//! Broadcast Controller configuration.
//!
//! Configuration is loaded once from environment variables at process start
//! and shared as `Arc<Config>`. Sensitive fields are redacted in Debug output.

use crate::rate_limit::{RateLimitConfig, RateLimitRule};
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::retry::RetryPolicy;
use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket gateway bind address.
pub const DEFAULT_GATEWAY_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health/metrics endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default expected `token_use` claim on speaker identity tokens.
pub const DEFAULT_TOKEN_USE: &str = "id";

/// Default JWKS cache TTL in seconds (1 hour).
pub const DEFAULT_JWKS_CACHE_TTL_SECONDS: u64 = 3600;

/// Minimum spacing between JWKS refreshes triggered by an unknown `kid`.
pub const DEFAULT_JWKS_MIN_REFRESH_INTERVAL_SECONDS: u64 = 30;

/// Default clock skew tolerance for `iat`/`exp` checks.
pub const DEFAULT_CLOCK_SKEW_SECONDS: u64 = 300;

pub const DEFAULT_SUPPORTED_LANGUAGES: &str = "en,es,fr,de,it,pt,ja,ko,zh,ar,hi,ru";
pub const DEFAULT_QUALITY_TIERS: &str = "standard,premium";

/// Default listener cap per session.
pub const DEFAULT_MAX_LISTENERS_PER_SESSION: i64 = 500;

/// Default session record TTL (12 hours).
pub const DEFAULT_SESSION_TTL_SECONDS: u64 = 12 * 3600;

pub const DEFAULT_REFRESH_THRESHOLD_MINUTES: i64 = 100;
pub const DEFAULT_WARNING_THRESHOLD_MINUTES: i64 = 105;

/// Platform hard cap on a single connection's lifetime.
pub const DEFAULT_MAX_CONNECTION_DURATION_MINUTES: i64 = 120;

pub const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60;
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 100;
pub const DEFAULT_SWEEP_MAX_BATCHES: usize = 10;
pub const DEFAULT_STATUS_INTERVAL_SECONDS: u64 = 30;
pub const DEFAULT_STATUS_BATCH_SIZE: usize = 200;

/// Default per-call store timeout in milliseconds.
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2000;

/// Broadcast Controller configuration.
///
/// Assembled once at startup and threaded into every component constructor.
#[derive(Clone)]
pub struct Config {
    /// Redis connection URL. May embed credentials.
    pub redis_url: SecretString,

    /// WebSocket gateway bind address (default: "0.0.0.0:8080").
    pub gateway_bind_address: String,

    /// Health and metrics bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Identity provider JWKS endpoint.
    pub jwks_url: String,

    /// Expected `iss` claim.
    pub token_issuer: String,

    /// Expected `aud` claim.
    pub token_audience: String,

    /// Expected `token_use` claim (default: "id").
    pub token_use: String,

    pub jwks_cache_ttl_seconds: u64,
    pub jwks_min_refresh_interval_seconds: u64,
    pub clock_skew_seconds: u64,

    /// Languages a listener may request.
    pub supported_languages: Vec<String>,

    /// Quality tiers a speaker may request.
    pub quality_tiers: Vec<String>,

    pub max_listeners_per_session: i64,
    pub session_ttl_seconds: u64,

    /// Connection age at which a heartbeat asks the client to refresh.
    pub refresh_threshold_minutes: i64,

    /// Connection age at which a heartbeat also carries a warning.
    pub warning_threshold_minutes: i64,

    /// Platform hard cap on connection lifetime.
    pub max_connection_duration_minutes: i64,

    pub idle_timeout_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub sweep_batch_size: usize,
    pub sweep_max_batches: usize,
    pub status_interval_seconds: u64,
    pub status_batch_size: usize,

    pub store_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limits: RateLimitConfig,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("redis_url", &"[REDACTED]")
            .field("gateway_bind_address", &self.gateway_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("jwks_url", &self.jwks_url)
            .field("token_issuer", &self.token_issuer)
            .field("token_audience", &self.token_audience)
            .field("token_use", &self.token_use)
            .field("jwks_cache_ttl_seconds", &self.jwks_cache_ttl_seconds)
            .field(
                "jwks_min_refresh_interval_seconds",
                &self.jwks_min_refresh_interval_seconds,
            )
            .field("clock_skew_seconds", &self.clock_skew_seconds)
            .field("supported_languages", &self.supported_languages)
            .field("quality_tiers", &self.quality_tiers)
            .field("max_listeners_per_session", &self.max_listeners_per_session)
            .field("session_ttl_seconds", &self.session_ttl_seconds)
            .field("refresh_threshold_minutes", &self.refresh_threshold_minutes)
            .field("warning_threshold_minutes", &self.warning_threshold_minutes)
            .field(
                "max_connection_duration_minutes",
                &self.max_connection_duration_minutes,
            )
            .field("idle_timeout_seconds", &self.idle_timeout_seconds)
            .field("sweep_interval_seconds", &self.sweep_interval_seconds)
            .field("sweep_batch_size", &self.sweep_batch_size)
            .field("sweep_max_batches", &self.sweep_max_batches)
            .field("status_interval_seconds", &self.status_interval_seconds)
            .field("status_batch_size", &self.status_batch_size)
            .field("store_timeout_ms", &self.store_timeout_ms)
            .field("retry", &self.retry)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("rate_limits", &self.rate_limits)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let redis_url = SecretString::from(required(vars, "REDIS_URL")?);
        let jwks_url = required(vars, "BC_JWKS_URL")?;
        let token_issuer = required(vars, "BC_TOKEN_ISSUER")?;
        let token_audience = required(vars, "BC_TOKEN_AUDIENCE")?;

        let gateway_bind_address = vars
            .get("BC_GATEWAY_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_GATEWAY_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("BC_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let token_use = vars
            .get("BC_TOKEN_USE")
            .cloned()
            .unwrap_or_else(|| DEFAULT_TOKEN_USE.to_string());

        let supported_languages = parse_list(
            vars.get("BC_SUPPORTED_LANGUAGES")
                .map_or(DEFAULT_SUPPORTED_LANGUAGES, String::as_str),
        );
        if supported_languages.is_empty() {
            return Err(ConfigError::InvalidValue(
                "BC_SUPPORTED_LANGUAGES must list at least one language".to_string(),
            ));
        }

        let quality_tiers = parse_list(
            vars.get("BC_QUALITY_TIERS")
                .map_or(DEFAULT_QUALITY_TIERS, String::as_str),
        );
        if quality_tiers.is_empty() {
            return Err(ConfigError::InvalidValue(
                "BC_QUALITY_TIERS must list at least one tier".to_string(),
            ));
        }

        let max_listeners_per_session = parse_var(
            vars,
            "BC_MAX_LISTENERS_PER_SESSION",
            DEFAULT_MAX_LISTENERS_PER_SESSION,
        )?;
        if max_listeners_per_session < 1 {
            return Err(ConfigError::InvalidValue(
                "BC_MAX_LISTENERS_PER_SESSION must be at least 1".to_string(),
            ));
        }

        let refresh_threshold_minutes = parse_var(
            vars,
            "BC_REFRESH_THRESHOLD_MINUTES",
            DEFAULT_REFRESH_THRESHOLD_MINUTES,
        )?;
        let warning_threshold_minutes = parse_var(
            vars,
            "BC_WARNING_THRESHOLD_MINUTES",
            DEFAULT_WARNING_THRESHOLD_MINUTES,
        )?;
        let max_connection_duration_minutes = parse_var(
            vars,
            "BC_MAX_CONNECTION_DURATION_MINUTES",
            DEFAULT_MAX_CONNECTION_DURATION_MINUTES,
        )?;

        // refresh < warning < max, all positive
        if refresh_threshold_minutes <= 0
            || refresh_threshold_minutes >= warning_threshold_minutes
            || warning_threshold_minutes >= max_connection_duration_minutes
        {
            return Err(ConfigError::InvalidValue(format!(
                "connection thresholds must satisfy 0 < refresh ({refresh_threshold_minutes}) \
                 < warning ({warning_threshold_minutes}) < max ({max_connection_duration_minutes})"
            )));
        }

        let retry = RetryPolicy {
            max_attempts: parse_var(vars, "BC_RETRY_MAX_ATTEMPTS", RetryPolicy::default().max_attempts)?,
            base_delay: Duration::from_millis(parse_var(vars, "BC_RETRY_BASE_DELAY_MS", 100u64)?),
            multiplier: parse_var(vars, "BC_RETRY_MULTIPLIER", 2.0f64)?,
            max_delay: Duration::from_millis(parse_var(vars, "BC_RETRY_MAX_DELAY_MS", 2000u64)?),
            jitter: parse_var(vars, "BC_RETRY_JITTER", 0.2f64)?,
        };
        if retry.max_attempts == 0 || retry.multiplier < 1.0 || !(0.0..=1.0).contains(&retry.jitter)
        {
            return Err(ConfigError::InvalidValue(
                "retry policy requires attempts >= 1, multiplier >= 1.0 and jitter in [0, 1]"
                    .to_string(),
            ));
        }

        let circuit_breaker = CircuitBreakerConfig {
            failure_threshold: parse_var(
                vars,
                "BC_CIRCUIT_FAILURE_THRESHOLD",
                CircuitBreakerConfig::default().failure_threshold,
            )?,
            cooldown: Duration::from_secs(parse_var(vars, "BC_CIRCUIT_COOLDOWN_SECONDS", 30u64)?),
        };
        if circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "BC_CIRCUIT_FAILURE_THRESHOLD must be at least 1".to_string(),
            ));
        }

        let defaults = RateLimitConfig::default();
        let rate_limits = RateLimitConfig {
            session_create: parse_rule(vars, "SESSION_CREATE", defaults.session_create)?,
            listener_join: parse_rule(vars, "LISTENER_JOIN", defaults.listener_join)?,
            connection_attempt: parse_rule(vars, "CONNECTION_ATTEMPT", defaults.connection_attempt)?,
            heartbeat: parse_rule(vars, "HEARTBEAT", defaults.heartbeat)?,
            audio_chunk: parse_rule(vars, "AUDIO_CHUNK", defaults.audio_chunk)?,
            safety_buffer_seconds: parse_var(
                vars,
                "BC_RATE_LIMIT_SAFETY_BUFFER_SECONDS",
                defaults.safety_buffer_seconds,
            )?,
        };

        let clock_skew_seconds =
            parse_var(vars, "BC_CLOCK_SKEW_SECONDS", DEFAULT_CLOCK_SKEW_SECONDS)?;
        if Duration::from_secs(clock_skew_seconds) > common::jwt::MAX_CLOCK_SKEW {
            return Err(ConfigError::InvalidValue(format!(
                "BC_CLOCK_SKEW_SECONDS must not exceed {}",
                common::jwt::MAX_CLOCK_SKEW.as_secs()
            )));
        }

        Ok(Config {
            redis_url,
            gateway_bind_address,
            health_bind_address,
            jwks_url,
            token_issuer,
            token_audience,
            token_use,
            jwks_cache_ttl_seconds: parse_var(
                vars,
                "BC_JWKS_CACHE_TTL_SECONDS",
                DEFAULT_JWKS_CACHE_TTL_SECONDS,
            )?,
            jwks_min_refresh_interval_seconds: parse_var(
                vars,
                "BC_JWKS_MIN_REFRESH_INTERVAL_SECONDS",
                DEFAULT_JWKS_MIN_REFRESH_INTERVAL_SECONDS,
            )?,
            clock_skew_seconds,
            supported_languages,
            quality_tiers,
            max_listeners_per_session,
            session_ttl_seconds: parse_var(
                vars,
                "BC_SESSION_TTL_SECONDS",
                DEFAULT_SESSION_TTL_SECONDS,
            )?,
            refresh_threshold_minutes,
            warning_threshold_minutes,
            max_connection_duration_minutes,
            idle_timeout_seconds: parse_var(
                vars,
                "BC_IDLE_TIMEOUT_SECONDS",
                DEFAULT_IDLE_TIMEOUT_SECONDS,
            )?,
            sweep_interval_seconds: parse_var(
                vars,
                "BC_SWEEP_INTERVAL_SECONDS",
                DEFAULT_SWEEP_INTERVAL_SECONDS,
            )?,
            sweep_batch_size: parse_var(vars, "BC_SWEEP_BATCH_SIZE", DEFAULT_SWEEP_BATCH_SIZE)?,
            sweep_max_batches: parse_var(vars, "BC_SWEEP_MAX_BATCHES", DEFAULT_SWEEP_MAX_BATCHES)?,
            status_interval_seconds: parse_var(
                vars,
                "BC_STATUS_INTERVAL_SECONDS",
                DEFAULT_STATUS_INTERVAL_SECONDS,
            )?,
            status_batch_size: parse_var(vars, "BC_STATUS_BATCH_SIZE", DEFAULT_STATUS_BATCH_SIZE)?,
            store_timeout_ms: parse_var(vars, "BC_STORE_TIMEOUT_MS", DEFAULT_STORE_TIMEOUT_MS)?,
            retry,
            circuit_breaker,
            rate_limits,
        })
    }

    /// Whether `language` is in the supported set.
    pub fn is_supported_language(&self, language: &str) -> bool {
        self.supported_languages.iter().any(|l| l == language)
    }

    /// Whether `tier` is a known quality tier.
    pub fn is_quality_tier(&self, tier: &str) -> bool {
        self.quality_tiers.iter().any(|t| t == tier)
    }

    /// Connection record TTL: max duration plus one hour of slack.
    pub fn connection_ttl_seconds(&self) -> i64 {
        self.max_connection_duration_minutes * 60 + 3600
    }

    pub fn session_ttl_seconds_i64(&self) -> i64 {
        i64::try_from(self.session_ttl_seconds).unwrap_or(i64::MAX)
    }

    pub fn idle_timeout_ms(&self) -> i64 {
        i64::try_from(self.idle_timeout_seconds.saturating_mul(1000)).unwrap_or(i64::MAX)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn required(vars: &HashMap<String, String>, name: &str) -> Result<String, ConfigError> {
    vars.get(name)
        .filter(|v| !v.trim().is_empty())
        .cloned()
        .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={raw}"))),
    }
}

fn parse_rule(
    vars: &HashMap<String, String>,
    name: &str,
    default: RateLimitRule,
) -> Result<RateLimitRule, ConfigError> {
    let rule = RateLimitRule {
        limit: parse_var(vars, &format!("BC_RATE_LIMIT_{name}_LIMIT"), default.limit)?,
        window_seconds: parse_var(
            vars,
            &format!("BC_RATE_LIMIT_{name}_WINDOW_SECONDS"),
            default.window_seconds,
        )?,
    };
    if rule.limit == 0 || rule.window_seconds == 0 {
        return Err(ConfigError::InvalidValue(format!(
            "BC_RATE_LIMIT_{name}_* must be positive"
        )));
    }
    Ok(rule)
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Minimal variable set for tests.
#[cfg(test)]
pub(crate) fn test_vars() -> HashMap<String, String> {
    HashMap::from([
        (
            "REDIS_URL".to_string(),
            "redis://:hunter2@localhost:6379".to_string(),
        ),
        (
            "BC_JWKS_URL".to_string(),
            "http://localhost:9000/.well-known/jwks.json".to_string(),
        ),
        (
            "BC_TOKEN_ISSUER".to_string(),
            "https://idp.test".to_string(),
        ),
        ("BC_TOKEN_AUDIENCE".to_string(), "broadcast-app".to_string()),
    ])
}

/// Default configuration for unit tests.
#[cfg(test)]
#[allow(clippy::expect_used)]
pub(crate) fn test_config() -> Config {
    Config::from_vars(&test_vars()).expect("test config should load")
}
