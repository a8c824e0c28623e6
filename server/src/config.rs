//! Configuration management for the server.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tether_engine::DEFAULT_MAX_RETRIES;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL. Without one the server keeps state in memory.
    pub database_url: Option<String>,
    /// Shared secret for bearer tokens. Unset means development mode.
    pub auth_secret: Option<String>,
    /// Spacing between retry loop ticks
    pub retry_interval: Duration,
    /// Delay before the first retry of a failed operation
    pub retry_base_delay: Duration,
    /// Retry budget given to newly enqueued operations
    pub max_retries: u32,
    /// Deadline applied to every engine call made from the HTTP layer
    pub request_timeout: Duration,
    /// Lifetime of selective-sync hints in the KV store
    pub kv_hint_ttl: Duration,
    /// Age after which an orphaned `processing` operation is failed
    pub processing_stale_after: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            database_url: None,
            auth_secret: None,
            retry_interval: Duration::from_secs(300),
            retry_base_delay: Duration::from_secs(60),
            max_retries: DEFAULT_MAX_RETRIES,
            request_timeout: Duration::from_secs(30),
            kv_hint_ttl: Duration::from_secs(3600),
            processing_stale_after: Duration::from_secs(600),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = env::var("HOST").unwrap_or(defaults.host);
        let port = parse_var("PORT", defaults.port)?;

        let database_url = env::var("DATABASE_URL").ok().filter(|url| !url.is_empty());
        let auth_secret = env::var("AUTH_SECRET").ok().filter(|secret| !secret.is_empty());

        let retry_interval = secs_var("RETRY_INTERVAL_SECS", defaults.retry_interval)?;
        if retry_interval.is_zero() {
            return Err(ConfigError::Invalid("RETRY_INTERVAL_SECS"));
        }

        Ok(Self {
            host,
            port,
            database_url,
            auth_secret,
            retry_interval,
            retry_base_delay: secs_var("RETRY_BASE_DELAY_SECS", defaults.retry_base_delay)?,
            max_retries: parse_var("MAX_RETRIES", defaults.max_retries)?,
            request_timeout: secs_var("REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
            kv_hint_ttl: secs_var("KV_HINT_TTL_SECS", defaults.kv_hint_ttl)?,
            processing_stale_after: secs_var(
                "PROCESSING_STALE_SECS",
                defaults.processing_stale_after,
            )?,
        })
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    parse_var(name, default.as_secs()).map(Duration::from_secs)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid {0} value")]
    Invalid(&'static str),
}
