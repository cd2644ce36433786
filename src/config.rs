//! Configuration for the courier service.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use courier_core::models::MAX_TIMEOUT_SECONDS;
use courier_delivery::{
    client::ClientConfig, enrichment::EnrichmentConfig, rate_limit::RateLimitConfig,
    retry::{RetryPolicy, DEFAULT_BACKOFF_SECONDS},
    worker::DeliveryConfig,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "courier.toml";

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`courier.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// # Example
///
/// ```no_run
/// use courier::config::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
///
/// println!("Health server will bind to {}:{}", config.host, config.port);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Database connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,
    /// Database connection idle timeout in seconds.
    ///
    /// Environment variable: `DATABASE_IDLE_TIMEOUT`
    #[serde(default = "default_idle_timeout", alias = "DATABASE_IDLE_TIMEOUT")]
    pub database_idle_timeout: u64,

    // Health server
    /// Health server bind address.
    ///
    /// Environment variable: `HOST`
    #[serde(default = "default_host", alias = "HOST")]
    pub host: String,
    /// Health server bind port.
    ///
    /// Environment variable: `PORT`
    #[serde(default = "default_port", alias = "PORT")]
    pub port: u16,
    /// Health request timeout in seconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT`
    #[serde(default = "default_request_timeout", alias = "REQUEST_TIMEOUT")]
    pub request_timeout: u64,

    // Workers
    /// Number of concurrent delivery workers.
    ///
    /// Environment variable: `WORKER_POOL_SIZE`
    #[serde(default = "default_worker_count", alias = "WORKER_POOL_SIZE")]
    pub worker_pool_size: usize,
    /// Maximum items claimed per worker batch.
    ///
    /// Environment variable: `WORKER_BATCH_SIZE`
    #[serde(default = "default_batch_size", alias = "WORKER_BATCH_SIZE")]
    pub worker_batch_size: usize,
    /// Idle poll interval in milliseconds.
    ///
    /// Environment variable: `WORKER_POLL_INTERVAL_MS`
    #[serde(default = "default_poll_interval_ms", alias = "WORKER_POLL_INTERVAL_MS")]
    pub worker_poll_interval_ms: u64,
    /// Time allowed for in-flight deliveries on shutdown, in seconds.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout", alias = "SHUTDOWN_TIMEOUT_SECONDS")]
    pub shutdown_timeout_seconds: u64,

    // Stale-claim recovery
    /// Seconds an item may stay `processing` before it is recovered.
    ///
    /// Environment variable: `LEASE_TIMEOUT_SECONDS`
    #[serde(default = "default_lease_timeout", alias = "LEASE_TIMEOUT_SECONDS")]
    pub lease_timeout_seconds: u64,
    /// Seconds between recovery sweeps.
    ///
    /// Environment variable: `RECOVERY_INTERVAL_SECONDS`
    #[serde(default = "default_recovery_interval", alias = "RECOVERY_INTERVAL_SECONDS")]
    pub recovery_interval_seconds: u64,

    // Retry and client
    /// Backoff schedule in seconds, indexed by attempt.
    ///
    /// Environment variable: `RETRY_SCHEDULE_SECONDS`
    #[serde(default = "default_retry_schedule", alias = "RETRY_SCHEDULE_SECONDS")]
    pub retry_schedule_seconds: Vec<u64>,
    /// Request timeout for destinations that carry none, in seconds.
    ///
    /// Environment variable: `DELIVERY_TIMEOUT_SECONDS`
    #[serde(default = "default_delivery_timeout", alias = "DELIVERY_TIMEOUT_SECONDS")]
    pub delivery_timeout_seconds: u64,
    /// TCP connect timeout in seconds.
    ///
    /// Environment variable: `CONNECT_TIMEOUT_SECONDS`
    #[serde(default = "default_connect_timeout", alias = "CONNECT_TIMEOUT_SECONDS")]
    pub connect_timeout_seconds: u64,

    // Rate limiting
    /// Redis URL for the shared rate limiter and enrichment cache. Without
    /// it both stay in-process.
    ///
    /// Environment variable: `REDIS_URL`
    #[serde(default, alias = "REDIS_URL")]
    pub redis_url: Option<String>,
    /// Rate limit window in seconds.
    ///
    /// Environment variable: `RATE_LIMIT_WINDOW_SECONDS`
    #[serde(default = "default_rate_limit_window", alias = "RATE_LIMIT_WINDOW_SECONDS")]
    pub rate_limit_window_seconds: u64,

    // Enrichment
    /// Whether completion payloads are enriched with learning time.
    ///
    /// Environment variable: `ENRICHMENT_ENABLED`
    #[serde(default, alias = "ENRICHMENT_ENABLED")]
    pub enrichment_enabled: bool,
    /// Base URL of the learning time service.
    ///
    /// Environment variable: `ENRICHMENT_URL`
    #[serde(default, alias = "ENRICHMENT_URL")]
    pub enrichment_url: Option<String>,
    /// Bearer token for the learning time service.
    ///
    /// Environment variable: `ENRICHMENT_TOKEN`
    #[serde(default, alias = "ENRICHMENT_TOKEN", skip_serializing)]
    pub enrichment_token: Option<String>,
    /// Upper bound on a single lookup in milliseconds.
    ///
    /// Environment variable: `ENRICHMENT_TIMEOUT_MS`
    #[serde(default = "default_enrichment_timeout_ms", alias = "ENRICHMENT_TIMEOUT_MS")]
    pub enrichment_timeout_ms: u64,
    /// Lifetime of cached lookups in seconds.
    ///
    /// Environment variable: `ENRICHMENT_CACHE_TTL_SECONDS`
    #[serde(default = "default_enrichment_cache_ttl", alias = "ENRICHMENT_CACHE_TTL_SECONDS")]
    pub enrichment_cache_ttl_seconds: u64,

    // Logging
    /// Log filter directives.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
    /// Log output format, `text` or `json`.
    ///
    /// Environment variable: `LOG_FORMAT`
    #[serde(default = "default_log_format", alias = "LOG_FORMAT")]
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides, then validate it.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Convert to the delivery engine configuration.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            worker_count: self.worker_pool_size,
            batch_size: self.worker_batch_size,
            poll_interval: Duration::from_millis(self.worker_poll_interval_ms),
            client_config: self.to_client_config(),
            retry_policy: self.to_retry_policy(),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
            lease_timeout: Duration::from_secs(self.lease_timeout_seconds),
            maintenance_interval: Duration::from_secs(self.recovery_interval_seconds),
        }
    }

    /// Convert to client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            default_timeout: Duration::from_secs(self.delivery_timeout_seconds),
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds),
            ..ClientConfig::default()
        }
    }

    /// Convert to retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_schedule(self.retry_schedule_seconds.clone())
    }

    /// Convert to rate limiter configuration.
    pub fn to_rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            window: Duration::from_secs(self.rate_limit_window_seconds),
            ..RateLimitConfig::default()
        }
    }

    /// Convert to enrichment configuration.
    pub fn to_enrichment_config(&self) -> EnrichmentConfig {
        EnrichmentConfig {
            enabled: self.enrichment_enabled,
            source_url: self.enrichment_url.clone(),
            source_token: self.enrichment_token.clone(),
            lookup_timeout: Duration::from_millis(self.enrichment_timeout_ms),
            cache_ttl: Duration::from_secs(self.enrichment_cache_ttl_seconds),
        }
    }

    /// Parse the health server socket address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// Database URL with the password masked for logging.
    pub fn database_url_masked(&self) -> String {
        mask_password(&self.database_url)
    }

    /// Redis URL with the password masked for logging.
    pub fn redis_url_masked(&self) -> Option<String> {
        self.redis_url.as_deref().map(mask_password)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database min_connections cannot exceed max_connections");
        }

        if self.worker_pool_size == 0 {
            anyhow::bail!("worker_pool_size must be greater than 0");
        }

        if self.worker_batch_size == 0 {
            anyhow::bail!("worker_batch_size must be greater than 0");
        }

        if self.worker_poll_interval_ms == 0 {
            anyhow::bail!("worker_poll_interval_ms must be greater than 0");
        }

        let max_timeout = u64::try_from(MAX_TIMEOUT_SECONDS).unwrap_or(300);
        if self.lease_timeout_seconds <= max_timeout {
            anyhow::bail!(
                "lease_timeout_seconds must exceed the maximum destination timeout ({max_timeout}s)"
            );
        }

        if self.recovery_interval_seconds == 0 {
            anyhow::bail!("recovery_interval_seconds must be greater than 0");
        }

        if self.retry_schedule_seconds.is_empty() {
            anyhow::bail!("retry_schedule_seconds must not be empty");
        }

        if self.retry_schedule_seconds.windows(2).any(|pair| pair[0] > pair[1]) {
            anyhow::bail!("retry_schedule_seconds must be non-decreasing");
        }

        if self.rate_limit_window_seconds == 0 {
            anyhow::bail!("rate_limit_window_seconds must be greater than 0");
        }

        if self.enrichment_enabled && self.enrichment_url.is_none() {
            anyhow::bail!("enrichment_url is required when enrichment is enabled");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            database_idle_timeout: default_idle_timeout(),
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            worker_pool_size: default_worker_count(),
            worker_batch_size: default_batch_size(),
            worker_poll_interval_ms: default_poll_interval_ms(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            lease_timeout_seconds: default_lease_timeout(),
            recovery_interval_seconds: default_recovery_interval(),
            retry_schedule_seconds: default_retry_schedule(),
            delivery_timeout_seconds: default_delivery_timeout(),
            connect_timeout_seconds: default_connect_timeout(),
            redis_url: None,
            rate_limit_window_seconds: default_rate_limit_window(),
            enrichment_enabled: false,
            enrichment_url: None,
            enrichment_token: None,
            enrichment_timeout_ms: default_enrichment_timeout_ms(),
            enrichment_cache_ttl_seconds: default_enrichment_cache_ttl(),
            rust_log: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if !url[colon_pos + 1..].starts_with("//") {
                let mut masked = url.to_string();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
    }
    url.to_string()
}

fn default_database_url() -> String {
    "postgresql://localhost/courier".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    10
}

fn default_worker_count() -> usize {
    courier_delivery::DEFAULT_WORKER_COUNT
}

fn default_batch_size() -> usize {
    courier_delivery::DEFAULT_BATCH_SIZE
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_lease_timeout() -> u64 {
    600
}

fn default_recovery_interval() -> u64 {
    30
}

fn default_retry_schedule() -> Vec<u64> {
    DEFAULT_BACKOFF_SECONDS.to_vec()
}

fn default_delivery_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_rate_limit_window() -> u64 {
    60
}

fn default_enrichment_timeout_ms() -> u64 {
    2000
}

fn default_enrichment_cache_ttl() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info,courier=debug".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}
