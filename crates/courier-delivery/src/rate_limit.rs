//! Per-destination outbound rate limiting.
//!
//! Fixed one-minute windows keyed by destination. The counter for a window
//! is incremented atomically and expires shortly after the window closes.
//! Two backends share the [`RateLimiter`] trait: an in-process map for
//! single-node deployments and tests, and Redis for multiple worker
//! processes. Backend failures allow the request; an unavailable limiter
//! must not stall delivery.

use std::{collections::HashMap, fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{DestinationConfig, DestinationId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{DeliveryError, Result};

/// Configuration for rate limiting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Window length.
    pub window: Duration,
    /// Extra lifetime of a window counter after the window ends.
    pub expiry_margin: Duration,
    /// Prefix for Redis keys.
    pub key_prefix: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            expiry_margin: Duration::from_secs(5),
            key_prefix: "courier:ratelimit".to_string(),
        }
    }
}

impl RateLimitConfig {
    fn window_secs(&self) -> i64 {
        i64::try_from(self.window.as_secs().max(1)).unwrap_or(60)
    }

    /// Start of the window containing `now`, as a Unix timestamp.
    pub fn window_start(&self, now: DateTime<Utc>) -> i64 {
        let ts = now.timestamp();
        ts - ts.rem_euclid(self.window_secs())
    }

    /// Whole seconds until the window containing `now` closes, at least 1.
    pub fn seconds_until_next_window(&self, now: DateTime<Utc>) -> u64 {
        let end = self.window_start(now) + self.window_secs();
        u64::try_from((end - now.timestamp()).max(1)).unwrap_or(1)
    }

    fn counter_ttl_secs(&self) -> u64 {
        self.window.as_secs().max(1) + self.expiry_margin.as_secs()
    }

    fn key(&self, destination_id: DestinationId, window_start: i64) -> String {
        format!("{}:{}:{}", self.key_prefix, destination_id, window_start)
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request may be sent now.
    pub allowed: bool,
    /// When denied, seconds until the window resets.
    pub retry_after_seconds: u64,
    /// Requests counted in the current window, including this one.
    pub current_count: u64,
}

impl RateDecision {
    fn allow(current_count: u64) -> Self {
        Self { allowed: true, retry_after_seconds: 0, current_count }
    }
}

/// Gate consulted before every outbound request.
#[async_trait]
pub trait RateLimiter: Send + Sync + fmt::Debug {
    /// Counts one request against the destination's current window.
    async fn check(&self, destination: &DestinationConfig, now: DateTime<Utc>) -> RateDecision;
}

fn decide(
    config: &RateLimitConfig,
    destination: &DestinationConfig,
    count: u64,
    now: DateTime<Utc>,
) -> RateDecision {
    let limit = u64::try_from(destination.requests_per_minute.max(1)).unwrap_or(1);
    if count <= limit {
        return RateDecision::allow(count);
    }

    let retry_after_seconds = config.seconds_until_next_window(now);
    debug!(
        destination_id = %destination.id,
        count,
        limit,
        retry_after_seconds,
        "rate limit window exhausted"
    );
    RateDecision { allowed: false, retry_after_seconds, current_count: count }
}

/// Rate limiter backed by an in-process map.
#[derive(Debug, Default)]
pub struct InMemoryRateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<(DestinationId, i64), u64>>,
}

impl InMemoryRateLimiter {
    /// Creates an in-process limiter.
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, windows: Mutex::new(HashMap::new()) }
    }

    /// Number of live window counters.
    pub async fn tracked_windows(&self) -> usize {
        self.windows.lock().await.len()
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn check(&self, destination: &DestinationConfig, now: DateTime<Utc>) -> RateDecision {
        let window_start = self.config.window_start(now);
        let ttl = i64::try_from(self.config.counter_ttl_secs()).unwrap_or(65);

        let count = {
            let mut windows = self.windows.lock().await;
            windows.retain(|(_, start), _| start + ttl > now.timestamp());
            let counter = windows.entry((destination.id, window_start)).or_insert(0);
            *counter += 1;
            *counter
        };

        decide(&self.config, destination, count, now)
    }
}

/// Rate limiter shared across processes through Redis.
///
/// Each check runs `INCR` and `EXPIRE` in one atomic pipeline on
/// `{prefix}:{destination_id}:{window_start}`.
#[derive(Clone)]
pub struct RedisRateLimiter {
    config: RateLimitConfig,
    connection: redis::aio::MultiplexedConnection,
}

impl fmt::Debug for RedisRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisRateLimiter").field("config", &self.config).finish_non_exhaustive()
    }
}

impl RedisRateLimiter {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` for an invalid URL and
    /// `DeliveryError::NetworkError` if the connection fails.
    pub async fn connect(redis_url: &str, config: RateLimitConfig) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| DeliveryError::configuration(format!("invalid redis url: {e}")))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| DeliveryError::network(format!("redis connection failed: {e}")))?;
        Ok(Self { config, connection })
    }

    async fn increment(&self, key: &str) -> redis::RedisResult<u64> {
        let mut connection = self.connection.clone();
        let ttl = i64::try_from(self.config.counter_ttl_secs()).unwrap_or(65);
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .expire(key, ttl)
            .ignore()
            .query_async(&mut connection)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check(&self, destination: &DestinationConfig, now: DateTime<Utc>) -> RateDecision {
        let key = self.config.key(destination.id, self.config.window_start(now));
        match self.increment(&key).await {
            Ok(count) => decide(&self.config, destination, count, now),
            Err(e) => {
                warn!(
                    destination_id = %destination.id,
                    error = %e,
                    "rate limiter unavailable, allowing request"
                );
                RateDecision::allow(0)
            },
        }
    }
}

/// Limiter that never denies.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedRateLimiter;

#[async_trait]
impl RateLimiter for UnlimitedRateLimiter {
    async fn check(&self, _destination: &DestinationConfig, _now: DateTime<Utc>) -> RateDecision {
        RateDecision::allow(0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use courier_core::{CustomerId, Region};

    use super::*;

    fn destination(requests_per_minute: i32) -> DestinationConfig {
        let now = Utc::now();
        DestinationConfig {
            id: DestinationId::new(),
            customer_id: CustomerId::new(),
            region: Region::Us,
            url: "https://hooks.example.com".into(),
            bearer_token: None,
            timeout_seconds: 30,
            max_retries: 3,
            requests_per_minute,
            is_active: true,
            enrollment_events_enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).single().unwrap() + chrono::Duration::seconds(secs.into())
    }

    #[tokio::test]
    async fn allows_up_to_limit_then_denies() {
        let limiter = InMemoryRateLimiter::new(RateLimitConfig::default());
        let dest = destination(3);

        for _ in 0..3 {
            assert!(limiter.check(&dest, at(10)).await.allowed);
        }
        let denied = limiter.check(&dest, at(15)).await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_seconds, 45);
        assert_eq!(denied.current_count, 4);
    }

    #[tokio::test]
    async fn next_window_resets_counter() {
        let limiter = InMemoryRateLimiter::new(RateLimitConfig::default());
        let dest = destination(1);

        assert!(limiter.check(&dest, at(0)).await.allowed);
        assert!(!limiter.check(&dest, at(59)).await.allowed);
        assert!(limiter.check(&dest, at(60)).await.allowed);
    }

    #[tokio::test]
    async fn destinations_are_counted_separately() {
        let limiter = InMemoryRateLimiter::new(RateLimitConfig::default());
        let first = destination(1);
        let second = destination(1);

        assert!(limiter.check(&first, at(0)).await.allowed);
        assert!(limiter.check(&second, at(0)).await.allowed);
        assert!(!limiter.check(&first, at(1)).await.allowed);
    }

    #[tokio::test]
    async fn expired_windows_are_evicted() {
        let limiter = InMemoryRateLimiter::new(RateLimitConfig::default());
        let dest = destination(10);

        limiter.check(&dest, at(0)).await;
        limiter.check(&dest, at(60)).await;
        limiter.check(&dest, at(300)).await;
        assert_eq!(limiter.tracked_windows().await, 1);
    }

    #[tokio::test]
    async fn concurrent_checks_never_exceed_limit() {
        let limiter = Arc::new(InMemoryRateLimiter::new(RateLimitConfig::default()));
        let dest = Arc::new(destination(25));

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let limiter = limiter.clone();
                let dest = dest.clone();
                tokio::spawn(async move { limiter.check(&dest, at(5)).await.allowed })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 25);
    }

    #[test]
    fn window_math() {
        let config = RateLimitConfig::default();
        assert_eq!(config.window_start(at(75)), at(60).timestamp());
        assert_eq!(config.seconds_until_next_window(at(75)), 45);
        assert_eq!(config.seconds_until_next_window(at(60)), 60);
        assert_eq!(config.counter_ttl_secs(), 65);
    }

    #[tokio::test]
    async fn unreachable_redis_fails_to_connect() {
        let result = RedisRateLimiter::connect("redis://127.0.0.1:1/", RateLimitConfig::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unlimited_always_allows() {
        let dest = destination(1);
        for _ in 0..5 {
            assert!(UnlimitedRateLimiter.check(&dest, at(0)).await.allowed);
        }
    }
}
