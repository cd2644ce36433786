//! Rate limiter selection at startup.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_delivery::rate_limit::{InMemoryRateLimiter, RateLimiter, RedisRateLimiter};
use tracing::{info, warn};

use crate::config::Config;

/// Builds the Redis limiter when `REDIS_URL` is set, otherwise per-process
/// counters.
///
/// A configured Redis must be reachable at startup. Once connected, the
/// limiter only fails open on individual backend errors.
///
/// # Errors
///
/// Returns error if Redis is configured but still unreachable after
/// `max_retries` further attempts spaced by `retry_delay`.
pub async fn create_rate_limiter(
    config: &Config,
    max_retries: u32,
    retry_delay: Duration,
) -> Result<Arc<dyn RateLimiter>> {
    let rate_config = config.to_rate_limit_config();
    let Some(url) = config.redis_url.as_deref() else {
        info!("Using in-process rate limiter");
        return Ok(Arc::new(InMemoryRateLimiter::new(rate_config)));
    };

    let mut retries = 0;
    loop {
        match RedisRateLimiter::connect(url, rate_config.clone()).await {
            Ok(limiter) => {
                info!("Using Redis rate limiter");
                return Ok(Arc::new(limiter));
            },
            Err(e) if retries < max_retries => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries,
                    error = %e,
                    "Redis connection failed, retrying..."
                );
                tokio::time::sleep(retry_delay).await;
            },
            Err(e) => {
                return Err(e).context("Failed to connect rate limiter to Redis after retries");
            },
        }
    }
}
