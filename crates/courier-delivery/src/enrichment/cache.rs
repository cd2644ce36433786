//! Cache backends for enrichment lookups.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_core::{Clock, RealClock};
use redis::AsyncCommands;
use tokio::sync::RwLock;

use super::EnrichmentError;

/// Injected key/value cache with per-entry expiry.
#[async_trait]
pub trait EnrichmentCache: Send + Sync + fmt::Debug {
    /// Returns the cached value if present and not expired.
    async fn get(&self, key: &str) -> Result<Option<i64>, EnrichmentError>;

    /// Stores a value that expires after `ttl`.
    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), EnrichmentError>;
}

/// Process-local cache. Expired entries are dropped on read and on write.
#[derive(Debug)]
pub struct InMemoryEnrichmentCache {
    entries: RwLock<HashMap<String, (i64, std::time::Instant)>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryEnrichmentCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEnrichmentCache {
    /// Creates an empty cache on the real clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(RealClock::new()))
    }

    /// Creates an empty cache whose expiry follows `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { entries: RwLock::new(HashMap::new()), clock }
    }

    /// Number of stored entries, expired or not.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl EnrichmentCache for InMemoryEnrichmentCache {
    async fn get(&self, key: &str) -> Result<Option<i64>, EnrichmentError> {
        let now = self.clock.now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some((value, expires_at)) if *expires_at > now => return Ok(Some(*value)),
                Some(_) => {},
                None => return Ok(None),
            }
        }
        self.entries.write().await.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), EnrichmentError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert(key.to_string(), (value, now + ttl));
        Ok(())
    }
}

/// Cache shared across processes through Redis `SET key value EX ttl`.
#[derive(Clone)]
pub struct RedisEnrichmentCache {
    connection: redis::aio::MultiplexedConnection,
}

impl fmt::Debug for RedisEnrichmentCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisEnrichmentCache").finish_non_exhaustive()
    }
}

impl RedisEnrichmentCache {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `EnrichmentError::Cache` if the URL is invalid or the
    /// connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, EnrichmentError> {
        let client = redis::Client::open(redis_url).map_err(|e| EnrichmentError::Cache(e.to_string()))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| EnrichmentError::Cache(e.to_string()))?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl EnrichmentCache for RedisEnrichmentCache {
    async fn get(&self, key: &str) -> Result<Option<i64>, EnrichmentError> {
        let mut connection = self.connection.clone();
        let value: Option<i64> =
            connection.get(key).await.map_err(|e| EnrichmentError::Cache(e.to_string()))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), EnrichmentError> {
        let mut connection = self.connection.clone();
        let () = connection
            .set_ex(key, value, ttl.as_secs().max(1))
            .await
            .map_err(|e| EnrichmentError::Cache(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use courier_core::TestClock;

    use super::*;

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let clock = TestClock::new();
        let cache = InMemoryEnrichmentCache::with_clock(Arc::new(clock.clone()));

        cache.set("k", 3600, Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(3600));

        clock.advance(Duration::from_secs(61));
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn set_overwrites_and_prunes() {
        let clock = TestClock::new();
        let cache = InMemoryEnrichmentCache::with_clock(Arc::new(clock.clone()));

        cache.set("old", 1, Duration::from_secs(10)).await.unwrap();
        clock.advance(Duration::from_secs(11));
        cache.set("new", 2, Duration::from_secs(10)).await.unwrap();
        cache.set("new", 3, Duration::from_secs(10)).await.unwrap();

        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get("new").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn concurrent_writers_do_not_corrupt_values() {
        let cache = Arc::new(InMemoryEnrichmentCache::new());
        let handles: Vec<_> = (0..50)
            .map(|i| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    cache.set(&format!("key-{}", i % 5), i, Duration::from_secs(60)).await.unwrap();
                    cache.get(&format!("key-{}", i % 5)).await.unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().is_some());
        }
        assert_eq!(cache.len().await, 5);
    }
}
