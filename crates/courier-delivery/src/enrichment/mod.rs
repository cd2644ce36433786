//! Best-effort learning time enrichment for completion payloads.
//!
//! The adapter asks a [`LearningTimeSource`] how long a learner spent in a
//! course, bounded by a lookup timeout and fronted by an injected
//! [`EnrichmentCache`]. Every failure degrades to "no data": enrichment never
//! blocks or fails a delivery. When the feature is disabled the source is
//! never called.

use std::{sync::Arc, time::Duration};

use courier_core::CustomerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub mod cache;
pub mod source;

pub use cache::{EnrichmentCache, InMemoryEnrichmentCache, RedisEnrichmentCache};
pub use source::{HttpLearningTimeSource, LearningTimeSource};

use crate::metrics as m;

/// Why a lookup produced no data. Never leaves the adapter.
#[derive(Debug, Clone, Error)]
pub enum EnrichmentError {
    /// Lookup exceeded its time budget.
    #[error("enrichment lookup timed out")]
    Timeout,

    /// Source answered with an error status.
    #[error("enrichment source returned HTTP {status}")]
    Upstream {
        /// HTTP status code
        status: u16,
    },

    /// Request could not be sent.
    #[error("enrichment request failed: {0}")]
    Request(String),

    /// Response body was not understood.
    #[error("enrichment response invalid: {0}")]
    Decode(String),

    /// Cache backend failure.
    #[error("enrichment cache error: {0}")]
    Cache(String),
}

/// Enrichment settings, passed explicitly to the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Master switch. When false the source is never invoked.
    pub enabled: bool,
    /// Base URL of the learning time service.
    pub source_url: Option<String>,
    /// Bearer token for the learning time service.
    pub source_token: Option<String>,
    /// Upper bound on a single lookup, cache included.
    pub lookup_timeout: Duration,
    /// Lifetime of cached values.
    pub cache_ttl: Duration,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            source_url: None,
            source_token: None,
            lookup_timeout: Duration::from_secs(2),
            cache_ttl: Duration::from_secs(3600),
        }
    }
}

/// Learning time attached to a completion payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearningTime {
    /// Total seconds.
    pub seconds: i64,
}

impl LearningTime {
    /// Hours rounded to two decimals.
    #[allow(clippy::cast_precision_loss)]
    pub fn hours(&self) -> f64 {
        (self.seconds as f64 / 3600.0 * 100.0).round() / 100.0
    }

    /// Payload representation: `{"seconds": .., "hours": ..}`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "seconds": self.seconds, "hours": self.hours() })
    }
}

/// Cached, time-bounded learning time lookup.
#[derive(Debug, Clone)]
pub struct EnrichmentAdapter {
    config: EnrichmentConfig,
    source: Option<Arc<dyn LearningTimeSource>>,
    cache: Arc<dyn EnrichmentCache>,
}

impl EnrichmentAdapter {
    /// Creates an adapter. Lookups run only if `config.enabled` is set.
    pub fn new(
        config: EnrichmentConfig,
        source: Arc<dyn LearningTimeSource>,
        cache: Arc<dyn EnrichmentCache>,
    ) -> Self {
        Self { config, source: Some(source), cache }
    }

    /// Creates an adapter that never looks anything up.
    pub fn disabled() -> Self {
        Self {
            config: EnrichmentConfig::default(),
            source: None,
            cache: Arc::new(InMemoryEnrichmentCache::new()),
        }
    }

    /// Whether lookups are performed.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.source.is_some()
    }

    /// Looks up learning time for a learner in a course.
    ///
    /// Returns `None` when disabled, when the source has no data, and on any
    /// timeout or error. Only positive answers are cached.
    pub async fn lookup(
        &self,
        user_id: i64,
        course_key: &str,
        customer_id: CustomerId,
    ) -> Option<LearningTime> {
        let source = match &self.source {
            Some(source) if self.config.enabled => source,
            _ => return None,
        };

        let started = std::time::Instant::now();
        let key = cache_key(user_id, course_key, customer_id);

        let result = tokio::time::timeout(self.config.lookup_timeout, async {
            match self.cache.get(&key).await {
                Ok(Some(seconds)) => {
                    metrics::counter!(m::ENRICHMENT_CACHE_HITS_TOTAL).increment(1);
                    return Ok(Some(seconds));
                },
                Ok(None) => {},
                Err(e) => debug!(error = %e, "enrichment cache read failed, treating as miss"),
            }

            let seconds = source.fetch(user_id, course_key, customer_id).await?;
            if let Some(seconds) = seconds {
                if let Err(e) = self.cache.set(&key, seconds, self.config.cache_ttl).await {
                    debug!(error = %e, "enrichment cache write failed");
                }
            }
            Ok::<_, EnrichmentError>(seconds)
        })
        .await
        .unwrap_or(Err(EnrichmentError::Timeout));

        metrics::histogram!(m::ENRICHMENT_LATENCY_SECONDS).record(started.elapsed().as_secs_f64());

        match result {
            Ok(seconds) => seconds.map(|seconds| LearningTime { seconds }),
            Err(e) => {
                metrics::counter!(m::ENRICHMENT_UNAVAILABLE_TOTAL).increment(1);
                warn!(
                    user_id,
                    course_key,
                    customer_id = %customer_id,
                    error = %e,
                    "learning time unavailable, continuing without it"
                );
                None
            },
        }
    }

    /// Lookup timeout in effect.
    pub fn lookup_timeout(&self) -> Duration {
        self.config.lookup_timeout
    }
}

fn cache_key(user_id: i64, course_key: &str, customer_id: CustomerId) -> String {
    format!("courier:learning_time:{customer_id}:{user_id}:{course_key}")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    #[derive(Debug)]
    struct ScriptedSource {
        answer: Result<Option<i64>, EnrichmentError>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(answer: Result<Option<i64>, EnrichmentError>) -> Arc<Self> {
            Arc::new(Self { answer, delay: Duration::ZERO, calls: AtomicUsize::new(0) })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self { answer: Ok(Some(60)), delay, calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl LearningTimeSource for ScriptedSource {
        async fn fetch(
            &self,
            _user_id: i64,
            _course_key: &str,
            _customer_id: CustomerId,
        ) -> Result<Option<i64>, EnrichmentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.answer.clone()
        }
    }

    fn enabled() -> EnrichmentConfig {
        EnrichmentConfig { enabled: true, ..EnrichmentConfig::default() }
    }

    #[tokio::test]
    async fn disabled_adapter_never_calls_source() {
        let source = ScriptedSource::new(Ok(Some(100)));
        let adapter = EnrichmentAdapter::new(
            EnrichmentConfig::default(),
            source.clone(),
            Arc::new(InMemoryEnrichmentCache::new()),
        );

        assert!(!adapter.is_enabled());
        assert_eq!(adapter.lookup(1, "course", CustomerId::new()).await, None);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert_eq!(EnrichmentAdapter::disabled().lookup(1, "c", CustomerId::new()).await, None);
    }

    #[tokio::test]
    async fn positive_results_are_cached() {
        let source = ScriptedSource::new(Ok(Some(5400)));
        let adapter =
            EnrichmentAdapter::new(enabled(), source.clone(), Arc::new(InMemoryEnrichmentCache::new()));
        let customer = CustomerId::new();

        assert_eq!(adapter.lookup(7, "course", customer).await, Some(LearningTime { seconds: 5400 }));
        assert_eq!(adapter.lookup(7, "course", customer).await, Some(LearningTime { seconds: 5400 }));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        adapter.lookup(8, "course", customer).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_data_is_not_cached() {
        let source = ScriptedSource::new(Ok(None));
        let adapter =
            EnrichmentAdapter::new(enabled(), source.clone(), Arc::new(InMemoryEnrichmentCache::new()));
        let customer = CustomerId::new();

        assert_eq!(adapter.lookup(7, "course", customer).await, None);
        assert_eq!(adapter.lookup(7, "course", customer).await, None);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn errors_degrade_to_none() {
        let source = ScriptedSource::new(Err(EnrichmentError::Upstream { status: 500 }));
        let adapter = EnrichmentAdapter::new(enabled(), source, Arc::new(InMemoryEnrichmentCache::new()));

        assert_eq!(adapter.lookup(1, "course", CustomerId::new()).await, None);
    }

    #[tokio::test]
    async fn slow_source_times_out() {
        let source = ScriptedSource::slow(Duration::from_secs(10));
        let config = EnrichmentConfig { lookup_timeout: Duration::from_millis(50), ..enabled() };
        let adapter = EnrichmentAdapter::new(config, source, Arc::new(InMemoryEnrichmentCache::new()));

        let started = std::time::Instant::now();
        assert_eq!(adapter.lookup(1, "course", CustomerId::new()).await, None);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn learning_time_json_includes_rounded_hours() {
        assert_eq!(
            LearningTime { seconds: 5400 }.to_json(),
            serde_json::json!({"seconds": 5400, "hours": 1.5})
        );
        assert_eq!(LearningTime { seconds: 1000 }.hours(), 0.28);
        assert_eq!(LearningTime { seconds: 0 }.to_json(), serde_json::json!({"seconds": 0, "hours": 0.0}));
    }
}
