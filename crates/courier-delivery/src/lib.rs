//! Webhook delivery engine for course events.
//!
//! Turns learner events into queue items and delivers them to each
//! customer's configured destination.
//!
//! # Architecture
//!
//! Ingestion and delivery are decoupled by the durable queue:
//!
//! 1. **Dispatch** - event handlers filter events and build payloads
//! 2. **Route** - the router resolves the destination for the learner's
//!    region and enqueues once per dedup key
//! 3. **Claim** - workers claim due items with `FOR UPDATE SKIP LOCKED`
//! 4. **Gate** - the per-destination rate limiter defers over-budget attempts
//!    without spending a retry
//! 5. **Deliver** - the HTTP client posts the payload with a bearer token
//! 6. **Record** - outcomes are written back with status guards; transient
//!    failures follow the fixed backoff schedule
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{RealClock, Storage};
//! use courier_delivery::{DeliveryConfig, DeliveryEngine, DeliveryError, PostgresDeliveryStorage};
//!
//! # async fn example(storage: Storage) -> std::result::Result<(), DeliveryError> {
//! let storage = Arc::new(PostgresDeliveryStorage::new(Arc::new(storage)));
//! let mut engine = DeliveryEngine::new(storage, DeliveryConfig::default(), Arc::new(RealClock::new()))?;
//!
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod enrichment;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod payload;
pub mod rate_limit;
pub mod retry;
pub mod router;
pub mod storage;
pub mod worker;
mod worker_pool;

pub use client::{ClientConfig, DeliveryClient, DeliveryRequest, DeliveryResponse};
pub use enrichment::{EnrichmentAdapter, EnrichmentConfig, LearningTime};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use ingest::{
    CompletionHandler, EnrollmentHandler, EventDispatcher, EventRecord, EventTypeHandler,
    IngestOutcome,
};
pub use rate_limit::{
    InMemoryRateLimiter, RateDecision, RateLimitConfig, RateLimiter, RedisRateLimiter,
    UnlimitedRateLimiter,
};
pub use retry::{RetryContext, RetryDecision, RetryPolicy};
pub use router::{RouteRequest, Router};
pub use storage::{DeliveryStorage, PostgresDeliveryStorage};
pub use worker::{DeliveryConfig, DeliveryEngine, DeliveryWorker, EngineStats};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default number of items claimed per batch.
pub const DEFAULT_BATCH_SIZE: usize = 10;
