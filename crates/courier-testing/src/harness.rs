//! Deterministic delivery scenarios.
//!
//! [`DeliveryHarness`] wires in-memory storage, a [`TestClock`] and a
//! wiremock destination into a [`DeliveryEngine`]. Tests enqueue items, move
//! the clock and call [`DeliveryHarness::tick`] to run one claim batch,
//! so retry schedules can be walked without waiting.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{Clock, DestinationConfig, QueueItem, QueueItemId, TestClock};
use courier_delivery::{
    rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiter},
    router::Router,
    storage::{mock::MockDeliveryStorage, DeliveryStorage},
    DeliveryConfig, DeliveryEngine,
};
use wiremock::MockServer;

use crate::{
    events::RecordingEventHandler,
    fixtures::{epoch, new_queue_item, DestinationBuilder},
};

/// Path the harness destination listens on.
pub const HOOK_PATH: &str = "/hooks/courier";

/// Engine, storage, clock and destination for one scenario.
pub struct DeliveryHarness {
    /// Queue and destination state.
    pub storage: MockDeliveryStorage,
    /// Clock shared by the engine and router.
    pub clock: TestClock,
    /// Destination HTTP server.
    pub server: MockServer,
    /// Every lifecycle event published by the engine and router.
    pub events: Arc<RecordingEventHandler>,
    engine: DeliveryEngine,
}

impl DeliveryHarness {
    /// Harness with default delivery settings and an in-process limiter.
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be built.
    pub async fn new() -> Result<Self> {
        Self::with_limiter(Arc::new(InMemoryRateLimiter::new(RateLimitConfig::default()))).await
    }

    /// Harness using the given rate limiter.
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be built.
    pub async fn with_limiter(rate_limiter: Arc<dyn RateLimiter>) -> Result<Self> {
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::at(epoch());
        let events = Arc::new(RecordingEventHandler::new());
        let config = DeliveryConfig {
            worker_count: 1,
            poll_interval: Duration::from_millis(10),
            ..DeliveryConfig::default()
        };

        let engine = DeliveryEngine::with_components(
            Arc::new(storage.clone()),
            config,
            rate_limiter,
            Arc::new(clock.clone()),
            events.clone(),
        )
        .context("failed to build delivery engine")?;

        Ok(Self { storage, clock, server: MockServer::start().await, events, engine })
    }

    /// URL of the harness destination.
    pub fn hook_url(&self) -> String {
        format!("{}{HOOK_PATH}", self.server.uri())
    }

    /// Builder pre-pointed at the harness destination.
    pub fn destination_builder(&self) -> DestinationBuilder {
        DestinationBuilder::new().url(self.hook_url())
    }

    /// Stores a destination built from `builder`.
    pub async fn add_destination(&self, builder: DestinationBuilder) -> DestinationConfig {
        let destination = builder.build();
        self.storage.add_destination(destination.clone()).await;
        destination
    }

    /// Enqueues a completion item for `destination`, due now.
    ///
    /// # Errors
    ///
    /// Returns error if the store rejects the item.
    pub async fn enqueue(&self, destination: &DestinationConfig) -> Result<QueueItem> {
        Ok(self.storage.enqueue(new_queue_item(destination), self.clock.now_utc()).await?)
    }

    /// Router sharing the harness storage, clock and event recorder.
    pub fn router(&self) -> Router {
        Router::with_event_handler(
            Arc::new(self.storage.clone()),
            Arc::new(self.clock.clone()),
            self.events.clone(),
        )
    }

    /// The engine under test.
    pub fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }

    /// Runs one claim batch at the current clock time.
    ///
    /// # Errors
    ///
    /// Returns error if claiming fails.
    pub async fn tick(&self) -> Result<usize> {
        Ok(self.engine.process_batch().await?)
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Moves the clock forward by whole seconds.
    pub fn advance_secs(&self, seconds: u64) {
        self.advance(Duration::from_secs(seconds));
    }

    /// Current state of a queue item.
    ///
    /// # Errors
    ///
    /// Returns error if the item does not exist.
    pub async fn item(&self, id: QueueItemId) -> Result<QueueItem> {
        self.storage.item(id).await.with_context(|| format!("queue item {id} not found"))
    }

    /// Seconds between now and the item's next retry.
    ///
    /// # Errors
    ///
    /// Returns error if the item does not exist.
    pub async fn seconds_until_due(&self, id: QueueItemId) -> Result<i64> {
        let item = self.item(id).await?;
        Ok((item.next_retry_at - self.clock.now_utc()).num_seconds())
    }

    /// Requests the destination received so far.
    pub async fn received_requests(&self) -> Vec<wiremock::Request> {
        self.server.received_requests().await.unwrap_or_default()
    }
}
