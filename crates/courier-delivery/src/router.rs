//! Destination routing and duplicate suppression.
//!
//! The router picks the destination for a learner event and creates the
//! queue item. Deduplication is day-granular: the same logical event for the
//! same customer, learner and course is queued at most once per UTC day
//! while an earlier item is pending, processing or delivered. The store
//! enforces this atomically, so concurrent producers cannot both win.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use courier_core::{
    error::{CoreError, Result},
    Clock, CustomerId, DeliveryEvent, DestinationConfig, EventHandler, EventType, NewQueueItem,
    NoOpEventHandler, QueueItem, Region,
};
use tracing::{debug, info};

use crate::{metrics as m, storage::DeliveryStorage};

/// A learner event ready to be queued.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    /// Enterprise customer the learner belongs to.
    pub customer_id: CustomerId,
    /// Learner.
    pub user_id: i64,
    /// Course.
    pub course_key: String,
    /// Event kind.
    pub event_type: EventType,
    /// Learner region.
    pub region: Region,
    /// When the event happened. Its UTC day scopes the dedup key.
    pub occurred_at: DateTime<Utc>,
    /// Body to deliver.
    pub payload: serde_json::Value,
}

/// Resolves destinations and enqueues items.
pub struct Router {
    storage: Arc<dyn DeliveryStorage>,
    clock: Arc<dyn Clock>,
    event_handler: Arc<dyn EventHandler>,
}

impl Router {
    /// Creates a router that publishes no events.
    pub fn new(storage: Arc<dyn DeliveryStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock, event_handler: Arc::new(NoOpEventHandler) }
    }

    /// Creates a router that publishes a `Queued` event per enqueue.
    pub fn with_event_handler(
        storage: Arc<dyn DeliveryStorage>,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self { storage, clock, event_handler }
    }

    /// Day-granular idempotency key.
    ///
    /// Format: `{customer_id}:{user_id}:{course_key}:{event_type}:{YYYY-MM-DD}`.
    pub fn dedup_key(
        customer_id: CustomerId,
        user_id: i64,
        course_key: &str,
        event_type: EventType,
        day: NaiveDate,
    ) -> String {
        format!("{customer_id}:{user_id}:{course_key}:{event_type}:{}", day.format("%Y-%m-%d"))
    }

    /// Active destination for a customer and region.
    ///
    /// Falls back to the customer's `OTHER` destination when the region has
    /// none of its own.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotConfigured` when neither exists.
    pub async fn resolve(&self, customer_id: CustomerId, region: Region) -> Result<DestinationConfig> {
        if let Some(destination) = self.storage.find_active_destination(customer_id, region).await? {
            return Ok(destination);
        }

        if region != Region::Other {
            if let Some(destination) =
                self.storage.find_active_destination(customer_id, Region::Other).await?
            {
                debug!(
                    customer_id = %customer_id,
                    region = %region,
                    destination_id = %destination.id,
                    "no regional destination, using OTHER"
                );
                return Ok(destination);
            }
        }

        Err(CoreError::NotConfigured { customer_id, region, reason: None })
    }

    /// Resolves a destination and checks it accepts the event type.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotConfigured` when no destination applies or the
    /// destination has enrollment events switched off.
    pub async fn resolve_for_event(
        &self,
        customer_id: CustomerId,
        region: Region,
        event_type: EventType,
    ) -> Result<DestinationConfig> {
        let destination = self.resolve(customer_id, region).await?;
        if event_type == EventType::CourseEnrollment && !destination.enrollment_events_enabled {
            return Err(CoreError::NotConfigured {
                customer_id,
                region,
                reason: Some("enrollment events disabled".to_string()),
            });
        }
        Ok(destination)
    }

    /// Resolves the destination and creates a pending item, due now.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotConfigured` when no destination applies and
    /// `CoreError::DuplicateEvent` when the dedup key is already held.
    pub async fn enqueue(&self, request: RouteRequest) -> Result<QueueItem> {
        let destination =
            self.resolve_for_event(request.customer_id, request.region, request.event_type).await?;
        self.enqueue_to(&destination, request).await
    }

    /// Creates a pending item for an already resolved destination.
    ///
    /// The item snapshots the destination URL and keeps the learner's own
    /// region even when the destination is the `OTHER` fallback.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::DuplicateEvent` when the dedup key is already held.
    pub async fn enqueue_to(
        &self,
        destination: &DestinationConfig,
        request: RouteRequest,
    ) -> Result<QueueItem> {
        let dedup_key = Self::dedup_key(
            request.customer_id,
            request.user_id,
            &request.course_key,
            request.event_type,
            request.occurred_at.date_naive(),
        );

        let new_item = NewQueueItem {
            customer_id: request.customer_id,
            user_id: request.user_id,
            course_key: request.course_key,
            event_type: request.event_type,
            region: request.region,
            destination_id: destination.id,
            destination_url: destination.url.clone(),
            payload: request.payload,
            dedup_key,
        };

        let now = self.clock.now_utc();
        let item = match self.storage.enqueue(new_item, now).await {
            Ok(item) => item,
            Err(e @ CoreError::DuplicateEvent { .. }) => {
                metrics::counter!(m::DUPLICATES_TOTAL, m::LABEL_EVENT_TYPE => request.event_type.as_str())
                    .increment(1);
                return Err(e);
            },
            Err(e) => return Err(e),
        };

        metrics::counter!(m::QUEUED_TOTAL, m::LABEL_EVENT_TYPE => item.event_type.as_str()).increment(1);
        info!(
            queue_item_id = %item.id,
            customer_id = %item.customer_id,
            destination_id = %item.destination_id,
            event_type = %item.event_type,
            region = %item.region,
            "queued webhook"
        );

        self.event_handler
            .handle_event(DeliveryEvent::Queued {
                queue_item_id: item.id,
                customer_id: item.customer_id,
                destination_id: item.destination_id,
                event_type: item.event_type,
                queued_at: now,
            })
            .await;

        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use courier_core::{QueueStatus, TestClock};
    use serde_json::json;

    use super::*;
    use crate::storage::mock::MockDeliveryStorage;

    fn router(storage: &MockDeliveryStorage, clock: &TestClock) -> Router {
        Router::new(Arc::new(storage.clone()), Arc::new(clock.clone()))
    }

    fn request(customer_id: CustomerId, region: Region, occurred_at: DateTime<Utc>) -> RouteRequest {
        RouteRequest {
            customer_id,
            user_id: 42,
            course_key: "course-v1:edX+DemoX+2024".to_string(),
            event_type: EventType::CourseCompletion,
            region,
            occurred_at,
            payload: json!({"event_type": "course_completion"}),
        }
    }

    fn morning() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).single().unwrap()
    }

    #[test]
    fn dedup_key_is_day_granular() {
        let customer = CustomerId::new();
        let day = morning().date_naive();
        let key = Router::dedup_key(customer, 42, "course-1", EventType::CourseCompletion, day);
        assert_eq!(key, format!("{customer}:42:course-1:course_completion:2024-05-01"));

        let enrollment = Router::dedup_key(customer, 42, "course-1", EventType::CourseEnrollment, day);
        assert_ne!(key, enrollment);
    }

    #[tokio::test]
    async fn resolve_without_destination_is_not_configured() {
        let storage = MockDeliveryStorage::new();
        let router = router(&storage, &TestClock::new());

        let err = router.resolve(CustomerId::new(), Region::Us).await.unwrap_err();
        assert_eq!(err.code(), "E1001");
    }

    #[tokio::test]
    async fn resolve_falls_back_to_other() {
        let storage = MockDeliveryStorage::new();
        let customer = CustomerId::new();
        let other = storage.add_destination_url(customer, Region::Other, "https://other.example").await;
        let router = router(&storage, &TestClock::new());

        assert_eq!(router.resolve(customer, Region::Eu).await.unwrap().id, other.id);

        let eu = storage.add_destination_url(customer, Region::Eu, "https://eu.example").await;
        assert_eq!(router.resolve(customer, Region::Eu).await.unwrap().id, eu.id);
    }

    #[tokio::test]
    async fn inactive_destination_is_not_routed_to() {
        let storage = MockDeliveryStorage::new();
        let customer = CustomerId::new();
        let us = storage.add_destination_url(customer, Region::Us, "https://us.example").await;
        storage.set_destination_active(us.id, false).await;
        let router = router(&storage, &TestClock::new());

        assert!(matches!(
            router.resolve(customer, Region::Us).await,
            Err(CoreError::NotConfigured { .. })
        ));
    }

    #[tokio::test]
    async fn enrollment_gate_applies_only_to_enrollments() {
        let storage = MockDeliveryStorage::new();
        let customer = CustomerId::new();
        let mut us = storage.add_destination_url(customer, Region::Us, "https://us.example").await;
        us.enrollment_events_enabled = false;
        storage.add_destination(us).await;
        let router = router(&storage, &TestClock::new());

        assert!(router.resolve_for_event(customer, Region::Us, EventType::CourseCompletion).await.is_ok());
        let err = router
            .resolve_for_event(customer, Region::Us, EventType::CourseEnrollment)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("enrollment events disabled"));
    }

    #[tokio::test]
    async fn enqueue_creates_pending_item_due_now() {
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::at(morning());
        let customer = CustomerId::new();
        let other = storage.add_destination_url(customer, Region::Other, "https://other.example").await;

        let item = router(&storage, &clock).enqueue(request(customer, Region::Uk, morning())).await.unwrap();

        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.attempt_count, 0);
        assert_eq!(item.next_retry_at, morning());
        assert_eq!(item.destination_id, other.id);
        assert_eq!(item.destination_url, "https://other.example");
        assert_eq!(item.region, Region::Uk);
    }

    #[tokio::test]
    async fn same_day_duplicate_is_rejected_next_day_is_not() {
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::at(morning());
        let customer = CustomerId::new();
        storage.add_destination_url(customer, Region::Us, "https://us.example").await;
        let router = router(&storage, &clock);

        let first = router.enqueue(request(customer, Region::Us, morning())).await.unwrap();
        let evening = morning() + chrono::Duration::hours(12);
        match router.enqueue(request(customer, Region::Us, evening)).await {
            Err(CoreError::DuplicateEvent { existing_id, .. }) => assert_eq!(existing_id, Some(first.id)),
            other => panic!("expected duplicate, got {other:?}"),
        }

        let tomorrow = morning() + chrono::Duration::days(1);
        assert!(router.enqueue(request(customer, Region::Us, tomorrow)).await.is_ok());
        assert_eq!(storage.items().await.len(), 2);
    }

    #[tokio::test]
    async fn cancelled_item_frees_its_key() {
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::at(morning());
        let customer = CustomerId::new();
        storage.add_destination_url(customer, Region::Us, "https://us.example").await;
        let router = router(&storage, &clock);

        let first = router.enqueue(request(customer, Region::Us, morning())).await.unwrap();
        assert!(storage.cancel(first.id, first.attempt_count, "test".into(), morning()).await.unwrap());

        assert!(router.enqueue(request(customer, Region::Us, morning())).await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_enqueues_create_one_item() {
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::at(morning());
        let customer = CustomerId::new();
        storage.add_destination_url(customer, Region::Us, "https://us.example").await;
        let router = Arc::new(router(&storage, &clock));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let router = router.clone();
                tokio::spawn(async move { router.enqueue(request(customer, Region::Us, morning())).await })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert!(e.is_informational()),
            }
        }
        assert_eq!(created, 1);
        assert_eq!(storage.items().await.len(), 1);
    }
}
