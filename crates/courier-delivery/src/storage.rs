//! Storage abstraction layer for routing and delivery.
//!
//! The router and workers talk to the queue through [`DeliveryStorage`].
//! Production uses [`PostgresDeliveryStorage`] over the core repositories;
//! tests use [`mock::MockDeliveryStorage`], an in-memory implementation of
//! the same state machine.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use courier_core::{
    error::Result,
    storage::queue_items::StaleRecovery,
    CustomerId, DestinationConfig, DestinationId, NewQueueItem, QueueBacklog, QueueItem,
    QueueItemId, Region, ResponseSnapshot,
};

/// Boxed future returned by storage operations.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage operations required by the router and delivery workers.
///
/// Transition methods take the attempt count of the caller's claim and
/// return `Ok(true)` when applied and `Ok(false)` when the item was no longer
/// in the expected status or had been claimed again since. Callers treat
/// `false` as "someone else owns this item now" and move on.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Finds a destination configuration by id, active or not.
    fn find_destination(&self, id: DestinationId) -> StorageFuture<'_, Option<DestinationConfig>>;

    /// Finds the active configuration for a customer and region.
    fn find_active_destination(
        &self,
        customer_id: CustomerId,
        region: Region,
    ) -> StorageFuture<'_, Option<DestinationConfig>>;

    /// Creates a pending item due at `now`.
    ///
    /// Fails with `CoreError::DuplicateEvent` if an item in pending,
    /// processing or success already holds the dedup key. The check and the
    /// insert are atomic.
    fn enqueue(&self, item: NewQueueItem, now: DateTime<Utc>) -> StorageFuture<'_, QueueItem>;

    /// Finds a queue item by id.
    fn find_queue_item(&self, id: QueueItemId) -> StorageFuture<'_, Option<QueueItem>>;

    /// Claims up to `batch_size` due items, oldest due first.
    ///
    /// Each claimed item moves to `processing` with its attempt count
    /// incremented. Concurrent callers never receive the same item.
    fn claim_due(&self, batch_size: usize, now: DateTime<Utc>) -> StorageFuture<'_, Vec<QueueItem>>;

    /// Claims one specific item if it is pending and due.
    fn claim(&self, id: QueueItemId, now: DateTime<Utc>) -> StorageFuture<'_, Option<QueueItem>>;

    /// Restarts the lease of a claimed item at `now`.
    fn renew_claim(&self, id: QueueItemId, attempt: i32, now: DateTime<Utc>) -> StorageFuture<'_, bool>;

    /// Returns a rate-limited item to `pending` and gives back its attempt.
    fn release_rate_limited(
        &self,
        id: QueueItemId,
        attempt: i32,
        next_retry_at: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Records a 2xx response. Terminal.
    fn mark_success(
        &self,
        id: QueueItemId,
        attempt: i32,
        response: ResponseSnapshot,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Returns a transiently failed item to `pending` at `next_retry_at`.
    fn schedule_retry(
        &self,
        id: QueueItemId,
        attempt: i32,
        next_retry_at: DateTime<Utc>,
        error: String,
        response: Option<ResponseSnapshot>,
    ) -> StorageFuture<'_, bool>;

    /// Records a permanent failure. Terminal.
    fn mark_failed(
        &self,
        id: QueueItemId,
        attempt: i32,
        error: String,
        response: Option<ResponseSnapshot>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Cancels a pending or processing item. Terminal.
    fn cancel(
        &self,
        id: QueueItemId,
        attempt: i32,
        reason: String,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Recovers items stuck in `processing` since before `lease_cutoff`.
    fn recover_stale(
        &self,
        lease_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, StaleRecovery>;

    /// Pending and processing counts plus the oldest pending item.
    fn backlog(&self) -> StorageFuture<'_, QueueBacklog>;

    /// Round-trips to the backing store.
    fn ping(&self) -> StorageFuture<'_, ()>;
}

/// Production storage implementation using PostgreSQL.
pub struct PostgresDeliveryStorage {
    storage: Arc<courier_core::storage::Storage>,
}

impl PostgresDeliveryStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<courier_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn find_destination(&self, id: DestinationId) -> StorageFuture<'_, Option<DestinationConfig>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.destinations.find_by_id(id).await })
    }

    fn find_active_destination(
        &self,
        customer_id: CustomerId,
        region: Region,
    ) -> StorageFuture<'_, Option<DestinationConfig>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.destinations.find_active(customer_id, region).await })
    }

    fn enqueue(&self, item: NewQueueItem, now: DateTime<Utc>) -> StorageFuture<'_, QueueItem> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_items.create(&item, now).await })
    }

    fn find_queue_item(&self, id: QueueItemId) -> StorageFuture<'_, Option<QueueItem>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_items.find_by_id(id).await })
    }

    fn claim_due(&self, batch_size: usize, now: DateTime<Utc>) -> StorageFuture<'_, Vec<QueueItem>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_items.claim_due(batch_size, now).await })
    }

    fn claim(&self, id: QueueItemId, now: DateTime<Utc>) -> StorageFuture<'_, Option<QueueItem>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_items.claim(id, now).await })
    }

    fn renew_claim(&self, id: QueueItemId, attempt: i32, now: DateTime<Utc>) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_items.renew_claim(id, attempt, now).await })
    }

    fn release_rate_limited(
        &self,
        id: QueueItemId,
        attempt: i32,
        next_retry_at: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_items.release_rate_limited(id, attempt, next_retry_at).await })
    }

    fn mark_success(
        &self,
        id: QueueItemId,
        attempt: i32,
        response: ResponseSnapshot,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_items.mark_success(id, attempt, &response, now).await })
    }

    fn schedule_retry(
        &self,
        id: QueueItemId,
        attempt: i32,
        next_retry_at: DateTime<Utc>,
        error: String,
        response: Option<ResponseSnapshot>,
    ) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage
                .queue_items
                .schedule_retry(id, attempt, next_retry_at, &error, response.as_ref())
                .await
        })
    }

    fn mark_failed(
        &self,
        id: QueueItemId,
        attempt: i32,
        error: String,
        response: Option<ResponseSnapshot>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.queue_items.mark_failed(id, attempt, &error, response.as_ref(), now).await
        })
    }

    fn cancel(
        &self,
        id: QueueItemId,
        attempt: i32,
        reason: String,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_items.cancel(id, attempt, &reason, now).await })
    }

    fn recover_stale(
        &self,
        lease_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, StaleRecovery> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_items.recover_stale(lease_cutoff, now).await })
    }

    fn backlog(&self) -> StorageFuture<'_, QueueBacklog> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_items.backlog().await })
    }

    fn ping(&self) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.health_check().await })
    }
}

pub mod mock {
    //! In-memory storage for testing routing and delivery without a database.
    //!
    //! Implements the same transitions as the Postgres repository, each under
    //! a single write lock, so concurrency tests exercise real semantics.
    //! Supports injecting claim failures and editing destinations mid-test.

    use std::{collections::HashMap, sync::Arc};

    use chrono::{DateTime, Utc};
    use courier_core::{
        error::{CoreError, Result},
        models::{DEFAULT_MAX_RETRIES, DEFAULT_REQUESTS_PER_MINUTE, DEFAULT_TIMEOUT_SECONDS},
        storage::queue_items::StaleRecovery,
        validate_destination, CustomerId, DestinationConfig, DestinationId, NewDestination,
        NewQueueItem, QueueBacklog, QueueItem, QueueItemId, QueueStatus, Region, ResponseSnapshot,
    };
    use tokio::sync::RwLock;

    use super::{DeliveryStorage, StorageFuture};

    /// Mock storage backed by in-memory maps.
    #[derive(Clone, Default)]
    pub struct MockDeliveryStorage {
        destinations: Arc<RwLock<HashMap<DestinationId, DestinationConfig>>>,
        items: Arc<RwLock<HashMap<QueueItemId, QueueItem>>>,
        claim_error: Arc<RwLock<Option<String>>>,
        unavailable: Arc<RwLock<bool>>,
    }

    impl MockDeliveryStorage {
        /// Creates a new mock storage with empty state.
        pub fn new() -> Self {
            Self::default()
        }

        /// Validates and stores a new active destination.
        ///
        /// Applies the same URL policy and one-active-per-region rule as the
        /// Postgres repository.
        ///
        /// # Errors
        ///
        /// Returns `CoreError::ConfigurationInvalid` if validation fails and
        /// `CoreError::ConstraintViolation` if the region is already served.
        pub async fn create_destination(
            &self,
            new: &NewDestination,
            now: DateTime<Utc>,
        ) -> Result<DestinationConfig> {
            validate_destination(new)?;

            let mut destinations = self.destinations.write().await;
            if destinations
                .values()
                .any(|d| d.is_active && d.customer_id == new.customer_id && d.region == new.region)
            {
                return Err(CoreError::ConstraintViolation(format!(
                    "customer {} already has an active {} destination",
                    new.customer_id, new.region
                )));
            }

            let destination = DestinationConfig {
                id: DestinationId::new(),
                customer_id: new.customer_id,
                region: new.region,
                url: new.url.trim().to_string(),
                bearer_token: new.bearer_token.clone(),
                timeout_seconds: new.timeout_seconds,
                max_retries: new.max_retries,
                requests_per_minute: new.requests_per_minute,
                is_active: true,
                enrollment_events_enabled: new.enrollment_events_enabled,
                created_at: now,
                updated_at: now,
            };
            destinations.insert(destination.id, destination.clone());
            Ok(destination)
        }

        /// Stores a destination configuration as-is, skipping validation.
        pub async fn add_destination(&self, destination: DestinationConfig) {
            self.destinations.write().await.insert(destination.id, destination);
        }

        /// Adds an active destination with default settings.
        pub async fn add_destination_url(
            &self,
            customer_id: CustomerId,
            region: Region,
            url: impl Into<String>,
        ) -> DestinationConfig {
            let now = Utc::now();
            let destination = DestinationConfig {
                id: DestinationId::new(),
                customer_id,
                region,
                url: url.into(),
                bearer_token: None,
                timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
                max_retries: DEFAULT_MAX_RETRIES,
                requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
                is_active: true,
                enrollment_events_enabled: true,
                created_at: now,
                updated_at: now,
            };
            self.add_destination(destination.clone()).await;
            destination
        }

        /// Flips a destination's active flag.
        pub async fn set_destination_active(&self, id: DestinationId, active: bool) {
            if let Some(destination) = self.destinations.write().await.get_mut(&id) {
                destination.is_active = active;
                destination.updated_at = Utc::now();
            }
        }

        /// Deletes a destination.
        pub async fn remove_destination(&self, id: DestinationId) {
            self.destinations.write().await.remove(&id);
        }

        /// Stores a queue item as-is, bypassing dedup.
        pub async fn insert_item(&self, item: QueueItem) {
            self.items.write().await.insert(item.id, item);
        }

        /// Current state of a queue item.
        pub async fn item(&self, id: QueueItemId) -> Option<QueueItem> {
            self.items.read().await.get(&id).cloned()
        }

        /// All queue items.
        pub async fn items(&self) -> Vec<QueueItem> {
            self.items.read().await.values().cloned().collect()
        }

        /// Number of items in the given status.
        pub async fn count_in_status(&self, status: QueueStatus) -> usize {
            self.items.read().await.values().filter(|item| item.status == status).count()
        }

        /// Injects an error for the next claim operation.
        pub async fn inject_claim_error(&self, error: impl Into<String>) {
            *self.claim_error.write().await = Some(error.into());
        }

        /// Makes [`DeliveryStorage::ping`] fail until reset.
        pub async fn set_unavailable(&self, unavailable: bool) {
            *self.unavailable.write().await = unavailable;
        }

        async fn take_claim_error(&self) -> Result<()> {
            match self.claim_error.write().await.take() {
                Some(error) => Err(CoreError::Database(error)),
                None => Ok(()),
            }
        }

        async fn transition<F>(
            &self,
            id: QueueItemId,
            attempt: i32,
            allowed: &[QueueStatus],
            apply: F,
        ) -> bool
        where
            F: FnOnce(&mut QueueItem),
        {
            let mut items = self.items.write().await;
            match items.get_mut(&id) {
                Some(item) if allowed.contains(&item.status) && item.attempt_count == attempt => {
                    apply(item);
                    true
                },
                _ => false,
            }
        }
    }

    fn claim_item(item: &mut QueueItem, now: DateTime<Utc>) {
        item.status = QueueStatus::Processing;
        item.attempt_count += 1;
        item.last_attempt_at = Some(now);
    }

    fn is_due(item: &QueueItem, now: DateTime<Utc>) -> bool {
        item.status == QueueStatus::Pending && item.next_retry_at <= now
    }

    fn record_response(item: &mut QueueItem, response: Option<ResponseSnapshot>) {
        if let Some(response) = response {
            item.last_http_status = Some(response.status_code);
            item.response_body = Some(response.body);
        }
    }

    impl DeliveryStorage for MockDeliveryStorage {
        fn find_destination(&self, id: DestinationId) -> StorageFuture<'_, Option<DestinationConfig>> {
            Box::pin(async move { Ok(self.destinations.read().await.get(&id).cloned()) })
        }

        fn find_active_destination(
            &self,
            customer_id: CustomerId,
            region: Region,
        ) -> StorageFuture<'_, Option<DestinationConfig>> {
            Box::pin(async move {
                Ok(self
                    .destinations
                    .read()
                    .await
                    .values()
                    .find(|d| d.is_active && d.customer_id == customer_id && d.region == region)
                    .cloned())
            })
        }

        fn enqueue(&self, item: NewQueueItem, now: DateTime<Utc>) -> StorageFuture<'_, QueueItem> {
            Box::pin(async move {
                let mut items = self.items.write().await;
                if let Some(existing) = items
                    .values()
                    .find(|i| i.dedup_key == item.dedup_key && i.status.blocks_duplicates())
                {
                    return Err(CoreError::DuplicateEvent {
                        dedup_key: item.dedup_key,
                        existing_id: Some(existing.id),
                    });
                }

                let created = QueueItem {
                    id: QueueItemId::new(),
                    customer_id: item.customer_id,
                    user_id: item.user_id,
                    course_key: item.course_key,
                    event_type: item.event_type,
                    region: item.region,
                    destination_id: item.destination_id,
                    destination_url: item.destination_url,
                    payload: sqlx::types::Json(item.payload),
                    status: QueueStatus::Pending,
                    attempt_count: 0,
                    last_attempt_at: None,
                    next_retry_at: now,
                    completed_at: None,
                    last_error: None,
                    last_http_status: None,
                    response_body: None,
                    dedup_key: item.dedup_key,
                    created_at: now,
                };
                items.insert(created.id, created.clone());
                Ok(created)
            })
        }

        fn find_queue_item(&self, id: QueueItemId) -> StorageFuture<'_, Option<QueueItem>> {
            Box::pin(async move { Ok(self.item(id).await) })
        }

        fn claim_due(&self, batch_size: usize, now: DateTime<Utc>) -> StorageFuture<'_, Vec<QueueItem>> {
            Box::pin(async move {
                self.take_claim_error().await?;

                let mut items = self.items.write().await;
                let mut due: Vec<_> = items
                    .values()
                    .filter(|item| is_due(item, now))
                    .map(|item| (item.next_retry_at, item.created_at, item.id.0))
                    .collect();
                due.sort();

                let mut claimed = Vec::new();
                for (_, _, id) in due.into_iter().take(batch_size) {
                    let id = QueueItemId(id);
                    if let Some(item) = items.get_mut(&id) {
                        claim_item(item, now);
                        claimed.push(item.clone());
                    }
                }
                Ok(claimed)
            })
        }

        fn claim(&self, id: QueueItemId, now: DateTime<Utc>) -> StorageFuture<'_, Option<QueueItem>> {
            Box::pin(async move {
                self.take_claim_error().await?;

                let mut items = self.items.write().await;
                Ok(items.get_mut(&id).filter(|item| is_due(item, now)).map(|item| {
                    claim_item(item, now);
                    item.clone()
                }))
            })
        }

        fn renew_claim(
            &self,
            id: QueueItemId,
            attempt: i32,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                Ok(self
                    .transition(id, attempt, &[QueueStatus::Processing], |item| {
                        item.last_attempt_at = Some(now);
                    })
                    .await)
            })
        }

        fn release_rate_limited(
            &self,
            id: QueueItemId,
            attempt: i32,
            next_retry_at: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                Ok(self
                    .transition(id, attempt, &[QueueStatus::Processing], |item| {
                        item.status = QueueStatus::Pending;
                        item.attempt_count = (item.attempt_count - 1).max(0);
                        item.next_retry_at = item.next_retry_at.max(next_retry_at);
                    })
                    .await)
            })
        }

        fn mark_success(
            &self,
            id: QueueItemId,
            attempt: i32,
            response: ResponseSnapshot,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                Ok(self
                    .transition(id, attempt, &[QueueStatus::Processing], |item| {
                        item.status = QueueStatus::Success;
                        item.completed_at = Some(now);
                        item.last_error = None;
                        record_response(item, Some(response));
                    })
                    .await)
            })
        }

        fn schedule_retry(
            &self,
            id: QueueItemId,
            attempt: i32,
            next_retry_at: DateTime<Utc>,
            error: String,
            response: Option<ResponseSnapshot>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                Ok(self
                    .transition(id, attempt, &[QueueStatus::Processing], |item| {
                        item.status = QueueStatus::Pending;
                        item.next_retry_at = item.next_retry_at.max(next_retry_at);
                        item.last_error = Some(error);
                        item.last_http_status = response.as_ref().map(|r| r.status_code);
                        item.response_body = response.map(|r| r.body);
                    })
                    .await)
            })
        }

        fn mark_failed(
            &self,
            id: QueueItemId,
            attempt: i32,
            error: String,
            response: Option<ResponseSnapshot>,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                Ok(self
                    .transition(id, attempt, &[QueueStatus::Processing], |item| {
                        item.status = QueueStatus::Failed;
                        item.completed_at = Some(now);
                        item.last_error = Some(error);
                        record_response(item, response);
                    })
                    .await)
            })
        }

        fn cancel(
            &self,
            id: QueueItemId,
            attempt: i32,
            reason: String,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let allowed = [QueueStatus::Pending, QueueStatus::Processing];
                Ok(self
                    .transition(id, attempt, &allowed, |item| {
                        item.status = QueueStatus::Cancelled;
                        item.completed_at = Some(now);
                        item.last_error = Some(reason);
                    })
                    .await)
            })
        }

        fn recover_stale(
            &self,
            lease_cutoff: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, StaleRecovery> {
            Box::pin(async move {
                let destinations = self.destinations.read().await;
                let mut items = self.items.write().await;
                let mut recovery = StaleRecovery::default();

                for item in items.values_mut() {
                    let stale = item.status == QueueStatus::Processing
                        && item.last_attempt_at.is_some_and(|at| at < lease_cutoff);
                    if !stale {
                        continue;
                    }

                    let attempts_left = destinations
                        .get(&item.destination_id)
                        .map_or(true, |d| item.attempt_count < d.max_attempts());
                    if attempts_left {
                        item.status = QueueStatus::Pending;
                        item.next_retry_at = item.next_retry_at.max(now);
                        recovery.requeued += 1;
                    } else {
                        item.status = QueueStatus::Failed;
                        item.completed_at = Some(now);
                        item.last_error = Some("worker lease expired".to_string());
                        recovery.failed += 1;
                    }
                }
                Ok(recovery)
            })
        }

        fn backlog(&self) -> StorageFuture<'_, QueueBacklog> {
            Box::pin(async move {
                let items = self.items.read().await;
                let mut backlog = QueueBacklog::default();
                for item in items.values() {
                    match item.status {
                        QueueStatus::Pending => {
                            backlog.pending += 1;
                            backlog.oldest_pending_at = Some(
                                backlog
                                    .oldest_pending_at
                                    .map_or(item.created_at, |at| at.min(item.created_at)),
                            );
                        },
                        QueueStatus::Processing => backlog.processing += 1,
                        _ => {},
                    }
                }
                Ok(backlog)
            })
        }

        fn ping(&self) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                if *self.unavailable.read().await {
                    return Err(CoreError::Database("connection refused".to_string()));
                }
                Ok(())
            })
        }
    }
}
