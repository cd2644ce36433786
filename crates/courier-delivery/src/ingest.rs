//! Inbound learner events and per-type handlers.
//!
//! Producers push [`EventRecord`]s onto a channel. The [`EventDispatcher`]
//! consumes them and invokes the handler registered for the record's
//! [`EventType`]. Handlers decide whether the event is reportable, build the
//! payload (enriching completions) and hand it to the [`Router`].

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{
    error::{CoreError, Result},
    CustomerId, EventType, QueueItemId, Region,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    enrichment::EnrichmentAdapter,
    payload,
    router::{RouteRequest, Router},
};

/// Location signals used to pick a learner's region.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionHint {
    /// Region claim from the customer's identity provider.
    pub sso_region: Option<String>,
    /// Learner profile country, ISO 3166 alpha-2.
    pub learner_country: Option<String>,
    /// Enterprise customer country, ISO 3166 alpha-2.
    pub enterprise_country: Option<String>,
}

/// Picks a region: SSO claim, then learner country, then enterprise country,
/// then `OTHER`.
pub fn detect_region(hint: &RegionHint) -> Region {
    let sso = hint
        .sso_region
        .as_deref()
        .and_then(|claim| claim.parse::<Region>().ok())
        .filter(|region| *region != Region::Other);

    sso.or_else(|| hint.learner_country.as_deref().and_then(Region::from_country_code))
        .or_else(|| hint.enterprise_country.as_deref().and_then(Region::from_country_code))
        .unwrap_or(Region::Other)
}

/// Grade data of a completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionAttributes {
    /// Grade between 0 and 1.
    pub percent_grade: f64,
    /// Letter grade, if the course defines one.
    pub letter_grade: Option<String>,
    /// Whether the learner passed.
    pub is_passing: bool,
}

/// Enrollment state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentAttributes {
    /// Enrollment track, e.g. `audit` or `verified`.
    pub mode: String,
    /// Whether the enrollment is active.
    pub is_active: bool,
}

/// Event-specific attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventAttributes {
    /// Course completion.
    Completion(CompletionAttributes),
    /// Course enrollment.
    Enrollment(EnrollmentAttributes),
}

/// Structured event emitted by the upstream learning platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Learner id.
    pub user_id: i64,
    /// Learner username.
    pub username: String,
    /// Course key.
    pub course_id: String,
    /// Enterprise customer, `None` for learners outside any enterprise.
    pub customer_id: Option<CustomerId>,
    /// Location signals.
    #[serde(default)]
    pub region_hint: RegionHint,
    /// When the event happened.
    pub occurred_at: DateTime<Utc>,
    /// Event-specific data.
    pub attributes: EventAttributes,
}

impl EventRecord {
    /// Event kind, derived from the attributes.
    pub fn event_type(&self) -> EventType {
        match self.attributes {
            EventAttributes::Completion(_) => EventType::CourseCompletion,
            EventAttributes::Enrollment(_) => EventType::CourseEnrollment,
        }
    }
}

/// What happened to an inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A queue item was created.
    Queued {
        /// New item.
        queue_item_id: QueueItemId,
    },
    /// The dedup key was already held; nothing was created.
    Duplicate {
        /// Key that collided.
        dedup_key: String,
        /// Item holding the key.
        existing_id: Option<QueueItemId>,
    },
    /// The event is not reportable.
    Ignored {
        /// Why it was skipped.
        reason: &'static str,
    },
}

/// Handles one event type.
#[async_trait]
pub trait EventTypeHandler: Send + Sync + fmt::Debug {
    /// Event type this handler is registered for.
    fn event_type(&self) -> EventType;

    /// Processes one record.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotConfigured` when no destination applies, or a
    /// storage error.
    async fn handle(&self, record: &EventRecord) -> Result<IngestOutcome>;
}

fn route_request(
    record: &EventRecord,
    customer_id: CustomerId,
    region: Region,
    payload: serde_json::Value,
) -> RouteRequest {
    RouteRequest {
        customer_id,
        user_id: record.user_id,
        course_key: record.course_id.clone(),
        event_type: record.event_type(),
        region,
        occurred_at: record.occurred_at,
        payload,
    }
}

fn queued_or_duplicate(result: Result<courier_core::QueueItem>) -> Result<IngestOutcome> {
    match result {
        Ok(item) => Ok(IngestOutcome::Queued { queue_item_id: item.id }),
        Err(CoreError::DuplicateEvent { dedup_key, existing_id }) => {
            Ok(IngestOutcome::Duplicate { dedup_key, existing_id })
        },
        Err(e) => Err(e),
    }
}

/// Queues passing course completions, enriched with learning time.
#[derive(Clone)]
pub struct CompletionHandler {
    router: Arc<Router>,
    enrichment: EnrichmentAdapter,
}

impl fmt::Debug for CompletionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandler").field("enrichment", &self.enrichment).finish_non_exhaustive()
    }
}

impl CompletionHandler {
    /// Creates a completion handler.
    pub fn new(router: Arc<Router>, enrichment: EnrichmentAdapter) -> Self {
        Self { router, enrichment }
    }
}

#[async_trait]
impl EventTypeHandler for CompletionHandler {
    fn event_type(&self) -> EventType {
        EventType::CourseCompletion
    }

    async fn handle(&self, record: &EventRecord) -> Result<IngestOutcome> {
        let EventAttributes::Completion(attributes) = &record.attributes else {
            return Ok(IngestOutcome::Ignored { reason: "not a completion" });
        };
        if !attributes.is_passing {
            return Ok(IngestOutcome::Ignored { reason: "not passing" });
        }
        let Some(customer_id) = record.customer_id else {
            return Ok(IngestOutcome::Ignored { reason: "no enterprise customer" });
        };

        let region = detect_region(&record.region_hint);
        let destination =
            self.router.resolve_for_event(customer_id, region, EventType::CourseCompletion).await?;

        let learning_time = if self.enrichment.is_enabled() {
            self.enrichment.lookup(record.user_id, &record.course_id, customer_id).await
        } else {
            None
        };

        let body = payload::completion_payload(record, attributes, learning_time);
        let request = route_request(record, customer_id, region, body);
        queued_or_duplicate(self.router.enqueue_to(&destination, request).await)
    }
}

/// Queues enrollment changes.
#[derive(Clone)]
pub struct EnrollmentHandler {
    router: Arc<Router>,
}

impl fmt::Debug for EnrollmentHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnrollmentHandler").finish_non_exhaustive()
    }
}

impl EnrollmentHandler {
    /// Creates an enrollment handler.
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl EventTypeHandler for EnrollmentHandler {
    fn event_type(&self) -> EventType {
        EventType::CourseEnrollment
    }

    async fn handle(&self, record: &EventRecord) -> Result<IngestOutcome> {
        let EventAttributes::Enrollment(attributes) = &record.attributes else {
            return Ok(IngestOutcome::Ignored { reason: "not an enrollment" });
        };
        let Some(customer_id) = record.customer_id else {
            return Ok(IngestOutcome::Ignored { reason: "no enterprise customer" });
        };

        let region = detect_region(&record.region_hint);
        let body = payload::enrollment_payload(record, attributes);
        let request = route_request(record, customer_id, region, body);
        queued_or_duplicate(self.router.enqueue(request).await)
    }
}

/// Routes records to the handler registered for their event type.
#[derive(Debug, Default, Clone)]
pub struct EventDispatcher {
    handlers: HashMap<EventType, Arc<dyn EventTypeHandler>>,
}

impl EventDispatcher {
    /// Creates a dispatcher with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any previous one for its event type.
    pub fn register(&mut self, handler: Arc<dyn EventTypeHandler>) {
        self.handlers.insert(handler.event_type(), handler);
    }

    /// Whether a handler exists for the event type.
    pub fn handles(&self, event_type: EventType) -> bool {
        self.handlers.contains_key(&event_type)
    }

    /// Invokes the handler for one record.
    ///
    /// # Errors
    ///
    /// Propagates the handler's error.
    pub async fn dispatch(&self, record: &EventRecord) -> Result<IngestOutcome> {
        match self.handlers.get(&record.event_type()) {
            Some(handler) => handler.handle(record).await,
            None => Ok(IngestOutcome::Ignored { reason: "no handler registered" }),
        }
    }

    /// Consumes records until the channel closes or `cancel` fires.
    ///
    /// Outcomes and errors are logged; a failing record never stops the loop.
    pub async fn run(self: Arc<Self>, mut records: mpsc::Receiver<EventRecord>, cancel: CancellationToken) {
        info!(handlers = self.handlers.len(), "event consumer started");

        loop {
            let record = tokio::select! {
                () = cancel.cancelled() => break,
                record = records.recv() => match record {
                    Some(record) => record,
                    None => break,
                },
            };

            match self.dispatch(&record).await {
                Ok(IngestOutcome::Queued { queue_item_id }) => {
                    debug!(queue_item_id = %queue_item_id, user_id = record.user_id, "event queued");
                },
                Ok(IngestOutcome::Duplicate { dedup_key, .. }) => {
                    info!(dedup_key = %dedup_key, "duplicate event skipped");
                },
                Ok(IngestOutcome::Ignored { reason }) => {
                    debug!(user_id = record.user_id, course_id = %record.course_id, reason, "event ignored");
                },
                Err(e @ CoreError::NotConfigured { .. }) => {
                    warn!(user_id = record.user_id, code = e.code(), error = %e, "event not routed");
                },
                Err(e) => {
                    error!(user_id = record.user_id, code = e.code(), error = %e, "event handling failed");
                },
            }
        }

        info!("event consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeZone;
    use courier_core::{QueueStatus, TestClock};

    use super::*;
    use crate::{
        enrichment::{EnrichmentConfig, EnrichmentError, InMemoryEnrichmentCache, LearningTimeSource},
        storage::mock::MockDeliveryStorage,
    };

    #[derive(Debug, Default)]
    struct FixedSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LearningTimeSource for FixedSource {
        async fn fetch(
            &self,
            _user_id: i64,
            _course_key: &str,
            _customer_id: CustomerId,
        ) -> std::result::Result<Option<i64>, EnrichmentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(3600))
        }
    }

    fn completion(customer_id: Option<CustomerId>, is_passing: bool) -> EventRecord {
        EventRecord {
            user_id: 11,
            username: "grace".to_string(),
            course_id: "course-v1:edX+CS50+2024".to_string(),
            customer_id,
            region_hint: RegionHint { learner_country: Some("US".into()), ..RegionHint::default() },
            occurred_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().unwrap(),
            attributes: EventAttributes::Completion(CompletionAttributes {
                percent_grade: 0.91,
                letter_grade: Some("A".into()),
                is_passing,
            }),
        }
    }

    fn enrollment(customer_id: CustomerId) -> EventRecord {
        EventRecord {
            attributes: EventAttributes::Enrollment(EnrollmentAttributes {
                mode: "verified".into(),
                is_active: true,
            }),
            ..completion(Some(customer_id), true)
        }
    }

    async fn setup(enrichment: EnrichmentAdapter) -> (MockDeliveryStorage, EventDispatcher, CustomerId) {
        let storage = MockDeliveryStorage::new();
        let customer = CustomerId::new();
        storage.add_destination_url(customer, Region::Us, "https://us.example/hook").await;
        let clock = TestClock::at(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().unwrap());
        let router = Arc::new(Router::new(Arc::new(storage.clone()), Arc::new(clock)));

        let mut dispatcher = EventDispatcher::new();
        dispatcher.register(Arc::new(CompletionHandler::new(router.clone(), enrichment)));
        dispatcher.register(Arc::new(EnrollmentHandler::new(router)));
        (storage, dispatcher, customer)
    }

    #[test]
    fn region_detection_priority() {
        let hint = |sso: Option<&str>, learner: Option<&str>, enterprise: Option<&str>| RegionHint {
            sso_region: sso.map(Into::into),
            learner_country: learner.map(Into::into),
            enterprise_country: enterprise.map(Into::into),
        };

        assert_eq!(detect_region(&hint(Some("eu"), Some("US"), None)), Region::Eu);
        assert_eq!(detect_region(&hint(Some("mars"), Some("GB"), None)), Region::Uk);
        assert_eq!(detect_region(&hint(None, Some("JP"), Some("DE"))), Region::Eu);
        assert_eq!(detect_region(&hint(Some("OTHER"), None, Some("US"))), Region::Us);
        assert_eq!(detect_region(&hint(None, None, None)), Region::Other);
    }

    #[tokio::test]
    async fn passing_completion_is_queued_with_learning_time() {
        let source = Arc::new(FixedSource::default());
        let enrichment = EnrichmentAdapter::new(
            EnrichmentConfig { enabled: true, ..EnrichmentConfig::default() },
            source.clone(),
            Arc::new(InMemoryEnrichmentCache::new()),
        );
        let (storage, dispatcher, customer) = setup(enrichment).await;

        let outcome = dispatcher.dispatch(&completion(Some(customer), true)).await.unwrap();
        let IngestOutcome::Queued { queue_item_id } = outcome else {
            panic!("expected queued, got {outcome:?}");
        };

        let item = storage.item(queue_item_id).await.unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.region, Region::Us);
        assert_eq!(item.payload()["completion"]["learning_time"]["hours"], 1.0);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_enrichment_omits_learning_time() {
        let (storage, dispatcher, customer) = setup(EnrichmentAdapter::disabled()).await;

        dispatcher.dispatch(&completion(Some(customer), true)).await.unwrap();

        let items = storage.items().await;
        assert!(items[0].payload()["completion"].get("learning_time").is_none());
    }

    #[tokio::test]
    async fn non_passing_and_non_enterprise_events_are_ignored() {
        let (storage, dispatcher, customer) = setup(EnrichmentAdapter::disabled()).await;

        assert_eq!(
            dispatcher.dispatch(&completion(Some(customer), false)).await.unwrap(),
            IngestOutcome::Ignored { reason: "not passing" }
        );
        assert_eq!(
            dispatcher.dispatch(&completion(None, true)).await.unwrap(),
            IngestOutcome::Ignored { reason: "no enterprise customer" }
        );
        assert!(storage.items().await.is_empty());
    }

    #[tokio::test]
    async fn repeated_completion_reports_duplicate() {
        let (_storage, dispatcher, customer) = setup(EnrichmentAdapter::disabled()).await;
        let record = completion(Some(customer), true);

        assert!(matches!(dispatcher.dispatch(&record).await.unwrap(), IngestOutcome::Queued { .. }));
        assert!(matches!(dispatcher.dispatch(&record).await.unwrap(), IngestOutcome::Duplicate { .. }));
    }

    #[tokio::test]
    async fn enrollment_and_completion_use_separate_keys() {
        let (storage, dispatcher, customer) = setup(EnrichmentAdapter::disabled()).await;

        dispatcher.dispatch(&completion(Some(customer), true)).await.unwrap();
        dispatcher.dispatch(&enrollment(customer)).await.unwrap();

        assert_eq!(storage.items().await.len(), 2);
    }

    #[tokio::test]
    async fn unknown_customer_is_not_configured() {
        let (_storage, dispatcher, _customer) = setup(EnrichmentAdapter::disabled()).await;

        let err = dispatcher.dispatch(&completion(Some(CustomerId::new()), true)).await.unwrap_err();
        assert_eq!(err.code(), "E1001");
    }

    #[tokio::test]
    async fn unregistered_event_type_is_ignored() {
        let dispatcher = EventDispatcher::new();
        assert!(!dispatcher.handles(EventType::CourseCompletion));
        assert_eq!(
            dispatcher.dispatch(&completion(Some(CustomerId::new()), true)).await.unwrap(),
            IngestOutcome::Ignored { reason: "no handler registered" }
        );
    }

    #[tokio::test]
    async fn consumer_drains_channel_until_closed() {
        let (storage, dispatcher, customer) = setup(EnrichmentAdapter::disabled()).await;
        let (tx, rx) = mpsc::channel(8);

        tx.send(completion(Some(customer), true)).await.unwrap();
        tx.send(completion(Some(CustomerId::new()), true)).await.unwrap();
        tx.send(enrollment(customer)).await.unwrap();
        drop(tx);

        Arc::new(dispatcher).run(rx, CancellationToken::new()).await;
        assert_eq!(storage.items().await.len(), 2);
    }
}
