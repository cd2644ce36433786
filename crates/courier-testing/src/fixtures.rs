//! Builders for destinations, queue items and upstream event records.

use chrono::{DateTime, TimeZone, Utc};
use courier_core::{
    models::{DEFAULT_MAX_RETRIES, DEFAULT_REQUESTS_PER_MINUTE, DEFAULT_TIMEOUT_SECONDS},
    CustomerId, DestinationConfig, DestinationId, EventType, NewDestination, NewQueueItem, Region,
};
use courier_delivery::ingest::{
    CompletionAttributes, EnrollmentAttributes, EventAttributes, EventRecord, RegionHint,
};
use serde_json::json;
use uuid::Uuid;

/// Fixed instant used as the starting point of deterministic tests.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).single().unwrap_or_else(Utc::now)
}

/// Builder for destination configurations.
#[derive(Debug, Clone)]
pub struct DestinationBuilder {
    customer_id: CustomerId,
    region: Region,
    url: String,
    bearer_token: Option<String>,
    timeout_seconds: i32,
    max_retries: i32,
    requests_per_minute: i32,
    is_active: bool,
    enrollment_events_enabled: bool,
}

impl Default for DestinationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DestinationBuilder {
    /// Active destination for a fresh customer in the US region.
    pub fn new() -> Self {
        Self {
            customer_id: CustomerId::new(),
            region: Region::Us,
            url: "https://hooks.example.com/courier".to_string(),
            bearer_token: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            max_retries: DEFAULT_MAX_RETRIES,
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            is_active: true,
            enrollment_events_enabled: true,
        }
    }

    /// Sets the owning customer.
    #[must_use]
    pub fn customer(mut self, customer_id: CustomerId) -> Self {
        self.customer_id = customer_id;
        self
    }

    /// Sets the region.
    #[must_use]
    pub fn region(mut self, region: Region) -> Self {
        self.region = region;
        self
    }

    /// Sets the endpoint URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Sets the bearer token.
    #[must_use]
    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn timeout_seconds(mut self, seconds: i32) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn max_retries(mut self, retries: i32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the attempt budget per minute.
    #[must_use]
    pub fn requests_per_minute(mut self, limit: i32) -> Self {
        self.requests_per_minute = limit;
        self
    }

    /// Marks the destination inactive.
    #[must_use]
    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Turns enrollment forwarding off.
    #[must_use]
    pub fn without_enrollment_events(mut self) -> Self {
        self.enrollment_events_enabled = false;
        self
    }

    /// Builds a stored configuration with a new id.
    pub fn build(self) -> DestinationConfig {
        let now = epoch();
        DestinationConfig {
            id: DestinationId::new(),
            customer_id: self.customer_id,
            region: self.region,
            url: self.url,
            bearer_token: self.bearer_token,
            timeout_seconds: self.timeout_seconds,
            max_retries: self.max_retries,
            requests_per_minute: self.requests_per_minute,
            is_active: self.is_active,
            enrollment_events_enabled: self.enrollment_events_enabled,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builds the insert form used by the Postgres repository.
    ///
    /// The active flag is not part of the insert; new rows start active.
    pub fn build_new(self) -> NewDestination {
        NewDestination {
            customer_id: self.customer_id,
            region: self.region,
            url: self.url,
            bearer_token: self.bearer_token,
            timeout_seconds: self.timeout_seconds,
            max_retries: self.max_retries,
            requests_per_minute: self.requests_per_minute,
            enrollment_events_enabled: self.enrollment_events_enabled,
        }
    }
}

/// Completion item for `destination` with a unique dedup key.
pub fn new_queue_item(destination: &DestinationConfig) -> NewQueueItem {
    NewQueueItem {
        customer_id: destination.customer_id,
        user_id: 42,
        course_key: "course-v1:edX+DemoX+2024".to_string(),
        event_type: EventType::CourseCompletion,
        region: destination.region,
        destination_id: destination.id,
        destination_url: destination.url.clone(),
        payload: json!({
            "event_type": "course_completion",
            "user": {"id": 42, "username": "learner"},
            "course": {"course_key": "course-v1:edX+DemoX+2024"},
        }),
        dedup_key: format!("test:{}", Uuid::new_v4().simple()),
    }
}

/// Builder for upstream event records.
#[derive(Debug, Clone)]
pub struct EventRecordBuilder {
    record: EventRecord,
}

impl EventRecordBuilder {
    /// Passing completion for an enterprise learner in the US.
    pub fn completion(customer_id: CustomerId) -> Self {
        Self::with_attributes(
            customer_id,
            EventAttributes::Completion(CompletionAttributes {
                percent_grade: 0.92,
                letter_grade: Some("Pass".to_string()),
                is_passing: true,
            }),
        )
    }

    /// Active verified enrollment for an enterprise learner in the US.
    pub fn enrollment(customer_id: CustomerId) -> Self {
        Self::with_attributes(
            customer_id,
            EventAttributes::Enrollment(EnrollmentAttributes {
                mode: "verified".to_string(),
                is_active: true,
            }),
        )
    }

    fn with_attributes(customer_id: CustomerId, attributes: EventAttributes) -> Self {
        Self {
            record: EventRecord {
                user_id: 42,
                username: "learner".to_string(),
                course_id: "course-v1:edX+DemoX+2024".to_string(),
                customer_id: Some(customer_id),
                region_hint: RegionHint {
                    sso_region: None,
                    learner_country: Some("US".to_string()),
                    enterprise_country: None,
                },
                occurred_at: epoch(),
                attributes,
            },
        }
    }

    /// Sets the learner.
    #[must_use]
    pub fn user(mut self, user_id: i64, username: impl Into<String>) -> Self {
        self.record.user_id = user_id;
        self.record.username = username.into();
        self
    }

    /// Sets the course.
    #[must_use]
    pub fn course(mut self, course_id: impl Into<String>) -> Self {
        self.record.course_id = course_id.into();
        self
    }

    /// Sets the learner's country and clears other location signals.
    #[must_use]
    pub fn country(mut self, code: impl Into<String>) -> Self {
        self.record.region_hint = RegionHint {
            sso_region: None,
            learner_country: Some(code.into()),
            enterprise_country: None,
        };
        self
    }

    /// Sets when the event happened.
    #[must_use]
    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.record.occurred_at = at;
        self
    }

    /// Drops the enterprise customer.
    #[must_use]
    pub fn without_customer(mut self) -> Self {
        self.record.customer_id = None;
        self
    }

    /// Marks a completion as failing. No effect on enrollments.
    #[must_use]
    pub fn failing(mut self) -> Self {
        if let EventAttributes::Completion(ref mut completion) = self.record.attributes {
            completion.is_passing = false;
            completion.percent_grade = 0.3;
            completion.letter_grade = None;
        }
        self
    }

    /// Finishes the record.
    pub fn build(self) -> EventRecord {
        self.record
    }
}
