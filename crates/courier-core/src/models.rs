//! Core domain models and strongly-typed identifiers.
//!
//! Defines destination configurations, queue items and the newtype ID
//! wrappers shared by every courier crate. Includes database serialization
//! traits and the lifecycle rules of the transmission queue.

use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Default request timeout for a destination, in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: i32 = 30;

/// Smallest accepted destination timeout, in seconds.
pub const MIN_TIMEOUT_SECONDS: i32 = 5;

/// Largest accepted destination timeout, in seconds.
pub const MAX_TIMEOUT_SECONDS: i32 = 300;

/// Default retry budget for a destination.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Default outbound request cap per minute.
pub const DEFAULT_REQUESTS_PER_MINUTE: i32 = 100;

/// Response bodies are stored up to this many characters.
pub const MAX_RESPONSE_BODY_CHARS: usize = 10_000;

/// Strongly-typed queue item identifier.
///
/// Follows a single transmission from enqueue to its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueItemId(pub Uuid);

impl QueueItemId {
    /// Creates a new random queue item ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueueItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueueItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for QueueItemId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for QueueItemId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for QueueItemId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for QueueItemId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed destination configuration identifier.
///
/// Queue items keep the ID of the configuration they were routed to so the
/// worker can re-check that it is still active before sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationId(pub Uuid);

impl DestinationId {
    /// Creates a new random destination ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DestinationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DestinationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for DestinationId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DestinationId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for DestinationId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed enterprise customer identifier.
///
/// Every destination and every queue item is owned by exactly one customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomerId(pub Uuid);

impl CustomerId {
    /// Creates a new random customer ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CustomerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CustomerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for CustomerId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for CustomerId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for CustomerId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for CustomerId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Geographic region selecting which destination applies to a learner.
///
/// `Other` doubles as the customer-wide fallback: when no destination exists
/// for a learner's region the router uses the customer's `OTHER` destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    /// United States.
    #[serde(rename = "US")]
    Us,
    /// European Union member states.
    #[serde(rename = "EU")]
    Eu,
    /// United Kingdom.
    #[serde(rename = "UK")]
    Uk,
    /// Everywhere else, and the fallback destination.
    #[serde(rename = "OTHER")]
    Other,
}

/// ISO 3166 alpha-2 codes of the EU member states.
const EU_COUNTRIES: &[&str] = &[
    "AT", "BE", "BG", "HR", "CY", "CZ", "DK", "EE", "FI", "FR", "DE", "GR", "HU", "IE", "IT",
    "LV", "LT", "LU", "MT", "NL", "PL", "PT", "RO", "SK", "SI", "ES", "SE",
];

impl Region {
    /// Every region, in routing priority order.
    pub const ALL: [Region; 4] = [Region::Us, Region::Eu, Region::Uk, Region::Other];

    /// Maps an ISO 3166 alpha-2 country code to a region.
    ///
    /// Returns `None` for unknown or empty codes so callers can fall through
    /// to the next source of location data.
    pub fn from_country_code(code: &str) -> Option<Self> {
        let code = code.trim().to_ascii_uppercase();
        match code.as_str() {
            "" => None,
            "US" => Some(Self::Us),
            "GB" | "UK" => Some(Self::Uk),
            c if EU_COUNTRIES.contains(&c) => Some(Self::Eu),
            _ => None,
        }
    }

    /// Stable database and header representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Us => "US",
            Self::Eu => "EU",
            Self::Uk => "UK",
            Self::Other => "OTHER",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "US" => Ok(Self::Us),
            "EU" => Ok(Self::Eu),
            "UK" => Ok(Self::Uk),
            "OTHER" => Ok(Self::Other),
            _ => Err(format!("invalid region: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for Region {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for Region {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse::<Self>().map_err(Into::into)
    }
}

impl sqlx::Encode<'_, PgDb> for Region {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Kind of learner event carried by a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Learner passed a course.
    CourseCompletion,
    /// Learner enrolled in, or changed enrollment for, a course.
    CourseEnrollment,
}

impl EventType {
    /// Wire name used in payloads, headers and dedup keys.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CourseCompletion => "course_completion",
            Self::CourseEnrollment => "course_enrollment",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "course_completion" => Ok(Self::CourseCompletion),
            "course_enrollment" => Ok(Self::CourseEnrollment),
            _ => Err(format!("invalid event type: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for EventType {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventType {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse::<Self>().map_err(Into::into)
    }
}

impl sqlx::Encode<'_, PgDb> for EventType {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Queue item lifecycle status.
///
/// ```text
/// pending -> processing -> success
///    ^           |      -> failed
///    |           |      -> cancelled
///    +-----------+ (retry scheduled or rate limited)
/// ```
///
/// `success`, `failed` and `cancelled` are terminal: once reached, the item
/// is never written again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting until `next_retry_at` for a worker.
    Pending,

    /// Claimed by exactly one worker.
    Processing,

    /// Destination acknowledged with a 2xx response.
    Success,

    /// Rejected by the destination or retry budget exhausted.
    Failed,

    /// Destination deactivated or removed before delivery.
    Cancelled,
}

impl QueueStatus {
    /// Whether no further transition may occur.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// Whether an item in this status holds its dedup key.
    pub const fn blocks_duplicates(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing | Self::Success)
    }

    /// Stable database representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<PgDb> for QueueStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for QueueStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid queue status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for QueueStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Customer-owned HTTP destination for one region.
///
/// At most one active configuration exists per (customer, region). The URL
/// has passed [`crate::validation::validate_destination`] before the row was
/// written; it is not re-validated per delivery.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DestinationConfig {
    /// Unique identifier for this configuration.
    pub id: DestinationId,

    /// Customer that owns this destination.
    pub customer_id: CustomerId,

    /// Region this destination serves.
    pub region: Region,

    /// HTTPS URL receiving POST requests.
    pub url: String,

    /// Sent as `Authorization: Bearer <token>` when present.
    #[serde(skip_serializing)]
    pub bearer_token: Option<String>,

    /// Per-request timeout (5-300 seconds).
    pub timeout_seconds: i32,

    /// Retries allowed after the first attempt.
    pub max_retries: i32,

    /// Outbound request cap per fixed one-minute window.
    pub requests_per_minute: i32,

    /// Inactive configurations are never routed to and cancel queued items.
    pub is_active: bool,

    /// Whether enrollment events are routed to this destination.
    pub enrollment_events_enabled: bool,

    /// When the configuration was created.
    pub created_at: DateTime<Utc>,

    /// When the configuration was last modified.
    pub updated_at: DateTime<Utc>,
}

impl DestinationConfig {
    /// Request timeout as a `Duration`, clamped to the accepted range.
    pub fn timeout(&self) -> Duration {
        let secs = self.timeout_seconds.clamp(MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS);
        Duration::from_secs(u64::try_from(secs).unwrap_or(30))
    }

    /// Upper bound on `attempt_count` for items routed here.
    pub fn max_attempts(&self) -> i32 {
        self.max_retries.max(0) + 1
    }
}

/// Input for creating a destination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDestination {
    /// Owning customer.
    pub customer_id: CustomerId,
    /// Region served.
    pub region: Region,
    /// HTTPS URL; validated before insert.
    pub url: String,
    /// Optional bearer token.
    pub bearer_token: Option<String>,
    /// Request timeout in seconds.
    pub timeout_seconds: i32,
    /// Retry budget.
    pub max_retries: i32,
    /// Requests per minute.
    pub requests_per_minute: i32,
    /// Route enrollment events.
    pub enrollment_events_enabled: bool,
}

impl NewDestination {
    /// Creates a destination with default timeout, retries and rate cap.
    pub fn new(customer_id: CustomerId, region: Region, url: impl Into<String>) -> Self {
        Self {
            customer_id,
            region,
            url: url.into(),
            bearer_token: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            max_retries: DEFAULT_MAX_RETRIES,
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            enrollment_events_enabled: true,
        }
    }
}

/// A single transmission of one learner event to one destination.
///
/// `destination_url` and `region` are snapshots taken at enqueue time. Edits
/// to the destination afterwards do not change where an in-flight item goes,
/// but deactivation cancels it on the next claim.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueueItem {
    /// Unique identifier for this item.
    pub id: QueueItemId,

    /// Customer the event belongs to.
    pub customer_id: CustomerId,

    /// Learner the event describes.
    pub user_id: i64,

    /// Course the event describes.
    pub course_key: String,

    /// Kind of event.
    pub event_type: EventType,

    /// Learner region detected at enqueue time.
    pub region: Region,

    /// Destination the item was routed to.
    pub destination_id: DestinationId,

    /// Destination URL at enqueue time.
    pub destination_url: String,

    /// JSON body posted to the destination.
    pub payload: sqlx::types::Json<serde_json::Value>,

    /// Current lifecycle status.
    pub status: QueueStatus,

    /// Number of claimed delivery attempts, including the one in flight.
    ///
    /// Never exceeds the destination's `max_retries + 1`.
    pub attempt_count: i32,

    /// When the most recent attempt was claimed.
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// Earliest time a worker may claim the item. Never moves backwards.
    pub next_retry_at: DateTime<Utc>,

    /// When the item reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,

    /// Most recent failure or cancellation reason.
    pub last_error: Option<String>,

    /// HTTP status of the most recent response.
    pub last_http_status: Option<i32>,

    /// Most recent response body, truncated.
    pub response_body: Option<String>,

    /// Day-granular idempotency key.
    pub dedup_key: String,

    /// When the item was enqueued.
    pub created_at: DateTime<Utc>,
}

impl QueueItem {
    /// Payload as JSON.
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload.0
    }

    /// Whether the item has reached success, failed or cancelled.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Input for enqueueing a new item in `pending`.
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    /// Customer the event belongs to.
    pub customer_id: CustomerId,
    /// Learner.
    pub user_id: i64,
    /// Course.
    pub course_key: String,
    /// Event kind.
    pub event_type: EventType,
    /// Learner region.
    pub region: Region,
    /// Routed destination.
    pub destination_id: DestinationId,
    /// Snapshot of the destination URL.
    pub destination_url: String,
    /// Body to post.
    pub payload: serde_json::Value,
    /// Idempotency key.
    pub dedup_key: String,
}

/// Status code and truncated body captured from a destination response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSnapshot {
    /// HTTP status code.
    pub status_code: i32,
    /// Body, at most [`MAX_RESPONSE_BODY_CHARS`] characters.
    pub body: String,
}

impl ResponseSnapshot {
    /// Captures a response, truncating the body on a character boundary.
    pub fn new(status_code: u16, body: &str) -> Self {
        Self { status_code: i32::from(status_code), body: truncate_chars(body, MAX_RESPONSE_BODY_CHARS) }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Point-in-time view of queue backlog for gauges and health checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBacklog {
    /// Items waiting in `pending`.
    pub pending: i64,
    /// Items currently claimed.
    pub processing: i64,
    /// Creation time of the oldest pending item.
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

impl QueueBacklog {
    /// Age of the oldest pending item relative to `now`, zero when empty.
    pub fn oldest_pending_age(&self, now: DateTime<Utc>) -> Duration {
        self.oldest_pending_at
            .and_then(|at| (now - at).to_std().ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_from_country_code() {
        assert_eq!(Region::from_country_code("us"), Some(Region::Us));
        assert_eq!(Region::from_country_code("GB"), Some(Region::Uk));
        assert_eq!(Region::from_country_code("FR"), Some(Region::Eu));
        assert_eq!(Region::from_country_code("DE"), Some(Region::Eu));
        assert_eq!(Region::from_country_code("JP"), None);
        assert_eq!(Region::from_country_code(""), None);
    }

    #[test]
    fn region_round_trips_through_str() {
        for region in Region::ALL {
            assert_eq!(region.as_str().parse::<Region>(), Ok(region));
        }
        assert!("APAC".parse::<Region>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!QueueStatus::Pending.is_terminal());
        assert!(!QueueStatus::Processing.is_terminal());
        assert!(QueueStatus::Success.is_terminal());
        assert!(QueueStatus::Failed.is_terminal());
        assert!(QueueStatus::Cancelled.is_terminal());
    }

    #[test]
    fn failed_and_cancelled_release_dedup_key() {
        assert!(QueueStatus::Success.blocks_duplicates());
        assert!(!QueueStatus::Failed.blocks_duplicates());
        assert!(!QueueStatus::Cancelled.blocks_duplicates());
    }

    #[test]
    fn response_body_truncated_to_limit() {
        let body = "é".repeat(MAX_RESPONSE_BODY_CHARS + 50);
        let snapshot = ResponseSnapshot::new(500, &body);
        assert_eq!(snapshot.body.chars().count(), MAX_RESPONSE_BODY_CHARS);
        assert_eq!(snapshot.status_code, 500);

        let short = ResponseSnapshot::new(200, "ok");
        assert_eq!(short.body, "ok");
    }

    #[test]
    fn destination_timeout_is_clamped() {
        let now = Utc::now();
        let mut config = DestinationConfig {
            id: DestinationId::new(),
            customer_id: CustomerId::new(),
            region: Region::Us,
            url: "https://hooks.example.com".into(),
            bearer_token: None,
            timeout_seconds: 1,
            max_retries: 3,
            requests_per_minute: 100,
            is_active: true,
            enrollment_events_enabled: true,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(config.timeout(), Duration::from_secs(5));
        config.timeout_seconds = 900;
        assert_eq!(config.timeout(), Duration::from_secs(300));
        assert_eq!(config.max_attempts(), 4);
    }

    #[test]
    fn backlog_age_of_empty_queue_is_zero() {
        let backlog = QueueBacklog::default();
        assert_eq!(backlog.oldest_pending_age(Utc::now()), Duration::ZERO);
    }
}
