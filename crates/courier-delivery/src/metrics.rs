//! Metric names and descriptions.
//!
//! Every metric the engine records is named here. Call sites use the
//! `metrics` facade macros with these constants; installing an exporter is
//! left to the binary.
//!
//! # Naming
//!
//! - prefix: `courier_`
//! - suffix: `_total` for counters, `_seconds` for histograms and ages,
//!   nothing for gauges

/// Label key for the error category of a failed attempt.
pub const LABEL_CATEGORY: &str = "category";

/// Label key for the event type.
pub const LABEL_EVENT_TYPE: &str = "event_type";

/// Items created in `pending` (counter).
pub const QUEUED_TOTAL: &str = "courier_queue_items_queued_total";

/// Enqueue requests skipped as duplicates (counter).
pub const DUPLICATES_TOTAL: &str = "courier_queue_items_duplicate_total";

/// HTTP attempts sent (counter).
pub const ATTEMPTED_TOTAL: &str = "courier_delivery_attempts_total";

/// Items that reached `success` (counter).
pub const SUCCEEDED_TOTAL: &str = "courier_deliveries_succeeded_total";

/// Items that reached `failed` (counter, label: category).
pub const FAILED_TOTAL: &str = "courier_deliveries_failed_total";

/// Retries scheduled after transient failures (counter, label: category).
pub const RETRIED_TOTAL: &str = "courier_delivery_retries_total";

/// Items that reached `cancelled` (counter).
pub const CANCELLED_TOTAL: &str = "courier_deliveries_cancelled_total";

/// Attempts deferred by the local rate limiter (counter).
pub const RATE_LIMITED_TOTAL: &str = "courier_rate_limited_total";

/// Items in `pending` (gauge).
pub const QUEUE_DEPTH: &str = "courier_queue_depth";

/// Items in `processing` (gauge).
pub const QUEUE_IN_FLIGHT: &str = "courier_queue_in_flight";

/// Age of the oldest pending item (gauge, seconds).
pub const OLDEST_PENDING_AGE_SECONDS: &str = "courier_queue_oldest_pending_age_seconds";

/// HTTP send latency (histogram, seconds).
pub const SEND_LATENCY_SECONDS: &str = "courier_delivery_send_duration_seconds";

/// Enrichment lookup latency including cache (histogram, seconds).
pub const ENRICHMENT_LATENCY_SECONDS: &str = "courier_enrichment_lookup_duration_seconds";

/// Enrichment cache hits (counter).
pub const ENRICHMENT_CACHE_HITS_TOTAL: &str = "courier_enrichment_cache_hits_total";

/// Enrichment lookups that timed out or failed (counter).
pub const ENRICHMENT_UNAVAILABLE_TOTAL: &str = "courier_enrichment_unavailable_total";

/// Registers descriptions for every metric with the installed recorder.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

    describe_counter!(QUEUED_TOTAL, "Queue items created in pending");
    describe_counter!(DUPLICATES_TOTAL, "Enqueue requests skipped because the dedup key was held");
    describe_counter!(ATTEMPTED_TOTAL, "HTTP delivery attempts sent");
    describe_counter!(SUCCEEDED_TOTAL, "Queue items delivered with a 2xx response");
    describe_counter!(FAILED_TOTAL, "Queue items that reached failed");
    describe_counter!(RETRIED_TOTAL, "Retries scheduled after transient failures");
    describe_counter!(CANCELLED_TOTAL, "Queue items cancelled because the destination is inactive");
    describe_counter!(RATE_LIMITED_TOTAL, "Attempts deferred by the per-destination rate limiter");
    describe_gauge!(QUEUE_DEPTH, "Queue items waiting in pending");
    describe_gauge!(QUEUE_IN_FLIGHT, "Queue items claimed by a worker");
    describe_gauge!(OLDEST_PENDING_AGE_SECONDS, Unit::Seconds, "Age of the oldest pending item");
    describe_histogram!(SEND_LATENCY_SECONDS, Unit::Seconds, "Destination response latency");
    describe_histogram!(
        ENRICHMENT_LATENCY_SECONDS,
        Unit::Seconds,
        "Learning time lookup latency including cache"
    );
    describe_counter!(ENRICHMENT_CACHE_HITS_TOTAL, "Learning time lookups served from cache");
    describe_counter!(ENRICHMENT_UNAVAILABLE_TOTAL, "Learning time lookups that timed out or failed");
}
