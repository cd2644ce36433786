//! HTTP client for posting queue item payloads to destinations.
//!
//! Builds the outbound request (JSON body, bearer token, correlation and
//! event headers), sends it with the destination's timeout and never follows
//! redirects. Transport failures become [`DeliveryError`]s here; HTTP status
//! interpretation happens in [`DeliveryResponse::classify`].

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{EventType, QueueItemId, Region};
use reqwest::{header::HeaderMap, Response};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::error::{DeliveryError, Result};

/// Correlation id, unique per attempt.
pub const HEADER_DELIVERY_ID: &str = "X-Courier-Delivery-Id";
/// Queue item being delivered.
pub const HEADER_QUEUE_ITEM_ID: &str = "X-Courier-Queue-Item-Id";
/// Event type wire name.
pub const HEADER_EVENT_TYPE: &str = "X-Courier-Event-Type";
/// Payload schema version.
pub const HEADER_EVENT_VERSION: &str = "X-Courier-Event-Version";
/// Learner region.
pub const HEADER_REGION: &str = "X-Courier-Region";
/// Attempt number, 1-based.
pub const HEADER_ATTEMPT: &str = "X-Courier-Attempt";

/// Payload schema version sent with every request.
pub const EVENT_VERSION: &str = "1.0";

/// Configuration for the delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout used when a request carries none.
    pub default_timeout: Duration,
    /// Connect timeout, independent of the destination timeout.
    pub connect_timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
    /// Response bytes read before the rest is discarded.
    pub max_response_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: "Courier-Webhook/1.0".to_string(),
            verify_tls: true,
            max_response_bytes: 64 * 1024,
        }
    }
}

/// Connection-pooled HTTP client shared by all workers.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

/// One outbound attempt.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Correlation id for this attempt.
    pub delivery_id: Uuid,
    /// Item being delivered.
    pub queue_item_id: QueueItemId,
    /// Destination URL snapshot.
    pub url: String,
    /// Bearer token from the destination, if any.
    pub bearer_token: Option<String>,
    /// Event kind.
    pub event_type: EventType,
    /// Learner region.
    pub region: Region,
    /// Attempt number, 1-based.
    pub attempt_number: u32,
    /// JSON body.
    pub payload: serde_json::Value,
    /// Destination timeout.
    pub timeout: Option<Duration>,
}

/// Response from a destination.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers, lowercase names.
    pub headers: HashMap<String, String>,
    /// Response body, capped at `max_response_bytes`.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
    /// Whether the status was 2xx.
    pub is_success: bool,
}

impl DeliveryResponse {
    /// Maps the status code onto the delivery outcome table.
    ///
    /// 2xx is success. 429 is throttling with an optional `Retry-After`.
    /// Other 4xx are final rejections. Everything else, including 3xx since
    /// redirects are not followed, is a transient failure.
    ///
    /// # Errors
    ///
    /// Returns the classified error for any non-2xx status.
    pub fn classify(self, now: DateTime<Utc>) -> Result<Self> {
        match self.status_code {
            200..=299 => Ok(self),
            429 => {
                let hint = extract_retry_after_seconds(&self.headers, now);
                Err(DeliveryError::too_many_requests(hint, self.body))
            },
            400..=499 => Err(DeliveryError::client_rejected(self.status_code, self.body)),
            _ => Err(DeliveryError::server_error(self.status_code, self.body)),
        }
    }
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Posts the payload to the destination.
    ///
    /// Any HTTP response, whatever its status, is returned as `Ok`.
    ///
    /// # Errors
    ///
    /// - `Timeout` when the destination does not answer in time
    /// - `NetworkError` for connection and protocol failures
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let start_time = std::time::Instant::now();
        let timeout = request.timeout.unwrap_or(self.config.default_timeout);

        let span = info_span!(
            "webhook_delivery",
            queue_item_id = %request.queue_item_id,
            delivery_id = %request.delivery_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            tracing::debug!("sending webhook");

            let mut http_request = self
                .client
                .post(&request.url)
                .timeout(timeout)
                .json(&request.payload)
                .header(HEADER_DELIVERY_ID, request.delivery_id.to_string())
                .header(HEADER_QUEUE_ITEM_ID, request.queue_item_id.to_string())
                .header(HEADER_EVENT_TYPE, request.event_type.as_str())
                .header(HEADER_EVENT_VERSION, EVENT_VERSION)
                .header(HEADER_REGION, request.region.as_str())
                .header(HEADER_ATTEMPT, request.attempt_number.to_string());

            if let Some(token) = request.bearer_token.as_deref().filter(|t| !t.is_empty()) {
                http_request = http_request.bearer_auth(token);
            }

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), error = %e, "request failed");

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let delivery_response = self.parse_response(response, start_time).await;

            match delivery_response.status_code {
                200..=299 => tracing::info!(
                    status = delivery_response.status_code,
                    duration_ms = delivery_response.duration.as_millis(),
                    "webhook delivered"
                ),
                status => tracing::warn!(
                    status,
                    duration_ms = delivery_response.duration.as_millis(),
                    "destination returned non-success status"
                ),
            }

            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }

    async fn parse_response(&self, response: Response, start_time: std::time::Instant) -> DeliveryResponse {
        let status_code = response.status().as_u16();
        let is_success = response.status().is_success();
        let headers = extract_headers(response.headers());

        let body = match response.bytes().await {
            Ok(bytes) => {
                let limit = bytes.len().min(self.config.max_response_bytes);
                String::from_utf8_lossy(&bytes[..limit]).into_owned()
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to read response body");
                format!("[failed to read response body: {e}]")
            },
        };

        DeliveryResponse { status_code, headers, body, duration: start_time.elapsed(), is_success }
    }
}

fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    let mut headers = HashMap::new();

    for (key, value) in header_map {
        if let Ok(value_str) = value.to_str() {
            headers.insert(key.as_str().to_ascii_lowercase(), value_str.to_string());
        }
    }

    headers
}

/// Parses a `Retry-After` header as delta-seconds or an HTTP date.
///
/// Returns `None` when the header is missing or unparseable, in which case
/// the regular backoff applies.
pub fn extract_retry_after_seconds<S: std::hash::BuildHasher>(
    headers: &HashMap<String, String, S>,
    now: DateTime<Utc>,
) -> Option<u64> {
    let retry_after = headers.get("retry-after").or_else(|| headers.get("Retry-After"))?;
    let retry_after = retry_after.trim();

    if let Ok(seconds) = retry_after.parse::<u64>() {
        return Some(seconds);
    }

    let date_time = DateTime::parse_from_rfc2822(retry_after).ok()?;
    let delta = date_time.with_timezone(&Utc).signed_duration_since(now);
    Some(delta.to_std().map(|d| d.as_secs()).unwrap_or(0))
}
