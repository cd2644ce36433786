//! Error types for delivery operations.
//!
//! Classifies every way an attempt can end short of a 2xx so the worker can
//! decide between retrying and failing the queue item. Infrastructure errors
//! (database, configuration, shutdown) are reported separately and never
//! consume a delivery attempt on their own.

use std::fmt;

use courier_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Delivery error taxonomy.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Connection could not be established or was reset.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// Destination did not answer within the configured timeout.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Timeout that was exceeded
        timeout_seconds: u64,
    },

    /// Destination rejected the request with a 4xx other than 429.
    #[error("client rejected: HTTP {status_code}")]
    ClientRejected {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Destination answered 5xx, or a non-2xx outside 4xx/5xx.
    #[error("transient delivery failure: HTTP {status_code}")]
    ServerError {
        /// HTTP status code
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Destination answered 429.
    #[error("destination throttled: HTTP 429{}", hint_suffix(*.retry_after_seconds))]
    TooManyRequests {
        /// Parsed `Retry-After`, if present
        retry_after_seconds: Option<u64>,
        /// Response body content
        body: String,
    },

    /// The local per-destination rate limiter denied the attempt.
    #[error("rate limited: retry after {retry_after_seconds}s")]
    RateLimited {
        /// Seconds until the current window closes
        retry_after_seconds: u64,
    },

    /// Database operation failed during delivery.
    #[error("database error: {message}")]
    DatabaseError {
        /// Database error message
        message: String,
    },

    /// Invalid client or destination configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("shutdown timed out after {timeout_seconds}s")]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout_seconds: u64,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {message}")]
    WorkerPanic {
        /// Worker that panicked
        worker_id: usize,
        /// Panic payload
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

fn hint_suffix(retry_after_seconds: Option<u64>) -> String {
    retry_after_seconds.map(|s| format!(" (retry after {s}s)")).unwrap_or_default()
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a client rejection from an HTTP response.
    pub fn client_rejected(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientRejected { status_code, body: body.into() }
    }

    /// Creates a server error from an HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a 429 error with an optional server hint.
    pub fn too_many_requests(retry_after_seconds: Option<u64>, body: impl Into<String>) -> Self {
        Self::TooManyRequests { retry_after_seconds, body: body.into() }
    }

    /// Creates a local rate limit denial.
    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Whether a delivery attempt ending in this error may be retried.
    ///
    /// Network errors, timeouts, 5xx and 429 share one retry budget. A 4xx
    /// rejection is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::TooManyRequests { .. }
            | Self::RateLimited { .. }
            | Self::DatabaseError { .. } => true,

            Self::ClientRejected { .. }
            | Self::ConfigurationError { .. }
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. }
            | Self::InternalError { .. } => false,
        }
    }

    /// Minimum delay requested by the destination or the local limiter.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::TooManyRequests { retry_after_seconds, .. } => *retry_after_seconds,
            Self::RateLimited { retry_after_seconds } => Some(*retry_after_seconds),
            _ => None,
        }
    }

    /// HTTP status and body when the destination answered.
    pub fn response(&self) -> Option<(u16, &str)> {
        match self {
            Self::ClientRejected { status_code, body } | Self::ServerError { status_code, body } => {
                Some((*status_code, body.as_str()))
            },
            Self::TooManyRequests { body, .. } => Some((429, body.as_str())),
            _ => None,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConfigurationInvalid(e) => Self::configuration(e.to_string()),
            other => Self::database(other.to_string()),
        }
    }
}

/// Category of delivery error for metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues and timeouts.
    Network,
    /// HTTP 4xx rejections.
    Client,
    /// HTTP 5xx and unexpected statuses.
    Server,
    /// 429 responses and local limiter denials.
    RateLimit,
    /// Database operations.
    Database,
    /// Configuration problems.
    Configuration,
    /// Internal system errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientRejected { .. } => Self::Client,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::TooManyRequests { .. } | DeliveryError::RateLimited { .. } => {
                Self::RateLimit
            },
            DeliveryError::DatabaseError { .. } => Self::Database,
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
            DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::WorkerPanic { .. }
            | DeliveryError::InternalError { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Database => write!(f, "database"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_core::ValidationError;

    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(30).is_retryable());
        assert!(DeliveryError::server_error(503, "unavailable").is_retryable());
        assert!(DeliveryError::too_many_requests(Some(60), "").is_retryable());
        assert!(DeliveryError::rate_limited(12).is_retryable());

        assert!(!DeliveryError::client_rejected(400, "bad request").is_retryable());
        assert!(!DeliveryError::client_rejected(404, "not found").is_retryable());
        assert!(!DeliveryError::configuration("bad url").is_retryable());
    }

    #[test]
    fn retry_after_only_for_throttling() {
        assert_eq!(DeliveryError::too_many_requests(Some(900), "").retry_after_seconds(), Some(900));
        assert_eq!(DeliveryError::too_many_requests(None, "").retry_after_seconds(), None);
        assert_eq!(DeliveryError::rate_limited(7).retry_after_seconds(), Some(7));
        assert_eq!(DeliveryError::server_error(500, "").retry_after_seconds(), None);
    }

    #[test]
    fn response_exposes_status_and_body() {
        assert_eq!(DeliveryError::client_rejected(422, "invalid").response(), Some((422, "invalid")));
        assert_eq!(DeliveryError::too_many_requests(None, "slow").response(), Some((429, "slow")));
        assert_eq!(DeliveryError::timeout(30).response(), None);
    }

    #[test]
    fn categories_and_display() {
        assert_eq!(ErrorCategory::from(&DeliveryError::timeout(5)), ErrorCategory::Network);
        assert_eq!(
            ErrorCategory::from(&DeliveryError::too_many_requests(None, "")),
            ErrorCategory::RateLimit
        );
        assert_eq!(ErrorCategory::Client.to_string(), "client");
        assert_eq!(
            DeliveryError::too_many_requests(Some(30), "").to_string(),
            "destination throttled: HTTP 429 (retry after 30s)"
        );
    }

    #[test]
    fn core_errors_convert() {
        let err: DeliveryError = CoreError::from(ValidationError::InsecureScheme).into();
        assert!(matches!(err, DeliveryError::ConfigurationError { .. }));

        let err: DeliveryError = CoreError::Database("gone".into()).into();
        assert!(matches!(err, DeliveryError::DatabaseError { .. }));
    }
}
