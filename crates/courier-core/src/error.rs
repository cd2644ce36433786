//! Error types and result handling for routing and queue operations.
//!
//! Distinguishes caller-facing routing outcomes (not configured, duplicate,
//! invalid configuration) from infrastructure failures. Codes are stable so
//! logs and callers can match on them.

use thiserror::Error;

use crate::{
    models::{CustomerId, QueueItemId, Region},
    validation::ValidationError,
};

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for routing and storage operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No active destination for the customer and region (E1001).
    #[error("[E1001] Not configured: no active destination for customer {customer_id} in region {region}{}", reason_suffix(.reason))]
    NotConfigured {
        /// Customer the event belongs to.
        customer_id: CustomerId,
        /// Region requested.
        region: Region,
        /// Extra context, e.g. enrollment events disabled.
        reason: Option<String>,
    },

    /// An item already holds this dedup key (E1002). Informational.
    #[error("[E1002] Duplicate event: {dedup_key} already queued")]
    DuplicateEvent {
        /// Key that collided.
        dedup_key: String,
        /// Existing item holding the key, when known.
        existing_id: Option<QueueItemId>,
    },

    /// Destination failed validation at write time (E1003).
    #[error("[E1003] Configuration invalid: {0}")]
    ConfigurationInvalid(#[from] ValidationError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason.as_deref().map(|r| format!(" ({r})")).unwrap_or_default()
}

impl CoreError {
    /// Returns the stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotConfigured { .. } => "E1001",
            Self::DuplicateEvent { .. } => "E1002",
            Self::ConfigurationInvalid(_) => "E1003",
            Self::NotFound(_) => "E3002",
            Self::Database(_) | Self::ConstraintViolation(_) => "E3001",
            Self::InvalidInput(_) => "E9999",
        }
    }

    /// Whether the error is an expected skip rather than a failure.
    pub const fn is_informational(&self) -> bool {
        matches!(self, Self::DuplicateEvent { .. })
    }

    /// Whether the error came from a unique-index collision.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::ConstraintViolation(msg) if msg.starts_with("unique"))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {}", db_err))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {}", db_err))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {}", db_err))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        let not_configured =
            CoreError::NotConfigured { customer_id: CustomerId::new(), region: Region::Eu, reason: None };
        assert_eq!(not_configured.code(), "E1001");
        assert_eq!(
            CoreError::DuplicateEvent { dedup_key: "k".into(), existing_id: None }.code(),
            "E1002"
        );
        assert_eq!(CoreError::from(ValidationError::InsecureScheme).code(), "E1003");
        assert_eq!(CoreError::Database("down".into()).code(), "E3001");
    }

    #[test]
    fn only_duplicates_are_informational() {
        assert!(CoreError::DuplicateEvent { dedup_key: "k".into(), existing_id: None }
            .is_informational());
        assert!(!CoreError::from(ValidationError::MissingHost).is_informational());
    }

    #[test]
    fn not_configured_message_includes_reason() {
        let err = CoreError::NotConfigured {
            customer_id: CustomerId::new(),
            region: Region::Us,
            reason: Some("enrollment events disabled".into()),
        };
        assert!(err.to_string().ends_with("(enrollment events disabled)"));
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        assert!(matches!(CoreError::from(sqlx::Error::RowNotFound), CoreError::NotFound(_)));
    }
}
