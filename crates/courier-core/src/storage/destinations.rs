//! Repository for destination configuration database operations.
//!
//! Every write that introduces or changes a URL runs the security validator
//! first, so a row in `destination_configs` always holds a URL that passed
//! the SSRF policy.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::info;

use crate::{
    error::{CoreError, Result},
    models::{CustomerId, DestinationConfig, DestinationId, NewDestination, Region},
    validation::{validate_destination, validate_destination_url},
};

const COLUMNS: &str = "id, customer_id, region, url, bearer_token, timeout_seconds, max_retries, \
                       requests_per_minute, is_active, enrollment_events_enabled, created_at, \
                       updated_at";

/// Repository for destination configuration operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Validates and inserts a new active destination.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConfigurationInvalid` if validation fails and
    /// `CoreError::ConstraintViolation` if the customer already has an
    /// active destination for the region.
    pub async fn create(&self, new: &NewDestination, now: DateTime<Utc>) -> Result<DestinationConfig> {
        validate_destination(new)?;

        let sql = format!(
            r#"
            INSERT INTO destination_configs (
                id, customer_id, region, url, bearer_token, timeout_seconds, max_retries,
                requests_per_minute, is_active, enrollment_events_enabled, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, TRUE, $9, $10, $10)
            RETURNING {COLUMNS}
            "#
        );

        let config = sqlx::query_as::<_, DestinationConfig>(&sql)
            .bind(DestinationId::new())
            .bind(new.customer_id)
            .bind(new.region)
            .bind(new.url.trim())
            .bind(&new.bearer_token)
            .bind(new.timeout_seconds)
            .bind(new.max_retries)
            .bind(new.requests_per_minute)
            .bind(new.enrollment_events_enabled)
            .bind(now)
            .fetch_one(&*self.pool)
            .await?;

        info!(
            destination_id = %config.id,
            customer_id = %config.customer_id,
            region = %config.region,
            "destination created"
        );
        Ok(config)
    }

    /// Finds a destination by ID, active or not.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: DestinationId) -> Result<Option<DestinationConfig>> {
        let sql = format!("SELECT {COLUMNS} FROM destination_configs WHERE id = $1");
        let config = sqlx::query_as::<_, DestinationConfig>(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;
        Ok(config)
    }

    /// Finds the active destination for a customer and region.
    ///
    /// No fallback is applied here; region fallback is a routing concern.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_active(
        &self,
        customer_id: CustomerId,
        region: Region,
    ) -> Result<Option<DestinationConfig>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM destination_configs \
             WHERE customer_id = $1 AND region = $2 AND is_active"
        );
        let config = sqlx::query_as::<_, DestinationConfig>(&sql)
            .bind(customer_id)
            .bind(region)
            .fetch_optional(&*self.pool)
            .await?;
        Ok(config)
    }

    /// Validates and stores a new URL.
    ///
    /// Items already queued keep the URL snapshot they were created with.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConfigurationInvalid` if the URL fails validation
    /// and `CoreError::NotFound` if the destination does not exist.
    pub async fn update_url(
        &self,
        id: DestinationId,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<DestinationConfig> {
        validate_destination_url(url)?;

        let sql = format!(
            "UPDATE destination_configs SET url = $2, updated_at = $3 WHERE id = $1 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, DestinationConfig>(&sql)
            .bind(id)
            .bind(url.trim())
            .bind(now)
            .fetch_optional(&*self.pool)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("destination {id}")))
    }

    /// Activates or deactivates a destination.
    ///
    /// Deactivation cancels queued items lazily: each is cancelled when a
    /// worker next claims it.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` when activating would create
    /// a second active destination for the same customer and region.
    pub async fn set_active(&self, id: DestinationId, active: bool, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE destination_configs
            SET is_active = $2, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(active)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("destination {id}")));
        }
        info!(destination_id = %id, active, "destination activation changed");
        Ok(())
    }
}
