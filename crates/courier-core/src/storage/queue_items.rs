//! Repository for the transmission queue.
//!
//! Implements the queue item state machine in SQL. Every transition is a
//! single conditional `UPDATE` guarded on the current status and on the
//! attempt the caller claimed. Each claim increments `attempt_count`, so a
//! worker whose lease was recovered and re-claimed by another worker no
//! longer matches and cannot send or write an outcome. Mutating methods
//! return `true` when the transition was applied and `false` when the caller
//! no longer owns the item.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::{
    error::{CoreError, Result},
    models::{NewQueueItem, QueueBacklog, QueueItem, QueueItemId, ResponseSnapshot},
};

const COLUMNS: &str = "id, customer_id, user_id, course_key, event_type, region, destination_id, \
                       destination_url, payload, status, attempt_count, last_attempt_at, \
                       next_retry_at, completed_at, last_error, last_http_status, response_body, \
                       dedup_key, created_at";

/// Counts from one stale-claim recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleRecovery {
    /// Items returned to `pending`.
    pub requeued: u64,
    /// Items whose lease expired on their final attempt.
    pub failed: u64,
}

/// Repository for queue item operations.
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

    /// Inserts a new item in `pending`, due at `now`.
    ///
    /// The partial unique index on `dedup_key` makes the duplicate check and
    /// the insert a single atomic step.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::DuplicateEvent` if an item in pending, processing
    /// or success already holds the key.
    pub async fn create(&self, new: &NewQueueItem, now: DateTime<Utc>) -> Result<QueueItem> {
        match self.insert(new, now).await {
            Err(err) if err.is_unique_violation() => {
                let existing = self.find_active_by_dedup_key(&new.dedup_key).await?;
                Err(CoreError::DuplicateEvent {
                    dedup_key: new.dedup_key.clone(),
                    existing_id: existing.map(|item| item.id),
                })
            },
            other => other,
        }
    }

    async fn insert(&self, new: &NewQueueItem, now: DateTime<Utc>) -> Result<QueueItem> {
        let sql = format!(
            r#"
            INSERT INTO queue_items (
                id, customer_id, user_id, course_key, event_type, region, destination_id,
                destination_url, payload, status, attempt_count, next_retry_at, dedup_key,
                created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', 0, $10, $11, $10)
            RETURNING {COLUMNS}
            "#
        );

        let item = sqlx::query_as::<_, QueueItem>(&sql)
            .bind(QueueItemId::new())
            .bind(new.customer_id)
            .bind(new.user_id)
            .bind(&new.course_key)
            .bind(new.event_type)
            .bind(new.region)
            .bind(new.destination_id)
            .bind(&new.destination_url)
            .bind(sqlx::types::Json(&new.payload))
            .bind(now)
            .bind(&new.dedup_key)
            .fetch_one(&*self.pool)
            .await?;

        Ok(item)
    }

    /// Finds an item by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: QueueItemId) -> Result<Option<QueueItem>> {
        let sql = format!("SELECT {COLUMNS} FROM queue_items WHERE id = $1");
        let item = sqlx::query_as::<_, QueueItem>(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;
        Ok(item)
    }

    /// Finds the item currently holding a dedup key, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_active_by_dedup_key(&self, dedup_key: &str) -> Result<Option<QueueItem>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM queue_items WHERE dedup_key = $1 \
             AND status IN ('pending', 'processing', 'success')"
        );
        let item = sqlx::query_as::<_, QueueItem>(&sql)
            .bind(dedup_key)
            .fetch_optional(&*self.pool)
            .await?;
        Ok(item)
    }

    /// Claims up to `batch_size` due items for delivery.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent workers claim disjoint
    /// sets without blocking each other. Claiming increments
    /// `attempt_count` and stamps `last_attempt_at`. Oldest due items are
    /// claimed first.
    ///
    /// # Errors
    ///
    /// Returns error if the statement fails.
    pub async fn claim_due(&self, batch_size: usize, now: DateTime<Utc>) -> Result<Vec<QueueItem>> {
        let returning = prefixed_columns("q");
        let sql = format!(
            r#"
            WITH due AS (
                SELECT id FROM queue_items
                WHERE status = 'pending' AND next_retry_at <= $1
                ORDER BY next_retry_at ASC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_items q
            SET status = 'processing',
                attempt_count = q.attempt_count + 1,
                last_attempt_at = $1
            FROM due
            WHERE q.id = due.id AND q.status = 'pending'
            RETURNING {returning}
            "#
        );

        let items = sqlx::query_as::<_, QueueItem>(&sql)
            .bind(now)
            .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await?;

        if !items.is_empty() {
            debug!(claimed = items.len(), "claimed due queue items");
        }
        Ok(items)
    }

    /// Claims one specific item if it is pending and due.
    ///
    /// Returns `None` when another worker won the race or the item is not
    /// claimable (terminal, processing, or not yet due).
    ///
    /// # Errors
    ///
    /// Returns error if the statement fails.
    pub async fn claim(&self, id: QueueItemId, now: DateTime<Utc>) -> Result<Option<QueueItem>> {
        let sql = format!(
            r#"
            UPDATE queue_items
            SET status = 'processing',
                attempt_count = attempt_count + 1,
                last_attempt_at = $2
            WHERE id = $1 AND status = 'pending' AND next_retry_at <= $2
            RETURNING {COLUMNS}
            "#
        );
        let item = sqlx::query_as::<_, QueueItem>(&sql)
            .bind(id)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await?;
        Ok(item)
    }

    /// Extends the lease of a claimed item to `now`.
    ///
    /// Workers call this right before each send, so the lease covers one
    /// request rather than a whole batch. Returns `false` when the claim was
    /// recovered or taken over by another worker.
    ///
    /// # Errors
    ///
    /// Returns error if the statement fails.
    pub async fn renew_claim(&self, id: QueueItemId, attempt: i32, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue_items
            SET last_attempt_at = $3
            WHERE id = $1 AND status = 'processing' AND attempt_count = $2
            "#,
        )
        .bind(id)
        .bind(attempt)
        .bind(now)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Returns a rate-limited item to `pending` without consuming the attempt.
    ///
    /// # Errors
    ///
    /// Returns error if the statement fails.
    pub async fn release_rate_limited(
        &self,
        id: QueueItemId,
        attempt: i32,
        next_retry_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'pending',
                attempt_count = GREATEST(attempt_count - 1, 0),
                next_retry_at = GREATEST(next_retry_at, $3)
            WHERE id = $1 AND status = 'processing' AND attempt_count = $2
            "#,
        )
        .bind(id)
        .bind(attempt)
        .bind(next_retry_at)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Records a 2xx response. Terminal.
    ///
    /// # Errors
    ///
    /// Returns error if the statement fails.
    pub async fn mark_success(
        &self,
        id: QueueItemId,
        attempt: i32,
        response: &ResponseSnapshot,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'success',
                completed_at = $2,
                last_http_status = $3,
                response_body = $4,
                last_error = NULL
            WHERE id = $1 AND status = 'processing' AND attempt_count = $5
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(response.status_code)
        .bind(&response.body)
        .bind(attempt)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Returns a transiently failed item to `pending` at `next_retry_at`.
    ///
    /// `next_retry_at` never moves backwards.
    ///
    /// # Errors
    ///
    /// Returns error if the statement fails.
    pub async fn schedule_retry(
        &self,
        id: QueueItemId,
        attempt: i32,
        next_retry_at: DateTime<Utc>,
        error: &str,
        response: Option<&ResponseSnapshot>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'pending',
                next_retry_at = GREATEST(next_retry_at, $2),
                last_error = $3,
                last_http_status = $4,
                response_body = $5
            WHERE id = $1 AND status = 'processing' AND attempt_count = $6
            "#,
        )
        .bind(id)
        .bind(next_retry_at)
        .bind(error)
        .bind(response.map(|r| r.status_code))
        .bind(response.map(|r| r.body.as_str()))
        .bind(attempt)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Records a permanent failure. Terminal.
    ///
    /// # Errors
    ///
    /// Returns error if the statement fails.
    pub async fn mark_failed(
        &self,
        id: QueueItemId,
        attempt: i32,
        error: &str,
        response: Option<&ResponseSnapshot>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'failed',
                completed_at = $2,
                last_error = $3,
                last_http_status = COALESCE($4, last_http_status),
                response_body = COALESCE($5, response_body)
            WHERE id = $1 AND status = 'processing' AND attempt_count = $6
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(error)
        .bind(response.map(|r| r.status_code))
        .bind(response.map(|r| r.body.as_str()))
        .bind(attempt)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Cancels a pending or processing item. Terminal.
    ///
    /// `attempt` is the attempt count the caller last saw on the item.
    ///
    /// # Errors
    ///
    /// Returns error if the statement fails.
    pub async fn cancel(
        &self,
        id: QueueItemId,
        attempt: i32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'cancelled', completed_at = $2, last_error = $3
            WHERE id = $1 AND status IN ('pending', 'processing') AND attempt_count = $4
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(reason)
        .bind(attempt)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Returns items stuck in `processing` since before `lease_cutoff`.
    ///
    /// Items with attempts left go back to `pending`, due immediately. Items
    /// whose lost attempt was their last are marked failed. Items whose
    /// destination has been removed are requeued so the next claim cancels
    /// them.
    ///
    /// # Errors
    ///
    /// Returns error if either statement fails.
    pub async fn recover_stale(
        &self,
        lease_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<StaleRecovery> {
        let mut tx = self.pool.begin().await?;

        let requeued = sqlx::query(
            r#"
            UPDATE queue_items q
            SET status = 'pending',
                next_retry_at = GREATEST(q.next_retry_at, $2)
            WHERE q.status = 'processing'
              AND q.last_attempt_at < $1
              AND q.attempt_count < COALESCE(
                  (SELECT d.max_retries + 1 FROM destination_configs d WHERE d.id = q.destination_id),
                  q.attempt_count + 1
              )
            "#,
        )
        .bind(lease_cutoff)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let failed = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'failed', completed_at = $2, last_error = 'worker lease expired'
            WHERE status = 'processing' AND last_attempt_at < $1
            "#,
        )
        .bind(lease_cutoff)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        if requeued > 0 || failed > 0 {
            warn!(requeued, failed, "recovered queue items with expired worker lease");
        }
        Ok(StaleRecovery { requeued, failed })
    }

    /// Returns pending and processing counts plus the oldest pending item.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn backlog(&self) -> Result<QueueBacklog> {
        let (pending, processing, oldest_pending_at): (i64, i64, Option<DateTime<Utc>>) =
            sqlx::query_as(
                r#"
                SELECT
                    COUNT(*) FILTER (WHERE status = 'pending'),
                    COUNT(*) FILTER (WHERE status = 'processing'),
                    MIN(created_at) FILTER (WHERE status = 'pending')
                FROM queue_items
                WHERE status IN ('pending', 'processing')
                "#,
            )
            .fetch_one(&*self.pool)
            .await?;

        Ok(QueueBacklog { pending, processing, oldest_pending_at })
    }
}

fn prefixed_columns(alias: &str) -> String {
    COLUMNS
        .split(',')
        .map(|column| format!("{alias}.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
