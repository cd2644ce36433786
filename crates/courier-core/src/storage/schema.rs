//! Idempotent schema setup for the courier tables.
//!
//! Statements are applied one at a time in order; every statement uses
//! `IF NOT EXISTS` so applying the schema on every startup is safe.

use sqlx::PgPool;
use tracing::debug;

use crate::error::Result;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS destination_configs (
        id UUID PRIMARY KEY,
        customer_id UUID NOT NULL,
        region TEXT NOT NULL CHECK (region IN ('US', 'EU', 'UK', 'OTHER')),
        url TEXT NOT NULL CHECK (url LIKE 'https://%'),
        bearer_token TEXT,
        timeout_seconds INTEGER NOT NULL DEFAULT 30
            CHECK (timeout_seconds BETWEEN 5 AND 300),
        max_retries INTEGER NOT NULL DEFAULT 3 CHECK (max_retries >= 0),
        requests_per_minute INTEGER NOT NULL DEFAULT 100 CHECK (requests_per_minute > 0),
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        enrollment_events_enabled BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    // One active destination per customer and region.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_destination_configs_active
        ON destination_configs (customer_id, region)
        WHERE is_active
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queue_items (
        id UUID PRIMARY KEY,
        customer_id UUID NOT NULL,
        user_id BIGINT NOT NULL,
        course_key TEXT NOT NULL,
        event_type TEXT NOT NULL
            CHECK (event_type IN ('course_completion', 'course_enrollment')),
        region TEXT NOT NULL CHECK (region IN ('US', 'EU', 'UK', 'OTHER')),
        destination_id UUID NOT NULL,
        destination_url TEXT NOT NULL,
        payload JSONB NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'processing', 'success', 'failed', 'cancelled')),
        attempt_count INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
        last_attempt_at TIMESTAMPTZ,
        next_retry_at TIMESTAMPTZ NOT NULL,
        completed_at TIMESTAMPTZ,
        last_error TEXT,
        last_http_status INTEGER,
        response_body TEXT,
        dedup_key TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    // Failed and cancelled items release their key.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_items_dedup_key
        ON queue_items (dedup_key)
        WHERE status IN ('pending', 'processing', 'success')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_queue_items_due
        ON queue_items (next_retry_at)
        WHERE status = 'pending'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_queue_items_processing
        ON queue_items (last_attempt_at)
        WHERE status = 'processing'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_queue_items_customer
        ON queue_items (customer_id, created_at)
    "#,
];

/// Creates tables and indexes if they do not exist.
///
/// # Errors
///
/// Returns the first statement failure.
pub async fn apply(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    debug!(statements = STATEMENTS.len(), "schema applied");
    Ok(())
}
