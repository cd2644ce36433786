//! Per-test Postgres schemas.
//!
//! Each [`TestDatabase`] creates a fresh schema on the server named by
//! `DATABASE_URL`, points the pool's `search_path` at it and applies the
//! courier schema. Tests therefore never see each other's rows and can run
//! in parallel against one database.

use std::{str::FromStr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{storage::schema, Storage};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Environment variable naming the test server.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

/// Isolated schema with the courier tables applied.
pub struct TestDatabase {
    pool: PgPool,
    storage: Arc<Storage>,
    schema: String,
    url: String,
}

impl TestDatabase {
    /// Connects using `DATABASE_URL`, or returns `None` when it is unset.
    ///
    /// # Errors
    ///
    /// Returns error if the server is unreachable or the schema cannot be
    /// created.
    pub async fn from_env() -> Result<Option<Self>> {
        match std::env::var(DATABASE_URL_ENV) {
            Ok(url) if !url.is_empty() => Self::connect(&url).await.map(Some),
            _ => Ok(None),
        }
    }

    /// Creates a fresh schema on the server at `url`.
    ///
    /// # Errors
    ///
    /// Returns error if the server is unreachable or the schema cannot be
    /// created.
    pub async fn connect(url: &str) -> Result<Self> {
        let schema_name = format!("courier_test_{}", Uuid::new_v4().simple());

        let admin = admin_pool(url).await?;
        sqlx::query(&format!("CREATE SCHEMA {schema_name}"))
            .execute(&admin)
            .await
            .with_context(|| format!("failed to create schema {schema_name}"))?;
        admin.close().await;

        let options = PgConnectOptions::from_str(url)
            .context("invalid DATABASE_URL")?
            .options([("search_path", schema_name.as_str())]);
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .context("failed to connect test pool")?;

        schema::apply(&pool).await.context("failed to apply schema")?;
        debug!(schema = %schema_name, "test schema ready");

        Ok(Self {
            storage: Arc::new(Storage::new(pool.clone())),
            pool,
            schema: schema_name,
            url: url.to_string(),
        })
    }

    /// Pool bound to the test schema.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Repositories over the test schema.
    pub fn storage(&self) -> Arc<Storage> {
        self.storage.clone()
    }

    /// Name of the test schema.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Closes the pool and drops the schema.
    ///
    /// Schemas of tests that panic before calling this are left behind;
    /// their `courier_test_` prefix makes them easy to sweep.
    ///
    /// # Errors
    ///
    /// Returns error if the schema cannot be dropped.
    pub async fn cleanup(self) -> Result<()> {
        self.pool.close().await;

        let admin = admin_pool(&self.url).await?;
        if let Err(e) = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", self.schema))
            .execute(&admin)
            .await
        {
            warn!(schema = %self.schema, error = %e, "failed to drop test schema");
            return Err(e.into());
        }
        admin.close().await;
        Ok(())
    }
}

impl std::fmt::Debug for TestDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestDatabase").field("schema", &self.schema).finish_non_exhaustive()
    }
}

async fn admin_pool(url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await
        .context("failed to connect to DATABASE_URL")
}
