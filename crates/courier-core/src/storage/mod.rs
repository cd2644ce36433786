//! Database access layer for destinations and the transmission queue.
//!
//! Repositories translate between domain models and the Postgres schema.
//! All SQL lives in this module; callers outside it go through
//! [`Storage`] or the delivery crate's storage trait.

use std::sync::Arc;

use sqlx::PgPool;

pub mod destinations;
pub mod queue_items;
pub mod schema;

use crate::error::Result;

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for destination configurations.
    pub destinations: Arc<destinations::Repository>,

    /// Repository for queue items.
    pub queue_items: Arc<queue_items::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            destinations: Arc::new(destinations::Repository::new(pool.clone())),
            queue_items: Arc::new(queue_items::Repository::new(pool)),
        }
    }

    /// Verifies database connectivity.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.queue_items.pool()).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created_without_connecting() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://courier@localhost/courier").unwrap();
        let storage = Storage::new(pool);
        assert!(Arc::ptr_eq(&storage.destinations.pool(), &storage.queue_items.pool()));
    }
}
