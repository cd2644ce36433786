//! Supervised delivery worker tasks.
//!
//! Spawns the configured number of workers, tracks their join handles and
//! shuts them down within a deadline.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    worker::{DeliveryWorker, WorkerContext},
};

/// Worker pool that owns the delivery worker tasks.
pub(crate) struct WorkerPool {
    context: WorkerContext,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    pub(crate) fn new(context: WorkerContext, cancellation_token: CancellationToken) -> Self {
        Self { context, cancellation_token, worker_handles: Vec::new() }
    }

    /// Spawns all configured workers. Returns once they are running.
    pub(crate) async fn spawn_workers(&mut self) {
        let worker_count = self.context.config.worker_count;
        info!(worker_count, "spawning delivery workers");

        self.context.stats.write().await.active_workers = worker_count;

        for worker_id in 0..worker_count {
            let worker =
                DeliveryWorker::new(worker_id, self.context.clone(), self.cancellation_token.clone());

            let handle = tokio::spawn(async move {
                let result = worker.run().await;
                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "delivery worker terminated with error");
                }
                result
            });

            self.worker_handles.push(handle);
        }
    }

    /// Cancels every worker and waits for in-flight deliveries to finish.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers are still running after
    /// `timeout`, or `WorkerPanic` for the first worker that panicked.
    pub(crate) async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.context.stats.clone();
        let join_all = async move {
            let mut first_panic = None;

            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker completed with error during shutdown");
                    },
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "worker task panicked");
                        first_panic.get_or_insert(DeliveryError::WorkerPanic {
                            worker_id,
                            message: join_error.to_string(),
                        });
                    },
                }
            }

            stats.write().await.active_workers = 0;
            first_panic
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(None) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout_seconds: timeout.as_secs() })
            },
        }
    }

    /// Whether any worker task is still running.
    pub(crate) fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.has_active_workers() && !self.cancellation_token.is_cancelled() {
            warn!("worker pool dropped without graceful shutdown, cancelling workers");
            self.cancellation_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use courier_core::RealClock;
    use tokio::sync::RwLock;

    use super::*;
    use crate::{
        client::DeliveryClient,
        rate_limit::UnlimitedRateLimiter,
        storage::mock::MockDeliveryStorage,
        worker::{DeliveryConfig, EngineStats},
    };

    fn pool(worker_count: usize) -> WorkerPool {
        let config = DeliveryConfig {
            worker_count,
            poll_interval: Duration::from_millis(10),
            ..DeliveryConfig::default()
        };
        let context = WorkerContext {
            storage: Arc::new(MockDeliveryStorage::new()),
            client: Arc::new(DeliveryClient::new(config.client_config.clone()).unwrap()),
            config,
            rate_limiter: Arc::new(UnlimitedRateLimiter),
            stats: Arc::new(RwLock::new(EngineStats::default())),
            event_handler: Arc::new(courier_core::NoOpEventHandler),
            clock: Arc::new(RealClock::new()),
        };
        WorkerPool::new(context, CancellationToken::new())
    }

    #[tokio::test]
    async fn spawns_configured_worker_count() {
        let mut pool = pool(3);
        pool.spawn_workers().await;

        assert_eq!(pool.worker_handles.len(), 3);
        assert!(pool.has_active_workers());
        assert_eq!(pool.context.stats.read().await.active_workers, 3);

        let stats = pool.context.stats.clone();
        pool.shutdown_graceful(Duration::from_secs(5)).await.unwrap();
        assert_eq!(stats.read().await.active_workers, 0);
    }

    #[tokio::test]
    async fn drop_cancels_workers() {
        let mut pool = pool(1);
        pool.spawn_workers().await;
        let token = pool.cancellation_token.clone();

        drop(pool);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_of_empty_pool_succeeds() {
        pool(0).shutdown_graceful(Duration::from_millis(100)).await.unwrap();
    }
}
