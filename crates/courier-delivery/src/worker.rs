//! Delivery engine and workers.
//!
//! Workers claim due queue items, gate them through the destination's rate
//! limiter, post the payload and write the outcome back to the queue. Each
//! step is a conditional transition on the worker's claim, so crashed or
//! slow workers can never move an item that someone else already finished.
//! The lease restarts right before each send and a worker whose claim was
//! recovered skips the send. A maintenance
//! task recovers items whose worker lease expired and publishes backlog
//! gauges.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{
    storage::queue_items::StaleRecovery, Clock, DeliveryEvent, DestinationConfig, EventHandler,
    NoOpEventHandler, QueueItem, QueueItemId, ResponseSnapshot,
};
use serde::{Deserialize, Serialize};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    client::{ClientConfig, DeliveryClient, DeliveryRequest},
    error::{DeliveryError, ErrorCategory, Result},
    metrics as m,
    rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiter},
    retry::{RetryContext, RetryDecision, RetryPolicy},
    storage::DeliveryStorage,
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Maximum items to claim per worker batch.
    pub batch_size: usize,

    /// How often idle workers poll for due items.
    pub poll_interval: Duration,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Backoff schedule.
    pub retry_policy: RetryPolicy,

    /// Maximum time to wait for workers to finish on shutdown.
    pub shutdown_timeout: Duration,

    /// How long an item may stay `processing` before it is recovered.
    pub lease_timeout: Duration,

    /// How often stale-claim recovery and backlog gauges run.
    pub maintenance_interval: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            client_config: ClientConfig::default(),
            retry_policy: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
            lease_timeout: Duration::from_secs(600),
            maintenance_interval: Duration::from_secs(30),
        }
    }
}

/// Statistics for delivery engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Number of running delivery workers.
    pub active_workers: usize,
    /// Claimed items handled since startup.
    pub items_processed: u64,
    /// Items delivered with a 2xx.
    pub successful_deliveries: u64,
    /// Retries scheduled after transient failures.
    pub retries_scheduled: u64,
    /// Items that reached `failed`.
    pub permanent_failures: u64,
    /// Items cancelled because their destination went away.
    pub cancelled: u64,
    /// Attempts deferred by the rate limiter.
    pub rate_limited: u64,
    /// Items currently being delivered.
    pub in_flight_deliveries: u64,
    /// Items recovered from expired worker leases.
    pub stale_recovered: u64,
}

/// Components shared by every worker of an engine.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) storage: Arc<dyn DeliveryStorage>,
    pub(crate) config: DeliveryConfig,
    pub(crate) client: Arc<DeliveryClient>,
    pub(crate) rate_limiter: Arc<dyn RateLimiter>,
    pub(crate) stats: Arc<RwLock<EngineStats>>,
    pub(crate) event_handler: Arc<dyn EventHandler>,
    pub(crate) clock: Arc<dyn Clock>,
}

/// Main delivery engine coordinating workers and maintenance.
pub struct DeliveryEngine {
    context: WorkerContext,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    maintenance: Option<JoinHandle<()>>,
}

impl DeliveryEngine {
    /// Creates an engine with an in-process rate limiter and no event
    /// subscribers.
    ///
    /// # Errors
    ///
    /// Returns error if the delivery client cannot be initialized.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::with_components(
            storage,
            config,
            Arc::new(InMemoryRateLimiter::new(RateLimitConfig::default())),
            clock,
            Arc::new(NoOpEventHandler),
        )
    }

    /// Creates an engine with every collaborator injected.
    ///
    /// # Errors
    ///
    /// Returns error if the delivery client cannot be initialized.
    pub fn with_components(
        storage: Arc<dyn DeliveryStorage>,
        config: DeliveryConfig,
        rate_limiter: Arc<dyn RateLimiter>,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        let client = Arc::new(DeliveryClient::new(config.client_config.clone())?);

        Ok(Self {
            context: WorkerContext {
                storage,
                config,
                client,
                rate_limiter,
                stats: Arc::new(RwLock::new(EngineStats::default())),
                event_handler,
                clock,
            },
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            maintenance: None,
        })
    }

    /// Spawns the worker pool and the maintenance task.
    ///
    /// Returns immediately. Use `shutdown()` to stop gracefully; dropping the
    /// engine cancels the workers.
    ///
    /// # Errors
    ///
    /// Returns error if the engine is already running.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(DeliveryError::internal("delivery engine already started"));
        }

        info!(
            worker_count = self.context.config.worker_count,
            batch_size = self.context.config.batch_size,
            "starting delivery engine"
        );

        let mut worker_pool =
            WorkerPool::new(self.context.clone(), self.cancellation_token.child_token());
        worker_pool.spawn_workers().await;
        self.worker_pool = Some(worker_pool);

        let context = self.context.clone();
        let cancel = self.cancellation_token.clone();
        self.maintenance = Some(tokio::spawn(maintenance_loop(context, cancel)));

        info!("delivery engine started");
        Ok(())
    }

    /// Stops workers and waits for in-flight deliveries to finish.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if workers outlive the
    /// shutdown timeout.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        let result = match self.worker_pool.take() {
            Some(worker_pool) => worker_pool.shutdown_graceful(self.context.config.shutdown_timeout).await,
            None => {
                info!("delivery engine was not started, shutdown completed immediately");
                Ok(())
            },
        };

        self.cancellation_token.cancel();
        if let Some(maintenance) = self.maintenance.take() {
            if let Err(e) = maintenance.await {
                warn!(error = %e, "maintenance task ended abnormally");
            }
        }
        result
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.context.stats.read().await.clone()
    }

    /// Shared handle to the live statistics.
    pub fn stats_handle(&self) -> Arc<RwLock<EngineStats>> {
        self.context.stats.clone()
    }

    /// Claims and processes exactly one batch on the calling task.
    ///
    /// # Errors
    ///
    /// Returns error if claiming fails.
    pub async fn process_batch(&self) -> Result<usize> {
        self.worker(0).process_batch().await
    }

    /// Claims and processes one specific item.
    ///
    /// Returns `false` when the item was not pending and due, e.g. because
    /// another worker won the claim or the item is terminal.
    ///
    /// # Errors
    ///
    /// Returns error if a storage operation fails.
    pub async fn process_item(&self, id: QueueItemId) -> Result<bool> {
        self.worker(0).process_item(id).await
    }

    /// Runs one stale-claim recovery pass and refreshes backlog gauges.
    ///
    /// # Errors
    ///
    /// Returns error if a storage operation fails.
    pub async fn run_maintenance(&self) -> Result<StaleRecovery> {
        run_maintenance_once(&self.context).await
    }

    /// Creates a worker bound to this engine's components.
    pub fn worker(&self, id: usize) -> DeliveryWorker {
        DeliveryWorker::new(id, self.context.clone(), self.cancellation_token.clone())
    }
}

impl Drop for DeliveryEngine {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

async fn run_maintenance_once(context: &WorkerContext) -> Result<StaleRecovery> {
    let now = context.clock.now_utc();
    let lease = chrono::Duration::from_std(context.config.lease_timeout)
        .map_err(|e| DeliveryError::configuration(format!("lease timeout out of range: {e}")))?;

    let recovery = context.storage.recover_stale(now - lease, now).await?;
    if recovery.requeued > 0 || recovery.failed > 0 {
        context.stats.write().await.stale_recovered += recovery.requeued + recovery.failed;
    }

    let backlog = context.storage.backlog().await?;
    #[allow(clippy::cast_precision_loss)]
    {
        metrics::gauge!(m::QUEUE_DEPTH).set(backlog.pending as f64);
        metrics::gauge!(m::QUEUE_IN_FLIGHT).set(backlog.processing as f64);
    }
    metrics::gauge!(m::OLDEST_PENDING_AGE_SECONDS).set(backlog.oldest_pending_age(now).as_secs_f64());

    Ok(recovery)
}

async fn maintenance_loop(context: WorkerContext, cancel: CancellationToken) {
    debug!("maintenance task started");

    loop {
        if let Err(e) = run_maintenance_once(&context).await {
            error!(error = %e, "queue maintenance failed");
        }

        tokio::select! {
            () = context.clock.sleep(context.config.maintenance_interval) => {},
            () = cancel.cancelled() => break,
        }
    }

    debug!("maintenance task stopped");
}

/// Individual worker that processes queue items.
pub struct DeliveryWorker {
    id: usize,
    context: WorkerContext,
    cancellation_token: CancellationToken,
}

impl DeliveryWorker {
    pub(crate) fn new(id: usize, context: WorkerContext, cancellation_token: CancellationToken) -> Self {
        Self { id, context, cancellation_token }
    }

    /// Claims and processes batches until cancelled.
    ///
    /// # Errors
    ///
    /// Never fails today; batch errors are logged and retried after a pause.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "delivery worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            let pause = match self.process_batch().await {
                Ok(0) => self.context.config.poll_interval,
                Ok(_) => continue,
                Err(e) => {
                    error!(worker_id = self.id, error = %e, "worker batch processing failed");
                    Duration::from_secs(5)
                },
            };

            tokio::select! {
                () = self.context.clock.sleep(pause) => {},
                () = self.cancellation_token.cancelled() => break,
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Claims and processes one batch of due items.
    ///
    /// # Errors
    ///
    /// Returns error if claiming fails. Per-item failures are logged.
    pub async fn process_batch(&self) -> Result<usize> {
        let now = self.context.clock.now_utc();
        let items = self
            .context
            .storage
            .claim_due(self.context.config.batch_size, now)
            .await
            .map_err(|e| DeliveryError::database(format!("failed to claim due items: {e}")))?;
        let claimed = items.len();

        if claimed > 0 {
            debug!(worker_id = self.id, claimed, "claimed queue items");
        }

        for item in items {
            let id = item.id;
            if let Err(e) = self.process_claimed(item).await {
                error!(worker_id = self.id, queue_item_id = %id, error = %e, "queue item processing failed");
            }
        }

        Ok(claimed)
    }

    /// Claims one specific item and processes it.
    ///
    /// # Errors
    ///
    /// Returns error if a storage operation fails.
    pub async fn process_item(&self, id: QueueItemId) -> Result<bool> {
        let now = self.context.clock.now_utc();
        match self.context.storage.claim(id, now).await? {
            Some(item) => {
                self.process_claimed(item).await?;
                Ok(true)
            },
            None => {
                debug!(worker_id = self.id, queue_item_id = %id, "item not claimable");
                Ok(false)
            },
        }
    }

    async fn process_claimed(&self, item: QueueItem) -> Result<()> {
        self.context.stats.write().await.in_flight_deliveries += 1;

        let result = self.attempt_delivery(&item).await;

        {
            let mut stats = self.context.stats.write().await;
            stats.in_flight_deliveries = stats.in_flight_deliveries.saturating_sub(1);
            stats.items_processed += 1;
        }

        result
    }

    async fn attempt_delivery(&self, item: &QueueItem) -> Result<()> {
        let attempt_number = u32::try_from(item.attempt_count).unwrap_or(1).max(1);

        let destination = match self.context.storage.find_destination(item.destination_id).await? {
            Some(destination) if destination.is_active => destination,
            Some(_) => return self.cancel(item, "destination deactivated").await,
            None => return self.cancel(item, "destination removed").await,
        };

        let now = self.context.clock.now_utc();
        let decision = self.context.rate_limiter.check(&destination, now).await;
        if !decision.allowed {
            return self.release_rate_limited(item, decision.retry_after_seconds, now).await;
        }

        if !self.context.storage.renew_claim(item.id, item.attempt_count, now).await? {
            warn!(
                worker_id = self.id,
                queue_item_id = %item.id,
                attempt = attempt_number,
                "claim expired before send, skipping"
            );
            return Ok(());
        }

        let delivery_id = Uuid::new_v4();
        self.context
            .event_handler
            .handle_event(DeliveryEvent::AttemptStarted {
                queue_item_id: item.id,
                delivery_id,
                attempt_number,
                destination_url: item.destination_url.clone(),
                started_at: now,
            })
            .await;

        let request = DeliveryRequest {
            delivery_id,
            queue_item_id: item.id,
            url: item.destination_url.clone(),
            bearer_token: destination.bearer_token.clone(),
            event_type: item.event_type,
            region: item.region,
            attempt_number,
            payload: item.payload().clone(),
            timeout: Some(destination.timeout()),
        };

        metrics::counter!(m::ATTEMPTED_TOTAL).increment(1);
        let started = std::time::Instant::now();
        let result = self.context.client.deliver(request).await;
        metrics::histogram!(m::SEND_LATENCY_SECONDS).record(started.elapsed().as_secs_f64());

        let finished_at = self.context.clock.now_utc();
        match result.and_then(|response| response.classify(finished_at)) {
            Ok(response) => {
                let snapshot = ResponseSnapshot::new(response.status_code, &response.body);
                if !self.context.storage.mark_success(item.id, item.attempt_count, snapshot, finished_at).await? {
                    return self.lost_ownership(item);
                }

                self.context.stats.write().await.successful_deliveries += 1;
                metrics::counter!(m::SUCCEEDED_TOTAL).increment(1);
                info!(
                    worker_id = self.id,
                    queue_item_id = %item.id,
                    attempt = attempt_number,
                    status_code = response.status_code,
                    duration_ms = response.duration.as_millis(),
                    "webhook delivered"
                );

                self.context
                    .event_handler
                    .handle_event(DeliveryEvent::Succeeded {
                        queue_item_id: item.id,
                        delivery_id,
                        response_status: response.status_code,
                        attempt_number,
                        delivered_at: finished_at,
                    })
                    .await;
                Ok(())
            },
            Err(error) => {
                self.handle_failure(item, &destination, attempt_number, delivery_id, error, finished_at)
                    .await
            },
        }
    }

    async fn handle_failure(
        &self,
        item: &QueueItem,
        destination: &DestinationConfig,
        attempt_number: u32,
        delivery_id: Uuid,
        error: DeliveryError,
        failed_at: DateTime<Utc>,
    ) -> Result<()> {
        let category = ErrorCategory::from(&error).to_string();
        let snapshot = error.response().map(|(status, body)| ResponseSnapshot::new(status, body));
        let max_retries = u32::try_from(destination.max_retries).unwrap_or(0);

        let context = RetryContext::new(
            attempt_number,
            max_retries,
            error.clone(),
            failed_at,
            self.context.config.retry_policy.clone(),
        );

        match context.decide_retry() {
            RetryDecision::Retry { next_attempt_at, delay } => {
                let applied = self
                    .context
                    .storage
                    .schedule_retry(item.id, item.attempt_count, next_attempt_at, error.to_string(), snapshot)
                    .await?;
                if !applied {
                    return self.lost_ownership(item);
                }

                self.context.stats.write().await.retries_scheduled += 1;
                metrics::counter!(m::RETRIED_TOTAL, m::LABEL_CATEGORY => category).increment(1);
                warn!(
                    worker_id = self.id,
                    queue_item_id = %item.id,
                    attempt = attempt_number,
                    delay_seconds = delay.as_secs(),
                    next_retry_at = %next_attempt_at,
                    error = %error,
                    "delivery failed, retry scheduled"
                );

                self.context
                    .event_handler
                    .handle_event(DeliveryEvent::RetryScheduled {
                        queue_item_id: item.id,
                        delivery_id,
                        attempt_number,
                        error_message: error.to_string(),
                        next_retry_at: next_attempt_at,
                    })
                    .await;
            },
            RetryDecision::GiveUp { reason, retries_exhausted } => {
                let applied = self
                    .context
                    .storage
                    .mark_failed(item.id, item.attempt_count, reason.clone(), snapshot, failed_at)
                    .await?;
                if !applied {
                    return self.lost_ownership(item);
                }

                self.context.stats.write().await.permanent_failures += 1;
                metrics::counter!(m::FAILED_TOTAL, m::LABEL_CATEGORY => category).increment(1);
                error!(
                    worker_id = self.id,
                    queue_item_id = %item.id,
                    attempt = attempt_number,
                    retries_exhausted,
                    reason = %reason,
                    "delivery permanently failed"
                );

                self.context
                    .event_handler
                    .handle_event(DeliveryEvent::Failed {
                        queue_item_id: item.id,
                        delivery_id,
                        response_status: error.response().map(|(status, _)| status),
                        attempt_number,
                        error_message: reason,
                        retries_exhausted,
                        failed_at,
                    })
                    .await;
            },
        }

        Ok(())
    }

    async fn cancel(&self, item: &QueueItem, reason: &str) -> Result<()> {
        let now = self.context.clock.now_utc();
        if !self.context.storage.cancel(item.id, item.attempt_count, reason.to_string(), now).await? {
            return self.lost_ownership(item);
        }

        self.context.stats.write().await.cancelled += 1;
        metrics::counter!(m::CANCELLED_TOTAL).increment(1);
        info!(
            worker_id = self.id,
            queue_item_id = %item.id,
            destination_id = %item.destination_id,
            reason,
            "queue item cancelled"
        );

        self.context
            .event_handler
            .handle_event(DeliveryEvent::Cancelled {
                queue_item_id: item.id,
                reason: reason.to_string(),
                cancelled_at: now,
            })
            .await;
        Ok(())
    }

    async fn release_rate_limited(
        &self,
        item: &QueueItem,
        retry_after_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let delay = i64::try_from(retry_after_seconds).unwrap_or(60);
        let next_retry_at = now + chrono::Duration::seconds(delay);

        if !self.context.storage.release_rate_limited(item.id, item.attempt_count, next_retry_at).await? {
            return self.lost_ownership(item);
        }

        self.context.stats.write().await.rate_limited += 1;
        metrics::counter!(m::RATE_LIMITED_TOTAL).increment(1);
        debug!(
            worker_id = self.id,
            queue_item_id = %item.id,
            retry_after_seconds,
            "rate limited, item returned to queue"
        );

        self.context
            .event_handler
            .handle_event(DeliveryEvent::RateLimited {
                queue_item_id: item.id,
                destination_id: item.destination_id,
                next_retry_at,
            })
            .await;
        Ok(())
    }

    fn lost_ownership(&self, item: &QueueItem) -> Result<()> {
        warn!(
            worker_id = self.id,
            queue_item_id = %item.id,
            "item left processing before its outcome was written, discarding outcome"
        );
        Ok(())
    }
}
