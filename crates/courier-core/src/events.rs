//! Queue lifecycle events and observer handlers.
//!
//! The router and delivery workers publish a [`DeliveryEvent`] for every
//! state change of a queue item. Observers (audit logs, dashboards, tests)
//! subscribe through [`EventHandler`] without the delivery path knowing
//! about them. Handler failures never affect delivery.
//!
//! ```text
//! Router ──Queued──┐
//!                  ├──▶ MulticastEventHandler ──▶ subscribers
//! Worker ──Attempt/Succeeded/RetryScheduled/Failed/Cancelled/RateLimited──┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{CustomerId, DestinationId, EventType, QueueItemId};

/// Events emitted as queue items move through their lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryEvent {
    /// A new item entered `pending`.
    Queued {
        /// Item created.
        queue_item_id: QueueItemId,
        /// Owning customer.
        customer_id: CustomerId,
        /// Destination routed to.
        destination_id: DestinationId,
        /// Event kind.
        event_type: EventType,
        /// Enqueue time.
        queued_at: DateTime<Utc>,
    },

    /// A worker claimed the item and is about to send.
    AttemptStarted {
        /// Item being delivered.
        queue_item_id: QueueItemId,
        /// Correlation id sent with this attempt.
        delivery_id: Uuid,
        /// Attempt number, 1-based.
        attempt_number: u32,
        /// Destination URL.
        destination_url: String,
        /// Claim time.
        started_at: DateTime<Utc>,
    },

    /// The destination answered 2xx.
    Succeeded {
        /// Item delivered.
        queue_item_id: QueueItemId,
        /// Correlation id of the successful attempt.
        delivery_id: Uuid,
        /// Response status.
        response_status: u16,
        /// Attempt number, 1-based.
        attempt_number: u32,
        /// Completion time.
        delivered_at: DateTime<Utc>,
    },

    /// A transient failure was rescheduled.
    RetryScheduled {
        /// Item rescheduled.
        queue_item_id: QueueItemId,
        /// Correlation id of the failed attempt.
        delivery_id: Uuid,
        /// Attempt that failed, 1-based.
        attempt_number: u32,
        /// Failure description.
        error_message: String,
        /// Next eligible claim time.
        next_retry_at: DateTime<Utc>,
    },

    /// The item reached `failed`.
    Failed {
        /// Item failed.
        queue_item_id: QueueItemId,
        /// Correlation id of the last attempt.
        delivery_id: Uuid,
        /// Response status if the destination answered.
        response_status: Option<u16>,
        /// Attempt number, 1-based.
        attempt_number: u32,
        /// Failure description.
        error_message: String,
        /// Whether the failure exhausted retries rather than being rejected.
        retries_exhausted: bool,
        /// Completion time.
        failed_at: DateTime<Utc>,
    },

    /// The item reached `cancelled`.
    Cancelled {
        /// Item cancelled.
        queue_item_id: QueueItemId,
        /// Why it was cancelled.
        reason: String,
        /// Completion time.
        cancelled_at: DateTime<Utc>,
    },

    /// The rate limiter deferred the item without consuming an attempt.
    RateLimited {
        /// Item deferred.
        queue_item_id: QueueItemId,
        /// Destination whose window is full.
        destination_id: DestinationId,
        /// Next eligible claim time.
        next_retry_at: DateTime<Utc>,
    },
}

impl DeliveryEvent {
    /// Item the event refers to.
    pub fn queue_item_id(&self) -> QueueItemId {
        match self {
            Self::Queued { queue_item_id, .. }
            | Self::AttemptStarted { queue_item_id, .. }
            | Self::Succeeded { queue_item_id, .. }
            | Self::RetryScheduled { queue_item_id, .. }
            | Self::Failed { queue_item_id, .. }
            | Self::Cancelled { queue_item_id, .. }
            | Self::RateLimited { queue_item_id, .. } => *queue_item_id,
        }
    }

    /// Short name for logs and assertions.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::AttemptStarted { .. } => "attempt_started",
            Self::Succeeded { .. } => "succeeded",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
            Self::RateLimited { .. } => "rate_limited",
        }
    }
}

/// Subscriber side of the event system.
///
/// Implementations must not block delivery for long and must swallow their
/// own errors.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles a lifecycle event.
    async fn handle_event(&self, event: DeliveryEvent);
}

/// Discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DeliveryEvent) {}
}

/// Forwards each event to every subscriber concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a new multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}
