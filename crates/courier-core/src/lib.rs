//! Core domain models, validation and persistence for courier.
//!
//! Provides the strongly-typed queue and destination models, the destination
//! URL security validator, lifecycle events, the injectable clock and the
//! Postgres repositories. The delivery crate builds routing and workers on
//! top of these.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod storage;
pub mod time;
pub mod validation;

pub use error::{CoreError, Result};
pub use events::{DeliveryEvent, EventHandler, MulticastEventHandler, NoOpEventHandler};
pub use models::{
    CustomerId, DestinationConfig, DestinationId, EventType, NewDestination, NewQueueItem,
    QueueBacklog, QueueItem, QueueItemId, QueueStatus, Region, ResponseSnapshot,
};
pub use storage::Storage;
pub use time::{Clock, RealClock, TestClock};
pub use validation::{validate_destination, validate_destination_url, ValidationError};
