//! Test infrastructure for courier.
//!
//! Provides per-test Postgres schemas, fixture builders, a recording event
//! handler and a delivery harness that wires mock storage, a test clock and
//! a wiremock destination into a delivery engine.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod database;
pub mod events;
pub mod fixtures;
pub mod harness;

pub use courier_core::{Clock, TestClock};
pub use database::TestDatabase;
pub use events::RecordingEventHandler;
pub use fixtures::{new_queue_item, DestinationBuilder, EventRecordBuilder};
pub use harness::DeliveryHarness;

/// Opens a [`TestDatabase`] or returns `Ok(())` from the calling test when
/// `DATABASE_URL` is not set.
#[macro_export]
macro_rules! require_database {
    () => {
        match $crate::TestDatabase::from_env().await? {
            Some(db) => db,
            None => {
                eprintln!("DATABASE_URL not set, skipping database test");
                return Ok(());
            },
        }
    };
}
