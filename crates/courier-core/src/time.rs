//! Clock abstraction for retry scheduling and rate windows.
//!
//! Every timestamp the queue persists (`next_retry_at`, `last_attempt_at`,
//! `completed_at`) comes from an injected [`Clock`], so retry schedules can
//! be asserted exactly without sleeping.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeZone, Utc};

/// Clock abstraction for time operations.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant for latency measurement.
    fn now(&self) -> Instant;

    /// Wall-clock time for persisted timestamps.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Sleeps for the specified duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Production clock backed by the system clock and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock for tests.
///
/// Clones share the same time source, so a clone handed to the engine moves
/// when the test advances its own handle. `sleep` advances the clock and
/// yields instead of waiting.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Microseconds since the Unix epoch.
    wall_us: Arc<AtomicI64>,
    /// Microseconds advanced since creation.
    elapsed_us: Arc<AtomicI64>,
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock starting at the current wall time, truncated to
    /// whole seconds so persisted timestamps compare cleanly.
    pub fn new() -> Self {
        let now = Utc::now();
        Self::at(Utc.timestamp_opt(now.timestamp(), 0).single().unwrap_or(now))
    }

    /// Creates a test clock starting at `start`.
    pub fn at(start: DateTime<Utc>) -> Self {
        Self {
            wall_us: Arc::new(AtomicI64::new(start.timestamp_micros())),
            elapsed_us: Arc::new(AtomicI64::new(0)),
            base_instant: Instant::now(),
        }
    }

    /// Advances wall and monotonic time by `duration`.
    pub fn advance(&self, duration: Duration) {
        let us = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        self.wall_us.fetch_add(us, Ordering::AcqRel);
        self.elapsed_us.fetch_add(us, Ordering::AcqRel);
    }

    /// Moves wall time to `time`. Monotonic time only ever moves forward.
    pub fn set(&self, time: DateTime<Utc>) {
        let target = time.timestamp_micros();
        let previous = self.wall_us.swap(target, Ordering::AcqRel);
        if target > previous {
            self.elapsed_us.fetch_add(target - previous, Ordering::AcqRel);
        }
    }

    /// Total time advanced since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(u64::try_from(self.elapsed_us.load(Ordering::Acquire)).unwrap_or(0))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let us = self.wall_us.load(Ordering::Acquire);
        Utc.timestamp_micros(us).single().unwrap_or_default()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
