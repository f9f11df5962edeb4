//! Clock abstraction shared by the registry TTL, queue scores, retry
//! scheduling and the requeue sweep.
//!
//! Production code uses `RealClock`; tests inject `TestClock` and move time
//! explicitly so visibility timeouts and retry offsets can be exercised
//! without sleeping.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime},
};

use chrono::{DateTime, Utc};

/// Source of wall-clock and monotonic time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant, for latencies.
    fn now(&self) -> Instant;

    /// Wall-clock time.
    fn now_system(&self) -> SystemTime;

    /// Waits for `duration`. `TestClock` advances itself instead of waiting.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Wall-clock time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }

    /// Milliseconds since the Unix epoch. Queue scores use this unit.
    fn now_millis(&self) -> i64 {
        self.now_utc().timestamp_millis()
    }
}

/// System clock backed by tokio timers.
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

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock.
///
/// Clones share one offset, so advancing any handle moves every component
/// holding the same clock.
#[derive(Debug, Clone)]
pub struct TestClock {
    offset_ns: Arc<AtomicU64>,
    wall_start: SystemTime,
    mono_start: Instant,
}

impl TestClock {
    /// Starts at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(SystemTime::now())
    }

    /// Starts at `start`.
    pub fn starting_at(start: SystemTime) -> Self {
        Self {
            offset_ns: Arc::new(AtomicU64::new(0)),
            wall_start: start,
            mono_start: Instant::now(),
        }
    }

    /// Moves time forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.offset_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Total time advanced since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.mono_start + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        self.wall_start + self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
