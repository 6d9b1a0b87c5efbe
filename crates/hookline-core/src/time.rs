//! Time abstraction for testable timing behavior.
//!
//! The worker loop, rate gate, and janitor all take a [`Clock`] so tests can
//! drive them against virtual time instead of waiting out real sleeps.

use std::{
    future::Future,
    pin::Pin,
    time::{Duration, SystemTime},
};

use chrono::{DateTime, Utc};

/// Clock abstraction for time operations.
///
/// Production code uses [`RealClock`]; tests inject controllable
/// implementations.
pub trait Clock: Send + Sync {
    /// Returns the current system time.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the specified duration.
    ///
    /// Maps to `tokio::time::sleep` in production; test clocks may resolve
    /// immediately after advancing virtual time.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Current time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }

    /// Current time as milliseconds since the Unix epoch.
    ///
    /// The rate-gate token bucket keys its refill arithmetic off this value.
    fn now_unix_ms(&self) -> i64 {
        self.now_utc().timestamp_millis()
    }
}

/// Real clock backed by system time and tokio sleeps.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}
