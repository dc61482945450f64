//! clock - wall-clock source for session timestamps

use chrono::{DateTime, Utc};
use tokio::time::Instant;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// the system wall clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall time derived from a fixed base plus tokio's monotonic clock.
///
/// follows `tokio::time::pause`/`advance`, so paused-time tests see session
/// timestamps move with their timers.
#[derive(Clone, Debug)]
pub struct MonotonicClock {
    base: DateTime<Utc>,
    origin: Instant,
}

impl MonotonicClock {
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.base + elapsed
    }
}
