//! Injected clock — every timestamp comparison in the session layer goes
//! through here instead of calling `Utc::now()`/`Instant::now()` directly,
//! so rotation/expiry logic is deterministically testable.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Source of time for rotation scheduling (monotonic) and message-age /
/// epoch gating (wall-clock). Default is `SystemClock`; tests use `TestClock`.
pub trait Clock: Send + Sync {
    fn now_monotonic(&self) -> Instant;
    fn now_wall(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_monotonic(&self) -> Instant {
        Instant::now()
    }

    fn now_wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic, manually-advanced clock for tests.
#[derive(Clone)]
pub struct TestClock {
    inner: Arc<Mutex<TestClockInner>>,
}

struct TestClockInner {
    monotonic_base: Instant,
    monotonic_offset: Duration,
    wall: DateTime<Utc>,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TestClockInner {
                monotonic_base: Instant::now(),
                monotonic_offset: Duration::ZERO,
                wall: start,
            })),
        }
    }

    pub fn advance(&self, d: chrono::Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.wall += d;
        if let Ok(std_d) = d.to_std() {
            inner.monotonic_offset += std_d;
        }
    }

    pub fn set_wall(&self, t: DateTime<Utc>) {
        self.inner.lock().unwrap().wall = t;
    }
}

impl Clock for TestClock {
    fn now_monotonic(&self) -> Instant {
        let inner = self.inner.lock().unwrap();
        inner.monotonic_base + inner.monotonic_offset
    }

    fn now_wall(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap().wall
    }
}
