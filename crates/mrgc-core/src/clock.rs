//! Clock source for the control loops.
//!
//! Timers drift, so threshold durations (sustain windows, cooldowns, the
//! recovery settle window, heartbeat staleness) are always measured as the
//! difference between two clock readings rather than by counting ticks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of wall-clock time in unix milliseconds.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the unix epoch.
    fn now_ms(&self) -> u64;

    /// Current time in whole seconds since the unix epoch.
    fn now_secs(&self) -> u64 {
        self.now_ms() / 1000
    }
}

/// Shared, type-erased clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// The real system clock.
///
/// Never returns a value lower than one it already returned, so a backwards
/// NTP step cannot make an elapsed-time computation negative.
#[derive(Debug, Default)]
pub struct SystemClock {
    high_water_ms: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for the shared handle most components take.
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let prev = self.high_water_ms.fetch_max(wall, Ordering::AcqRel);
        wall.max(prev)
    }
}

/// A manually advanced clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    /// Create a shared manual clock and return both the concrete handle
    /// (for advancing) and the erased one (for injecting).
    pub fn shared(start_ms: u64) -> (Arc<ManualClock>, SharedClock) {
        let clock = Arc::new(Self::new(start_ms));
        let erased: SharedClock = clock.clone();
        (clock, erased)
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::AcqRel);
    }

    pub fn set_ms(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::Acquire)
    }
}
