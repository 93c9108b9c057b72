//! Platform Clock
//!
//! Single time source for every component. Production code uses the system
//! clock; tests drive a manual clock so TTL expiry, staleness deadlines and
//! orphan thresholds can be exercised without sleeping.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Milliseconds since Unix epoch (1970-01-01 00:00:00 UTC).
pub type Millis = i64;

pub const MILLIS_PER_SEC: i64 = 1_000;
pub const MILLIS_PER_MIN: i64 = 60_000;
pub const MILLIS_PER_HOUR: i64 = 3_600_000;

/// Open-ended system-time interval marker (`system_to` of a current row).
pub const SYSTEM_TIME_OPEN: Millis = i64::MAX;

pub trait Clock: Send + Sync {
    /// Current time in epoch milliseconds.
    fn now_millis(&self) -> Millis;

    /// Current civil date in UTC.
    fn today(&self) -> chrono::NaiveDate {
        chrono::DateTime::from_timestamp_millis(self.now_millis())
            .map(|dt| dt.date_naive())
            .unwrap_or_default()
    }
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Millis {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually advanced clock for tests.
///
/// `advance` only moves forward; a backward move is a test bug and panics.
#[derive(Debug)]
pub struct ManualClock {
    current: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Millis) -> Self {
        Self {
            current: AtomicI64::new(start),
        }
    }

    pub fn advance(&self, delta_ms: Millis) {
        assert!(delta_ms >= 0, "ManualClock cannot go backward");
        self.current.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: Millis) {
        let prev = self.current.swap(now_ms, Ordering::SeqCst);
        assert!(
            now_ms >= prev,
            "ManualClock cannot go backward from {} to {}",
            prev,
            now_ms
        );
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> Millis {
        self.current.load(Ordering::SeqCst)
    }
}

/// Shared clock handle passed to components at construction.
pub type SharedClock = Arc<dyn Clock>;
