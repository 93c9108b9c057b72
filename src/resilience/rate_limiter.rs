//! Rate Limiting - Token Bucket
//!
//! Smooth per-dependency rate limiting with burst allowance: the bucket
//! holds `permits` tokens and refills continuously over `period`.

use crate::clock::{Millis, SharedClock};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

struct Bucket {
    tokens: f64,
    last_refill: Millis,
}

pub struct RateLimiter {
    permits: f64,
    period_ms: f64,
    clock: SharedClock,
    bucket: Mutex<Bucket>,
    rejected: AtomicU64,
}

impl RateLimiter {
    pub fn new(permits: u64, period: Duration, clock: SharedClock) -> Self {
        let now = clock.now_millis();
        Self {
            permits: permits.max(1) as f64,
            period_ms: (period.as_millis() as f64).max(1.0),
            clock,
            bucket: Mutex::new(Bucket {
                tokens: permits.max(1) as f64,
                last_refill: now,
            }),
            rejected: AtomicU64::new(0),
        }
    }

    /// Take one permit if available.
    pub fn try_acquire(&self) -> bool {
        let now = self.clock.now_millis();
        let mut bucket = self.bucket.lock();
        let elapsed = (now - bucket.last_refill).max(0) as f64;
        bucket.tokens =
            (bucket.tokens + elapsed / self.period_ms * self.permits).min(self.permits);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    #[test]
    fn test_burst_then_throttle() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::new(3, Duration::from_secs(1), clock.clone());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.rejected(), 1);
    }

    #[test]
    fn test_refills_over_time() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::new(10, Duration::from_secs(1), clock.clone());
        for _ in 0..10 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
        // 100ms refills one token at 10 permits/sec
        clock.advance(100);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_bucket_caps_at_capacity() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::new(2, Duration::from_secs(1), clock.clone());
        clock.advance(60_000);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }
}
