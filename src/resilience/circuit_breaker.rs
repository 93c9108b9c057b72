//! Circuit Breaker
//!
//! Per-dependency breaker over a sliding window of call outcomes. Trips on
//! failure rate or slow-call rate once enough calls are observed.
//!
//! ## State Machine
//!
//! ```text
//!   CLOSED ──rate over threshold──▶ OPEN
//!     ▲                              │ open_wait elapsed
//!     │ probes all succeed           ▼
//!     └────────────────────────── HALF_OPEN
//!                                    │ any probe fails
//!                                    └──────▶ OPEN
//! ```

use crate::clock::{Millis, SharedClock};
use crate::config::DependencyPolicy;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open { until: Millis },
    HalfOpen { probes_left: u32, successes: u32 },
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    success: bool,
    slow: bool,
}

struct Inner {
    state: State,
    window: VecDeque<Outcome>,
}

#[derive(Debug, Default)]
pub struct BreakerStats {
    pub short_circuited: AtomicU64,
    pub opened: AtomicU64,
}

pub struct CircuitBreaker {
    name: &'static str,
    failure_rate_threshold: f64,
    slow_call_threshold: Duration,
    slow_rate_threshold: f64,
    window_size: usize,
    min_calls: usize,
    open_wait: Duration,
    half_open_probes: u32,
    clock: SharedClock,
    inner: Mutex<Inner>,
    stats: BreakerStats,
}

impl CircuitBreaker {
    pub fn new(policy: &DependencyPolicy, clock: SharedClock) -> Self {
        Self {
            name: policy.name,
            failure_rate_threshold: policy.failure_rate_threshold,
            slow_call_threshold: policy.slow_call_threshold,
            slow_rate_threshold: policy.slow_rate_threshold,
            window_size: policy.window_size.max(1),
            min_calls: policy.min_calls.max(1),
            open_wait: policy.open_wait,
            half_open_probes: policy.half_open_probes.max(1),
            clock,
            inner: Mutex::new(Inner {
                state: State::Closed,
                window: VecDeque::new(),
            }),
            stats: BreakerStats::default(),
        }
    }

    /// Whether a call may proceed right now. An expired OPEN moves to
    /// HALF_OPEN and admits the first probe.
    pub fn try_acquire(&self) -> bool {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => true,
            State::Open { until } => {
                if now >= until {
                    inner.state = State::HalfOpen {
                        probes_left: self.half_open_probes - 1,
                        successes: 0,
                    };
                    info!(dependency = self.name, "circuit half-open, probing");
                    true
                } else {
                    self.stats.short_circuited.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
            State::HalfOpen { probes_left, successes } => {
                if probes_left > 0 {
                    inner.state = State::HalfOpen {
                        probes_left: probes_left - 1,
                        successes,
                    };
                    true
                } else {
                    self.stats.short_circuited.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
        }
    }

    /// Record a finished call. Timeouts count as failures upstream.
    pub fn record(&self, success: bool, duration: Duration) {
        let slow = duration > self.slow_call_threshold;
        let mut inner = self.inner.lock();
        match inner.state {
            State::HalfOpen { probes_left, successes } => {
                if !success {
                    self.open(&mut inner);
                    return;
                }
                let successes = successes + 1;
                if successes >= self.half_open_probes {
                    inner.state = State::Closed;
                    inner.window.clear();
                    info!(dependency = self.name, "circuit closed");
                } else {
                    inner.state = State::HalfOpen {
                        probes_left,
                        successes,
                    };
                }
            }
            State::Closed => {
                if inner.window.len() >= self.window_size {
                    inner.window.pop_front();
                }
                inner.window.push_back(Outcome { success, slow });
                if inner.window.len() >= self.min_calls {
                    let total = inner.window.len() as f64;
                    let failures =
                        inner.window.iter().filter(|o| !o.success).count() as f64;
                    let slows = inner.window.iter().filter(|o| o.slow).count() as f64;
                    if failures / total >= self.failure_rate_threshold
                        || slows / total >= self.slow_rate_threshold
                    {
                        self.open(&mut inner);
                    }
                }
            }
            State::Open { .. } => {}
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.inner.lock().state, State::Open { .. })
    }

    pub fn stats(&self) -> &BreakerStats {
        &self.stats
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = State::Open {
            until: self.clock.now_millis() + self.open_wait.as_millis() as Millis,
        };
        inner.window.clear();
        self.stats.opened.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("circuit_breaker_opened_total", 1, "dependency" => self.name);
        warn!(dependency = self.name, "circuit opened");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        let policy = DependencyPolicy {
            name: "database",
            call_timeout: Duration::from_secs(10),
            failure_rate_threshold: 0.5,
            slow_call_threshold: Duration::from_secs(5),
            slow_rate_threshold: 0.8,
            window_size: 10,
            min_calls: 4,
            open_wait: Duration::from_secs(30),
            half_open_probes: 2,
            retry_max_attempts: 1,
            retry_base_wait: Duration::from_millis(1),
            retry_exponential: false,
            rate_permits: 1_000,
            rate_period: Duration::from_secs(1),
        };
        CircuitBreaker::new(&policy, clock)
    }

    fn fast() -> Duration {
        Duration::from_millis(10)
    }

    #[test]
    fn test_opens_on_failure_rate() {
        let clock = Arc::new(ManualClock::new(0));
        let breaker = breaker(clock);
        for _ in 0..2 {
            assert!(breaker.try_acquire());
            breaker.record(true, fast());
        }
        for _ in 0..2 {
            assert!(breaker.try_acquire());
            breaker.record(false, fast());
        }
        // 2/4 failures >= 50%
        assert!(breaker.is_open());
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn test_half_open_recovers_on_probe_success() {
        let clock = Arc::new(ManualClock::new(0));
        let breaker = breaker(clock.clone());
        for _ in 0..4 {
            breaker.try_acquire();
            breaker.record(false, fast());
        }
        assert!(breaker.is_open());

        clock.advance(30_000);
        assert!(breaker.try_acquire()); // probe 1
        breaker.record(true, fast());
        assert!(breaker.try_acquire()); // probe 2
        breaker.record(true, fast());
        assert!(!breaker.is_open());
        assert!(breaker.try_acquire());
    }

    #[test]
    fn test_half_open_reopens_on_probe_failure() {
        let clock = Arc::new(ManualClock::new(0));
        let breaker = breaker(clock.clone());
        for _ in 0..4 {
            breaker.try_acquire();
            breaker.record(false, fast());
        }
        clock.advance(30_000);
        assert!(breaker.try_acquire());
        breaker.record(false, fast());
        assert!(breaker.is_open());
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn test_opens_on_slow_call_rate() {
        let clock = Arc::new(ManualClock::new(0));
        let breaker = breaker(clock);
        for _ in 0..4 {
            assert!(breaker.try_acquire());
            breaker.record(true, Duration::from_secs(6));
        }
        // 4/4 slow >= 80%
        assert!(breaker.is_open());
    }
}
