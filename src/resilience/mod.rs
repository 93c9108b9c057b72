//! Resilience Primitives
//!
//! Every cross-process call goes through a `DependencyGuard` that names its
//! dependency and inherits that dependency's configured circuit breaker,
//! retry policy, rate limiter and timeout.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::CircuitBreaker;
pub use rate_limiter::RateLimiter;
pub use retry::{retry_async, Backoff, RetryPolicy};

use crate::clock::SharedClock;
use crate::config::{Config, DependencyPolicy};
use crate::errors::{PlatformError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Call-site wrapper for one named dependency.
pub struct DependencyGuard {
    name: &'static str,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    retry: RetryPolicy,
    timeout: Duration,
}

impl DependencyGuard {
    pub fn new(policy: &DependencyPolicy, clock: SharedClock) -> Self {
        Self {
            name: policy.name,
            breaker: CircuitBreaker::new(policy, clock.clone()),
            limiter: RateLimiter::new(policy.rate_permits, policy.rate_period, clock),
            retry: RetryPolicy::from_policy(policy),
            timeout: policy.call_timeout,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run `op` under the dependency's limiter, breaker, timeout and retry
    /// policy. A timeout counts toward the breaker; circuit-open and
    /// rate-limited fast-fail without retrying.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_async(&self.retry, self.name, || self.attempt(&op)).await
    }

    async fn attempt<T, F, Fut>(&self, op: &F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.limiter.try_acquire() {
            metrics::counter!("guard_rate_limited_total", 1, "dependency" => self.name);
            return Err(PlatformError::RateLimited(self.name.to_string()));
        }
        if !self.breaker.try_acquire() {
            metrics::counter!("guard_short_circuited_total", 1, "dependency" => self.name);
            return Err(PlatformError::CircuitOpen(self.name.to_string()));
        }
        let start = std::time::Instant::now();
        match tokio::time::timeout(self.timeout, op()).await {
            Ok(Ok(value)) => {
                self.breaker.record(true, start.elapsed());
                Ok(value)
            }
            Ok(Err(err)) => {
                self.breaker.record(false, start.elapsed());
                Err(err)
            }
            Err(_) => {
                self.breaker.record(false, start.elapsed());
                metrics::counter!("guard_timeouts_total", 1, "dependency" => self.name);
                Err(PlatformError::CallTimeout {
                    dependency: self.name.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }
}

/// The tabulated guards, one per named dependency.
pub struct DependencyGuards {
    pub database: Arc<DependencyGuard>,
    pub kv: Arc<DependencyGuard>,
    pub messaging: Arc<DependencyGuard>,
    pub upstream_feed: Arc<DependencyGuard>,
    pub trade_channel: Arc<DependencyGuard>,
}

impl DependencyGuards {
    pub fn from_config(cfg: &Config, clock: SharedClock) -> Self {
        let deps = &cfg.dependencies;
        Self {
            database: Arc::new(DependencyGuard::new(&deps.database, clock.clone())),
            kv: Arc::new(DependencyGuard::new(&deps.kv, clock.clone())),
            messaging: Arc::new(DependencyGuard::new(&deps.messaging, clock.clone())),
            upstream_feed: Arc::new(DependencyGuard::new(&deps.upstream_feed, clock.clone())),
            trade_channel: Arc::new(DependencyGuard::new(&deps.trade_channel, clock)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> DependencyPolicy {
        DependencyPolicy {
            name: "upstream_feed",
            call_timeout: Duration::from_millis(50),
            failure_rate_threshold: 0.5,
            slow_call_threshold: Duration::from_millis(40),
            slow_rate_threshold: 1.1, // effectively off
            window_size: 10,
            min_calls: 2,
            open_wait: Duration::from_secs(30),
            half_open_probes: 1,
            retry_max_attempts: 3,
            retry_base_wait: Duration::from_millis(1),
            retry_exponential: false,
            rate_permits: 100,
            rate_period: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_call_passes_through_success() {
        let clock = Arc::new(ManualClock::new(0));
        let guard = DependencyGuard::new(&policy(), clock);
        let result = guard.call(|| async { Ok::<_, PlatformError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_retry_applies_under_guard() {
        let clock = Arc::new(ManualClock::new(0));
        let guard = DependencyGuard::new(&policy(), clock);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result = guard
            .call(move || {
                let calls = calls_in.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(PlatformError::UpstreamUnavailable("reset".into()))
                    } else {
                        Ok("snapshot")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "snapshot");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_open_circuit_fast_fails() {
        let clock = Arc::new(ManualClock::new(0));
        let guard = DependencyGuard::new(&policy(), clock);
        // Two non-retryable failures trip the breaker (min_calls = 2)
        for _ in 0..2 {
            let _ = guard
                .call(|| async {
                    Err::<(), _>(PlatformError::Validation {
                        field: "x".into(),
                        reason: "bad".into(),
                    })
                })
                .await;
        }
        assert!(guard.breaker().is_open());
        let err = guard.call(|| async { Ok::<_, PlatformError>(()) }).await;
        assert_eq!(err.unwrap_err().code(), "CIRCUIT_OPEN-601");
    }

    #[tokio::test]
    async fn test_timeout_maps_to_call_timeout() {
        let clock = Arc::new(ManualClock::new(0));
        let guard = DependencyGuard::new(&policy(), clock);
        let err = guard
            .call(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, PlatformError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CALL_TIMEOUT-603");
    }

    #[tokio::test]
    async fn test_rate_limit_exhaustion_fast_fails() {
        let clock = Arc::new(ManualClock::new(0));
        let mut p = policy();
        p.rate_permits = 1;
        let guard = DependencyGuard::new(&p, clock);
        assert!(guard.call(|| async { Ok::<_, PlatformError>(()) }).await.is_ok());
        let err = guard
            .call(|| async { Ok::<_, PlatformError>(()) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RATE_LIMITED-602");
    }
}
