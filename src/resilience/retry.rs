//! Retry with Backoff
//!
//! Bounded retries driven by the error's own retryable flag. Fixed or
//! exponential wait with a little jitter to avoid thundering herds.

use crate::errors::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { base: Duration, cap: Duration },
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, wait: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed(wait),
        }
    }

    pub fn exponential(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential {
                base,
                cap: Duration::from_secs(30),
            },
        }
    }

    pub fn from_policy(policy: &crate::config::DependencyPolicy) -> Self {
        if policy.retry_exponential {
            Self::exponential(policy.retry_max_attempts, policy.retry_base_wait)
        } else {
            Self::fixed(policy.retry_max_attempts, policy.retry_base_wait)
        }
    }

    /// Wait before attempt `n` (1-based; attempt 1 has no wait).
    fn wait_before(&self, attempt: u32) -> Duration {
        let base = match self.backoff {
            Backoff::Fixed(wait) => wait,
            Backoff::Exponential { base, cap } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(2));
                base.saturating_mul(factor).min(cap)
            }
        };
        // up to 10% jitter
        let jitter_ms = (base.as_millis() as u64 / 10).max(1);
        base + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }
}

/// Run `op` up to `policy.max_attempts` times. Only errors whose
/// `retryable()` flag is set are re-attempted.
pub async fn retry_async<T, F, Fut>(policy: &RetryPolicy, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.retryable() && attempt < policy.max_attempts => {
                let wait = policy.wait_before(attempt + 1);
                warn!(
                    op = op_name,
                    attempt,
                    code = err.code(),
                    wait_ms = wait.as_millis() as u64,
                    "retryable failure, backing off"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PlatformError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn tiny_fixed(attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result = retry_async(&tiny_fixed(5), "test", move || {
            let calls = calls_in.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(PlatformError::DbContention("busy".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_short_circuits() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result: Result<()> = retry_async(&tiny_fixed(5), "test", move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PlatformError::DuplicateRef("REF".into()))
            }
        })
        .await;
        assert_eq!(result.unwrap_err().code(), "IDEMPOTENCY_VIOLATION-404");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result: Result<()> = retry_async(&tiny_fixed(3), "test", move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PlatformError::DbContention("busy".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exponential_wait_grows_and_caps() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(500));
        // Jitter adds at most 10%
        let w2 = policy.wait_before(2);
        let w3 = policy.wait_before(3);
        let w4 = policy.wait_before(4);
        assert!(w2 >= Duration::from_millis(500) && w2 < Duration::from_millis(600));
        assert!(w3 >= Duration::from_millis(1000) && w3 < Duration::from_millis(1200));
        assert!(w4 >= Duration::from_millis(2000) && w4 < Duration::from_millis(2400));
        assert!(policy.wait_before(30) <= Duration::from_secs(34));
    }
}
