//! Bounded retry with fixed or exponential delays

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::{Error, Result};

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry
    Fixed,
    /// `base_delay * 2^attempt` plus up to 25% jitter
    Exponential,
}

/// Retry policy for device-cloud and home-automation calls
///
/// Controls how many times a failed call is retried and how long to wait
/// between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::device_busy()
    }
}

impl RetryPolicy {
    /// Targeted speech: 2 retries, fixed 500 ms apart
    #[must_use]
    pub const fn device_busy() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(500),
            backoff: Backoff::Fixed,
        }
    }

    /// Interrupt utterance: single attempt
    #[must_use]
    pub const fn interrupt() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff: Backoff::Fixed,
        }
    }

    /// Home-automation transport failures: 3 retries from 1 s, doubling
    #[must_use]
    pub const fn home_automation() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            backoff: Backoff::Exponential,
        }
    }

    /// Same policy with a different base delay (tests use tiny delays)
    #[must_use]
    pub const fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        if self.max_delay.as_nanos() < delay.as_nanos() {
            self.max_delay = delay;
        }
        self
    }
}

/// Compute the delay before retry number `attempt` (0-based)
///
/// Exponential delays get 0-25% jitter.
#[must_use]
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    match policy.backoff {
        Backoff::Fixed => policy.base_delay.min(policy.max_delay),
        Backoff::Exponential => {
            let base = policy
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempt))
                .min(policy.max_delay);

            let jitter = base.mul_f64(rand::thread_rng().gen_range(0.0..0.25));

            (base + jitter).min(policy.max_delay)
        }
    }
}

/// Run `op`, retrying while `should_retry` accepts the error and retries remain
///
/// # Errors
///
/// Returns the last error once retries are exhausted or the error is not retryable
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    should_retry: impl Fn(&Error) -> bool,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries && should_retry(&e) => {
                let delay = delay_for_attempt(policy, attempt);
                attempt += 1;
                tracing::debug!(
                    attempt,
                    max = policy.max_retries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn busy() -> Error {
        Error::DeviceBusy {
            device_id: "d".into(),
        }
    }

    #[test]
    fn fixed_delay_does_not_grow() {
        let policy = RetryPolicy::device_busy();
        assert_eq!(delay_for_attempt(&policy, 0), Duration::from_millis(500));
        assert_eq!(delay_for_attempt(&policy, 5), Duration::from_millis(500));
    }

    #[test]
    fn exponential_growth() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(60),
            ..RetryPolicy::home_automation()
        };

        assert!(delay_for_attempt(&policy, 0) >= Duration::from_secs(1));
        assert!(delay_for_attempt(&policy, 1) >= Duration::from_secs(2));
        assert!(delay_for_attempt(&policy, 2) >= Duration::from_secs(4));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(60),
            ..RetryPolicy::home_automation()
        };
        for _ in 0..50 {
            let d = delay_for_attempt(&policy, 0);
            assert!(d >= Duration::from_millis(1000), "below base: {d:?}");
            assert!(d <= Duration::from_millis(1250), "above 125%: {d:?}");
        }
    }

    #[test]
    fn delay_capped_at_max() {
        let d = delay_for_attempt(&RetryPolicy::home_automation(), 10);
        assert!(d <= Duration::from_secs(8));
    }

    #[tokio::test]
    async fn retries_only_matching_errors() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::device_busy().with_base_delay(Duration::from_millis(1));

        let result: Result<()> = retry(&policy, Error::is_device_busy, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Cloud {
                code: 1,
                message: "nope".into(),
            })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stops_after_max_retries() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::device_busy().with_base_delay(Duration::from_millis(1));

        let result: Result<()> = retry(&policy, Error::is_device_busy, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(busy())
        })
        .await;

        assert!(result.unwrap_err().is_device_busy());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::device_busy().with_base_delay(Duration::from_millis(1));

        let value = retry(&policy, Error::is_device_busy, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(busy())
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn interrupt_policy_never_retries() {
        assert_eq!(RetryPolicy::interrupt().max_retries, 0);
    }
}
