//! Bounded exponential backoff with jitter around arbitrary async operations.
use std::future::Future;
use std::time::Duration;

use rand::Rng;

const JITTER_MIN: f64 = 0.75;
const JITTER_MAX: f64 = 1.25;

/// How many times an operation is re-attempted after failing, and how long to wait in between.
///
/// An operation gets `retries + 1` invocations in total. The wait before retry number `n` is
/// `base_delay * 2^(n-1)`, scaled by a random factor drawn uniformly from [0.75, 1.25].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, base_delay: Duration) -> Self {
        Self {
            retries,
            base_delay,
        }
    }

    /// Un-jittered wait before retry number `attempt`, starting at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }

    /// Wait before retry number `attempt`, with jitter applied.
    pub fn retry_interval(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        let backoff = self.backoff(attempt).as_secs_f64() * jitter;
        Duration::try_from_secs_f64(backoff).unwrap_or(Duration::MAX)
    }
}

/// Runs `operation` until it succeeds or the policy's retry budget is spent.
///
/// On exhaustion the error of the last invocation is returned untouched, so callers can still
/// branch on its kind. Nothing is logged here; that is left to the caller.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_if(policy, operation, |_| true).await
}

/// Like [`retry`], but gives up immediately on errors for which `should_retry` returns false.
pub async fn retry_if<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempt += 1;
                if attempt > policy.retries || !should_retry(&error) {
                    return Err(error);
                }
                tokio::time::sleep(policy.retry_interval(attempt)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(retries: u32) -> RetryPolicy {
        RetryPolicy::new(retries, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_always_failing_operation_is_invoked_retries_plus_one_times() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), u32> = retry(&fast_policy(2), || {
            let calls = calls.clone();
            async move { Err(calls.fetch_add(1, Ordering::SeqCst) + 1) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // The error from the final invocation is the one handed back
        assert_eq!(result, Err(3));
    }

    #[tokio::test]
    async fn test_stops_on_first_success() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<&str, &str> = retry(&fast_policy(2), || {
            let calls = calls.clone();
            async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err("transient"),
                    _ => Ok("done"),
                }
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_immediate_success_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<u32, ()> = retry(&fast_policy(5), || {
            let calls = calls.clone();
            async move { Ok(calls.fetch_add(1, Ordering::SeqCst)) }
        })
        .await;

        assert_eq!(result, Ok(0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_retries_invokes_once() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), &str> = retry(&fast_policy(0), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("nope")
            }
        })
        .await;

        assert_eq!(result, Err("nope"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_if_gives_up_on_terminal_error() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), &str> = retry_if(
            &fast_policy(5),
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("malformed")
                }
            },
            |e| *e != "malformed",
        )
        .await;

        assert_eq!(result, Err("malformed"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(3, Duration::from_millis(200));

        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = RetryPolicy::new(100, Duration::from_secs(1));

        assert_eq!(policy.backoff(80), Duration::from_secs(u32::MAX as u64));
    }

    #[test]
    fn test_retry_interval_stays_within_jitter_bounds() {
        let policy = RetryPolicy::new(3, Duration::from_millis(200));

        for attempt in 1..=3 {
            let backoff = policy.backoff(attempt);
            for _ in 0..100 {
                let interval = policy.retry_interval(attempt);
                assert!(interval >= backoff.mul_f64(JITTER_MIN));
                assert!(interval <= backoff.mul_f64(JITTER_MAX));
            }
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.retries, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(200));
    }
}
