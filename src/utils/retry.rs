use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Fixed-delay retry policy.
///
/// Runs an operation up to `max_attempts` times, sleeping `delay` between
/// failures. The last error is returned once the attempts are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Policy used for broker connection setup: 5 attempts, 2 s apart.
    pub const BROKER_CONNECT: RetryPolicy = RetryPolicy {
        max_attempts: 5,
        delay: Duration::from_secs(2),
    };

    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }

    /// Execute `operation` under this policy
    pub async fn run<F, Fut, T, E>(&self, operation_name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        // Ensure we always attempt at least once, even if max_attempts is 0
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = operation_name, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts,
                        error = %e,
                        "attempt {} failed",
                        attempt
                    );
                    if attempt >= max_attempts {
                        error!(operation = operation_name, "all {} attempts failed", max_attempts);
                        return Err(e);
                    }
                }
            }

            sleep(self.delay).await;
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::BROKER_CONNECT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    const FAST: RetryPolicy = RetryPolicy::new(3, Duration::from_millis(5));

    #[tokio::test]
    async fn test_first_success_does_not_retry() {
        let calls = &AtomicU32::new(0);
        let result: Result<u32, String> = FAST
            .run("op", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_before_exhaustion() {
        let calls = &AtomicU32::new(0);
        let result: Result<&str, String> = FAST
            .run("op", || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("failure {n}"))
                } else {
                    Ok("connected")
                }
            })
            .await;
        assert_eq!(result, Ok("connected"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_last_error() {
        let calls = &AtomicU32::new(0);
        let started = Instant::now();
        let result: Result<(), String> = FAST
            .run("op", || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(format!("failure {n}"))
            })
            .await;
        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // two fixed sleeps between three attempts
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::new(0, Duration::from_millis(1));
        let result: Result<(), &str> = policy
            .run("op", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("down")
            })
            .await;
        assert_eq!(result, Err("down"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_is_broker_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay, Duration::from_secs(2));
    }
}
