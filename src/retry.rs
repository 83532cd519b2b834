//! Retry for transient coordinator failures.
//!
//! The admin transport distinguishes transient faults (connection loss,
//! 5xx) from definitive answers (NotFound, Conflict, 4xx). Only the
//! former are worth repeating inside a pass; a definitive answer is
//! returned immediately so the reconciler can re-handle it on the next
//! pass against a fresh placement read.

use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Classifies whether an error is worth retrying.
///
/// Implemented by the operator's error types so the retrier never
/// repeats a request the coordinator has already definitively answered.
pub trait Transient {
    /// Whether retrying the failed operation later could succeed
    fn is_transient(&self) -> bool;
}

/// Bounded retry policy with doubling, jittered backoff
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Ceiling on the backoff delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Policy with a different attempt bound
    pub fn limited(attempts: u32) -> Self {
        Self {
            attempts,
            ..Default::default()
        }
    }

    /// Jittered delay before the retry that follows `attempt` (1-based).
    ///
    /// Doubles per attempt up to the ceiling, then spreads the result
    /// over 0.5x..1.5x so colocated operators do not retry in lockstep.
    pub fn delay_before_retry(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let nominal = self.base_delay.as_secs_f64() * f64::from(1u32 << exponent);
        let capped = nominal.min(self.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter)
    }
}

/// Run `operation` until it succeeds, fails definitively, or exhausts
/// the attempt bound. Non-transient errors are returned on first sight.
pub async fn retry_transient<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Transient + std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_transient() || attempt >= config.attempts {
            return Err(err);
        }

        let delay = config.delay_before_retry(attempt);
        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "transient failure, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Stand-in for the admin transport's error split
    #[derive(Debug, PartialEq)]
    enum ProbeError {
        /// Definitive answer, e.g. the placement does not exist
        Gone,
        /// Connection-level failure
        Flaky,
    }

    impl std::fmt::Display for ProbeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::Gone => write!(f, "gone"),
                Self::Flaky => write!(f, "flaky"),
            }
        }
    }

    impl Transient for ProbeError {
        fn is_transient(&self) -> bool {
            matches!(self, Self::Flaky)
        }
    }

    fn fast() -> RetryConfig {
        RetryConfig {
            attempts: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn definitive_answers_are_never_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), ProbeError> = retry_transient(&fast(), "get_placement", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(ProbeError::Gone)
            }
        })
        .await;

        assert_eq!(result, Err(ProbeError::Gone));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<u32, ProbeError> = retry_transient(&fast(), "add_instances", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProbeError::Flaky)
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempt_bound_caps_transient_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), ProbeError> = retry_transient(&fast(), "probe", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(ProbeError::Flaky)
            }
        })
        .await;

        assert_eq!(result, Err(ProbeError::Flaky));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn backoff_doubles_then_caps_with_bounded_jitter() {
        let config = RetryConfig {
            attempts: 8,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
        };

        // attempt 1 -> nominal 100ms, attempt 2 -> 200ms, attempt 4+ -> capped 400ms
        for (attempt, nominal_ms) in [(1u32, 100.0f64), (2, 200.0), (3, 400.0), (6, 400.0)] {
            let delay = config.delay_before_retry(attempt).as_secs_f64() * 1000.0;
            assert!(
                delay >= nominal_ms * 0.5 && delay <= nominal_ms * 1.5,
                "attempt {attempt}: {delay}ms outside jitter window of {nominal_ms}ms"
            );
        }
    }
}
