//! Retry engine with exponential backoff and symmetric jitter
//!
//! [`execute_with_result`] runs an async operation up to `max_attempts` times.
//! Between attempts it waits
//!
//! ```text
//! delay = min(max_delay, initial_delay * multiplier^(attempt - 1))
//! delay = delay + delay * jitter * r      (r drawn uniformly from [-1, 1])
//! ```
//!
//! The jitter keeps concurrent callers that failed together from retrying in
//! lockstep. `r` comes from the thread-local ChaCha-based CSPRNG in `rand`.
//!
//! The wait is raced against the caller's [`CancellationToken`]; cancellation is
//! reported as [`RetryError::Cancelled`], separate from operation failures.
//!
//! # Example
//!
//! ```no_run
//! use covtrail_core_resilience::retry::{execute_with_result, RetryPolicy};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cancel = CancellationToken::new();
//! let policy = RetryPolicy::network();
//!
//! let value = execute_with_result(&cancel, &policy, || async {
//!     Ok::<_, std::io::Error>(42)
//! })
//! .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use crate::error::RetryError;
use crate::predicates::{self, RetryPredicate};
use rand::Rng;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry policy configuration
///
/// Immutable per call. The four presets differ only in their numbers and
/// predicate; they are plain values, not distinct types.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first try (at least 1)
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub initial_delay: Duration,

    /// Upper bound on the un-jittered delay
    pub max_delay: Duration,

    /// Exponential growth factor between attempts
    pub multiplier: f64,

    /// Symmetric jitter fraction (0.0-1.0)
    pub jitter: f64,

    /// Decides whether a given error is worth another attempt
    pub retry_if: RetryPredicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
            retry_if: predicates::any_of(vec![
                predicates::from_fn(predicates::is_network_transient),
                predicates::from_fn(predicates::is_http_transient),
            ]),
        }
    }
}

impl RetryPolicy {
    /// Policy for flaky network links
    pub fn network() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
            ..Default::default()
        }
    }

    /// Policy for a rate-limited remote API driven through its CLI
    pub fn remote_api() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
            retry_if: predicates::from_fn(predicates::is_remote_api_transient),
        }
    }

    /// Policy for local file and staging operations
    pub fn file_operation() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.1,
            retry_if: predicates::from_fn(predicates::is_file_operation_transient),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retry_if(mut self, retry_if: RetryPredicate) -> Self {
        self.retry_if = retry_if;
        self
    }

    /// Attempts actually allowed (a zero setting still runs once)
    pub fn effective_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay after failed attempt `attempt` (1-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let multiplier = if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier
        } else {
            1.0
        };
        let scaled = self.initial_delay.as_secs_f64() * multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());

        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Delay after failed attempt `attempt` (1-based), jitter applied
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }

        let r: f64 = rand::rng().random_range(-1.0..=1.0);
        let jittered = base.as_secs_f64() + base.as_secs_f64() * jitter * r;

        if jittered < 0.0 {
            self.initial_delay
        } else {
            Duration::from_secs_f64(jittered)
        }
    }

    fn should_retry(&self, err: &(dyn StdError + 'static)) -> bool {
        (self.retry_if)(err)
    }
}

/// Run `operation` under `policy`, discarding its success value
pub async fn execute<E, F, Fut>(
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    operation: F,
) -> Result<(), RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: StdError + 'static,
{
    execute_with_result(cancel, policy, operation).await
}

/// Run `operation` under `policy` and return its value
///
/// The operation is re-invoked for each attempt. An attempt that is already
/// running is never interrupted; cancellation is observed before an attempt
/// starts and while waiting out a backoff delay.
pub async fn execute_with_result<T, E, F, Fut>(
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: StdError + 'static,
{
    let max_attempts = policy.effective_attempts();
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled {
                attempts: attempt,
                last_error: None,
            });
        }

        attempt += 1;

        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !policy.should_retry(&err) {
            debug!(attempt, error = %err, "error is not retryable");
            return Err(RetryError::NonRetryable {
                attempt,
                source: err,
            });
        }

        if attempt >= max_attempts {
            warn!(attempts = attempt, error = %err, "retry attempts exhausted");
            return Err(RetryError::Exhausted {
                attempts: attempt,
                source: err,
            });
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "operation failed, backing off"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled {
                    attempts: attempt,
                    last_error: Some(err),
                });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
            .with_jitter(0.0)
            .with_retry_if(predicates::always())
    }

    #[test]
    fn test_base_delay_progression() {
        let policy = RetryPolicy::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(10))
            .with_jitter(0.0);

        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_base_delay_is_monotonic_and_capped() {
        for policy in [
            RetryPolicy::default(),
            RetryPolicy::network(),
            RetryPolicy::remote_api(),
            RetryPolicy::file_operation(),
            RetryPolicy::default().with_multiplier(1.5),
        ] {
            let mut previous = Duration::ZERO;
            for attempt in 1..64 {
                let delay = policy.base_delay(attempt);
                assert!(delay >= previous, "attempt {attempt} shrank: {policy:?}");
                assert!(delay <= policy.max_delay);
                previous = delay;
            }
            assert_eq!(policy.base_delay(63), policy.max_delay);
        }
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let policy = RetryPolicy::default()
            .with_initial_delay(Duration::from_millis(1000))
            .with_jitter(0.5);

        for _ in 0..200 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(500), "{delay:?}");
            assert!(delay <= Duration::from_millis(1500), "{delay:?}");
        }
    }

    #[test]
    fn test_preset_values() {
        let network = RetryPolicy::network();
        assert_eq!(network.max_attempts, 5);
        assert_eq!(network.initial_delay, Duration::from_millis(500));

        let api = RetryPolicy::remote_api();
        assert_eq!(api.max_delay, Duration::from_secs(60));
        assert_eq!(api.jitter, 0.25);

        let file = RetryPolicy::file_operation();
        assert_eq!(file.max_attempts, 3);
        assert_eq!(file.initial_delay, Duration::from_millis(100));

        assert_eq!(RetryPolicy::default().with_max_attempts(0).effective_attempts(), 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = execute_with_result(&cancel, &quick(5), || {
            let current = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if current < 3 {
                    Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
                } else {
                    Ok(current)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let policy = quick(5).with_retry_if(predicates::never());

        let result = execute(&cancel, &policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(io::Error::other("bad request")) }
        })
        .await;

        match result {
            Err(RetryError::NonRetryable { attempt, .. }) => assert_eq!(attempt, 1),
            other => panic!("expected NonRetryable, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = execute(&cancel, &quick(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(io::Error::new(io::ErrorKind::TimedOut, "slow")) }
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);

        let result = execute(&cancel, &quick(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, io::Error>(()) }
        })
        .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default()
            .with_max_attempts(10)
            .with_initial_delay(Duration::from_secs(3600))
            .with_max_delay(Duration::from_secs(3600))
            .with_jitter(0.0)
            .with_retry_if(predicates::always());

        let task = {
            let cancel = cancel.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                execute(&cancel, &policy, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(io::Error::other("flaky")) }
                })
                .await
            })
        };

        // Let the first attempt run and the task park in its backoff sleep.
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        match err {
            RetryError::Cancelled {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 1);
                assert!(last_error.is_some());
            }
            other => panic!("expected Cancelled, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
