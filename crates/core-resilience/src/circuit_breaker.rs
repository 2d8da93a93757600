//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker stops hammering a dependency that keeps failing. It has
//! three states:
//! - Closed: Normal operation, calls pass through
//! - Open: Too many consecutive failures, calls are rejected without running
//! - HalfOpen: The reset timeout elapsed, a single trial call is admitted
//!
//! The breaker is an independent gate. It does not retry; compose it with
//! [`crate::retry`] when both behaviours are wanted.

use crate::error::BreakerError;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through normally
    Closed,
    /// Calls fail immediately until the reset timeout elapses
    Open,
    /// Testing whether the dependency recovered
    HalfOpen,
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub max_failures: u32,
    /// Time since the last failure before a trial call is admitted
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_started: Option<Instant>,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            trial_started: None,
        }
    }
}

/// Circuit breaker for protecting against cascading failures
///
/// Cloning is cheap and clones share state, so one breaker can guard every
/// worker that talks to the same dependency.
///
/// # Example
/// ```no_run
/// use covtrail_core_resilience::{BreakerError, CircuitBreaker, CircuitBreakerConfig};
///
/// # async fn example() -> Result<(), BreakerError<std::io::Error>> {
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
///
/// let value = breaker
///     .execute(|| async { Ok::<_, std::io::Error>(42) })
///     .await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<CircuitBreakerState>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(CircuitBreakerState::new())),
        }
    }

    /// Create a new circuit breaker with default configuration
    pub fn new_default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state of the circuit breaker
    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Get current consecutive failure count
    pub async fn failure_count(&self) -> u32 {
        self.state.lock().await.consecutive_failures
    }

    /// Reset the circuit breaker to closed state
    pub async fn reset(&self) {
        *self.state.lock().await = CircuitBreakerState::new();
    }

    /// Run `op` unless the circuit is open
    ///
    /// A success closes the circuit and clears the failure count. A failure
    /// bumps the count, records the failure time, and opens the circuit once the
    /// count reaches `max_failures`, whatever the prior state.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + 'static,
    {
        if let Err(retry_after) = self.admit().await {
            return Err(BreakerError::Open { retry_after });
        }

        match op().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(err) => {
                self.on_failure().await;
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Check circuit state and move Open -> HalfOpen once the timeout elapsed
    ///
    /// Returns the remaining cool-down when the call must be rejected. A trial
    /// whose caller vanished without reporting back stops blocking others after
    /// another `reset_timeout`.
    async fn admit(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().await;
        let reset_timeout = self.config.reset_timeout;

        match state.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = state
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(reset_timeout);

                if elapsed >= reset_timeout {
                    debug!("circuit breaker half-open, admitting trial call");
                    state.state = CircuitState::HalfOpen;
                    state.trial_started = Some(Instant::now());
                    Ok(())
                } else {
                    Err(reset_timeout - elapsed)
                }
            }
            CircuitState::HalfOpen => match state.trial_started {
                Some(started) if started.elapsed() < reset_timeout => {
                    Err(reset_timeout - started.elapsed().min(reset_timeout))
                }
                _ => {
                    state.trial_started = Some(Instant::now());
                    Ok(())
                }
            },
        }
    }

    async fn on_success(&self) {
        let mut state = self.state.lock().await;
        if state.state != CircuitState::Closed {
            debug!("circuit breaker closed after successful call");
        }
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.trial_started = None;
    }

    async fn on_failure(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure = Some(Instant::now());
        state.trial_started = None;

        if state.consecutive_failures >= self.config.max_failures.max(1) {
            if state.state != CircuitState::Open {
                warn!(
                    failures = state.consecutive_failures,
                    reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                    "circuit breaker opened"
                );
            }
            state.state = CircuitState::Open;
        }
    }
}
