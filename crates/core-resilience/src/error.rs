//! Error types produced by the retry engine and the circuit breaker
//!
//! Both wrappers are generic over the error of the guarded operation so callers
//! keep their own error type reachable through `source()`.

use std::error::Error as StdError;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a failed [`crate::retry::execute_with_result`] call
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: StdError + 'static,
{
    /// The retry predicate rejected the error; no further attempts were made
    #[error("non-retryable failure on attempt {attempt}: {source}")]
    NonRetryable {
        /// Attempt number (1-based) that produced the error
        attempt: u32,
        source: E,
    },

    /// Every allowed attempt failed
    #[error("operation failed after {attempts} attempts: {source}")]
    Exhausted {
        /// Total attempts made, including the first try
        attempts: u32,
        source: E,
    },

    /// The caller's cancellation token fired before or during a backoff wait
    #[error("operation cancelled after {attempts} attempts")]
    Cancelled {
        /// Attempts completed before cancellation was observed
        attempts: u32,
        /// Error from the last completed attempt, if any
        last_error: Option<E>,
    },
}

impl<E> RetryError<E>
where
    E: StdError + 'static,
{
    /// Number of attempts that were actually made
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::NonRetryable { attempt, .. } => *attempt,
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// True when the failure came from the caller's own cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }

    /// Borrow the last underlying operation error, if one was produced
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::NonRetryable { source, .. } | RetryError::Exhausted { source, .. } => {
                Some(source)
            }
            RetryError::Cancelled { last_error, .. } => last_error.as_ref(),
        }
    }

    /// Consume the wrapper and return the last underlying error
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::NonRetryable { source, .. } | RetryError::Exhausted { source, .. } => {
                Some(source)
            }
            RetryError::Cancelled { last_error, .. } => last_error,
        }
    }
}

/// Outcome of a call rejected or failed through a [`crate::CircuitBreaker`]
#[derive(Debug, Error)]
pub enum BreakerError<E>
where
    E: StdError + 'static,
{
    /// The breaker is open; the operation was not invoked
    #[error("circuit breaker is open, retry after {retry_after:?}")]
    Open {
        /// Remaining cool-down before a trial call is admitted
        retry_after: Duration,
    },

    /// The operation ran and failed
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E>
where
    E: StdError + 'static,
{
    /// True when the call was rejected without running
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}
