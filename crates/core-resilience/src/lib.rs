//! Covtrail Core Resilience: pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! Building blocks for talking to dependencies that fail transiently:
//!
//! - **Retry Engine**: bounded attempts, exponential backoff, symmetric jitter,
//!   pluggable retryability predicates, cancellable waits
//! - **Circuit Breaker**: fails fast after a run of consecutive failures, then
//!   admits a single trial once the reset timeout elapsed
//! - **Predicates**: composable classifiers for network, HTTP-status,
//!   remote-API and local file-operation errors
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of files, upload sessions
//! or transports. The retry engine and the breaker are independent; callers
//! compose them as needed.
//!
//! ```text
//!   caller ──► retry::execute_with_result ──► CircuitBreaker::execute ──► operation
//!                 │  backoff + jitter              │  Closed / Open / HalfOpen
//!                 └─ cancellation token            └─ BreakerError::Open
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use covtrail_core_resilience::{retry, CircuitBreaker, RetryPolicy};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cancel = CancellationToken::new();
//! let breaker = CircuitBreaker::new_default();
//!
//! let body = retry::execute_with_result(&cancel, &RetryPolicy::remote_api(), || {
//!     let breaker = breaker.clone();
//!     async move {
//!         breaker
//!             .execute(|| async { Ok::<_, std::io::Error>("artifact-id") })
//!             .await
//!     }
//! })
//! .await?;
//! # let _ = body;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod error;
pub mod predicates;
pub mod retry;

// Re-export main types for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use error::{BreakerError, RetryError};
pub use predicates::RetryPredicate;
pub use retry::RetryPolicy;
pub use tokio_util::sync::CancellationToken;

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use covtrail_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::error::{BreakerError, RetryError};
    pub use super::predicates::{self, RetryPredicate};
    pub use super::retry::{self, RetryPolicy};
    pub use tokio_util::sync::CancellationToken;
}
