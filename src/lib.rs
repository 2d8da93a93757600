/*!
 * Covtrail - resilient transfer of coverage artifacts from CI runners
 *
 * Moves files that may exceed a safe single-request size across transports
 * that fail transiently, from processes that may be killed mid-transfer:
 * - Chunked transfer with a bounded worker pool
 * - Per-chunk retries with exponential backoff and jitter
 * - Optional circuit breaker in front of the destination
 * - Persisted session state so an interrupted upload resumes
 * - SHA-256 integrity anchor per session, optional per chunk
 */

pub mod config;
pub mod error;
pub mod logging;
pub mod upload;

// Re-export commonly used types
pub use config::{LogLevel, UploadConfig};
pub use error::{ChunkFailure, ChunkFailureKind, CovtrailError, ErrorCategory, Result};
pub use upload::{
    ChunkSink, ChunkedUploader, FnSink, SinkError, StagingSink, StateStore, UploadOptions,
    UploadProgress, UploadState,
};

pub use covtrail_core_resilience as resilience;
pub use covtrail_core_resilience::CancellationToken;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
