/*!
 * Error types for covtrail
 */

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CovtrailError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;
pub const EXIT_INTEGRITY: i32 = 3;
pub const EXIT_CANCELLED: i32 = 4;

/// How a single chunk ended up failing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFailureKind {
    /// The retry predicate refused another attempt
    NonRetryable,
    /// Every allowed attempt failed
    Exhausted,
    /// The circuit breaker rejected the send
    CircuitOpen,
    /// Reading the chunk from the source file failed
    Read,
}

impl fmt::Display for ChunkFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkFailureKind::NonRetryable => write!(f, "non-retryable"),
            ChunkFailureKind::Exhausted => write!(f, "retries exhausted"),
            ChunkFailureKind::CircuitOpen => write!(f, "circuit open"),
            ChunkFailureKind::Read => write!(f, "read failed"),
        }
    }
}

/// A chunk that could not be delivered during one `upload_chunks` pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub index: u32,
    pub attempts: u32,
    pub kind: ChunkFailureKind,
    pub reason: String,
}

fn failed_indices(failures: &[ChunkFailure]) -> String {
    failures
        .iter()
        .map(|f| f.index.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum CovtrailError {
    /// Source file missing
    #[error("Source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// State (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration file or value error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upload options failed validation
    #[error("Invalid upload options: {0}")]
    InvalidOptions(String),

    /// No persisted state exists for the session
    #[error("Upload session not found: {0}")]
    SessionNotFound(String),

    /// The source changed since the session was planned; resume is unsafe
    #[error(
        "File changed since upload started (session {session_id}): \
         expected {expected_size} bytes / {expected_hash}, found {actual_size} bytes / {actual_hash}"
    )]
    FileChanged {
        session_id: String,
        expected_size: u64,
        actual_size: u64,
        expected_hash: String,
        actual_hash: String,
    },

    /// Some chunks failed after retries; the session stays resumable
    #[error("{} of {total} chunks failed: [{}]", .failures.len(), failed_indices(.failures))]
    PartialFailure {
        total: u32,
        failures: Vec<ChunkFailure>,
    },

    /// The caller's cancellation fired before every chunk was attempted
    #[error("Upload cancelled: {completed} chunks uploaded, {remaining} remaining")]
    Cancelled { completed: u32, remaining: u32 },

    /// The circuit breaker refused the call
    #[error("Circuit breaker open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    /// Verification found missing chunks or a byte-count mismatch
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Content hash verification failed
    #[error("Checksum verification failed: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// A worker task died without reporting back
    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl CovtrailError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CovtrailError::SourceNotFound(_)
            | CovtrailError::Config(_)
            | CovtrailError::InvalidOptions(_)
            | CovtrailError::SessionNotFound(_)
            | CovtrailError::FileChanged { .. } => EXIT_FATAL,
            CovtrailError::Integrity(_) | CovtrailError::ChecksumMismatch { .. } => {
                EXIT_INTEGRITY
            }
            CovtrailError::Cancelled { .. } => EXIT_CANCELLED,
            _ => EXIT_PARTIAL,
        }
    }

    /// True when calling again later may succeed without intervention
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            CovtrailError::PartialFailure { .. }
                | CovtrailError::Cancelled { .. }
                | CovtrailError::CircuitOpen { .. }
        )
    }

    /// Get error category for logging and instrumentation
    pub fn category(&self) -> ErrorCategory {
        match self {
            CovtrailError::SourceNotFound(_) => ErrorCategory::Validation,
            CovtrailError::Io(_) => ErrorCategory::IoError,
            CovtrailError::Serialization(_) => ErrorCategory::State,
            CovtrailError::Config(_) | CovtrailError::InvalidOptions(_) => {
                ErrorCategory::Configuration
            }
            CovtrailError::SessionNotFound(_) | CovtrailError::FileChanged { .. } => {
                ErrorCategory::Resume
            }
            CovtrailError::PartialFailure { .. } => ErrorCategory::PartialFailure,
            CovtrailError::Cancelled { .. } => ErrorCategory::Cancellation,
            CovtrailError::CircuitOpen { .. } => ErrorCategory::Retry,
            CovtrailError::Integrity(_) | CovtrailError::ChecksumMismatch { .. } => {
                ErrorCategory::Integrity
            }
            CovtrailError::Worker(_) => ErrorCategory::Concurrency,
        }
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    IoError,
    State,
    Configuration,
    Resume,
    PartialFailure,
    Cancellation,
    Retry,
    Integrity,
    Concurrency,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::IoError => write!(f, "io"),
            ErrorCategory::State => write!(f, "state"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Resume => write!(f, "resume"),
            ErrorCategory::PartialFailure => write!(f, "partial_failure"),
            ErrorCategory::Cancellation => write!(f, "cancellation"),
            ErrorCategory::Retry => write!(f, "retry"),
            ErrorCategory::Integrity => write!(f, "integrity"),
            ErrorCategory::Concurrency => write!(f, "concurrency"),
        }
    }
}

impl From<serde_json::Error> for CovtrailError {
    fn from(err: serde_json::Error) -> Self {
        CovtrailError::Serialization(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for CovtrailError {
    fn from(err: toml::de::Error) -> Self {
        CovtrailError::Config(format!("TOML parse error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(index: u32) -> ChunkFailure {
        ChunkFailure {
            index,
            attempts: 3,
            kind: ChunkFailureKind::Exhausted,
            reason: "connection reset".to_string(),
        }
    }

    #[test]
    fn test_partial_failure_display() {
        let err = CovtrailError::PartialFailure {
            total: 5,
            failures: vec![failure(1), failure(3)],
        };
        assert_eq!(err.to_string(), "2 of 5 chunks failed: [1, 3]");
        assert!(err.is_resumable());
        assert_eq!(err.exit_code(), EXIT_PARTIAL);
        assert_eq!(err.category(), ErrorCategory::PartialFailure);
    }

    #[test]
    fn test_file_changed_is_fatal() {
        let err = CovtrailError::FileChanged {
            session_id: "cov-abc-1".to_string(),
            expected_size: 10,
            actual_size: 11,
            expected_hash: "aa".to_string(),
            actual_hash: "bb".to_string(),
        };
        assert!(!err.is_resumable());
        assert_eq!(err.exit_code(), EXIT_FATAL);
        assert!(err.to_string().starts_with("File changed since upload started"));
    }

    #[test]
    fn test_integrity_exit_code() {
        let err = CovtrailError::ChecksumMismatch {
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Checksum verification failed: expected abc123, got def456"
        );
        assert_eq!(err.exit_code(), EXIT_INTEGRITY);
    }

    #[test]
    fn test_cancelled_category() {
        let err = CovtrailError::Cancelled {
            completed: 7,
            remaining: 3,
        };
        assert_eq!(err.to_string(), "Upload cancelled: 7 chunks uploaded, 3 remaining");
        assert_eq!(err.exit_code(), EXIT_CANCELLED);
        assert_eq!(err.category().to_string(), "cancellation");
    }

    #[test]
    fn test_io_conversion() {
        let err: CovtrailError = io::Error::other("disk").into();
        assert!(matches!(err, CovtrailError::Io(_)));
        assert_eq!(err.category(), ErrorCategory::IoError);
    }
}
