/*!
 * Configuration for covtrail uploads
 */

use covtrail_core_resilience::{CircuitBreaker, CircuitBreakerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CovtrailError, Result};
use crate::upload::orchestrator::{
    UploadOptions, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MIN_CHUNK_SIZE,
};

/// Upload configuration, loadable from TOML
///
/// Every field has a default, so a config file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Directory holding one state document per session
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Adopt a matching persisted session instead of starting over
    #[serde(default = "default_true")]
    pub enable_resume: bool,

    /// Record a SHA-256 for every chunk
    #[serde(default = "default_true")]
    pub checksum_verify: bool,

    /// Concurrent chunk workers
    #[serde(default = "default_parallel_chunks")]
    pub parallel_chunks: usize,

    /// Requested chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,

    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,

    /// Sink attempts per chunk, including the first
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff between attempts, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Checkpoint the state every N completed chunks
    #[serde(default = "default_persist_every")]
    pub persist_every: u32,

    /// Consecutive sink failures that open the circuit (0 disables the breaker)
    #[serde(default)]
    pub circuit_breaker_threshold: u32,

    /// Seconds an open circuit waits before admitting a trial call
    #[serde(default = "default_circuit_breaker_reset_secs")]
    pub circuit_breaker_reset_secs: u64,

    #[serde(default)]
    pub log_level: LogLevel,

    /// Write JSON logs here instead of compact logs to stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub verbose: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            enable_resume: true,
            checksum_verify: true,
            parallel_chunks: default_parallel_chunks(),
            chunk_size: default_chunk_size(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            persist_every: default_persist_every(),
            circuit_breaker_threshold: 0,
            circuit_breaker_reset_secs: default_circuit_breaker_reset_secs(),
            log_level: LogLevel::default(),
            log_file: None,
            verbose: false,
        }
    }
}

/// Logging verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".covtrail").join("uploads")
}

fn default_parallel_chunks() -> usize {
    2
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_min_chunk_size() -> u64 {
    DEFAULT_MIN_CHUNK_SIZE
}

fn default_max_chunk_size() -> u64 {
    DEFAULT_MAX_CHUNK_SIZE
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_persist_every() -> u32 {
    5
}

fn default_circuit_breaker_reset_secs() -> u64 {
    60
}

impl UploadConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CovtrailError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: UploadConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| CovtrailError::Config(format!("cannot serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Settings for ephemeral CI runners: resume and per-chunk checksums on
    pub fn ci_preset() -> Self {
        Self {
            enable_resume: true,
            checksum_verify: true,
            parallel_chunks: 2,
            persist_every: 1,
            circuit_breaker_threshold: 5,
            ..Default::default()
        }
    }

    /// Settings for fast local runs: no chunk hashing, more workers
    pub fn fast_preset() -> Self {
        Self {
            checksum_verify: false,
            parallel_chunks: 8,
            persist_every: 10,
            retry_delay_ms: 250,
            ..Default::default()
        }
    }

    /// Build runtime options, rejecting invalid combinations
    pub fn to_options(&self) -> Result<UploadOptions> {
        let circuit_breaker = (self.circuit_breaker_threshold > 0).then(|| {
            CircuitBreaker::new(CircuitBreakerConfig {
                max_failures: self.circuit_breaker_threshold,
                reset_timeout: Duration::from_secs(self.circuit_breaker_reset_secs),
            })
        });

        let options = UploadOptions {
            enable_resume: self.enable_resume,
            checksum_verify: self.checksum_verify,
            parallel_chunks: self.parallel_chunks,
            chunk_size: self.chunk_size,
            min_chunk_size: self.min_chunk_size,
            max_chunk_size: self.max_chunk_size,
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            persist_every: self.persist_every,
            progress_callback: None,
            retry_policy: None,
            circuit_breaker,
        };
        options.validate()?;
        Ok(options)
    }
}
