//! Chunked, resumable transfer orchestration
//!
//! [`ChunkedUploader`] plans a session for a file, drives a bounded pool of
//! chunk workers through a [`ChunkSink`], and persists progress so an
//! interrupted transfer resumes where it stopped.
//!
//! # Concurrency Model
//!
//! - `Semaphore` with `parallel_chunks` permits bounds the worker pool
//! - `JoinSet` owns the spawned workers; `upload_chunks` returns only after
//!   every scheduled worker reported back
//! - The `UploadState` sits behind a single `tokio::sync::Mutex`; every
//!   mutation and every persist happens under that lock
//! - Workers read disjoint byte ranges of one read-only file handle with
//!   positional reads on the blocking pool
//!
//! Cancellation stops scheduling new chunks and interrupts backoff waits. A
//! sink call that is already running is allowed to finish.

use bytes::Bytes;
use chrono::Utc;
use covtrail_core_resilience::predicates;
use covtrail_core_resilience::retry::{self, RetryPolicy};
use covtrail_core_resilience::{BreakerError, CircuitBreaker, RetryError};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::checksum::{hash_bytes, hash_file_async};
use super::progress::{ProgressCallback, ProgressUpdate, UploadProgress};
use super::sink::{ChunkSink, SinkError};
use super::state::{
    clamp_chunk_size, plan_chunk_count, session_id_for, SessionHeader, UploadState,
};
use super::store::StateStore;
use crate::error::{ChunkFailure, ChunkFailureKind, CovtrailError, Result};

/// Default chunk size (5 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Smallest chunk size a plan will use (256 KiB)
pub const DEFAULT_MIN_CHUNK_SIZE: u64 = 256 * 1024;

/// Largest chunk size a plan will use (100 MiB)
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 100 * 1024 * 1024;

/// Runtime options for one upload call
#[derive(Clone)]
pub struct UploadOptions {
    /// Adopt a matching persisted session when planning
    pub enable_resume: bool,

    /// Record a SHA-256 per chunk
    pub checksum_verify: bool,

    /// Worker pool size
    pub parallel_chunks: usize,

    /// Requested chunk size, clamped into `[min_chunk_size, max_chunk_size]`
    pub chunk_size: u64,
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,

    /// Sink attempts per chunk per pass, including the first
    pub max_retries: u32,

    /// Initial backoff between sink attempts
    pub retry_delay: Duration,

    /// Persist the state after every N completed chunks (0: only at the end of a pass)
    pub persist_every: u32,

    pub progress_callback: Option<ProgressCallback>,

    /// Replaces the file-operation policy built from `max_retries`/`retry_delay`
    pub retry_policy: Option<RetryPolicy>,

    /// Shared gate in front of every sink call
    pub circuit_breaker: Option<CircuitBreaker>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            enable_resume: true,
            checksum_verify: true,
            parallel_chunks: 2,
            chunk_size: DEFAULT_CHUNK_SIZE,
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            persist_every: 5,
            progress_callback: None,
            retry_policy: None,
            circuit_breaker: None,
        }
    }
}

impl fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadOptions")
            .field("enable_resume", &self.enable_resume)
            .field("checksum_verify", &self.checksum_verify)
            .field("parallel_chunks", &self.parallel_chunks)
            .field("chunk_size", &self.chunk_size)
            .field("min_chunk_size", &self.min_chunk_size)
            .field("max_chunk_size", &self.max_chunk_size)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("persist_every", &self.persist_every)
            .field("progress_callback", &self.progress_callback.is_some())
            .field("retry_policy", &self.retry_policy)
            .field("circuit_breaker", &self.circuit_breaker.is_some())
            .finish()
    }
}

impl UploadOptions {
    pub fn validate(&self) -> Result<()> {
        if self.parallel_chunks == 0 {
            return Err(CovtrailError::InvalidOptions(
                "parallel_chunks must be at least 1".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(CovtrailError::InvalidOptions(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.min_chunk_size > self.max_chunk_size {
            return Err(CovtrailError::InvalidOptions(format!(
                "min_chunk_size ({}) exceeds max_chunk_size ({})",
                self.min_chunk_size, self.max_chunk_size
            )));
        }
        Ok(())
    }

    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    /// Policy applied to each chunk's sink calls
    ///
    /// Whatever the base predicate says, a rejected chunk and an open circuit
    /// are never retried within the pass.
    pub fn chunk_retry_policy(&self) -> RetryPolicy {
        let base = match &self.retry_policy {
            Some(policy) => policy.clone(),
            None => {
                let policy = RetryPolicy::file_operation();
                let max_delay = policy.max_delay.max(self.retry_delay);
                policy
                    .with_max_attempts(self.max_retries)
                    .with_initial_delay(self.retry_delay)
                    .with_max_delay(max_delay)
            }
        };

        let inner = Arc::clone(&base.retry_if);
        base.with_retry_if(predicates::from_fn(move |err| {
            match err.downcast_ref::<BreakerError<SinkError>>() {
                Some(BreakerError::Open { .. }) => false,
                Some(BreakerError::Inner(sink_err)) if sink_err.is_rejected() => false,
                _ => inner(err),
            }
        }))
    }
}

/// Result of one worker
enum ChunkOutcome {
    Uploaded,
    Cancelled,
    Failed {
        failure: ChunkFailure,
        retry_after: Option<Duration>,
    },
}

/// Everything a chunk worker needs, shared across the pool
struct ChunkWorker {
    file: Arc<File>,
    header: SessionHeader,
    state: Arc<Mutex<UploadState>>,
    sink: Arc<dyn ChunkSink>,
    policy: RetryPolicy,
    breaker: Option<CircuitBreaker>,
    checksum_verify: bool,
    persist_every: u32,
    progress: Option<ProgressCallback>,
    store: StateStore,
    cancel: CancellationToken,
    completions: AtomicU32,
}

impl ChunkWorker {
    async fn run(&self, index: u32) -> ChunkOutcome {
        let Some((offset, len)) = self.header.chunk_range(index) else {
            return self.fail_without_send(
                index,
                0,
                ChunkFailureKind::Read,
                format!("chunk index {} out of range", index),
            );
        };

        if self.cancel.is_cancelled() {
            return ChunkOutcome::Cancelled;
        }

        self.state.lock().await.mark_attempt(index, len, Utc::now());

        let data = match read_chunk(Arc::clone(&self.file), offset, len).await {
            Ok(data) => data,
            Err(e) => {
                let reason = format!("read failed at offset {}: {}", offset, e);
                self.state
                    .lock()
                    .await
                    .record_failure(index, len, 0, reason.clone(), Utc::now());
                return self.fail_without_send(index, 0, ChunkFailureKind::Read, reason);
            }
        };

        let hash = self.checksum_verify.then(|| hash_bytes(&data));

        let mut attempts = 0u32;
        let result = retry::execute_with_result(&self.cancel, &self.policy, || {
            attempts += 1;
            debug!(
                session_id = %self.header.session_id,
                chunk = index,
                attempt = attempts,
                "sending chunk"
            );
            self.send(data.clone(), index)
        })
        .await;

        match result {
            Ok(()) => {
                self.complete(index, len, hash, attempts.saturating_sub(1))
                    .await;
                ChunkOutcome::Uploaded
            }
            Err(err) => self.fail(index, len, err).await,
        }
    }

    async fn send(
        &self,
        data: Bytes,
        index: u32,
    ) -> std::result::Result<(), BreakerError<SinkError>> {
        match &self.breaker {
            Some(breaker) => {
                breaker
                    .execute(|| self.sink.send_chunk(data, index, &self.header))
                    .await
            }
            None => self
                .sink
                .send_chunk(data, index, &self.header)
                .await
                .map_err(BreakerError::Inner),
        }
    }

    async fn complete(&self, index: u32, len: u64, hash: Option<String>, failed_attempts: u32) {
        let mut state = self.state.lock().await;
        state.record_success(index, len, hash, failed_attempts, Utc::now());

        let done = self.completions.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            session_id = %self.header.session_id,
            chunk = index,
            retries = failed_attempts,
            uploaded_bytes = state.uploaded_bytes,
            "chunk uploaded"
        );

        if self.persist_every > 0 && done % self.persist_every == 0 {
            if let Err(e) = self.store.save(&state).await {
                warn!(
                    session_id = %self.header.session_id,
                    error = %e,
                    "failed to checkpoint upload state"
                );
            }
        }

        if let Some(callback) = &self.progress {
            callback(&ProgressUpdate {
                chunk_index: index,
                uploaded_bytes: state.uploaded_bytes,
                total_bytes: state.session.file_size,
                completed_chunks: state.uploaded_chunk_count(),
                total_chunks: state.session.total_chunks,
            });
        }
    }

    async fn fail(
        &self,
        index: u32,
        len: u64,
        err: RetryError<BreakerError<SinkError>>,
    ) -> ChunkOutcome {
        let reason = err
            .last_error()
            .map(|e| e.to_string())
            .unwrap_or_else(|| err.to_string());

        let (kind, failed_attempts, retry_after) = match &err {
            RetryError::Cancelled { attempts, .. } => {
                if *attempts > 0 {
                    self.state.lock().await.record_failure(
                        index,
                        len,
                        *attempts,
                        reason,
                        Utc::now(),
                    );
                }
                return ChunkOutcome::Cancelled;
            }
            RetryError::NonRetryable {
                attempt,
                source: BreakerError::Open { retry_after },
            } => (
                ChunkFailureKind::CircuitOpen,
                attempt.saturating_sub(1),
                Some(*retry_after),
            ),
            RetryError::NonRetryable { attempt, .. } => {
                (ChunkFailureKind::NonRetryable, *attempt, None)
            }
            RetryError::Exhausted { attempts, .. } => {
                (ChunkFailureKind::Exhausted, *attempts, None)
            }
        };

        warn!(
            session_id = %self.header.session_id,
            chunk = index,
            attempts = err.attempts(),
            kind = %kind,
            error = %reason,
            "chunk failed"
        );

        self.state.lock().await.record_failure(
            index,
            len,
            failed_attempts,
            reason.clone(),
            Utc::now(),
        );

        ChunkOutcome::Failed {
            failure: ChunkFailure {
                index,
                attempts: err.attempts(),
                kind,
                reason,
            },
            retry_after,
        }
    }

    fn fail_without_send(
        &self,
        index: u32,
        attempts: u32,
        kind: ChunkFailureKind,
        reason: String,
    ) -> ChunkOutcome {
        warn!(
            session_id = %self.header.session_id,
            chunk = index,
            kind = %kind,
            error = %reason,
            "chunk failed"
        );
        ChunkOutcome::Failed {
            failure: ChunkFailure {
                index,
                attempts,
                kind,
                reason,
            },
            retry_after: None,
        }
    }
}

/// Drives chunked, resumable uploads backed by a [`StateStore`]
#[derive(Debug, Clone)]
pub struct ChunkedUploader {
    store: StateStore,
}

impl ChunkedUploader {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Plan a session for `path`, or adopt a matching persisted one
    ///
    /// The file is stat'ed and hashed. With resume enabled, a persisted state
    /// with the derived id is reused when its hash and size still match;
    /// failing that, the most recently updated incomplete session for the same
    /// file name, hash and size is adopted. The returned state has been
    /// persisted.
    pub async fn start_partial_upload(
        &self,
        path: &Path,
        options: &UploadOptions,
    ) -> Result<UploadState> {
        options.validate()?;

        let (file_name, file_size) = stat_source(path).await?;
        let file_hash = hash_file_async(path).await?;
        let now = Utc::now();
        let session_id = session_id_for(&file_name, &file_hash, now);

        if options.enable_resume {
            if let Some(prior) = self
                .find_resumable(&session_id, &file_name, file_size, &file_hash)
                .await?
            {
                info!(
                    session_id = %prior.session.session_id,
                    uploaded_chunks = prior.uploaded_chunk_count(),
                    total_chunks = prior.session.total_chunks,
                    "resuming persisted upload session"
                );
                self.store.save(&prior).await?;
                return Ok(prior);
            }
        }

        let chunk_size = clamp_chunk_size(
            options.chunk_size,
            options.min_chunk_size,
            options.max_chunk_size,
        );
        let total_chunks = plan_chunk_count(file_size, chunk_size)?;

        let state = UploadState::new(
            SessionHeader {
                session_id,
                file_name,
                file_size,
                file_hash,
                chunk_size,
                total_chunks,
            },
            now,
        );
        self.store.save(&state).await?;

        info!(
            session_id = %state.session.session_id,
            file_size,
            chunk_size,
            total_chunks,
            "planned upload session"
        );
        Ok(state)
    }

    async fn find_resumable(
        &self,
        session_id: &str,
        file_name: &str,
        file_size: u64,
        file_hash: &str,
    ) -> Result<Option<UploadState>> {
        match self.store.try_load(session_id).await {
            Ok(Some(state)) if state.matches_file(file_size, file_hash) => return Ok(Some(state)),
            Ok(Some(_)) => debug!(
                session_id,
                "persisted state does not match file, planning fresh"
            ),
            Ok(None) => {}
            Err(e) => warn!(session_id, error = %e, "ignoring unreadable upload state"),
        }

        let candidate = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|s| {
                !s.completed
                    && s.session.file_name == file_name
                    && s.matches_file(file_size, file_hash)
            })
            .max_by_key(|s| s.last_update);
        Ok(candidate)
    }

    /// Send every chunk of `state` not yet marked uploaded
    ///
    /// Chunk failures do not stop sibling workers. Once the pool drains, the
    /// state is persisted and:
    /// - if cancellation left chunks unattempted, `Cancelled` is returned
    /// - if every failed chunk was turned away by an open circuit, `CircuitOpen`
    /// - if any other chunk failed, a single `PartialFailure` lists them
    /// - otherwise the state is marked completed
    ///
    /// `state` is updated in place in every case.
    pub async fn upload_chunks(
        &self,
        path: &Path,
        state: &mut UploadState,
        options: &UploadOptions,
        sink: Arc<dyn ChunkSink>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        options.validate()?;

        let pending = state.pending_chunks();
        if pending.is_empty() {
            if !state.completed {
                state.mark_completed(Utc::now());
                self.store.save(state).await?;
            }
            debug!(session_id = %state.session.session_id, "no pending chunks");
            return Ok(());
        }

        let file = open_source(path, &state.session).await?;
        let shared = Arc::new(Mutex::new(state.clone()));

        let worker = Arc::new(ChunkWorker {
            file: Arc::new(file),
            header: state.session.clone(),
            state: Arc::clone(&shared),
            sink,
            policy: options.chunk_retry_policy(),
            breaker: options.circuit_breaker.clone(),
            checksum_verify: options.checksum_verify,
            persist_every: options.persist_every,
            progress: options.progress_callback.clone(),
            store: self.store.clone(),
            cancel: cancel.clone(),
            completions: AtomicU32::new(0),
        });

        info!(
            session_id = %state.session.session_id,
            pending = pending.len(),
            parallel = options.parallel_chunks,
            "uploading chunks"
        );

        let semaphore = Arc::new(Semaphore::new(options.parallel_chunks));
        let mut tasks = JoinSet::new();
        let mut unscheduled = 0usize;

        for (position, index) in pending.iter().copied().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    unscheduled = pending.len() - position;
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.map_err(|e| CovtrailError::Worker(format!("worker pool closed: {}", e)))?
                }
            };

            let worker = Arc::clone(&worker);
            tasks.spawn(async move {
                let _permit = permit;
                worker.run(index).await
            });
        }

        let mut failures = Vec::new();
        let mut retry_after: Option<Duration> = None;
        let mut cancelled = unscheduled > 0;
        let mut worker_error = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(ChunkOutcome::Uploaded) => {}
                Ok(ChunkOutcome::Cancelled) => cancelled = true,
                Ok(ChunkOutcome::Failed {
                    failure,
                    retry_after: wait,
                }) => {
                    if let Some(wait) = wait {
                        retry_after = Some(retry_after.map_or(wait, |cur| cur.max(wait)));
                    }
                    failures.push(failure);
                }
                Err(e) => worker_error = Some(e.to_string()),
            }
        }

        *state = shared.lock().await.clone();

        if let Some(e) = worker_error {
            self.store.save(state).await?;
            return Err(CovtrailError::Worker(e));
        }

        if cancelled {
            self.store.save(state).await?;
            let remaining = state.pending_chunks().len() as u32;
            info!(
                session_id = %state.session.session_id,
                remaining,
                "upload cancelled"
            );
            return Err(CovtrailError::Cancelled {
                completed: state.uploaded_chunk_count(),
                remaining,
            });
        }

        if !failures.is_empty() {
            self.store.save(state).await?;
            failures.sort_by_key(|f| f.index);

            let all_circuit_open = failures
                .iter()
                .all(|f| f.kind == ChunkFailureKind::CircuitOpen);
            if all_circuit_open {
                if let Some(retry_after) = retry_after {
                    return Err(CovtrailError::CircuitOpen { retry_after });
                }
            }

            return Err(CovtrailError::PartialFailure {
                total: state.session.total_chunks,
                failures,
            });
        }

        state.mark_completed(Utc::now());
        self.store.save(state).await?;
        info!(
            session_id = %state.session.session_id,
            bytes = state.uploaded_bytes,
            "all chunks uploaded"
        );
        Ok(())
    }

    /// Pure consistency check of a session's chunk records
    pub fn verify_upload(&self, state: &UploadState) -> Result<()> {
        state.verify()
    }

    /// Continue a persisted session
    ///
    /// Fails with `FileChanged` when the file's size or hash no longer match the
    /// session; such a session cannot be resumed and should be discarded. On
    /// success the updated, completed state is returned.
    pub async fn resume_upload(
        &self,
        session_id: &str,
        path: &Path,
        options: &UploadOptions,
        sink: Arc<dyn ChunkSink>,
        cancel: &CancellationToken,
    ) -> Result<UploadState> {
        let mut state = self.store.load(session_id).await?;

        let (_, file_size) = stat_source(path).await?;
        let file_hash = if file_size == state.session.file_size {
            hash_file_async(path).await?
        } else {
            String::new()
        };

        if !state.matches_file(file_size, &file_hash) {
            return Err(CovtrailError::FileChanged {
                session_id: session_id.to_string(),
                expected_size: state.session.file_size,
                actual_size: file_size,
                expected_hash: state.session.file_hash.clone(),
                actual_hash: if file_hash.is_empty() {
                    "unhashed".to_string()
                } else {
                    file_hash
                },
            });
        }

        info!(
            session_id,
            uploaded_chunks = state.uploaded_chunk_count(),
            total_chunks = state.session.total_chunks,
            "resuming upload"
        );
        self.upload_chunks(path, &mut state, options, sink, cancel)
            .await?;
        Ok(state)
    }

    /// Incomplete sessions, oldest first
    pub async fn list_incomplete_uploads(&self) -> Result<Vec<UploadState>> {
        let mut states: Vec<UploadState> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|s| !s.completed)
            .collect();
        states.sort_by_key(|s| s.start_time);
        Ok(states)
    }

    /// Remove a session's persisted state; already absent is fine
    pub async fn cleanup_upload_state(&self, session_id: &str) -> Result<()> {
        self.store.remove(session_id).await
    }

    pub async fn get_upload_progress(&self, session_id: &str) -> Result<UploadProgress> {
        let state = self.store.load(session_id).await?;
        Ok(UploadProgress::from_state(&state, Utc::now()))
    }
}

/// File name and size of the source
async fn stat_source(path: &Path) -> Result<(String, u64)> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(CovtrailError::SourceNotFound(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    if !metadata.is_file() {
        return Err(CovtrailError::InvalidOptions(format!(
            "{} is not a regular file",
            path.display()
        )));
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload".to_string());
    Ok((file_name, metadata.len()))
}

/// Open the source read-only and check it still has the planned length
async fn open_source(path: &Path, session: &SessionHeader) -> Result<File> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file.into_std().await,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(CovtrailError::SourceNotFound(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };

    let actual_size = file.metadata()?.len();
    if actual_size != session.file_size {
        return Err(CovtrailError::FileChanged {
            session_id: session.session_id.clone(),
            expected_size: session.file_size,
            actual_size,
            expected_hash: session.file_hash.clone(),
            actual_hash: "unhashed".to_string(),
        });
    }
    Ok(file)
}

/// Read `len` bytes at `offset` on the blocking pool
async fn read_chunk(file: Arc<File>, offset: u64, len: u64) -> io::Result<Bytes> {
    tokio::task::spawn_blocking(move || {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "chunk too large"))?;
        let mut buf = vec![0u8; len];
        read_exact_at(&file, &mut buf, offset)?;
        Ok(Bytes::from(buf))
    })
    .await
    .map_err(io::Error::other)?
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.seek_read(&mut buf[filled..], offset + filled as u64)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "source ended before chunk was read",
            ));
        }
        filled += n;
    }
    Ok(())
}
