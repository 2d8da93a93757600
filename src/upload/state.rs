/*!
 * Persisted upload session state
 *
 * An `UploadState` is the unit of persisted truth for one chunked transfer. The
 * immutable identity of the session lives in `SessionHeader`; everything else is
 * mutated chunk by chunk while the transfer runs.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CovtrailError, Result};

/// Current state document format version
pub const FORMAT_VERSION: u32 = 1;

const SESSION_STEM_MAX: usize = 48;
const SESSION_HASH_PREFIX: usize = 12;

/// Identity of an upload session, fixed at planning time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub session_id: String,
    pub file_name: String,
    pub file_size: u64,
    /// SHA-256 of the whole source file, hex encoded
    pub file_hash: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
}

impl SessionHeader {
    /// Byte range `(offset, len)` covered by chunk `index`
    pub fn chunk_range(&self, index: u32) -> Option<(u64, u64)> {
        if index >= self.total_chunks || self.chunk_size == 0 {
            return None;
        }
        let offset = u64::from(index) * self.chunk_size;
        let len = self.chunk_size.min(self.file_size.saturating_sub(offset));
        Some((offset, len))
    }
}

/// Number of chunks needed to cover `file_size` bytes
pub fn plan_chunk_count(file_size: u64, chunk_size: u64) -> Result<u32> {
    if chunk_size == 0 {
        return Err(CovtrailError::InvalidOptions(
            "chunk size must be greater than zero".to_string(),
        ));
    }
    u32::try_from(file_size.div_ceil(chunk_size)).map_err(|_| {
        CovtrailError::InvalidOptions(format!(
            "{} bytes at chunk size {} exceeds the chunk index range",
            file_size, chunk_size
        ))
    })
}

/// Clamp a requested chunk size into `[min, max]`
pub fn clamp_chunk_size(requested: u64, min: u64, max: u64) -> u64 {
    requested.clamp(min.max(1), max.max(min).max(1))
}

/// Derive a session identifier from file identity and start time
///
/// Format: `<stem>-<first 12 hex chars of hash>-<unix millis>`.
pub fn session_id_for(file_name: &str, file_hash: &str, started: DateTime<Utc>) -> String {
    let stem = std::path::Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut sanitized: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(SESSION_STEM_MAX)
        .collect();
    if sanitized.is_empty() {
        sanitized = "upload".to_string();
    }

    let hash_prefix = file_hash.get(..SESSION_HASH_PREFIX).unwrap_or(file_hash);
    format!(
        "{}-{}-{}",
        sanitized,
        hash_prefix,
        started.timestamp_millis()
    )
}

/// Per-chunk record, created on first attempt and never removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub index: u32,
    pub size: u64,
    /// SHA-256 of the chunk bytes, when checksum verification is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    pub uploaded: bool,
    pub last_attempt: DateTime<Utc>,
    /// Failed sink attempts over the lifetime of the chunk
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ChunkInfo {
    fn new(index: u32, size: u64, now: DateTime<Utc>) -> Self {
        Self {
            index,
            size,
            hash: None,
            uploaded: false,
            last_attempt: now,
            retries: 0,
            last_error: None,
        }
    }
}

/// Full persisted record of one upload session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadState {
    pub format_version: u32,
    pub session: SessionHeader,
    pub chunks: BTreeMap<u32, ChunkInfo>,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub completed: bool,
    pub uploaded_bytes: u64,
}

impl UploadState {
    /// Fresh state for a newly planned session
    pub fn new(session: SessionHeader, now: DateTime<Utc>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            session,
            chunks: BTreeMap::new(),
            start_time: now,
            last_update: now,
            completed: false,
            uploaded_bytes: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    /// True when the stored integrity anchor still describes the file
    pub fn matches_file(&self, file_size: u64, file_hash: &str) -> bool {
        self.session.file_size == file_size && self.session.file_hash == file_hash
    }

    pub fn is_chunk_uploaded(&self, index: u32) -> bool {
        self.chunks.get(&index).is_some_and(|c| c.uploaded)
    }

    /// Chunk indices in `[0, total_chunks)` that still need sending, ascending
    pub fn pending_chunks(&self) -> Vec<u32> {
        (0..self.session.total_chunks)
            .filter(|index| !self.is_chunk_uploaded(*index))
            .collect()
    }

    pub fn uploaded_chunk_count(&self) -> u32 {
        self.chunks.values().filter(|c| c.uploaded).count() as u32
    }

    /// Record the start of an attempt on `index`
    pub fn mark_attempt(&mut self, index: u32, size: u64, now: DateTime<Utc>) {
        let chunk = self
            .chunks
            .entry(index)
            .or_insert_with(|| ChunkInfo::new(index, size, now));
        chunk.last_attempt = now;
    }

    /// Mark a chunk delivered
    ///
    /// `failed_attempts` is added to the lifetime retry count. Byte accounting
    /// only changes the first time a chunk flips to uploaded.
    pub fn record_success(
        &mut self,
        index: u32,
        size: u64,
        hash: Option<String>,
        failed_attempts: u32,
        now: DateTime<Utc>,
    ) {
        let chunk = self
            .chunks
            .entry(index)
            .or_insert_with(|| ChunkInfo::new(index, size, now));

        let newly_uploaded = !chunk.uploaded;
        chunk.uploaded = true;
        chunk.size = size;
        if hash.is_some() {
            chunk.hash = hash;
        }
        chunk.retries = chunk.retries.saturating_add(failed_attempts);
        chunk.last_error = None;
        chunk.last_attempt = now;

        if newly_uploaded {
            self.uploaded_bytes += size;
        }
        self.last_update = now;
    }

    /// Record a chunk that failed after its retries; it stays pending
    pub fn record_failure(
        &mut self,
        index: u32,
        size: u64,
        failed_attempts: u32,
        error: String,
        now: DateTime<Utc>,
    ) {
        let chunk = self
            .chunks
            .entry(index)
            .or_insert_with(|| ChunkInfo::new(index, size, now));
        chunk.retries = chunk.retries.saturating_add(failed_attempts);
        chunk.last_error = Some(error);
        chunk.last_attempt = now;
        self.last_update = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.completed = true;
        self.last_update = now;
    }

    /// Consistency check over the recorded chunks
    ///
    /// Fails when the session is not marked completed, when any index in range
    /// is absent or not uploaded, or when uploaded sizes do not add up to the
    /// file size. Never contacts the destination.
    pub fn verify(&self) -> Result<()> {
        if !self.completed {
            return Err(CovtrailError::Integrity(format!(
                "session {} is not marked completed",
                self.session_id()
            )));
        }

        let missing: Vec<u32> = self.pending_chunks();
        if !missing.is_empty() {
            return Err(CovtrailError::Integrity(format!(
                "session {} is missing {} chunk(s): {:?}",
                self.session_id(),
                missing.len(),
                missing
            )));
        }

        let total: u64 = self
            .chunks
            .values()
            .filter(|c| c.uploaded && c.index < self.session.total_chunks)
            .map(|c| c.size)
            .sum();
        if total != self.session.file_size {
            return Err(CovtrailError::Integrity(format!(
                "session {} uploaded {} bytes, file has {}",
                self.session_id(),
                total,
                self.session.file_size
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn header(file_size: u64, chunk_size: u64) -> SessionHeader {
        SessionHeader {
            session_id: "report-abc-1".to_string(),
            file_name: "report.json".to_string(),
            file_size,
            file_hash: "ab".repeat(32),
            chunk_size,
            total_chunks: plan_chunk_count(file_size, chunk_size).unwrap(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_chunk_ranges_partition_file() {
        for (file_size, chunk_size) in [(0, 4), (1, 4), (4, 4), (5, 4), (10_000, 1024), (1024, 1)] {
            let h = header(file_size, chunk_size);
            assert_eq!(u64::from(h.total_chunks), file_size.div_ceil(chunk_size));

            let mut next = 0;
            for index in 0..h.total_chunks {
                let (offset, len) = h.chunk_range(index).unwrap();
                assert_eq!(offset, next, "gap or overlap at chunk {index}");
                assert!(len > 0 && len <= chunk_size);
                next = offset + len;
            }
            assert_eq!(next, file_size);
            assert!(h.chunk_range(h.total_chunks).is_none());
        }
    }

    #[test]
    fn test_ten_megabytes_plans_ten_chunks() {
        let mib = 1024 * 1024;
        assert_eq!(plan_chunk_count(10 * mib, mib).unwrap(), 10);
        assert!(plan_chunk_count(10, 0).is_err());
    }

    #[test]
    fn test_clamp_chunk_size() {
        assert_eq!(clamp_chunk_size(10, 64, 1024), 64);
        assert_eq!(clamp_chunk_size(4096, 64, 1024), 1024);
        assert_eq!(clamp_chunk_size(512, 64, 1024), 512);
    }

    #[test]
    fn test_session_id_format() {
        let id = session_id_for("cov report (v2).json", &"0123456789abcdef".repeat(4), now());
        assert_eq!(
            id,
            format!("cov_report__v2_-0123456789ab-{}", now().timestamp_millis())
        );
        assert!(session_id_for("", "ff", now()).starts_with("upload-ff-"));
    }

    #[test]
    fn test_record_success_counts_bytes_once() {
        let mut state = UploadState::new(header(10, 4), now());
        state.record_success(0, 4, None, 0, now());
        state.record_success(0, 4, None, 0, now());
        assert_eq!(state.uploaded_bytes, 4);
        assert_eq!(state.pending_chunks(), vec![1, 2]);
    }

    #[test]
    fn test_failure_then_success_accumulates_retries() {
        let mut state = UploadState::new(header(10, 4), now());
        state.mark_attempt(1, 4, now());
        state.record_failure(1, 4, 3, "HTTP 503".to_string(), now());
        assert_eq!(state.chunks[&1].last_error.as_deref(), Some("HTTP 503"));
        assert!(!state.chunks[&1].uploaded);

        state.record_success(1, 4, Some("cafe".to_string()), 1, now());
        let chunk = &state.chunks[&1];
        assert_eq!(chunk.retries, 4);
        assert!(chunk.uploaded);
        assert!(chunk.last_error.is_none());
        assert_eq!(chunk.hash.as_deref(), Some("cafe"));
    }

    #[test]
    fn test_verify_requires_completed_flag() {
        let state = UploadState::new(header(4, 4), now());
        assert!(matches!(state.verify(), Err(CovtrailError::Integrity(_))));
    }

    #[test]
    fn test_verify_detects_missing_chunk() {
        let mut state = UploadState::new(header(10, 4), now());
        state.record_success(0, 4, None, 0, now());
        state.record_success(2, 2, None, 0, now());
        state.mark_completed(now());
        let err = state.verify().unwrap_err();
        assert!(err.to_string().contains("missing 1 chunk"));
    }

    #[test]
    fn test_verify_detects_size_mismatch() {
        let mut state = UploadState::new(header(10, 4), now());
        state.record_success(0, 4, None, 0, now());
        state.record_success(1, 4, None, 0, now());
        state.record_success(2, 1, None, 0, now());
        state.mark_completed(now());
        let err = state.verify().unwrap_err();
        assert!(err.to_string().contains("uploaded 9 bytes"));
    }

    #[test]
    fn test_verify_passes_for_complete_state() {
        let mut state = UploadState::new(header(10, 4), now());
        for (index, size) in [(0, 4), (1, 4), (2, 2)] {
            state.record_success(index, size, None, 0, now());
        }
        state.mark_completed(now());
        state.verify().unwrap();
    }

    #[test]
    fn test_empty_file_verifies_once_completed() {
        let mut state = UploadState::new(header(0, 4), now());
        assert!(state.pending_chunks().is_empty());
        state.mark_completed(now());
        state.verify().unwrap();
    }

    #[test]
    fn test_json_roundtrip_keeps_chunk_map() {
        let mut state = UploadState::new(header(10, 4), now());
        state.record_success(2, 2, Some("beef".to_string()), 2, now());

        let json = serde_json::to_string_pretty(&state).unwrap();
        let back: UploadState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
