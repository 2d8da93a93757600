//! Progress reporting for upload sessions
//!
//! Two views exist:
//! - [`ProgressUpdate`]: pushed to the caller's callback after every chunk
//!   completion while `upload_chunks` runs
//! - [`UploadProgress`]: derived on demand from a persisted `UploadState`
//!   (percent, elapsed, throughput, ETA)
//!
//! Both are plain data. Deriving them has no side effects, and missing inputs
//! (zero elapsed time, zero throughput) yield zero or `None` rather than errors.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::state::UploadState;

/// Cumulative counters sent after each chunk completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    /// Chunk that just completed
    pub chunk_index: u32,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub completed_chunks: u32,
    pub total_chunks: u32,
}

/// Caller-supplied progress sink
pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Snapshot of a session's progress
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadProgress {
    pub session_id: String,
    pub file_name: String,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub completed_chunks: u32,
    pub total_chunks: u32,
    /// 0.0 to 100.0
    pub percent: f64,
    pub elapsed: Duration,
    /// Average bytes per second since the session started
    pub throughput_bps: Option<f64>,
    /// Only present while incomplete with a non-zero throughput
    pub eta: Option<Duration>,
    pub completed: bool,
}

impl UploadProgress {
    pub fn from_state(state: &UploadState, now: DateTime<Utc>) -> Self {
        let total = state.session.file_size;
        let uploaded = state.uploaded_bytes;

        let percent = if total == 0 {
            if state.completed {
                100.0
            } else {
                0.0
            }
        } else {
            (uploaded as f64 * 100.0 / total as f64).min(100.0)
        };

        // Clock skew can put start_time in the future; treat that as no data.
        let elapsed = (now - state.start_time).to_std().unwrap_or(Duration::ZERO);

        let throughput_bps = if elapsed > Duration::ZERO {
            Some(uploaded as f64 / elapsed.as_secs_f64())
        } else {
            None
        };

        let eta = match throughput_bps {
            Some(rate) if !state.completed && rate > 0.0 => {
                let remaining = total.saturating_sub(uploaded) as f64;
                Duration::try_from_secs_f64(remaining / rate).ok()
            }
            _ => None,
        };

        Self {
            session_id: state.session.session_id.clone(),
            file_name: state.session.file_name.clone(),
            uploaded_bytes: uploaded,
            total_bytes: total,
            completed_chunks: state.uploaded_chunk_count(),
            total_chunks: state.session.total_chunks,
            percent,
            elapsed,
            throughput_bps,
            eta,
            completed: state.completed,
        }
    }
}

impl fmt::Display for UploadProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.1}% ({} / {}), {}/{} chunks, elapsed {}",
            self.percent,
            format_bytes(self.uploaded_bytes),
            format_bytes(self.total_bytes),
            self.completed_chunks,
            self.total_chunks,
            format_duration(self.elapsed),
        )?;
        if let Some(rate) = self.throughput_bps {
            write!(f, ", {}/s", format_bytes(rate as u64))?;
        }
        if let Some(eta) = self.eta {
            write!(f, ", ETA {}", format_duration(eta))?;
        }
        Ok(())
    }
}

/// Format a byte count with binary units
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Format a duration as `850ms`, `12.5s`, `4m 10s` or `2h 5m`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 1.0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60.0 {
        format!("{:.1}s", secs)
    } else if secs < 3600.0 {
        let whole = duration.as_secs();
        format!("{}m {}s", whole / 60, whole % 60)
    } else {
        let whole = duration.as_secs();
        format!("{}h {}m", whole / 3600, (whole % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::state::SessionHeader;
    use chrono::TimeZone;

    fn state(file_size: u64, uploaded: &[(u32, u64)]) -> UploadState {
        let start = Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap();
        let mut state = UploadState::new(
            SessionHeader {
                session_id: "cov-1".to_string(),
                file_name: "cov.json".to_string(),
                file_size,
                file_hash: "aa".to_string(),
                chunk_size: 100,
                total_chunks: file_size.div_ceil(100) as u32,
            },
            start,
        );
        for (index, size) in uploaded {
            state.record_success(*index, *size, None, 0, start);
        }
        state
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    #[test]
    fn test_progress_math() {
        let state = state(1000, &[(0, 100), (1, 100), (2, 100), (3, 100)]);
        let progress = UploadProgress::from_state(&state, at(8));

        assert_eq!(progress.percent, 40.0);
        assert_eq!(progress.elapsed, Duration::from_secs(8));
        assert_eq!(progress.throughput_bps, Some(50.0));
        assert_eq!(progress.eta, Some(Duration::from_secs(12)));
        assert_eq!(progress.completed_chunks, 4);
        assert_eq!(progress.total_chunks, 10);
    }

    #[test]
    fn test_zero_elapsed_omits_rates() {
        let state = state(1000, &[(0, 100)]);
        let progress = UploadProgress::from_state(&state, at(0));

        assert_eq!(progress.percent, 10.0);
        assert!(progress.throughput_bps.is_none());
        assert!(progress.eta.is_none());
    }

    #[test]
    fn test_zero_throughput_omits_eta() {
        let state = state(1000, &[]);
        let progress = UploadProgress::from_state(&state, at(30));

        assert_eq!(progress.throughput_bps, Some(0.0));
        assert!(progress.eta.is_none());
    }

    #[test]
    fn test_completed_has_no_eta() {
        let mut state = state(200, &[(0, 100), (1, 100)]);
        state.mark_completed(at(4));
        let progress = UploadProgress::from_state(&state, at(4));

        assert_eq!(progress.percent, 100.0);
        assert!(progress.eta.is_none());
    }

    #[test]
    fn test_empty_file_percent() {
        let mut state = state(0, &[]);
        assert_eq!(UploadProgress::from_state(&state, at(1)).percent, 0.0);
        state.mark_completed(at(1));
        assert_eq!(UploadProgress::from_state(&state, at(1)).percent, 100.0);
    }

    #[test]
    fn test_clock_skew_is_zero_elapsed() {
        let state = state(1000, &[(0, 100)]);
        let progress = UploadProgress::from_state(&state, at(-5));
        assert_eq!(progress.elapsed, Duration::ZERO);
        assert!(progress.throughput_bps.is_none());
    }

    #[test]
    fn test_unrepresentable_eta_is_omitted() {
        let mut state = state(u64::MAX, &[]);
        state.record_success(0, 1, None, 0, state.start_time);
        let progress = UploadProgress::from_state(&state, at(1_000_000_000));

        assert!(progress.throughput_bps.is_some());
        assert!(progress.eta.is_none());
    }

    #[test]
    fn test_display() {
        let state = state(1000, &[(0, 100), (1, 100), (2, 100), (3, 100)]);
        let rendered = UploadProgress::from_state(&state, at(8)).to_string();
        assert_eq!(
            rendered,
            "40.0% (400 B / 1000 B), 4/10 chunks, elapsed 8.0s, 50 B/s, ETA 12.0s"
        );
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1536), "1.50 KiB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.00 MiB");
        assert_eq!(format_duration(Duration::from_millis(850)), "850ms");
        assert_eq!(format_duration(Duration::from_secs(250)), "4m 10s");
        assert_eq!(format_duration(Duration::from_secs(7500)), "2h 5m");
    }
}
