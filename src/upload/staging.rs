/*!
 * Local staging sink and final artifact reassembly
 *
 * Chunks land as individual part files under `<root>/<session_id>/`. Once a
 * session verifies, `assemble` stitches the parts back together in index order
 * and checks the result against the session's content hash before the artifact
 * is handed to the external upload command.
 */

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::checksum::{hash_bytes, StreamingHasher};
use super::sink::{ChunkSink, SinkError};
use super::state::{SessionHeader, UploadState};
use crate::error::{CovtrailError, Result};

/// Sink that writes each chunk to its own part file
#[derive(Debug, Clone)]
pub struct StagingSink {
    root: PathBuf,
}

impl StagingSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the parts of one session
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    pub fn part_path(&self, session_id: &str, index: u32) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("chunk-{:06}.part", index))
    }

    /// Reassemble a verified session into `output`
    ///
    /// Each part must have the length its chunk range says and, when a chunk
    /// hash was recorded, the same content. The assembled file is written to a
    /// `.tmp` sibling and only renamed into place once its SHA-256 matches the
    /// session's file hash. Returns the number of bytes written.
    pub async fn assemble(&self, state: &UploadState, output: &Path) -> Result<u64> {
        state.verify()?;

        let session = &state.session;
        let temp_output = {
            let mut name = output.as_os_str().to_os_string();
            name.push(".tmp");
            PathBuf::from(name)
        };
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let written = match self.write_parts(state, &temp_output).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_output).await;
                return Err(e);
            }
        };

        tokio::fs::rename(&temp_output, output).await?;
        info!(
            session_id = %session.session_id,
            bytes = written,
            output = %output.display(),
            "assembled artifact"
        );
        Ok(written)
    }

    async fn write_parts(&self, state: &UploadState, target: &Path) -> Result<u64> {
        let session = &state.session;
        let mut file = tokio::fs::File::create(target).await?;
        let mut hasher = StreamingHasher::new();
        let mut written = 0u64;

        for index in 0..session.total_chunks {
            let part = self.part_path(&session.session_id, index);
            let data = tokio::fs::read(&part).await.map_err(|e| {
                CovtrailError::Integrity(format!(
                    "staged chunk {} unreadable at {}: {}",
                    index,
                    part.display(),
                    e
                ))
            })?;

            let expected_len = session.chunk_range(index).map(|(_, len)| len).unwrap_or(0);
            if data.len() as u64 != expected_len {
                return Err(CovtrailError::Integrity(format!(
                    "staged chunk {} has {} bytes, expected {}",
                    index,
                    data.len(),
                    expected_len
                )));
            }

            if let Some(expected) = state.chunks.get(&index).and_then(|c| c.hash.as_deref()) {
                let actual = hash_bytes(&data);
                if actual != expected {
                    return Err(CovtrailError::ChecksumMismatch {
                        expected: expected.to_string(),
                        actual,
                    });
                }
            }

            hasher.update(&data);
            file.write_all(&data).await?;
            written += data.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;

        let actual = hasher.finalize_hex();
        if actual != session.file_hash {
            return Err(CovtrailError::ChecksumMismatch {
                expected: session.file_hash.clone(),
                actual,
            });
        }

        Ok(written)
    }

    /// Remove every staged part of a session
    pub async fn discard(&self, session_id: &str) -> Result<()> {
        match tokio::fs::remove_dir_all(self.session_dir(session_id)).await {
            Ok(()) => {
                debug!(session_id, "discarded staged chunks");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ChunkSink for StagingSink {
    async fn send_chunk(
        &self,
        data: Bytes,
        index: u32,
        session: &SessionHeader,
    ) -> std::result::Result<(), SinkError> {
        let dir = self.session_dir(&session.session_id);
        tokio::fs::create_dir_all(&dir).await?;

        let part = self.part_path(&session.session_id, index);
        let temp = part.with_extension("part.tmp");
        tokio::fs::write(&temp, &data).await?;
        tokio::fs::rename(&temp, &part).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::state::plan_chunk_count;
    use chrono::Utc;
    use tempfile::TempDir;

    const CONTENT: &[u8] = b"the quick brown fox jumps over the lazy dog";

    fn header(chunk_size: u64) -> SessionHeader {
        SessionHeader {
            session_id: "fox-1".to_string(),
            file_name: "fox.txt".to_string(),
            file_size: CONTENT.len() as u64,
            file_hash: hash_bytes(CONTENT),
            chunk_size,
            total_chunks: plan_chunk_count(CONTENT.len() as u64, chunk_size).unwrap(),
        }
    }

    async fn stage_all(sink: &StagingSink, header: &SessionHeader) -> UploadState {
        let mut state = UploadState::new(header.clone(), Utc::now());
        for index in 0..header.total_chunks {
            let (offset, len) = header.chunk_range(index).unwrap();
            let data = &CONTENT[offset as usize..(offset + len) as usize];
            sink.send_chunk(Bytes::copy_from_slice(data), index, header)
                .await
                .unwrap();
            state.record_success(index, len, Some(hash_bytes(data)), 0, Utc::now());
        }
        state.mark_completed(Utc::now());
        state
    }

    #[tokio::test]
    async fn test_stage_and_assemble() {
        let dir = TempDir::new().unwrap();
        let sink = StagingSink::new(dir.path().join("staging"));
        let state = stage_all(&sink, &header(10)).await;

        assert!(sink.part_path("fox-1", 0).ends_with("chunk-000000.part"));

        let output = dir.path().join("out").join("fox.txt");
        let written = sink.assemble(&state, &output).await.unwrap();

        assert_eq!(written, CONTENT.len() as u64);
        assert_eq!(std::fs::read(&output).unwrap(), CONTENT);
    }

    #[tokio::test]
    async fn test_resend_overwrites_part() {
        let dir = TempDir::new().unwrap();
        let sink = StagingSink::new(dir.path());
        let h = header(10);

        sink.send_chunk(Bytes::from_static(b"garbage!!!"), 0, &h)
            .await
            .unwrap();
        let state = stage_all(&sink, &h).await;

        let output = dir.path().join("fox.txt");
        sink.assemble(&state, &output).await.unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), CONTENT);
    }

    #[tokio::test]
    async fn test_assemble_detects_tampered_part() {
        let dir = TempDir::new().unwrap();
        let sink = StagingSink::new(dir.path());
        let state = stage_all(&sink, &header(10)).await;

        std::fs::write(sink.part_path("fox-1", 1), b"XXXXXXXXXX").unwrap();

        let output = dir.path().join("fox.txt");
        let err = sink.assemble(&state, &output).await.unwrap_err();
        assert!(matches!(err, CovtrailError::ChecksumMismatch { .. }));
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_assemble_detects_wrong_file_hash() {
        let dir = TempDir::new().unwrap();
        let sink = StagingSink::new(dir.path());
        let mut state = stage_all(&sink, &header(10)).await;
        state.session.file_hash = "00".repeat(32);

        let output = dir.path().join("fox.txt");
        let err = sink.assemble(&state, &output).await.unwrap_err();
        assert!(matches!(err, CovtrailError::ChecksumMismatch { .. }));
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_assemble_requires_verified_state() {
        let dir = TempDir::new().unwrap();
        let sink = StagingSink::new(dir.path());
        let state = UploadState::new(header(10), Utc::now());

        let err = sink
            .assemble(&state, &dir.path().join("fox.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, CovtrailError::Integrity(_)));
    }

    #[tokio::test]
    async fn test_discard_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let sink = StagingSink::new(dir.path());
        stage_all(&sink, &header(10)).await;

        sink.discard("fox-1").await.unwrap();
        assert!(!sink.session_dir("fox-1").exists());
        sink.discard("fox-1").await.unwrap();
    }
}
