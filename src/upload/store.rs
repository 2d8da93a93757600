/*!
 * On-disk persistence for upload sessions
 *
 * One JSON document per session, `<state_dir>/<session_id>.upload.json`, always
 * replaced through a sibling `.tmp` file and a rename so a crash mid-write never
 * leaves a truncated record behind.
 */

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::state::{UploadState, FORMAT_VERSION};
use crate::error::{CovtrailError, Result};

const STATE_SUFFIX: &str = ".upload.json";

/// Directory-backed store of `UploadState` records
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the state document for `session_id`
    pub fn path_for(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.dir.join(format!("{}{}", session_id, STATE_SUFFIX)))
    }

    /// Atomically write `state`, replacing any previous record
    pub async fn save(&self, state: &UploadState) -> Result<()> {
        let path = self.path_for(state.session_id())?;
        let contents = serde_json::to_vec_pretty(state)?;

        tokio::fs::create_dir_all(&self.dir).await?;

        let temp_path = temp_path_for(&path);
        tokio::fs::write(&temp_path, &contents).await?;
        tokio::fs::rename(&temp_path, &path).await?;

        debug!(
            session_id = state.session_id(),
            uploaded_bytes = state.uploaded_bytes,
            "persisted upload state"
        );
        Ok(())
    }

    /// Load a session, failing with `SessionNotFound` when absent
    pub async fn load(&self, session_id: &str) -> Result<UploadState> {
        self.try_load(session_id)
            .await?
            .ok_or_else(|| CovtrailError::SessionNotFound(session_id.to_string()))
    }

    /// Load a session if a record exists
    pub async fn try_load(&self, session_id: &str) -> Result<Option<UploadState>> {
        let path = self.path_for(session_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => parse_state(&bytes).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a session record; an absent record is not an error
    pub async fn remove(&self, session_id: &str) -> Result<()> {
        let path = self.path_for(session_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(session_id, "removed upload state");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable session record in the store, in directory order
    ///
    /// Unreadable, corrupt or foreign-version documents are skipped.
    pub async fn list(&self) -> Result<Vec<UploadState>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut states = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_state = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(STATE_SUFFIX));
            if !is_state {
                continue;
            }

            let parsed = match tokio::fs::read(&path).await {
                Ok(bytes) => parse_state(&bytes),
                Err(e) => Err(e.into()),
            };
            match parsed {
                Ok(state) => states.push(state),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "skipping unreadable upload state"
                ),
            }
        }

        Ok(states)
    }
}

fn parse_state(bytes: &[u8]) -> Result<UploadState> {
    let state: UploadState = serde_json::from_slice(bytes)?;
    if state.format_version != FORMAT_VERSION {
        return Err(CovtrailError::Serialization(format!(
            "unsupported state format version {} (expected {})",
            state.format_version, FORMAT_VERSION
        )));
    }
    Ok(state)
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn validate_session_id(session_id: &str) -> Result<()> {
    let bad = session_id.is_empty()
        || session_id.contains(['/', '\\'])
        || session_id.starts_with('.')
        || session_id.contains("..");
    if bad {
        return Err(CovtrailError::InvalidOptions(format!(
            "invalid session id: {:?}",
            session_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::state::SessionHeader;
    use chrono::Utc;
    use tempfile::TempDir;

    fn state(session_id: &str) -> UploadState {
        UploadState::new(
            SessionHeader {
                session_id: session_id.to_string(),
                file_name: "lcov.info".to_string(),
                file_size: 8,
                file_hash: "00".repeat(32),
                chunk_size: 4,
                total_chunks: 2,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_save_is_atomic_and_loadable() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state"));
        let mut original = state("lcov-000000000000-1");
        original.record_success(0, 4, Some("deadbeef".to_string()), 0, Utc::now());

        store.save(&original).await.unwrap();

        let path = store.path_for("lcov-000000000000-1").unwrap();
        assert!(path.exists());
        assert!(!temp_path_for(&path).exists());

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"uploaded_bytes\": 4"));
        assert!(content.contains("deadbeef"));

        assert_eq!(store.load("lcov-000000000000-1").await.unwrap(), original);
    }

    #[tokio::test]
    async fn test_load_missing_session() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());

        assert!(store.try_load("nope").await.unwrap().is_none());
        assert!(matches!(
            store.load("nope").await,
            Err(CovtrailError::SessionNotFound(id)) if id == "nope"
        ));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        store.save(&state("a-1")).await.unwrap();

        store.remove("a-1").await.unwrap();
        store.remove("a-1").await.unwrap();
        assert!(store.try_load("a-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_skips_corrupt_and_foreign_files() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        store.save(&state("good-1")).await.unwrap();

        std::fs::write(dir.path().join("broken.upload.json"), b"{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignore me").unwrap();

        let mut future = state("future-1");
        future.format_version = FORMAT_VERSION + 1;
        std::fs::write(
            dir.path().join("future-1.upload.json"),
            serde_json::to_vec(&future).unwrap(),
        )
        .unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id(), "good-1");
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("never-created"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[test]
    fn test_rejects_path_like_session_ids() {
        let store = StateStore::new("/tmp/covtrail");
        for bad in ["", "../etc/passwd", "a/b", "a\\b", ".hidden"] {
            assert!(store.path_for(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(store.path_for("report-abc-1").is_ok());
    }
}
