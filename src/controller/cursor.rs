//! Sync cursor persistence.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::db::Repository;
use crate::error::{EtlError, EtlResult};

/// Where the last exported block is recorded between runs.
#[async_trait]
pub trait SyncRecorder: Send + Sync {
    /// Last exported block, or `None` if nothing was recorded yet.
    async fn get_last_synced_block(&self) -> EtlResult<Option<u64>>;

    /// Record `block` as the last exported block.
    async fn set_last_synced_block(&self, block: u64) -> EtlResult<()>;
}

/// Single integer in a flat file.
#[derive(Debug, Clone)]
pub struct FileSyncRecorder {
    path: PathBuf,
}

impl FileSyncRecorder {
    /// Recorder backed by `path`; the file is created on first write.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SyncRecorder for FileSyncRecorder {
    async fn get_last_synced_block(&self) -> EtlResult<Option<u64>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(EtlError::state(
                    format!("Failed to read sync file {}", self.path.display()),
                    Some(Box::new(e)),
                ))
            }
        };

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed.parse::<u64>().map(Some).map_err(|e| {
            EtlError::state(
                format!("Sync file {} holds '{trimmed}'", self.path.display()),
                Some(Box::new(e)),
            )
        })
    }

    async fn set_last_synced_block(&self, block: u64) -> EtlResult<()> {
        // Write-then-rename so a crash never leaves a truncated file.
        let tmp = self.path.with_extension("tmp");
        let write_err = |e: std::io::Error| {
            EtlError::state(
                format!("Failed to write sync file {}", self.path.display()),
                Some(Box::new(e)),
            )
        };
        tokio::fs::write(&tmp, format!("{block}\n"))
            .await
            .map_err(write_err)?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(write_err)?;
        debug!(block, path = %self.path.display(), "Sync cursor recorded");
        Ok(())
    }
}

/// `sync_records` row keyed by a mission sign.
#[derive(Debug, Clone)]
pub struct DbSyncRecorder {
    repository: Repository,
    mission_sign: String,
}

impl DbSyncRecorder {
    /// Recorder for `mission_sign` in `repository`.
    #[must_use]
    pub fn new(repository: Repository, mission_sign: impl Into<String>) -> Self {
        Self {
            repository,
            mission_sign: mission_sign.into(),
        }
    }
}

#[async_trait]
impl SyncRecorder for DbSyncRecorder {
    async fn get_last_synced_block(&self) -> EtlResult<Option<u64>> {
        self.repository.get_sync_record(&self.mission_sign).await
    }

    async fn set_last_synced_block(&self, block: u64) -> EtlResult<()> {
        self.repository
            .set_sync_record(&self.mission_sign, block)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;

    #[tokio::test]
    async fn test_file_recorder_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let recorder = FileSyncRecorder::new(dir.path().join("last_synced_block.txt"));

        assert_eq!(recorder.get_last_synced_block().await.expect("read"), None);
        recorder.set_last_synced_block(110).await.expect("write");
        recorder.set_last_synced_block(120).await.expect("write");
        assert_eq!(recorder.get_last_synced_block().await.expect("read"), Some(120));
    }

    #[tokio::test]
    async fn test_file_recorder_rejects_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cursor.txt");
        tokio::fs::write(&path, "not a block").await.expect("seed");

        let recorder = FileSyncRecorder::new(&path);
        assert!(matches!(
            recorder.get_last_synced_block().await,
            Err(EtlError::StateError { .. })
        ));
    }

    #[tokio::test]
    async fn test_db_recorder_round_trip() {
        let pool = create_pool("sqlite::memory:").await.expect("pool");
        let recorder = DbSyncRecorder::new(Repository::new(pool), "mainnet");

        assert_eq!(recorder.get_last_synced_block().await.expect("read"), None);
        recorder.set_last_synced_block(77).await.expect("write");
        assert_eq!(recorder.get_last_synced_block().await.expect("read"), Some(77));
    }
}
