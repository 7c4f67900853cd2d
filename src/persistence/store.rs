//! Durable storage for [`PersistedSnapshot`]s.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tracing::debug;

use super::snapshot::PersistedSnapshot;
use crate::{AppError, Result};

/// Where snapshots are read from at startup and written to afterwards.
pub trait SnapshotStore: Send + Sync {
    /// Read the stored snapshot; `Ok(None)` when nothing was saved yet.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Persistence`] if the stored data cannot be read
    /// or is not a snapshot document.
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<PersistedSnapshot>>> + Send + '_>>;

    /// Replace the stored snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Persistence`] if the write fails.
    fn save<'a>(
        &'a self,
        snapshot: &'a PersistedSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// JSON file store. Writes go to a sibling temp file that is then renamed
/// over the target, so readers never observe a half-written snapshot.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    /// Store backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<PersistedSnapshot>>> + Send + '_>> {
        Box::pin(async move {
            let raw = match tokio::fs::read_to_string(&self.path).await {
                Ok(raw) => raw,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(err) => {
                    return Err(AppError::Persistence(format!(
                        "failed to read {}: {err}",
                        self.path.display()
                    )))
                }
            };
            if raw.trim().is_empty() {
                return Ok(None);
            }
            let snapshot = serde_json::from_str(&raw)?;
            Ok(Some(snapshot))
        })
    }

    fn save<'a>(
        &'a self,
        snapshot: &'a PersistedSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let body = serde_json::to_vec_pretty(snapshot)?;
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await.map_err(|err| {
                    AppError::Persistence(format!("failed to create {}: {err}", parent.display()))
                })?;
            }

            let temp = self.temp_path();
            tokio::fs::write(&temp, &body).await.map_err(|err| {
                AppError::Persistence(format!("failed to write {}: {err}", temp.display()))
            })?;
            tokio::fs::rename(&temp, &self.path).await.map_err(|err| {
                AppError::Persistence(format!("failed to replace {}: {err}", self.path.display()))
            })?;

            debug!(path = %self.path.display(), tasks = snapshot.tasks.len(), "snapshot written");
            Ok(())
        })
    }
}
