//! Uploads built wheels to object storage under `project/filename`.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::request::{validate_filename, validate_project, RequestError};

mod local;
mod s3;

pub use local::LocalDirStore;
pub use s3::S3Store;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("invalid storage key: {0}")]
    InvalidKey(#[from] RequestError),
    #[error("failed to read artifact {}: {source}", .path.display())]
    ReadArtifact {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("storage {target} rejected the provided credentials ({code})")]
    Unauthorized { target: String, code: String },
    #[error("upload of {key} to {target} failed: {message}")]
    Upload {
        target: String,
        key: String,
        message: String,
    },
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PublishError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidKey(_) => "invalid_key",
            Self::ReadArtifact { .. } => "artifact_unreadable",
            Self::Unauthorized { .. } => "auth_forbidden",
            Self::Upload { .. } | Self::Write { .. } => "upload_failed",
        }
    }
}

/// Location of an artifact in the bucket: `project/filename`.
///
/// The same pair always yields the same key, so a republish overwrites.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct StorageKey(String);

impl StorageKey {
    /// # Errors
    /// Returns a [`RequestError`] when either component could escape its prefix.
    pub fn new(project: &str, filename: &str) -> Result<Self, RequestError> {
        validate_project(project)?;
        validate_filename(filename)?;
        Ok(Self(format!("{project}/{filename}")))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn project(&self) -> &str {
        self.split().0
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        self.split().1
    }

    fn split(&self) -> (&str, &str) {
        // Projects never contain '/', so the first separator is the boundary.
        self.0.split_once('/').unwrap_or((self.0.as_str(), ""))
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Destination for built wheels.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Human-readable target, e.g. `s3://bucket`.
    fn describe(&self) -> String;

    /// Uploads `path` under `key`, replacing any existing object.
    async fn upload(&self, key: &StorageKey, path: &Path) -> Result<(), PublishError>;
}

/// Uploads `local_path` under the key derived from `project` and `filename`.
///
/// # Errors
/// Returns a [`PublishError`] when the key is unsafe or the upload fails.
pub async fn publish(
    store: &dyn ArtifactStore,
    local_path: &Path,
    project: &str,
    filename: &str,
) -> Result<StorageKey, PublishError> {
    let key = StorageKey::new(project, filename)?;
    let wheel = local_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    info!(
        "Uploading wheel {} to {} with key {}",
        wheel,
        store.describe(),
        key
    );
    store.upload(&key, local_path).await?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        uploads: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl ArtifactStore for RecordingStore {
        fn describe(&self) -> String {
            "memory".to_string()
        }

        async fn upload(&self, key: &StorageKey, path: &Path) -> Result<(), PublishError> {
            let bytes = fs::read(path).map_err(|source| PublishError::ReadArtifact {
                path: path.to_path_buf(),
                source,
            })?;
            self.uploads
                .lock()
                .unwrap()
                .push((key.to_string(), bytes));
            Ok(())
        }
    }

    #[test]
    fn key_is_project_slash_filename() {
        let key = StorageKey::new("dagon", "dagon-0.9.9-py3-none-any.whl").unwrap();
        assert_eq!(key.as_str(), "dagon/dagon-0.9.9-py3-none-any.whl");
        assert_eq!(key.project(), "dagon");
        assert_eq!(key.filename(), "dagon-0.9.9-py3-none-any.whl");
        assert_eq!(
            key,
            StorageKey::new("dagon", "dagon-0.9.9-py3-none-any.whl").unwrap()
        );
    }

    #[test]
    fn key_rejects_traversal() {
        assert!(StorageKey::new("..", "x.whl").is_err());
        assert!(StorageKey::new("dagon", "../x.whl").is_err());
        assert!(StorageKey::new("dagon", "").is_err());
    }

    #[tokio::test]
    async fn publish_uploads_under_derived_key() {
        let dir = tempfile::tempdir().unwrap();
        let wheel = dir.path().join("dagon-0.9.9-py3-none-any.whl");
        fs::write(&wheel, b"wheel-bytes").unwrap();
        let store = RecordingStore::default();

        let key = publish(&store, &wheel, "dagon", "dagon-0.9.9-py3-none-any.whl")
            .await
            .unwrap();

        assert_eq!(key.as_str(), "dagon/dagon-0.9.9-py3-none-any.whl");
        let uploads = store.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, key.as_str());
        assert_eq!(uploads[0].1, b"wheel-bytes");
    }

    #[tokio::test]
    async fn invalid_key_never_reaches_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let wheel = dir.path().join("x.whl");
        fs::write(&wheel, b"").unwrap();
        let store = RecordingStore::default();

        let err = publish(&store, &wheel, "../escape", "x.whl")
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::InvalidKey(_)));
        assert!(store.uploads.lock().unwrap().is_empty());
    }
}
