use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;

use super::{ArtifactStore, PublishError, StorageKey};

/// Stores artifacts as `<root>/<project>/<filename>` on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn object_path(&self, key: &StorageKey) -> PathBuf {
        self.root.join(key.project()).join(key.filename())
    }
}

#[async_trait]
impl ArtifactStore for LocalDirStore {
    fn describe(&self) -> String {
        format!("dir://{}", self.root.display())
    }

    async fn upload(&self, key: &StorageKey, path: &Path) -> Result<(), PublishError> {
        let source = path.to_path_buf();
        let dest = self.object_path(key);
        tokio::task::spawn_blocking(move || copy_atomically(&source, &dest))
            .await
            .map_err(|err| PublishError::Upload {
                target: self.describe(),
                key: key.to_string(),
                message: err.to_string(),
            })?
    }
}

/// Copies into a sibling temp file, then renames over `dest` so readers never
/// observe a half-written object.
fn copy_atomically(artifact: &Path, dest: &Path) -> Result<(), PublishError> {
    let write_error = |source| PublishError::Write {
        path: dest.to_path_buf(),
        source,
    };
    let parent = dest
        .parent()
        .ok_or_else(|| write_error(io::Error::other("object path has no parent")))?;
    fs::create_dir_all(parent).map_err(write_error)?;

    let mut reader = fs::File::open(artifact).map_err(|source| PublishError::ReadArtifact {
        path: artifact.to_path_buf(),
        source,
    })?;
    let mut staged = NamedTempFile::new_in(parent).map_err(write_error)?;
    io::copy(&mut reader, &mut staged).map_err(write_error)?;
    staged.persist(dest).map_err(|err| write_error(err.error))?;
    Ok(())
}
