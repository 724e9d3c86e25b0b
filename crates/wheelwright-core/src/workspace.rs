use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

const WORKSPACE_PREFIX: &str = "wheelwright-build-";

/// Scratch directory owned by exactly one pipeline run.
///
/// The directory is removed by [`BuildWorkspace::release`] on the normal exit
/// paths and by `Drop` when the owning future is cancelled or panics.
#[derive(Debug)]
pub struct BuildWorkspace {
    dir: TempDir,
}

impl BuildWorkspace {
    /// Creates a fresh, uniquely named directory under `root` (or the system
    /// temp dir).
    ///
    /// # Errors
    /// Returns an error when the directory cannot be created.
    pub fn acquire(root: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(WORKSPACE_PREFIX);
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        debug!(path = %dir.path().display(), "acquired build workspace");
        Ok(Self { dir })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Recursively deletes the workspace. Failures are logged, not returned:
    /// the pipeline outcome is already decided by the time this runs.
    pub fn release(self) -> PathBuf {
        let path = self.dir.path().to_path_buf();
        if let Err(err) = self.dir.close() {
            warn!(path = %path.display(), %err, "failed to remove build workspace");
        } else {
            debug!(path = %path.display(), "released build workspace");
        }
        path
    }
}
