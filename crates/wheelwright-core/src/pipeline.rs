//! The request-scoped build pipeline: fetch, build, publish.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::build::{self, BuildError, BuildOptions, BuildTool, BuiltArtifact};
use crate::config::Config;
use crate::fetch::{self, FetchError};
use crate::publish::{publish, ArtifactStore, PublishError, StorageKey};
use crate::request::{BuildRequest, RequestError};
use crate::toolchain::{self, ToolchainOverlay};
use crate::workspace::BuildWorkspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Fetching,
    Building,
    Publishing,
    Done,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Fetching => "fetching",
            Self::Building => "building",
            Self::Publishing => "publishing",
            Self::Done => "done",
        };
        f.write_str(label)
    }
}

/// Terminal failure of a pipeline run, tagged with the stage that produced it.
#[derive(Debug, thiserror::Error)]
pub enum BuildFailure {
    #[error("invalid build request: {0}")]
    InvalidRequest(#[from] RequestError),
    #[error("could not create build workspace: {0}")]
    WorkspaceFailed(#[source] io::Error),
    #[error("fetch failed: {0}")]
    FetchFailed(#[source] FetchError),
    #[error("build failed: {0}")]
    BuildFailed(#[source] BuildError),
    #[error("publish failed: {0}")]
    PublishFailed(#[source] PublishError),
}

impl BuildFailure {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::WorkspaceFailed(_) => "workspace_failed",
            Self::FetchFailed(_) => "fetch_failed",
            Self::BuildFailed(_) => "build_failed",
            Self::PublishFailed(_) => "publish_failed",
        }
    }

    /// Stage the failure happened in; `None` before the pipeline started.
    #[must_use]
    pub fn stage(&self) -> Option<PipelineStage> {
        match self {
            Self::InvalidRequest(_) | Self::WorkspaceFailed(_) => None,
            Self::FetchFailed(_) => Some(PipelineStage::Fetching),
            Self::BuildFailed(_) => Some(PipelineStage::Building),
            Self::PublishFailed(_) => Some(PipelineStage::Publishing),
        }
    }

    /// Bad input rather than a broken pipeline.
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        matches!(self, Self::InvalidRequest(_))
    }

    /// Structured description for the index layer.
    #[must_use]
    pub fn details(&self) -> Value {
        let mut details = json!({
            "kind": self.kind(),
            "stage": self.stage(),
            "error": self.to_string(),
        });
        let extra = match self {
            Self::InvalidRequest(_) | Self::WorkspaceFailed(_) => json!({}),
            Self::FetchFailed(err) => match err {
                FetchError::Status { url, status } => json!({ "url": url, "status": status }),
                FetchError::Timeout { url, after } => {
                    json!({ "url": url, "reason": "timeout", "timeout_secs": after.as_secs() })
                }
                _ => json!({}),
            },
            Self::BuildFailed(err) => match err {
                BuildError::Exited {
                    code,
                    stdout,
                    stderr,
                    ..
                } => json!({
                    "reason": err.kind(),
                    "exit_code": code,
                    "stdout": stdout,
                    "stderr": stderr,
                }),
                BuildError::AmbiguousArtifacts { candidates } => {
                    json!({ "reason": err.kind(), "candidates": candidates })
                }
                BuildError::TimedOut { after, .. } => {
                    json!({ "reason": err.kind(), "timeout_secs": after.as_secs() })
                }
                _ => json!({ "reason": err.kind() }),
            },
            Self::PublishFailed(err) => json!({ "reason": err.kind() }),
        };
        if let (Value::Object(map), Value::Object(extra)) = (&mut details, extra) {
            map.extend(extra);
        }
        details
    }
}

/// What a successful run hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildResult {
    pub storage_key: StorageKey,
    pub artifact_filename: String,
    pub sha256: String,
    pub size: u64,
    pub archive_sha256: String,
    pub message: String,
}

/// Runs build requests end to end. Cheap to share: concurrent `run` calls
/// each get their own workspace and touch no common mutable state.
pub struct Builder {
    build: BuildOptions,
    overlay: ToolchainOverlay,
    work_root: Option<PathBuf>,
    read_timeout: Option<Duration>,
    client: reqwest::Client,
    store: Arc<dyn ArtifactStore>,
}

impl Builder {
    /// # Errors
    /// Returns [`FetchError::Client`] when the HTTP client cannot be built.
    pub fn new(config: &Config, store: Arc<dyn ArtifactStore>) -> Result<Self, FetchError> {
        Ok(Self {
            build: BuildOptions::from_config(config.build()),
            overlay: toolchain::resolve(config.toolchain()),
            work_root: config.build().work_root.clone(),
            read_timeout: config.network().read_timeout,
            client: fetch::http_client(config.network())?,
            store,
        })
    }

    #[must_use]
    pub fn with_build_tool(mut self, tool: BuildTool) -> Self {
        self.build.tool = tool;
        self
    }

    #[must_use]
    pub fn overlay(&self) -> &ToolchainOverlay {
        &self.overlay
    }

    /// Validates raw inputs and runs the pipeline.
    ///
    /// # Errors
    /// See [`Builder::run`]; invalid inputs yield [`BuildFailure::InvalidRequest`].
    pub async fn install_package(
        &self,
        project: &str,
        filename: Option<String>,
        archive_url: &str,
    ) -> Result<BuildResult, BuildFailure> {
        let request = BuildRequest::new(project, filename, archive_url)?;
        self.run(&request).await
    }

    /// Fetches, builds, and publishes one request.
    ///
    /// The workspace is removed before this returns, whatever the outcome,
    /// and also when the future is dropped mid-flight. No stage is retried.
    ///
    /// # Errors
    /// Returns the first failing stage's error wrapped in [`BuildFailure`].
    #[instrument(skip_all, fields(project = request.project(), archive = %request.archive_url()))]
    pub async fn run(&self, request: &BuildRequest) -> Result<BuildResult, BuildFailure> {
        let workspace = BuildWorkspace::acquire(self.work_root.as_deref())
            .map_err(BuildFailure::WorkspaceFailed)?;
        let outcome = self.run_stages(request, workspace.path()).await;
        workspace.release();
        match &outcome {
            Ok(result) => info!(stage = %PipelineStage::Done, key = %result.storage_key, "{}", result.message),
            Err(failure) => warn!(kind = failure.kind(), stage = ?failure.stage(), "{failure}"),
        }
        outcome
    }

    async fn run_stages(
        &self,
        request: &BuildRequest,
        dir: &Path,
    ) -> Result<BuildResult, BuildFailure> {
        info!(stage = %PipelineStage::Fetching, "fetching source archive");
        let archive = fetch::fetch(&self.client, request.archive_url(), dir, self.read_timeout)
            .await
            .map_err(BuildFailure::FetchFailed)?;

        info!(stage = %PipelineStage::Building, archive = %archive.filename, "building wheel");
        let (artifact, sha256, size) = self
            .build_blocking(archive.path.clone(), dir.to_path_buf())
            .await
            .map_err(BuildFailure::BuildFailed)?;

        info!(stage = %PipelineStage::Publishing, wheel = %artifact.filename, "publishing wheel");
        let storage_filename = request.filename().unwrap_or(&artifact.filename);
        if storage_filename != artifact.filename {
            warn!(
                requested = storage_filename,
                built = %artifact.filename,
                "built wheel name differs from requested name; storing under requested name"
            );
        }
        let storage_key = publish(
            self.store.as_ref(),
            &artifact.path,
            request.project(),
            storage_filename,
        )
        .await
        .map_err(BuildFailure::PublishFailed)?;

        Ok(BuildResult {
            message: format!("Successfully built {storage_filename}"),
            storage_key,
            artifact_filename: artifact.filename,
            sha256,
            size,
            archive_sha256: archive.sha256,
        })
    }

    /// Runs the blocking build tool on tokio's blocking pool so the caller's
    /// runtime threads stay free.
    async fn build_blocking(
        &self,
        archive: PathBuf,
        dir: PathBuf,
    ) -> Result<(BuiltArtifact, String, u64), BuildError> {
        let options = self.build.clone();
        let overlay = self.overlay.clone();
        tokio::task::spawn_blocking(move || {
            let artifact = build::build(&archive, &dir, &overlay, &options)?;
            let (sha256, size) = build::digest_artifact(&artifact.path)?;
            Ok((artifact, sha256, size))
        })
        .await
        .map_err(|err| BuildError::Worker(err.to_string()))?
    }
}
