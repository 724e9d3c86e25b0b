#![deny(clippy::all)]

//! Builds Python wheels from source archives and publishes them to object
//! storage.

pub mod build;
pub mod config;
pub mod fetch;
pub mod outcome;
pub mod pipeline;
pub mod publish;
pub mod request;
pub mod toolchain;
pub mod workspace;

pub use crate::build::{ArtifactPolicy, BuildError, BuildOptions, BuildTool, BuiltArtifact};
pub use crate::config::{
    BuildConfig, Config, ConfigError, EnvSnapshot, NetworkConfig, StorageConfig,
    ToolchainConfig,
};
pub use crate::fetch::{FetchError, FetchedArchive};
pub use crate::outcome::{CommandStatus, ExecutionOutcome};
pub use crate::pipeline::{BuildFailure, BuildResult, Builder, PipelineStage};
pub use crate::publish::{publish, ArtifactStore, LocalDirStore, PublishError, S3Store, StorageKey};
pub use crate::request::{BuildRequest, RequestError};
pub use crate::toolchain::ToolchainOverlay;
pub use crate::workspace::BuildWorkspace;
