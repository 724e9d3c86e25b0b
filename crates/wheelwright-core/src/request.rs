use serde::Deserialize;
use url::Url;

use crate::fetch::archive_filename;

const MAX_PROJECT_LEN: usize = 128;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("project name must not be empty")]
    EmptyProject,
    #[error("project name `{0}` is not a safe identifier (allowed: A-Z a-z 0-9 . _ -)")]
    UnsafeProject(String),
    #[error("filename `{0}` must be a plain file name")]
    UnsafeFilename(String),
    #[error("archive URL `{url}` is invalid: {reason}")]
    InvalidArchiveUrl { url: String, reason: String },
}

/// One wheel build, as received from the index layer.
///
/// Construction validates every field, so a `BuildRequest` in hand is safe to
/// turn into filesystem paths and storage keys.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawBuildRequest")]
pub struct BuildRequest {
    project: String,
    filename: Option<String>,
    archive_url: Url,
}

#[derive(Deserialize)]
struct RawBuildRequest {
    project: String,
    #[serde(default)]
    filename: Option<String>,
    archive_url: String,
}

impl TryFrom<RawBuildRequest> for BuildRequest {
    type Error = RequestError;

    fn try_from(raw: RawBuildRequest) -> Result<Self, Self::Error> {
        Self::new(raw.project, raw.filename, &raw.archive_url)
    }
}

impl BuildRequest {
    /// Validates and assembles a request.
    ///
    /// # Errors
    /// Returns a [`RequestError`] when the project or filename could escape
    /// their storage prefix, or when the archive URL is unusable.
    pub fn new(
        project: impl Into<String>,
        filename: Option<String>,
        archive_url: &str,
    ) -> Result<Self, RequestError> {
        let project = project.into();
        validate_project(&project)?;
        let filename = filename.filter(|name| !name.is_empty());
        if let Some(name) = &filename {
            validate_filename(name)?;
        }
        let archive_url = parse_archive_url(archive_url)?;
        Ok(Self {
            project,
            filename,
            archive_url,
        })
    }

    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    #[must_use]
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    #[must_use]
    pub fn archive_url(&self) -> &Url {
        &self.archive_url
    }
}

pub(crate) fn validate_project(project: &str) -> Result<(), RequestError> {
    if project.is_empty() {
        return Err(RequestError::EmptyProject);
    }
    let allowed = project
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'));
    if !allowed || project.len() > MAX_PROJECT_LEN || project == "." || project == ".." {
        return Err(RequestError::UnsafeProject(project.to_string()));
    }
    Ok(())
}

pub(crate) fn validate_filename(filename: &str) -> Result<(), RequestError> {
    let plain = !filename.is_empty()
        && filename != "."
        && filename != ".."
        && !filename.contains(['/', '\\', '\0']);
    if plain {
        Ok(())
    } else {
        Err(RequestError::UnsafeFilename(filename.to_string()))
    }
}

fn parse_archive_url(raw: &str) -> Result<Url, RequestError> {
    let invalid = |reason: String| RequestError::InvalidArchiveUrl {
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw).map_err(|err| invalid(err.to_string()))?;
    if !matches!(url.scheme(), "http" | "https" | "file") {
        return Err(invalid(format!("unsupported scheme `{}`", url.scheme())));
    }
    let name = archive_filename(&url).ok_or_else(|| invalid("no archive filename in path".into()))?;
    validate_filename(&name).map_err(|err| invalid(err.to_string()))?;
    Ok(url)
}
