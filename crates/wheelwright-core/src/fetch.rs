use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};
use url::Url;

use crate::config::NetworkConfig;

const USER_AGENT: &str = concat!("wheelwright/", env!("CARGO_PKG_VERSION"));
const LOCAL_COPY_BUFFER: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("failed to construct HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("archive URL {0} has no filename")]
    NoFilename(String),
    #[error("failed to fetch {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected response for {url}: HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("timed out after {}s while fetching {url}", .after.as_secs())]
    Timeout { url: String, after: Duration },
    #[error("failed to read local archive {}: {source}", .path.display())]
    Local {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A source archive written into a build workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArchive {
    pub path: PathBuf,
    pub filename: String,
    pub sha256: String,
    pub size: u64,
}

/// Builds the HTTP client shared by every fetch in the process.
///
/// # Errors
/// Returns [`FetchError::Client`] when the TLS backend cannot be initialised.
pub fn http_client(network: &NetworkConfig) -> Result<Client, FetchError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(network.connect_timeout)
        .build()
        .map_err(FetchError::Client)
}

/// Local filename for an archive URL: the last path segment.
///
/// Fragments (`#sha256=...`) and query strings are not part of the path, so
/// they never leak into the name.
#[must_use]
pub fn archive_filename(url: &Url) -> Option<String> {
    url.path_segments()?
        .next_back()
        .filter(|segment| !segment.is_empty())
        .map(ToOwned::to_owned)
}

/// Streams `url` into `destination`, keeping the archive's own filename.
///
/// The body is written chunk by chunk, so memory use does not grow with the
/// archive size. `read_timeout` bounds each wait on the network, not the
/// whole transfer. Nothing is retried here.
///
/// # Errors
/// Returns a [`FetchError`] on connection failures, non-success statuses,
/// stalled reads, or disk write failures.
pub async fn fetch(
    client: &Client,
    url: &Url,
    destination: &Path,
    read_timeout: Option<Duration>,
) -> Result<FetchedArchive, FetchError> {
    let filename = archive_filename(url).ok_or_else(|| FetchError::NoFilename(url.to_string()))?;
    let path = destination.join(&filename);
    if url.scheme() == "file" {
        return copy_local(url, path, filename).await;
    }

    let request_error = |source| FetchError::Request {
        url: url.to_string(),
        source,
    };
    let mut response = within(read_timeout, url, client.get(url.clone()).send())
        .await?
        .map_err(request_error)?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let write_error = |source| FetchError::Write {
        path: path.clone(),
        source,
    };
    let mut file = File::create(&path).await.map_err(write_error)?;
    let mut hasher = Sha256::new();
    let mut size = 0_u64;
    while let Some(chunk) = within(read_timeout, url, response.chunk())
        .await?
        .map_err(request_error)?
    {
        hasher.update(&chunk);
        size += chunk.len() as u64;
        file.write_all(&chunk).await.map_err(write_error)?;
    }
    file.flush().await.map_err(write_error)?;

    let sha256 = hex::encode(hasher.finalize());
    info!(%url, filename, size, "fetched source archive");
    Ok(FetchedArchive {
        path,
        filename,
        sha256,
        size,
    })
}

async fn copy_local(url: &Url, dest: PathBuf, filename: String) -> Result<FetchedArchive, FetchError> {
    let source_path = url
        .to_file_path()
        .map_err(|()| FetchError::NoFilename(url.to_string()))?;
    let local_error = |source| FetchError::Local {
        path: source_path.clone(),
        source,
    };
    let write_error = |source| FetchError::Write {
        path: dest.clone(),
        source,
    };
    let mut src = File::open(&source_path).await.map_err(local_error)?;
    let mut out = File::create(&dest).await.map_err(write_error)?;
    let mut hasher = Sha256::new();
    let mut size = 0_u64;
    let mut buffer = vec![0_u8; LOCAL_COPY_BUFFER];
    loop {
        let read = src.read(&mut buffer).await.map_err(local_error)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
        out.write_all(&buffer[..read]).await.map_err(write_error)?;
    }
    out.flush().await.map_err(write_error)?;
    debug!(source = %source_path.display(), size, "copied local source archive");
    Ok(FetchedArchive {
        path: dest,
        filename,
        sha256: hex::encode(hasher.finalize()),
        size,
    })
}

async fn within<F: Future>(
    limit: Option<Duration>,
    url: &Url,
    future: F,
) -> Result<F::Output, FetchError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| FetchError::Timeout {
                url: url.to_string(),
                after: limit,
            }),
        None => Ok(future.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use std::fs;

    fn filename_of(raw: &str) -> Option<String> {
        archive_filename(&Url::parse(raw).unwrap())
    }

    #[test]
    fn filename_drops_fragment_and_query() {
        assert_eq!(
            filename_of("https://files.example/p/foo-1.0.tar.gz#sha256=abc").as_deref(),
            Some("foo-1.0.tar.gz")
        );
        assert_eq!(
            filename_of("https://files.example/p/foo-1.0.zip?token=1#md5=ff").as_deref(),
            Some("foo-1.0.zip")
        );
        assert_eq!(
            filename_of("https://files.example/ef/81/dagon-0.9.9.tar.gz").as_deref(),
            Some("dagon-0.9.9.tar.gz")
        );
    }

    #[test]
    fn filename_requires_a_final_segment() {
        assert_eq!(filename_of("https://files.example/"), None);
        assert_eq!(filename_of("https://files.example/dir/"), None);
    }

    #[tokio::test]
    async fn streams_archive_into_destination() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/p/dagon-0.9.9.tar.gz"))
                .respond_with(status_code(200).body("archive-bytes")),
        );
        let dir = tempfile::tempdir().unwrap();
        let url = Url::parse(&server.url_str("/p/dagon-0.9.9.tar.gz#sha256=00")).unwrap();
        let client = http_client(&NetworkConfig::default()).unwrap();

        let fetched = fetch(&client, &url, dir.path(), None).await.unwrap();

        assert_eq!(fetched.filename, "dagon-0.9.9.tar.gz");
        assert_eq!(fetched.path, dir.path().join("dagon-0.9.9.tar.gz"));
        assert_eq!(fs::read(&fetched.path).unwrap(), b"archive-bytes");
        assert_eq!(fetched.size, 13);
        assert_eq!(
            fetched.sha256,
            hex::encode(Sha256::digest(b"archive-bytes"))
        );
    }

    #[tokio::test]
    async fn not_found_is_a_status_error_and_writes_nothing() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/missing-1.0.tar.gz"))
                .respond_with(status_code(404)),
        );
        let dir = tempfile::tempdir().unwrap();
        let url = Url::parse(&server.url_str("/missing-1.0.tar.gz")).unwrap();
        let client = http_client(&NetworkConfig::default()).unwrap();

        let err = fetch(&client, &url, dir.path(), None).await.unwrap_err();

        assert!(matches!(err, FetchError::Status { status: 404, .. }), "{err:?}");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn slow_server_hits_read_timeout() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/slow-1.0.tar.gz")).respond_with(
                delay_and_then(Duration::from_secs(2), status_code(200).body("late")),
            ),
        );
        let dir = tempfile::tempdir().unwrap();
        let url = Url::parse(&server.url_str("/slow-1.0.tar.gz")).unwrap();
        let client = http_client(&NetworkConfig::default()).unwrap();

        let err = fetch(&client, &url, dir.path(), Some(Duration::from_millis(100)))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Timeout { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn copies_file_urls() {
        let src_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("local-2.0.tar.gz");
        fs::write(&src, b"local archive").unwrap();
        let dest = tempfile::tempdir().unwrap();
        let url = Url::from_file_path(&src).unwrap();
        let client = http_client(&NetworkConfig::default()).unwrap();

        let fetched = fetch(&client, &url, dest.path(), None).await.unwrap();

        assert_eq!(fetched.filename, "local-2.0.tar.gz");
        assert_eq!(fs::read(&fetched.path).unwrap(), b"local archive");
        assert_eq!(fetched.size, 13);
    }

    #[tokio::test]
    async fn missing_local_file_is_reported() {
        let dest = tempfile::tempdir().unwrap();
        let url = Url::from_file_path(dest.path().join("nope-1.0.tar.gz")).unwrap();
        let client = http_client(&NetworkConfig::default()).unwrap();

        let err = fetch(&client, &url, dest.path(), None).await.unwrap_err();
        assert!(matches!(err, FetchError::Local { .. }), "{err:?}");
    }
}
