use std::io;
use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::debug;

use super::{ArtifactStore, PublishError, StorageKey};
use crate::config::StorageConfig;

const CREDENTIALS_PROVIDER: &str = "wheelwright-static";
const WHEEL_CONTENT_TYPE: &str = "application/zip";
const AUTH_ERROR_CODES: &[&str] = &[
    "AccessDenied",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "InvalidToken",
];

/// S3-compatible bucket (Scaleway Object Storage by default).
///
/// Uploads are single-shot: the SDK's retry layer is disabled.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    #[must_use]
    pub fn new(config: &StorageConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            CREDENTIALS_PROVIDER,
        );
        let sdk_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(config.endpoint.clone())
            .credentials_provider(credentials)
            .force_path_style(true)
            .retry_config(RetryConfig::disabled())
            .build();
        Self {
            client: Client::from_conf(sdk_config),
            bucket: config.bucket.clone(),
        }
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ArtifactStore for S3Store {
    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }

    async fn upload(&self, key: &StorageKey, path: &Path) -> Result<(), PublishError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|err| PublishError::ReadArtifact {
                path: path.to_path_buf(),
                source: io::Error::other(err),
            })?;
        debug!(bucket = %self.bucket, %key, "sending PutObject");
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .content_type(WHEEL_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|err| {
                let code = err
                    .as_service_error()
                    .and_then(|service| service.code())
                    .map(ToOwned::to_owned);
                match code {
                    Some(code) if AUTH_ERROR_CODES.contains(&code.as_str()) => {
                        PublishError::Unauthorized {
                            target: self.describe(),
                            code,
                        }
                    }
                    _ => PublishError::Upload {
                        target: self.describe(),
                        key: key.to_string(),
                        message: DisplayErrorContext(&err).to_string(),
                    },
                }
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::{matchers::*, responders::*, Expectation, Server};

    const OBJECT_PATH: &str = "/wheels/dagon/dagon-0.9.9-py3-none-any.whl";

    fn storage(endpoint: String) -> StorageConfig {
        StorageConfig {
            access_key: "SCWXXXX".to_string(),
            secret_key: "secret".to_string(),
            bucket: "wheels".to_string(),
            endpoint,
            region: "fr-par".to_string(),
        }
    }

    fn key() -> StorageKey {
        StorageKey::new("dagon", "dagon-0.9.9-py3-none-any.whl").unwrap()
    }

    fn wheel(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("dagon-0.9.9-py3-none-any.whl");
        std::fs::write(&path, b"wheel-bytes").unwrap();
        path
    }

    fn store_for(server: &Server) -> S3Store {
        S3Store::new(&storage(format!("http://{}", server.addr())))
    }

    #[tokio::test]
    async fn describes_bucket() {
        let store = S3Store::new(&storage("http://127.0.0.1:9".to_string()));
        assert_eq!(store.describe(), "s3://wheels");
        assert_eq!(store.bucket(), "wheels");
    }

    #[tokio::test]
    async fn unreadable_artifact_fails_before_any_request() {
        let store = S3Store::new(&storage("http://127.0.0.1:9".to_string()));
        let dir = tempfile::tempdir().unwrap();

        let err = store
            .upload(&key(), &dir.path().join("missing.whl"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::ReadArtifact { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn puts_object_under_path_style_key() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("PUT", OBJECT_PATH))
                .respond_with(status_code(200)),
        );
        let dir = tempfile::tempdir().unwrap();

        store_for(&server)
            .upload(&key(), &wheel(&dir))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn access_denied_is_unauthorized() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("PUT", OBJECT_PATH)).respond_with(
                status_code(403)
                    .insert_header("Content-Type", "application/xml")
                    .body(
                        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                         <Error><Code>AccessDenied</Code><Message>Access Denied</Message></Error>",
                    ),
            ),
        );
        let dir = tempfile::tempdir().unwrap();

        let err = store_for(&server)
            .upload(&key(), &wheel(&dir))
            .await
            .unwrap_err();

        match err {
            PublishError::Unauthorized { target, code } => {
                assert_eq!(target, "s3://wheels");
                assert_eq!(code, "AccessDenied");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_is_an_upload_failure_without_retry() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("PUT", OBJECT_PATH))
                .times(1)
                .respond_with(status_code(500)),
        );
        let dir = tempfile::tempdir().unwrap();

        let err = store_for(&server)
            .upload(&key(), &wheel(&dir))
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::Upload { .. }), "{err:?}");
        assert_eq!(err.kind(), "upload_failed");
    }
}
