use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_S3_ENDPOINT: &str = "https://s3.fr-par.scw.cloud";
pub const DEFAULT_S3_REGION: &str = "fr-par";
pub const DEFAULT_PYTHON: &str = "python3";

const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 30 * 60;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_CAPTURE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),
    #[error("environment variable {key} has invalid value `{value}` (expected a non-negative integer)")]
    InvalidNumber { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    #[must_use]
    pub fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    #[must_use]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }

    #[must_use]
    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Like [`EnvSnapshot::var`] but treats whitespace-only values as unset.
    fn non_blank(&self, key: &str) -> Option<&str> {
        self.var(key).map(str::trim).filter(|value| !value.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.non_blank(key)
            .map(ToOwned::to_owned)
            .ok_or(ConfigError::Missing(key))
    }

    fn number<T: std::str::FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.non_blank(key) {
            Some(raw) => raw.parse::<T>().map_err(|_| ConfigError::InvalidNumber {
                key,
                value: raw.to_string(),
            }),
            None => Ok(default),
        }
    }

    /// Reads a duration in seconds where `0` disables the limit.
    fn optional_secs(&self, key: &'static str, default: u64) -> Result<Option<Duration>, ConfigError> {
        let secs = self.number(key, default)?;
        Ok((secs > 0).then(|| Duration::from_secs(secs)))
    }
}

/// Process-wide settings, read once at startup and passed by reference.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) storage: Result<StorageConfig, ConfigError>,
    pub(crate) toolchain: ToolchainConfig,
    pub(crate) build: BuildConfig,
    pub(crate) network: NetworkConfig,
}

impl Config {
    /// Builds a configuration from the current process environment.
    ///
    /// # Errors
    /// Returns an error when a numeric setting cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    /// Builds a configuration from a captured environment.
    ///
    /// Storage settings are optional at this point; callers that publish to
    /// S3 fetch them through [`Config::require_storage`].
    ///
    /// # Errors
    /// Returns an error when a numeric setting cannot be parsed.
    pub fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self, ConfigError> {
        Ok(Self {
            storage: StorageConfig::from_snapshot(snapshot),
            toolchain: ToolchainConfig {
                alternate: snapshot.non_blank("ZIG_TOOLCHAIN").map(ToOwned::to_owned),
            },
            build: BuildConfig {
                python: snapshot
                    .non_blank("WHEELWRIGHT_PYTHON")
                    .unwrap_or(DEFAULT_PYTHON)
                    .to_string(),
                timeout: snapshot
                    .optional_secs("WHEELWRIGHT_BUILD_TIMEOUT_SECS", DEFAULT_BUILD_TIMEOUT_SECS)?,
                max_capture_bytes: snapshot
                    .number("WHEELWRIGHT_MAX_CAPTURE_BYTES", DEFAULT_MAX_CAPTURE_BYTES)?,
                work_root: snapshot.non_blank("WHEELWRIGHT_WORK_DIR").map(PathBuf::from),
            },
            network: NetworkConfig {
                connect_timeout: Duration::from_secs(
                    snapshot.number("WHEELWRIGHT_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS)?,
                ),
                read_timeout: snapshot
                    .optional_secs("WHEELWRIGHT_READ_TIMEOUT_SECS", DEFAULT_READ_TIMEOUT_SECS)?,
            },
        })
    }

    /// Returns the storage settings.
    ///
    /// # Errors
    /// Returns [`ConfigError::Missing`] naming the first unset credential or bucket variable.
    pub fn require_storage(&self) -> Result<&StorageConfig, ConfigError> {
        self.storage.as_ref().map_err(Clone::clone)
    }

    #[must_use]
    pub fn storage(&self) -> Option<&StorageConfig> {
        self.storage.as_ref().ok()
    }

    #[must_use]
    pub fn toolchain(&self) -> &ToolchainConfig {
        &self.toolchain
    }

    #[must_use]
    pub fn build(&self) -> &BuildConfig {
        &self.build
    }

    #[must_use]
    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }
}

#[derive(Clone)]
pub struct StorageConfig {
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub endpoint: String,
    pub region: String,
}

impl StorageConfig {
    fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self, ConfigError> {
        Ok(Self {
            access_key: snapshot.required("SCW_ACCESS_KEY")?,
            secret_key: snapshot.required("SCW_SECRET_KEY")?,
            bucket: snapshot.required("S3_BUCKET")?,
            endpoint: snapshot
                .non_blank("S3_ENDPOINT")
                .unwrap_or(DEFAULT_S3_ENDPOINT)
                .to_string(),
            region: snapshot
                .non_blank("S3_REGION")
                .unwrap_or(DEFAULT_S3_REGION)
                .to_string(),
        })
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolchainConfig {
    /// Identifier of the alternate C/C++ toolchain; `None` inherits the host compilers.
    pub alternate: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub python: String,
    pub timeout: Option<Duration>,
    pub max_capture_bytes: usize,
    pub work_root: Option<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            python: DEFAULT_PYTHON.to_string(),
            timeout: Some(Duration::from_secs(DEFAULT_BUILD_TIMEOUT_SECS)),
            max_capture_bytes: DEFAULT_MAX_CAPTURE_BYTES,
            work_root: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NetworkConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Option<Duration>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            read_timeout: Some(Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS)),
        }
    }
}
