//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables,
//! prefixed with `SYFT_` and using `__` to separate sections from keys. An example of a
//! configuration file can be found in `configs/config.toml`.

use std::{fmt, path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::constraints::ConstraintPolicy;

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub api: ApiSettings,
    #[serde(default)]
    pub constraints: ConstraintPolicy,
    #[validate]
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: PathBuf) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(File::from(path))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Same as [`Settings::new`], with the content of a TOML configuration file.
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(File::from_str(content, FileFormat::Toml))?;
        settings.validate()?;
        Ok(settings)
    }

    fn load<S>(source: S) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        Config::builder()
            .add_source(source)
            .add_source(
                Environment::with_prefix("SYFT")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
/// How the cycle protocol messages reach the coordinator.
pub enum Transport {
    /// Over a persistent websocket
    Socket,
    /// Over one HTTP request per call
    Http,
}

impl Default for Transport {
    fn default() -> Self {
        Self::Socket
    }
}

#[derive(Debug, Clone, Validate, Deserialize)]
/// Coordinator API settings.
pub struct ApiSettings {
    #[validate(url)]
    /// The HTTP address of the coordinator.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// url = "http://127.0.0.1:5000"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// SYFT_API__URL=http://127.0.0.1:5000
    /// ```
    pub url: String,

    #[serde(default)]
    /// The transport of the cycle protocol messages: `"socket"` or `"http"`. Signalling
    /// messages between workers always use the socket.
    pub transport: Transport,

    #[validate(url)]
    #[serde(default)]
    /// The address of the websocket. Defaults to `url` with a `ws` or `wss` scheme.
    pub socket_url: Option<String>,

    #[validate(range(min = 1))]
    #[serde(default = "default_timeout_ms")]
    /// How long to wait for a response from the coordinator, in milliseconds.
    pub timeout_ms: u64,

    #[serde(default)]
    /// The PEM encoded root certificate used to authenticate the coordinator.
    pub trust_anchor: Option<PathBuf>,
}

fn default_timeout_ms() -> u64 {
    20_000
}

impl ApiSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Validate, Deserialize)]
#[validate(schema(function = "validate_worker"))]
/// Worker settings.
pub struct WorkerSettings {
    #[validate(range(min = 1))]
    #[serde(default = "default_max_concurrent_jobs")]
    /// The maximum number of jobs running at the same time.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [worker]
    /// max_concurrent_jobs = 1
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// SYFT_WORKER__MAX_CONCURRENT_JOBS=1
    /// ```
    pub max_concurrent_jobs: usize,

    #[serde(default = "default_files_dir")]
    /// The directory where the cycle materials are stored.
    pub files_dir: PathBuf,

    #[serde(default)]
    /// The token presented to the coordinator when authenticating.
    pub auth_token: Option<String>,

    #[validate(range(min = 1))]
    #[serde(default = "default_download_concurrency")]
    /// The maximum number of materials downloaded at the same time.
    pub download_concurrency: usize,

    #[serde(default = "default_speed_test_sample_size")]
    /// The size of the sample uploaded when measuring the upload bandwidth, in bytes.
    pub speed_test_sample_size: usize,
}

fn default_max_concurrent_jobs() -> usize {
    1
}

fn default_files_dir() -> PathBuf {
    PathBuf::from("syft-files")
}

fn default_download_concurrency() -> usize {
    4
}

fn default_speed_test_sample_size() -> usize {
    crate::protocol::http::DEFAULT_UPLOAD_SAMPLE_SIZE
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            files_dir: default_files_dir(),
            auth_token: None,
            download_concurrency: default_download_concurrency(),
            speed_test_sample_size: default_speed_test_sample_size(),
        }
    }
}

fn validate_worker(settings: &WorkerSettings) -> Result<(), ValidationError> {
    if settings.files_dir.as_os_str().is_empty() {
        return Err(ValidationError::new("empty files directory"));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// SYFT_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: EnvFilter::new("info"),
        }
    }
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
