//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables with the
//! prefix `FEDSYNC_`, where nested keys are separated by a double underscore. An example of a
//! configuration file can be found in the `configs/` directory located in the repository root.

use std::{
    fmt,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, ConfigError, Environment, File};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use fedsync_core::{PrivacyBudget, PrivacyError};

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
    pub api: ApiSettings,
    pub log: LoggingSettings,
    pub storage: StorageSettings,
    #[validate]
    pub privacy: PrivacySettings,
    #[validate]
    pub aggregator: AggregatorSettings,
    #[serde(default)]
    pub runtime: RuntimeSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("fedsync")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Deserialize, Clone)]
/// REST API settings.
pub struct ApiSettings {
    /// The address to which the REST API should be bound.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// bind_address = "127.0.0.1:8000"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSYNC_API__BIND_ADDRESS=127.0.0.1:8000
    /// ```
    pub bind_address: SocketAddr,
}

#[derive(Debug, Deserialize, Clone)]
/// Storage settings.
pub struct StorageSettings {
    /// The directory in which every adapter is persisted in its own subdirectory.
    pub adapters_dir: PathBuf,
    /// The directory into which models are downloaded.
    pub models_dir: PathBuf,
    /// The JSON file which keeps the synchronization and training history.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [storage]
    /// history_path = "./data/history.json"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSYNC_STORAGE__HISTORY_PATH=./data/history.json
    /// ```
    pub history_path: PathBuf,
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_privacy"))]
/// The default privacy parameters of a synchronization.
///
/// A synchronization request may override each of them.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [privacy]
/// epsilon = 2.0
/// delta = 1e-5
/// clip_norm = 1.0
/// ```
///
/// **Environment variable**
/// ```text
/// FEDSYNC_PRIVACY__EPSILON=2.0
/// ```
pub struct PrivacySettings {
    /// The privacy loss bound, must be positive.
    pub epsilon: f64,
    /// The failure probability, must be in `(0, 1)`.
    pub delta: f64,
    /// The maximal L2 norm of every released tensor, must be positive.
    pub clip_norm: f64,
}

impl PrivacySettings {
    pub fn budget(&self) -> Result<PrivacyBudget, PrivacyError> {
        PrivacyBudget::new(self.epsilon, self.delta, self.clip_norm)
    }
}

fn validate_privacy(s: &PrivacySettings) -> Result<(), ValidationError> {
    s.budget().map(|_| ()).map_err(|err| {
        let mut error = ValidationError::new("invalid privacy parameters");
        error.message = Some(err.to_string().into());
        error
    })
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// Settings of the remote aggregator.
pub struct AggregatorSettings {
    /// The base URL of the aggregator. Without URL, an in-process simulated aggregator is used.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregator]
    /// url = "https://aggregator.example.com"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSYNC_AGGREGATOR__URL=https://aggregator.example.com
    /// ```
    #[validate(url)]
    #[serde(default)]
    pub url: Option<String>,
    /// The timeout of an exchange with the aggregator, in seconds.
    #[validate(range(min = 1))]
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// The response delay of the simulated aggregator, in milliseconds.
    #[serde(default)]
    pub simulated_delay_ms: u64,
    /// The relative perturbation the simulated aggregator applies to the update.
    #[validate(range(min = 0.0, max = 1.0))]
    #[serde(default)]
    pub simulated_jitter: f64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl AggregatorSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn simulated_delay(&self) -> Duration {
        Duration::from_millis(self.simulated_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
/// Settings of the simulated model runtime.
pub struct RuntimeSettings {
    /// The duration of a training epoch, in milliseconds.
    pub simulated_epoch_ms: u64,
    /// The duration of a 5% step of a model download, in milliseconds.
    pub simulated_download_step_ms: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            simulated_epoch_ms: 500,
            simulated_download_step_ms: 50,
        }
    }
}

impl RuntimeSettings {
    pub fn epoch_delay(&self) -> Duration {
        Duration::from_millis(self.simulated_epoch_ms)
    }

    pub fn download_step_delay(&self) -> Duration {
        Duration::from_millis(self.simulated_download_step_ms)
    }
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
    /// FEDSYNC_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
