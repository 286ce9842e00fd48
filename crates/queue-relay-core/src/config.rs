//! # Relay Configuration
//!
//! Configuration is layered; later sources override earlier ones:
//!
//! 1. `/etc/queue-relay/relay.yaml` (optional)
//! 2. `./config/relay.yaml` (optional)
//! 3. an explicitly requested file (required when given)
//! 4. environment variables prefixed `RELAY__`, using `__` between levels,
//!    e.g. `RELAY__RELAY__MAX_CONCURRENT_DELIVERIES=4`
//!
//! Every field has a default so that partial sources combine, and
//! [`RelayConfig::validate`] rejects configurations the relay cannot start
//! with.

use crate::lock::LockRenewalPolicy;
use crate::relay::RelayOptions;
use chrono::Duration;
use queue_runtime::QueueName;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;
use tracing::info;
use zeroize::Zeroizing;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Suffix appended to the destination queue name to find the source queue
pub const DEFAULT_SOURCE_QUEUE_SUFFIX: &str = "_error";

/// Prefix of environment variables read as configuration
pub const ENV_PREFIX: &str = "RELAY";

/// Optional configuration files, without extension, in load order
pub const DEFAULT_CONFIG_FILES: &[&str] = &["/etc/queue-relay/relay", "config/relay"];

const REDACTED: &str = "[REDACTED]";

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Missing required configuration value: {key}")]
    Missing { key: String },

    #[error("Invalid configuration value for {key}: {message}")]
    Invalid { key: String, message: String },

    #[error("Failed to render configuration: {0}")]
    Render(#[from] serde_yaml::Error),
}

// ============================================================================
// Secret values
// ============================================================================

/// String secret that is zeroized on drop and never printed
///
/// Serializes as a placeholder so rendered configuration is safe to show.
/// An empty secret renders as an empty string so missing values stay visible.
#[derive(Clone, Default)]
pub struct SecretString(Zeroizing<String>);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Get the secret (only for immediate use)
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString({})", REDACTED)
    }
}

impl Serialize for SecretString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0.is_empty() {
            serializer.serialize_str("")
        } else {
            serializer.serialize_str(REDACTED)
        }
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

// ============================================================================
// Configuration model
// ============================================================================

/// Complete relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Queue messages are relayed to
    #[serde(default)]
    pub destination_queue: String,

    /// Appended to `destination_queue` to name the queue messages are read from
    #[serde(default = "default_source_queue_suffix")]
    pub source_queue_suffix: String,

    #[serde(default)]
    pub source: EndpointConfig,

    #[serde(default)]
    pub destination: EndpointConfig,

    #[serde(default)]
    pub relay: RelaySettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_source_queue_suffix() -> String {
    DEFAULT_SOURCE_QUEUE_SUFFIX.to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            destination_queue: String::new(),
            source_queue_suffix: default_source_queue_suffix(),
            source: EndpointConfig::default(),
            destination: EndpointConfig::default(),
            relay: RelaySettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Credentials for one queue namespace
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default)]
    pub connection_string: SecretString,
}

/// Relay loop tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub max_concurrent_deliveries: usize,
    pub receive_timeout_seconds: u64,
    pub receive_error_backoff_seconds: u64,
    /// Zero disables lock renewal
    pub max_lock_renewal_seconds: u64,
    pub lock_renew_before_seconds: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            max_concurrent_deliveries: 1,
            receive_timeout_seconds: 30,
            receive_error_backoff_seconds: 5,
            max_lock_renewal_seconds: 300,
            lock_renew_before_seconds: 10,
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl RelayConfig {
    /// Load configuration from the default files, `explicit_path` and the environment
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_FILES, explicit_path)
    }

    /// Load configuration from the given optional files, `explicit_path`
    /// and the environment
    pub fn load_from(
        optional_files: &[&str],
        explicit_path: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        for name in optional_files {
            builder = builder.add_source(
                config::File::with_name(name)
                    .required(false)
                    .format(config::FileFormat::Yaml),
            );
        }

        if let Some(path) = explicit_path {
            info!(path = %path.display(), "Loading configuration from explicit path");
            builder = builder.add_source(
                config::File::from(path)
                    .required(true)
                    .format(config::FileFormat::Yaml),
            );
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Check that the relay can start with this configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.destination_queue.trim().is_empty() {
            return Err(ConfigError::Missing {
                key: "destination_queue".to_string(),
            });
        }
        if self.source_queue_suffix.is_empty() {
            return Err(ConfigError::Invalid {
                key: "source_queue_suffix".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        self.destination_queue_name()?;
        self.source_queue_name()?;

        if self.source.connection_string.is_empty() {
            return Err(ConfigError::Missing {
                key: "source.connection_string".to_string(),
            });
        }
        if self.destination.connection_string.is_empty() {
            return Err(ConfigError::Missing {
                key: "destination.connection_string".to_string(),
            });
        }

        if self.relay.max_concurrent_deliveries == 0 {
            return Err(ConfigError::Invalid {
                key: "relay.max_concurrent_deliveries".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// Validated destination queue name
    pub fn destination_queue_name(&self) -> Result<QueueName, ConfigError> {
        QueueName::new(self.destination_queue.clone()).map_err(|e| ConfigError::Invalid {
            key: "destination_queue".to_string(),
            message: e.to_string(),
        })
    }

    /// Source queue name: the destination name followed by the suffix
    pub fn source_queue_name(&self) -> Result<QueueName, ConfigError> {
        self.destination_queue_name()?
            .with_suffix(&self.source_queue_suffix)
            .map_err(|e| ConfigError::Invalid {
                key: "source_queue_suffix".to_string(),
                message: e.to_string(),
            })
    }

    /// Relay loop options derived from the `relay` section
    pub fn relay_options(&self) -> RelayOptions {
        let settings = &self.relay;
        RelayOptions {
            max_concurrent_deliveries: settings.max_concurrent_deliveries,
            receive_timeout: seconds(settings.receive_timeout_seconds),
            receive_error_backoff: seconds(settings.receive_error_backoff_seconds),
            lock_renewal: if settings.max_lock_renewal_seconds == 0 {
                LockRenewalPolicy::disabled()
            } else {
                LockRenewalPolicy {
                    max_renewal_duration: seconds(settings.max_lock_renewal_seconds),
                    renew_before: seconds(settings.lock_renew_before_seconds),
                }
            },
        }
    }

    /// YAML rendering with secrets replaced by a placeholder
    pub fn to_redacted_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

fn seconds(value: u64) -> Duration {
    let max_seconds = i64::MAX / 1000;
    Duration::seconds(i64::try_from(value).unwrap_or(max_seconds).min(max_seconds))
}
