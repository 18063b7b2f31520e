//! Unified configuration for unicontact components.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (unicontact.toml)
//! ```toml
//! [server]
//! listen = "0.0.0.0:3000"
//!
//! [storage]
//! data_dir = "/var/lib/unicontact"
//!
//! [identify]
//! request_timeout_ms = 2000
//! ```
//!
//! Environment variables use the `UNICONTACT_` prefix with `__` between
//! sections, e.g. `UNICONTACT_STORAGE__DATA_DIR=/tmp/contacts`.

mod defaults;

pub use defaults::*;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for unicontact components.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactsConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub identify: IdentifyTuning,
    pub log: LogConfig,
}

impl ContactsConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - CLI overrides to apply on top
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(ContactsConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        figment = figment.merge(Serialized::defaults(overrides));

        let config: Self = figment.extract().map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.identify.request_timeout_ms == 0 {
            return Err(ConfigError::new("identify.request_timeout_ms must be > 0"));
        }
        if self.storage.cache_capacity == 0 {
            return Err(ConfigError::new("storage.cache_capacity must be > 0"));
        }
        Ok(())
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], DEFAULT_LISTEN_PORT)),
        }
    }
}

/// Contact store selection and RocksDB tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory for the persistent store; in-memory when absent
    pub data_dir: Option<PathBuf>,
    /// Read cache capacity in contacts
    pub cache_capacity: usize,
    /// Run repair on startup
    pub repair: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            repair: false,
        }
    }
}

/// Knobs for the identify pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifyTuning {
    pub request_timeout_ms: u64,
    pub max_lock_retries: usize,
}

impl IdentifyTuning {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for IdentifyTuning {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_lock_retries: DEFAULT_MAX_LOCK_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<SocketAddr>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<bool>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self::new(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ContactsConfig::default();
        assert_eq!(config.server.listen.to_string(), "127.0.0.1:3000");
        assert!(config.storage.data_dir.is_none());
        assert_eq!(config.storage.cache_capacity, DEFAULT_CACHE_CAPACITY);
        assert_eq!(
            config.identify.request_timeout(),
            Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)
        );
    }

    #[test]
    fn test_layers_file_env_and_overrides() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "unicontact.toml",
                r#"
                [server]
                listen = "0.0.0.0:4000"

                [identify]
                request_timeout_ms = 250
                "#,
            )?;
            jail.set_env("UNICONTACT_IDENTIFY__MAX_LOCK_RETRIES", "3");
            jail.set_env("UNICONTACT_STORAGE__DATA_DIR", "/tmp/from-env");

            let overrides = ConfigOverrides {
                storage: Some(StorageOverrides {
                    data_dir: Some(PathBuf::from("/tmp/from-cli")),
                    repair: None,
                }),
                ..ConfigOverrides::default()
            };
            let config = ContactsConfig::load(Some("unicontact.toml"), overrides)
                .map_err(|err| err.to_string())?;

            assert_eq!(config.server.listen.to_string(), "0.0.0.0:4000");
            assert_eq!(config.identify.request_timeout_ms, 250);
            assert_eq!(config.identify.max_lock_retries, 3);
            assert_eq!(
                config.storage.data_dir.as_deref(),
                Some(std::path::Path::new("/tmp/from-cli"))
            );
            Ok(())
        });
    }

    #[test]
    fn test_rejects_zero_timeout() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("UNICONTACT_IDENTIFY__REQUEST_TIMEOUT_MS", "0");
            assert!(ContactsConfig::from_env(None).is_err());
            Ok(())
        });
    }
}
