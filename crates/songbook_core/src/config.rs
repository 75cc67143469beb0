//! Session factory configuration.
//!
//! # Responsibility
//! - Describe which store backs the factory and how its transactions lock.
//! - Load that description from a TOML file.
//!
//! # Invariants
//! - A validated config with the `sqlite` backend always carries a file path.
//! - Relative sqlite paths in a loaded file are resolved against the file's
//!   directory.

use crate::model::MappingError;
use crate::store::Isolation;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_LOG_LEVEL: &str = "info";

/// Default config file name looked up by the CLI.
pub const DEFAULT_CONFIG_FILE: &str = "songbook.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("session factory already initialized from `{}`; refusing `{}`", active.display(), requested.display())]
    AlreadyInitialized { active: PathBuf, requested: PathBuf },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: Backend,
    /// Database file for the `sqlite` backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default)]
    pub isolation: Isolation,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            path: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            isolation: Isolation::default(),
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Absolute directory for rolling log files; stderr only when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FactoryConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl FactoryConfig {
    /// Config for a fresh in-memory store.
    pub fn memory() -> Self {
        Self {
            store: StoreConfig {
                backend: Backend::Memory,
                ..StoreConfig::default()
            },
            logging: None,
        }
    }

    /// Config for a SQLite database file.
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreConfig {
                backend: Backend::Sqlite,
                path: Some(path.into()),
                ..StoreConfig::default()
            },
            logging: None,
        }
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&contents)?;

        if let (Some(db_path), Some(base)) = (config.store.path.as_mut(), path.parent()) {
            if db_path.is_relative() {
                let resolved = base.join(&*db_path);
                *db_path = resolved;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.backend == Backend::Sqlite {
            let Some(path) = self.store.path.as_deref() else {
                return Err(ConfigError::Invalid(
                    "store.path is required for the sqlite backend".to_string(),
                ));
            };
            if path.as_os_str().is_empty() || path == Path::new(":memory:") {
                return Err(ConfigError::Invalid(format!(
                    "store.path `{}` must name a database file",
                    path.display()
                )));
            }
        }

        if let Some(dir) = self.logging.as_ref().and_then(|logging| logging.dir.as_deref()) {
            if !dir.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "logging.dir must be an absolute path, got `{}`",
                    dir.display()
                )));
            }
        }

        Ok(())
    }
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
