//! # Engine Configuration
//!
//! Layered configuration: built-in defaults, then an optional TOML/YAML file,
//! then `BUILDSTEP__*` environment variables (`__` separates nesting levels,
//! e.g. `BUILDSTEP__DATABASE__MAX_CONNECTIONS=8`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Largest number of identifiers bound into a single `IN (...)` clause
pub const MAX_FINISH_BATCH_SIZE: usize = 100;

/// Largest number of rows a history query may return
pub const MAX_HISTORY_LIMIT: u32 = 200;

const ENV_PREFIX: &str = "BUILDSTEP";

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Invalid step definition: {0}")]
    InvalidStep(String),
}

impl ConfigurationError {
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigurationError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
    /// How long a connection waits on a locked database before failing
    pub busy_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://buildstep.db?mode=rwc".to_string(),
            max_connections: 5,
            acquire_timeout_seconds: 30,
            busy_timeout_seconds: 5,
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    /// Whether published payloads are checked against their routing key
    pub verify_messages: bool,
    /// Number of productions the in-memory bus keeps for inspection
    pub production_log_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            verify_messages: true,
            production_log_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Timeout applied to shell steps that do not declare their own
    pub default_command_timeout_seconds: Option<u64>,
    /// Chunk size for `finish_builds`
    pub finish_batch_size: usize,
    /// Upper bound on history query limits
    pub history_limit_cap: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_command_timeout_seconds: None,
            finish_batch_size: MAX_FINISH_BATCH_SIZE,
            history_limit_cap: MAX_HISTORY_LIMIT,
        }
    }
}

impl ExecutionConfig {
    pub fn default_command_timeout(&self) -> Option<Duration> {
        self.default_command_timeout_seconds.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub events: EventConfig,
    pub execution: ExecutionConfig,
}

impl EngineConfig {
    /// Load defaults, the optional file at `path`, then environment overrides
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        tracing::debug!(
            max_connections = config.database.max_connections,
            finish_batch_size = config.execution.finish_batch_size,
            history_limit_cap = config.execution.history_limit_cap,
            "Engine configuration loaded"
        );
        Ok(config)
    }

    /// Defaults plus environment overrides; `DATABASE_URL` wins over the file value
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::load(None)?;
        if let Ok(db_url) = std::env::var("DATABASE_URL") {
            config.database.url = db_url;
        }
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigurationError::invalid_value(
                "database.url",
                "must not be empty",
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "database.max_connections",
                "must be at least 1",
            ));
        }
        if self.events.production_log_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "events.production_log_capacity",
                "must be at least 1",
            ));
        }
        if !(1..=MAX_FINISH_BATCH_SIZE).contains(&self.execution.finish_batch_size) {
            return Err(ConfigurationError::invalid_value(
                "execution.finish_batch_size",
                format!("must be between 1 and {MAX_FINISH_BATCH_SIZE}"),
            ));
        }
        if !(1..=MAX_HISTORY_LIMIT).contains(&self.execution.history_limit_cap) {
            return Err(ConfigurationError::invalid_value(
                "execution.history_limit_cap",
                format!("must be between 1 and {MAX_HISTORY_LIMIT}"),
            ));
        }
        Ok(())
    }
}
