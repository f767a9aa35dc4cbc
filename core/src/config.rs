//! Engine configuration
//!
//! Layered through the `config` crate: built-in defaults, then an optional
//! TOML file (`pnl.toml` in the working directory, `PNL_CONFIG_PATH`, or an
//! explicit path), then `PNL_*` environment variables using `__` between
//! section and key, e.g. `PNL_ROLLBACK__DEFAULT_RETRY_BUDGET=5`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Default deadline for domain calls without `@timeout`
    pub call_timeout_ms: Option<u64>,
    pub max_call_depth: usize,
    /// Overrides `#ENTRY=` and the `main` default
    pub entry: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: None,
            max_call_depth: 64,
            entry: None,
        }
    }
}

impl ExecutorConfig {
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Budget for regions without `@retry`
    pub default_retry_budget: u32,
    /// Upper bound applied to every budget, including explicit `@retry`
    pub max_retry_budget: u32,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            default_retry_budget: 3,
            max_retry_budget: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub enabled: bool,
    /// Attach frame bindings to checkpoint and rollback records
    pub snapshot_bindings: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            snapshot_bindings: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainsConfig {
    /// Replaces the program's `#DOMAIN=` directives when set
    pub active: Option<Vec<String>>,
    /// TOML file with pack definitions
    pub packs: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub executor: ExecutorConfig,
    pub rollback: RollbackConfig,
    pub trace: TraceConfig,
    pub domains: DomainsConfig,
}

impl EngineConfig {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load with default sources
    pub fn load() -> Result<Self, ConfigError> {
        Self::builder().build()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor.max_call_depth == 0 {
            return Err(ConfigError::Invalid(
                "executor.max_call_depth must be at least 1".to_string(),
            ));
        }
        if self.rollback.default_retry_budget > self.rollback.max_retry_budget {
            return Err(ConfigError::Invalid(format!(
                "rollback.default_retry_budget ({}) exceeds rollback.max_retry_budget ({})",
                self.rollback.default_retry_budget, self.rollback.max_retry_budget
            )));
        }
        if self.executor.call_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "executor.call_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`EngineConfig`]
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_path: Option<PathBuf>,
    skip_env: bool,
}

impl ConfigBuilder {
    /// Read this file instead of looking for `pnl.toml`; it must exist
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Ignore `PNL_*` variables and `.env`
    pub fn without_env(mut self) -> Self {
        self.skip_env = true;
        self
    }

    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        if !self.skip_env {
            dotenvy::dotenv().ok();
        }

        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&EngineConfig::default())?);

        let explicit = self.config_path.or_else(|| match self.skip_env {
            true => None,
            false => std::env::var("PNL_CONFIG_PATH").ok().map(PathBuf::from),
        });
        builder = match explicit {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("pnl").required(false)),
        };

        if !self.skip_env {
            builder = builder.add_source(
                config::Environment::with_prefix("PNL")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("domains.active"),
            );
        }

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}
