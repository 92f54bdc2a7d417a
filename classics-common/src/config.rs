//! Configuration loading, validation and config file resolution
//!
//! Every value the pipeline core depends on (budget ceiling, retry policy,
//! storage locations) comes from the TOML file. Missing keys are load errors;
//! nothing falls back to a compiled-in value.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable consulted when no `--config` argument is given
pub const CONFIG_ENV_VAR: &str = "CLASSICS_CONFIG";

/// Complete pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub storage: StorageConfig,
    pub budget: BudgetConfig,
    pub retry: RetryConfig,
    /// Stage command table keyed by stage name (`narration`, `cleaning`, ...)
    #[serde(default)]
    pub stages: BTreeMap<String, StageCommandConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// SQLite state store file
    pub database: PathBuf,
    /// Root under which each book's artifacts live (`<root>/<book_id>/...`)
    pub artifact_root: PathBuf,
    /// Maximum total time to retry a write while SQLite reports lock contention
    pub max_lock_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetConfig {
    /// Per-book spend ceiling in USD
    pub ceiling_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts for a transient stage failure (first try included)
    pub attempts: u32,
    /// Delay before the second attempt; doubles for every further attempt
    pub backoff_base_ms: u64,
}

impl RetryConfig {
    /// Backoff to wait after `attempt` (1-based) failed transiently
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(1u64 << exponent))
    }
}

/// External command implementing one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageCommandConfig {
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// Prospective cost used by the budget check; required for paid stages
    #[serde(default)]
    pub estimated_cost_usd: Option<f64>,
    /// Kill the command after this many seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl PipelineConfig {
    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    ///
    /// Relative storage paths are resolved against the config file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        let mut config = Self::from_toml_str(&content)?;

        if let Some(base) = path.parent() {
            config.storage.database = rebase(base, &config.storage.database);
            config.storage.artifact_root = rebase(base, &config.storage.artifact_root);
        }

        tracing::debug!(
            config = %path.display(),
            database = %config.storage.database.display(),
            artifact_root = %config.storage.artifact_root.display(),
            "Pipeline configuration loaded"
        );

        Ok(config)
    }

    /// Check value ranges the type system cannot express
    pub fn validate(&self) -> Result<()> {
        if !self.budget.ceiling_usd.is_finite() || self.budget.ceiling_usd < 0.0 {
            return Err(Error::Config(format!(
                "budget.ceiling_usd must be a non-negative number, got {}",
                self.budget.ceiling_usd
            )));
        }
        if self.retry.attempts == 0 {
            return Err(Error::Config("retry.attempts must be at least 1".to_string()));
        }
        if self.retry.backoff_base_ms == 0 {
            return Err(Error::Config("retry.backoff_base_ms must be greater than 0".to_string()));
        }
        if self.storage.database.as_os_str().is_empty() {
            return Err(Error::Config("storage.database must not be empty".to_string()));
        }
        if self.storage.artifact_root.as_os_str().is_empty() {
            return Err(Error::Config("storage.artifact_root must not be empty".to_string()));
        }

        for (name, stage) in &self.stages {
            if stage.command.first().map_or(true, |program| program.trim().is_empty()) {
                return Err(Error::Config(format!("stages.{}.command must name a program", name)));
            }
            if let Some(estimate) = stage.estimated_cost_usd {
                if !estimate.is_finite() || estimate < 0.0 {
                    return Err(Error::Config(format!(
                        "stages.{}.estimated_cost_usd must be a non-negative number, got {}",
                        name, estimate
                    )));
                }
            }
            if stage.timeout_secs == Some(0) {
                return Err(Error::Config(format!("stages.{}.timeout_secs must be greater than 0", name)));
            }
        }

        Ok(())
    }
}

fn rebase(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Config file resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. Platform config directory (`<config_dir>/compel-classics/pipeline.toml`)
///
/// The resolved file must exist.
pub fn resolve_config_path(cli_arg: Option<&Path>, env_var_name: &str) -> Result<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return existing(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return existing(PathBuf::from(path));
        }
    }

    // Priority 3: Platform config directory
    let default_path = dirs::config_dir()
        .map(|d| d.join("compel-classics").join("pipeline.toml"))
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
    existing(default_path)
}

fn existing(path: PathBuf) -> Result<PathBuf> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(Error::Config(format!("Config file not found: {}", path.display())))
    }
}
