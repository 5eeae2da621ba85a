use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use safeguard_domain::RunId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_ENGINE_VERSION: &str = concat!("safeguard.v", env!("CARGO_PKG_VERSION"));

/// Engine-wide settings. Every field has a default, so a YAML file only
/// needs the keys it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub engine_version: String,
    /// Expiry applied to every gate request. `None` means gates wait forever.
    pub gate_timeout_ms: Option<u64>,
    pub rollback: RollbackConfig,
    pub checkpoint: CheckpointConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_version: DEFAULT_ENGINE_VERSION.to_string(),
            gate_timeout_ms: None,
            rollback: RollbackConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a YAML document on top of the defaults.
    ///
    /// # Errors
    /// Returns an error on malformed YAML, unknown keys or invalid values.
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let config: Self = if source.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(source).context("invalid engine config")?
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config at {}", path.display()))?;
        Self::from_yaml_str(&source)
    }

    /// # Errors
    /// Returns an error when a value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.engine_version.trim().is_empty() {
            return Err(anyhow!("engine_version MUST be non-empty"));
        }
        if self.rollback.max_attempts == 0 {
            return Err(anyhow!("rollback.max_attempts MUST be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RollbackConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
        }
    }
}

impl RollbackConfig {
    /// Delay before retrying after failed attempt number `attempt` (1-based); doubles each time.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointConfig {
    pub max_read_skew_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_read_skew_ms: 1_000,
        }
    }
}

/// Per-run inputs that are not part of the change set itself.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub run_id: Option<RunId>,
    pub external_correlation_id: Option<String>,
    pub requested_by: String,
    pub cli_args_json: Value,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            external_correlation_id: None,
            requested_by: "operator".to_string(),
            cli_args_json: Value::Object(Map::default()),
        }
    }
}
