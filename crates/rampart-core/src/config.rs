//! TOML configuration: controller tuning (`rampart.toml`) and rollout plans.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{Stage, StageCatalog, Threshold};

/// Errors reading or parsing a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })
}

/// Controller tuning. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Cadence of the per-rollout control loop.
    pub tick_interval_secs: u64,
    /// Samples older than this are ignored (and so count as missing).
    pub freshness_window_secs: u64,
    /// Bound on each MetricSource query and TrafficRouter call.
    pub call_timeout_ms: u64,
    /// Router attempts per tick, for both advances and restores.
    pub router_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Wall-clock budget for a failing advance before rolling back.
    /// Unset means the advance is retried on every tick without limit.
    pub advance_retry_budget_secs: Option<u64>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
            freshness_window_secs: 60,
            call_timeout_ms: 5000,
            router_attempts: 3,
            backoff_base_ms: 200,
            backoff_max_ms: 5000,
            advance_retry_budget_secs: None,
        }
    }
}

impl ControllerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&read_file(path)?)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// One stage as written in a plan file. Indices come from position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePlan {
    pub weight: u32,
    pub min_soak_secs: i64,
    #[serde(default)]
    pub thresholds: BTreeMap<String, Threshold>,
}

/// A rollout request: the two variants and the stage sequence.
///
/// ```toml
/// stable = "api-blue"
/// candidate = "api-green"
///
/// [[stages]]
/// weight = 10
/// min_soak_secs = 60
/// thresholds.error_rate = { op = "<=", limit = 0.01 }
///
/// [[stages]]
/// weight = 100
/// min_soak_secs = 120
/// thresholds.error_rate = { op = "<=", limit = 0.01 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutPlan {
    pub stable: String,
    pub candidate: String,
    #[serde(default)]
    pub stages: Vec<StagePlan>,
}

impl RolloutPlan {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&read_file(path)?)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }


    /// Build the (unvalidated) catalog described by this plan.
    pub fn catalog(&self) -> StageCatalog {
        StageCatalog::from_stages(
            self.stages
                .iter()
                .enumerate()
                .map(|(index, s)| Stage {
                    index,
                    target_weight_percent: s.weight,
                    min_soak_secs: s.min_soak_secs,
                    thresholds: s.thresholds.clone(),
                })
                .collect(),
        )
    }
}
