//! `config.toml` in the data directory.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{OrchestratorError, Result};
use crate::health::HealthConfig;
use crate::scheduler::SchedulerConfig;
use crate::workflow::DEFAULT_MAX_WORKFLOWS;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub workflows: WorkflowSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Deadline for tasks submitted without one; 0 disables it.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_history() -> usize {
    1000
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            max_history: default_max_history(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_interval_secs() -> u64 {
    30
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSection {
    /// Finished workflow results kept for status queries.
    #[serde(default = "default_max_workflows")]
    pub max_history: usize,
}

fn default_max_workflows() -> usize {
    DEFAULT_MAX_WORKFLOWS
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_history: default_max_workflows(),
        }
    }
}

pub fn config_path(dir: &Path) -> PathBuf {
    dir.join("config.toml")
}

impl Config {
    /// Load the config, falling back to defaults when the file is missing.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = config_path(dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let config: Config = toml::from_str(&fs::read_to_string(&path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| OrchestratorError::Validation(e.to_string()))?;
        fs::create_dir_all(dir)?;
        fs::write(config_path(dir), content)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.health.interval_secs == 0 {
            return Err(OrchestratorError::Validation(
                "health.interval_secs must be at least 1".to_string(),
            ));
        }
        if self.health.failure_threshold == 0 {
            return Err(OrchestratorError::Validation(
                "health.failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let timeout = self.scheduler.default_timeout_secs;
        SchedulerConfig {
            default_timeout: (timeout > 0).then(|| Duration::from_secs(timeout)),
            max_history: self.scheduler.max_history,
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_secs(self.health.interval_secs),
            failure_threshold: self.health.failure_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load(tmp.path()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(
            config.scheduler_config().default_timeout,
            Some(Duration::from_secs(300))
        );
        assert_eq!(config.health_config().failure_threshold, 3);
    }

    #[test]
    fn test_partial_file_and_zero_timeout() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            config_path(tmp.path()),
            "[scheduler]\ndefault_timeout_secs = 0\n\n[health]\nfailure_threshold = 5\n",
        )
        .unwrap();
        let config = Config::load(tmp.path()).unwrap();
        assert_eq!(config.scheduler_config().default_timeout, None);
        assert_eq!(config.scheduler.max_history, 1000);
        assert_eq!(config.health.failure_threshold, 5);
        assert_eq!(config.health.interval_secs, 30);
        assert_eq!(config.workflows.max_history, 200);
    }

    #[test]
    fn test_save_round_trip_and_bad_values() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.health.interval_secs = 5;
        config.save(tmp.path()).unwrap();
        assert_eq!(Config::load(tmp.path()).unwrap(), config);

        fs::write(config_path(tmp.path()), "[health]\nfailure_threshold = 0\n").unwrap();
        assert!(Config::load(tmp.path()).is_err());
    }
}
