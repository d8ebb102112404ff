//! `shipyard.toml` loading and validation.

use serde::Deserialize;
use shipyard_core::{AutonomyLevel, ShipyardError, ShipyardResult};
use shipyard_orchestrator::{ExecutorConfig, OrchestratorConfig};
use shipyard_phases::ValidatorConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShipyardConfig {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub events: EventsSection,
    #[serde(default)]
    pub validation: ValidationSection,
    #[serde(default)]
    pub storage: StorageSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    #[serde(default = "default_project_id")]
    pub id: String,
    #[serde(default = "default_goal")]
    pub goal: String,
    /// Escalation policy: `low`, `medium` or `high`.
    #[serde(default = "default_autonomy")]
    pub autonomy: String,
    /// Sign-off policy, 1 (always) to 5 (never).
    #[serde(default = "default_approval_level")]
    pub approval_level: u8,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            id: default_project_id(),
            goal: default_goal(),
            autonomy: default_autonomy(),
            approval_level: default_approval_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            task_timeout_secs: default_task_timeout_secs(),
            max_retries: default_max_retries(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsSection {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationSection {
    #[serde(default = "default_coverage_threshold")]
    pub coverage_threshold: f64,
    #[serde(default = "default_coverage_margin")]
    pub coverage_margin: f64,
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            coverage_threshold: default_coverage_threshold(),
            coverage_margin: default_coverage_margin(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_project_id() -> String {
    "demo".to_string()
}
fn default_goal() -> String {
    "Build a task-tracking web application".to_string()
}
fn default_autonomy() -> String {
    "medium".to_string()
}
fn default_approval_level() -> u8 {
    3
}
fn default_workers() -> usize {
    4
}
fn default_task_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_history_capacity() -> usize {
    shipyard_events::DEFAULT_HISTORY_CAPACITY
}
fn default_coverage_threshold() -> f64 {
    shipyard_phases::validator::DEFAULT_COVERAGE_THRESHOLD
}
fn default_coverage_margin() -> f64 {
    shipyard_phases::validator::DEFAULT_COVERAGE_MARGIN
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl ShipyardConfig {
    pub fn parse(content: &str) -> ShipyardResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ShipyardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, falling back to defaults when it does not exist.
    pub async fn load(path: &Path) -> ShipyardResult<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    pub fn validate(&self) -> ShipyardResult<()> {
        if self.project.id.trim().is_empty() {
            return Err(ShipyardError::Config("project.id must not be empty".into()));
        }
        self.autonomy()?;
        if !(1..=5).contains(&self.project.approval_level) {
            return Err(ShipyardError::Config(format!(
                "project.approval_level must be between 1 and 5, got {}",
                self.project.approval_level
            )));
        }
        if self.executor.workers == 0 {
            return Err(ShipyardError::Config("executor.workers must be at least 1".into()));
        }
        if self.executor.task_timeout_secs == 0 {
            return Err(ShipyardError::Config(
                "executor.task_timeout_secs must be at least 1".into(),
            ));
        }
        if self.events.history_capacity == 0 {
            return Err(ShipyardError::Config(
                "events.history_capacity must be at least 1".into(),
            ));
        }
        let v = &self.validation;
        if !(0.0..=100.0).contains(&v.coverage_threshold) || v.coverage_margin < 0.0 {
            return Err(ShipyardError::Config(format!(
                "invalid coverage settings: threshold {} margin {}",
                v.coverage_threshold, v.coverage_margin
            )));
        }
        Ok(())
    }

    pub fn autonomy(&self) -> ShipyardResult<AutonomyLevel> {
        AutonomyLevel::parse_level(&self.project.autonomy).ok_or_else(|| {
            ShipyardError::Config(format!(
                "project.autonomy must be low, medium or high, got '{}'",
                self.project.autonomy
            ))
        })
    }

    pub fn orchestrator_config(&self) -> ShipyardResult<OrchestratorConfig> {
        Ok(
            OrchestratorConfig::new(self.project.id.clone(), self.project.goal.clone())
                .with_autonomy(self.autonomy()?),
        )
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::default()
            .with_workers(self.executor.workers)
            .with_task_timeout(Duration::from_secs(self.executor.task_timeout_secs))
            .with_max_retries(self.executor.max_retries)
            .with_poll_interval(Duration::from_millis(self.executor.poll_interval_ms))
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig::default()
            .with_coverage_threshold(self.validation.coverage_threshold)
            .with_coverage_margin(self.validation.coverage_margin)
    }
}
