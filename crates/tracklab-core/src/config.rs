//! Run configuration: where a run lives, how it is delivered, and how the
//! dispatch pipeline is sized.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TracklabError};
use crate::storage;

/// Where logged data ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Deliver to a remote backend supplied by the caller.
    Cloud,
    /// Deliver to the filesystem store under `base_dir`.
    #[default]
    Local,
    /// Only write the local backup file, for a later replay.
    Offline,
    /// Parse and validate, but record nothing.
    Disabled,
}

impl std::str::FromStr for RunMode {
    type Err = TracklabError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cloud" => Ok(RunMode::Cloud),
            "local" => Ok(RunMode::Local),
            "offline" => Ok(RunMode::Offline),
            "disabled" => Ok(RunMode::Disabled),
            other => Err(TracklabError::Config(format!("unknown run mode `{other}`"))),
        }
    }
}

/// What `enqueue` does when a worker queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Block the caller until the worker catches up.
    #[default]
    Block,
    /// Drop the record and count it.
    Drop,
}

/// Sizing and retry behaviour of the dispatch queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Number of parallel delivery workers.
    pub workers: usize,
    /// Queue depth per worker.
    pub queue_capacity: usize,
    /// Records delivered per backend call.
    pub batch_size: usize,
    /// Partial batches are flushed after this many milliseconds.
    pub flush_interval_ms: u64,
    /// Attempts per backend call for transient failures, including the first.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Upper bound on `finish()` waiting for the queue to drain.
    pub drain_timeout_ms: u64,
    pub overflow: OverflowPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            batch_size: 32,
            flush_interval_ms: 500,
            max_attempts: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 5_000,
            drain_timeout_ms: 30_000,
            overflow: OverflowPolicy::Block,
        }
    }
}

impl DispatchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(TracklabError::Config("dispatch.workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(TracklabError::Config(
                "dispatch.queue_capacity must be at least 1".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(TracklabError::Config("dispatch.batch_size must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(TracklabError::Config("dispatch.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Configuration for a single tracked run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Project the run belongs to (e.g. "resnet_cifar10")
    pub project: String,
    /// Display name of this run (timestamp-based if not given)
    pub experiment_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Root directory for local stores and backups
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default)]
    pub mode: RunMode,
    /// Write an append-only backup of every event next to the run
    #[serde(default = "default_true")]
    pub backup: bool,
    /// User hyperparameters, uploaded as the run's config file
    #[serde(default)]
    pub config: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("tracklab_runs")
}

fn default_true() -> bool {
    true
}

impl RunConfig {
    pub fn new(project: impl Into<String>) -> Self {
        let now = chrono::Local::now();
        Self {
            project: project.into(),
            experiment_name: now.format("%Y%m%d_%H%M%S").to_string(),
            description: None,
            tags: Vec::new(),
            base_dir: default_base_dir(),
            mode: RunMode::default(),
            backup: true,
            config: BTreeMap::new(),
            dispatch: DispatchConfig::default(),
        }
    }

    /// Load a config from a YAML file. Missing optional fields take defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RunConfig = serde_yaml::from_str(&content)?;
        config.dispatch.validate()?;
        Ok(config)
    }

    pub fn save_yaml(&self, path: &Path) -> Result<()> {
        storage::save_yaml(path, self)
    }

    /// Apply `TRACKLAB_DIR`, `TRACKLAB_MODE` and `TRACKLAB_PROJECT` overrides.
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(dir) = std::env::var("TRACKLAB_DIR") {
            self.base_dir = PathBuf::from(dir);
        }
        if let Ok(mode) = std::env::var("TRACKLAB_MODE") {
            self.mode = mode.parse()?;
        }
        if let Ok(project) = std::env::var("TRACKLAB_PROJECT") {
            self.project = project;
        }
        Ok(self)
    }

    pub fn with_experiment_name(mut self, name: impl Into<String>) -> Self {
        self.experiment_name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_backup(mut self, backup: bool) -> Self {
        self.backup = backup;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_yaml::Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn project_dir(&self) -> PathBuf {
        self.base_dir.join(&self.project)
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.project_dir().join(run_id)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.project.trim().is_empty() {
            return Err(TracklabError::Config("project name must not be empty".into()));
        }
        self.dispatch.validate()
    }
}
