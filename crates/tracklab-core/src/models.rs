//! Data models shared by the run, its observers and the dispatch pipeline.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::{LineValue, MediaBuffer};

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    NotStarted,
    Running,
    Success,
    Crashed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Success | RunState::Crashed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::NotStarted => write!(f, "NOT_STARTED"),
            RunState::Running => write!(f, "RUNNING"),
            RunState::Success => write!(f, "SUCCESS"),
            RunState::Crashed => write!(f, "CRASHED"),
        }
    }
}

/// Type family of a column. Fixed by the first log to a key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChartType {
    Line,
    Text,
    Audio,
    Image,
}

impl ChartType {
    /// Name used in `expected`/`got` error descriptors.
    pub fn type_name(&self) -> &'static str {
        match self {
            ChartType::Line => "float",
            ChartType::Text => "Text",
            ChartType::Audio => "Audio",
            ChartType::Image => "Image",
        }
    }

    /// Column type as the backend knows it.
    pub fn column_type(&self) -> &'static str {
        match self {
            ChartType::Line => "FLOAT",
            ChartType::Text => "TEXT",
            ChartType::Audio => "AUDIO",
            ChartType::Image => "IMAGE",
        }
    }

    pub fn is_media(&self) -> bool {
        matches!(self, ChartType::Audio | ChartType::Image)
    }
}

impl std::fmt::Display for ChartType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

/// In-band error attached to a metric. Never raised.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricError {
    pub expected: Option<String>,
    pub got: Option<String>,
    pub duplicated: bool,
}

impl MetricError {
    pub fn type_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self {
            expected: Some(expected.into()),
            got: Some(got.into()),
            duplicated: false,
        }
    }

    pub fn duplicate() -> Self {
        Self {
            expected: None,
            got: None,
            duplicated: true,
        }
    }
}

impl std::fmt::Display for MetricError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.duplicated {
            return write!(f, "duplicated step");
        }
        write!(
            f,
            "expected {}, got {}",
            self.expected.as_deref().unwrap_or("?"),
            self.got.as_deref().unwrap_or("?")
        )
    }
}

/// Registered column metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnInfo {
    /// Dense id in first-seen order, starting at 0.
    pub kid: usize,
    pub key: String,
    /// URL-safe form of `key`, used in media paths.
    pub key_encoded: String,
    pub chart_type: ChartType,
    /// Prefix before the first `/` of the key, if any.
    pub section: Option<String>,
    /// Set when the first log to this key failed its type check.
    pub error: Option<MetricError>,
}

/// One stored media item: where its buffer goes and its caption.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaEntry {
    pub path: String,
    pub caption: Option<String>,
}

/// Stored payload of a successful metric.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MetricData {
    Line(LineValue),
    Text(Vec<String>),
    Media(Vec<MediaEntry>),
}

/// The outcome of logging one flattened key.
#[derive(Debug, Clone)]
pub struct MetricResult {
    pub data: Option<MetricData>,
    pub error: Option<MetricError>,
    /// Set only when this call created the column and the value failed its
    /// type check; equal to `error` in that case.
    pub column_error: Option<MetricError>,
    pub column_info: ColumnInfo,
    pub metric_step: u64,
    pub metric_epoch: u64,
    pub buffers: Option<Vec<MediaBuffer>>,
    pub created_at: DateTime<Utc>,
}

impl MetricResult {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn key(&self) -> &str {
        &self.column_info.key
    }

    /// Replayable record of this metric, without media bytes.
    pub fn event(&self) -> MetricEvent {
        MetricEvent {
            kid: self.column_info.kid,
            key: self.column_info.key.clone(),
            key_encoded: self.column_info.key_encoded.clone(),
            chart_type: self.column_info.chart_type,
            step: self.metric_step,
            epoch: self.metric_epoch,
            data: self.data.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
        }
    }
}

/// Entry of the run's ordered event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricEvent {
    pub kid: usize,
    pub key: String,
    pub key_encoded: String,
    pub chart_type: ChartType,
    pub step: u64,
    pub epoch: u64,
    pub data: Option<MetricData>,
    pub error: Option<MetricError>,
    pub created_at: DateTime<Utc>,
}

/// Static description of a run, handed to observers on start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunInfo {
    pub id: String,
    pub project: String,
    pub experiment_name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub run_dir: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// Hyperparameters and host metadata of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RuntimeInfo {
    pub config: Option<serde_yaml::Value>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// A console line attached to the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
    pub epoch: u64,
    pub created_at: DateTime<Utc>,
}

/// Passed to observers when the run stops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StopInfo {
    pub run_id: String,
    pub state: RunState,
    pub error: Option<String>,
    pub epoch: u64,
}

/// How well the run's records reached the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Complete,
    /// Some batches were rejected or exhausted their retries.
    Degraded { failures: u64, last_error: String },
    /// The drain on finish timed out; pending records were dropped.
    Abandoned,
}

/// Terminal record returned by `Run::finish`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub id: String,
    pub project: String,
    pub experiment_name: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    /// Number of `log` calls made.
    pub epochs: u64,
    pub error: Option<String>,
    pub delivery: DeliveryStatus,
}
