//! Typed records carried by the dispatch queue and accepted by backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::{LineValue, MediaBuffer};
use crate::models::{ChartType, ColumnInfo, LogLine, MetricData, MetricEvent, RuntimeInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadKind {
    Column,
    ScalarMetric,
    MediaMetric,
    Log,
    File,
}

/// One scalar point of a line column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalarRecord {
    pub key: String,
    pub step: u64,
    pub epoch: u64,
    pub value: LineValue,
    pub created_at: DateTime<Utc>,
}

/// One text or media metric. Media buffers must be uploaded before the
/// record itself is posted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaRecord {
    pub key: String,
    pub key_encoded: String,
    pub chart_type: ChartType,
    pub step: u64,
    pub epoch: u64,
    pub data: MetricData,
    pub buffers: Vec<MediaBuffer>,
    pub created_at: DateTime<Utc>,
}

/// A named file attached to the run (config, host metadata).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub name: String,
    pub contents: String,
}

impl FileRecord {
    /// Files describing the run's hyperparameters and host.
    pub fn from_runtime(info: &RuntimeInfo) -> Vec<FileRecord> {
        let mut files = Vec::new();
        if let Some(config) = &info.config {
            match serde_yaml::to_string(config) {
                Ok(contents) => files.push(FileRecord {
                    name: "config.yaml".into(),
                    contents,
                }),
                Err(e) => tracing::warn!(error = %e, "cannot serialize run config"),
            }
        }
        if let Some(metadata) = &info.metadata {
            match serde_json::to_string_pretty(metadata) {
                Ok(contents) => files.push(FileRecord {
                    name: "metadata.json".into(),
                    contents,
                }),
                Err(e) => tracing::warn!(error = %e, "cannot serialize run metadata"),
            }
        }
        files
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadRecord {
    Column(ColumnInfo),
    Scalar(ScalarRecord),
    Media(MediaRecord),
    Log(LogLine),
    File(FileRecord),
}

impl UploadRecord {
    pub fn kind(&self) -> UploadKind {
        match self {
            UploadRecord::Column(_) => UploadKind::Column,
            UploadRecord::Scalar(_) => UploadKind::ScalarMetric,
            UploadRecord::Media(_) => UploadKind::MediaMetric,
            UploadRecord::Log(_) => UploadKind::Log,
            UploadRecord::File(_) => UploadKind::File,
        }
    }

    /// Records with the same shard key are delivered by the same worker, in
    /// enqueue order. A column's definition and all its metrics share one.
    pub fn shard_key(&self) -> &str {
        match self {
            UploadRecord::Column(c) => &c.key,
            UploadRecord::Scalar(s) => &s.key,
            UploadRecord::Media(m) => &m.key,
            UploadRecord::Log(_) => "__log__",
            UploadRecord::File(_) => "__file__",
        }
    }

    /// Build the delivery record for a metric event. Errored events carry
    /// nothing to deliver.
    pub fn from_metric(event: &MetricEvent, buffers: Option<&[MediaBuffer]>) -> Option<Self> {
        if event.error.is_some() {
            return None;
        }
        match event.data.as_ref()? {
            MetricData::Line(value) => Some(UploadRecord::Scalar(ScalarRecord {
                key: event.key.clone(),
                step: event.step,
                epoch: event.epoch,
                value: *value,
                created_at: event.created_at,
            })),
            data => Some(UploadRecord::Media(MediaRecord {
                key: event.key.clone(),
                key_encoded: event.key_encoded.clone(),
                chart_type: event.chart_type,
                step: event.step,
                epoch: event.epoch,
                data: data.clone(),
                buffers: buffers.map(<[MediaBuffer]>::to_vec).unwrap_or_default(),
                created_at: event.created_at,
            })),
        }
    }
}
