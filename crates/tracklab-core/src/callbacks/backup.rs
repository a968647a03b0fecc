use std::path::{Path, PathBuf};

use crate::backup::{BackupEntry, BackupWriter};
use crate::callback::RunCallback;
use crate::dispatch::DeliverySignal;
use crate::error::Result;
use crate::models::{ColumnInfo, LogLine, MetricResult, RunInfo, RunState, RuntimeInfo, StopInfo};
use crate::run::ABANDONED_ERROR;

/// Writes every run event to an append-only backup file.
pub struct BackupCallback {
    writer: BackupWriter,
    signal: Option<DeliverySignal>,
}

impl BackupCallback {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            writer: BackupWriter::open(path)?,
            signal: None,
        })
    }

    /// Record the final state as delivery left it: an abandoned drain makes
    /// the stop entry `CRASHED`.
    pub fn with_signal(mut self, signal: DeliverySignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn path(&self) -> &Path {
        self.writer.path()
    }

    fn write(&mut self, entry: BackupEntry) -> anyhow::Result<()> {
        self.writer.append(&entry)?;
        Ok(())
    }
}

impl RunCallback for BackupCallback {
    fn name(&self) -> &str {
        "backup"
    }

    fn on_run(&mut self, run: &RunInfo) -> anyhow::Result<()> {
        self.write(BackupEntry::Run { run: run.clone() })
    }

    fn on_column_create(&mut self, column: &ColumnInfo) -> anyhow::Result<()> {
        self.write(BackupEntry::Column {
            column: column.clone(),
        })
    }

    fn on_metric_create(&mut self, metric: &MetricResult) -> anyhow::Result<()> {
        self.write(BackupEntry::Metric {
            event: metric.event(),
            buffers: metric.buffers.clone().unwrap_or_default(),
        })
    }

    fn on_runtime_info_update(&mut self, info: &RuntimeInfo) -> anyhow::Result<()> {
        self.write(BackupEntry::Runtime { info: info.clone() })
    }

    fn on_log_line(&mut self, line: &LogLine) -> anyhow::Result<()> {
        self.write(BackupEntry::Log { line: line.clone() })
    }

    fn on_stop(&mut self, stop: &StopInfo) -> anyhow::Result<()> {
        let mut stop = stop.clone();
        if self.signal.as_ref().is_some_and(DeliverySignal::is_abandoned) {
            stop.state = RunState::Crashed;
            stop.error.get_or_insert_with(|| ABANDONED_ERROR.into());
        }
        self.write(BackupEntry::Stop { stop })
    }
}
