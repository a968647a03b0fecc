//! Append-only backup of a run's events, one JSON document per line.
//!
//! The backup carries everything needed to deliver the run later: column
//! definitions, metrics with their media bytes (base64), runtime info, log
//! lines and the final state. [`replay`] sends a backup to any backend.

use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::Backend;
use crate::data::MediaBuffer;
use crate::error::Result;
use crate::models::{
    ColumnInfo, LogLevel, LogLine, MetricEvent, RunInfo, RunState, RuntimeInfo, StopInfo,
};
use crate::record::{FileRecord, UploadRecord};

pub const BACKUP_FILE: &str = "backup.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackupEntry {
    Run {
        run: RunInfo,
    },
    Column {
        column: ColumnInfo,
    },
    Metric {
        event: MetricEvent,
        #[serde(default)]
        buffers: Vec<MediaBuffer>,
    },
    Runtime {
        info: RuntimeInfo,
    },
    Log {
        line: LogLine,
    },
    Stop {
        stop: StopInfo,
    },
}

pub struct BackupWriter {
    path: PathBuf,
    writer: BufWriter<fs::File>,
}

impl BackupWriter {
    /// Open (or create) a backup file for appending.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one entry and flush it, so a crash loses at most the line being
    /// written.
    pub fn append(&mut self, entry: &BackupEntry) -> Result<()> {
        serde_json::to_writer(&mut self.writer, entry)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Read all entries of a backup. Lines that do not parse (typically a
/// truncated last line) are skipped with a warning.
pub fn read_entries(path: &Path) -> Result<Vec<BackupEntry>> {
    Ok(read_counted(path)?.0)
}

fn read_counted(path: &Path) -> Result<(Vec<BackupEntry>, usize)> {
    let reader = BufReader::new(fs::File::open(path)?);
    let mut entries = Vec::new();
    let mut skipped = 0;
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<BackupEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                skipped += 1;
                warn!(line = idx + 1, error = %e, "Skipping malformed backup line");
            }
        }
    }
    Ok((entries, skipped))
}

/// Counts of what a replay delivered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayReport {
    pub columns: usize,
    pub scalars: usize,
    pub media: usize,
    pub logs: usize,
    pub files: usize,
    /// Errored metrics in the backup; they are never delivered.
    pub errored: usize,
    pub skipped_lines: usize,
    pub final_state: Option<RunState>,
}

/// Re-deliver a backup to `backend` in file order. Stops at the first
/// backend error.
pub fn replay(path: &Path, backend: &dyn Backend) -> Result<ReplayReport> {
    let (entries, skipped) = read_counted(path)?;
    let mut report = ReplayReport {
        skipped_lines: skipped,
        ..Default::default()
    };

    for entry in entries {
        match entry {
            BackupEntry::Run { run } => {
                info!(run = %run.id, project = %run.project, "Replaying run");
                backend.register_run(&run)?;
            }
            BackupEntry::Column { column } => {
                backend.post_columns(std::slice::from_ref(&column))?;
                report.columns += 1;
            }
            BackupEntry::Metric { event, buffers } => {
                match UploadRecord::from_metric(&event, Some(&buffers)) {
                    Some(UploadRecord::Scalar(scalar)) => {
                        backend.post_scalars(std::slice::from_ref(&scalar))?;
                        report.scalars += 1;
                    }
                    Some(UploadRecord::Media(media)) => {
                        for buffer in &media.buffers {
                            backend.upload_media(buffer)?;
                        }
                        backend.post_media(std::slice::from_ref(&media))?;
                        report.media += 1;
                    }
                    _ => report.errored += 1,
                }
            }
            BackupEntry::Runtime { info } => {
                for file in FileRecord::from_runtime(&info) {
                    backend.post_file(&file)?;
                    report.files += 1;
                }
            }
            BackupEntry::Log { line } => {
                backend.post_logs(std::slice::from_ref(&line))?;
                report.logs += 1;
            }
            BackupEntry::Stop { stop } => {
                if let Some(error) = &stop.error {
                    backend.post_logs(&[LogLine {
                        level: LogLevel::Error,
                        message: error.clone(),
                        epoch: stop.epoch,
                        created_at: Utc::now(),
                    }])?;
                    report.logs += 1;
                }
                backend.update_state(stop.state)?;
                report.final_state = Some(stop.state);
            }
        }
    }

    info!(
        columns = report.columns,
        scalars = report.scalars,
        media = report.media,
        skipped = report.skipped_lines,
        "Replay finished"
    );
    Ok(report)
}
