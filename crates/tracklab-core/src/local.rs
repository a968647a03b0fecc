//! Filesystem backend used by `local` mode.
//!
//! Layout under the run directory:
//!
//! ```text
//! run.yaml            run metadata and final status
//! columns.yaml        registered columns
//! metrics.parquet     scalar metrics (key, step, epoch, value, sentinel, timestamp)
//! media/<path>        uploaded media buffers
//! media/index.jsonl   media metric records (without bytes)
//! run.log             console lines
//! files/<name>        config and host metadata
//! ```

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;

use crate::backend::{Backend, BackendResult};
use crate::data::MediaBuffer;
use crate::error::{BackendError, Result};
use crate::models::{ChartType, ColumnInfo, LogLine, MetricData, RunInfo, RunState};
use crate::record::{FileRecord, MediaRecord, ScalarRecord};
use crate::storage::{self, RunMetadata};

pub struct LocalBackend {
    run_dir: PathBuf,
    // Workers call in parallel; every file here is read-modify-write.
    io_lock: Mutex<()>,
}

/// Media record as written to `media/index.jsonl`.
#[derive(Serialize)]
struct MediaIndexEntry<'a> {
    key: &'a str,
    chart_type: ChartType,
    step: u64,
    epoch: u64,
    data: &'a MetricData,
}

impl LocalBackend {
    pub fn new(run_dir: impl Into<PathBuf>) -> Result<Self> {
        let run_dir = run_dir.into();
        storage::ensure_dir(&run_dir)?;
        storage::ensure_dir(&run_dir.join("media"))?;
        storage::ensure_dir(&run_dir.join("files"))?;
        Ok(Self {
            run_dir,
            io_lock: Mutex::new(()),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.run_dir.join("metrics.parquet")
    }

    pub fn columns_path(&self) -> PathBuf {
        self.run_dir.join("columns.yaml")
    }

    pub fn media_dir(&self) -> PathBuf {
        self.run_dir.join("media")
    }

    pub fn log_path(&self) -> PathBuf {
        self.run_dir.join("run.log")
    }

    pub fn files_dir(&self) -> PathBuf {
        self.run_dir.join("files")
    }

    fn locked<T>(&self, f: impl FnOnce() -> Result<T>) -> std::result::Result<T, BackendError> {
        let _guard = self.io_lock.lock().unwrap_or_else(|e| e.into_inner());
        f().map_err(BackendError::from)
    }
}

/// Reject absolute paths and `..` so buffers cannot escape the media dir.
fn safe_relative(path: &str) -> std::result::Result<&Path, BackendError> {
    let p = Path::new(path);
    if p.components().all(|c| matches!(c, Component::Normal(_))) {
        Ok(p)
    } else {
        Err(BackendError::Fatal {
            status: 400,
            message: format!("invalid media path `{path}`"),
        })
    }
}

impl Backend for LocalBackend {
    fn register_run(&self, run: &RunInfo) -> BackendResult {
        self.locked(|| {
            let meta = RunMetadata {
                id: run.id.clone(),
                project: run.project.clone(),
                experiment_name: run.experiment_name.clone(),
                status: RunState::Running,
                started_at: run.started_at,
                finished_at: None,
                duration_secs: None,
                description: run.description.clone(),
                tags: run.tags.clone(),
            };
            storage::save_run_metadata(&self.run_dir, &meta)
        })
    }

    fn post_columns(&self, columns: &[ColumnInfo]) -> BackendResult {
        self.locked(|| {
            let path = self.columns_path();
            let mut existing: Vec<ColumnInfo> = storage::load_yaml(&path)?;
            for column in columns {
                if !existing.iter().any(|c| c.key == column.key) {
                    existing.push(column.clone());
                }
            }
            storage::save_yaml(&path, &existing)
        })
    }

    fn post_scalars(&self, scalars: &[ScalarRecord]) -> BackendResult {
        self.locked(|| storage::append_scalars(&self.metrics_path(), scalars))
    }

    fn upload_media(&self, buffer: &MediaBuffer) -> BackendResult {
        let relative = safe_relative(&buffer.path)?;
        let dest = self.media_dir().join(relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&dest, &buffer.bytes)?;
        Ok(())
    }

    fn post_media(&self, media: &[MediaRecord]) -> BackendResult {
        let entries: Vec<MediaIndexEntry<'_>> = media
            .iter()
            .map(|m| MediaIndexEntry {
                key: &m.key,
                chart_type: m.chart_type,
                step: m.step,
                epoch: m.epoch,
                data: &m.data,
            })
            .collect();
        self.locked(|| storage::append_jsonl(&self.media_dir().join("index.jsonl"), &entries))
    }

    fn post_logs(&self, lines: &[LogLine]) -> BackendResult {
        self.locked(|| storage::append_log_lines(&self.log_path(), lines))
    }

    fn post_file(&self, file: &FileRecord) -> BackendResult {
        let relative = safe_relative(&file.name)?;
        fs::write(self.files_dir().join(relative), &file.contents)?;
        Ok(())
    }

    fn update_state(&self, state: RunState) -> BackendResult {
        self.locked(|| {
            let mut meta = storage::load_run_metadata(&self.run_dir)?;
            let finished_at = Utc::now();
            meta.status = state;
            meta.finished_at = Some(finished_at);
            meta.duration_secs =
                Some((finished_at - meta.started_at).num_milliseconds() as f64 / 1000.0);
            storage::save_run_metadata(&self.run_dir, &meta)
        })
    }
}
