//! Shared fixtures: an in-memory backend that records every call.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tracklab_core::{
    Backend, BackendError, BackendResult, ColumnInfo, DispatchConfig, FileRecord, LogLine,
    MediaBuffer, MediaRecord, Run, RunConfig, RunInfo, RunMode, RunRegistry, RunState,
    ScalarRecord, SessionProvider,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    RegisterRun(String),
    Columns(Vec<String>),
    Scalars(Vec<(String, u64)>),
    Upload(String),
    Media(Vec<(String, u64)>),
    Logs(Vec<String>),
    File(String),
    State(RunState),
}

#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<Call>>,
    /// Returned, in order, by the next `post_scalars` calls.
    scalar_failures: Mutex<VecDeque<BackendError>>,
    /// Returned by every `post_*` call when set.
    always_fail: Mutex<Option<BackendError>>,
    scalar_delay: Mutex<Option<Duration>>,
    pub scalar_attempts: AtomicU64,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_scalars(self: &Arc<Self>, errors: impl IntoIterator<Item = BackendError>) -> Arc<Self> {
        self.scalar_failures.lock().unwrap().extend(errors);
        Arc::clone(self)
    }

    pub fn fail_always(self: &Arc<Self>, error: BackendError) -> Arc<Self> {
        *self.always_fail.lock().unwrap() = Some(error);
        Arc::clone(self)
    }

    pub fn slow_scalars(self: &Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.scalar_delay.lock().unwrap() = Some(delay);
        Arc::clone(self)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Every delivered scalar as (key, step), in delivery order.
    pub fn scalars(&self) -> Vec<(String, u64)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Scalars(points) => Some(points),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn column_keys(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Columns(keys) => Some(keys),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn final_state(&self) -> Option<RunState> {
        self.calls().into_iter().rev().find_map(|c| match c {
            Call::State(s) => Some(s),
            _ => None,
        })
    }

    fn record(&self, call: Call) -> BackendResult {
        if let Some(err) = self.always_fail.lock().unwrap().clone() {
            return Err(err);
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

impl Backend for RecordingBackend {
    fn register_run(&self, run: &RunInfo) -> BackendResult {
        self.calls.lock().unwrap().push(Call::RegisterRun(run.id.clone()));
        Ok(())
    }

    fn post_columns(&self, columns: &[ColumnInfo]) -> BackendResult {
        self.record(Call::Columns(columns.iter().map(|c| c.key.clone()).collect()))
    }

    fn post_scalars(&self, scalars: &[ScalarRecord]) -> BackendResult {
        self.scalar_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.scalar_delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if let Some(err) = self.scalar_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.record(Call::Scalars(
            scalars.iter().map(|s| (s.key.clone(), s.step)).collect(),
        ))
    }

    fn upload_media(&self, buffer: &MediaBuffer) -> BackendResult {
        self.record(Call::Upload(buffer.path.clone()))
    }

    fn post_media(&self, media: &[MediaRecord]) -> BackendResult {
        self.record(Call::Media(media.iter().map(|m| (m.key.clone(), m.step)).collect()))
    }

    fn post_logs(&self, lines: &[LogLine]) -> BackendResult {
        self.record(Call::Logs(lines.iter().map(|l| l.message.clone()).collect()))
    }

    fn post_file(&self, file: &FileRecord) -> BackendResult {
        self.record(Call::File(file.name.clone()))
    }

    fn update_state(&self, state: RunState) -> BackendResult {
        self.calls.lock().unwrap().push(Call::State(state));
        Ok(())
    }
}

/// Session that reports itself as expiring until refreshed.
#[derive(Default)]
pub struct CountingSession {
    pub refreshes: AtomicU64,
    pub expiring: AtomicBool,
}

impl SessionProvider for CountingSession {
    fn is_expiring_soon(&self) -> bool {
        self.expiring.load(Ordering::SeqCst)
    }

    fn refresh(&self) -> BackendResult {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.expiring.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Dispatch settings that keep tests fast.
pub fn fast_dispatch() -> DispatchConfig {
    DispatchConfig {
        workers: 2,
        queue_capacity: 64,
        batch_size: 8,
        flush_interval_ms: 10,
        max_attempts: 3,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        drain_timeout_ms: 5_000,
        ..Default::default()
    }
}

pub fn config(tmp: &TempDir, mode: RunMode) -> RunConfig {
    RunConfig::new("test_project")
        .with_experiment_name("test_run")
        .with_base_dir(tmp.path())
        .with_mode(mode)
        .with_dispatch(fast_dispatch())
}

/// A run that parses but records nothing.
pub fn disabled_run(tmp: &TempDir) -> Run {
    Run::builder(config(tmp, RunMode::Disabled).with_backup(false))
        .registry(RunRegistry::new())
        .start()
        .expect("Failed to start run")
}

/// A cloud run delivering to `backend`, without a backup file.
pub fn cloud_run(tmp: &TempDir, backend: Arc<RecordingBackend>) -> Run {
    Run::builder(config(tmp, RunMode::Cloud).with_backup(false))
        .registry(RunRegistry::new())
        .backend(backend)
        .start()
        .expect("Failed to start run")
}
