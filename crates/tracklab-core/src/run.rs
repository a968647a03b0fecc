//! Run state machine: the entry point for logging.
//!
//! A `Run` owns the column registry, the step sequencer and the observer
//! list. `log()` parses a mapping, registers and checks columns, assigns
//! steps, and fans each result out to the observers. It never fails: bad
//! values come back as errored `MetricResult`s.
//!
//! Only one run may be active per [`RunRegistry`]. The process-wide registry
//! is [`RunRegistry::global`]; tests inject their own.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, SessionProvider, StaticSession};
use crate::backup::BACKUP_FILE;
use crate::callback::{CallbackId, CallbackRegistry, Hooked, RunCallback};
use crate::callbacks::{BackupCallback, ConsoleCallback, UploadCallback};
use crate::column::ColumnRegistry;
use crate::config::{RunConfig, RunMode};
use crate::data::parser::{self, Parsed};
use crate::data::{LogData, MediaBuffer, Value};
use crate::dispatch::DeliverySignal;
use crate::error::{Result, TracklabError};
use crate::local::LocalBackend;
use crate::models::{
    ChartType, ColumnInfo, DeliveryStatus, LogLevel, LogLine, MediaEntry, MetricData, MetricError,
    MetricEvent, MetricResult, RunInfo, RunRecord, RunState, RuntimeInfo, StopInfo,
};
use crate::step::StepSequencer;

pub(crate) const ABANDONED_ERROR: &str = "pending records abandoned after drain timeout";

// ─── Registry ─────────────────────────────────────────────────────────────────

/// Shared view of a run, readable from any thread.
#[derive(Debug)]
pub struct RunHandle {
    id: String,
    project: String,
    experiment_name: String,
    run_dir: PathBuf,
    started_at: DateTime<Utc>,
    state: Mutex<RunState>,
}

impl RunHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn experiment_name(&self) -> &str {
        &self.experiment_name
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: RunState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

/// Holds the active run. Cloning shares the slot.
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    slot: Arc<Mutex<Option<Arc<RunHandle>>>>,
}

static GLOBAL_REGISTRY: OnceLock<RunRegistry> = OnceLock::new();

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by `tracklab::init`.
    pub fn global() -> &'static RunRegistry {
        GLOBAL_REGISTRY.get_or_init(RunRegistry::new)
    }

    /// The active run, if any.
    pub fn current(&self) -> Option<Arc<RunHandle>> {
        self.lock().clone()
    }

    pub fn state(&self) -> Option<RunState> {
        self.current().map(|h| h.state())
    }

    /// Forget the active run without finishing it.
    pub fn reset(&self) {
        if let Some(handle) = self.lock().take() {
            debug!(run = %handle.id, "Run registry reset");
        }
    }

    fn claim(&self, handle: Arc<RunHandle>) -> Result<()> {
        let mut slot = self.lock();
        if let Some(active) = slot.as_ref() {
            if !active.state().is_terminal() {
                return Err(TracklabError::AlreadyInitialized);
            }
        }
        *slot = Some(handle);
        Ok(())
    }

    fn release(&self, id: &str) {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|h| h.id == id) {
            *slot = None;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Arc<RunHandle>>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ─── Builder ──────────────────────────────────────────────────────────────────

pub struct RunBuilder {
    config: RunConfig,
    registry: Option<RunRegistry>,
    callbacks: Vec<Box<dyn RunCallback>>,
    backend: Option<Arc<dyn Backend>>,
    session: Option<Arc<dyn SessionProvider>>,
}

impl RunBuilder {
    /// Use `registry` instead of the process-wide one.
    pub fn registry(mut self, registry: RunRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Add an observer after the built-in ones.
    pub fn callback(mut self, callback: impl RunCallback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    /// Deliver to `backend`. Required in cloud mode; replaces the
    /// filesystem store in local mode.
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn session(mut self, session: Arc<dyn SessionProvider>) -> Self {
        self.session = Some(session);
        self
    }

    /// Claim the registry, wire the observers and move the run to `RUNNING`.
    pub fn start(self) -> Result<Run> {
        self.config.validate()?;
        let registry = self.registry.clone().unwrap_or_else(|| RunRegistry::global().clone());

        let id = Uuid::new_v4().simple().to_string();
        let run_dir = self.config.run_dir(&id);
        let handle = Arc::new(RunHandle {
            id: id.clone(),
            project: self.config.project.clone(),
            experiment_name: self.config.experiment_name.clone(),
            run_dir: run_dir.clone(),
            started_at: Utc::now(),
            state: Mutex::new(RunState::NotStarted),
        });
        registry.claim(Arc::clone(&handle))?;

        let signal = DeliverySignal::new();
        let mut callbacks = match self.wire_callbacks(&run_dir, &signal) {
            Ok(callbacks) => callbacks,
            Err(e) => {
                registry.release(&id);
                return Err(e);
            }
        };
        for callback in self.callbacks {
            callbacks.register(callback);
        }

        let info = RunInfo {
            id,
            project: handle.project.clone(),
            experiment_name: handle.experiment_name.clone(),
            description: self.config.description.clone(),
            tags: self.config.tags.clone(),
            run_dir,
            started_at: handle.started_at,
        };

        let mut run = Run {
            runtime: RuntimeInfo {
                config: None,
                metadata: Some(host_metadata()),
            },
            info,
            config: self.config,
            handle,
            registry,
            callbacks,
            columns: ColumnRegistry::new(),
            steps: StepSequencer::new(),
            events: Vec::new(),
            signal,
            record: None,
        };
        run.runtime.config = run.config_value();

        run.callbacks.on_init(&run.info);
        run.handle.set_state(RunState::Running);
        run.callbacks.on_run(&run.info);
        run.callbacks.on_runtime_info_update(&run.runtime);

        info!(
            run = %run.info.id,
            project = %run.info.project,
            mode = ?run.config.mode,
            "Run initialized"
        );
        Ok(run)
    }

    fn wire_callbacks(&self, run_dir: &Path, signal: &DeliverySignal) -> Result<CallbackRegistry> {
        let mut registry = CallbackRegistry::new();
        registry.register(Box::new(ConsoleCallback::new()));

        let backend: Option<Arc<dyn Backend>> = match self.config.mode {
            RunMode::Cloud => Some(self.backend.clone().ok_or_else(|| {
                TracklabError::Config("cloud mode requires a backend".into())
            })?),
            RunMode::Local => match &self.backend {
                Some(backend) => Some(Arc::clone(backend)),
                None => Some(Arc::new(LocalBackend::new(run_dir)?) as Arc<dyn Backend>),
            },
            RunMode::Offline | RunMode::Disabled => None,
        };

        let upload = match backend {
            Some(backend) => {
                let session = self
                    .session
                    .clone()
                    .unwrap_or_else(|| Arc::new(StaticSession) as Arc<dyn SessionProvider>);
                Some(UploadCallback::new(backend, session, &self.config.dispatch, signal.clone())?)
            }
            None => None,
        };

        let backup = if self.config.backup && self.config.mode != RunMode::Disabled {
            Some(BackupCallback::new(run_dir.join(BACKUP_FILE))?.with_signal(signal.clone()))
        } else {
            None
        };

        // The backup runs after each upload call, so its stop entry sees the
        // drained state. Hooks still run when the upload call fails.
        match (upload, backup) {
            (Some(upload), Some(backup)) => {
                registry.register(Box::new(Hooked::new(Box::new(upload)).after(Box::new(backup))));
            }
            (Some(upload), None) => {
                registry.register(Box::new(upload));
            }
            (None, Some(backup)) => {
                registry.register(Box::new(backup));
            }
            (None, None) => {}
        }
        Ok(registry)
    }
}

fn host_metadata() -> serde_json::Value {
    serde_json::json!({
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "pid": std::process::id(),
        "sdk_version": env!("CARGO_PKG_VERSION"),
    })
}

// ─── Run ──────────────────────────────────────────────────────────────────────

pub struct Run {
    info: RunInfo,
    config: RunConfig,
    handle: Arc<RunHandle>,
    registry: RunRegistry,
    callbacks: CallbackRegistry,
    columns: ColumnRegistry,
    steps: StepSequencer,
    events: Vec<MetricEvent>,
    runtime: RuntimeInfo,
    signal: DeliverySignal,
    record: Option<RunRecord>,
}

impl Run {
    pub fn builder(config: RunConfig) -> RunBuilder {
        RunBuilder {
            config,
            registry: None,
            callbacks: Vec::new(),
            backend: None,
            session: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn info(&self) -> &RunInfo {
        &self.info
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.handle.state()
    }

    pub fn handle(&self) -> Arc<RunHandle> {
        Arc::clone(&self.handle)
    }

    pub fn run_dir(&self) -> &Path {
        &self.info.run_dir
    }

    /// Registered columns in creation order.
    pub fn columns(&self) -> &ColumnRegistry {
        &self.columns
    }

    /// Accepted steps of `key`, in acceptance order.
    pub fn steps(&self, key: &str) -> Vec<u64> {
        self.steps.steps(key)
    }

    /// Every metric logged so far, errored ones included, in log order.
    pub fn events(&self) -> &[MetricEvent] {
        &self.events
    }

    /// Number of `log` calls so far.
    pub fn epoch(&self) -> u64 {
        self.steps.epoch()
    }

    pub fn delivery(&self) -> DeliveryStatus {
        self.signal.status()
    }

    /// The terminal record, once finished.
    pub fn record(&self) -> Option<&RunRecord> {
        self.record.as_ref()
    }

    pub fn register_callback(&mut self, callback: Box<dyn RunCallback>) -> CallbackId {
        self.callbacks.register(callback)
    }

    pub fn unregister_callback(&mut self, id: CallbackId) -> Option<Box<dyn RunCallback>> {
        self.callbacks.unregister(id)
    }

    /// Log a mapping of values. Each flattened key yields one result, in
    /// insertion order. Dropped with a warning when the run is not running.
    pub fn log(&mut self, data: impl Into<LogData>, step: Option<u64>) -> IndexMap<String, MetricResult> {
        let state = self.state();
        if state != RunState::Running {
            warn!(run = %self.info.id, %state, "Run is not running, log call dropped");
            return IndexMap::new();
        }

        let data = data.into();
        let epoch = self.steps.next_epoch();
        // Leaves that flatten or normalize to the same key collapse into one;
        // the last value wins.
        let mut leaves: IndexMap<String, &Value> = IndexMap::with_capacity(data.len());
        for (raw_key, value) in parser::flatten(&data) {
            match parser::normalize_key(&raw_key) {
                Some(key) => {
                    if leaves.insert(key, value).is_some() {
                        debug!(key = %raw_key, "Duplicate key in log call, last value kept");
                    }
                }
                None => warn!(key = %raw_key, "Invalid metric key, skipped"),
            }
        }

        let mut results = IndexMap::with_capacity(leaves.len());
        for (key, value) in leaves {
            let result = self.log_one(&key, value, step, epoch);
            self.callbacks.on_metric_create(&result);
            self.events.push(result.event());
            results.insert(key, result);
        }
        results
    }

    fn log_one(&mut self, key: &str, value: &Value, step: Option<u64>, epoch: u64) -> MetricResult {
        let created_at = Utc::now();
        let existing = self.columns.get(key).map(|c| c.chart_type);

        // Column type for a key seen for the first time: the parsed family, or
        // the family the failed value hinted at.
        let (parsed, error, column_error, chart_type) = match (parser::parse_value(value), existing) {
            (Ok(parsed), Some(chart_type)) => match self.columns.check_type(key, parsed.chart_type()) {
                Ok(()) => (Some(parsed), None, None, chart_type),
                Err(err) => {
                    debug!(key, expected = %chart_type, "Column type mismatch");
                    (None, Some(err), None, chart_type)
                }
            },
            (Ok(parsed), None) => {
                let chart_type = parsed.chart_type();
                (Some(parsed), None, None, chart_type)
            }
            (Err(failure), Some(chart_type)) => {
                let got = match failure.expected {
                    Some(kind) if kind != chart_type => kind.type_name().to_string(),
                    _ => failure.got,
                };
                let err = MetricError::type_mismatch(chart_type.type_name(), got);
                (None, Some(err), None, chart_type)
            }
            (Err(failure), None) => {
                let chart_type = failure.expected.unwrap_or(ChartType::Line);
                let err = MetricError::type_mismatch(chart_type.type_name(), failure.got);
                (None, Some(err.clone()), Some(err), chart_type)
            }
        };

        let (column_info, created) = self.columns.register(key, chart_type, column_error.clone());
        if created {
            debug!(key, kid = column_info.kid, chart_type = %chart_type, "Column created");
            self.callbacks.on_column_create(&column_info);
        }

        let metric_step = self.steps.resolve(key, step);
        let mut result = MetricResult {
            data: None,
            error,
            column_error,
            column_info,
            metric_step,
            metric_epoch: epoch,
            buffers: None,
            created_at,
        };

        let Some(parsed) = parsed else {
            return result;
        };
        if let Err(err) = self.steps.commit(key, metric_step) {
            debug!(key, step = metric_step, "Duplicate step");
            result.error = Some(err);
            return result;
        }

        let (data, buffers) = materialize(parsed, &result.column_info, metric_step);
        result.data = Some(data);
        result.buffers = buffers;
        result
    }

    /// Merge hyperparameters into the run config and notify observers.
    pub fn update_config<I, K, V>(&mut self, params: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<serde_yaml::Value>,
    {
        self.ensure_running("update config")?;
        for (key, value) in params {
            self.config.config.insert(key.into(), value.into());
        }
        self.runtime.config = self.config_value();
        self.callbacks.on_runtime_info_update(&self.runtime);
        Ok(())
    }

    /// Attach a console line to the run.
    pub fn console(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.state() != RunState::Running {
            warn!(run = %self.info.id, "Run is not running, console line dropped");
            return;
        }
        let line = LogLine {
            level,
            message: message.into(),
            epoch: self.steps.epoch(),
            created_at: Utc::now(),
        };
        self.callbacks.on_log_line(&line);
    }

    /// Finish as `SUCCESS`.
    pub fn finish(&mut self) -> RunRecord {
        self.stop(RunState::Success, None)
    }

    /// Finish as `CRASHED` with an error message.
    pub fn crash(&mut self, error: impl Into<String>) -> RunRecord {
        self.stop(RunState::Crashed, Some(error.into()))
    }

    /// Finish with an explicit terminal state. An error always means
    /// `CRASHED`. Finishing again returns the first record.
    pub fn finish_with(&mut self, state: Option<RunState>, error: Option<String>) -> Result<RunRecord> {
        let state = state.unwrap_or(RunState::Success);
        if !state.is_terminal() {
            return Err(TracklabError::InvalidState {
                operation: "finish with a non-terminal state",
                state,
            });
        }
        Ok(self.stop(state, error))
    }

    fn stop(&mut self, state: RunState, error: Option<String>) -> RunRecord {
        if let Some(record) = &self.record {
            return record.clone();
        }

        let mut state = if error.is_some() { RunState::Crashed } else { state };
        let stop = StopInfo {
            run_id: self.info.id.clone(),
            state,
            error: error.clone(),
            epoch: self.steps.epoch(),
        };
        self.callbacks.on_stop(&stop);

        let delivery = self.signal.status();
        let mut error = error;
        if delivery == DeliveryStatus::Abandoned {
            state = RunState::Crashed;
            error.get_or_insert_with(|| ABANDONED_ERROR.into());
        }

        self.handle.set_state(state);
        self.registry.release(&self.info.id);

        let finished_at = Utc::now();
        let record = RunRecord {
            id: self.info.id.clone(),
            project: self.info.project.clone(),
            experiment_name: self.info.experiment_name.clone(),
            state,
            started_at: self.info.started_at,
            finished_at,
            duration_secs: (finished_at - self.info.started_at).num_milliseconds() as f64 / 1000.0,
            epochs: self.steps.epoch(),
            error,
            delivery,
        };
        info!(run = %record.id, state = %record.state, "Run finished");
        self.record = Some(record.clone());
        record
    }

    fn ensure_running(&self, operation: &'static str) -> Result<()> {
        match self.state() {
            RunState::Running => Ok(()),
            state => Err(TracklabError::InvalidState { operation, state }),
        }
    }

    fn config_value(&self) -> Option<serde_yaml::Value> {
        if self.config.config.is_empty() {
            return None;
        }
        let mapping = self
            .config
            .config
            .iter()
            .map(|(k, v)| (serde_yaml::Value::String(k.clone()), v.clone()))
            .collect();
        Some(serde_yaml::Value::Mapping(mapping))
    }
}

impl Drop for Run {
    fn drop(&mut self) {
        if self.record.is_some() {
            return;
        }
        if std::thread::panicking() {
            self.stop(RunState::Crashed, Some("run dropped while panicking".into()));
        } else {
            self.stop(RunState::Success, None);
        }
    }
}

/// Build stored data and upload buffers for an accepted value.
fn materialize(parsed: Parsed, column: &ColumnInfo, step: u64) -> (MetricData, Option<Vec<MediaBuffer>>) {
    match parsed {
        Parsed::Line(value) => (MetricData::Line(value), None),
        Parsed::Text(texts) => (
            MetricData::Text(texts.iter().map(|t| t.as_str().to_string()).collect()),
            None,
        ),
        Parsed::Audio(items) => media(
            column,
            step,
            items.iter().map(|a| (a.shared_bytes(), a.caption())),
            "wav",
            "audio/wav",
        ),
        Parsed::Image(items) => media(
            column,
            step,
            items.iter().map(|i| (i.shared_bytes(), i.caption())),
            "png",
            "image/png",
        ),
    }
}

fn media<'a>(
    column: &ColumnInfo,
    step: u64,
    items: impl Iterator<Item = (Arc<[u8]>, Option<&'a str>)>,
    ext: &str,
    content_type: &str,
) -> (MetricData, Option<Vec<MediaBuffer>>) {
    let mut entries = Vec::new();
    let mut buffers = Vec::new();
    for (index, (bytes, caption)) in items.enumerate() {
        let path = format!(
            "{}/{step}-{index}-{}.{ext}",
            column.key_encoded,
            Uuid::new_v4().simple()
        );
        entries.push(MediaEntry {
            path: path.clone(),
            caption: caption.map(str::to_string),
        });
        buffers.push(MediaBuffer {
            path,
            content_type: content_type.to_string(),
            bytes,
        });
    }
    (MetricData::Media(entries), Some(buffers))
}
