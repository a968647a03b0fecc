//! Observer interface for run lifecycle and metric events.
//!
//! Every hook has a no-op default, so an observer implements only what it
//! cares about. The registry calls observers synchronously in registration
//! order and isolates each call: an `Err` or a panic is logged and the next
//! observer still runs.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{error, warn};

use crate::models::{ColumnInfo, LogLine, MetricResult, RunInfo, RuntimeInfo, StopInfo};

pub trait RunCallback: Send {
    /// Name used in diagnostics.
    fn name(&self) -> &str {
        "callback"
    }

    /// Called before the run becomes `RUNNING`.
    fn on_init(&mut self, _run: &RunInfo) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once the run is `RUNNING`.
    fn on_run(&mut self, _run: &RunInfo) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_column_create(&mut self, _column: &ColumnInfo) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called for every metric, including errored ones.
    fn on_metric_create(&mut self, _metric: &MetricResult) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_runtime_info_update(&mut self, _info: &RuntimeInfo) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_log_line(&mut self, _line: &LogLine) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_stop(&mut self, _stop: &StopInfo) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Handle returned by [`CallbackRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: Vec<(CallbackId, Box<dyn RunCallback>)>,
    next_id: u64,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, callback: Box<dyn RunCallback>) -> CallbackId {
        let id = CallbackId(self.next_id);
        self.next_id += 1;
        self.callbacks.push((id, callback));
        id
    }

    pub fn unregister(&mut self, id: CallbackId) -> Option<Box<dyn RunCallback>> {
        let pos = self.callbacks.iter().position(|(cid, _)| *cid == id)?;
        Some(self.callbacks.remove(pos).1)
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Registered observer names, in call order.
    pub fn names(&self) -> Vec<String> {
        self.callbacks.iter().map(|(_, cb)| cb.name().to_string()).collect()
    }

    pub fn on_init(&mut self, run: &RunInfo) {
        self.emit("on_init", |cb| cb.on_init(run));
    }

    pub fn on_run(&mut self, run: &RunInfo) {
        self.emit("on_run", |cb| cb.on_run(run));
    }

    pub fn on_column_create(&mut self, column: &ColumnInfo) {
        self.emit("on_column_create", |cb| cb.on_column_create(column));
    }

    pub fn on_metric_create(&mut self, metric: &MetricResult) {
        self.emit("on_metric_create", |cb| cb.on_metric_create(metric));
    }

    pub fn on_runtime_info_update(&mut self, info: &RuntimeInfo) {
        self.emit("on_runtime_info_update", |cb| cb.on_runtime_info_update(info));
    }

    pub fn on_log_line(&mut self, line: &LogLine) {
        self.emit("on_log_line", |cb| cb.on_log_line(line));
    }

    pub fn on_stop(&mut self, stop: &StopInfo) {
        self.emit("on_stop", |cb| cb.on_stop(stop));
    }

    fn emit(&mut self, event: &'static str, mut f: impl FnMut(&mut dyn RunCallback) -> anyhow::Result<()>) {
        for (_, callback) in self.callbacks.iter_mut() {
            guarded(callback.as_mut(), event, &mut f);
        }
    }
}

/// Run one observer call, logging and swallowing errors and panics.
pub(crate) fn guarded(
    callback: &mut dyn RunCallback,
    event: &'static str,
    f: &mut dyn FnMut(&mut dyn RunCallback) -> anyhow::Result<()>,
) {
    let outcome = catch_unwind(AssertUnwindSafe(|| f(&mut *callback)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(callback = callback.name(), event, error = %e, "Callback failed");
        }
        Err(payload) => {
            error!(
                callback = callback.name(),
                event,
                panic = panic_message(payload.as_ref()),
                "Callback panicked"
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// An observer wrapped with hooks that run around each of its calls.
///
/// Hooks are isolated like registry members: a failing `before` hook does not
/// stop the wrapped observer, and a failing wrapped observer does not stop
/// the `after` hooks.
pub struct Hooked {
    name: String,
    before: Vec<Box<dyn RunCallback>>,
    inner: Box<dyn RunCallback>,
    after: Vec<Box<dyn RunCallback>>,
}

impl Hooked {
    pub fn new(inner: Box<dyn RunCallback>) -> Self {
        Self {
            name: inner.name().to_string(),
            before: Vec::new(),
            inner,
            after: Vec::new(),
        }
    }

    pub fn before(mut self, hook: Box<dyn RunCallback>) -> Self {
        self.before.push(hook);
        self
    }

    pub fn after(mut self, hook: Box<dyn RunCallback>) -> Self {
        self.after.push(hook);
        self
    }

    fn call(
        &mut self,
        event: &'static str,
        mut f: impl FnMut(&mut dyn RunCallback) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        for hook in self.before.iter_mut() {
            guarded(hook.as_mut(), event, &mut f);
        }
        let result = f(self.inner.as_mut());
        for hook in self.after.iter_mut() {
            guarded(hook.as_mut(), event, &mut f);
        }
        result
    }
}

impl RunCallback for Hooked {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_init(&mut self, run: &RunInfo) -> anyhow::Result<()> {
        self.call("on_init", |cb| cb.on_init(run))
    }

    fn on_run(&mut self, run: &RunInfo) -> anyhow::Result<()> {
        self.call("on_run", |cb| cb.on_run(run))
    }

    fn on_column_create(&mut self, column: &ColumnInfo) -> anyhow::Result<()> {
        self.call("on_column_create", |cb| cb.on_column_create(column))
    }

    fn on_metric_create(&mut self, metric: &MetricResult) -> anyhow::Result<()> {
        self.call("on_metric_create", |cb| cb.on_metric_create(metric))
    }

    fn on_runtime_info_update(&mut self, info: &RuntimeInfo) -> anyhow::Result<()> {
        self.call("on_runtime_info_update", |cb| cb.on_runtime_info_update(info))
    }

    fn on_log_line(&mut self, line: &LogLine) -> anyhow::Result<()> {
        self.call("on_log_line", |cb| cb.on_log_line(line))
    }

    fn on_stop(&mut self, stop: &StopInfo) -> anyhow::Result<()> {
        self.call("on_stop", |cb| cb.on_stop(stop))
    }
}
