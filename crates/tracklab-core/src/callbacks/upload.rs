use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, SessionProvider};
use crate::callback::RunCallback;
use crate::config::DispatchConfig;
use crate::dispatch::{DeliverySignal, Dispatcher, DrainReport};
use crate::error::{DispatchError, Result};
use crate::models::{
    ColumnInfo, LogLevel, LogLine, MetricResult, RunInfo, RunState, RuntimeInfo, StopInfo,
};
use crate::record::{FileRecord, UploadRecord};

/// Turns run events into upload records and feeds them to a [`Dispatcher`].
pub struct UploadCallback {
    backend: Arc<dyn Backend>,
    dispatcher: Dispatcher,
    signal: DeliverySignal,
    exiting: bool,
}

impl UploadCallback {
    pub fn new(
        backend: Arc<dyn Backend>,
        session: Arc<dyn SessionProvider>,
        config: &DispatchConfig,
        signal: DeliverySignal,
    ) -> Result<Self> {
        let dispatcher = Dispatcher::start(config, Arc::clone(&backend), session, signal.clone())?;
        Ok(Self {
            backend,
            dispatcher,
            signal,
            exiting: false,
        })
    }

    pub fn signal(&self) -> &DeliverySignal {
        &self.signal
    }

    fn enqueue(&self, record: UploadRecord) {
        let kind = record.kind();
        match self.dispatcher.enqueue(record) {
            Ok(()) => {}
            Err(DispatchError::Closed) => debug!(?kind, "Dispatcher closed, record ignored"),
            // Already counted and logged by the dispatcher
            Err(DispatchError::QueueFull) => {}
            Err(e) => warn!(?kind, error = %e, "Cannot enqueue record"),
        }
    }

    fn drain(&mut self) -> DrainReport {
        self.dispatcher.finish()
    }
}

impl RunCallback for UploadCallback {
    fn name(&self) -> &str {
        "upload"
    }

    fn on_run(&mut self, run: &RunInfo) -> anyhow::Result<()> {
        if let Err(e) = self.backend.register_run(run) {
            self.signal.record_failure(1, &e);
            return Err(e.into());
        }
        Ok(())
    }

    fn on_column_create(&mut self, column: &ColumnInfo) -> anyhow::Result<()> {
        self.enqueue(UploadRecord::Column(column.clone()));
        Ok(())
    }

    fn on_metric_create(&mut self, metric: &MetricResult) -> anyhow::Result<()> {
        if let Some(record) = UploadRecord::from_metric(&metric.event(), metric.buffers.as_deref()) {
            self.enqueue(record);
        }
        Ok(())
    }

    fn on_runtime_info_update(&mut self, info: &RuntimeInfo) -> anyhow::Result<()> {
        for file in FileRecord::from_runtime(info) {
            self.enqueue(UploadRecord::File(file));
        }
        Ok(())
    }

    fn on_log_line(&mut self, line: &LogLine) -> anyhow::Result<()> {
        self.enqueue(UploadRecord::Log(line.clone()));
        Ok(())
    }

    fn on_stop(&mut self, stop: &StopInfo) -> anyhow::Result<()> {
        if self.exiting {
            return Ok(());
        }
        self.exiting = true;

        if let Some(message) = &stop.error {
            self.enqueue(UploadRecord::Log(LogLine {
                level: LogLevel::Error,
                message: message.clone(),
                epoch: stop.epoch,
                created_at: Utc::now(),
            }));
        }

        let report = self.drain();
        let state = if report.drained {
            stop.state
        } else {
            RunState::Crashed
        };
        info!(
            run = %stop.run_id,
            delivered = report.stats.delivered,
            failed = report.stats.failed,
            "Upload finished"
        );

        if let Err(e) = self.backend.update_state(state) {
            error!(run = %stop.run_id, error = %e, "Cannot report final run state");
            self.signal.record_failure(1, &e);
        }
        Ok(())
    }
}
