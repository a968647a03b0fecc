use tracing::{info, warn};

use crate::callback::RunCallback;
use crate::models::{MetricResult, RunInfo, RunState, StopInfo};

/// Reports run start, finish and metric errors through `tracing`.
#[derive(Debug, Default)]
pub struct ConsoleCallback {
    errors: u64,
}

impl ConsoleCallback {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunCallback for ConsoleCallback {
    fn name(&self) -> &str {
        "console"
    }

    fn on_run(&mut self, run: &RunInfo) -> anyhow::Result<()> {
        info!(
            run = %run.id,
            project = %run.project,
            experiment = %run.experiment_name,
            dir = %run.run_dir.display(),
            "Run started"
        );
        Ok(())
    }

    fn on_metric_create(&mut self, metric: &MetricResult) -> anyhow::Result<()> {
        if let Some(err) = &metric.error {
            self.errors += 1;
            warn!(
                key = %metric.key(),
                step = metric.metric_step,
                error = %err,
                "Metric rejected"
            );
        }
        Ok(())
    }

    fn on_stop(&mut self, stop: &StopInfo) -> anyhow::Result<()> {
        match stop.state {
            RunState::Crashed => warn!(
                run = %stop.run_id,
                error = stop.error.as_deref().unwrap_or("unknown"),
                metric_errors = self.errors,
                "Run crashed"
            ),
            state => info!(
                run = %stop.run_id,
                %state,
                epochs = stop.epoch,
                metric_errors = self.errors,
                "Run finished"
            ),
        }
        Ok(())
    }
}
