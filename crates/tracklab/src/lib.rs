#![doc = include_str!("../../../README.md")]
//!

//! This crate re-exports the whole of `tracklab-core` and adds the
//! process-wide entry points.

pub use tracklab_core::*;

use std::sync::Arc;

/// Start a run registered in the process-wide registry.
///
/// Fails with [`TracklabError::AlreadyInitialized`] while another run is
/// active.
pub fn init(config: RunConfig) -> Result<Run> {
    let run = Run::builder(config).start()?;
    tracing::debug!(run = %run.id(), "Global run started");
    Ok(run)
}

/// Like [`init`], after applying `TRACKLAB_*` environment overrides.
pub fn init_from_env(config: RunConfig) -> Result<Run> {
    init(config.apply_env()?)
}

/// The active process-wide run, if any.
pub fn get_run() -> Option<Arc<RunHandle>> {
    RunRegistry::global().current()
}
