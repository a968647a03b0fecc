//! Collaborator interfaces consumed by the dispatch pipeline.
//!
//! Backend calls are blocking; dispatch workers run them on the runtime's
//! blocking pool. Errors must say whether they are worth retrying, see
//! [`BackendError`].

use crate::data::MediaBuffer;
use crate::error::BackendError;
use crate::models::{ColumnInfo, LogLine, RunInfo, RunState};
use crate::record::{FileRecord, MediaRecord, ScalarRecord};

pub type BackendResult = std::result::Result<(), BackendError>;

pub trait Backend: Send + Sync {
    /// Announce the run before anything else is sent.
    fn register_run(&self, _run: &RunInfo) -> BackendResult {
        Ok(())
    }

    fn post_columns(&self, columns: &[ColumnInfo]) -> BackendResult;

    fn post_scalars(&self, scalars: &[ScalarRecord]) -> BackendResult;

    fn upload_media(&self, buffer: &MediaBuffer) -> BackendResult;

    /// Post media metrics whose buffers have all been uploaded.
    fn post_media(&self, media: &[MediaRecord]) -> BackendResult;

    fn post_logs(&self, lines: &[LogLine]) -> BackendResult;

    fn post_file(&self, file: &FileRecord) -> BackendResult;

    fn update_state(&self, state: RunState) -> BackendResult;
}

/// Supplies the session credential used by a backend.
pub trait SessionProvider: Send + Sync {
    fn is_expiring_soon(&self) -> bool;

    fn refresh(&self) -> BackendResult;
}

/// Session that never expires, for backends without credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticSession;

impl SessionProvider for StaticSession {
    fn is_expiring_soon(&self) -> bool {
        false
    }

    fn refresh(&self) -> BackendResult {
        Ok(())
    }
}
