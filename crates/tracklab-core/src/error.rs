//! Error types for tracklab-core.
//!
//! Two families live here. `TracklabError` is raised to the caller (wrong run
//! state, malformed media, I/O). `BackendError` and `DispatchError` describe
//! delivery failures; they are handled inside the dispatch pipeline and only
//! surface as a degraded delivery status on the run.

use thiserror::Error;

use crate::models::RunState;

#[derive(Error, Debug)]
pub enum TracklabError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Construction(#[from] ConstructionError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Run is already initialized")]
    AlreadyInitialized,

    #[error("Cannot {operation} while run is {state}")]
    InvalidState {
        operation: &'static str,
        state: RunState,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Failure while building a media value. Raised immediately to the caller,
/// before anything reaches a run.
#[derive(Error, Debug)]
pub enum ConstructionError {
    #[error("cannot read media source {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot decode {kind}: {message}")]
    Decode { kind: &'static str, message: String },

    #[error("unsupported sample type: expected {expected}, got {got}")]
    UnsupportedDtype { expected: &'static str, got: &'static str },

    #[error("invalid array shape: expected {expected}, got {got:?}")]
    InvalidShape { expected: &'static str, got: Vec<usize> },

    #[error("array data length {len} does not match shape {shape:?}")]
    ShapeMismatch { len: usize, shape: Vec<usize> },

    #[error("media value is empty")]
    EmptyData,

    #[error("sample rate must be positive")]
    InvalidSampleRate,

    #[error("cannot encode {kind}: {message}")]
    Encode { kind: &'static str, message: String },
}

impl From<image::ImageError> for ConstructionError {
    fn from(e: image::ImageError) -> Self {
        ConstructionError::Decode {
            kind: "image",
            message: e.to_string(),
        }
    }
}

impl From<hound::Error> for ConstructionError {
    fn from(e: hound::Error) -> Self {
        ConstructionError::Decode {
            kind: "audio",
            message: e.to_string(),
        }
    }
}

/// Error reported by a [`Backend`](crate::backend::Backend) call.
///
/// The dispatch workers retry `Transient` failures with backoff, refresh the
/// session once on `Unauthorized`, and give up immediately on `Fatal`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("network error: {0}")]
    Transient(String),

    #[error("session credential rejected")]
    Unauthorized,

    #[error("backend rejected request ({status}): {message}")]
    Fatal { status: u16, message: String },
}

impl BackendError {
    /// Classify an HTTP-style status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => BackendError::Unauthorized,
            408 | 429 | 500..=599 => BackendError::Transient(format!("{status}: {message}")),
            _ => BackendError::Fatal { status, message },
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe => BackendError::Transient(e.to_string()),
            _ => BackendError::Fatal {
                status: 0,
                message: e.to_string(),
            },
        }
    }
}

impl From<TracklabError> for BackendError {
    fn from(e: TracklabError) -> Self {
        match e {
            TracklabError::Io(io) => io.into(),
            TracklabError::Backend(inner) => inner,
            other => BackendError::Fatal {
                status: 0,
                message: other.to_string(),
            },
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("dispatch queue is closed")]
    Closed,

    #[error("dispatch queue is full, record dropped")]
    QueueFull,

    #[error("dispatch runtime unavailable: {0}")]
    RuntimeUnavailable(String),
}

pub type Result<T> = std::result::Result<T, TracklabError>;

#[cfg(test)]
mod tests {
    use std::io::{Error, ErrorKind};

    use super::*;

    #[test]
    fn test_connection_failures_are_transient() {
        for kind in [
            ErrorKind::ConnectionRefused,
            ErrorKind::ConnectionReset,
            ErrorKind::ConnectionAborted,
            ErrorKind::NotConnected,
            ErrorKind::BrokenPipe,
            ErrorKind::TimedOut,
        ] {
            let err = BackendError::from(Error::from(kind));
            assert!(err.is_transient(), "{kind:?} should be retried, got {err:?}");
        }
    }

    #[test]
    fn test_other_io_errors_are_fatal() {
        let err = BackendError::from(Error::from(ErrorKind::PermissionDenied));
        assert!(matches!(err, BackendError::Fatal { status: 0, .. }));
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(BackendError::from_status(401, "expired"), BackendError::Unauthorized);
        assert!(BackendError::from_status(503, "busy").is_transient());
        assert!(BackendError::from_status(429, "slow down").is_transient());
        assert!(matches!(
            BackendError::from_status(400, "bad"),
            BackendError::Fatal { status: 400, .. }
        ));
    }
}
