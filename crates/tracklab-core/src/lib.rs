//! tracklab-core: metric ingestion, run lifecycle and delivery for tracklab.
//!
//! `Run::log()` parses values, checks them against their columns and assigns
//! steps on the caller's thread, then hands typed records to observers. The
//! upload observer feeds a bounded, sharded dispatch queue whose workers
//! deliver batches to a `Backend` with retry and backoff.

pub mod backend;
pub mod backup;
pub mod callback;
pub mod callbacks;
pub mod column;
pub mod config;
pub mod data;
pub mod dispatch;
pub mod error;
pub mod local;
pub mod models;
pub mod record;
pub mod run;
pub mod step;
pub mod storage;
pub mod telemetry;

pub use backend::{Backend, BackendResult, SessionProvider, StaticSession};
pub use callback::{CallbackId, CallbackRegistry, Hooked, RunCallback};
pub use config::{DispatchConfig, OverflowPolicy, RunConfig, RunMode};
pub use data::{Array, ArrayData, Audio, Image, Line, LineValue, LogData, MediaBuffer, Text, Value};
pub use dispatch::{DeliverySignal, Dispatcher, DrainReport, StatsSnapshot};
pub use error::{BackendError, ConstructionError, DispatchError, Result, TracklabError};
pub use local::LocalBackend;
pub use models::{
    ChartType, ColumnInfo, DeliveryStatus, LogLevel, LogLine, MetricData, MetricError,
    MetricEvent, MetricResult, RunInfo, RunRecord, RunState, RuntimeInfo, StopInfo,
};
pub use record::{FileRecord, MediaRecord, ScalarRecord, UploadRecord};
pub use run::{Run, RunBuilder, RunHandle, RunRegistry};
pub use telemetry::{init_tracing, TelemetryConfig};
