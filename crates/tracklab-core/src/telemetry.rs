//! Diagnostic logging setup for applications embedding tracklab.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Filter used when `RUST_LOG` is not set.
    pub level: String,
    /// Also write JSON logs to `{dir}/tracklab.log`.
    pub log_dir: Option<PathBuf>,
    pub ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            log_dir: None,
            ansi: true,
        }
    }
}

/// Install the global subscriber: compact stderr output, plus a
/// non-blocking JSON file layer when `log_dir` is set.
///
/// Keep the returned guard alive for the life of the program; dropping it
/// flushes the file writer. Returns `None` when no file layer was set up.
/// Does nothing if a subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let stderr = fmt::layer()
        .with_target(false)
        .with_ansi(config.ansi)
        .with_writer(std::io::stderr)
        .compact();

    let (file, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, "tracklab.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .try_init();
    guard
}
