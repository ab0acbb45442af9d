//! Logging initialisation for qemu-manager.
//!
//! When the `QEMU_MANAGER_LOG` environment variable is set to `1`, structured
//! logs are also written to `qemu-manager.log` in the log directory.
//! Otherwise only stderr output (filtered by `RUST_LOG`) is enabled.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "QEMU_MANAGER_LOG";
pub const LOG_FILE: &str = "qemu-manager.log";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`, store the returned `LogGuard` in a local variable
/// for the duration of the process.
pub fn init(log_dir: Option<&Path>) -> LogGuard {
    let file_logging = std::env::var(LOG_ENV).as_deref() == Ok("1");

    let (file_layer, file_guard) = if file_logging {
        let dir = log_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        let _ = std::fs::create_dir_all(&dir);
        let (non_blocking, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir, LOG_FILE));
        let layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let default_level = if file_logging { "info" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    LogGuard { _file_guard: file_guard }
}
