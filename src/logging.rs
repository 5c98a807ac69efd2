//! Process-wide logging setup.
//!
//! Two outputs are installed:
//! - **Event log**: every `info` and above record appended to a plain-text
//!   file, written from a background worker so the notification path never
//!   waits on disk
//! - **Console**: compact records on standard error, `warn` by default or
//!   `debug` in verbose mode, overridable through `RUST_LOG`

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::{Result, SensorError};

/// Default event log file, relative to the working directory
pub const DEFAULT_LOG_FILE: &str = "ble_test_log.txt";

/// Install the global subscriber
///
/// The returned guard flushes the event log when dropped and must be held
/// for the whole run.
///
/// # Errors
///
/// Returns [`SensorError::InvalidConfig`] if the log file cannot be opened,
/// the filter cannot be parsed or a subscriber is already installed.
pub fn init(log_file: &Path, verbose: bool) -> Result<WorkerGuard> {
    let appender = open_event_log(log_file)?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let console_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(console_directive(verbose)))
        .map_err(|e| SensorError::InvalidConfig(format!("invalid log filter: {e}")))?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(false)
        .with_filter(LevelFilter::INFO);

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(console_filter);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| SensorError::InvalidConfig(format!("logging already initialized: {e}")))?;

    Ok(guard)
}

/// Console filter used when `RUST_LOG` is unset
///
/// Decoded messages already reach stdout through the event sink, so the
/// console only shows problems unless verbose output is requested.
const fn console_directive(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "warn"
    }
}

/// Open `path` for appending, creating missing parent directories
fn open_event_log(path: &Path) -> Result<RollingFileAppender> {
    let (directory, file_name) = split_log_path(path)?;
    std::fs::create_dir_all(&directory)?;

    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(&directory)
        .map_err(|e| SensorError::InvalidConfig(format!("cannot open {}: {e}", path.display())))
}

fn split_log_path(path: &Path) -> Result<(PathBuf, String)> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            SensorError::InvalidConfig(format!("not a log file path: {}", path.display()))
        })?;

    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    Ok((directory, file_name.to_string()))
}
