//! Structured logging setup.
//!
//! Everything in the pipeline logs through `tracing` with key-value fields
//! (`block`, `start_block`, `end_block`, `job`, `batch_size`, ...). This
//! module installs the subscriber once at startup.
//!
//! # Environment Configuration
//!
//! ```bash
//! # Component-specific levels
//! RUST_LOG=eth_stream_etl=debug,sqlx=warn eth-stream-etl stream
//!
//! # JSON output for log aggregation
//! LOG_JSON=true eth-stream-etl stream
//!
//! # Also write JSON logs to a daily-rotated file
//! LOG_FILE=./logs/etl.log eth-stream-etl stream
//! ```

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Filter used when neither `RUST_LOG` nor a level is given.
pub const DEFAULT_FILTER: &str = "eth_stream_etl=info,warn";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `log_level`; without either the filter is
/// [`DEFAULT_FILTER`]. The console layer is pretty-printed, or JSON when
/// `json_output` is set. With `log_file`, a JSON layer writes to a
/// daily-rotated file next to it.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// stops the file writer.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created or a subscriber
/// is already installed.
pub fn init_tracing(
    log_level: Option<String>,
    log_file: Option<PathBuf>,
    json_output: bool,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = if let Ok(filter) = std::env::var("RUST_LOG") {
        EnvFilter::new(filter)
    } else if let Some(level) = log_level {
        EnvFilter::new(level)
    } else {
        EnvFilter::new(DEFAULT_FILTER)
    };

    let console_layer = if json_output {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .pretty()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .boxed()
    };

    let mut guard = None;
    let file_layer = if let Some(ref path) = log_file {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let appender = tracing_appender::rolling::daily(
            dir,
            path.file_name().unwrap_or_else(|| OsStr::new("etl.log")),
        );
        let (writer, worker) = tracing_appender::non_blocking(appender);
        guard = Some(worker);

        Some(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_current_span(true)
                .with_span_list(true)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .boxed(),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    info!(
        json_output,
        file_logging = log_file.is_some(),
        "Tracing initialized"
    );

    Ok(guard)
}
