//! CLI entry point for the streaming ETL.
//!
//! `main` only sets up the runtime and logging, then hands over to
//! [`cli::run`]. The process exit code follows the error class:
//! 0 on success, 75 retriable, 70 crashable, 1 fatal. Worker processes
//! spawned for `run-range` report back through the same codes.

use eth_stream_etl::{cli, observability};
use tracing::error;

#[tokio::main]
async fn main() {
    // RUST_LOG: filter, LOG_JSON: JSON console output, LOG_FILE: rotating file
    let log_level = std::env::var("RUST_LOG").ok();
    let log_file = std::env::var("LOG_FILE").ok().map(std::path::PathBuf::from);
    let json_output = std::env::var("LOG_JSON")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    let guard = match observability::init_tracing(log_level, log_file, json_output) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize tracing: {e}");
            std::process::exit(1);
        }
    };

    let code = match cli::run().await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, class = ?e.class(), "Application error");
            eprintln!("Error: {e}");
            e.class().exit_code()
        }
    };

    // Flush the file writer before exiting.
    drop(guard);
    if code != 0 {
        std::process::exit(code);
    }
}
