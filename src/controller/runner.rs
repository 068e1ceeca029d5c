//! Range execution backends for the controllers.
//!
//! The controllers only need "process this block range" plus the export
//! cursor that results from it. [`JobScheduler`] does the work in-process;
//! [`SubprocessRunner`] fans a range out to worker processes running the
//! hidden `run-range` command of this binary.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use eyre::WrapErr;
use futures_util::future::join_all;
use tokio::process::Command;
use tracing::{debug, error, info, instrument};

use crate::domain::BlockRange;
use crate::error::{ErrorClass, EtlError, EtlResult};
use crate::scheduler::JobScheduler;

/// Something that can extract and export a block range.
#[async_trait]
pub trait RangeRunner: Send + Sync {
    /// Extract and export `range`.
    async fn run_range(&self, range: BlockRange, reorg: bool) -> EtlResult<()>;

    /// Highest block exported with nothing missing before it.
    fn exported_cursor(&self) -> Option<u64>;

    /// Drop bookkeeping for exports that will be redone after a failure.
    fn rewind(&self) {}

    /// Wait for exports still in flight.
    async fn drain(&self) -> EtlResult<()> {
        Ok(())
    }
}

#[async_trait]
impl RangeRunner for JobScheduler {
    async fn run_range(&self, range: BlockRange, reorg: bool) -> EtlResult<()> {
        self.run_jobs(range, reorg).await
    }

    fn exported_cursor(&self) -> Option<u64> {
        self.buffer().exported_cursor()
    }

    fn rewind(&self) {
        self.buffer().reset_sequence();
    }

    async fn drain(&self) -> EtlResult<()> {
        self.buffer().wait_for_exports().await
    }
}

/// Splits each range across worker processes.
///
/// Worker `i` receives the `i`-th slice of the range and exports it itself;
/// its exit status is mapped back to an error class (see
/// [`ErrorClass::exit_code`]). A worker that outlives `timeout` is killed
/// and reported as a timeout.
#[derive(Debug)]
pub struct SubprocessRunner {
    program: PathBuf,
    args: Vec<String>,
    processes: usize,
    timeout: Duration,
    cursor: Mutex<Option<u64>>,
}

impl SubprocessRunner {
    /// Runner spawning `program args.. run-range ...`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, processes: usize, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            processes: processes.max(1),
            timeout,
            cursor: Mutex::new(None),
        }
    }

    /// Runner re-invoking the current executable.
    ///
    /// # Errors
    ///
    /// Returns a state error if the executable path cannot be determined.
    pub fn current_exe(args: Vec<String>, processes: usize, timeout: Duration) -> EtlResult<Self> {
        let program = std::env::current_exe()
            .wrap_err("Cannot locate the running executable for worker processes")?;
        Ok(Self::new(program, args, processes, timeout))
    }

    fn command(&self, part: BlockRange, reorg: bool) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("run-range")
            .arg("--start-block")
            .arg(part.start.to_string())
            .arg("--end-block")
            .arg(part.end.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if reorg {
            command.arg("--reorg");
        }
        command
    }

    #[instrument(skip(self), fields(start_block = part.start, end_block = part.end))]
    async fn run_part(&self, part: BlockRange, reorg: bool) -> EtlResult<()> {
        let mut child = self.command(part, reorg).spawn().map_err(|e| {
            EtlError::state(format!("Failed to spawn worker for {part}"), Some(Box::new(e)))
        })?;
        debug!(pid = child.id(), "Worker started");

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status.map_err(|e| {
                EtlError::state(format!("Failed to wait for worker on {part}"), Some(Box::new(e)))
            })?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    error!(error = %e, "Failed to kill timed out worker");
                }
                return Err(EtlError::timeout(format!(
                    "worker for {part} exceeded {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        status_to_result(part, status)
    }
}

fn status_to_result(part: BlockRange, status: ExitStatus) -> EtlResult<()> {
    let Some(code) = status.code() else {
        return Err(EtlError::state(format!("worker for {part} killed: {status}"), None));
    };
    let message = format!("worker for {part} exited with code {code}");
    match ErrorClass::from_exit_code(code) {
        None => Ok(()),
        Some(ErrorClass::Retriable) => Err(EtlError::transport(message, None)),
        Some(ErrorClass::Crashable) => Err(EtlError::crashable(message, None)),
        Some(ErrorClass::Fatal) => Err(EtlError::state(message, None)),
    }
}

#[async_trait]
impl RangeRunner for SubprocessRunner {
    async fn run_range(&self, range: BlockRange, reorg: bool) -> EtlResult<()> {
        let parts = range.split(self.processes);
        info!(%range, workers = parts.len(), "Dispatching range to worker processes");

        let results = join_all(parts.iter().map(|part| self.run_part(*part, reorg))).await;

        // Crashable failures win over the rest so the caller stops at once.
        let mut first_error = None;
        for result in results {
            if let Err(err) = result {
                let crashable = err.is_crashable();
                if first_error.is_none() || crashable {
                    first_error = Some(err);
                }
                if crashable {
                    break;
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        *cursor = Some(cursor.map_or(range.end, |c| c.max(range.end)));
        Ok(())
    }

    fn exported_cursor(&self) -> Option<u64> {
        *self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
