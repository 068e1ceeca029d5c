//! Forward sync loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::cursor::SyncRecorder;
use super::runner::RangeRunner;
use crate::domain::BlockRange;
use crate::error::{EtlError, EtlResult};
use crate::executor::{execute_with_retries, RetryPolicy};
use crate::rpc::ChainHead;

/// Tuning for a [`StreamController`].
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// First block to export when no cursor was recorded
    pub start_block: Option<u64>,
    /// Stop once this block is exported
    pub end_block: Option<u64>,
    /// Blocks per scheduler run
    pub step: u64,
    /// Blocks kept behind the chain head
    pub delay: u64,
    /// Sleep when caught up
    pub period: Duration,
    /// Bounded retry of retriable range failures
    pub retry: RetryPolicy,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            start_block: None,
            end_block: None,
            step: 10,
            delay: 0,
            period: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of one [`StreamController::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A range was extracted and exported
    Synced(BlockRange),
    /// Nothing new below `head - delay`
    CaughtUp,
    /// `end_block` reached
    Finished,
}

/// Polls the chain head and feeds new ranges to a [`RangeRunner`].
pub struct StreamController {
    head: Arc<dyn ChainHead>,
    runner: Arc<dyn RangeRunner>,
    recorder: Arc<dyn SyncRecorder>,
    options: StreamOptions,
    exported: Option<watch::Receiver<Option<u64>>>,
    last_synced: Option<u64>,
    last_recorded: Option<u64>,
}

impl StreamController {
    /// Wire a controller; call [`init`](Self::init) before stepping.
    pub fn new(
        head: Arc<dyn ChainHead>,
        runner: Arc<dyn RangeRunner>,
        recorder: Arc<dyn SyncRecorder>,
        options: StreamOptions,
    ) -> Self {
        Self {
            head,
            runner,
            recorder,
            options,
            exported: None,
            last_synced: None,
            last_recorded: None,
        }
    }

    /// Record the cursor whenever `updates` reports export progress while
    /// the stream is caught up, instead of waiting for the next range.
    #[must_use]
    pub fn with_export_updates(mut self, updates: watch::Receiver<Option<u64>>) -> Self {
        self.exported = Some(updates);
        self
    }

    /// Load the recorded cursor.
    ///
    /// Without one, the sync starts at `start_block`.
    ///
    /// # Errors
    ///
    /// Returns the recorder's error, or a config error when neither a
    /// recorded cursor nor a start block exists.
    pub async fn init(&mut self) -> EtlResult<Option<u64>> {
        let recorded = self.recorder.get_last_synced_block().await?;
        self.last_recorded = recorded;
        self.last_synced = match (recorded, self.options.start_block) {
            (Some(cursor), _) => Some(cursor),
            (None, Some(0)) => None,
            (None, Some(start)) => Some(start - 1),
            (None, None) => {
                return Err(EtlError::config(
                    "No recorded sync cursor; a start block is required",
                    None,
                ))
            }
        };
        info!(cursor = ?self.last_synced, "Stream controller initialised");
        Ok(self.last_synced)
    }

    /// Last block handed to the runner successfully.
    #[must_use]
    pub const fn last_synced(&self) -> Option<u64> {
        self.last_synced
    }

    /// Next window given the current head, or `None` if nothing is ready.
    ///
    /// `target = min(head - delay, last_synced + step, end_block)`.
    #[must_use]
    pub fn next_range(&self, head: u64) -> Option<BlockRange> {
        let start = self.last_synced.map_or(0, |b| b + 1);
        let step = self.options.step.max(1);
        let mut target = head
            .checked_sub(self.options.delay)?
            .min(start + step - 1);
        if let Some(end) = self.options.end_block {
            target = target.min(end);
        }
        (target >= start).then_some(BlockRange { start, end: target })
    }

    fn finished(&self) -> bool {
        matches!(
            (self.options.end_block, self.last_synced),
            (Some(end), Some(last)) if last >= end
        )
    }

    /// One iteration: compute the target, run it, record the cursor.
    ///
    /// # Errors
    ///
    /// Returns crashable and fatal errors at once, and retriable ones once
    /// the retry budget is spent.
    #[instrument(skip(self), fields(cursor = ?self.last_synced))]
    pub async fn step(&mut self) -> EtlResult<StepOutcome> {
        if self.finished() {
            return Ok(StepOutcome::Finished);
        }

        let head = execute_with_retries("chain head", self.options.retry, || {
            self.head.latest_block_number()
        })
        .await?;
        let Some(range) = self.next_range(head) else {
            return Ok(StepOutcome::CaughtUp);
        };

        let runner = self.runner.clone();
        let result = execute_with_retries("stream range", self.options.retry, || {
            let runner = runner.clone();
            async move {
                let result = runner.run_range(range, false).await;
                if result.is_err() {
                    runner.rewind();
                }
                result
            }
        })
        .await;

        if let Err(err) = result {
            if err.is_crashable() {
                error!(%range, error = %err, "Crashable failure, stopping");
            } else {
                error!(%range, error = %err, "Range failed");
            }
            return Err(err);
        }

        self.last_synced = Some(range.end);
        self.record_cursor().await?;
        info!(start_block = range.start, end_block = range.end, head, "Range synced");
        Ok(StepOutcome::Synced(range))
    }

    async fn record_cursor(&mut self) -> EtlResult<()> {
        let Some(exported) = self.runner.exported_cursor() else {
            return Ok(());
        };
        if self.last_recorded.is_some_and(|r| r >= exported) {
            return Ok(());
        }
        self.recorder.set_last_synced_block(exported).await?;
        self.last_recorded = Some(exported);
        Ok(())
    }

    /// Loop until cancelled or `end_block` is exported.
    ///
    /// Drains in-flight exports and records the final cursor on the way out.
    ///
    /// # Errors
    ///
    /// Returns the first error [`step`](Self::step) gives up on.
    pub async fn run(&mut self, cancel: CancellationToken) -> EtlResult<()> {
        let result = self.run_until_stopped(&cancel).await;

        let drained = self.runner.drain().await;
        let recorded = self.record_cursor().await;
        if let Err(err) = &drained {
            warn!(error = %err, "Export drain failed");
        }
        info!(cursor = ?self.last_recorded, "Stream controller stopped");

        result.and(drained).and(recorded)
    }

    async fn run_until_stopped(&mut self, cancel: &CancellationToken) -> EtlResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match self.step().await? {
                StepOutcome::Synced(_) => {}
                StepOutcome::Finished => return Ok(()),
                StepOutcome::CaughtUp => {
                    if self.idle(cancel).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Sleep one period, recording export progress as it lands.
    ///
    /// Returns `true` when cancelled.
    async fn idle(&mut self, cancel: &CancellationToken) -> EtlResult<bool> {
        let deadline = tokio::time::Instant::now() + self.options.period;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(true),
                () = tokio::time::sleep_until(deadline) => return Ok(false),
                () = next_export(&mut self.exported) => {}
            }
            self.record_cursor().await?;
        }
    }
}

/// Resolves on the next export update; never, once the sender is gone.
async fn next_export(updates: &mut Option<watch::Receiver<Option<u64>>>) {
    let Some(rx) = updates.as_mut() else {
        return std::future::pending().await;
    };
    if rx.changed().await.is_err() {
        *updates = None;
    }
}
