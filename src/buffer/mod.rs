//! Buffer/Export service.
//!
//! [`ExportBuffer`] is the typed holding area jobs write into during one
//! scheduler run, plus the machinery that hands a consistent snapshot of it
//! to the configured [`ItemExporter`]s:
//!
//! - per-type reads and writes never observe a half-applied flush
//!   (see [`TypedBuffer`])
//! - exports run on their own bounded pool, separate from the RPC workers
//! - at most `max_pending` exports are in flight; `check_and_flush` waits
//!   for a slot
//! - the success callback receives the highest contiguously exported block
//!   (see [`ExportSequence`]), so a cursor driven by it never regresses
//!
//! # Sync vs. async export
//!
//! With `sync_export` the caller of [`ExportBuffer::check_and_flush`] waits
//! for the export and gets its error directly. Otherwise the call returns
//! once the export is queued; a failure is recorded and returned by the
//! next `check_and_flush`, and with `crash_instantly` it also cancels the
//! shared [`CancellationToken`].

mod sequence;
mod typed;

pub use sequence::ExportSequence;
pub use typed::TypedBuffer;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::domain::{BlockRange, Entity, EntityType};
use crate::error::{EtlError, EtlResult};
use crate::export::{ExportBatch, ItemExporter};

/// Called with the new contiguous export cursor.
pub type SuccessCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Called with the failed range and its error.
pub type FailureCallback = Arc<dyn Fn(BlockRange, &EtlError) + Send + Sync>;

/// Tuning for an [`ExportBuffer`].
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Concurrent exports running against the sinks
    pub max_workers: usize,
    /// Exports allowed in flight before `check_and_flush` blocks
    pub max_pending: usize,
    /// Wait for each export inside `check_and_flush`
    pub sync_export: bool,
    /// Cancel the shared token on the first export failure
    pub crash_instantly: bool,
    /// Types that leave the process; everything else is internal
    pub required_types: Vec<EntityType>,
    /// Per-caller replacement of the requested output types
    pub overrides: HashMap<String, Vec<EntityType>>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_pending: 8,
            sync_export: true,
            crash_instantly: true,
            required_types: vec![EntityType::Block, EntityType::Transaction],
            overrides: HashMap::new(),
        }
    }
}

/// What to flush and on whose behalf.
#[derive(Debug, Clone)]
pub struct FlushRequest<'a> {
    /// Caller name, looked up in [`ExportOptions::overrides`]
    pub job_name: &'a str,
    /// Types the caller produced
    pub output_types: &'a [EntityType],
    /// Range the run covered, used when no block entity was buffered
    pub range: BlockRange,
    /// Whether this is a reorg re-export
    pub reorg: bool,
}

/// Handle on one queued export.
#[derive(Debug)]
pub struct ExportTicket {
    /// Blocks covered by the export
    pub range: BlockRange,
    done: oneshot::Receiver<EtlResult<()>>,
}

impl ExportTicket {
    /// Wait for the export to finish.
    ///
    /// # Errors
    ///
    /// Returns the export's error, or a cancellation error if the export
    /// task was dropped.
    pub async fn wait(self) -> EtlResult<()> {
        self.done
            .await
            .unwrap_or_else(|_| Err(EtlError::cancelled("export task dropped")))
    }
}

/// Typed buffer plus the export pipeline behind it.
pub struct ExportBuffer {
    data: TypedBuffer,
    options: ExportOptions,
    exporters: Arc<Vec<Arc<dyn ItemExporter>>>,
    export_pool: Arc<Semaphore>,
    pending_slots: Arc<Semaphore>,
    sequence: Arc<Mutex<ExportSequence>>,
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
    failure: Arc<Mutex<Option<EtlError>>>,
    tasks: Mutex<JoinSet<()>>,
    crash: CancellationToken,
    closed: AtomicBool,
}

impl ExportBuffer {
    /// Create a buffer exporting to `exporters`.
    #[must_use]
    pub fn new(options: ExportOptions, exporters: Vec<Arc<dyn ItemExporter>>) -> Self {
        Self {
            data: TypedBuffer::new(),
            export_pool: Arc::new(Semaphore::new(options.max_workers.max(1))),
            pending_slots: Arc::new(Semaphore::new(options.max_pending.max(1))),
            exporters: Arc::new(exporters),
            sequence: Arc::new(Mutex::new(ExportSequence::default())),
            on_success: None,
            on_failure: None,
            failure: Arc::new(Mutex::new(None)),
            tasks: Mutex::new(JoinSet::new()),
            crash: CancellationToken::new(),
            closed: AtomicBool::new(false),
            options,
        }
    }

    /// Register the success callback.
    #[must_use]
    pub fn on_success(mut self, callback: SuccessCallback) -> Self {
        self.on_success = Some(callback);
        self
    }

    /// Register the failure callback.
    #[must_use]
    pub fn on_failure(mut self, callback: FailureCallback) -> Self {
        self.on_failure = Some(callback);
        self
    }

    /// Share a cancellation token, cancelled on export failure when
    /// `crash_instantly` is set.
    #[must_use]
    pub fn with_crash_token(mut self, token: CancellationToken) -> Self {
        self.crash = token;
        self
    }

    /// Token cancelled when an export crashes the pipeline.
    #[must_use]
    pub fn crash_token(&self) -> CancellationToken {
        self.crash.clone()
    }

    /// Options in effect.
    #[must_use]
    pub const fn options(&self) -> &ExportOptions {
        &self.options
    }

    /// Highest block exported with no gaps before it, if any.
    #[must_use]
    pub fn exported_cursor(&self) -> Option<u64> {
        self.sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cursor()
    }

    /// Forget in-flight bookkeeping after the caller rewound to its cursor.
    pub fn reset_sequence(&self) {
        self.sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
    }

    /// Append one entity.
    pub async fn append(&self, entity: Entity) {
        self.data.append(entity.entity_type(), entity).await;
    }

    /// Append entities under `ty`.
    pub async fn extend(&self, ty: EntityType, entities: Vec<Entity>) {
        self.data.extend(ty, entities).await;
    }

    /// Copy of the entities buffered under `ty`.
    pub async fn get(&self, ty: EntityType) -> Vec<Entity> {
        self.data.get(ty).await
    }

    /// Replace the entities buffered under `ty`.
    pub async fn set(&self, ty: EntityType, entities: Vec<Entity>) {
        self.data.set(ty, entities).await;
    }

    /// Drop everything buffered.
    pub async fn clear(&self) {
        self.data.clear().await;
    }

    fn take_failure(&self) -> Option<EtlError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Snapshot the buffer and queue an export of `types`.
    ///
    /// The snapshot is taken under the global lock and empties the buffer.
    /// Only types listed in [`ExportOptions::required_types`] are exported.
    /// A failed reorg export is reported only through its ticket.
    ///
    /// # Errors
    ///
    /// Returns a cancellation error after [`shutdown`](Self::shutdown).
    pub async fn flush(
        &self,
        types: &[EntityType],
        range_hint: BlockRange,
        reorg: bool,
    ) -> EtlResult<ExportTicket> {
        self.flush_with_slot(types, range_hint, reorg, None).await
    }

    async fn flush_with_slot(
        &self,
        types: &[EntityType],
        range_hint: BlockRange,
        reorg: bool,
        slot: Option<OwnedSemaphorePermit>,
    ) -> EtlResult<ExportTicket> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EtlError::cancelled("export buffer is shut down"));
        }

        let mut snapshot = self.data.take_all().await;

        let range = snapshot
            .get_mut(&EntityType::Block)
            .and_then(|blocks| {
                blocks.sort_by_key(Entity::sort_key);
                let first = blocks.first()?.block_number();
                let last = blocks.last()?.block_number();
                Some(BlockRange {
                    start: first,
                    end: last,
                })
            })
            .unwrap_or(range_hint);

        let mut items = BTreeMap::new();
        for ty in types {
            if !self.options.required_types.contains(ty) {
                continue;
            }
            if let Some(mut entities) = snapshot.remove(ty) {
                entities.sort_by_key(Entity::sort_key);
                items.insert(*ty, entities);
            }
        }

        let batch = ExportBatch { range, reorg, items };
        let seq = self
            .sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register(range);
        debug!(%range, seq, entities = batch.len(), "Export queued");

        let (done_tx, done_rx) = oneshot::channel();
        let task = ExportTask {
            batch,
            seq,
            exporters: self.exporters.clone(),
            export_pool: self.export_pool.clone(),
            sequence: self.sequence.clone(),
            on_success: self.on_success.clone(),
            on_failure: self.on_failure.clone(),
            failure: self.failure.clone(),
            record_failure: !(self.options.sync_export || reorg),
            crash: self.options.crash_instantly.then(|| self.crash.clone()),
        };

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spawn(async move {
                let result = task.run().await;
                drop(slot);
                let _ = done_tx.send(result);
            });

        Ok(ExportTicket {
            range,
            done: done_rx,
        })
    }

    /// Flush the output of a run, bounded by `max_pending` in-flight exports.
    ///
    /// In sync mode, and for reorg flushes in either mode, waits for the
    /// export. Otherwise returns once it is queued and releases the slot
    /// when it completes.
    ///
    /// # Errors
    ///
    /// Returns the export error of an awaited flush, an earlier recorded
    /// export failure (async mode), or a cancellation error after shutdown.
    #[instrument(skip(self, request), fields(job = request.job_name, range = %request.range))]
    pub async fn check_and_flush(&self, request: FlushRequest<'_>) -> EtlResult<()> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }

        let types = self
            .options
            .overrides
            .get(request.job_name)
            .map_or(request.output_types, Vec::as_slice);

        let slot = tokio::select! {
            () = self.crash.cancelled() => {
                return Err(self.take_failure().unwrap_or_else(|| {
                    EtlError::cancelled("pipeline cancelled while waiting for export slot")
                }));
            }
            slot = self.pending_slots.clone().acquire_owned() => slot
                .map_err(|_| EtlError::cancelled("export slots closed"))?,
        };

        let ticket = self
            .flush_with_slot(types, request.range, request.reorg, Some(slot))
            .await?;

        if self.options.sync_export || request.reorg {
            ticket.wait().await
        } else {
            Ok(())
        }
    }

    /// Wait for every queued export to finish.
    ///
    /// # Errors
    ///
    /// Returns a recorded async export failure, if any.
    pub async fn wait_for_exports(&self) -> EtlResult<()> {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Export task aborted");
            }
        }
        self.take_failure().map_or(Ok(()), Err)
    }

    /// Stop accepting flushes and drain queued exports. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a recorded async export failure, if any.
    pub async fn shutdown(&self) -> EtlResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Shutting down export buffer");
        }
        self.wait_for_exports().await
    }
}

struct ExportTask {
    batch: ExportBatch,
    seq: u64,
    exporters: Arc<Vec<Arc<dyn ItemExporter>>>,
    export_pool: Arc<Semaphore>,
    sequence: Arc<Mutex<ExportSequence>>,
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
    failure: Arc<Mutex<Option<EtlError>>>,
    record_failure: bool,
    crash: Option<CancellationToken>,
}

impl ExportTask {
    async fn export(&self) -> EtlResult<()> {
        let _worker = self
            .export_pool
            .acquire()
            .await
            .map_err(|_| EtlError::cancelled("export pool closed"))?;
        for exporter in self.exporters.iter() {
            exporter.export_batch(&self.batch).await.map_err(|e| {
                EtlError::export(
                    format!("{} export of {} failed: {e}", exporter.name(), self.batch.range),
                    Some(Box::new(e)),
                )
            })?;
        }
        Ok(())
    }

    async fn run(self) -> EtlResult<()> {
        let range = self.batch.range;
        match self.export().await {
            Ok(()) => {
                let advanced = self
                    .sequence
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .complete(self.seq);
                info!(%range, entities = self.batch.len(), "Export completed");
                if let (Some(cursor), Some(callback)) = (advanced, &self.on_success) {
                    callback(cursor);
                }
                Ok(())
            }
            Err(err) => {
                self.sequence
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .fail(self.seq);
                error!(%range, error = %err, "Export failed");
                if let Some(callback) = &self.on_failure {
                    callback(range, &err);
                }
                if self.record_failure {
                    let mut slot = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
                    if slot.is_none() {
                        *slot = Some(err.detached());
                    }
                }
                if let Some(token) = &self.crash {
                    token.cancel();
                }
                Err(err)
            }
        }
    }
}
