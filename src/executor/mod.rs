//! Bounded batch work executor with adaptive batch sizing.
//!
//! [`BatchWorkExecutor`] cuts a work list into batches and runs a handler on
//! each batch inside a bounded pool of tokio tasks. Batch sizes adapt to the
//! node: a retriable failure halves the size and re-runs the failed batch one
//! item at a time; sustained success grows the size back after a cooldown.
//!
//! # Flow
//!
//! ```text
//! execute(items) ──► acquire worker permit ──► cut batch at current size ──► spawn
//!                                                                             │
//!      ┌──────────── Ok ◄── handler(batch) ──► Err(retriable) ──► halve size  │
//!      ▼                                        │                 retry items │
//!  grow size (after cooldown)                   └─► Err(other) ──► first error┘
//! ```
//!
//! [`BatchWorkExecutor::wait`] joins every submitted batch and surfaces the
//! first error that could not be retried away.

mod batch_size;
mod progress;
mod retry;

pub use batch_size::{AdaptiveBatchSize, DEFAULT_GROWTH_COOLDOWN};
pub use progress::ProgressLogger;
pub use retry::{execute_with_retries, RetryPolicy};

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{EtlError, EtlResult};

/// Caller-supplied partitioning of the work list into batches.
pub type Splitter<T> = Arc<dyn Fn(Vec<T>) -> Vec<Vec<T>> + Send + Sync>;

/// Tuning for a [`BatchWorkExecutor`].
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Concurrent batches in flight
    pub max_workers: usize,
    /// Initial and maximum batch size
    pub batch_size: usize,
    /// Minimum time between a size change and the next growth step
    pub growth_cooldown: Duration,
    /// Retry policy for batches and single items after a retriable failure
    pub retry: RetryPolicy,
    /// Minimum time between progress log lines
    pub progress_interval: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_workers: 5,
            batch_size: 10,
            growth_cooldown: DEFAULT_GROWTH_COOLDOWN,
            retry: RetryPolicy::default(),
            progress_interval: Duration::from_secs(30),
        }
    }
}

/// Runs handlers over batches of work in a bounded task pool.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use eth_stream_etl::executor::{BatchWorkExecutor, ExecutorOptions};
///
/// # async fn example() -> eth_stream_etl::error::EtlResult<()> {
/// let executor = BatchWorkExecutor::new("demo", ExecutorOptions::default());
/// let seen = Arc::new(AtomicUsize::new(0));
/// let counter = seen.clone();
///
/// executor
///     .execute((0..100u64).collect(), move |batch: Vec<u64>| {
///         let counter = counter.clone();
///         async move {
///             counter.fetch_add(batch.len(), Ordering::SeqCst);
///             Ok(())
///         }
///     }, None, None)
///     .await?;
/// executor.wait().await?;
/// assert_eq!(seen.load(Ordering::SeqCst), 100);
/// # Ok(())
/// # }
/// ```
pub struct BatchWorkExecutor {
    name: String,
    options: ExecutorOptions,
    batch_size: Arc<AdaptiveBatchSize>,
    workers: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    first_error: Arc<Mutex<Option<EtlError>>>,
    progress: Mutex<Option<Arc<ProgressLogger>>>,
    shutdown: CancellationToken,
}

/// Everything a spawned batch needs besides the batch itself.
struct BatchRun<H> {
    handler: Arc<H>,
    batch_size: Arc<AdaptiveBatchSize>,
    retry: RetryPolicy,
    progress: Arc<ProgressLogger>,
    first_error: Arc<Mutex<Option<EtlError>>>,
    split_by_caller: bool,
}

impl<H> Clone for BatchRun<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            batch_size: self.batch_size.clone(),
            retry: self.retry,
            progress: self.progress.clone(),
            first_error: self.first_error.clone(),
            split_by_caller: self.split_by_caller,
        }
    }
}

impl BatchWorkExecutor {
    /// Create an executor; `name` labels its log lines.
    pub fn new(name: impl Into<String>, options: ExecutorOptions) -> Self {
        let workers = options.max_workers.max(1);
        Self {
            name: name.into(),
            batch_size: Arc::new(AdaptiveBatchSize::new(
                options.batch_size,
                options.growth_cooldown,
            )),
            workers: Arc::new(Semaphore::new(workers)),
            tasks: Mutex::new(JoinSet::new()),
            first_error: Arc::new(Mutex::new(None)),
            progress: Mutex::new(None),
            shutdown: CancellationToken::new(),
            options,
        }
    }

    /// Current adaptive batch size.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size.current()
    }

    /// Configured maximum concurrent batches.
    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.options.max_workers.max(1)
    }

    fn has_failed(&self) -> bool {
        self.first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Submit `items` for processing.
    ///
    /// Without a `splitter`, each batch is cut at the adaptive size current
    /// when a worker frees up, so later batches see earlier shrinks. With a
    /// `splitter`, batches are taken as given and retried whole.
    ///
    /// Submission stops early once a batch has failed for good or the
    /// executor is shut down; call [`wait`](Self::wait) to learn why.
    ///
    /// # Errors
    ///
    /// Returns a cancellation error if the worker pool has been closed.
    pub async fn execute<T, H, Fut>(
        &self,
        items: Vec<T>,
        handler: H,
        total_items: Option<usize>,
        splitter: Option<Splitter<T>>,
    ) -> EtlResult<()>
    where
        T: Clone + Send + Sync + 'static,
        H: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EtlResult<()>> + Send + 'static,
    {
        let progress = Arc::new(ProgressLogger::new(
            self.name.clone(),
            Some(total_items.unwrap_or(items.len())),
            self.options.progress_interval,
        ));
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = Some(progress.clone());

        let run = BatchRun {
            handler: Arc::new(handler),
            batch_size: self.batch_size.clone(),
            retry: self.options.retry,
            progress,
            first_error: self.first_error.clone(),
            split_by_caller: splitter.is_some(),
        };

        if let Some(split) = splitter {
            for batch in split(items) {
                if batch.is_empty() {
                    continue;
                }
                let Some(permit) = self.acquire_worker().await? else {
                    break;
                };
                let observed = batch.len();
                self.spawn_batch(batch, observed, permit, run.clone());
            }
            return Ok(());
        }

        let mut iter = items.into_iter().peekable();
        while iter.peek().is_some() {
            let Some(permit) = self.acquire_worker().await? else {
                break;
            };
            let observed = self.batch_size.current();
            let batch: Vec<T> = iter.by_ref().take(observed).collect();
            self.spawn_batch(batch, observed, permit, run.clone());
        }
        Ok(())
    }

    /// Wait for a free worker; `None` means submission should stop.
    ///
    /// Batches already running are never interrupted.
    async fn acquire_worker(&self) -> EtlResult<Option<OwnedSemaphorePermit>> {
        if self.has_failed() || self.shutdown.is_cancelled() {
            return Ok(None);
        }
        let permit = tokio::select! {
            () = self.shutdown.cancelled() => return Ok(None),
            permit = self.workers.clone().acquire_owned() => permit
                .map_err(|_| EtlError::cancelled("executor worker pool closed"))?,
        };
        // The worker may have been freed by the batch that just failed.
        if self.has_failed() {
            return Ok(None);
        }
        Ok(Some(permit))
    }

    fn spawn_batch<T, H, Fut>(
        &self,
        batch: Vec<T>,
        observed: usize,
        permit: OwnedSemaphorePermit,
        run: BatchRun<H>,
    ) where
        T: Clone + Send + Sync + 'static,
        H: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EtlResult<()>> + Send + 'static,
    {
        let name = self.name.clone();
        let len = batch.len();
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spawn(async move {
                let result = AssertUnwindSafe(run_batch(batch, observed, &run))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(EtlError::state(format!("{name} batch handler panicked"), None))
                    });

                match result {
                    Ok(()) => run.progress.track(len),
                    Err(err) => {
                        error!(work = %name, batch_len = len, error = %err, "Batch failed");
                        let mut slot = run.first_error.lock().unwrap_or_else(PoisonError::into_inner);
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                    }
                }
                drop(permit);
            });
    }

    /// Wait for every submitted batch to finish.
    ///
    /// The executor can be reused afterwards; the recorded error is cleared.
    ///
    /// # Errors
    ///
    /// Returns the first error that survived retries, if any.
    pub async fn wait(&self) -> EtlResult<()> {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                let mut slot = self.first_error.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.is_none() {
                    *slot = Some(EtlError::state(
                        format!("{} batch task aborted", self.name),
                        Some(Box::new(err)),
                    ));
                }
            }
        }

        if let Some(progress) = self.progress.lock().unwrap_or_else(PoisonError::into_inner).take() {
            progress.finish();
        }

        match self.first_error.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stop accepting work and wait for in-flight batches. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the first error recorded by in-flight batches.
    pub async fn shutdown(&self) -> EtlResult<()> {
        self.shutdown.cancel();
        self.wait().await
    }
}

async fn run_batch<T, H, Fut>(batch: Vec<T>, observed: usize, run: &BatchRun<H>) -> EtlResult<()>
where
    T: Clone + Send + Sync + 'static,
    H: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EtlResult<()>> + Send + 'static,
{
    match (run.handler)(batch.clone()).await {
        Ok(()) => {
            run.batch_size.on_success();
            Ok(())
        }
        Err(err) if err.is_retriable() => {
            if run.split_by_caller {
                warn!(batch_len = batch.len(), error = %err, "Batch failed, retrying whole batch");
                return execute_with_retries("batch", run.retry, || (run.handler)(batch.clone())).await;
            }

            let size = run.batch_size.on_failure(observed);
            warn!(
                batch_len = batch.len(),
                new_batch_size = size,
                error = %err,
                "Batch failed, retrying items one by one"
            );
            for item in batch {
                execute_with_retries("item", run.retry, || (run.handler)(vec![item.clone()])).await?;
            }
            debug!("Item-level retry recovered batch");
            Ok(())
        }
        Err(err) => Err(err),
    }
}
