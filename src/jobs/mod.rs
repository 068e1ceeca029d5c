//! Extraction jobs and their registry.
//!
//! A [`Job`] reads entity types from the run's [`ExportBuffer`], fetches
//! whatever else it needs through the [`BatchWorkExecutor`], and writes its
//! declared output types back. Every job carries a static
//! [`JobDescriptor`]; the scheduler builds its dependency graph from those
//! descriptors alone.
//!
//! # Built-in jobs
//!
//! | Job                      | Reads               | Writes             |
//! |--------------------------|---------------------|--------------------|
//! | `export_blocks`          |                     | Block, Transaction |
//! | `export_receipts`        | Transaction         | Receipt, Log       |
//! | `export_token_transfers` | Log                 | TokenTransfer      |
//! | `export_coin_balances`   | Block, Transaction  | CoinBalance        |
//! | `export_contracts`       | Receipt             | Contract           |

pub mod blocks;
pub mod coin_balances;
pub mod contracts;
pub mod filter;
pub mod receipts;
pub mod token_transfers;

pub use blocks::ExportBlocksJob;
pub use coin_balances::ExportCoinBalancesJob;
pub use contracts::ExportContractsJob;
pub use filter::{FilterSpec, TopicFilter, TransactionFilter};
pub use receipts::ExportReceiptsJob;
pub use token_transfers::ExportTokenTransfersJob;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::buffer::ExportBuffer;
use crate::domain::{BlockRange, EntityType};
use crate::error::{EtlError, EtlResult};
use crate::executor::BatchWorkExecutor;
use crate::rpc::{call_batch, JsonRpcRequest, RequestIds, RpcSource};

/// Static description of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobDescriptor {
    /// Unique job name
    pub name: &'static str,
    /// Entity types read from the buffer
    pub dependency_types: &'static [EntityType],
    /// Entity types written to the buffer
    pub output_types: &'static [EntityType],
    /// Safe to re-run for a single block during reorg repair
    pub reorg_capable: bool,
    /// Forwards raw chain data and honours the scheduler's narrowing filter
    pub raw_source: bool,
}

/// Everything a job sees during one scheduler run.
#[derive(Clone)]
pub struct JobContext {
    /// Blocks being processed
    pub range: BlockRange,
    /// Node access
    pub source: Arc<dyn RpcSource>,
    /// Request id allocator for `source`
    pub ids: Arc<RequestIds>,
    /// Shared RPC worker pool
    pub executor: Arc<BatchWorkExecutor>,
    /// The run's typed buffer
    pub buffer: Arc<ExportBuffer>,
    /// Combined filter raw-source jobs may narrow their fetch with
    pub narrowing: Option<FilterSpec>,
    /// Whether this run repairs a reorg
    pub reorg: bool,
}

impl JobContext {
    /// Run `handler` over `items` on the executor and wait for completion.
    ///
    /// # Errors
    ///
    /// Returns the first error that survived the executor's retries.
    pub async fn run_batched<T, H, Fut>(&self, items: Vec<T>, handler: H) -> EtlResult<()>
    where
        T: Clone + Send + Sync + 'static,
        H: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EtlResult<()>> + Send + 'static,
    {
        if items.is_empty() {
            return Ok(());
        }
        let total = items.len();
        self.executor
            .execute(items, handler, Some(total), None)
            .await?;
        self.executor.wait().await
    }
}

/// Build and send one batch of requests, returning results in order.
///
/// Shared by the built-in jobs' batch handlers.
pub(crate) async fn fetch_batch<T>(
    source: &dyn RpcSource,
    ids: &RequestIds,
    items: &[T],
    build: impl Fn(u64, &T) -> JsonRpcRequest,
) -> EtlResult<Vec<Value>> {
    let requests = items.iter().map(|item| build(ids.next(), item)).collect();
    call_batch(source, requests).await
}

/// A typed extraction unit.
#[async_trait]
pub trait Job: Send + Sync {
    /// Static declaration used for dependency resolution.
    fn descriptor(&self) -> &'static JobDescriptor;

    /// Optional predicate narrowing which raw items the job processes.
    fn filter(&self) -> Option<FilterSpec> {
        None
    }

    /// Extract this job's outputs for `ctx.range`.
    ///
    /// Producing no output is not an error.
    async fn run(&self, ctx: &JobContext) -> EtlResult<()>;
}

/// Explicit registry of available jobs.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Vec<Arc<dyn Job>>,
}

impl JobRegistry {
    /// Registry without any job.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding the built-in jobs.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            jobs: vec![
                Arc::new(ExportBlocksJob),
                Arc::new(ExportReceiptsJob),
                Arc::new(ExportTokenTransfersJob),
                Arc::new(ExportCoinBalancesJob),
                Arc::new(ExportContractsJob::default()),
            ],
        }
    }

    /// Add a job.
    ///
    /// # Errors
    ///
    /// Returns a job error if a job with the same name is registered.
    pub fn register(&mut self, job: Arc<dyn Job>) -> EtlResult<()> {
        let name = job.descriptor().name;
        if self.jobs.iter().any(|j| j.descriptor().name == name) {
            return Err(EtlError::job(format!("job '{name}' registered twice"), None));
        }
        self.jobs.push(job);
        Ok(())
    }

    /// Registered jobs in registration order.
    #[must_use]
    pub fn jobs(&self) -> &[Arc<dyn Job>] {
        &self.jobs
    }

    /// Look a job up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Job>> {
        self.jobs.iter().find(|j| j.descriptor().name == name)
    }
}
