//! Job scheduler.
//!
//! Resolves the registered jobs needed for a set of output types into a
//! dependency-ordered plan once, at construction, and then runs that plan
//! over one block range at a time:
//!
//! 1. clear the run's typed buffer
//! 2. run each job in order against a shared [`JobContext`]
//! 3. hand the buffer to the export service via `check_and_flush`
//!
//! A dependency cycle or an output type nobody produces fails in
//! [`JobScheduler::new`], never mid-run.
//!
//! # Narrowing
//!
//! When the caller only wants derived types (nothing raw besides blocks)
//! and every derived job declares a filter, the union of those filters is
//! handed to raw-source jobs so they can skip transactions no derived job
//! will look at.

mod resolve;

pub use resolve::{reorg_subset, resolve};

use std::sync::Arc;

use tracing::{debug, error, info, instrument};

use crate::buffer::{ExportBuffer, FlushRequest};
use crate::domain::{BlockRange, EntityType};
use crate::error::EtlResult;
use crate::executor::BatchWorkExecutor;
use crate::jobs::{FilterSpec, Job, JobContext, JobRegistry};
use crate::rpc::{LogFilterWire, RequestIds, RpcSource};

/// Flush name used for forward-sync runs.
pub const STREAM_FLUSH: &str = "stream";

/// Flush name used for reorg repair runs.
pub const REORG_FLUSH: &str = "reorg";

/// Runs a resolved job plan over block ranges.
pub struct JobScheduler {
    jobs: Vec<Arc<dyn Job>>,
    reorg_jobs: Vec<Arc<dyn Job>>,
    output_types: Vec<EntityType>,
    narrowing: Option<FilterSpec>,
    source: Arc<dyn RpcSource>,
    ids: Arc<RequestIds>,
    executor: Arc<BatchWorkExecutor>,
    buffer: Arc<ExportBuffer>,
}

impl JobScheduler {
    /// Resolve the plan for `required` and bind it to its collaborators.
    ///
    /// # Errors
    ///
    /// Returns a job error on a dependency cycle or when a type in the
    /// dependency closure has no producer.
    pub fn new(
        registry: &JobRegistry,
        required: &[EntityType],
        source: Arc<dyn RpcSource>,
        executor: Arc<BatchWorkExecutor>,
        buffer: Arc<ExportBuffer>,
    ) -> EtlResult<Self> {
        let jobs = resolve(registry, required)?;
        let reorg_jobs = reorg_subset(&jobs);

        let mut output_types: Vec<EntityType> = jobs
            .iter()
            .flat_map(|j| j.descriptor().output_types.iter().copied())
            .collect();
        output_types.sort_unstable();
        output_types.dedup();

        let narrowing = narrowing_filter(&jobs, required);

        info!(
            jobs = ?jobs.iter().map(|j| j.descriptor().name).collect::<Vec<_>>(),
            reorg_jobs = reorg_jobs.len(),
            narrowed = narrowing.is_some(),
            "Resolved job plan"
        );

        Ok(Self {
            jobs,
            reorg_jobs,
            output_types,
            narrowing,
            source,
            ids: Arc::new(RequestIds::default()),
            executor,
            buffer,
        })
    }

    /// Job names in execution order.
    #[must_use]
    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|j| j.descriptor().name).collect()
    }

    /// Job names run during reorg repair, in execution order.
    #[must_use]
    pub fn reorg_job_names(&self) -> Vec<&'static str> {
        self.reorg_jobs.iter().map(|j| j.descriptor().name).collect()
    }

    /// Every type the plan writes.
    #[must_use]
    pub fn output_types(&self) -> &[EntityType] {
        &self.output_types
    }

    /// Combined filter offered to raw-source jobs, if narrowing applies.
    #[must_use]
    pub fn narrowing(&self) -> Option<&FilterSpec> {
        self.narrowing.as_ref()
    }

    /// The narrowing filter in `eth_getLogs` form, when expressible.
    #[must_use]
    pub fn wire_filter(&self) -> Option<LogFilterWire> {
        self.narrowing.as_ref().and_then(FilterSpec::to_wire)
    }

    /// Export buffer this scheduler flushes into.
    #[must_use]
    pub fn buffer(&self) -> &Arc<ExportBuffer> {
        &self.buffer
    }

    /// Run the plan over `range` and flush the result.
    ///
    /// Reorg runs use the reorg-capable subset of the plan.
    ///
    /// # Errors
    ///
    /// Returns the first job error, aborting the range, or the flush error.
    #[instrument(skip(self), fields(start_block = range.start, end_block = range.end))]
    pub async fn run_jobs(&self, range: BlockRange, reorg: bool) -> EtlResult<()> {
        self.buffer.clear().await;

        let ctx = JobContext {
            range,
            source: self.source.clone(),
            ids: self.ids.clone(),
            executor: self.executor.clone(),
            buffer: self.buffer.clone(),
            narrowing: self.narrowing.clone(),
            reorg,
        };

        let plan = if reorg { &self.reorg_jobs } else { &self.jobs };
        for job in plan {
            let name = job.descriptor().name;
            debug!(job = name, "Running job");
            if let Err(err) = job.run(&ctx).await {
                error!(job = name, error = %err, "Job failed, aborting range");
                return Err(err);
            }
        }

        self.buffer
            .check_and_flush(FlushRequest {
                job_name: if reorg { REORG_FLUSH } else { STREAM_FLUSH },
                output_types: &self.output_types,
                range,
                reorg,
            })
            .await
    }
}

/// Union of the derived jobs' filters, when narrowing raw fetches is safe.
fn narrowing_filter(jobs: &[Arc<dyn Job>], required: &[EntityType]) -> Option<FilterSpec> {
    let wants_raw = required.iter().any(|ty| {
        matches!(
            ty,
            EntityType::Transaction | EntityType::Receipt | EntityType::Log
        )
    });
    if wants_raw {
        return None;
    }

    let mut filters = Vec::new();
    for job in jobs.iter().filter(|j| !j.descriptor().raw_source) {
        filters.push(job.filter()?);
    }
    FilterSpec::any_of(filters)
}
