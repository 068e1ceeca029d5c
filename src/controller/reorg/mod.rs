//! Reorg repair.
//!
//! A [`FixJob`] walks backwards from a suspect block. For each block that
//! was synced locally, the stored hash is compared against the canonical
//! chain; a mismatch re-runs the reorg-capable jobs for that single block.
//! Progress is checkpointed after every block, so an interrupted job
//! resumes exactly where it stopped.
//!
//! Only one job may be `running` at a time. A process that cannot claim
//! the slot returns [`ReorgOutcome::Busy`] without touching any job.

mod store;

pub use store::{FixJobStore, LocalBlockStore, MemoryFixJobStore, SqliteFixJobStore};

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use super::runner::RangeRunner;
use crate::domain::{BlockRange, FixJob, FixJobStatus};
use crate::error::{EtlError, EtlResult};
use crate::executor::{execute_with_retries, RetryPolicy};
use crate::rpc::CanonicalChain;

/// Tuning for a [`ReorgController`].
#[derive(Debug, Clone, Copy)]
pub struct ReorgOptions {
    /// A running job without a checkpoint for this long is abandoned
    pub stale_after: Duration,
    /// Bounded retry of retriable single-block failures
    pub retry: RetryPolicy,
}

impl Default for ReorgOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(600),
            retry: RetryPolicy::default(),
        }
    }
}

/// What [`ReorgController::action`] should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorgRequest {
    /// Check `block_number` and the `ranges` blocks below it
    New {
        /// Suspect block
        block_number: u64,
        /// Blocks to walk below the suspect block
        ranges: u64,
    },
    /// Continue a persisted job
    Resume(i64),
}

/// How an [`action`](ReorgController::action) ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReorgOutcome {
    /// The job processed every block
    Completed {
        /// Final state of the job
        job: FixJob,
        /// Blocks found divergent and re-exported, in processing order
        repaired: Vec<u64>,
    },
    /// Another job holds the running slot
    Busy,
}

/// Drives [`FixJob`]s.
pub struct ReorgController {
    runner: Arc<dyn RangeRunner>,
    chain: Arc<dyn CanonicalChain>,
    local: Arc<dyn LocalBlockStore>,
    store: Arc<dyn FixJobStore>,
    options: ReorgOptions,
}

impl ReorgController {
    /// Wire a controller.
    pub fn new(
        runner: Arc<dyn RangeRunner>,
        chain: Arc<dyn CanonicalChain>,
        local: Arc<dyn LocalBlockStore>,
        store: Arc<dyn FixJobStore>,
        options: ReorgOptions,
    ) -> Self {
        Self {
            runner,
            chain,
            local,
            store,
            options,
        }
    }

    /// Start or resume a repair.
    ///
    /// A new request covers `block_number` down to `block_number - ranges`
    /// inclusive. Resuming a completed job returns it unchanged.
    ///
    /// # Errors
    ///
    /// Returns a state error for an unknown job id, a store error, or the
    /// failure that interrupted the walk (the job is left `interrupt`).
    #[instrument(skip(self))]
    pub async fn action(&self, request: ReorgRequest) -> EtlResult<ReorgOutcome> {
        let claimed = match request {
            ReorgRequest::New {
                block_number,
                ranges,
            } => {
                self.store
                    .create_running(
                        block_number,
                        block_number.saturating_add(1),
                        ranges.saturating_add(1),
                        self.options.stale_after,
                    )
                    .await?
            }
            ReorgRequest::Resume(id) => {
                let claimed = self.store.claim(id, self.options.stale_after).await?;
                if claimed.is_none() {
                    match self.store.get(id).await? {
                        None => {
                            return Err(EtlError::state(format!("unknown fix job {id}"), None))
                        }
                        Some(job) if job.status == FixJobStatus::Completed => {
                            return Ok(ReorgOutcome::Completed {
                                job,
                                repaired: Vec::new(),
                            })
                        }
                        Some(_) => {}
                    }
                }
                claimed
            }
        };

        let Some(job) = claimed else {
            info!("Another fix job is running, leaving it alone");
            return Ok(ReorgOutcome::Busy);
        };

        info!(
            job_id = job.id,
            start_block = job.start_block,
            last_fixed_block = job.last_fixed_block,
            remaining = job.remaining,
            "Fix job running"
        );
        self.walk(job).await
    }

    async fn walk(&self, mut job: FixJob) -> EtlResult<ReorgOutcome> {
        let mut repaired = Vec::new();

        if let Err(err) = self.advance(&mut job, &mut repaired).await {
            error!(
                job_id = job.id,
                last_fixed_block = job.last_fixed_block,
                remaining = job.remaining,
                error = %err,
                "Fix job interrupted"
            );
            if let Err(store_err) = self.store.set_status(job.id, FixJobStatus::Interrupt).await {
                error!(job_id = job.id, error = %store_err, "Failed to record interrupt");
            }
            return Err(err);
        }
        job.status = FixJobStatus::Completed;

        info!(
            job_id = job.id,
            last_fixed_block = job.last_fixed_block,
            repaired = repaired.len(),
            "Fix job completed"
        );
        Ok(ReorgOutcome::Completed { job, repaired })
    }

    /// Process every remaining block, then drain and mark the job completed.
    ///
    /// A checkpoint is written only after the block's export has settled, so
    /// a failure leaves the job pointing at the first unconfirmed block.
    async fn advance(&self, job: &mut FixJob, repaired: &mut Vec<u64>) -> EtlResult<()> {
        while let Some(block) = job.next_block() {
            if self.check_block(block).await? {
                repaired.push(block);
            }

            job.last_fixed_block = block;
            job.remaining -= 1;
            self.store
                .save_progress(job.id, job.last_fixed_block, job.remaining)
                .await?;
        }

        // Walked past genesis.
        if job.remaining > 0 {
            job.remaining = 0;
            self.store
                .save_progress(job.id, job.last_fixed_block, 0)
                .await?;
        }
        self.runner.drain().await?;
        self.store.set_status(job.id, FixJobStatus::Completed).await
    }

    /// Verify one block and re-export it if it diverged.
    ///
    /// Returns whether the block was repaired.
    async fn check_block(&self, block: u64) -> EtlResult<bool> {
        let Some(local) = self.local.block_hash(block).await? else {
            debug!(block, "Block not synced locally, skipping");
            return Ok(false);
        };

        let canonical = execute_with_retries("canonical hash", self.options.retry, || {
            self.chain.block_hash(block)
        })
        .await?;
        if canonical == Some(local) {
            return Ok(false);
        }

        warn!(block, %local, canonical = ?canonical, "Block diverged from canonical chain");
        let runner = self.runner.clone();
        execute_with_retries("reorg block", self.options.retry, || {
            let runner = runner.clone();
            async move {
                let result = runner.run_range(BlockRange::single(block), true).await;
                if result.is_err() {
                    runner.rewind();
                }
                result
            }
        })
        .await?;
        Ok(true)
    }

    /// Resume unfinished jobs, oldest first, until none remain.
    ///
    /// Returns how many jobs were completed; stops early if another process
    /// holds the running slot.
    ///
    /// # Errors
    ///
    /// Returns the first job failure.
    pub async fn drain(&self) -> EtlResult<usize> {
        let mut completed = 0;
        while let Some(job) = self.store.next_unfinished().await? {
            match self.action(ReorgRequest::Resume(job.id)).await? {
                ReorgOutcome::Completed { .. } => completed += 1,
                ReorgOutcome::Busy => break,
            }
        }
        info!(completed, "No fix jobs left to resume");
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::B256;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Local and canonical hashes agree except for `diverged` blocks.
    struct Chains {
        synced: std::ops::RangeInclusive<u64>,
        diverged: Vec<u64>,
    }

    fn local_hash(n: u64) -> B256 {
        B256::left_padding_from(&n.to_be_bytes())
    }

    #[async_trait]
    impl LocalBlockStore for Chains {
        async fn block_hash(&self, number: u64) -> EtlResult<Option<B256>> {
            Ok(self.synced.contains(&number).then(|| local_hash(number)))
        }
    }

    #[async_trait]
    impl CanonicalChain for Chains {
        async fn block_hash(&self, number: u64) -> EtlResult<Option<B256>> {
            if self.diverged.contains(&number) {
                Ok(Some(B256::repeat_byte(0xff)))
            } else {
                Ok(Some(local_hash(number)))
            }
        }
    }

    #[derive(Default)]
    struct Recording {
        runs: Mutex<Vec<(BlockRange, bool)>>,
        fail_on: Mutex<HashMap<u64, EtlError>>,
        drain_error: Mutex<Option<EtlError>>,
    }

    #[async_trait]
    impl RangeRunner for Recording {
        async fn run_range(&self, range: BlockRange, reorg: bool) -> EtlResult<()> {
            if let Some(err) = self.fail_on.lock().expect("lock").remove(&range.start) {
                return Err(err);
            }
            self.runs.lock().expect("lock").push((range, reorg));
            Ok(())
        }

        fn exported_cursor(&self) -> Option<u64> {
            None
        }

        async fn drain(&self) -> EtlResult<()> {
            match self.drain_error.lock().expect("lock").take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    /// Memory store whose checkpoint write fails once, on the given call.
    struct BrokenCheckpoint {
        inner: MemoryFixJobStore,
        calls: Mutex<usize>,
        fail_at: usize,
    }

    #[async_trait]
    impl FixJobStore for BrokenCheckpoint {
        async fn create_running(
            &self,
            start_block: u64,
            last_fixed_block: u64,
            remaining: u64,
            stale_after: Duration,
        ) -> EtlResult<Option<FixJob>> {
            self.inner
                .create_running(start_block, last_fixed_block, remaining, stale_after)
                .await
        }

        async fn claim(&self, id: i64, stale_after: Duration) -> EtlResult<Option<FixJob>> {
            self.inner.claim(id, stale_after).await
        }

        async fn get(&self, id: i64) -> EtlResult<Option<FixJob>> {
            self.inner.get(id).await
        }

        async fn save_progress(
            &self,
            id: i64,
            last_fixed_block: u64,
            remaining: u64,
        ) -> EtlResult<()> {
            let call = {
                let mut calls = self.calls.lock().expect("lock");
                *calls += 1;
                *calls
            };
            if call == self.fail_at {
                return Err(EtlError::state("database is locked", None));
            }
            self.inner.save_progress(id, last_fixed_block, remaining).await
        }

        async fn set_status(&self, id: i64, status: FixJobStatus) -> EtlResult<()> {
            self.inner.set_status(id, status).await
        }

        async fn next_unfinished(&self) -> EtlResult<Option<FixJob>> {
            self.inner.next_unfinished().await
        }
    }

    fn controller(
        runner: Arc<Recording>,
        chains: Arc<Chains>,
        store: Arc<dyn FixJobStore>,
    ) -> ReorgController {
        ReorgController::new(
            runner,
            chains.clone(),
            chains,
            store,
            ReorgOptions {
                stale_after: Duration::from_secs(600),
                retry: RetryPolicy {
                    max_attempts: 2,
                    sleep: Duration::ZERO,
                },
            },
        )
    }

    #[tokio::test]
    async fn test_only_divergent_blocks_are_rerun() {
        let runner = Arc::new(Recording::default());
        let chains = Arc::new(Chains {
            synced: 0..=1_000,
            diverged: vec![498, 495],
        });
        let store = Arc::new(MemoryFixJobStore::new());
        let ctl = controller(runner.clone(), chains, store);

        let outcome = ctl
            .action(ReorgRequest::New {
                block_number: 500,
                ranges: 10,
            })
            .await
            .expect("repair");

        let ReorgOutcome::Completed { job, repaired } = outcome else {
            unreachable!("single job cannot be busy");
        };
        assert_eq!(repaired, vec![498, 495]);
        assert_eq!(job.last_fixed_block, 490);
        assert_eq!(job.remaining, 0);
        assert_eq!(job.status, FixJobStatus::Completed);
        assert_eq!(
            *runner.runs.lock().expect("lock"),
            vec![(BlockRange::single(498), true), (BlockRange::single(495), true)]
        );
    }

    #[tokio::test]
    async fn test_unsynced_blocks_are_skipped() {
        let runner = Arc::new(Recording::default());
        let chains = Arc::new(Chains {
            synced: 0..=496,
            diverged: vec![498, 495],
        });
        let ctl = controller(runner, chains, Arc::new(MemoryFixJobStore::new()));

        let outcome = ctl
            .action(ReorgRequest::New {
                block_number: 500,
                ranges: 10,
            })
            .await
            .expect("repair");
        assert!(matches!(outcome, ReorgOutcome::Completed { ref repaired, .. } if repaired == &[495]));
    }

    #[tokio::test]
    async fn test_interrupt_then_resume_continues_from_checkpoint() {
        let runner = Arc::new(Recording::default());
        runner
            .fail_on
            .lock()
            .expect("lock")
            .insert(495, EtlError::crashable("missing trie node", None));
        let chains = Arc::new(Chains {
            synced: 0..=1_000,
            diverged: vec![498, 495, 492],
        });
        let store = Arc::new(MemoryFixJobStore::new());
        let ctl = controller(runner.clone(), chains, store.clone());

        let result = ctl
            .action(ReorgRequest::New {
                block_number: 500,
                ranges: 10,
            })
            .await;
        assert!(result.is_err_and(|e| e.is_crashable()));

        let job = store.jobs().pop().expect("job persisted");
        assert_eq!(job.status, FixJobStatus::Interrupt);
        assert_eq!(job.last_fixed_block, 496);
        assert_eq!(job.remaining, 6);

        let outcome = ctl.action(ReorgRequest::Resume(job.id)).await.expect("resume");
        let ReorgOutcome::Completed { job, repaired } = outcome else {
            unreachable!("no other job exists");
        };
        assert_eq!(repaired, vec![495, 492]);
        assert_eq!(job.last_fixed_block, 490);
        assert_eq!(job.status, FixJobStatus::Completed);
    }

    #[tokio::test]
    async fn test_second_request_while_running_is_busy() {
        let store = Arc::new(MemoryFixJobStore::new());
        store
            .create_running(800, 801, 5, Duration::from_secs(600))
            .await
            .expect("create");
        let before = store.jobs();

        let ctl = controller(
            Arc::new(Recording::default()),
            Arc::new(Chains {
                synced: 0..=1_000,
                diverged: vec![],
            }),
            store.clone(),
        );
        let outcome = ctl
            .action(ReorgRequest::New {
                block_number: 500,
                ranges: 10,
            })
            .await
            .expect("busy is not an error");

        assert_eq!(outcome, ReorgOutcome::Busy);
        assert_eq!(store.jobs(), before);
    }

    #[tokio::test]
    async fn test_drain_completes_interrupted_jobs() {
        let store = Arc::new(MemoryFixJobStore::new());
        for start in [300, 200] {
            let job = store
                .create_running(start, start + 1, 3, Duration::from_secs(600))
                .await
                .expect("create")
                .expect("created");
            store
                .set_status(job.id, FixJobStatus::Interrupt)
                .await
                .expect("interrupt");
        }

        let ctl = controller(
            Arc::new(Recording::default()),
            Arc::new(Chains {
                synced: 0..=1_000,
                diverged: vec![],
            }),
            store.clone(),
        );
        assert_eq!(ctl.drain().await.expect("drain"), 2);
        assert!(store
            .jobs()
            .iter()
            .all(|j| j.status == FixJobStatus::Completed));
    }

    #[tokio::test]
    async fn test_checkpoint_failure_interrupts_job() {
        let store = Arc::new(BrokenCheckpoint {
            inner: MemoryFixJobStore::new(),
            calls: Mutex::new(0),
            fail_at: 3,
        });
        let chains = Arc::new(Chains {
            synced: 0..=1_000,
            diverged: vec![],
        });
        let ctl = controller(Arc::new(Recording::default()), chains, store.clone());

        let result = ctl
            .action(ReorgRequest::New {
                block_number: 500,
                ranges: 10,
            })
            .await;
        assert!(matches!(result, Err(EtlError::StateError { .. })));

        let job = store.inner.jobs().pop().expect("job persisted");
        assert_eq!(job.status, FixJobStatus::Interrupt);
        assert_eq!(job.last_fixed_block, 499);
        assert_eq!(job.remaining, 9);

        // The slot is free again, so a new request is not refused as busy.
        let outcome = ctl
            .action(ReorgRequest::New {
                block_number: 700,
                ranges: 1,
            })
            .await
            .expect("second job");
        assert!(matches!(outcome, ReorgOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn test_drain_failure_leaves_job_interrupted() {
        let runner = Arc::new(Recording::default());
        *runner.drain_error.lock().expect("lock") =
            Some(EtlError::crashable("export rejected", None));
        let store = Arc::new(MemoryFixJobStore::new());
        let ctl = controller(
            runner,
            Arc::new(Chains {
                synced: 0..=1_000,
                diverged: vec![498],
            }),
            store.clone(),
        );

        let result = ctl
            .action(ReorgRequest::New {
                block_number: 500,
                ranges: 3,
            })
            .await;
        assert!(result.is_err_and(|e| e.is_crashable()));

        let job = store.jobs().pop().expect("job persisted");
        assert_eq!(job.status, FixJobStatus::Interrupt);
        assert_eq!(job.remaining, 0);

        let outcome = ctl.action(ReorgRequest::Resume(job.id)).await.expect("resume");
        let ReorgOutcome::Completed { job, repaired } = outcome else {
            unreachable!("no other job exists");
        };
        assert!(repaired.is_empty());
        assert_eq!(job.status, FixJobStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_unknown_job_fails() {
        let ctl = controller(
            Arc::new(Recording::default()),
            Arc::new(Chains {
                synced: 0..=1,
                diverged: vec![],
            }),
            Arc::new(MemoryFixJobStore::new()),
        );
        assert!(matches!(
            ctl.action(ReorgRequest::Resume(42)).await,
            Err(EtlError::StateError { .. })
        ));
    }
}
