//! Fix-job and local block storage used by the reorg controller.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use alloy::primitives::B256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::Repository;
use crate::domain::{FixJob, FixJobStatus};
use crate::error::{EtlError, EtlResult};

/// Persistence of [`FixJob`]s.
///
/// `create_running` and `claim` are the single-flight points: each
/// atomically refuses when another live job is `running`. A running job
/// whose last checkpoint is older than `stale_after` is treated as
/// abandoned and demoted to `interrupt` first.
#[async_trait]
pub trait FixJobStore: Send + Sync {
    /// Insert a job already marked running, or `None` if busy.
    async fn create_running(
        &self,
        start_block: u64,
        last_fixed_block: u64,
        remaining: u64,
        stale_after: Duration,
    ) -> EtlResult<Option<FixJob>>;

    /// Mark an unfinished job running, or `None` if busy or not claimable.
    async fn claim(&self, id: i64, stale_after: Duration) -> EtlResult<Option<FixJob>>;

    /// Load a job.
    async fn get(&self, id: i64) -> EtlResult<Option<FixJob>>;

    /// Checkpoint after one processed block.
    async fn save_progress(&self, id: i64, last_fixed_block: u64, remaining: u64) -> EtlResult<()>;

    /// Move a job to `status`.
    async fn set_status(&self, id: i64, status: FixJobStatus) -> EtlResult<()>;

    /// Oldest job that has not completed.
    async fn next_unfinished(&self) -> EtlResult<Option<FixJob>>;
}

/// Block hashes of what was exported locally.
#[async_trait]
pub trait LocalBlockStore: Send + Sync {
    /// Stored hash of block `number`, `None` if it was never synced.
    async fn block_hash(&self, number: u64) -> EtlResult<Option<B256>>;
}

fn cutoff(stale_after: Duration) -> DateTime<Utc> {
    let age = chrono::Duration::from_std(stale_after)
        .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
    Utc::now()
        .checked_sub_signed(age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// In-process store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryFixJobStore {
    jobs: Mutex<BTreeMap<i64, FixJob>>,
}

impl MemoryFixJobStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored job, by id.
    #[must_use]
    pub fn jobs(&self) -> Vec<FixJob> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<i64, FixJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, id: i64, apply: impl FnOnce(&mut FixJob)) -> EtlResult<()> {
        let mut jobs = self.lock();
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| EtlError::state(format!("unknown fix job {id}"), None))?;
        apply(job);
        job.updated_at = Utc::now();
        Ok(())
    }
}

fn demote_stale(jobs: &mut BTreeMap<i64, FixJob>, stale_after: Duration) {
    let cutoff = cutoff(stale_after);
    for job in jobs.values_mut() {
        if job.status == FixJobStatus::Running && job.updated_at <= cutoff {
            job.status = FixJobStatus::Interrupt;
        }
    }
}

fn any_running(jobs: &BTreeMap<i64, FixJob>) -> bool {
    jobs.values().any(|j| j.status == FixJobStatus::Running)
}

#[async_trait]
impl FixJobStore for MemoryFixJobStore {
    async fn create_running(
        &self,
        start_block: u64,
        last_fixed_block: u64,
        remaining: u64,
        stale_after: Duration,
    ) -> EtlResult<Option<FixJob>> {
        let mut jobs = self.lock();
        demote_stale(&mut jobs, stale_after);
        if any_running(&jobs) {
            return Ok(None);
        }
        let id = jobs.keys().next_back().map_or(1, |last| last + 1);
        let now = Utc::now();
        let job = FixJob {
            id,
            start_block,
            last_fixed_block,
            remaining,
            status: FixJobStatus::Running,
            created_at: now,
            updated_at: now,
        };
        jobs.insert(id, job.clone());
        Ok(Some(job))
    }

    async fn claim(&self, id: i64, stale_after: Duration) -> EtlResult<Option<FixJob>> {
        let mut jobs = self.lock();
        demote_stale(&mut jobs, stale_after);
        if any_running(&jobs) {
            return Ok(None);
        }
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.status == FixJobStatus::Completed {
            return Ok(None);
        }
        job.status = FixJobStatus::Running;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn get(&self, id: i64) -> EtlResult<Option<FixJob>> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn save_progress(&self, id: i64, last_fixed_block: u64, remaining: u64) -> EtlResult<()> {
        self.update(id, |job| {
            job.last_fixed_block = last_fixed_block;
            job.remaining = remaining;
        })
    }

    async fn set_status(&self, id: i64, status: FixJobStatus) -> EtlResult<()> {
        self.update(id, |job| job.status = status)
    }

    async fn next_unfinished(&self) -> EtlResult<Option<FixJob>> {
        Ok(self
            .lock()
            .values()
            .filter(|j| j.status != FixJobStatus::Completed)
            .min_by_key(|j| (j.created_at, j.id))
            .cloned())
    }
}

/// Repository-backed store.
#[derive(Debug, Clone)]
pub struct SqliteFixJobStore {
    repository: Repository,
}

impl SqliteFixJobStore {
    /// Store in `repository`'s `fix_jobs` table.
    #[must_use]
    pub const fn new(repository: Repository) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl FixJobStore for SqliteFixJobStore {
    async fn create_running(
        &self,
        start_block: u64,
        last_fixed_block: u64,
        remaining: u64,
        stale_after: Duration,
    ) -> EtlResult<Option<FixJob>> {
        self.repository
            .create_running_fix_job(
                start_block,
                last_fixed_block,
                remaining,
                cutoff(stale_after).timestamp_millis(),
            )
            .await
    }

    async fn claim(&self, id: i64, stale_after: Duration) -> EtlResult<Option<FixJob>> {
        self.repository
            .claim_fix_job(id, cutoff(stale_after).timestamp_millis())
            .await
    }

    async fn get(&self, id: i64) -> EtlResult<Option<FixJob>> {
        self.repository.get_fix_job(id).await
    }

    async fn save_progress(&self, id: i64, last_fixed_block: u64, remaining: u64) -> EtlResult<()> {
        self.repository
            .save_fix_job_progress(id, last_fixed_block, remaining)
            .await
    }

    async fn set_status(&self, id: i64, status: FixJobStatus) -> EtlResult<()> {
        self.repository.set_fix_job_status(id, status).await
    }

    async fn next_unfinished(&self) -> EtlResult<Option<FixJob>> {
        self.repository.next_unfinished_fix_job().await
    }
}

#[async_trait]
impl LocalBlockStore for Repository {
    async fn block_hash(&self, number: u64) -> EtlResult<Option<B256>> {
        Self::block_hash(self, number).await
    }
}
