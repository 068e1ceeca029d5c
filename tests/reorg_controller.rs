//! Reorg repair end to end: synced SQLite store, mock node with forked blocks.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_retry, harness, harness_with, Harness, MockChain, SwitchExporter};
use eth_stream_etl::buffer::ExportOptions;
use eth_stream_etl::controller::{
    FixJobStore, ReorgController, ReorgOptions, ReorgOutcome, ReorgRequest, SqliteFixJobStore,
};
use eth_stream_etl::domain::{BlockRange, EntityType, FixJobStatus};
use eth_stream_etl::export::ItemExporter;
use eth_stream_etl::rpc::RpcChain;

const FRESH: Duration = Duration::from_secs(600);

async fn synced() -> Harness {
    let h = harness(MockChain::new(600), &[EntityType::Block, EntityType::TokenTransfer]).await;
    h.scheduler
        .run_jobs(BlockRange::new(480, 510).expect("range"), false)
        .await
        .expect("initial sync");
    h
}

fn controller(h: &Harness, store: Arc<SqliteFixJobStore>) -> ReorgController {
    ReorgController::new(
        h.scheduler.clone(),
        Arc::new(RpcChain::new(h.chain.clone())),
        Arc::new(h.repository.clone()),
        store,
        ReorgOptions {
            stale_after: FRESH,
            retry: fast_retry(),
        },
    )
}

fn reorg_batches(h: &Harness) -> Vec<BlockRange> {
    h.memory
        .batches()
        .into_iter()
        .filter(|b| b.reorg)
        .map(|b| b.range)
        .collect()
}

#[tokio::test]
async fn test_only_divergent_blocks_are_reexported() {
    let h = synced().await;
    let store = Arc::new(SqliteFixJobStore::new(h.repository.clone()));
    let stale = h.repository.block_hash(498).await.expect("hash");

    h.chain.reorg(&[498, 495]);
    let outcome = controller(&h, store.clone())
        .action(ReorgRequest::New {
            block_number: 500,
            ranges: 10,
        })
        .await
        .expect("repair");

    let ReorgOutcome::Completed { job, repaired } = outcome else {
        unreachable!("no other job is running");
    };
    assert_eq!(repaired, vec![498, 495]);
    assert_eq!(job.last_fixed_block, 490);
    assert_eq!(job.remaining, 0);
    assert_eq!(job.status, FixJobStatus::Completed);

    assert_eq!(
        reorg_batches(&h),
        vec![BlockRange::single(498), BlockRange::single(495)]
    );
    let fresh = h.repository.block_hash(498).await.expect("hash");
    assert_ne!(fresh, stale);
    assert_eq!(fresh, Some(h.chain.canonical_hash(498)));
    assert_eq!(
        h.repository.block_hash(495).await.expect("hash"),
        Some(h.chain.canonical_hash(495))
    );

    let stored = store.get(job.id).await.expect("get").expect("persisted");
    assert_eq!(stored.status, FixJobStatus::Completed);
    assert_eq!((stored.last_fixed_block, stored.remaining), (490, 0));

    // Re-exported rows replace the stale ones instead of piling up.
    assert_eq!(h.repository.count(EntityType::Block).await.expect("count"), 31);
    assert_eq!(
        h.repository
            .count(EntityType::TokenTransfer)
            .await
            .expect("count"),
        16
    );
}

#[tokio::test]
async fn test_second_job_is_refused_while_one_runs() {
    let h = synced().await;
    let store = Arc::new(SqliteFixJobStore::new(h.repository.clone()));
    let running = store
        .create_running(800, 801, 5, FRESH)
        .await
        .expect("create")
        .expect("slot free");

    h.chain.reorg(&[498]);
    let outcome = controller(&h, store.clone())
        .action(ReorgRequest::New {
            block_number: 500,
            ranges: 10,
        })
        .await
        .expect("busy is not an error");

    assert_eq!(outcome, ReorgOutcome::Busy);
    assert!(reorg_batches(&h).is_empty());
    assert!(store.get(running.id + 1).await.expect("get").is_none());
    assert_eq!(
        store.get(running.id).await.expect("get").map(|j| j.status),
        Some(FixJobStatus::Running)
    );
}

#[tokio::test]
async fn test_interrupted_job_resumes_from_checkpoint() {
    let h = synced().await;
    let store = Arc::new(SqliteFixJobStore::new(h.repository.clone()));
    let ctl = controller(&h, store.clone());

    h.chain.reorg(&[498, 495, 492]);
    h.chain.poison_block(495);

    let result = ctl
        .action(ReorgRequest::New {
            block_number: 500,
            ranges: 10,
        })
        .await;
    assert!(result.is_err_and(|e| e.is_crashable()));

    let interrupted = store
        .next_unfinished()
        .await
        .expect("query")
        .expect("job left unfinished");
    assert_eq!(interrupted.status, FixJobStatus::Interrupt);
    assert_eq!(interrupted.last_fixed_block, 496);
    assert_eq!(interrupted.remaining, 6);

    let outcome = ctl
        .action(ReorgRequest::Resume(interrupted.id))
        .await
        .expect("resume");
    let ReorgOutcome::Completed { job, repaired } = outcome else {
        unreachable!("no other job is running");
    };
    assert_eq!(repaired, vec![495, 492]);
    assert_eq!(job.last_fixed_block, 490);
    assert!(store.next_unfinished().await.expect("query").is_none());
}

#[tokio::test]
async fn test_drain_finishes_every_unfinished_job() {
    let h = synced().await;
    let store = Arc::new(SqliteFixJobStore::new(h.repository.clone()));
    for start in [505, 495] {
        let job = store
            .create_running(start, start + 1, 3, FRESH)
            .await
            .expect("create")
            .expect("slot free");
        store
            .set_status(job.id, FixJobStatus::Interrupt)
            .await
            .expect("interrupt");
    }

    h.chain.reorg(&[504, 493]);
    let completed = controller(&h, store.clone()).drain().await.expect("drain");

    assert_eq!(completed, 2);
    assert_eq!(
        reorg_batches(&h),
        vec![BlockRange::single(504), BlockRange::single(493)]
    );
    assert!(store.next_unfinished().await.expect("query").is_none());
}

#[tokio::test]
async fn test_resuming_completed_job_is_a_no_op() {
    let h = synced().await;
    let store = Arc::new(SqliteFixJobStore::new(h.repository.clone()));
    let ctl = controller(&h, store.clone());

    let ReorgOutcome::Completed { job, .. } = ctl
        .action(ReorgRequest::New {
            block_number: 485,
            ranges: 2,
        })
        .await
        .expect("repair")
    else {
        unreachable!("no other job is running");
    };

    let again = ctl.action(ReorgRequest::Resume(job.id)).await.expect("resume");
    assert_eq!(
        again,
        ReorgOutcome::Completed {
            job: store.get(job.id).await.expect("get").expect("persisted"),
            repaired: vec![],
        }
    );
}

#[tokio::test]
async fn test_async_export_failure_keeps_block_unfixed() {
    let sink = Arc::new(SwitchExporter::default());
    let h = harness_with(
        MockChain::new(600),
        &[EntityType::Block, EntityType::TokenTransfer],
        ExportOptions {
            sync_export: false,
            crash_instantly: false,
            ..ExportOptions::default()
        },
        vec![sink.clone() as Arc<dyn ItemExporter>],
    )
    .await;
    h.scheduler
        .run_jobs(BlockRange::new(480, 510).expect("range"), false)
        .await
        .expect("initial sync");
    h.buffer.wait_for_exports().await.expect("initial exports");

    let store = Arc::new(SqliteFixJobStore::new(h.repository.clone()));
    let ctl = controller(&h, store.clone());
    h.chain.reorg(&[500]);
    sink.set_failing(true);

    let result = ctl
        .action(ReorgRequest::New {
            block_number: 500,
            ranges: 2,
        })
        .await;
    assert!(result.is_err());

    let interrupted = store
        .next_unfinished()
        .await
        .expect("query")
        .expect("job left unfinished");
    assert_eq!(interrupted.status, FixJobStatus::Interrupt);
    assert_eq!(interrupted.last_fixed_block, 501);
    assert_eq!(interrupted.remaining, 3);
    assert_ne!(
        h.repository.block_hash(500).await.expect("hash"),
        Some(h.chain.canonical_hash(500))
    );

    sink.set_failing(false);
    let outcome = ctl
        .action(ReorgRequest::Resume(interrupted.id))
        .await
        .expect("resume");
    let ReorgOutcome::Completed { job, repaired } = outcome else {
        unreachable!("no other job is running");
    };
    assert_eq!(repaired, vec![500]);
    assert_eq!((job.last_fixed_block, job.remaining), (498, 0));
    assert_eq!(
        h.repository.block_hash(500).await.expect("hash"),
        Some(h.chain.canonical_hash(500))
    );
}
