//! Blocks and transactions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use alloy::primitives::B256;
use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{fetch_batch, FilterSpec, Job, JobContext, JobDescriptor};
use crate::domain::{Entity, EntityType, LogRecord};
use crate::error::{EtlError, EtlResult};
use crate::rpc::json_rpc::{get_block_by_number, get_logs};
use crate::rpc::payload::{decode, RawBlock, RawLog};
use crate::rpc::LogFilterWire;

static DESCRIPTOR: JobDescriptor = JobDescriptor {
    name: "export_blocks",
    dependency_types: &[],
    output_types: &[EntityType::Block, EntityType::Transaction],
    reorg_capable: true,
    raw_source: true,
};

/// Fetches full blocks and splits them into block and transaction records.
///
/// With a narrowing filter, every block is kept but only transactions
/// matching the filter are. When the filter has a wire form, logs for the
/// range are pre-selected by the node with `eth_getLogs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportBlocksJob;

impl ExportBlocksJob {
    async fn fetch_filtered_logs(
        ctx: &JobContext,
        wire: LogFilterWire,
    ) -> EtlResult<HashMap<B256, Vec<LogRecord>>> {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = collected.clone();
        let source = ctx.source.clone();
        let ids = ctx.ids.clone();
        let wire = Arc::new(wire);

        ctx.run_batched(ctx.range.blocks().collect(), move |blocks: Vec<u64>| {
            let source = source.clone();
            let ids = ids.clone();
            let wire = wire.clone();
            let sink = sink.clone();
            async move {
                let (Some(&from), Some(&to)) = (blocks.first(), blocks.last()) else {
                    return Ok(());
                };
                let window = [(from, to)];
                let values = fetch_batch(source.as_ref(), &ids, &window, |id, &(from, to)| {
                    get_logs(id, from, to, &wire)
                })
                .await?;
                let mut logs = Vec::new();
                for value in values {
                    let raw: Vec<RawLog> = decode(value, "eth_getLogs result")?;
                    logs.extend(raw.into_iter().filter(|l| !l.removed).map(RawLog::into_record));
                }
                sink.lock().unwrap_or_else(PoisonError::into_inner).extend(logs);
                Ok(())
            }
        })
        .await?;

        let logs = std::mem::take(&mut *collected.lock().unwrap_or_else(PoisonError::into_inner));
        let mut by_tx: HashMap<B256, Vec<LogRecord>> = HashMap::new();
        for log in logs {
            by_tx.entry(log.transaction_hash).or_default().push(log);
        }
        Ok(by_tx)
    }

    async fn narrow_transactions(ctx: &JobContext, spec: &FilterSpec) -> EtlResult<()> {
        let logs_by_tx = match spec.to_wire() {
            Some(wire) => Self::fetch_filtered_logs(ctx, wire).await?,
            None => HashMap::new(),
        };

        let transactions = ctx.buffer.get(EntityType::Transaction).await;
        let before = transactions.len();
        let kept: Vec<Entity> = transactions
            .into_iter()
            .filter(|entity| {
                entity.as_transaction().is_some_and(|tx| {
                    let logs = logs_by_tx.get(&tx.hash).map_or(&[][..], Vec::as_slice);
                    spec.matches(tx, logs)
                })
            })
            .collect();

        debug!(before, kept = kept.len(), "Narrowed transactions");
        ctx.buffer.set(EntityType::Transaction, kept).await;
        Ok(())
    }
}

#[async_trait]
impl Job for ExportBlocksJob {
    fn descriptor(&self) -> &'static JobDescriptor {
        &DESCRIPTOR
    }

    #[instrument(skip(self, ctx), fields(job = DESCRIPTOR.name, range = %ctx.range))]
    async fn run(&self, ctx: &JobContext) -> EtlResult<()> {
        let source = ctx.source.clone();
        let ids = ctx.ids.clone();
        let buffer = ctx.buffer.clone();

        ctx.run_batched(ctx.range.blocks().collect(), move |numbers: Vec<u64>| {
            let source = source.clone();
            let ids = ids.clone();
            let buffer = buffer.clone();
            async move {
                let values = fetch_batch(source.as_ref(), &ids, &numbers, |id, &n| {
                    get_block_by_number(id, n, true)
                })
                .await?;

                let mut blocks = Vec::with_capacity(values.len());
                let mut transactions = Vec::new();
                for (value, number) in values.into_iter().zip(&numbers) {
                    if value.is_null() {
                        return Err(EtlError::transport(
                            format!("block {number} not available yet"),
                            None,
                        ));
                    }
                    let raw: RawBlock = decode(value, &format!("block {number}"))?;
                    let (block, txs) = raw.into_records();
                    blocks.push(Entity::Block(block));
                    transactions.extend(txs.into_iter().map(Entity::Transaction));
                }
                buffer.extend(EntityType::Block, blocks).await;
                buffer.extend(EntityType::Transaction, transactions).await;
                Ok(())
            }
        })
        .await?;

        if let Some(spec) = &ctx.narrowing {
            Self::narrow_transactions(ctx, spec).await?;
        }
        Ok(())
    }
}
