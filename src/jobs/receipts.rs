//! Receipts and logs for buffered transactions.

use alloy::primitives::B256;
use async_trait::async_trait;
use tracing::instrument;

use super::{fetch_batch, Job, JobContext, JobDescriptor};
use crate::domain::{Entity, EntityType};
use crate::error::{EtlError, EtlResult};
use crate::rpc::json_rpc::get_transaction_receipt;
use crate::rpc::payload::{decode, RawReceipt};

static DESCRIPTOR: JobDescriptor = JobDescriptor {
    name: "export_receipts",
    dependency_types: &[EntityType::Transaction],
    output_types: &[EntityType::Receipt, EntityType::Log],
    reorg_capable: true,
    raw_source: true,
};

/// Fetches the receipt of every buffered transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportReceiptsJob;

#[async_trait]
impl Job for ExportReceiptsJob {
    fn descriptor(&self) -> &'static JobDescriptor {
        &DESCRIPTOR
    }

    #[instrument(skip(self, ctx), fields(job = DESCRIPTOR.name, range = %ctx.range))]
    async fn run(&self, ctx: &JobContext) -> EtlResult<()> {
        let hashes: Vec<B256> = ctx
            .buffer
            .get(EntityType::Transaction)
            .await
            .iter()
            .filter_map(Entity::as_transaction)
            .map(|tx| tx.hash)
            .collect();

        let source = ctx.source.clone();
        let ids = ctx.ids.clone();
        let buffer = ctx.buffer.clone();

        ctx.run_batched(hashes, move |hashes: Vec<B256>| {
            let source = source.clone();
            let ids = ids.clone();
            let buffer = buffer.clone();
            async move {
                let values = fetch_batch(source.as_ref(), &ids, &hashes, |id, &hash| {
                    get_transaction_receipt(id, hash)
                })
                .await?;

                let mut receipts = Vec::with_capacity(values.len());
                let mut logs = Vec::new();
                for (value, hash) in values.into_iter().zip(&hashes) {
                    // Lagging nodes may not have indexed the receipt yet.
                    if value.is_null() {
                        return Err(EtlError::transport(
                            format!("receipt for {hash} not available yet"),
                            None,
                        ));
                    }
                    let raw: RawReceipt = decode(value, &format!("receipt {hash}"))?;
                    let (receipt, receipt_logs) = raw.into_records();
                    receipts.push(Entity::Receipt(receipt));
                    logs.extend(receipt_logs.into_iter().map(Entity::Log));
                }
                buffer.extend(EntityType::Receipt, receipts).await;
                buffer.extend(EntityType::Log, logs).await;
                Ok(())
            }
        })
        .await
    }
}
