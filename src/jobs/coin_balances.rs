//! Native balances of addresses touched in each block.

use std::collections::BTreeSet;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use tracing::instrument;

use super::{fetch_batch, Job, JobContext, JobDescriptor};
use crate::domain::{CoinBalanceRecord, Entity, EntityType};
use crate::error::EtlResult;
use crate::rpc::json_rpc::get_balance;
use crate::rpc::payload::decode;

static DESCRIPTOR: JobDescriptor = JobDescriptor {
    name: "export_coin_balances",
    dependency_types: &[EntityType::Block, EntityType::Transaction],
    output_types: &[EntityType::CoinBalance],
    reorg_capable: true,
    raw_source: false,
};

/// Reads `eth_getBalance` for every miner, sender and recipient of a block,
/// at that block.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportCoinBalancesJob;

/// Distinct `(address, block)` pairs whose balance may have changed.
#[must_use]
pub fn touched_addresses(blocks: &[Entity], transactions: &[Entity]) -> Vec<(Address, u64)> {
    let mut touched = BTreeSet::new();
    for block in blocks.iter().filter_map(Entity::as_block) {
        touched.insert((block.miner, block.number));
    }
    for tx in transactions.iter().filter_map(Entity::as_transaction) {
        touched.insert((tx.from, tx.block_number));
        if let Some(to) = tx.to {
            touched.insert((to, tx.block_number));
        }
    }
    touched.into_iter().collect()
}

#[async_trait]
impl Job for ExportCoinBalancesJob {
    fn descriptor(&self) -> &'static JobDescriptor {
        &DESCRIPTOR
    }

    #[instrument(skip(self, ctx), fields(job = DESCRIPTOR.name, range = %ctx.range))]
    async fn run(&self, ctx: &JobContext) -> EtlResult<()> {
        let blocks = ctx.buffer.get(EntityType::Block).await;
        let transactions = ctx.buffer.get(EntityType::Transaction).await;
        let targets = touched_addresses(&blocks, &transactions);

        let source = ctx.source.clone();
        let ids = ctx.ids.clone();
        let buffer = ctx.buffer.clone();

        ctx.run_batched(targets, move |targets: Vec<(Address, u64)>| {
            let source = source.clone();
            let ids = ids.clone();
            let buffer = buffer.clone();
            async move {
                let values = fetch_batch(source.as_ref(), &ids, &targets, |id, &(address, block)| {
                    get_balance(id, address, block)
                })
                .await?;

                let mut balances = Vec::with_capacity(values.len());
                for (value, &(address, block_number)) in values.into_iter().zip(&targets) {
                    let balance: U256 = decode(value, &format!("balance of {address}"))?;
                    balances.push(Entity::CoinBalance(CoinBalanceRecord {
                        address,
                        block_number,
                        balance,
                    }));
                }
                buffer.extend(EntityType::CoinBalance, balances).await;
                Ok(())
            }
        })
        .await
    }
}
