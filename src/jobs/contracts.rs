//! Contracts created by transactions in the range.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use alloy::primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{fetch_batch, Job, JobContext, JobDescriptor};
use crate::domain::{ContractRecord, Entity, EntityType};
use crate::error::EtlResult;
use crate::rpc::json_rpc::get_code;
use crate::rpc::payload::decode;

static DESCRIPTOR: JobDescriptor = JobDescriptor {
    name: "export_contracts",
    dependency_types: &[EntityType::Receipt],
    output_types: &[EntityType::Contract],
    reorg_capable: true,
    raw_source: false,
};

/// Bytecode cache entries kept before the cache is dropped wholesale.
const CACHE_LIMIT: usize = 10_000;

/// Fetches runtime bytecode of every contract created in the range.
///
/// Bytecode is cached per (address, creating transaction) so a retried range
/// does not refetch it; reorg runs bypass the cache.
#[derive(Debug, Default)]
pub struct ExportContractsJob {
    code_cache: Arc<Mutex<HashMap<(Address, B256), Bytes>>>,
}

#[derive(Debug, Clone)]
struct Creation {
    address: Address,
    block_number: u64,
    block_hash: B256,
    transaction_hash: B256,
    creator: Address,
}

impl Creation {
    fn into_record(self, bytecode: Bytes) -> Entity {
        Entity::Contract(ContractRecord {
            address: self.address,
            block_number: self.block_number,
            block_hash: self.block_hash,
            transaction_hash: self.transaction_hash,
            creator: self.creator,
            bytecode,
        })
    }
}

#[async_trait]
impl Job for ExportContractsJob {
    fn descriptor(&self) -> &'static JobDescriptor {
        &DESCRIPTOR
    }

    #[instrument(skip(self, ctx), fields(job = DESCRIPTOR.name, range = %ctx.range))]
    async fn run(&self, ctx: &JobContext) -> EtlResult<()> {
        let creations: Vec<Creation> = ctx
            .buffer
            .get(EntityType::Receipt)
            .await
            .iter()
            .filter_map(Entity::as_receipt)
            .filter_map(|r| {
                r.contract_address.map(|address| Creation {
                    address,
                    block_number: r.block_number,
                    block_hash: r.block_hash,
                    transaction_hash: r.transaction_hash,
                    creator: r.from,
                })
            })
            .collect();

        let mut pending = Vec::with_capacity(creations.len());
        let mut cached = Vec::new();
        {
            let mut cache = self.code_cache.lock().unwrap_or_else(PoisonError::into_inner);
            if ctx.reorg || cache.len() > CACHE_LIMIT {
                cache.clear();
            }
            for creation in creations {
                match cache.get(&(creation.address, creation.transaction_hash)) {
                    Some(code) => cached.push(creation.clone().into_record(code.clone())),
                    None => pending.push(creation),
                }
            }
        }
        debug!(cached = cached.len(), to_fetch = pending.len(), "Resolving contract bytecode");
        ctx.buffer.extend(EntityType::Contract, cached).await;

        let source = ctx.source.clone();
        let ids = ctx.ids.clone();
        let buffer = ctx.buffer.clone();
        let cache = self.code_cache.clone();

        ctx.run_batched(pending, move |creations: Vec<Creation>| {
            let source = source.clone();
            let ids = ids.clone();
            let buffer = buffer.clone();
            let cache = cache.clone();
            async move {
                let values = fetch_batch(source.as_ref(), &ids, &creations, |id, c| {
                    get_code(id, c.address, c.block_number)
                })
                .await?;

                let mut contracts = Vec::with_capacity(values.len());
                for (value, creation) in values.into_iter().zip(creations) {
                    let code: Bytes = decode(value, &format!("code of {}", creation.address))?;
                    cache
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert((creation.address, creation.transaction_hash), code.clone());
                    contracts.push(creation.into_record(code));
                }
                buffer.extend(EntityType::Contract, contracts).await;
                Ok(())
            }
        })
        .await
    }
}
