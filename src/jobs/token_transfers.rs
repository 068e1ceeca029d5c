//! ERC-20 `Transfer` events decoded from buffered logs.
//!
//! The event binding is generated at compile time with alloy's `sol!`
//! macro, so the topic0 used for filtering and the decoder always agree.

use alloy::primitives::LogData;
use alloy::sol;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{FilterSpec, Job, JobContext, JobDescriptor, TopicFilter};
use crate::domain::{Entity, EntityType, LogRecord, TokenTransferRecord};
use crate::error::EtlResult;

sol! {
    /// Minimal ERC-20 event interface.
    interface IERC20 {
        /// Emitted on every token movement, including mints and burns.
        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}

pub use IERC20::Transfer;

static DESCRIPTOR: JobDescriptor = JobDescriptor {
    name: "export_token_transfers",
    dependency_types: &[EntityType::Log],
    output_types: &[EntityType::TokenTransfer],
    reorg_capable: true,
    raw_source: false,
};

/// Decodes ERC-20 transfers from logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportTokenTransfersJob;

/// Decode one log as an ERC-20 transfer.
///
/// ERC-721 shares the signature but indexes the token id as a fourth
/// topic; such logs are skipped.
#[must_use]
pub fn decode_transfer(log: &LogRecord) -> Option<TokenTransferRecord> {
    if log.topics.len() != 3 || log.topics.first() != Some(&Transfer::SIGNATURE_HASH) {
        return None;
    }
    let data = LogData::new_unchecked(log.topics.clone(), log.data.clone());
    let decoded = Transfer::decode_log_data(&data, true).ok()?;
    Some(TokenTransferRecord {
        block_number: log.block_number,
        block_hash: log.block_hash,
        transaction_hash: log.transaction_hash,
        log_index: log.log_index,
        token_address: log.address,
        from: decoded.from,
        to: decoded.to,
        value: decoded.value,
    })
}

#[async_trait]
impl Job for ExportTokenTransfersJob {
    fn descriptor(&self) -> &'static JobDescriptor {
        &DESCRIPTOR
    }

    fn filter(&self) -> Option<FilterSpec> {
        Some(FilterSpec::Topics(TopicFilter {
            addresses: vec![],
            topics: vec![Transfer::SIGNATURE_HASH],
        }))
    }

    #[instrument(skip(self, ctx), fields(job = DESCRIPTOR.name, range = %ctx.range))]
    async fn run(&self, ctx: &JobContext) -> EtlResult<()> {
        let transfers: Vec<Entity> = ctx
            .buffer
            .get(EntityType::Log)
            .await
            .iter()
            .filter_map(Entity::as_log)
            .filter_map(decode_transfer)
            .map(Entity::TokenTransfer)
            .collect();

        debug!(count = transfers.len(), "Decoded token transfers");
        ctx.buffer.extend(EntityType::TokenTransfer, transfers).await;
        Ok(())
    }
}
