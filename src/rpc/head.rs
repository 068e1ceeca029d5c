//! Chain head and canonical-hash lookups used by the controllers.

use std::sync::Arc;

use alloy::primitives::B256;
use async_trait::async_trait;
use serde_json::Value;

use super::json_rpc::{block_number, get_block_by_number};
use super::source::{call_one, RequestIds, RpcSource};
use crate::error::{EtlError, EtlResult};

/// Reports the current chain head.
#[async_trait]
pub trait ChainHead: Send + Sync {
    /// Latest block number known to the node.
    async fn latest_block_number(&self) -> EtlResult<u64>;
}

/// Reports the canonical hash of a block.
#[async_trait]
pub trait CanonicalChain: Send + Sync {
    /// Canonical hash at `number`, `None` if the node does not have it.
    async fn block_hash(&self, number: u64) -> EtlResult<Option<B256>>;
}

/// [`ChainHead`] and [`CanonicalChain`] backed by an [`RpcSource`].
pub struct RpcChain {
    source: Arc<dyn RpcSource>,
    ids: RequestIds,
}

impl RpcChain {
    /// Wrap a batch source.
    #[must_use]
    pub fn new(source: Arc<dyn RpcSource>) -> Self {
        Self {
            source,
            ids: RequestIds::default(),
        }
    }
}

fn parse_quantity(value: &Value, what: &str) -> EtlResult<u64> {
    value
        .as_str()
        .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
        .ok_or_else(|| EtlError::decoding(format!("invalid quantity for {what}: {value}"), None))
}

#[async_trait]
impl ChainHead for RpcChain {
    async fn latest_block_number(&self) -> EtlResult<u64> {
        let value = call_one(self.source.as_ref(), block_number(self.ids.next())).await?;
        parse_quantity(&value, "eth_blockNumber")
    }
}

#[async_trait]
impl CanonicalChain for RpcChain {
    async fn block_hash(&self, number: u64) -> EtlResult<Option<B256>> {
        let request = get_block_by_number(self.ids.next(), number, false);
        let value = call_one(self.source.as_ref(), request).await?;
        if value.is_null() {
            return Ok(None);
        }
        let hash = value
            .get("hash")
            .cloned()
            .ok_or_else(|| EtlError::decoding(format!("block {number} without hash"), None))?;
        serde_json::from_value(hash)
            .map(Some)
            .map_err(|e| EtlError::decoding("Invalid block hash", Some(Box::new(e))))
    }
}
