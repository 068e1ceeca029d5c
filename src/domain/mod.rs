//! Domain model shared by every pipeline layer.
//!
//! - [`EntityType`]: the tag identifying a kind of decoded record
//! - [`Entity`]: one decoded record of any type (see [`records`])
//! - [`BlockRange`]: an inclusive block window processed as one unit
//! - [`FixJob`]: a persisted reorg repair checkpoint

pub mod fix_job;
pub mod records;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EtlError;

pub use fix_job::{FixJob, FixJobStatus};
pub use records::{
    BlockRecord, CoinBalanceRecord, ContractRecord, Entity, LogRecord, ReceiptRecord,
    TokenTransferRecord, TransactionRecord,
};

/// Tag identifying a kind of decoded record.
///
/// Jobs declare the entity types they read and write; the scheduler builds
/// its dependency graph from those declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// Block headers
    Block,
    /// Transactions included in blocks
    Transaction,
    /// Transaction receipts
    Receipt,
    /// Event logs emitted by transactions
    Log,
    /// Decoded ERC-20 `Transfer` events
    TokenTransfer,
    /// Native balances of addresses touched in a block
    CoinBalance,
    /// Contracts created by transactions
    Contract,
}

impl EntityType {
    /// Every known entity type, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Block,
        Self::Transaction,
        Self::Receipt,
        Self::Log,
        Self::TokenTransfer,
        Self::CoinBalance,
        Self::Contract,
    ];

    /// Snake-case name used in configuration, logs and table names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Transaction => "transaction",
            Self::Receipt => "receipt",
            Self::Log => "log",
            Self::TokenTransfer => "token_transfer",
            Self::CoinBalance => "coin_balance",
            Self::Contract => "contract",
        }
    }

    /// Parse a comma-separated list such as `"block,transaction,log"`.
    ///
    /// # Errors
    ///
    /// Returns a job error naming the first unknown entry.
    ///
    /// # Example
    ///
    /// ```
    /// use eth_stream_etl::domain::EntityType;
    ///
    /// let types = EntityType::parse_list("block, log").unwrap();
    /// assert_eq!(types, vec![EntityType::Block, EntityType::Log]);
    /// ```
    pub fn parse_list(list: &str) -> Result<Vec<Self>, EtlError> {
        let mut types = Vec::new();
        for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let ty = part.parse::<Self>()?;
            if !types.contains(&ty) {
                types.push(ty);
            }
        }
        Ok(types)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|ty| ty.as_str() == normalized)
            .ok_or_else(|| EtlError::job(format!("unknown entity type '{s}'"), None))
    }
}

/// Inclusive block window `start..=end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockRange {
    /// First block (inclusive)
    pub start: u64,
    /// Last block (inclusive)
    pub end: u64,
}

impl BlockRange {
    /// Create a range, rejecting `start > end`.
    ///
    /// # Errors
    ///
    /// Returns a state error for an inverted range.
    pub fn new(start: u64, end: u64) -> Result<Self, EtlError> {
        if start > end {
            return Err(EtlError::state(
                format!("invalid block range {start}..={end}"),
                None,
            ));
        }
        Ok(Self { start, end })
    }

    /// Range covering exactly one block.
    #[must_use]
    pub const fn single(block: u64) -> Self {
        Self {
            start: block,
            end: block,
        }
    }

    /// Number of blocks in the range.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// A valid range always holds at least one block.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Whether `block` falls inside the range.
    #[must_use]
    pub const fn contains(&self, block: u64) -> bool {
        block >= self.start && block <= self.end
    }

    /// Iterate block numbers in ascending order.
    pub fn blocks(&self) -> impl Iterator<Item = u64> {
        self.start..=self.end
    }

    /// Split into at most `parts` contiguous sub-ranges of near-equal size.
    ///
    /// # Example
    ///
    /// ```
    /// use eth_stream_etl::domain::BlockRange;
    ///
    /// let parts = BlockRange { start: 1, end: 10 }.split(3);
    /// assert_eq!(parts.len(), 3);
    /// assert_eq!(parts[0], BlockRange { start: 1, end: 4 });
    /// assert_eq!(parts[2].end, 10);
    /// ```
    #[must_use]
    pub fn split(&self, parts: usize) -> Vec<Self> {
        let parts = (parts.max(1) as u64).min(self.len());
        let base = self.len() / parts;
        let extra = self.len() % parts;

        let mut ranges = Vec::with_capacity(parts as usize);
        let mut start = self.start;
        for index in 0..parts {
            let size = base + u64::from(index < extra);
            let end = start + size - 1;
            ranges.push(Self { start, end });
            start = end + 1;
        }
        ranges
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_round_trip_names() {
        for ty in EntityType::ALL {
            assert_eq!(ty.as_str().parse::<EntityType>().ok(), Some(ty));
        }
        assert_eq!(
            "Token-Transfer".parse::<EntityType>().ok(),
            Some(EntityType::TokenTransfer)
        );
    }

    #[test]
    fn test_parse_list_rejects_unknown() {
        let result = EntityType::parse_list("block,uniswap_swap");
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_list_deduplicates() {
        let types = EntityType::parse_list("log,log,block").unwrap_or_default();
        assert_eq!(types, vec![EntityType::Log, EntityType::Block]);
    }

    #[test]
    fn test_block_range_rejects_inverted() {
        assert!(BlockRange::new(11, 10).is_err());
        assert_eq!(BlockRange::new(10, 10).map(|r| r.len()).ok(), Some(1));
    }

    #[test]
    fn test_split_covers_range_without_gaps() {
        let range = BlockRange { start: 100, end: 120 };
        let parts = range.split(4);

        assert_eq!(parts.first().map(|r| r.start), Some(100));
        assert_eq!(parts.last().map(|r| r.end), Some(120));
        for pair in parts.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start);
        }
        assert_eq!(parts.iter().map(BlockRange::len).sum::<u64>(), range.len());
    }

    #[test]
    fn test_split_never_produces_more_parts_than_blocks() {
        let parts = BlockRange { start: 5, end: 6 }.split(8);
        assert_eq!(parts, vec![BlockRange::single(5), BlockRange::single(6)]);
    }
}
