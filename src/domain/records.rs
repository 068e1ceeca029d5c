//! Decoded records produced by jobs.
//!
//! Every record carries the natural key fields (block number, transaction
//! hash, log index, ...) the sink needs for idempotent upserts. Records are
//! immutable once produced; jobs only ever create new ones.

use alloy::primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

use super::EntityType;

/// Block header fields kept by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Block number
    pub number: u64,

    /// Block hash
    pub hash: B256,

    /// Parent block hash
    pub parent_hash: B256,

    /// Block timestamp (Unix epoch seconds)
    pub timestamp: u64,

    /// Fee recipient
    pub miner: Address,

    /// Gas used by all transactions
    pub gas_used: u64,

    /// Block gas limit
    pub gas_limit: u64,

    /// EIP-1559 base fee, absent before London
    pub base_fee_per_gas: Option<u64>,

    /// Number of transactions in the block
    pub transaction_count: u64,
}

impl BlockRecord {
    /// Create a record with only the linkage fields set (useful for testing).
    #[must_use]
    pub fn new(number: u64, hash: B256, parent_hash: B256, timestamp: u64) -> Self {
        Self {
            number,
            hash,
            parent_hash,
            timestamp,
            miner: Address::ZERO,
            gas_used: 0,
            gas_limit: 0,
            base_fee_per_gas: None,
            transaction_count: 0,
        }
    }
}

/// A transaction as included in a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Transaction hash
    pub hash: B256,
    /// Including block number
    pub block_number: u64,
    /// Including block hash
    pub block_hash: B256,
    /// Including block timestamp
    pub block_timestamp: u64,
    /// Position inside the block
    pub transaction_index: u64,
    /// Sender
    pub from: Address,
    /// Recipient, `None` for contract creation
    pub to: Option<Address>,
    /// Transferred wei
    pub value: U256,
    /// Gas limit
    pub gas: u64,
    /// Legacy gas price or max fee
    pub gas_price: Option<U256>,
    /// Sender nonce
    pub nonce: u64,
    /// Calldata
    pub input: Bytes,
}

/// Execution receipt of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptRecord {
    /// Transaction hash
    pub transaction_hash: B256,
    /// Including block number
    pub block_number: u64,
    /// Including block hash
    pub block_hash: B256,
    /// Position inside the block
    pub transaction_index: u64,
    /// 1 = success, 0 = revert, `None` pre-Byzantium
    pub status: Option<u64>,
    /// Gas used by this transaction
    pub gas_used: u64,
    /// Cumulative gas used in the block up to this transaction
    pub cumulative_gas_used: u64,
    /// Price actually paid per gas
    pub effective_gas_price: Option<U256>,
    /// Created contract, if any
    pub contract_address: Option<Address>,
    /// Sender
    pub from: Address,
    /// Recipient
    pub to: Option<Address>,
}

/// An event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Including block number
    pub block_number: u64,
    /// Including block hash
    pub block_hash: B256,
    /// Emitting transaction
    pub transaction_hash: B256,
    /// Emitting transaction position
    pub transaction_index: u64,
    /// Position of the log inside the block
    pub log_index: u64,
    /// Emitting contract
    pub address: Address,
    /// Indexed topics, topic0 first
    pub topics: Vec<B256>,
    /// Non-indexed payload
    pub data: Bytes,
}

/// Decoded ERC-20 `Transfer` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransferRecord {
    /// Including block number
    pub block_number: u64,
    /// Including block hash
    pub block_hash: B256,
    /// Emitting transaction
    pub transaction_hash: B256,
    /// Position of the source log inside the block
    pub log_index: u64,
    /// Token contract
    pub token_address: Address,
    /// Sender
    pub from: Address,
    /// Recipient
    pub to: Address,
    /// Raw token amount
    pub value: U256,
}

/// Native balance of an address at the end of a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinBalanceRecord {
    /// Account
    pub address: Address,
    /// Block the balance was read at
    pub block_number: u64,
    /// Balance in wei
    pub balance: U256,
}

/// A contract created by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRecord {
    /// Contract address
    pub address: Address,
    /// Creation block number
    pub block_number: u64,
    /// Creation block hash
    pub block_hash: B256,
    /// Creating transaction
    pub transaction_hash: B256,
    /// Transaction sender
    pub creator: Address,
    /// Deployed runtime bytecode
    pub bytecode: Bytes,
}

/// One decoded record of any [`EntityType`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Entity {
    /// See [`BlockRecord`]
    Block(BlockRecord),
    /// See [`TransactionRecord`]
    Transaction(TransactionRecord),
    /// See [`ReceiptRecord`]
    Receipt(ReceiptRecord),
    /// See [`LogRecord`]
    Log(LogRecord),
    /// See [`TokenTransferRecord`]
    TokenTransfer(TokenTransferRecord),
    /// See [`CoinBalanceRecord`]
    CoinBalance(CoinBalanceRecord),
    /// See [`ContractRecord`]
    Contract(ContractRecord),
}

impl Entity {
    /// Type tag of the wrapped record.
    #[must_use]
    pub const fn entity_type(&self) -> EntityType {
        match self {
            Self::Block(_) => EntityType::Block,
            Self::Transaction(_) => EntityType::Transaction,
            Self::Receipt(_) => EntityType::Receipt,
            Self::Log(_) => EntityType::Log,
            Self::TokenTransfer(_) => EntityType::TokenTransfer,
            Self::CoinBalance(_) => EntityType::CoinBalance,
            Self::Contract(_) => EntityType::Contract,
        }
    }

    /// Block the record belongs to.
    #[must_use]
    pub const fn block_number(&self) -> u64 {
        match self {
            Self::Block(r) => r.number,
            Self::Transaction(r) => r.block_number,
            Self::Receipt(r) => r.block_number,
            Self::Log(r) => r.block_number,
            Self::TokenTransfer(r) => r.block_number,
            Self::CoinBalance(r) => r.block_number,
            Self::Contract(r) => r.block_number,
        }
    }

    /// Ordering key: block number, then position inside the block.
    #[must_use]
    pub const fn sort_key(&self) -> (u64, u64) {
        let index = match self {
            Self::Transaction(r) => r.transaction_index,
            Self::Receipt(r) => r.transaction_index,
            Self::Log(r) => r.log_index,
            Self::TokenTransfer(r) => r.log_index,
            Self::Block(_) | Self::CoinBalance(_) | Self::Contract(_) => 0,
        };
        (self.block_number(), index)
    }

    /// The wrapped block record, if this is one.
    #[must_use]
    pub const fn as_block(&self) -> Option<&BlockRecord> {
        match self {
            Self::Block(r) => Some(r),
            _ => None,
        }
    }

    /// The wrapped transaction record, if this is one.
    #[must_use]
    pub const fn as_transaction(&self) -> Option<&TransactionRecord> {
        match self {
            Self::Transaction(r) => Some(r),
            _ => None,
        }
    }

    /// The wrapped receipt record, if this is one.
    #[must_use]
    pub const fn as_receipt(&self) -> Option<&ReceiptRecord> {
        match self {
            Self::Receipt(r) => Some(r),
            _ => None,
        }
    }

    /// The wrapped log record, if this is one.
    #[must_use]
    pub const fn as_log(&self) -> Option<&LogRecord> {
        match self {
            Self::Log(r) => Some(r),
            _ => None,
        }
    }
}
