//! Raw JSON-RPC payloads and their conversion into records.
//!
//! These mirror the node's camelCase JSON closely; everything downstream of
//! the jobs works with the records in [`crate::domain`] instead.

use alloy::primitives::{Address, Bytes, B256, U256, U64};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{BlockRecord, LogRecord, ReceiptRecord, TransactionRecord};
use crate::error::{EtlError, EtlResult};

/// Block as returned by `eth_getBlockByNumber(.., true)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct RawBlock {
    pub number: U64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: U64,
    #[serde(default)]
    pub miner: Address,
    #[serde(default)]
    pub gas_used: U64,
    #[serde(default)]
    pub gas_limit: U64,
    #[serde(default)]
    pub base_fee_per_gas: Option<U64>,
    #[serde(default)]
    pub transactions: Vec<RawTransaction>,
}

/// Transaction object embedded in a full block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct RawTransaction {
    pub hash: B256,
    pub transaction_index: U64,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub value: U256,
    #[serde(default)]
    pub gas: U64,
    #[serde(default)]
    pub gas_price: Option<U256>,
    #[serde(default)]
    pub max_fee_per_gas: Option<U256>,
    #[serde(default)]
    pub nonce: U64,
    #[serde(default)]
    pub input: Bytes,
}

/// Receipt as returned by `eth_getTransactionReceipt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct RawReceipt {
    pub transaction_hash: B256,
    pub transaction_index: U64,
    pub block_number: U64,
    pub block_hash: B256,
    #[serde(default)]
    pub status: Option<U64>,
    #[serde(default)]
    pub gas_used: U64,
    #[serde(default)]
    pub cumulative_gas_used: U64,
    #[serde(default)]
    pub effective_gas_price: Option<U256>,
    #[serde(default)]
    pub contract_address: Option<Address>,
    #[serde(default)]
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub logs: Vec<RawLog>,
}

/// Log as embedded in receipts or returned by `eth_getLogs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct RawLog {
    pub address: Address,
    #[serde(default)]
    pub topics: Vec<B256>,
    #[serde(default)]
    pub data: Bytes,
    pub block_number: U64,
    pub block_hash: B256,
    pub transaction_hash: B256,
    pub transaction_index: U64,
    pub log_index: U64,
    #[serde(default)]
    pub removed: bool,
}

/// Deserialize a JSON-RPC result, treating `null` as a decoding failure.
///
/// # Errors
///
/// Returns a decoding error naming `what` when the value is `null` or does
/// not match the expected shape.
pub fn decode<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> EtlResult<T> {
    if value.is_null() {
        return Err(EtlError::decoding(format!("node returned null for {what}"), None));
    }
    serde_json::from_value(value)
        .map_err(|e| EtlError::decoding(format!("Failed to decode {what}"), Some(Box::new(e))))
}

impl RawBlock {
    /// Split into the block record and its transaction records.
    #[must_use]
    pub fn into_records(self) -> (BlockRecord, Vec<TransactionRecord>) {
        let number = self.number.to::<u64>();
        let timestamp = self.timestamp.to::<u64>();
        let block = BlockRecord {
            number,
            hash: self.hash,
            parent_hash: self.parent_hash,
            timestamp,
            miner: self.miner,
            gas_used: self.gas_used.to::<u64>(),
            gas_limit: self.gas_limit.to::<u64>(),
            base_fee_per_gas: self.base_fee_per_gas.map(|v| v.to::<u64>()),
            transaction_count: self.transactions.len() as u64,
        };

        let transactions = self
            .transactions
            .into_iter()
            .map(|tx| TransactionRecord {
                hash: tx.hash,
                block_number: number,
                block_hash: self.hash,
                block_timestamp: timestamp,
                transaction_index: tx.transaction_index.to::<u64>(),
                from: tx.from,
                to: tx.to,
                value: tx.value,
                gas: tx.gas.to::<u64>(),
                gas_price: tx.gas_price.or(tx.max_fee_per_gas),
                nonce: tx.nonce.to::<u64>(),
                input: tx.input,
            })
            .collect();

        (block, transactions)
    }
}

impl RawReceipt {
    /// Split into the receipt record and its log records.
    #[must_use]
    pub fn into_records(self) -> (ReceiptRecord, Vec<LogRecord>) {
        let receipt = ReceiptRecord {
            transaction_hash: self.transaction_hash,
            block_number: self.block_number.to::<u64>(),
            block_hash: self.block_hash,
            transaction_index: self.transaction_index.to::<u64>(),
            status: self.status.map(|s| s.to::<u64>()),
            gas_used: self.gas_used.to::<u64>(),
            cumulative_gas_used: self.cumulative_gas_used.to::<u64>(),
            effective_gas_price: self.effective_gas_price,
            contract_address: self.contract_address,
            from: self.from,
            to: self.to,
        };
        let logs = self.logs.into_iter().map(RawLog::into_record).collect();
        (receipt, logs)
    }
}

impl RawLog {
    /// Convert into a [`LogRecord`].
    #[must_use]
    pub fn into_record(self) -> LogRecord {
        LogRecord {
            block_number: self.block_number.to::<u64>(),
            block_hash: self.block_hash,
            transaction_hash: self.transaction_hash,
            transaction_index: self.transaction_index.to::<u64>(),
            log_index: self.log_index.to::<u64>(),
            address: self.address,
            topics: self.topics,
            data: self.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_block() -> Value {
        json!({
            "number": "0x64",
            "hash": format!("0x{}", "11".repeat(32)),
            "parentHash": format!("0x{}", "22".repeat(32)),
            "timestamp": "0x5f5e100",
            "miner": format!("0x{}", "33".repeat(20)),
            "gasUsed": "0x5208",
            "gasLimit": "0x1c9c380",
            "baseFeePerGas": "0x7",
            "transactions": [{
                "hash": format!("0x{}", "44".repeat(32)),
                "transactionIndex": "0x0",
                "from": format!("0x{}", "55".repeat(20)),
                "to": null,
                "value": "0xde0b6b3a7640000",
                "gas": "0x5208",
                "maxFeePerGas": "0x3b9aca00",
                "nonce": "0x2",
                "input": "0x"
            }]
        })
    }

    #[test]
    fn test_block_into_records() {
        let raw: RawBlock = decode(sample_block(), "block").unwrap_or_else(|e| unreachable!("{e}"));
        let (block, txs) = raw.into_records();

        assert_eq!(block.number, 100);
        assert_eq!(block.timestamp, 100_000_000);
        assert_eq!(block.base_fee_per_gas, Some(7));
        assert_eq!(block.transaction_count, 1);

        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].block_number, 100);
        assert_eq!(txs[0].block_hash, block.hash);
        assert_eq!(txs[0].to, None);
        assert_eq!(txs[0].gas_price, Some(U256::from(1_000_000_000u64)));
        assert_eq!(txs[0].nonce, 2);
    }

    #[test]
    fn test_decode_null_is_error() {
        let result: EtlResult<RawBlock> = decode(Value::Null, "block 7");
        assert!(matches!(result, Err(EtlError::DecodingError { .. })));
    }

    #[test]
    fn test_receipt_into_records_carries_logs() {
        let receipt = json!({
            "transactionHash": format!("0x{}", "44".repeat(32)),
            "transactionIndex": "0x1",
            "blockNumber": "0x64",
            "blockHash": format!("0x{}", "11".repeat(32)),
            "status": "0x1",
            "gasUsed": "0x5208",
            "cumulativeGasUsed": "0xa410",
            "from": format!("0x{}", "55".repeat(20)),
            "logs": [{
                "address": format!("0x{}", "66".repeat(20)),
                "topics": [format!("0x{}", "77".repeat(32))],
                "data": "0x01",
                "blockNumber": "0x64",
                "blockHash": format!("0x{}", "11".repeat(32)),
                "transactionHash": format!("0x{}", "44".repeat(32)),
                "transactionIndex": "0x1",
                "logIndex": "0x3"
            }]
        });
        let raw: RawReceipt = decode(receipt, "receipt").unwrap_or_else(|e| unreachable!("{e}"));
        let (receipt, logs) = raw.into_records();

        assert_eq!(receipt.status, Some(1));
        assert_eq!(receipt.cumulative_gas_used, 42_000);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].log_index, 3);
        assert_eq!(logs[0].topics.len(), 1);
    }
}
