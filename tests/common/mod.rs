//! In-process JSON-RPC node shared by the integration tests.
//!
//! Every block `n` carries one transaction; its receipt holds one ERC-20
//! `Transfer` log when `n` is even. Hashes encode the block number and a
//! per-block fork salt, so [`MockChain::reorg`] swaps the canonical hash of
//! chosen blocks without touching the others.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{Address, B256};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use serde_json::{json, Value};

use eth_stream_etl::buffer::{ExportBuffer, ExportOptions};
use eth_stream_etl::db::{create_pool, Repository};
use eth_stream_etl::domain::EntityType;
use eth_stream_etl::error::{EtlError, EtlResult};
use eth_stream_etl::executor::{BatchWorkExecutor, ExecutorOptions, RetryPolicy};
use eth_stream_etl::export::{ExportBatch, ItemExporter, MemoryExporter, SqliteExporter};
use eth_stream_etl::jobs::token_transfers::Transfer;
use eth_stream_etl::jobs::JobRegistry;
use eth_stream_etl::rpc::json_rpc::quantity;
use eth_stream_etl::rpc::{JsonRpcRequest, JsonRpcResponse, RpcSource};
use eth_stream_etl::scheduler::JobScheduler;

pub const SENDER: Address = Address::repeat_byte(0x11);
pub const TOKEN: Address = Address::repeat_byte(0x22);
pub const RECIPIENT: Address = Address::repeat_byte(0x33);

pub fn block_hash(number: u64, salt: u8) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = 0xbb;
    bytes[1] = salt;
    bytes[24..].copy_from_slice(&number.to_be_bytes());
    B256::from(bytes)
}

pub fn tx_hash(number: u64, salt: u8) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = 0xaa;
    bytes[1] = salt;
    bytes[24..].copy_from_slice(&number.to_be_bytes());
    B256::from(bytes)
}

fn parse_quantity(value: &Value) -> Option<u64> {
    u64::from_str_radix(value.as_str()?.trim_start_matches("0x"), 16).ok()
}

#[derive(Default)]
pub struct MockChain {
    head: AtomicU64,
    salts: Mutex<HashMap<u64, u8>>,
    fail_batches: AtomicUsize,
    poisoned: Mutex<HashSet<u64>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MockChain {
    pub fn new(head: u64) -> Arc<Self> {
        let chain = Self::default();
        chain.head.store(head, Ordering::SeqCst);
        Arc::new(chain)
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// Replace the canonical version of `blocks`.
    pub fn reorg(&self, blocks: &[u64]) {
        let mut salts = self.salts.lock().expect("lock");
        for block in blocks {
            *salts.entry(*block).or_default() += 1;
        }
    }

    /// Fail the next `n` batches at the transport level.
    pub fn fail_next_batches(&self, n: usize) {
        self.fail_batches.store(n, Ordering::SeqCst);
    }

    /// Answer the next full-block request for `block` with a pruned-state error.
    pub fn poison_block(&self, block: u64) {
        self.poisoned.lock().expect("lock").insert(block);
    }

    /// Requests served for `method` so far.
    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().expect("lock").get(method).copied().unwrap_or(0)
    }

    fn salt(&self, number: u64) -> u8 {
        self.salts.lock().expect("lock").get(&number).copied().unwrap_or(0)
    }

    pub fn canonical_hash(&self, number: u64) -> B256 {
        block_hash(number, self.salt(number))
    }

    fn transfer_log(&self, number: u64) -> Option<Value> {
        if number % 2 != 0 {
            return None;
        }
        let salt = self.salt(number);
        Some(json!({
            "address": TOKEN,
            "topics": [
                Transfer::SIGNATURE_HASH,
                SENDER.into_word(),
                RECIPIENT.into_word(),
            ],
            "data": B256::left_padding_from(&(number * 1_000).to_be_bytes()),
            "blockNumber": quantity(number),
            "blockHash": block_hash(number, salt),
            "transactionHash": tx_hash(number, salt),
            "transactionIndex": "0x0",
            "logIndex": "0x0",
            "removed": false,
        }))
    }

    fn block(&self, number: u64, full: bool) -> Value {
        if number > self.head.load(Ordering::SeqCst) {
            return Value::Null;
        }
        let salt = self.salt(number);
        let parent = number.checked_sub(1).map_or(B256::ZERO, |p| self.canonical_hash(p));
        let tx = json!({
            "hash": tx_hash(number, salt),
            "transactionIndex": "0x0",
            "from": SENDER,
            "to": TOKEN,
            "value": "0x0",
            "gas": "0x5208",
            "gasPrice": "0x3b9aca00",
            "nonce": quantity(number),
            "input": "0x",
        });
        let transactions = if full {
            json!([tx])
        } else {
            json!([tx_hash(number, salt)])
        };
        json!({
            "number": quantity(number),
            "hash": block_hash(number, salt),
            "parentHash": parent,
            "timestamp": quantity(1_700_000_000 + number * 12),
            "miner": Address::repeat_byte(0x44),
            "gasUsed": "0x5208",
            "gasLimit": "0x1c9c380",
            "baseFeePerGas": "0x7",
            "transactions": transactions,
        })
    }

    fn receipt(&self, hash: &Value) -> Value {
        let Some(hash) = hash.as_str().and_then(|h| h.parse::<B256>().ok()) else {
            return Value::Null;
        };
        let mut tail = [0u8; 8];
        tail.copy_from_slice(&hash[24..]);
        let number = u64::from_be_bytes(tail);
        let salt = self.salt(number);
        if hash != tx_hash(number, salt) {
            return Value::Null;
        }
        json!({
            "transactionHash": hash,
            "transactionIndex": "0x0",
            "blockNumber": quantity(number),
            "blockHash": block_hash(number, salt),
            "status": "0x1",
            "gasUsed": "0x5208",
            "cumulativeGasUsed": "0x5208",
            "effectiveGasPrice": "0x3b9aca00",
            "contractAddress": null,
            "from": SENDER,
            "to": TOKEN,
            "logs": self.transfer_log(number).into_iter().collect::<Vec<_>>(),
        })
    }

    fn logs(&self, filter: &Value) -> Value {
        let head = self.head.load(Ordering::SeqCst);
        let from = filter.get("fromBlock").and_then(parse_quantity).unwrap_or(0);
        let to = filter
            .get("toBlock")
            .and_then(parse_quantity)
            .unwrap_or(head)
            .min(head);
        Value::Array((from..=to).filter_map(|n| self.transfer_log(n)).collect())
    }

    fn answer(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        *self
            .calls
            .lock()
            .expect("lock")
            .entry(request.method.clone())
            .or_default() += 1;

        let params = &request.params;
        let result = match request.method.as_str() {
            "eth_blockNumber" => json!(quantity(self.head.load(Ordering::SeqCst))),
            "eth_getBlockByNumber" => {
                let number = params.first().and_then(parse_quantity).unwrap_or(0);
                let full = params.get(1).and_then(Value::as_bool).unwrap_or(false);
                if full && self.poisoned.lock().expect("lock").remove(&number) {
                    return JsonRpcResponse::failure(request.id, -32000, "missing trie node");
                }
                self.block(number, full)
            }
            "eth_getTransactionReceipt" => self.receipt(params.first().unwrap_or(&Value::Null)),
            "eth_getLogs" => self.logs(params.first().unwrap_or(&Value::Null)),
            "eth_getBalance" => json!("0xde0b6b3a7640000"),
            "eth_getCode" => json!("0x"),
            other => {
                return JsonRpcResponse::failure(
                    request.id,
                    -32601,
                    format!("method {other} not found"),
                )
            }
        };
        JsonRpcResponse::success(request.id, result)
    }
}

#[async_trait]
impl RpcSource for MockChain {
    async fn send_batch(&self, requests: Vec<JsonRpcRequest>) -> EtlResult<Vec<JsonRpcResponse>> {
        let injected = self
            .fail_batches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(EtlError::transport("connection reset by peer", None));
        }
        // Answer in reverse to exercise id correlation.
        Ok(requests.iter().rev().map(|r| self.answer(r)).collect())
    }
}

/// A scheduler over a [`MockChain`] exporting into SQLite and memory.
pub struct Harness {
    pub chain: Arc<MockChain>,
    pub repository: Repository,
    pub memory: Arc<MemoryExporter>,
    pub buffer: Arc<ExportBuffer>,
    pub scheduler: Arc<JobScheduler>,
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        sleep: Duration::ZERO,
    }
}

/// Exporter that rejects every batch while switched on.
#[derive(Default)]
pub struct SwitchExporter {
    failing: AtomicBool,
}

impl SwitchExporter {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ItemExporter for SwitchExporter {
    fn name(&self) -> &str {
        "switch"
    }

    async fn export_batch(&self, batch: &ExportBatch) -> EtlResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EtlError::database(
                format!("sink rejected {}", batch.range),
                None,
            ));
        }
        Ok(())
    }
}

pub async fn harness(chain: Arc<MockChain>, required: &[EntityType]) -> Harness {
    harness_with(chain, required, ExportOptions::default(), Vec::new()).await
}

/// Like [`harness`], with custom export options and exporters that run
/// ahead of the SQLite and memory sinks.
pub async fn harness_with(
    chain: Arc<MockChain>,
    required: &[EntityType],
    options: ExportOptions,
    leading: Vec<Arc<dyn ItemExporter>>,
) -> Harness {
    let repository = Repository::new(create_pool("sqlite::memory:").await.expect("pool"));
    let memory = Arc::new(MemoryExporter::new());
    let mut exporters = leading;
    exporters.push(Arc::new(SqliteExporter::new(repository.clone())));
    exporters.push(memory.clone());
    let buffer = Arc::new(ExportBuffer::new(
        ExportOptions {
            required_types: required.to_vec(),
            ..options
        },
        exporters,
    ));
    let executor = Arc::new(BatchWorkExecutor::new(
        "test",
        ExecutorOptions {
            max_workers: 2,
            batch_size: 4,
            retry: fast_retry(),
            ..ExecutorOptions::default()
        },
    ));
    let scheduler = Arc::new(
        JobScheduler::new(
            &JobRegistry::builtin(),
            required,
            chain.clone(),
            executor,
            buffer.clone(),
        )
        .expect("plan"),
    );

    Harness {
        chain,
        repository,
        memory,
        buffer,
        scheduler,
    }
}
