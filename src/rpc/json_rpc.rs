//! JSON-RPC 2.0 wire types and request builders.
//!
//! Every request carries a numeric `id` (the request id) chosen by the
//! caller; responses are correlated back to the originating work item by
//! that id, never by position.

use alloy::primitives::{Address, Bytes, B256};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{EtlError, EtlResult};

/// A JSON-RPC 2.0 request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Always `"2.0"`
    pub jsonrpc: String,
    /// Method name, e.g. `eth_getBlockByNumber`
    pub method: String,
    /// Positional parameters
    pub params: Vec<Value>,
    /// Request id used for correlation
    pub id: u64,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC 2.0 request.
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    /// Error code
    pub code: i64,
    /// Error message
    pub message: String,
    /// Optional extra payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A JSON-RPC 2.0 response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always `"2.0"`
    #[serde(default)]
    pub jsonrpc: String,
    /// Id of the request this answers; `None` for envelope-level errors
    #[serde(default)]
    pub id: Option<u64>,
    /// Result payload on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error object on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

impl JsonRpcResponse {
    /// Successful response carrying `result`.
    #[must_use]
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Error response carrying `code` and `message`.
    pub fn failure(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: Some(id),
            result: None,
            error: Some(JsonRpcErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Unwrap the result, classifying node errors by code.
    ///
    /// A missing `result` without an error object maps to JSON `null`.
    ///
    /// # Errors
    ///
    /// Returns the classified error when the node answered with an error
    /// object (see [`EtlError::from_rpc_code`]).
    pub fn into_result(self, method: &str) -> EtlResult<Value> {
        if let Some(err) = self.error {
            return Err(EtlError::from_rpc_code(err.code, &err.message, method));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Server-side log filter in wire form: `{address: [...], topics: [[...]]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilterWire {
    /// Contract addresses; empty means any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub address: Vec<Address>,
    /// Topic positions; each inner list is OR-ed, positions are AND-ed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<Vec<B256>>,
}

/// Hex quantity encoding used by Ethereum JSON-RPC (`0x1b4`).
#[must_use]
pub fn quantity(value: u64) -> String {
    format!("{value:#x}")
}

/// `eth_blockNumber`
#[must_use]
pub fn block_number(id: u64) -> JsonRpcRequest {
    JsonRpcRequest::new(id, "eth_blockNumber", vec![])
}

/// `eth_getBlockByNumber`, optionally with full transaction objects.
#[must_use]
pub fn get_block_by_number(id: u64, number: u64, full_transactions: bool) -> JsonRpcRequest {
    JsonRpcRequest::new(
        id,
        "eth_getBlockByNumber",
        vec![json!(quantity(number)), json!(full_transactions)],
    )
}

/// `eth_getTransactionReceipt`
#[must_use]
pub fn get_transaction_receipt(id: u64, hash: B256) -> JsonRpcRequest {
    JsonRpcRequest::new(id, "eth_getTransactionReceipt", vec![json!(hash)])
}

/// `eth_getBlockReceipts`
#[must_use]
pub fn get_block_receipts(id: u64, number: u64) -> JsonRpcRequest {
    JsonRpcRequest::new(id, "eth_getBlockReceipts", vec![json!(quantity(number))])
}

/// `eth_getCode` at a given block.
#[must_use]
pub fn get_code(id: u64, address: Address, block: u64) -> JsonRpcRequest {
    JsonRpcRequest::new(
        id,
        "eth_getCode",
        vec![json!(address), json!(quantity(block))],
    )
}

/// `eth_getBalance` at a given block.
#[must_use]
pub fn get_balance(id: u64, address: Address, block: u64) -> JsonRpcRequest {
    JsonRpcRequest::new(
        id,
        "eth_getBalance",
        vec![json!(address), json!(quantity(block))],
    )
}

/// `eth_call` against `to` with `data` at a given block.
#[must_use]
pub fn eth_call(id: u64, to: Address, data: &Bytes, block: u64) -> JsonRpcRequest {
    JsonRpcRequest::new(
        id,
        "eth_call",
        vec![json!({ "to": to, "data": data }), json!(quantity(block))],
    )
}

/// `eth_getLogs` over an inclusive block window with a wire filter.
#[must_use]
pub fn get_logs(id: u64, from_block: u64, to_block: u64, filter: &LogFilterWire) -> JsonRpcRequest {
    let mut params = json!({
        "fromBlock": quantity(from_block),
        "toBlock": quantity(to_block),
    });
    if !filter.address.is_empty() {
        params["address"] = json!(filter.address);
    }
    if !filter.topics.is_empty() {
        params["topics"] = json!(filter.topics);
    }
    JsonRpcRequest::new(id, "eth_getLogs", vec![params])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = get_block_by_number(7, 436, true);
        let json = serde_json::to_value(&req).unwrap_or_default();

        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["method"], "eth_getBlockByNumber");
        assert_eq!(json["params"][0], "0x1b4");
        assert_eq!(json["params"][1], true);
        assert_eq!(json["id"], 7);
    }

    #[test]
    fn test_response_error_is_classified() {
        let resp = JsonRpcResponse::failure(1, -32005, "limit exceeded");
        let err = resp.into_result("eth_getLogs");
        assert!(matches!(err, Err(ref e) if e.is_retriable()));
    }

    #[test]
    fn test_response_without_result_is_null() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: Some(3),
            result: None,
            error: None,
        };
        assert_eq!(resp.into_result("eth_getCode").ok(), Some(Value::Null));
    }

    #[test]
    fn test_get_logs_omits_empty_filter_parts() {
        let filter = LogFilterWire {
            address: vec![],
            topics: vec![vec![B256::repeat_byte(0xdd)]],
        };
        let req = get_logs(1, 10, 20, &filter);
        let params = &req.params[0];

        assert_eq!(params["fromBlock"], "0xa");
        assert_eq!(params["toBlock"], "0x14");
        assert!(params.get("address").is_none());
        assert_eq!(params["topics"][0].as_array().map(Vec::len), Some(1));
    }
}
