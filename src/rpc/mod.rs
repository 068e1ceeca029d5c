//! RPC access to the Ethereum node.
//!
//! # Layout
//!
//! - [`json_rpc`]: JSON-RPC 2.0 envelopes and request builders
//! - [`source`]: the [`RpcSource`] batch seam and its HTTP implementation
//! - [`payload`]: raw node payloads and their conversion into records
//! - [`head`]: chain head and canonical hash lookups
//! - [`http`]: alloy provider used for head polling and health checks
//!
//! ```text
//!   jobs ──► RpcSource::send_batch ──► HttpBatchSource (reqwest, JSON array)
//!   controllers ──► ChainHead / CanonicalChain ──► alloy Provider | RpcChain
//! ```

pub mod head;
pub mod http;
pub mod json_rpc;
pub mod payload;
pub mod source;

// Re-export commonly used types
pub use head::{CanonicalChain, ChainHead, RpcChain};
pub use http::{check_connection, create_provider, get_latest_block, Provider};
pub use json_rpc::{JsonRpcRequest, JsonRpcResponse, LogFilterWire};
pub use source::{call_batch, call_one, HttpBatchSource, RequestIds, RpcSource};
