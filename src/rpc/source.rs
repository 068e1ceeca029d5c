//! Batched JSON-RPC transport.
//!
//! [`RpcSource`] is the seam every job talks through: it sends one batch of
//! requests and returns the responses keyed back to their request ids.
//! [`HttpBatchSource`] posts the batch as a JSON array over HTTP; tests plug
//! in their own in-memory implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::json_rpc::{JsonRpcRequest, JsonRpcResponse};
use crate::error::{EtlError, EtlResult};

/// Sends batches of JSON-RPC requests to a node.
#[async_trait]
pub trait RpcSource: Send + Sync {
    /// Send `requests` as one batch.
    ///
    /// Implementations may return responses in any order; callers correlate
    /// them by id (see [`call_batch`]).
    ///
    /// # Errors
    ///
    /// Transport failures are [`EtlError::TransportError`] (retriable), HTTP
    /// statuses and error envelopes are classified as in [`EtlError`].
    async fn send_batch(&self, requests: Vec<JsonRpcRequest>) -> EtlResult<Vec<JsonRpcResponse>>;
}

/// Send a batch and return each request's result in request order.
///
/// A node error on any single request fails the whole batch with that
/// request's classified error, so the executor can shrink and retry.
///
/// # Errors
///
/// Returns a transport error when a response is missing for some request id
/// and the classified node error when any response carries one.
pub async fn call_batch(
    source: &dyn RpcSource,
    requests: Vec<JsonRpcRequest>,
) -> EtlResult<Vec<Value>> {
    if requests.is_empty() {
        return Ok(Vec::new());
    }

    let order: Vec<(u64, String)> = requests
        .iter()
        .map(|r| (r.id, r.method.clone()))
        .collect();
    let responses = source.send_batch(requests).await?;

    let mut by_id: HashMap<u64, JsonRpcResponse> = HashMap::with_capacity(responses.len());
    for response in responses {
        match response.id {
            Some(id) => {
                by_id.insert(id, response);
            }
            None => {
                // Envelope-level error without an id fails the whole batch.
                let method = order.first().map_or("batch", |(_, m)| m.as_str());
                response.into_result(method)?;
                return Err(EtlError::transport("response without id", None));
            }
        }
    }

    order
        .into_iter()
        .map(|(id, method)| {
            by_id
                .remove(&id)
                .ok_or_else(|| {
                    EtlError::transport(format!("no response for {method} request {id}"), None)
                })?
                .into_result(&method)
        })
        .collect()
}

/// Send a single request through the batch interface.
///
/// # Errors
///
/// Same as [`call_batch`].
pub async fn call_one(source: &dyn RpcSource, request: JsonRpcRequest) -> EtlResult<Value> {
    call_batch(source, vec![request])
        .await?
        .pop()
        .ok_or_else(|| EtlError::transport("empty batch response", None))
}

/// Monotonic request id allocator shared by jobs talking to one source.
#[derive(Debug, Default)]
pub struct RequestIds(AtomicU64);

impl RequestIds {
    /// Next unused id.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// [`RpcSource`] posting JSON arrays to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpBatchSource {
    http: reqwest::Client,
    url: String,
}

impl HttpBatchSource {
    /// Build a source for `url` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> EtlResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EtlError::config("Failed to build HTTP client", Some(Box::new(e))))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    /// Endpoint this source posts to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

fn classify_reqwest(err: reqwest::Error) -> EtlError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        EtlError::transport(format!("HTTP transport failure: {err}"), Some(Box::new(err)))
    } else if err.is_decode() {
        EtlError::decoding(format!("Malformed JSON-RPC response: {err}"), Some(Box::new(err)))
    } else {
        EtlError::rpc(format!("HTTP request failed: {err}"), Some(Box::new(err)))
    }
}

#[async_trait]
impl RpcSource for HttpBatchSource {
    #[instrument(skip(self, requests), fields(batch_len = requests.len()))]
    async fn send_batch(&self, requests: Vec<JsonRpcRequest>) -> EtlResult<Vec<JsonRpcResponse>> {
        if requests.is_empty() {
            return Ok(vec![]);
        }

        let resp = self
            .http
            .post(&self.url)
            .json(&requests)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "RPC endpoint returned error status");
            return Err(EtlError::from_http_status(status.as_u16(), &body));
        }

        let body: Value = resp.json().await.map_err(classify_reqwest)?;
        let responses = match body {
            Value::Array(_) => serde_json::from_value::<Vec<JsonRpcResponse>>(body),
            // Some providers answer a rejected batch with a single error object.
            other => serde_json::from_value::<JsonRpcResponse>(other).map(|r| vec![r]),
        }
        .map_err(|e| EtlError::decoding("Malformed JSON-RPC response", Some(Box::new(e))))?;

        debug!(responses = responses.len(), "Batch answered");
        Ok(responses)
    }
}
