//! Alloy HTTP provider used for chain-head polling.
//!
//! Bulk extraction goes through [`super::source::HttpBatchSource`]; this
//! provider only answers "where is the head" for the stream controller and
//! the startup connectivity check.
//!
//! ```no_run
//! use eth_stream_etl::rpc::{create_provider, get_latest_block};
//!
//! # async fn example() -> eth_stream_etl::error::EtlResult<()> {
//! let provider = create_provider("http://localhost:8545").await?;
//! println!("head: {}", get_latest_block(&provider).await?);
//! # Ok(())
//! # }
//! ```

use std::time::Instant;

use alloy::providers::{Provider as _, ProviderBuilder, RootProvider};
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::error::{EtlError, EtlResult};
use crate::rpc::head::ChainHead;

/// Plain HTTP provider.
pub type Provider = RootProvider<Http<Client>>;

/// Endpoint without path or query, so API keys never reach the logs.
fn redacted_host(rpc_url: &str) -> &str {
    let rest = rpc_url
        .split_once("://")
        .map_or(rpc_url, |(_, rest)| rest);
    rest.split(['/', '?']).next().unwrap_or(rest)
}

/// Build a provider for `rpc_url`.
///
/// # Errors
///
/// Returns a configuration error if the URL cannot be parsed.
#[allow(clippy::unused_async)]
#[instrument(skip(rpc_url), fields(rpc_host = redacted_host(rpc_url)))]
pub async fn create_provider(rpc_url: &str) -> EtlResult<Provider> {
    let url = rpc_url.parse().map_err(|e| {
        EtlError::config(
            format!("invalid provider URI '{}', expected http(s)://host[:port]", redacted_host(rpc_url)),
            Some(Box::new(e)),
        )
    })?;
    debug!("Head provider ready");
    Ok(ProviderBuilder::new().on_http(url))
}

/// Current head block number.
///
/// # Errors
///
/// Any failure is a transport error: head polling is always safe to retry.
#[instrument(skip(provider), fields(block = tracing::field::Empty))]
pub async fn get_latest_block(provider: &Provider) -> EtlResult<u64> {
    let started = Instant::now();
    let head = provider
        .get_block_number()
        .await
        .map_err(|e| EtlError::transport("eth_blockNumber failed", Some(Box::new(e))))?;

    tracing::Span::current().record("block", head);
    debug!(elapsed_ms = started.elapsed().as_millis(), "Head fetched");
    Ok(head)
}

/// Fail fast at startup when the node is unreachable.
///
/// # Errors
///
/// Returns a transport error if the head cannot be read.
pub async fn check_connection(provider: &Provider) -> EtlResult<()> {
    match get_latest_block(provider).await {
        Ok(head) => {
            info!(head, "Node reachable");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "Node unreachable");
            Err(EtlError::transport(
                "provider connection check failed",
                Some(Box::new(e)),
            ))
        }
    }
}

#[async_trait]
impl ChainHead for Provider {
    async fn latest_block_number(&self) -> EtlResult<u64> {
        get_latest_block(self).await
    }
}
