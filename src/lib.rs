//! # Ethereum Streaming ETL
//!
//! Reorg-aware extract/transform/load for EVM chains, built on
//! [Alloy](https://github.com/alloy-rs/alloy) primitives.
//!
//! The pipeline follows the chain head in block ranges, extracts the
//! requested entity types through batched JSON-RPC, and exports them to
//! SQLite (and optionally JSON-lines files). A separate reorg path walks
//! backwards from a suspect block and re-exports every block whose stored
//! hash no longer matches the canonical chain.
//!
//! ## Architecture
//!
//! 1. **Executor** ([`executor`]) - bounded worker pool with adaptive batch size
//! 2. **Jobs** ([`jobs`]) - typed extraction units with static descriptors
//! 3. **Scheduler** ([`scheduler`]) - dependency-ordered job plan per range
//! 4. **Buffer** ([`buffer`]) - typed run buffer and sequenced async export
//! 5. **Controllers** ([`controller`]) - stream cursor and reorg fix jobs
//!
//! Around them sit [`rpc`] (JSON-RPC batches, chain head), [`export`] and
//! [`db`] (sinks and persistence), [`config`], [`observability`] and [`cli`].
//!
//! ## Using as a Library
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use eth_stream_etl::buffer::{ExportBuffer, ExportOptions};
//! use eth_stream_etl::domain::{BlockRange, EntityType};
//! use eth_stream_etl::executor::{BatchWorkExecutor, ExecutorOptions};
//! use eth_stream_etl::export::{ItemExporter, MemoryExporter};
//! use eth_stream_etl::jobs::JobRegistry;
//! use eth_stream_etl::rpc::HttpBatchSource;
//! use eth_stream_etl::scheduler::JobScheduler;
//!
//! # async fn example() -> eth_stream_etl::error::EtlResult<()> {
//! let source = Arc::new(HttpBatchSource::new("http://localhost:8545", Duration::from_secs(30))?);
//! let sink = Arc::new(MemoryExporter::new());
//! let required = [EntityType::Block, EntityType::TokenTransfer];
//! let buffer = Arc::new(ExportBuffer::new(
//!     ExportOptions { required_types: required.to_vec(), ..ExportOptions::default() },
//!     vec![sink.clone() as Arc<dyn ItemExporter>],
//! ));
//! let executor = Arc::new(BatchWorkExecutor::new("rpc", ExecutorOptions::default()));
//!
//! let scheduler = JobScheduler::new(&JobRegistry::builtin(), &required, source, executor, buffer)?;
//! scheduler.run_jobs(BlockRange::new(19_000_000, 19_000_009)?, false).await?;
//! println!("{} token transfers", sink.count(EntityType::TokenTransfer));
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All operations return [`error::EtlResult<T>`](error::EtlResult). Every
//! error has an [`ErrorClass`](error::ErrorClass): retriable failures are
//! retried with a bounded budget, crashable ones stop the process at once.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod buffer;
pub mod cli;
pub mod config;
pub mod controller;
pub mod db;
pub mod domain;
pub mod error;
pub mod executor;
pub mod export;
pub mod jobs;
pub mod observability;
pub mod rpc;
pub mod scheduler;
