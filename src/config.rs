//! Configuration management for the streaming ETL.
//!
//! Configuration is read from environment variables (a `.env` file is
//! loaded first via `dotenvy`). Command-line flags are applied as
//! overrides keyed by the same variable names, so both paths share one
//! parser. All operations return [`EtlResult`].
//!
//! ## Environment Variables
//!
//! Required:
//! - `PROVIDER_URI`: JSON-RPC HTTP endpoint
//!
//! Optional (with defaults):
//! - `DATABASE_URL`: SQLite URL (default: `sqlite:./etl.db`)
//! - `START_BLOCK` / `END_BLOCK`: sync bounds (default: unset)
//! - `BLOCK_BATCH_SIZE`: blocks per scheduler run (default: 10)
//! - `BATCH_SIZE`: JSON-RPC requests per batch (default: 10)
//! - `MAX_WORKERS`: concurrent RPC batches (default: 5)
//! - `DELAY`: blocks kept behind the head (default: 0)
//! - `PERIOD_SECONDS`: sleep when caught up (default: 10)
//! - `ENTITY_TYPES`: exported types (default: `block,transaction`)
//! - `EXPORT_MAX_WORKERS` / `EXPORT_MAX_PENDING`: export pool (default: 4 / 8)
//! - `SYNC_EXPORT`: wait for each export (default: true)
//! - `CRASH_INSTANTLY`: stop on the first export failure (default: true)
//! - `SYNC_RECORDER`: `file:<path>` or `db:<mission_sign>`
//!   (default: `file:./last_synced_block.txt`)
//! - `PROCESS_NUMBER`: worker processes per range (default: 1)
//! - `PROCESS_TIME_OUT`: worker deadline in seconds (default: 600)
//! - `RETRY_LIMIT`: attempts for retriable failures (default: 5)
//! - `JSONL_OUTPUT`: directory for a JSON-lines sink (default: unset)
//!
//! ## Example
//!
//! ```no_run
//! use eth_stream_etl::config::Config;
//! use eth_stream_etl::error::EtlResult;
//!
//! # fn main() -> EtlResult<()> {
//! let config = Config::from_env()?;
//! println!("RPC URL: {}", config.provider_uri());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::buffer::ExportOptions;
use crate::controller::{ReorgOptions, StreamOptions};
use crate::domain::EntityType;
use crate::error::{EtlError, EtlResult};
use crate::executor::{ExecutorOptions, RetryPolicy};

/// Where the stream cursor is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRecorderSpec {
    /// Flat file holding one integer
    File(PathBuf),
    /// `sync_records` row keyed by a mission sign
    Db(String),
}

impl FromStr for SyncRecorderSpec {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("file", path)) if !path.is_empty() => Ok(Self::File(PathBuf::from(path))),
            Some(("db", sign)) if !sign.is_empty() => Ok(Self::Db(sign.to_string())),
            _ => Err(EtlError::config(
                format!("SYNC_RECORDER must be 'file:<path>' or 'db:<mission_sign>', got: {s}"),
                None,
            )),
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    provider_uri: String,
    database_url: String,
    start_block: Option<u64>,
    end_block: Option<u64>,
    block_batch_size: u64,
    batch_size: usize,
    max_workers: usize,
    delay: u64,
    period: Duration,
    entity_types: Vec<EntityType>,
    export_max_workers: usize,
    export_max_pending: usize,
    sync_export: bool,
    crash_instantly: bool,
    sync_recorder: SyncRecorderSpec,
    process_number: usize,
    process_time_out: Duration,
    retry_limit: usize,
    jsonl_output: Option<PathBuf>,
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> EtlResult<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(name).map_or(Ok(default), |raw| {
        raw.trim().parse::<T>().map_err(|e| {
            EtlError::config(
                format!("{name} has an invalid value: '{raw}'"),
                Some(Box::new(e)),
            )
        })
    })
}

fn parse_optional<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> EtlResult<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            EtlError::config(
                format!("{name} has an invalid value: '{raw}'"),
                Some(Box::new(e)),
            )
        }),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `PROVIDER_URI` is missing or any
    /// variable fails to parse.
    pub fn from_env() -> EtlResult<Self> {
        Self::from_env_with(&HashMap::new())
    }

    /// Load configuration, letting `overrides` win over the environment.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_env_with(overrides: &HashMap<&'static str, String>) -> EtlResult<Self> {
        // Load .env file if present (ignore error if file doesn't exist)
        dotenvy::dotenv().ok();

        Self::from_lookup(|name| {
            overrides
                .get(name)
                .cloned()
                .or_else(|| std::env::var(name).ok())
        })
    }

    /// Build a configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EtlResult<Self> {
        let provider_uri = lookup("PROVIDER_URI")
            .filter(|uri| !uri.trim().is_empty())
            .ok_or_else(|| {
                EtlError::config("PROVIDER_URI environment variable is required", None)
            })?;
        if !provider_uri.starts_with("http://") && !provider_uri.starts_with("https://") {
            return Err(EtlError::config(
                format!("PROVIDER_URI must be an http(s) endpoint, got: {provider_uri}"),
                None,
            ));
        }

        let database_url =
            lookup("DATABASE_URL").unwrap_or_else(|| "sqlite:./etl.db".to_string());

        let start_block = parse_optional(&lookup, "START_BLOCK")?;
        let end_block = parse_optional(&lookup, "END_BLOCK")?;
        if let (Some(start), Some(end)) = (start_block, end_block) {
            if end < start {
                return Err(EtlError::config(
                    format!("END_BLOCK ({end}) is below START_BLOCK ({start})"),
                    None,
                ));
            }
        }

        let block_batch_size = parse_var(&lookup, "BLOCK_BATCH_SIZE", 10_u64)?;
        let batch_size = parse_var(&lookup, "BATCH_SIZE", 10_usize)?;
        let max_workers = parse_var(&lookup, "MAX_WORKERS", 5_usize)?;
        for (name, is_zero) in [
            ("BLOCK_BATCH_SIZE", block_batch_size == 0),
            ("BATCH_SIZE", batch_size == 0),
            ("MAX_WORKERS", max_workers == 0),
        ] {
            if is_zero {
                return Err(EtlError::config(format!("{name} must be at least 1"), None));
            }
        }

        let entity_types = EntityType::parse_list(
            &lookup("ENTITY_TYPES").unwrap_or_else(|| "block,transaction".to_string()),
        )
        .map_err(|e| EtlError::config(format!("ENTITY_TYPES: {e}"), Some(Box::new(e))))?;
        if entity_types.is_empty() {
            return Err(EtlError::config("ENTITY_TYPES must name at least one type", None));
        }

        let sync_recorder: SyncRecorderSpec = lookup("SYNC_RECORDER")
            .unwrap_or_else(|| "file:./last_synced_block.txt".to_string())
            .parse()?;

        Ok(Self {
            provider_uri,
            database_url,
            start_block,
            end_block,
            block_batch_size,
            batch_size,
            max_workers,
            delay: parse_var(&lookup, "DELAY", 0_u64)?,
            period: Duration::from_secs(parse_var(&lookup, "PERIOD_SECONDS", 10_u64)?),
            entity_types,
            export_max_workers: parse_var(&lookup, "EXPORT_MAX_WORKERS", 4_usize)?,
            export_max_pending: parse_var(&lookup, "EXPORT_MAX_PENDING", 8_usize)?,
            sync_export: parse_var(&lookup, "SYNC_EXPORT", true)?,
            crash_instantly: parse_var(&lookup, "CRASH_INSTANTLY", true)?,
            sync_recorder,
            process_number: parse_var(&lookup, "PROCESS_NUMBER", 1_usize)?.max(1),
            process_time_out: Duration::from_secs(parse_var(&lookup, "PROCESS_TIME_OUT", 600_u64)?),
            retry_limit: parse_var(&lookup, "RETRY_LIMIT", 5_usize)?.max(1),
            jsonl_output: lookup("JSONL_OUTPUT")
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from),
        })
    }

    /// JSON-RPC endpoint.
    #[must_use]
    pub fn provider_uri(&self) -> &str {
        &self.provider_uri
    }

    /// SQLite database URL.
    #[must_use]
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Worker processes per range.
    #[must_use]
    pub const fn process_number(&self) -> usize {
        self.process_number
    }

    /// Deadline for one worker process.
    #[must_use]
    pub const fn process_time_out(&self) -> Duration {
        self.process_time_out
    }

    /// Types exported out of the process.
    #[must_use]
    pub fn entity_types(&self) -> &[EntityType] {
        &self.entity_types
    }

    /// Cursor persistence.
    #[must_use]
    pub const fn sync_recorder(&self) -> &SyncRecorderSpec {
        &self.sync_recorder
    }

    /// Directory for the JSON-lines sink, if enabled.
    #[must_use]
    pub fn jsonl_output(&self) -> Option<&PathBuf> {
        self.jsonl_output.as_ref()
    }

    /// Retry policy shared by the executor and the controllers.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_limit,
            ..RetryPolicy::default()
        }
    }

    /// Options for the RPC worker pool.
    #[must_use]
    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            max_workers: self.max_workers,
            batch_size: self.batch_size,
            retry: self.retry_policy(),
            ..ExecutorOptions::default()
        }
    }

    /// Options for the export buffer.
    #[must_use]
    pub fn export_options(&self) -> ExportOptions {
        ExportOptions {
            max_workers: self.export_max_workers,
            max_pending: self.export_max_pending,
            sync_export: self.sync_export,
            crash_instantly: self.crash_instantly,
            required_types: self.entity_types.clone(),
            overrides: HashMap::new(),
        }
    }

    /// Options for the stream controller.
    #[must_use]
    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            start_block: self.start_block,
            end_block: self.end_block,
            step: self.block_batch_size,
            delay: self.delay,
            period: self.period,
            retry: self.retry_policy(),
        }
    }

    /// Options for the reorg controller.
    #[must_use]
    pub fn reorg_options(&self) -> ReorgOptions {
        ReorgOptions {
            retry: self.retry_policy(),
            ..ReorgOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(vars: &[(&str, &str)]) -> EtlResult<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("PROVIDER_URI", "http://localhost:8545")]).expect("config");

        assert_eq!(config.database_url(), "sqlite:./etl.db");
        assert_eq!(
            config.entity_types(),
            &[EntityType::Block, EntityType::Transaction]
        );
        assert_eq!(
            config.sync_recorder(),
            &SyncRecorderSpec::File(PathBuf::from("./last_synced_block.txt"))
        );
        assert_eq!(config.process_number(), 1);
        assert!(config.jsonl_output().is_none());

        let stream = config.stream_options();
        assert_eq!(stream.step, 10);
        assert_eq!(stream.delay, 0);
        assert_eq!(stream.period, Duration::from_secs(10));
        assert_eq!(stream.start_block, None);

        let export = config.export_options();
        assert!(export.sync_export);
        assert!(export.crash_instantly);
        assert_eq!((export.max_workers, export.max_pending), (4, 8));

        assert_eq!(config.executor_options().max_workers, 5);
        assert_eq!(config.retry_policy().max_attempts, 5);
    }

    #[test]
    fn test_provider_uri_required() {
        assert!(matches!(config(&[]), Err(EtlError::ConfigError { .. })));
        assert!(matches!(
            config(&[("PROVIDER_URI", "")]),
            Err(EtlError::ConfigError { .. })
        ));
        assert!(config(&[("PROVIDER_URI", "ws://localhost:8546")]).is_err());
    }

    #[test]
    fn test_values_are_parsed() {
        let config = config(&[
            ("PROVIDER_URI", "https://node.example"),
            ("START_BLOCK", "100"),
            ("END_BLOCK", "200"),
            ("BLOCK_BATCH_SIZE", "25"),
            ("DELAY", "5"),
            ("ENTITY_TYPES", "block, token_transfer"),
            ("SYNC_EXPORT", "false"),
            ("SYNC_RECORDER", "db:mainnet"),
            ("PROCESS_NUMBER", "4"),
            ("JSONL_OUTPUT", "/tmp/out"),
        ])
        .expect("config");

        let stream = config.stream_options();
        assert_eq!((stream.start_block, stream.end_block), (Some(100), Some(200)));
        assert_eq!(stream.step, 25);
        assert_eq!(stream.delay, 5);
        assert_eq!(
            config.entity_types(),
            &[EntityType::Block, EntityType::TokenTransfer]
        );
        assert!(!config.export_options().sync_export);
        assert_eq!(
            config.sync_recorder(),
            &SyncRecorderSpec::Db("mainnet".to_string())
        );
        assert_eq!(config.process_number(), 4);
        assert_eq!(config.jsonl_output(), Some(&PathBuf::from("/tmp/out")));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let base = ("PROVIDER_URI", "http://localhost:8545");
        assert!(config(&[base, ("START_BLOCK", "soon")]).is_err());
        assert!(config(&[base, ("START_BLOCK", "10"), ("END_BLOCK", "5")]).is_err());
        assert!(config(&[base, ("BATCH_SIZE", "0")]).is_err());
        assert!(config(&[base, ("ENTITY_TYPES", "block,uncle")]).is_err());
        assert!(config(&[base, ("SYNC_RECORDER", "redis:x")]).is_err());
        assert!(config(&[base, ("SYNC_EXPORT", "maybe")]).is_err());
    }

    #[test]
    fn test_overrides_win_over_lookup() {
        let mut overrides = HashMap::new();
        overrides.insert("PROVIDER_URI", "http://override:8545".to_string());
        overrides.insert("START_BLOCK", "7".to_string());

        let config = Config::from_lookup(|name| overrides.get(name).cloned()).expect("config");
        assert_eq!(config.provider_uri(), "http://override:8545");
        assert_eq!(config.stream_options().start_block, Some(7));
    }
}
