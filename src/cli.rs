//! Command-line interface for the streaming ETL.
//!
//! # Commands
//!
//! - `stream`: follow the chain head and export new blocks
//! - `reorg`: start or resume a fix job for a suspect block
//! - `reorg-drain`: resume unfinished fix jobs until none remain
//! - `run-range` (hidden): export one range; used by worker processes
//!
//! Pipeline flags are global and override the matching environment
//! variables (see [`crate::config`]).
//!
//! # Example
//!
//! ```bash
//! eth-stream-etl stream --start-block 19000000 --entity-types block,token_transfer
//! eth-stream-etl reorg --block-number 19000500 --ranges 10
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::buffer::ExportBuffer;
use crate::config::{Config, SyncRecorderSpec};
use crate::controller::{
    DbSyncRecorder, FileSyncRecorder, RangeRunner, ReorgController, ReorgOutcome, ReorgRequest,
    SqliteFixJobStore, StreamController, SubprocessRunner, SyncRecorder,
};
use crate::db::{create_pool, Repository};
use crate::domain::BlockRange;
use crate::error::{EtlError, EtlResult};
use crate::executor::BatchWorkExecutor;
use crate::export::{ItemExporter, JsonLinesExporter, SqliteExporter};
use crate::jobs::JobRegistry;
use crate::rpc::{check_connection, create_provider, HttpBatchSource, RpcChain, RpcSource};
use crate::scheduler::JobScheduler;

/// Per-request deadline for JSON-RPC batches.
const RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// Reorg-aware streaming ETL for EVM chains
#[derive(Parser, Debug)]
#[command(name = "eth-stream-etl")]
#[command(about = "Streaming ETL for EVM chains with reorg repair", long_about = None)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by every command; each overrides an environment variable.
#[derive(Args, Debug, Default, Clone, PartialEq, Eq)]
struct PipelineArgs {
    /// JSON-RPC HTTP endpoint [env: PROVIDER_URI]
    #[arg(long, global = true)]
    provider_uri: Option<String>,

    /// SQLite database URL [env: DATABASE_URL]
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Comma-separated exported types [env: ENTITY_TYPES]
    #[arg(long, global = true)]
    entity_types: Option<String>,

    /// JSON-RPC requests per batch [env: BATCH_SIZE]
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Concurrent RPC batches [env: MAX_WORKERS]
    #[arg(long, global = true)]
    max_workers: Option<usize>,

    /// Directory for JSON-lines output [env: JSONL_OUTPUT]
    #[arg(long, global = true)]
    jsonl_output: Option<PathBuf>,
}

impl PipelineArgs {
    fn overrides(&self) -> HashMap<&'static str, String> {
        let mut map = HashMap::new();
        let mut put = |name: &'static str, value: Option<String>| {
            if let Some(value) = value {
                map.insert(name, value);
            }
        };
        put("PROVIDER_URI", self.provider_uri.clone());
        put("DATABASE_URL", self.database_url.clone());
        put("ENTITY_TYPES", self.entity_types.clone());
        put("BATCH_SIZE", self.batch_size.map(|v| v.to_string()));
        put("MAX_WORKERS", self.max_workers.map(|v| v.to_string()));
        put(
            "JSONL_OUTPUT",
            self.jsonl_output.as_ref().map(|p| p.display().to_string()),
        );
        map
    }

    /// The same flags as command-line arguments, for worker processes.
    fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (flag, value) in [
            ("--provider-uri", self.provider_uri.clone()),
            ("--database-url", self.database_url.clone()),
            ("--entity-types", self.entity_types.clone()),
            ("--batch-size", self.batch_size.map(|v| v.to_string())),
            ("--max-workers", self.max_workers.map(|v| v.to_string())),
            (
                "--jsonl-output",
                self.jsonl_output.as_ref().map(|p| p.display().to_string()),
            ),
        ] {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value);
            }
        }
        args
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Follow the chain head and export new blocks
    Stream(StreamArgs),

    /// Start or resume a reorg fix job
    Reorg(ReorgArgs),

    /// Resume unfinished fix jobs, oldest first, until none remain
    ReorgDrain,

    /// Export a single block range (worker process entry point)
    #[command(hide = true)]
    RunRange(RunRangeArgs),
}

#[derive(Args, Debug, Default)]
struct StreamArgs {
    /// First block when no cursor is recorded [env: START_BLOCK]
    #[arg(long)]
    start_block: Option<u64>,

    /// Stop after this block [env: END_BLOCK]
    #[arg(long)]
    end_block: Option<u64>,

    /// Blocks per scheduler run [env: BLOCK_BATCH_SIZE]
    #[arg(long)]
    block_batch_size: Option<u64>,

    /// Blocks kept behind the chain head [env: DELAY]
    #[arg(long)]
    delay: Option<u64>,

    /// Seconds to sleep when caught up [env: PERIOD_SECONDS]
    #[arg(long)]
    period_seconds: Option<u64>,

    /// Worker processes per range [env: PROCESS_NUMBER]
    #[arg(long)]
    process_number: Option<usize>,
}

impl StreamArgs {
    fn extend_overrides(&self, map: &mut HashMap<&'static str, String>) {
        for (name, value) in [
            ("START_BLOCK", self.start_block),
            ("END_BLOCK", self.end_block),
            ("BLOCK_BATCH_SIZE", self.block_batch_size),
            ("DELAY", self.delay),
            ("PERIOD_SECONDS", self.period_seconds),
        ] {
            if let Some(value) = value {
                map.insert(name, value.to_string());
            }
        }
        if let Some(processes) = self.process_number {
            map.insert("PROCESS_NUMBER", processes.to_string());
        }
    }
}

#[derive(Args, Debug)]
struct ReorgArgs {
    /// Suspect block to check first
    #[arg(long, required_unless_present = "fix_job_id", conflicts_with = "fix_job_id")]
    block_number: Option<u64>,

    /// Blocks to check below the suspect block
    #[arg(long, default_value = "10")]
    ranges: u64,

    /// Resume an existing fix job instead of creating one
    #[arg(long)]
    fix_job_id: Option<i64>,
}

impl ReorgArgs {
    fn request(&self) -> ReorgRequest {
        self.fix_job_id.map_or(
            ReorgRequest::New {
                block_number: self.block_number.unwrap_or_default(),
                ranges: self.ranges,
            },
            ReorgRequest::Resume,
        )
    }
}

#[derive(Args, Debug)]
struct RunRangeArgs {
    #[arg(long)]
    start_block: u64,

    #[arg(long)]
    end_block: u64,

    /// Re-export after a reorg
    #[arg(long)]
    reorg: bool,
}

/// Parse CLI arguments and execute the appropriate command.
///
/// # Errors
///
/// Returns an error if configuration, wiring, or the command fails; its
/// class decides the process exit code.
pub async fn run() -> EtlResult<()> {
    let cli = Cli::parse();
    let mut overrides = cli.pipeline.overrides();

    match cli.command {
        Commands::Stream(args) => {
            args.extend_overrides(&mut overrides);
            let config = Config::from_env_with(&overrides)?;
            run_stream(&config, &cli.pipeline).await
        }
        Commands::Reorg(args) => {
            let config = Config::from_env_with(&overrides)?;
            run_reorg(&config, &cli.pipeline, Some(args.request())).await
        }
        Commands::ReorgDrain => {
            let config = Config::from_env_with(&overrides)?;
            run_reorg(&config, &cli.pipeline, None).await
        }
        Commands::RunRange(args) => {
            let config = Config::from_env_with(&overrides)?;
            let range = BlockRange::new(args.start_block, args.end_block)?;
            run_range(&config, range, args.reorg).await
        }
    }
}

/// Collaborators shared by every command.
struct Pipeline {
    repository: Repository,
    source: Arc<dyn RpcSource>,
    executor: Arc<BatchWorkExecutor>,
    buffer: Arc<ExportBuffer>,
    scheduler: Arc<JobScheduler>,
    /// Cancelled by the buffer when an export fails and `crash_instantly` is set
    crash: CancellationToken,
    /// Contiguous exported cursor, published as exports land
    exported: watch::Receiver<Option<u64>>,
}

fn report_export_failure(range: BlockRange, err: &EtlError) {
    error!(
        %range,
        class = ?err.class(),
        exit_code = err.class().exit_code(),
        "Blocks were not exported"
    );
    eprintln!(
        "{} Export of blocks {} failed: {}",
        "✖".red().bold(),
        range.to_string().yellow(),
        err
    );
}

impl Pipeline {
    async fn build(config: &Config) -> EtlResult<Self> {
        let repository = Repository::new(create_pool(config.database_url()).await?);
        let source: Arc<dyn RpcSource> =
            Arc::new(HttpBatchSource::new(config.provider_uri(), RPC_TIMEOUT)?);

        let mut exporters: Vec<Arc<dyn ItemExporter>> =
            vec![Arc::new(SqliteExporter::new(repository.clone()))];
        if let Some(dir) = config.jsonl_output() {
            exporters.push(Arc::new(JsonLinesExporter::new(dir).await?));
        }

        let crash = CancellationToken::new();
        let (exported_tx, exported) = watch::channel(None);
        let buffer = Arc::new(
            ExportBuffer::new(config.export_options(), exporters)
                .with_crash_token(crash.clone())
                .on_success(Arc::new(move |cursor| {
                    exported_tx.send_replace(Some(cursor));
                }))
                .on_failure(Arc::new(report_export_failure)),
        );
        let executor = Arc::new(BatchWorkExecutor::new("rpc", config.executor_options()));
        let scheduler = Arc::new(JobScheduler::new(
            &JobRegistry::builtin(),
            config.entity_types(),
            source.clone(),
            executor.clone(),
            buffer.clone(),
        )?);

        Ok(Self {
            repository,
            source,
            executor,
            buffer,
            scheduler,
            crash,
            exported,
        })
    }

    /// In-process scheduler, or worker processes when more than one is configured.
    fn runner(&self, config: &Config, pipeline: &PipelineArgs) -> EtlResult<Arc<dyn RangeRunner>> {
        if config.process_number() > 1 {
            info!(
                processes = config.process_number(),
                timeout_secs = config.process_time_out().as_secs(),
                "Ranges run in worker processes"
            );
            let runner: Arc<dyn RangeRunner> = Arc::new(SubprocessRunner::current_exe(
                pipeline.to_args(),
                config.process_number(),
                config.process_time_out(),
            )?);
            Ok(runner)
        } else {
            let runner: Arc<dyn RangeRunner> = self.scheduler.clone();
            Ok(runner)
        }
    }

    async fn shutdown(&self) -> EtlResult<()> {
        let exported = self.buffer.shutdown().await;
        let executed = self.executor.shutdown().await;
        exported.and(executed)
    }
}

async fn run_stream(config: &Config, pipeline_args: &PipelineArgs) -> EtlResult<()> {
    info!("Starting stream");
    let pipeline = Pipeline::build(config).await?;

    let provider = create_provider(config.provider_uri()).await?;
    check_connection(&provider).await?;

    let recorder: Arc<dyn SyncRecorder> = match config.sync_recorder() {
        SyncRecorderSpec::File(path) => Arc::new(FileSyncRecorder::new(path)),
        SyncRecorderSpec::Db(sign) => {
            Arc::new(DbSyncRecorder::new(pipeline.repository.clone(), sign.clone()))
        }
    };

    let mut controller = StreamController::new(
        Arc::new(provider),
        pipeline.runner(config, pipeline_args)?,
        recorder,
        config.stream_options(),
    );
    if config.process_number() <= 1 {
        controller = controller.with_export_updates(pipeline.exported.clone());
    }
    let cursor = controller.init().await?;
    println!(
        "{} Streaming {} from block {}",
        "▶".cyan().bold(),
        config
            .entity_types()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
            .yellow(),
        cursor.map_or(0, |c| c + 1).to_string().yellow()
    );

    // A failed export stops the loop too; a signal leaves the buffer usable
    // so in-flight exports can still drain.
    let cancel = pipeline.crash.child_token();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown signal received, finishing current range");
        on_signal.cancel();
    });

    let result = controller.run(cancel).await;
    let shutdown = pipeline.shutdown().await;

    match controller.last_synced() {
        Some(block) => println!(
            "{} Last synced block: {}",
            "■".green().bold(),
            block.to_string().yellow()
        ),
        None => println!("{} Nothing synced", "■".green().bold()),
    }
    result.and(shutdown)
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

async fn run_reorg(
    config: &Config,
    pipeline_args: &PipelineArgs,
    request: Option<ReorgRequest>,
) -> EtlResult<()> {
    let pipeline = Pipeline::build(config).await?;
    let controller = ReorgController::new(
        pipeline.runner(config, pipeline_args)?,
        Arc::new(RpcChain::new(pipeline.source.clone())),
        Arc::new(pipeline.repository.clone()),
        Arc::new(SqliteFixJobStore::new(pipeline.repository.clone())),
        config.reorg_options(),
    );

    let result = match request {
        Some(request) => controller.action(request).await.map(|outcome| match outcome {
            ReorgOutcome::Completed { job, repaired } => println!(
                "{} Fix job {} completed at block {}, {} block(s) re-exported",
                "✔".green().bold(),
                job.id,
                job.last_fixed_block.to_string().yellow(),
                repaired.len().to_string().yellow()
            ),
            ReorgOutcome::Busy => println!(
                "{} Another fix job is running; nothing was changed",
                "…".yellow().bold()
            ),
        }),
        None => controller.drain().await.map(|completed| {
            println!(
                "{} {} fix job(s) completed",
                "✔".green().bold(),
                completed.to_string().yellow()
            );
        }),
    };

    let shutdown = pipeline.shutdown().await;
    result.and(shutdown)
}

async fn run_range(config: &Config, range: BlockRange, reorg: bool) -> EtlResult<()> {
    let pipeline = Pipeline::build(config).await?;
    let result = pipeline.scheduler.run_jobs(range, reorg).await;
    let shutdown = pipeline.shutdown().await;
    result.and(shutdown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_flags_become_overrides() {
        let cli = Cli::try_parse_from([
            "eth-stream-etl",
            "stream",
            "--provider-uri",
            "http://localhost:8545",
            "--start-block",
            "100",
            "--block-batch-size",
            "20",
            "--process-number",
            "3",
        ])
        .expect("parse");

        let mut overrides = cli.pipeline.overrides();
        let Commands::Stream(args) = cli.command else {
            unreachable!("parsed the stream command");
        };
        args.extend_overrides(&mut overrides);

        assert_eq!(overrides["PROVIDER_URI"], "http://localhost:8545");
        assert_eq!(overrides["START_BLOCK"], "100");
        assert_eq!(overrides["BLOCK_BATCH_SIZE"], "20");
        assert_eq!(overrides["PROCESS_NUMBER"], "3");
        assert!(!overrides.contains_key("END_BLOCK"));
    }

    #[test]
    fn test_reorg_needs_block_or_job_id() {
        assert!(Cli::try_parse_from(["eth-stream-etl", "reorg"]).is_err());
        assert!(Cli::try_parse_from([
            "eth-stream-etl",
            "reorg",
            "--block-number",
            "5",
            "--fix-job-id",
            "1"
        ])
        .is_err());

        let cli = Cli::try_parse_from(["eth-stream-etl", "reorg", "--block-number", "500"])
            .expect("parse");
        let Commands::Reorg(args) = cli.command else {
            unreachable!("parsed the reorg command");
        };
        assert_eq!(
            args.request(),
            ReorgRequest::New {
                block_number: 500,
                ranges: 10
            }
        );

        let cli =
            Cli::try_parse_from(["eth-stream-etl", "reorg", "--fix-job-id", "7"]).expect("parse");
        let Commands::Reorg(args) = cli.command else {
            unreachable!("parsed the reorg command");
        };
        assert_eq!(args.request(), ReorgRequest::Resume(7));
    }

    #[test]
    fn test_worker_args_round_trip() {
        let pipeline = PipelineArgs {
            provider_uri: Some("http://node:8545".to_string()),
            entity_types: Some("block,log".to_string()),
            batch_size: Some(50),
            ..PipelineArgs::default()
        };

        let mut argv = vec!["eth-stream-etl".to_string()];
        argv.extend(pipeline.to_args());
        argv.extend(
            ["run-range", "--start-block", "1", "--end-block", "9", "--reorg"].map(String::from),
        );

        let cli = Cli::try_parse_from(argv).expect("parse");
        assert_eq!(cli.pipeline, pipeline);
        let Commands::RunRange(args) = cli.command else {
            unreachable!("parsed the run-range command");
        };
        assert_eq!((args.start_block, args.end_block, args.reorg), (1, 9, true));
    }
}
