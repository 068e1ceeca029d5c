//! SQLite persistence for exported entities, sync cursors and fix jobs.
//!
//! # Architecture
//!
//! - `models`: row structs and conversions to and from domain records
//! - `repository`: batched upserts, cursor rows, fix-job bookkeeping
//! - Connection pooling with SQLite WAL mode for concurrency
//! - Embedded migrations from `migrations/`

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::{EtlError, EtlResult};

pub mod models;
pub mod repository;

pub use repository::Repository;

/// Tables that must exist once migrations ran.
const REQUIRED_TABLES: [&str; 9] = [
    "blocks",
    "transactions",
    "receipts",
    "logs",
    "token_transfers",
    "coin_balances",
    "contracts",
    "sync_records",
    "fix_jobs",
];

/// Creates a SQLite connection pool and applies migrations.
///
/// # Configuration
///
/// - **WAL mode**: Enables concurrent readers during writes
/// - **Busy timeout**: 30 seconds to ride out parallel worker processes
/// - **Max connections**: 5, or 1 for `:memory:` databases since every
///   connection would otherwise see its own empty database
///
/// # Example
///
/// ```no_run
/// use eth_stream_etl::db::create_pool;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pool = create_pool("sqlite:./etl.db").await?;
///     Ok(())
/// }
/// ```
///
/// # Errors
///
/// Returns a database error if the URL is invalid, the database cannot be
/// opened, or migrations fail.
pub async fn create_pool(database_url: &str) -> EtlResult<SqlitePool> {
    info!(database_url, "Connecting to database");

    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| {
            EtlError::database(
                format!("Failed to parse database URL: {database_url}"),
                Some(Box::new(e)),
            )
        })?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(30));

    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(|e| {
            EtlError::database(
                format!("Failed to connect to database at {database_url}"),
                Some(Box::new(e)),
            )
        })?;

    info!("Running database migrations");
    run_migrations(&pool).await?;
    verify_database(&pool).await?;
    info!("Database migrations complete");

    Ok(pool)
}

/// Applies all pending migrations from the `migrations/` directory.
///
/// # Errors
///
/// Returns a database error if a migration fails.
pub async fn run_migrations(pool: &SqlitePool) -> EtlResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| EtlError::database("Failed to run database migrations", Some(Box::new(e))))?;

    Ok(())
}

/// Verify that required tables exist after migrations.
///
/// # Errors
///
/// Returns a database error if a table is missing.
pub async fn verify_database(pool: &SqlitePool) -> EtlResult<()> {
    let rows = sqlx::query_as::<_, (String,)>(
        "SELECT name FROM sqlite_master WHERE type = 'table'",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| EtlError::database("Failed to verify database schema", Some(Box::new(e))))?;

    let missing: Vec<&str> = REQUIRED_TABLES
        .iter()
        .copied()
        .filter(|table| !rows.iter().any(|(name,)| name == table))
        .collect();

    if !missing.is_empty() {
        return Err(EtlError::database(
            format!("Database schema incomplete, missing: {}", missing.join(", ")),
            None,
        ));
    }

    Ok(())
}
