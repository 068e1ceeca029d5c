//! Repository pattern for database operations.
//!
//! Provides batched, idempotent upserts for exported entities, the sync
//! cursor rows, and the fix-job bookkeeping used by reorg repair.

use alloy::primitives::B256;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info, instrument};

use super::models::{
    address_text, amount_text, hash_text, int, parse_hash, uint, BlockRow, FixJobRow,
    SyncRecordRow,
};
use crate::domain::{BlockRange, Entity, EntityType, FixJob, FixJobStatus};
use crate::error::{EtlError, EtlResult};
use crate::export::ExportBatch;

const FIX_JOB_COLUMNS: &str =
    "id, start_block, last_fixed_block, remaining, status, created_at, updated_at";

/// Table holding entities of `ty`.
#[must_use]
pub const fn table_for(ty: EntityType) -> &'static str {
    match ty {
        EntityType::Block => "blocks",
        EntityType::Transaction => "transactions",
        EntityType::Receipt => "receipts",
        EntityType::Log => "logs",
        EntityType::TokenTransfer => "token_transfers",
        EntityType::CoinBalance => "coin_balances",
        EntityType::Contract => "contracts",
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn db_error(message: impl Into<String>) -> impl FnOnce(sqlx::Error) -> EtlError {
    let message = message.into();
    move |e| EtlError::database(message, Some(Box::new(e)))
}

/// Repository for database operations.
///
/// Wraps a SQLite connection pool and provides type-safe methods
/// for all database interactions.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Creates a new repository with the given connection pool.
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ==================== ENTITY OPERATIONS ====================

    /// Writes one export batch in a single transaction.
    ///
    /// Reorg batches first delete every row of the exported types inside
    /// the batch range. Upserts never move a row to an older block.
    ///
    /// # Errors
    ///
    /// Returns a database error; nothing is written in that case.
    #[instrument(skip(self, batch), fields(range = %batch.range, reorg = batch.reorg, count = batch.len()))]
    pub async fn write_batch(&self, batch: &ExportBatch) -> EtlResult<()> {
        if batch.is_empty() && !batch.reorg {
            debug!("Empty export batch, skipping");
            return Ok(());
        }

        let start = std::time::Instant::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to start transaction"))?;

        if batch.reorg {
            for ty in batch.items.keys() {
                delete_range(&mut *tx, *ty, batch.range).await?;
            }
        }

        for entities in batch.items.values() {
            for entity in entities {
                upsert(&mut *tx, entity).await.map_err(|e| {
                    EtlError::database(
                        format!(
                            "Failed to upsert {} at block {}",
                            entity.entity_type(),
                            entity.block_number()
                        ),
                        Some(Box::new(e)),
                    )
                })?;
            }
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit transaction"))?;

        debug!(
            duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Export batch written"
        );
        Ok(())
    }

    /// Stored hash of block `number`, if that block was exported.
    ///
    /// # Errors
    ///
    /// Returns a database error, or a decoding error for a corrupt hash.
    pub async fn block_hash(&self, number: u64) -> EtlResult<Option<B256>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT hash FROM blocks WHERE block_number = ?")
            .bind(int(number))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error(format!("Failed to read block {number}")))?;

        row.map(|(hash,)| parse_hash(&hash)).transpose()
    }

    /// Stored block row.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    pub async fn get_block(&self, number: u64) -> EtlResult<Option<BlockRow>> {
        sqlx::query_as::<_, BlockRow>(
            "SELECT block_number, hash, parent_hash, timestamp, miner, transaction_count
             FROM blocks WHERE block_number = ?",
        )
        .bind(int(number))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error(format!("Failed to read block {number}")))
    }

    /// Rows stored for `ty`.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    pub async fn count(&self, ty: EntityType) -> EtlResult<u64> {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table_for(ty)))
            .fetch_one(&self.pool)
            .await
            .map_err(db_error(format!("Failed to count {ty}")))?;
        Ok(uint(count))
    }

    // ==================== SYNC CURSOR OPERATIONS ====================

    /// Last block recorded for `mission_sign`.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    pub async fn get_sync_record(&self, mission_sign: &str) -> EtlResult<Option<u64>> {
        let row = sqlx::query_as::<_, SyncRecordRow>(
            "SELECT mission_sign, last_block_number, update_time
             FROM sync_records WHERE mission_sign = ?",
        )
        .bind(mission_sign)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to read sync record"))?;

        Ok(row.map(|r| uint(r.last_block_number)))
    }

    /// Record `block` as the last exported block for `mission_sign`.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    #[instrument(skip(self))]
    pub async fn set_sync_record(&self, mission_sign: &str, block: u64) -> EtlResult<()> {
        sqlx::query(
            "INSERT INTO sync_records (mission_sign, last_block_number, update_time)
             VALUES (?, ?, ?)
             ON CONFLICT (mission_sign) DO UPDATE SET
                 last_block_number = excluded.last_block_number,
                 update_time = excluded.update_time",
        )
        .bind(mission_sign)
        .bind(int(block))
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to write sync record"))?;
        Ok(())
    }

    // ==================== FIX JOB OPERATIONS ====================

    /// Insert a running fix job unless another live job is running.
    ///
    /// Running jobs not updated since `stale_before` (unix millis) are
    /// first demoted to `interrupt`. Returns `None` when busy, in which
    /// case nothing was written.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    #[instrument(skip(self))]
    pub async fn create_running_fix_job(
        &self,
        start_block: u64,
        last_fixed_block: u64,
        remaining: u64,
        stale_before: i64,
    ) -> EtlResult<Option<FixJob>> {
        let now = now_millis();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to start transaction"))?;

        demote_stale(&mut *tx, stale_before).await?;

        let row = sqlx::query_as::<_, FixJobRow>(&format!(
            "INSERT INTO fix_jobs (start_block, last_fixed_block, remaining, status, created_at, updated_at)
             SELECT ?, ?, ?, 'running', ?, ?
             WHERE NOT EXISTS (SELECT 1 FROM fix_jobs WHERE status = 'running')
             RETURNING {FIX_JOB_COLUMNS}"
        ))
        .bind(int(start_block))
        .bind(int(last_fixed_block))
        .bind(int(remaining))
        .bind(now)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to create fix job"))?;

        tx.commit()
            .await
            .map_err(db_error("Failed to commit transaction"))?;

        row.map(FixJob::try_from).transpose()
    }

    /// Mark fix job `id` running unless it is completed, or another live
    /// job is running.
    ///
    /// Returns the claimed job, or `None` when it could not be claimed.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    #[instrument(skip(self))]
    pub async fn claim_fix_job(&self, id: i64, stale_before: i64) -> EtlResult<Option<FixJob>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to start transaction"))?;

        demote_stale(&mut *tx, stale_before).await?;

        let row = sqlx::query_as::<_, FixJobRow>(&format!(
            "UPDATE fix_jobs SET status = 'running', updated_at = ?
             WHERE id = ? AND status IN ('submitted', 'interrupt')
               AND NOT EXISTS (SELECT 1 FROM fix_jobs WHERE status = 'running')
             RETURNING {FIX_JOB_COLUMNS}"
        ))
        .bind(now_millis())
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error(format!("Failed to claim fix job {id}")))?;

        tx.commit()
            .await
            .map_err(db_error("Failed to commit transaction"))?;

        row.map(FixJob::try_from).transpose()
    }

    /// Load fix job `id`.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    pub async fn get_fix_job(&self, id: i64) -> EtlResult<Option<FixJob>> {
        let row = sqlx::query_as::<_, FixJobRow>(&format!(
            "SELECT {FIX_JOB_COLUMNS} FROM fix_jobs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error(format!("Failed to read fix job {id}")))?;

        row.map(FixJob::try_from).transpose()
    }

    /// Checkpoint a fix job after one processed block.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    pub async fn save_fix_job_progress(
        &self,
        id: i64,
        last_fixed_block: u64,
        remaining: u64,
    ) -> EtlResult<()> {
        sqlx::query(
            "UPDATE fix_jobs SET last_fixed_block = ?, remaining = ?, updated_at = ? WHERE id = ?",
        )
        .bind(int(last_fixed_block))
        .bind(int(remaining))
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_error(format!("Failed to checkpoint fix job {id}")))?;
        Ok(())
    }

    /// Set the status of a fix job.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    pub async fn set_fix_job_status(&self, id: i64, status: FixJobStatus) -> EtlResult<()> {
        sqlx::query("UPDATE fix_jobs SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error(format!("Failed to update fix job {id}")))?;
        Ok(())
    }

    /// Oldest fix job that has not completed.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    pub async fn next_unfinished_fix_job(&self) -> EtlResult<Option<FixJob>> {
        let row = sqlx::query_as::<_, FixJobRow>(&format!(
            "SELECT {FIX_JOB_COLUMNS} FROM fix_jobs
             WHERE status != 'completed'
             ORDER BY created_at, id
             LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to query fix jobs"))?;

        row.map(FixJob::try_from).transpose()
    }

    // ==================== HEALTH ====================

    /// Checks database connectivity.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub async fn health_check(&self) -> EtlResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_error("Database health check failed"))?;
        Ok(())
    }
}

async fn demote_stale(conn: &mut SqliteConnection, stale_before: i64) -> EtlResult<()> {
    let demoted = sqlx::query(
        "UPDATE fix_jobs SET status = 'interrupt' WHERE status = 'running' AND updated_at <= ?",
    )
    .bind(stale_before)
    .execute(&mut *conn)
    .await
    .map_err(db_error("Failed to demote stale fix jobs"))?
    .rows_affected();

    if demoted > 0 {
        info!(demoted, "Reclaimed stale running fix jobs");
    }
    Ok(())
}

async fn delete_range(conn: &mut SqliteConnection, ty: EntityType, range: BlockRange) -> EtlResult<()> {
    let deleted = sqlx::query(&format!(
        "DELETE FROM {} WHERE block_number BETWEEN ? AND ?",
        table_for(ty)
    ))
    .bind(int(range.start))
    .bind(int(range.end))
    .execute(&mut *conn)
    .await
    .map_err(db_error(format!("Failed to clear {ty} in {range}")))?
    .rows_affected();

    debug!(entity = %ty, %range, deleted, "Cleared rows for reorg re-export");
    Ok(())
}

#[allow(clippy::too_many_lines)]
async fn upsert(conn: &mut SqliteConnection, entity: &Entity) -> Result<(), sqlx::Error> {
    match entity {
        Entity::Block(b) => {
            sqlx::query(
                "INSERT INTO blocks (
                     block_number, hash, parent_hash, timestamp, miner, gas_used, gas_limit,
                     base_fee_per_gas, transaction_count, updated_at
                 )
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (block_number) DO UPDATE SET
                     hash = excluded.hash,
                     parent_hash = excluded.parent_hash,
                     timestamp = excluded.timestamp,
                     miner = excluded.miner,
                     gas_used = excluded.gas_used,
                     gas_limit = excluded.gas_limit,
                     base_fee_per_gas = excluded.base_fee_per_gas,
                     transaction_count = excluded.transaction_count,
                     updated_at = excluded.updated_at
                 WHERE excluded.block_number >= blocks.block_number",
            )
            .bind(int(b.number))
            .bind(hash_text(&b.hash))
            .bind(hash_text(&b.parent_hash))
            .bind(int(b.timestamp))
            .bind(address_text(&b.miner))
            .bind(int(b.gas_used))
            .bind(int(b.gas_limit))
            .bind(b.base_fee_per_gas.map(int))
            .bind(int(b.transaction_count))
            .bind(now_millis())
            .execute(&mut *conn)
            .await?;
        }
        Entity::Transaction(t) => {
            sqlx::query(
                "INSERT INTO transactions (
                     hash, block_number, block_hash, block_timestamp, transaction_index,
                     from_address, to_address, value, gas, gas_price, nonce, input
                 )
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (hash) DO UPDATE SET
                     block_number = excluded.block_number,
                     block_hash = excluded.block_hash,
                     block_timestamp = excluded.block_timestamp,
                     transaction_index = excluded.transaction_index,
                     gas_price = excluded.gas_price
                 WHERE excluded.block_number >= transactions.block_number",
            )
            .bind(hash_text(&t.hash))
            .bind(int(t.block_number))
            .bind(hash_text(&t.block_hash))
            .bind(int(t.block_timestamp))
            .bind(int(t.transaction_index))
            .bind(address_text(&t.from))
            .bind(t.to.as_ref().map(address_text))
            .bind(amount_text(&t.value))
            .bind(int(t.gas))
            .bind(t.gas_price.as_ref().map(amount_text))
            .bind(int(t.nonce))
            .bind(t.input.to_string())
            .execute(&mut *conn)
            .await?;
        }
        Entity::Receipt(r) => {
            sqlx::query(
                "INSERT INTO receipts (
                     transaction_hash, block_number, block_hash, transaction_index, status,
                     gas_used, cumulative_gas_used, effective_gas_price, contract_address,
                     from_address, to_address
                 )
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (transaction_hash) DO UPDATE SET
                     block_number = excluded.block_number,
                     block_hash = excluded.block_hash,
                     transaction_index = excluded.transaction_index,
                     status = excluded.status,
                     gas_used = excluded.gas_used,
                     cumulative_gas_used = excluded.cumulative_gas_used,
                     effective_gas_price = excluded.effective_gas_price
                 WHERE excluded.block_number >= receipts.block_number",
            )
            .bind(hash_text(&r.transaction_hash))
            .bind(int(r.block_number))
            .bind(hash_text(&r.block_hash))
            .bind(int(r.transaction_index))
            .bind(r.status.map(int))
            .bind(int(r.gas_used))
            .bind(int(r.cumulative_gas_used))
            .bind(r.effective_gas_price.as_ref().map(amount_text))
            .bind(r.contract_address.as_ref().map(address_text))
            .bind(address_text(&r.from))
            .bind(r.to.as_ref().map(address_text))
            .execute(&mut *conn)
            .await?;
        }
        Entity::Log(l) => {
            let topics = serde_json::to_string(&l.topics)
                .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
            sqlx::query(
                "INSERT INTO logs (
                     transaction_hash, log_index, block_number, block_hash, transaction_index,
                     address, topics, data
                 )
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (transaction_hash, log_index) DO UPDATE SET
                     block_number = excluded.block_number,
                     block_hash = excluded.block_hash,
                     transaction_index = excluded.transaction_index
                 WHERE excluded.block_number >= logs.block_number",
            )
            .bind(hash_text(&l.transaction_hash))
            .bind(int(l.log_index))
            .bind(int(l.block_number))
            .bind(hash_text(&l.block_hash))
            .bind(int(l.transaction_index))
            .bind(address_text(&l.address))
            .bind(topics)
            .bind(l.data.to_string())
            .execute(&mut *conn)
            .await?;
        }
        Entity::TokenTransfer(t) => {
            sqlx::query(
                "INSERT INTO token_transfers (
                     transaction_hash, log_index, block_number, block_hash, token_address,
                     from_address, to_address, value
                 )
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (transaction_hash, log_index) DO UPDATE SET
                     block_number = excluded.block_number,
                     block_hash = excluded.block_hash
                 WHERE excluded.block_number >= token_transfers.block_number",
            )
            .bind(hash_text(&t.transaction_hash))
            .bind(int(t.log_index))
            .bind(int(t.block_number))
            .bind(hash_text(&t.block_hash))
            .bind(address_text(&t.token_address))
            .bind(address_text(&t.from))
            .bind(address_text(&t.to))
            .bind(amount_text(&t.value))
            .execute(&mut *conn)
            .await?;
        }
        Entity::CoinBalance(c) => {
            sqlx::query(
                "INSERT INTO coin_balances (address, block_number, balance)
                 VALUES (?, ?, ?)
                 ON CONFLICT (address, block_number) DO UPDATE SET
                     balance = excluded.balance
                 WHERE excluded.block_number >= coin_balances.block_number",
            )
            .bind(address_text(&c.address))
            .bind(int(c.block_number))
            .bind(amount_text(&c.balance))
            .execute(&mut *conn)
            .await?;
        }
        Entity::Contract(c) => {
            sqlx::query(
                "INSERT INTO contracts (
                     address, block_number, block_hash, transaction_hash, creator, bytecode
                 )
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT (address) DO UPDATE SET
                     block_number = excluded.block_number,
                     block_hash = excluded.block_hash,
                     transaction_hash = excluded.transaction_hash,
                     creator = excluded.creator,
                     bytecode = excluded.bytecode
                 WHERE excluded.block_number >= contracts.block_number",
            )
            .bind(address_text(&c.address))
            .bind(int(c.block_number))
            .bind(hash_text(&c.block_hash))
            .bind(hash_text(&c.transaction_hash))
            .bind(address_text(&c.creator))
            .bind(c.bytecode.to_string())
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;
    use crate::domain::{BlockRecord, ContractRecord};
    use alloy::primitives::{Address, Bytes};
    use std::collections::BTreeMap;

    async fn setup_test_db() -> Repository {
        let pool = create_pool("sqlite::memory:")
            .await
            .expect("Failed to create pool");
        Repository::new(pool)
    }

    fn block(number: u64, tag: u8) -> Entity {
        Entity::Block(BlockRecord::new(
            number,
            B256::repeat_byte(tag),
            B256::repeat_byte(tag.wrapping_sub(1)),
            1_700_000_000 + number,
        ))
    }

    fn batch(range: BlockRange, reorg: bool, entities: Vec<Entity>) -> ExportBatch {
        let mut items: BTreeMap<EntityType, Vec<Entity>> = BTreeMap::new();
        for entity in entities {
            items.entry(entity.entity_type()).or_default().push(entity);
        }
        ExportBatch { range, reorg, items }
    }

    #[tokio::test]
    async fn test_write_batch_and_read_hash() {
        let repo = setup_test_db().await;
        let range = BlockRange::new(1, 3).expect("valid range");
        repo.write_batch(&batch(range, false, vec![block(1, 1), block(2, 2), block(3, 3)]))
            .await
            .expect("Failed to write batch");

        assert_eq!(repo.count(EntityType::Block).await.expect("count"), 3);
        assert_eq!(
            repo.block_hash(2).await.expect("hash"),
            Some(B256::repeat_byte(2))
        );
        assert_eq!(repo.block_hash(9).await.expect("hash"), None);
        let row = repo.get_block(3).await.expect("row").expect("block 3");
        assert_eq!(row.timestamp, 1_700_000_003);
    }

    #[tokio::test]
    async fn test_duplicate_export_is_idempotent() {
        let repo = setup_test_db().await;
        let range = BlockRange::single(7);
        let data = batch(range, false, vec![block(7, 7)]);

        repo.write_batch(&data).await.expect("first write");
        repo.write_batch(&data).await.expect("second write");

        assert_eq!(repo.count(EntityType::Block).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn test_upsert_never_moves_row_to_older_block() {
        let repo = setup_test_db().await;
        let contract = |block_number: u64, tag: u8| {
            Entity::Contract(ContractRecord {
                address: Address::repeat_byte(0xcc),
                block_number,
                block_hash: B256::repeat_byte(tag),
                transaction_hash: B256::repeat_byte(tag),
                creator: Address::ZERO,
                bytecode: Bytes::from(vec![tag]),
            })
        };

        repo.write_batch(&batch(BlockRange::single(20), false, vec![contract(20, 2)]))
            .await
            .expect("newer write");
        repo.write_batch(&batch(BlockRange::single(10), false, vec![contract(10, 1)]))
            .await
            .expect("older write");

        let (block_number,): (i64,) = sqlx::query_as("SELECT block_number FROM contracts")
            .fetch_one(repo.pool())
            .await
            .expect("query");
        assert_eq!(block_number, 20);
    }

    #[tokio::test]
    async fn test_reorg_batch_replaces_range() {
        let repo = setup_test_db().await;
        let range = BlockRange::new(5, 6).expect("valid range");
        repo.write_batch(&batch(range, false, vec![block(5, 5), block(6, 6)]))
            .await
            .expect("initial write");

        repo.write_batch(&batch(BlockRange::single(6), true, vec![block(6, 0x66)]))
            .await
            .expect("reorg write");

        assert_eq!(repo.block_hash(5).await.expect("hash"), Some(B256::repeat_byte(5)));
        assert_eq!(
            repo.block_hash(6).await.expect("hash"),
            Some(B256::repeat_byte(0x66))
        );
    }

    #[tokio::test]
    async fn test_sync_record_round_trip() {
        let repo = setup_test_db().await;
        assert_eq!(repo.get_sync_record("mainnet").await.expect("read"), None);

        repo.set_sync_record("mainnet", 110).await.expect("write");
        repo.set_sync_record("mainnet", 120).await.expect("write");
        repo.set_sync_record("other", 5).await.expect("write");

        assert_eq!(repo.get_sync_record("mainnet").await.expect("read"), Some(120));
    }

    #[tokio::test]
    async fn test_fix_job_single_flight() {
        let repo = setup_test_db().await;
        let stale_before = now_millis() - 600_000;

        let first = repo
            .create_running_fix_job(500, 501, 11, stale_before)
            .await
            .expect("create");
        assert!(first.is_some());

        let second = repo
            .create_running_fix_job(800, 801, 11, stale_before)
            .await
            .expect("create");
        assert!(second.is_none());

        let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM fix_jobs")
            .fetch_one(repo.pool())
            .await
            .expect("count");
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_fix_job_claim_and_progress() {
        let repo = setup_test_db().await;
        let stale_before = now_millis() - 600_000;
        let job = repo
            .create_running_fix_job(500, 501, 11, stale_before)
            .await
            .expect("create")
            .expect("claimed");

        // Already running: cannot be claimed again
        assert!(repo.claim_fix_job(job.id, stale_before).await.expect("claim").is_none());

        repo.save_fix_job_progress(job.id, 496, 6).await.expect("checkpoint");
        repo.set_fix_job_status(job.id, FixJobStatus::Interrupt)
            .await
            .expect("interrupt");

        let next = repo
            .next_unfinished_fix_job()
            .await
            .expect("query")
            .expect("unfinished job");
        assert_eq!(next.id, job.id);
        assert_eq!(next.next_block(), Some(495));

        let claimed = repo
            .claim_fix_job(job.id, stale_before)
            .await
            .expect("claim")
            .expect("claimable");
        assert_eq!(claimed.status, FixJobStatus::Running);
        assert_eq!(claimed.remaining, 6);

        repo.set_fix_job_status(job.id, FixJobStatus::Completed)
            .await
            .expect("complete");
        assert!(repo.next_unfinished_fix_job().await.expect("query").is_none());
    }

    #[tokio::test]
    async fn test_stale_running_job_is_reclaimed() {
        let repo = setup_test_db().await;
        let job = repo
            .create_running_fix_job(500, 501, 11, 0)
            .await
            .expect("create")
            .expect("claimed");

        // Everything up to now counts as stale
        let reclaimed = repo
            .create_running_fix_job(900, 901, 3, now_millis() + 1)
            .await
            .expect("create");
        assert!(reclaimed.is_some());

        let old = repo.get_fix_job(job.id).await.expect("read").expect("exists");
        assert_eq!(old.status, FixJobStatus::Interrupt);
    }

    #[tokio::test]
    async fn test_health_check() {
        let repo = setup_test_db().await;
        assert!(repo.health_check().await.is_ok());
    }
}
