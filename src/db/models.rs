//! Database models that map to SQL tables.
//!
//! Hashes, addresses and byte strings are stored as `0x`-prefixed lowercase
//! hex, 256-bit integers as decimal text, and unsigned block numbers as
//! SQLite `INTEGER`.

use std::str::FromStr;

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{FixJob, FixJobStatus};
use crate::error::{EtlError, EtlResult};

/// Store a `u64` in an SQLite integer column.
#[must_use]
pub fn int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Read a `u64` back from an SQLite integer column.
#[must_use]
pub fn uint(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Hex text for a hash.
#[must_use]
pub fn hash_text(hash: &B256) -> String {
    format!("{hash:?}")
}

/// Hex text for an address.
#[must_use]
pub fn address_text(address: &Address) -> String {
    format!("{address:?}")
}

/// Decimal text for a 256-bit amount.
#[must_use]
pub fn amount_text(value: &U256) -> String {
    value.to_string()
}

/// Parse a stored hash.
///
/// # Errors
///
/// Returns a decoding error if the column does not hold a 32-byte hex value.
pub fn parse_hash(text: &str) -> EtlResult<B256> {
    B256::from_str(text).map_err(|e| {
        EtlError::decoding(format!("invalid stored hash '{text}'"), Some(Box::new(e)))
    })
}

fn millis_to_time(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// A row of the `blocks` table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BlockRow {
    /// Block height
    pub block_number: i64,
    /// Block hash
    pub hash: String,
    /// Parent hash
    pub parent_hash: String,
    /// Unix timestamp of the block
    pub timestamp: i64,
    /// Fee recipient
    pub miner: String,
    /// Transactions in the block
    pub transaction_count: i64,
}

/// A row of the `sync_records` table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SyncRecordRow {
    /// Pipeline identifier
    pub mission_sign: String,
    /// Last exported block
    pub last_block_number: i64,
    /// Unix milliseconds of the last update
    pub update_time: i64,
}

/// A row of the `fix_jobs` table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FixJobRow {
    /// Row id
    pub id: i64,
    /// Suspect block
    pub start_block: i64,
    /// Lowest processed block
    pub last_fixed_block: i64,
    /// Blocks left
    pub remaining: i64,
    /// Status name
    pub status: String,
    /// Unix milliseconds
    pub created_at: i64,
    /// Unix milliseconds
    pub updated_at: i64,
}

impl TryFrom<FixJobRow> for FixJob {
    type Error = EtlError;

    fn try_from(row: FixJobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            start_block: uint(row.start_block),
            last_fixed_block: uint(row.last_fixed_block),
            remaining: uint(row.remaining),
            status: FixJobStatus::from_str(&row.status)?,
            created_at: millis_to_time(row.created_at),
            updated_at: millis_to_time(row.updated_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_text_is_parseable() {
        let hash = B256::repeat_byte(0xab);
        let text = hash_text(&hash);
        assert!(text.starts_with("0xabab"));
        assert_eq!(parse_hash(&text).ok(), Some(hash));
        assert!(parse_hash("0x12").is_err());
    }

    #[test]
    fn test_integer_conversion_saturates() {
        assert_eq!(int(u64::MAX), i64::MAX);
        assert_eq!(uint(-1), 0);
        assert_eq!(uint(int(42)), 42);
    }

    #[test]
    fn test_fix_job_row_conversion() {
        let row = FixJobRow {
            id: 3,
            start_block: 500,
            last_fixed_block: 495,
            remaining: 6,
            status: "interrupt".to_string(),
            created_at: 1_700_000_000_000,
            updated_at: 1_700_000_060_000,
        };
        let job = FixJob::try_from(row).expect("valid row");
        assert_eq!(job.status, FixJobStatus::Interrupt);
        assert_eq!(job.next_block(), Some(494));
        assert_eq!(job.updated_at.timestamp(), 1_700_000_060);
    }
}
