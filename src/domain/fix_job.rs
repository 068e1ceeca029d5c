//! Persisted reorg repair jobs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EtlError;

/// Lifecycle state of a [`FixJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixJobStatus {
    /// Created, never claimed
    Submitted,
    /// Claimed by a live repair loop
    Running,
    /// Stopped by an error; resumable from its checkpoint
    Interrupt,
    /// Every block processed
    Completed,
}

impl FixJobStatus {
    /// Storage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Interrupt => "interrupt",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for FixJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FixJobStatus {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(Self::Submitted),
            "running" => Ok(Self::Running),
            "interrupt" => Ok(Self::Interrupt),
            "completed" => Ok(Self::Completed),
            other => Err(EtlError::decoding(
                format!("unknown fix job status '{other}'"),
                None,
            )),
        }
    }
}

/// A resumable walk backwards over `remaining` blocks below
/// `last_fixed_block`.
///
/// The next block to verify is always `last_fixed_block - 1`; a fresh job
/// starts one above its suspect block so the suspect block itself is
/// checked first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixJob {
    /// Store-assigned id
    pub id: i64,
    /// Suspect block the repair was started for
    pub start_block: u64,
    /// Lowest block already processed
    pub last_fixed_block: u64,
    /// Blocks left to process
    pub remaining: u64,
    /// Lifecycle state
    pub status: FixJobStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last checkpoint time
    pub updated_at: DateTime<Utc>,
}

impl FixJob {
    /// Block the next step verifies, if any remain.
    #[must_use]
    pub const fn next_block(&self) -> Option<u64> {
        if self.remaining == 0 || self.last_fixed_block == 0 {
            None
        } else {
            Some(self.last_fixed_block - 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(last_fixed_block: u64, remaining: u64) -> FixJob {
        FixJob {
            id: 1,
            start_block: 500,
            last_fixed_block,
            remaining,
            status: FixJobStatus::Submitted,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_next_block_walks_down() {
        assert_eq!(job(501, 11).next_block(), Some(500));
        assert_eq!(job(491, 1).next_block(), Some(490));
        assert_eq!(job(490, 0).next_block(), None);
        assert_eq!(job(0, 3).next_block(), None);
    }

    #[test]
    fn test_status_round_trips_through_storage_name() {
        for status in [
            FixJobStatus::Submitted,
            FixJobStatus::Running,
            FixJobStatus::Interrupt,
            FixJobStatus::Completed,
        ] {
            assert_eq!(status.as_str().parse::<FixJobStatus>().ok(), Some(status));
        }
        assert!("paused".parse::<FixJobStatus>().is_err());
    }
}
