//! Export sinks.
//!
//! An [`ItemExporter`] receives one [`ExportBatch`] per flush: every entity
//! of the externally required types produced for a block range, sorted by
//! block and in-block position.
//!
//! - [`SqliteExporter`]: idempotent upserts into the SQLite schema
//! - [`JsonLinesExporter`]: one append-only `.jsonl` file per entity type
//! - [`MemoryExporter`]: keeps batches in memory (tests, dry runs)

mod jsonl;
mod memory;
mod sqlite;

pub use jsonl::JsonLinesExporter;
pub use memory::MemoryExporter;
pub use sqlite::SqliteExporter;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::domain::{BlockRange, Entity, EntityType};
use crate::error::EtlResult;

/// Entities of one flushed block range, grouped by type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportBatch {
    /// Blocks covered by this batch
    pub range: BlockRange,
    /// Re-export after a reorg: stale rows in `range` must be replaced
    pub reorg: bool,
    /// Entities per type, each list sorted by [`Entity::sort_key`]
    pub items: BTreeMap<EntityType, Vec<Entity>>,
}

impl ExportBatch {
    /// Entities of one type (empty if none).
    #[must_use]
    pub fn items_of(&self, ty: EntityType) -> &[Entity] {
        self.items.get(&ty).map_or(&[], Vec::as_slice)
    }

    /// Total number of entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.values().map(Vec::len).sum()
    }

    /// Whether the batch carries no entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A destination for exported entities.
#[async_trait]
pub trait ItemExporter: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Durably write `batch`.
    ///
    /// Must be idempotent: the same batch may be exported again after a
    /// retry or a restart from an older cursor.
    async fn export_batch(&self, batch: &ExportBatch) -> EtlResult<()>;
}
