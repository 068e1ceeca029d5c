use async_trait::async_trait;

use super::{ExportBatch, ItemExporter};
use crate::db::Repository;
use crate::error::EtlResult;

/// Writes batches through the [`Repository`], one transaction per batch.
#[derive(Debug, Clone)]
pub struct SqliteExporter {
    repository: Repository,
}

impl SqliteExporter {
    /// Export into `repository`.
    #[must_use]
    pub const fn new(repository: Repository) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl ItemExporter for SqliteExporter {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn export_batch(&self, batch: &ExportBatch) -> EtlResult<()> {
        self.repository.write_batch(batch).await
    }
}
