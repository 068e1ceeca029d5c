use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{ExportBatch, ItemExporter};
use crate::domain::EntityType;
use crate::error::EtlResult;

/// Keeps every exported batch in memory.
#[derive(Debug, Default)]
pub struct MemoryExporter {
    batches: Mutex<Vec<ExportBatch>>,
}

impl MemoryExporter {
    /// Empty exporter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Batches received so far, in arrival order.
    #[must_use]
    pub fn batches(&self) -> Vec<ExportBatch> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of exported entities of `ty` across all batches.
    #[must_use]
    pub fn count(&self, ty: EntityType) -> usize {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|b| b.items_of(ty).len())
            .sum()
    }
}

#[async_trait]
impl ItemExporter for MemoryExporter {
    fn name(&self) -> &str {
        "memory"
    }

    async fn export_batch(&self, batch: &ExportBatch) -> EtlResult<()> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(batch.clone());
        Ok(())
    }
}
