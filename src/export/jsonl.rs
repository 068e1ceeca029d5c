//! JSON-lines sink: `<dir>/<entity_type>.jsonl`, one entity per line.
//!
//! Files are append-only. Re-exports (retries, reorg repairs) append new
//! lines; readers keep the last line per natural key.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{ExportBatch, ItemExporter};
use crate::error::{EtlError, EtlResult};

/// Appends entities to per-type `.jsonl` files under a directory.
#[derive(Debug, Clone)]
pub struct JsonLinesExporter {
    dir: PathBuf,
}

impl JsonLinesExporter {
    /// Create the exporter, creating `dir` if missing.
    ///
    /// # Errors
    ///
    /// Returns an export error if the directory cannot be created.
    pub async fn new(dir: impl AsRef<Path>) -> EtlResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            EtlError::export(
                format!("Failed to create output directory {}", dir.display()),
                Some(Box::new(e)),
            )
        })?;
        Ok(Self { dir })
    }

    /// File holding entities of the given type name.
    #[must_use]
    pub fn file_for(&self, type_name: &str) -> PathBuf {
        self.dir.join(format!("{type_name}.jsonl"))
    }
}

#[async_trait]
impl ItemExporter for JsonLinesExporter {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn export_batch(&self, batch: &ExportBatch) -> EtlResult<()> {
        for (ty, entities) in &batch.items {
            if entities.is_empty() {
                continue;
            }

            let mut buf = Vec::new();
            for entity in entities {
                serde_json::to_writer(&mut buf, entity).map_err(|e| {
                    EtlError::export(format!("Failed to serialize {ty}"), Some(Box::new(e)))
                })?;
                buf.push(b'\n');
            }

            let path = self.file_for(ty.as_str());
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| {
                    EtlError::export(format!("Failed to open {}", path.display()), Some(Box::new(e)))
                })?;
            file.write_all(&buf).await.map_err(|e| {
                EtlError::export(format!("Failed to write {}", path.display()), Some(Box::new(e)))
            })?;
            file.flush().await.map_err(|e| {
                EtlError::export(format!("Failed to flush {}", path.display()), Some(Box::new(e)))
            })?;

            debug!(entity_type = %ty, count = entities.len(), path = %path.display(), "Wrote JSON lines");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BlockRange, BlockRecord, Entity, EntityType};
    use alloy::primitives::B256;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_appends_one_line_per_entity() {
        let Ok(dir) = tempfile::tempdir() else { return };
        let Ok(exporter) = JsonLinesExporter::new(dir.path()).await else {
            return;
        };

        let blocks: Vec<Entity> = (1..=3)
            .map(|n| Entity::Block(BlockRecord::new(n, B256::repeat_byte(n as u8), B256::ZERO, n)))
            .collect();
        let batch = ExportBatch {
            range: BlockRange { start: 1, end: 3 },
            reorg: false,
            items: BTreeMap::from([(EntityType::Block, blocks)]),
        };

        assert!(exporter.export_batch(&batch).await.is_ok());
        assert!(exporter.export_batch(&batch).await.is_ok());

        let content = tokio::fs::read_to_string(exporter.file_for("block"))
            .await
            .unwrap_or_default();
        assert_eq!(content.lines().count(), 6);
        assert!(content.lines().all(|l| l.contains("\"type\":\"block\"")));
    }
}
