//! Typed holding area with per-type locks and one global lock.
//!
//! Per-type operations hold the shared side of a fair [`RwLock`] plus the
//! mutex of their type; the global snapshot holds the exclusive side. The
//! lock is write-preferring, so once a snapshot is waiting no new per-type
//! operation starts, and the snapshot runs only after every in-flight
//! per-type operation has released.

use std::collections::BTreeMap;

use tokio::sync::{Mutex, RwLock};

use crate::domain::{Entity, EntityType};

/// Entities of the current run, keyed by type.
#[derive(Debug)]
pub struct TypedBuffer {
    gate: RwLock<()>,
    slots: Vec<Mutex<Vec<Entity>>>,
}

impl Default for TypedBuffer {
    fn default() -> Self {
        Self {
            gate: RwLock::new(()),
            slots: EntityType::ALL.iter().map(|_| Mutex::new(Vec::new())).collect(),
        }
    }
}

impl TypedBuffer {
    /// Empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    const fn slot_index(ty: EntityType) -> usize {
        ty as usize
    }

    /// Append one entity under its type.
    pub async fn append(&self, ty: EntityType, entity: Entity) {
        let _shared = self.gate.read().await;
        self.slots[Self::slot_index(ty)].lock().await.push(entity);
    }

    /// Append several entities under one type.
    pub async fn extend(&self, ty: EntityType, entities: impl IntoIterator<Item = Entity> + Send) {
        let _shared = self.gate.read().await;
        self.slots[Self::slot_index(ty)].lock().await.extend(entities);
    }

    /// Copy of the entities stored under `ty`.
    pub async fn get(&self, ty: EntityType) -> Vec<Entity> {
        let _shared = self.gate.read().await;
        self.slots[Self::slot_index(ty)].lock().await.clone()
    }

    /// Replace the entities stored under `ty`.
    pub async fn set(&self, ty: EntityType, entities: Vec<Entity>) {
        let _shared = self.gate.read().await;
        *self.slots[Self::slot_index(ty)].lock().await = entities;
    }

    /// Number of entities stored under `ty`.
    pub async fn len_of(&self, ty: EntityType) -> usize {
        let _shared = self.gate.read().await;
        self.slots[Self::slot_index(ty)].lock().await.len()
    }

    /// Drop everything, under the global lock.
    pub async fn clear(&self) {
        let _exclusive = self.gate.write().await;
        for slot in &self.slots {
            slot.lock().await.clear();
        }
    }

    /// Take every non-empty type out of the buffer, under the global lock.
    pub async fn take_all(&self) -> BTreeMap<EntityType, Vec<Entity>> {
        let _exclusive = self.gate.write().await;
        let mut snapshot = BTreeMap::new();
        for (ty, slot) in EntityType::ALL.iter().zip(&self.slots) {
            let entities = std::mem::take(&mut *slot.lock().await);
            if !entities.is_empty() {
                snapshot.insert(*ty, entities);
            }
        }
        snapshot
    }
}
