//! Declared-state repository seam.
//!
//! The engine reads farms and entities from here and writes statuses back.
//! Reads are fallible: the backing store is an external management API in
//! production. Status writes distinguish `NotFound` (the row vanished
//! while reconciling, a benign race) from `Conflict` (a stale write lost
//! to a newer one).

use std::collections::HashMap;
use std::sync::RwLock;

use lbfarm_core::{Entity, EntityKind, Farm, RepoError};
use serde::Deserialize;

pub trait Repository: Send + Sync {
    fn farms(&self) -> Result<Vec<Farm>, RepoError>;

    fn find_farm(&self, id: i64) -> Result<Option<Farm>, RepoError>;

    /// All declared entities of a kind belonging to a farm.
    fn by_farm(&self, kind: EntityKind, farm_id: i64) -> Result<Vec<Entity>, RepoError>;

    /// Entities of a kind by external name. More than one hit is possible
    /// for multi-parent kinds; callers disambiguate by parent.
    fn find_by_name(&self, kind: EntityKind, name: &str) -> Result<Vec<Entity>, RepoError>;

    fn save_farm_status(&self, farm: &Farm) -> Result<(), RepoError>;

    fn save_entity_status(&self, entity: &Entity) -> Result<(), RepoError>;
}

/// Declared state loaded at startup.
#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub farms: Vec<Farm>,
    #[serde(default)]
    pub entities: Vec<Entity>,
}

#[derive(Default)]
struct Inner {
    farms: HashMap<i64, Farm>,
    entities: HashMap<i64, Entity>,
}

/// In-process repository over a seed file.
#[derive(Default)]
pub struct MemoryRepository {
    inner: RwLock<Inner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: Seed) -> Self {
        let repo = Self::new();
        for farm in seed.farms {
            repo.insert_farm(farm);
        }
        for entity in seed.entities {
            repo.insert_entity(entity);
        }
        repo
    }

    pub fn insert_farm(&self, farm: Farm) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.farms.insert(farm.id, farm);
    }

    pub fn insert_entity(&self, entity: Entity) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.entities.insert(entity.id, entity);
    }

    pub fn remove_entity(&self, id: i64) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.entities.remove(&id);
    }
}

impl Repository for MemoryRepository {
    fn farms(&self) -> Result<Vec<Farm>, RepoError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner.farms.values().cloned().collect())
    }

    fn find_farm(&self, id: i64) -> Result<Option<Farm>, RepoError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner.farms.get(&id).cloned())
    }

    fn by_farm(&self, kind: EntityKind, farm_id: i64) -> Result<Vec<Entity>, RepoError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .entities
            .values()
            .filter(|e| e.kind == kind && e.farm_id == farm_id)
            .cloned()
            .collect())
    }

    fn find_by_name(&self, kind: EntityKind, name: &str) -> Result<Vec<Entity>, RepoError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .entities
            .values()
            .filter(|e| e.kind == kind && e.name() == name)
            .cloned()
            .collect())
    }

    fn save_farm_status(&self, farm: &Farm) -> Result<(), RepoError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match inner.farms.get_mut(&farm.id) {
            Some(stored) => {
                stored.status = farm.status;
                Ok(())
            }
            None => Err(RepoError::NotFound(format!("farm {}", farm.id))),
        }
    }

    fn save_entity_status(&self, entity: &Entity) -> Result<(), RepoError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match inner.entities.get_mut(&entity.id) {
            Some(stored) => {
                stored.status = entity.status;
                Ok(())
            }
            None => Err(RepoError::NotFound(format!(
                "{} {}",
                entity.kind,
                entity.name()
            ))),
        }
    }
}
