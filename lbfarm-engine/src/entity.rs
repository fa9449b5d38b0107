//! Entity consumers: apply one CREATE/UPDATE/REMOVE to the farm runtime.
//!
//! One engine per kind, fed by that kind's queues. A confirmed apply
//! writes a confirmation record (version = change hash) into the status
//! cache; a failed one pins a sticky ERROR that only a later confirmed
//! cycle clears. Either way the farm's fix counter goes down by one.

use std::sync::Arc;

use lbfarm_core::{cache_key, CachedEntity, Entity, EntityKind, EntityStatus, Farm, StatusCache};
use lbfarm_driver::DriverProps;
use tracing::{debug, error, info};

use crate::farm::{persist_entity_status, DriverFactory};
use crate::latch::FixCounter;
use crate::repo::Repository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntityOp {
    Create,
    Update,
    Remove,
}

impl EntityOp {
    fn as_str(&self) -> &'static str {
        match self {
            EntityOp::Create => "create",
            EntityOp::Update => "update",
            EntityOp::Remove => "remove",
        }
    }
}

pub struct EntityEngine {
    kind: EntityKind,
    repo: Arc<dyn Repository>,
    cache: Arc<dyn StatusCache>,
    counter: Arc<FixCounter>,
    drivers: DriverFactory,
}

impl EntityEngine {
    pub fn new(
        kind: EntityKind,
        repo: Arc<dyn Repository>,
        cache: Arc<dyn StatusCache>,
        counter: Arc<FixCounter>,
        drivers: DriverFactory,
    ) -> Self {
        Self {
            kind,
            repo,
            cache,
            counter,
            drivers,
        }
    }

    pub async fn create(&self, entity: Entity) {
        self.apply(entity, EntityOp::Create).await;
    }

    pub async fn update(&self, entity: Entity) {
        self.apply(entity, EntityOp::Update).await;
    }

    pub async fn remove(&self, entity: Entity) {
        self.apply(entity, EntityOp::Remove).await;
    }

    /// Apply the operation once per expected parent scope, then publish
    /// the combined outcome.
    async fn apply(&self, mut entity: Entity, op: EntityOp) {
        let farm = match self.owning_farm(&entity) {
            Some(farm) => farm,
            None => return,
        };
        let driver = (self.drivers)(&farm);

        let mut all_ok = true;
        for parent in entity.expected_parents() {
            let props = DriverProps::new(&farm.api, self.kind.as_path())
                .with_json(entity.wire_json_for_parent(&parent));
            let ok = match op {
                EntityOp::Create => driver.create(&props).await,
                EntityOp::Update => driver.update(&props).await,
                EntityOp::Remove => driver.remove(&props).await,
            };

            let key = cache_key(entity.name(), &parent);
            if ok {
                if op != EntityOp::Remove {
                    self.cache.put_record(
                        self.kind,
                        &key,
                        CachedEntity {
                            id: entity.name().to_string(),
                            version: i64::from(entity.hash()),
                            parent_id: parent.clone(),
                            properties: entity.properties().clone(),
                        },
                    );
                }
            } else {
                all_ok = false;
                // Sticky until a later cycle confirms the entity again.
                self.cache.put_status(self.kind, &key, EntityStatus::Error);
            }
        }

        if all_ok {
            info!("{} of {} {} applied on {}", op.as_str(), self.kind, entity.name(), farm.api);
            entity.status = EntityStatus::Ok;
        } else {
            error!("{} of {} {} failed on {}", op.as_str(), self.kind, entity.name(), farm.api);
            entity.status = EntityStatus::Error;
        }
        persist_entity_status(self.repo.as_ref(), &entity);
        self.counter.decrement(&farm.api);
    }

    fn owning_farm(&self, entity: &Entity) -> Option<Farm> {
        match self.repo.find_farm(entity.farm_id) {
            Ok(Some(farm)) => Some(farm),
            Ok(None) => {
                debug!(
                    "farm {} gone, dropping {} {}",
                    entity.farm_id,
                    self.kind,
                    entity.name()
                );
                None
            }
            Err(e) => {
                error!(
                    "farm {} lookup failed for {} {}: {}",
                    entity.farm_id,
                    self.kind,
                    entity.name(),
                    e
                );
                None
            }
        }
    }
}
