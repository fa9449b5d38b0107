//! Farm orchestrator: the check & sync cycle.
//!
//! One cycle per farm: take the sync lock, fetch remote state, diff it
//! against declared state, publish the farm status, then dispatch the
//! corrective actions. REMOVE actions go straight to the driver; CREATE
//! and UPDATE are re-read from the repository and handed to the per-kind
//! entity queues.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use lbfarm_core::diff::{Action, DiffAction};
use lbfarm_core::{
    cache_key, CachedEntity, EngineError, Entity, EntityKind, EntityStatus, Farm, RemoteIndex,
    RepoError, StatusCache,
};
use lbfarm_driver::{Driver, DriverProps};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::latch::FixCounter;
use crate::lock::{sync_lock_key, FarmLocker};
use crate::provisioning::Provisioning;
use crate::queue::{EntityQueues, FarmQueues};
use crate::repo::Repository;

/// Resolves the driver for a farm. Injected so tests can substitute an
/// in-memory driver for the HTTP one.
pub type DriverFactory = Arc<dyn Fn(&Farm) -> Arc<dyn Driver> + Send + Sync>;

pub struct FarmEngine {
    repo: Arc<dyn Repository>,
    cache: Arc<dyn StatusCache>,
    locker: Arc<dyn FarmLocker>,
    counter: Arc<FixCounter>,
    provisioning: Arc<dyn Provisioning>,
    drivers: DriverFactory,
    farm_queues: FarmQueues,
    entity_queues: HashMap<EntityKind, EntityQueues>,
}

impl FarmEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn Repository>,
        cache: Arc<dyn StatusCache>,
        locker: Arc<dyn FarmLocker>,
        counter: Arc<FixCounter>,
        provisioning: Arc<dyn Provisioning>,
        drivers: DriverFactory,
        farm_queues: FarmQueues,
        entity_queues: HashMap<EntityKind, EntityQueues>,
    ) -> Self {
        Self {
            repo,
            cache,
            locker,
            counter,
            provisioning,
            drivers,
            farm_queues,
            entity_queues,
        }
    }

    /// One check & sync cycle. Skips silently-ish when another cycle holds
    /// the farm's lock.
    pub async fn sync(&self, farm: Farm) {
        let lock_key = sync_lock_key(farm.id);
        let farm_full = format!("{} ({}) [{}]", farm.name, farm.id, farm.api);
        if !self.locker.try_lock(&lock_key) {
            info!("FARM STATUS - {} locked by another sync, skipping", farm_full);
            return;
        }

        let start = Instant::now();
        info!("FARM STATUS - starting check & sync for {}", farm_full);
        if let Err(e) = self.sync_locked(&farm).await {
            error!(
                "FARM STATUS - ERROR: {} ({:?}): {}",
                farm_full,
                start.elapsed(),
                e
            );
            self.counter.reset(&farm.api);
            self.send_callback(&farm, EntityStatus::Error);
        } else {
            info!("FARM STATUS - finished cycle for {} ({:?})", farm_full, start.elapsed());
        }
        self.locker.unlock(&lock_key);
    }

    async fn sync_locked(&self, farm: &Farm) -> Result<(), EngineError> {
        let driver = (self.drivers)(farm);
        let declared = self.declared_entities(farm)?;
        let props = DriverProps::new(&farm.api, "").with_declared(declared);

        let remote = driver.get_all(&props).await;
        let diff = driver.diff(&props, &remote).await;
        self.counter.put(&farm.api, diff.len() as u64);
        self.update_status(&remote);

        if diff.is_empty() {
            info!("FARM STATUS - OK: {} [{}]", farm.name, farm.api);
            self.send_callback(farm, EntityStatus::Ok);
        } else {
            warn!(
                "FARM STATUS - INCONSISTENT ({} fixes): {} [{}]",
                diff.len(),
                farm.name,
                farm.api
            );
            self.send_callback(farm, EntityStatus::Pending);
            self.fix_farm(farm, driver.as_ref(), diff).await?;
        }
        Ok(())
    }

    fn declared_entities(&self, farm: &Farm) -> Result<HashMap<EntityKind, Vec<Entity>>, EngineError> {
        let mut declared = HashMap::new();
        for kind in EntityKind::ALL {
            declared.insert(kind, self.repo.by_farm(kind, farm.id)?);
        }
        Ok(declared)
    }

    /// Refresh the status cache from the remote listing: each observed
    /// record overwrites whatever the cache held, pinned errors included.
    fn update_status(&self, remote: &RemoteIndex) {
        for (kind, records) in remote {
            for record in records.values() {
                let version = record.version.parse().unwrap_or(0);
                self.cache.put_record(
                    *kind,
                    &cache_key(&record.id, &record.parent_id),
                    CachedEntity {
                        id: record.id.clone(),
                        version,
                        parent_id: record.parent_id.clone(),
                        properties: HashMap::new(),
                    },
                );
            }
        }
    }

    async fn fix_farm(
        &self,
        farm: &Farm,
        driver: &dyn Driver,
        diff: BTreeMap<String, DiffAction>,
    ) -> Result<(), EngineError> {
        warn!("FARM STATUS - synchronizing farm {}", farm.name);
        for item in diff.into_values() {
            match item.action {
                Action::Remove => {
                    let props = DriverProps::new(&farm.api, item.kind.as_path())
                        .with_json(Self::removal_body(&item));
                    if !driver.remove(&props).await {
                        warn!(
                            "remove of stale {} {} (parent: {}) failed on {}",
                            item.kind, item.id, item.parent_id, farm.api
                        );
                    }
                    self.counter.decrement(&farm.api);
                }
                _ => self.fix_entity(farm, &item).await?,
            }
        }
        Ok(())
    }

    /// Minimal body for removing a record that no longer has a declared
    /// counterpart.
    fn removal_body(item: &DiffAction) -> serde_json::Value {
        let mut body = json!({"id": item.id, "version": 0});
        if !item.parent_id.is_empty() {
            body["parentId"] = json!(item.parent_id);
        }
        body
    }

    async fn fix_entity(&self, farm: &Farm, item: &DiffAction) -> Result<(), EngineError> {
        let Some(queues) = self.entity_queues.get(&item.kind) else {
            error!("{}", EngineError::UnknownEntityType(item.kind));
            self.counter.decrement(&farm.api);
            return Ok(());
        };

        let candidates = self.repo.find_by_name(item.kind, &item.id)?;
        let entity = candidates
            .into_iter()
            .find(|e| e.farm_id == farm.id && e.relationship.matches_parent(&item.parent_id));

        let Some(entity) = entity else {
            // Deleted out from under this cycle; the diff is stale.
            error!(
                "entity {} (parent: {}) not found [{}]",
                item.id, item.parent_id, item.kind
            );
            self.counter.decrement(&farm.api);
            return Ok(());
        };

        match item.action {
            Action::Create => {
                debug!("dispatching create of {} {} to {}", item.kind, item.id, farm.api);
                queues.create.send(entity);
            }
            Action::Update => {
                debug!("dispatching update of {} {} to {}", item.kind, item.id, farm.api);
                queues.update.send(entity);
            }
            Action::Callback => {
                self.resend_ok(entity)?;
                self.counter.decrement(&farm.api);
            }
            Action::Remove => unreachable!("removes are applied directly"),
        }
        Ok(())
    }

    /// The farm already carries this entity as declared; lift a lingering
    /// PENDING/ERROR status back to OK.
    fn resend_ok(&self, mut entity: Entity) -> Result<(), EngineError> {
        if matches!(entity.status, EntityStatus::Pending | EntityStatus::Error) {
            entity.status = EntityStatus::Ok;
            persist_entity_status(self.repo.as_ref(), &entity);
        }
        Ok(())
    }

    /// Provision the farm's runtime infrastructure.
    pub async fn create(&self, farm: Farm) {
        info!("creating farm {}", farm.name);
        let status = match self.provisioning.create(&farm).await {
            Ok(()) => EntityStatus::Ok,
            Err(e) => {
                error!("farm {} creation failed: {}", farm.name, e);
                EntityStatus::Error
            }
        };
        self.send_callback(&farm, status);
    }

    /// Tear the farm's runtime infrastructure down.
    pub async fn remove(&self, farm: Farm) {
        info!("removing farm {}", farm.name);
        let status = match self.provisioning.remove(&farm).await {
            Ok(()) => EntityStatus::Ok,
            Err(e) => {
                error!("farm {} removal failed: {}", farm.name, e);
                EntityStatus::Error
            }
        };
        self.send_callback(&farm, status);
    }

    /// Wipe every collection on the farm runtime; the next sync cycle
    /// rebuilds it from declared state.
    pub async fn reload(&self, farm: Farm) {
        warn!("full reload of farm {} [{}]", farm.name, farm.api);
        let driver = (self.drivers)(&farm);
        for kind in EntityKind::ALL {
            let props = DriverProps::new(&farm.api, kind.as_path());
            if !driver.remove(&props).await {
                error!("reload: wipe of {} on {} failed", kind, farm.api);
            }
        }
    }

    /// Persist a farm status computed elsewhere (sync outcome, health
    /// check, provisioning result).
    pub async fn callback(&self, farm: Farm) {
        match self.repo.save_farm_status(&farm) {
            Ok(()) => debug!("farm {} status {} persisted", farm.name, farm.status.as_str()),
            // A newer write won; the next cycle recomputes anyway.
            Err(RepoError::Conflict(e)) => debug!("farm {} status write lost: {}", farm.name, e),
            // Farm deleted while its status was in flight.
            Err(RepoError::NotFound(_)) => {}
            Err(e) => error!("farm {} status not persisted: {}", farm.name, e),
        }
    }

    fn send_callback(&self, farm: &Farm, status: EntityStatus) {
        self.farm_queues.callback.send(farm.clone().with_status(status));
    }
}

/// Shared by the orchestrator and the entity consumers: persist an entity
/// status, treating races as non-events.
pub(crate) fn persist_entity_status(repo: &dyn Repository, entity: &Entity) {
    match repo.save_entity_status(entity) {
        Ok(()) => debug!(
            "{} {} status {} persisted",
            entity.kind,
            entity.name(),
            entity.status.as_str()
        ),
        Err(RepoError::Conflict(e)) => {
            debug!("{} {} status write lost: {}", entity.kind, entity.name(), e)
        }
        Err(RepoError::NotFound(_)) => {}
        Err(e) => error!(
            "{} {} status not persisted: {}",
            entity.kind,
            entity.name(),
            e
        ),
    }
}
