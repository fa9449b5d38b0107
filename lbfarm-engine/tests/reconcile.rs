//! End-to-end reconciliation over an in-memory driver: sync cycles must
//! converge a farm onto declared state, pin sticky errors on failed
//! writes, and respect the per-farm sync lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lbfarm_core::diff::{self, Action, DiffAction, RemoteRecord};
use lbfarm_core::{
    cache_key, compound_key, CacheEntry, Entity, EntityKind, EntityStatus, Farm,
    MemoryStatusCache, RemoteIndex, StatusCache,
};
use lbfarm_driver::{Driver, DriverProps, FarmStatus};
use lbfarm_engine::{
    sync_lock_key, wire, DriverFactory, FarmEngine, FarmLocker, FarmQueues, FixCounter,
    MemoryLocker, MemoryRepository, NullProvisioning, Repository,
};
use serde_json::Value;

/// Shared in-memory farm runtime.
#[derive(Default)]
struct FakeFarm {
    records: Mutex<RemoteIndex>,
    fail_writes: AtomicBool,
    /// When set, the diff reports one extra CREATE for an entity that was
    /// never declared, simulating a deletion racing the sync cycle.
    phantom_action: AtomicBool,
    /// When set, `get_all` stalls, holding the calling sync cycle (and
    /// its lock) open.
    block_reads: AtomicBool,
    get_all_calls: AtomicUsize,
}

impl FakeFarm {
    fn record_count(&self) -> usize {
        let records = self.records.lock().unwrap();
        records.values().map(|kinds| kinds.len()).sum()
    }

    fn has(&self, kind: EntityKind, id: &str, parent: &str) -> bool {
        let records = self.records.lock().unwrap();
        records
            .get(&kind)
            .map(|r| r.contains_key(&compound_key(id, parent)))
            .unwrap_or(false)
    }

    fn seed(&self, kind: EntityKind, id: &str, parent: &str, version: &str) {
        let mut records = self.records.lock().unwrap();
        records.entry(kind).or_default().insert(
            compound_key(id, parent),
            RemoteRecord {
                id: id.to_string(),
                parent_id: parent.to_string(),
                pk: version.to_string(),
                version: version.to_string(),
                entity_type: kind.as_path().to_string(),
                etag: "etag".to_string(),
            },
        );
    }
}

struct FakeDriver {
    farm: Arc<FakeFarm>,
}

impl FakeDriver {
    fn upsert(&self, props: &DriverProps) -> bool {
        if self.farm.fail_writes.load(Ordering::SeqCst) {
            return false;
        }
        let Some(kind) = EntityKind::from_path(&props.path) else {
            return false;
        };
        let id = props.json["id"].as_str().unwrap_or_default().to_string();
        let parent = props.json["parentId"].as_str().unwrap_or_default().to_string();
        let version = match &props.json["version"] {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            _ => String::new(),
        };
        let mut records = self.farm.records.lock().unwrap();
        records.entry(kind).or_default().insert(
            compound_key(&id, &parent),
            RemoteRecord {
                id,
                parent_id: parent,
                pk: version.clone(),
                version,
                entity_type: kind.as_path().to_string(),
                etag: "etag".to_string(),
            },
        );
        true
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn exist(&self, props: &DriverProps) -> bool {
        let Some(kind) = EntityKind::from_path(&props.path) else {
            return false;
        };
        let id = props.json["id"].as_str().unwrap_or_default();
        let records = self.farm.records.lock().unwrap();
        records
            .get(&kind)
            .map(|r| r.values().any(|rec| rec.id == id))
            .unwrap_or(false)
    }

    async fn create(&self, props: &DriverProps) -> bool {
        self.upsert(props)
    }

    async fn update(&self, props: &DriverProps) -> bool {
        self.upsert(props)
    }

    async fn remove(&self, props: &DriverProps) -> bool {
        if self.farm.fail_writes.load(Ordering::SeqCst) {
            return false;
        }
        let Some(kind) = EntityKind::from_path(&props.path) else {
            return false;
        };
        let id = props.json["id"].as_str().unwrap_or_default();
        let mut records = self.farm.records.lock().unwrap();
        if id.is_empty() {
            records.remove(&kind);
        } else {
            let parent = props.json["parentId"].as_str().unwrap_or_default();
            if let Some(kinds) = records.get_mut(&kind) {
                kinds.remove(&compound_key(id, parent));
            }
        }
        true
    }

    async fn status(&self, props: &DriverProps) -> FarmStatus {
        let Some(kind) = EntityKind::from_path(&props.path) else {
            return FarmStatus::Fail;
        };
        let records = self.farm.records.lock().unwrap();
        let empty = std::collections::HashMap::new();
        let kinds = records.get(&kind).unwrap_or(&empty);
        if Some(kinds.len() as u64) != props.num_elements {
            return FarmStatus::Fail;
        }
        let name = props.name.as_deref().unwrap_or_default();
        let expected = props.expected_version.unwrap_or(-1).to_string();
        let synced = kinds
            .values()
            .any(|r| r.id == name && r.version == expected);
        if synced {
            FarmStatus::Ok
        } else {
            FarmStatus::Fail
        }
    }

    async fn get_all(&self, _props: &DriverProps) -> RemoteIndex {
        self.farm.get_all_calls.fetch_add(1, Ordering::SeqCst);
        while self.farm.block_reads.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.farm.records.lock().unwrap().clone()
    }

    async fn diff(&self, props: &DriverProps, remote: &RemoteIndex) -> BTreeMap<String, DiffAction> {
        let mut actions = diff::compute(&props.api, &props.declared, remote);
        if self.farm.phantom_action.load(Ordering::SeqCst) {
            actions.insert(
                format!("{}/backend/phantom@p1", props.api),
                DiffAction {
                    action: Action::Create,
                    id: "phantom".to_string(),
                    parent_id: "p1".to_string(),
                    kind: EntityKind::Backend,
                },
            );
        }
        actions
    }
}

struct Fixture {
    farm: Farm,
    fake: Arc<FakeFarm>,
    repo: Arc<MemoryRepository>,
    cache: Arc<MemoryStatusCache>,
    counter: Arc<FixCounter>,
    locker: Arc<MemoryLocker>,
    engine: Arc<FarmEngine>,
    #[allow(dead_code)]
    queues: FarmQueues,
}

fn fixture() -> Fixture {
    let farm = Farm::new(10, "farm-a", "example.com", "farm-a:9090", "stg", "fake");
    let repo = Arc::new(MemoryRepository::new());
    repo.insert_farm(farm.clone());
    repo.insert_entity(Entity::virtual_host(1, "v1", 10));
    repo.insert_entity(Entity::backend_pool(2, "p1", 10));
    repo.insert_entity(Entity::backend(3, "b1", 10, "p1"));
    repo.insert_entity(Entity::rule(4, "r1", 10, vec!["v1".to_string()]));

    let fake = Arc::new(FakeFarm::default());
    let driver_farm = fake.clone();
    let drivers: DriverFactory = Arc::new(move |_farm: &Farm| {
        Arc::new(FakeDriver { farm: driver_farm.clone() }) as Arc<dyn Driver>
    });

    let cache = Arc::new(MemoryStatusCache::new());
    let counter = Arc::new(FixCounter::new());
    let locker = Arc::new(MemoryLocker::new());

    let (engine, queues, _tasks) = wire(
        repo.clone(),
        cache.clone(),
        locker.clone(),
        counter.clone(),
        Arc::new(NullProvisioning),
        drivers,
    );

    Fixture { farm, fake, repo, cache, counter, locker, engine, queues }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held: {}", what);
}

#[tokio::test]
async fn sync_converges_an_empty_farm() {
    let fx = fixture();

    // First cycle: four creates dispatched through the entity queues.
    fx.engine.sync(fx.farm.clone()).await;
    eventually("all four records created", || fx.fake.record_count() == 4).await;
    assert!(fx.fake.has(EntityKind::VirtualHost, "v1", ""));
    assert!(fx.fake.has(EntityKind::BackendPool, "p1", ""));
    assert!(fx.fake.has(EntityKind::Backend, "b1", "p1"));
    assert!(fx.fake.has(EntityKind::Rule, "r1", "v1"));
    eventually("fix counter drained", || fx.counter.get(&fx.farm.api) == Some(0)).await;

    // Second cycle: nothing left to fix, the farm goes OK.
    fx.engine.sync(fx.farm.clone()).await;
    eventually("farm status OK", || {
        fx.repo
            .find_farm(10)
            .unwrap()
            .map(|f| f.status == EntityStatus::Ok)
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn stale_remote_record_is_removed_directly() {
    let fx = fixture();
    fx.fake.seed(EntityKind::Backend, "ghost", "p1", "99");
    fx.fake.seed(EntityKind::VirtualHost, "v1", "", "1");

    fx.engine.sync(fx.farm.clone()).await;

    // The orphan goes away without any queue round-trip.
    assert!(!fx.fake.has(EntityKind::Backend, "ghost", "p1"));
    eventually("declared records created", || fx.fake.record_count() == 4).await;
}

#[tokio::test]
async fn exactly_one_of_two_concurrent_syncs_proceeds() {
    let fx = fixture();
    fx.fake.block_reads.store(true, Ordering::SeqCst);

    let engine = fx.engine.clone();
    let farm = fx.farm.clone();
    let first = tokio::spawn(async move { engine.sync(farm).await });
    eventually("first cycle reached the farm", || {
        fx.fake.get_all_calls.load(Ordering::SeqCst) == 1
    })
    .await;

    // Second cycle returns immediately: the lock is held, the farm is
    // never queried again.
    fx.engine.sync(fx.farm.clone()).await;
    assert_eq!(fx.fake.get_all_calls.load(Ordering::SeqCst), 1);

    fx.fake.block_reads.store(false, Ordering::SeqCst);
    first.await.unwrap();
    eventually("first cycle converged after release", || fx.fake.record_count() == 4).await;
}

#[tokio::test]
async fn held_lock_skips_the_cycle() {
    let fx = fixture();
    assert!(fx.locker.try_lock(&sync_lock_key(fx.farm.id)));

    fx.engine.sync(fx.farm.clone()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fx.fake.record_count(), 0);

    fx.locker.unlock(&sync_lock_key(fx.farm.id));
    fx.engine.sync(fx.farm.clone()).await;
    eventually("records created after unlock", || fx.fake.record_count() == 4).await;
}

#[tokio::test]
async fn failed_write_pins_sticky_error_until_confirmed() {
    let fx = fixture();
    fx.fake.fail_writes.store(true, Ordering::SeqCst);

    fx.engine.sync(fx.farm.clone()).await;
    let key = cache_key("v1", "");
    eventually("sticky error pinned", || {
        matches!(
            fx.cache.get(EntityKind::VirtualHost, &key),
            Some(CacheEntry::Status(EntityStatus::Error))
        )
    })
    .await;
    eventually("entity status ERROR persisted", || {
        fx.repo
            .find_by_name(EntityKind::VirtualHost, "v1")
            .unwrap()
            .first()
            .map(|e| e.status == EntityStatus::Error)
            .unwrap_or(false)
    })
    .await;

    // Once writes go through again, the next cycle confirms the entity
    // and replaces the pinned error with a record.
    fx.fake.fail_writes.store(false, Ordering::SeqCst);
    fx.engine.sync(fx.farm.clone()).await;
    eventually("confirmation record replaces the error", || {
        matches!(
            fx.cache.get(EntityKind::VirtualHost, &key),
            Some(CacheEntry::Record(_))
        )
    })
    .await;
}

#[tokio::test]
async fn reload_wipes_every_collection() {
    let fx = fixture();
    fx.fake.seed(EntityKind::VirtualHost, "v1", "", "1");
    fx.fake.seed(EntityKind::Backend, "b1", "p1", "3");
    fx.fake.seed(EntityKind::Rule, "r1", "v1", "4");

    fx.engine.reload(fx.farm.clone()).await;
    assert_eq!(fx.fake.record_count(), 0);
}

#[tokio::test]
async fn version_drift_is_fixed_by_update() {
    let fx = fixture();
    fx.fake.seed(EntityKind::VirtualHost, "v1", "", "999");
    fx.fake.seed(EntityKind::BackendPool, "p1", "", "2");
    fx.fake.seed(EntityKind::Backend, "b1", "p1", "3");
    fx.fake.seed(EntityKind::Rule, "r1", "v1", "4");

    fx.engine.sync(fx.farm.clone()).await;
    eventually("drifted record updated", || {
        let records = fx.fake.records.lock().unwrap();
        records
            .get(&EntityKind::VirtualHost)
            .and_then(|r| r.get(&compound_key("v1", "")))
            .map(|r| r.version == "1")
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn entity_deleted_mid_cycle_is_a_benign_race() {
    let fx = fixture();
    fx.fake.phantom_action.store(true, Ordering::SeqCst);

    // The stale action is dropped with a counter decrement while the real
    // work still converges.
    fx.engine.sync(fx.farm.clone()).await;
    eventually("declared records created", || fx.fake.record_count() == 4).await;
    eventually("fix counter drained", || fx.counter.get(&fx.farm.api) == Some(0)).await;
    assert!(!fx.fake.has(EntityKind::Backend, "phantom", "p1"));
}

#[tokio::test]
async fn callback_races_are_swallowed() {
    let fx = fixture();

    // Farm deleted while its status was in flight: a no-op, not a crash.
    let gone = Farm::new(99, "gone", "example.com", "x:1", "stg", "fake");
    fx.engine.callback(gone).await;

    // Live farm: the status lands.
    fx.engine
        .callback(fx.farm.clone().with_status(EntityStatus::Pending))
        .await;
    assert_eq!(
        fx.repo.find_farm(10).unwrap().unwrap().status,
        EntityStatus::Pending
    );
}
