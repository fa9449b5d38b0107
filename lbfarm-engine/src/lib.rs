//! lbfarm-engine: orchestration around the diff.
//!
//! The farm engine runs check & sync cycles, the entity engines apply
//! individual corrective actions, and the scheduler drives both on
//! timers. Everything meets through in-process queues and injected seams
//! (repository, status cache, locker, driver factory, provisioning).

pub mod entity;
pub mod farm;
pub mod latch;
pub mod lock;
pub mod provisioning;
pub mod queue;
pub mod repo;
pub mod scheduler;

pub use entity::EntityEngine;
pub use farm::{DriverFactory, FarmEngine};
pub use latch::FixCounter;
pub use lock::{sync_lock_key, FarmLocker, MemoryLocker};
pub use provisioning::{NullProvisioning, Provisioning};
pub use queue::{
    all_entity_queues, farm_queues, EntityQueues, FarmQueueReceivers, FarmQueues, Queue,
    QueueReceiver,
};
pub use repo::{MemoryRepository, Repository, Seed};
pub use scheduler::{Scheduler, SchedulerConfig};

use std::sync::Arc;
use std::time::Duration;

use lbfarm_core::{Farm, StatusCache};
use tokio::task::JoinHandle;

/// Driver factory backed by the real HTTP driver.
pub fn http_driver_factory(timeout: Duration) -> DriverFactory {
    Arc::new(move |farm: &Farm| lbfarm_driver::build(&farm.provider, timeout))
}

/// Wire the full engine: construct the orchestrator and consumers, attach
/// every queue, and return the orchestrator alongside the farm-queue
/// senders and the consumer task handles.
pub fn wire(
    repo: Arc<dyn Repository>,
    cache: Arc<dyn StatusCache>,
    locker: Arc<dyn FarmLocker>,
    counter: Arc<FixCounter>,
    provisioning: Arc<dyn Provisioning>,
    drivers: DriverFactory,
) -> (Arc<FarmEngine>, FarmQueues, Vec<JoinHandle<()>>) {
    let (farm_q, farm_rx) = farm_queues();
    let (entity_q, entity_rx) = all_entity_queues();

    let engine = Arc::new(FarmEngine::new(
        repo.clone(),
        cache.clone(),
        locker,
        counter.clone(),
        provisioning,
        drivers.clone(),
        farm_q.clone(),
        entity_q,
    ));

    let mut tasks = Vec::new();
    {
        let e = engine.clone();
        tasks.push(farm_rx.sync.attach(move |farm| {
            let e = e.clone();
            async move { e.sync(farm).await }
        }));
    }
    {
        let e = engine.clone();
        tasks.push(farm_rx.create.attach(move |farm| {
            let e = e.clone();
            async move { e.create(farm).await }
        }));
    }
    {
        let e = engine.clone();
        tasks.push(farm_rx.remove.attach(move |farm| {
            let e = e.clone();
            async move { e.remove(farm).await }
        }));
    }
    {
        let e = engine.clone();
        tasks.push(farm_rx.reload.attach(move |farm| {
            let e = e.clone();
            async move { e.reload(farm).await }
        }));
    }
    {
        let e = engine.clone();
        tasks.push(farm_rx.callback.attach(move |farm| {
            let e = e.clone();
            async move { e.callback(farm).await }
        }));
    }

    for (kind, rx) in entity_rx {
        let consumer = Arc::new(EntityEngine::new(
            kind,
            repo.clone(),
            cache.clone(),
            counter.clone(),
            drivers.clone(),
        ));
        {
            let c = consumer.clone();
            tasks.push(rx.create.attach(move |entity| {
                let c = c.clone();
                async move { c.create(entity).await }
            }));
        }
        {
            let c = consumer.clone();
            tasks.push(rx.update.attach(move |entity| {
                let c = c.clone();
                async move { c.update(entity).await }
            }));
        }
        {
            let c = consumer.clone();
            tasks.push(rx.remove.attach(move |entity| {
                let c = c.clone();
                async move { c.remove(entity).await }
            }));
        }
    }

    (engine, farm_q, tasks)
}
