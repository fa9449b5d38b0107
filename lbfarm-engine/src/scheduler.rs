//! Periodic jobs: sync enqueue, farm health check, diff report.
//!
//! Three independent tickers over the same farm set. All three honor the
//! global disable flag, re-read on every tick so an operator can pause
//! reconciliation without restarting the daemon. Disabled farms are
//! always skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lbfarm_core::{EntityKind, EntityStatus, Farm};
use lbfarm_driver::{DriverProps, FarmStatus};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::farm::DriverFactory;
use crate::queue::FarmQueues;
use crate::repo::Repository;

#[derive(Clone)]
pub struct SchedulerConfig {
    pub sync_interval: Duration,
    pub check_interval: Duration,
    pub diff_interval: Duration,
    /// Pauses all jobs while set.
    pub disabled: Arc<AtomicBool>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(10),
            check_interval: Duration::from_secs(60),
            diff_interval: Duration::from_secs(60),
            disabled: Arc::new(AtomicBool::new(false)),
        }
    }
}

pub struct Scheduler {
    repo: Arc<dyn Repository>,
    farm_queues: FarmQueues,
    drivers: DriverFactory,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        repo: Arc<dyn Repository>,
        farm_queues: FarmQueues,
        drivers: DriverFactory,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repo,
            farm_queues,
            drivers,
            config,
        }
    }

    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            self.clone().spawn_job("sync", self.config.sync_interval, |s| async move {
                s.sync_tick()
            }),
            self.clone().spawn_job("check", self.config.check_interval, |s| async move {
                s.check_tick().await
            }),
            self.clone().spawn_job("diff", self.config.diff_interval, |s| async move {
                s.diff_tick().await
            }),
        ]
    }

    fn spawn_job<F, Fut>(self: Arc<Self>, name: &'static str, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if self.config.disabled.load(Ordering::Relaxed) {
                    warn!("scheduler disabled, skipping {} job", name);
                    continue;
                }
                tick(self.clone()).await;
            }
        })
    }

    fn active_farms(&self) -> Vec<Farm> {
        match self.repo.farms() {
            Ok(farms) => farms
                .into_iter()
                .filter(|f| f.status != EntityStatus::Disabled)
                .collect(),
            Err(e) => {
                error!("scheduler: farm listing failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Enqueue every active farm for a check & sync cycle. The per-farm
    /// lock absorbs overlap with a still-running cycle.
    fn sync_tick(&self) {
        for farm in self.active_farms() {
            self.farm_queues.sync.send(farm);
        }
    }

    /// Verify each farm against declared state with targeted status
    /// probes, publish OK/ERROR, and escalate persistent failure to a full
    /// reload when the farm allows it.
    async fn check_tick(&self) {
        for farm in self.active_farms() {
            let is_ok = match self.check_farm(&farm).await {
                Ok(ok) => ok,
                Err(e) => {
                    error!("health check of farm {} aborted: {}", farm.name, e);
                    continue;
                }
            };

            let checked = farm
                .clone()
                .with_status(if is_ok { EntityStatus::Ok } else { EntityStatus::Error });
            self.farm_queues.callback.send(checked.clone());

            if is_ok {
                info!("FARM STATUS OK: {} [{}]", farm.name, farm.api);
            } else if farm.auto_reload {
                warn!("FARM STATUS FAIL: {} [{}], scheduling full reload", farm.name, farm.api);
                self.farm_queues.reload.send(checked);
            } else {
                warn!(
                    "FARM STATUS FAIL (auto reload disabled): {} [{}]",
                    farm.name, farm.api
                );
            }
        }
    }

    async fn check_farm(&self, farm: &Farm) -> Result<bool, lbfarm_core::RepoError> {
        // A farm already in ERROR stays failed until a sync cycle clears it.
        if farm.status == EntityStatus::Error {
            return Ok(false);
        }
        let driver = (self.drivers)(farm);

        let virtual_hosts = self.repo.by_farm(EntityKind::VirtualHost, farm.id)?;
        let count = virtual_hosts.len() as u64;
        for vh in &virtual_hosts {
            let props = DriverProps::new(&farm.api, EntityKind::VirtualHost.as_path())
                .with_expectation(vh.name(), vh.id, count);
            if driver.status(&props).await != FarmStatus::Ok {
                return Ok(false);
            }
        }

        // Only rules attached somewhere are expected on the farm.
        let rules: Vec<_> = self
            .repo
            .by_farm(EntityKind::Rule, farm.id)?
            .into_iter()
            .filter(|r| !r.expected_parents().iter().all(String::is_empty))
            .collect();
        let count = rules.len() as u64;
        for rule in &rules {
            let props = DriverProps::new(&farm.api, EntityKind::Rule.as_path())
                .with_expectation(rule.name(), rule.id, count)
                .with_parents(rule.expected_parents());
            if driver.status(&props).await != FarmStatus::Ok {
                return Ok(false);
            }
        }

        for kind in [EntityKind::BackendPool, EntityKind::Backend] {
            let entities = self.repo.by_farm(kind, farm.id)?;
            let count = entities.len() as u64;
            for entity in &entities {
                let props = DriverProps::new(&farm.api, kind.as_path())
                    .with_expectation(entity.name(), entity.id, count);
                if driver.status(&props).await != FarmStatus::Ok {
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    /// Log-only drift report: the full diff of every active farm, without
    /// dispatching fixes.
    async fn diff_tick(&self) {
        for farm in self.active_farms() {
            let driver = (self.drivers)(&farm);
            let mut declared = std::collections::HashMap::new();
            let mut failed = false;
            for kind in EntityKind::ALL {
                match self.repo.by_farm(kind, farm.id) {
                    Ok(entities) => {
                        declared.insert(kind, entities);
                    }
                    Err(e) => {
                        error!("diff report of farm {} aborted: {}", farm.name, e);
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                continue;
            }

            let props = DriverProps::new(&farm.api, "").with_declared(declared);
            let remote = driver.get_all(&props).await;
            let diff = driver.diff(&props, &remote).await;
            match serde_json::to_string(&diff) {
                Ok(report) => {
                    warn!("---------------------------------");
                    warn!("farm {} [{}]: {}", farm.name, farm.api, report);
                    warn!("---------------------------------");
                }
                Err(e) => error!("diff report of farm {} not serializable: {}", farm.name, e),
            }
        }
    }
}
