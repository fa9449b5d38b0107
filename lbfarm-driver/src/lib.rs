//! lbfarm-driver: protocol client for remote farm runtimes.
//!
//! A driver speaks one farm-runtime protocol version over HTTP/JSON. It
//! never lets a transport or parse failure escape: every operation
//! converts errors into `false`, `FarmStatus::Fail` or an empty index and
//! logs the full exchange, so one farm's outage stays contained to that
//! farm's reconciliation outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lbfarm_core::diff::DiffAction;
use lbfarm_core::{Entity, EntityKind, RemoteIndex};
use serde_json::Value;
use tracing::debug;

mod http;

pub use http::HttpJsonDriver;

/// Default bound on a single farm HTTP call. A hung farm must not block
/// other farms' reconciliation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a farm health verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FarmStatus {
    Ok,
    Fail,
}

/// Structured property bag handed to every driver operation. Operations
/// read the keys they need and ignore the rest.
#[derive(Debug, Clone, Default)]
pub struct DriverProps {
    /// Base URL or host:port of the farm control API.
    pub api: String,
    /// Collection path (wire name of the entity kind), empty for
    /// whole-farm operations.
    pub path: String,
    /// Entity body to submit; its `id`/`parentId` drive URL construction
    /// and parent scoping.
    pub json: Value,
    /// External name checked by `status`.
    pub name: Option<String>,
    /// Version expected remotely by `status` (the control-plane id).
    pub expected_version: Option<i64>,
    /// Collection size expected remotely by `status`.
    pub num_elements: Option<u64>,
    /// Parent scopes checked by `status`.
    pub parents: Vec<String>,
    /// Declared entities, grouped by kind, consumed by `diff`.
    pub declared: HashMap<EntityKind, Vec<Entity>>,
}

impl DriverProps {
    pub fn new(api: &str, path: &str) -> Self {
        Self {
            api: api.to_string(),
            path: path.to_string(),
            json: Value::Null,
            ..Self::default()
        }
    }

    pub fn with_json(mut self, json: Value) -> Self {
        self.json = json;
        self
    }

    pub fn with_declared(mut self, declared: HashMap<EntityKind, Vec<Entity>>) -> Self {
        self.declared = declared;
        self
    }

    pub fn with_expectation(mut self, name: &str, expected_version: i64, num_elements: u64) -> Self {
        self.name = Some(name.to_string());
        self.expected_version = Some(expected_version);
        self.num_elements = Some(num_elements);
        self
    }

    pub fn with_parents(mut self, parents: Vec<String>) -> Self {
        self.parents = parents;
        self
    }
}

/// Protocol client for one farm-runtime version.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    /// GET the entity; true iff the farm answers below 400. When the
    /// submitted JSON carries a `parentId`, existence is parent-scoped.
    async fn exist(&self, props: &DriverProps) -> bool;

    /// POST the entity body; true iff the farm answers below 400.
    async fn create(&self, props: &DriverProps) -> bool;

    /// PUT the entity body; true iff the farm answers below 400.
    async fn update(&self, props: &DriverProps) -> bool;

    /// DELETE with a JSON body. Without an id in the body the empty-id
    /// sentinel is sent, wiping the whole collection (full reload).
    async fn remove(&self, props: &DriverProps) -> bool;

    /// Verify collection count and per-parent id/version expectations.
    async fn status(&self, props: &DriverProps) -> FarmStatus;

    /// Bulk-fetch all four entity collections into a remote record index.
    async fn get_all(&self, props: &DriverProps) -> RemoteIndex;

    /// Compare declared entities against the observed index.
    async fn diff(
        &self,
        props: &DriverProps,
        remote: &RemoteIndex,
    ) -> std::collections::BTreeMap<String, DiffAction>;
}

/// Resolve the driver for a farm's provider. Unknown providers fall back
/// to the HTTP/JSON v1 driver.
pub fn build(provider: &str, timeout: Duration) -> Arc<dyn Driver> {
    if provider != HttpJsonDriver::DRIVER_NAME {
        debug!(provider, "no dedicated driver for provider, using {}", HttpJsonDriver::DRIVER_NAME);
    }
    Arc::new(HttpJsonDriver::new(timeout))
}
