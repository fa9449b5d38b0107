//! Declared-state entities: virtual hosts, backend pools, backends, rules
//! and the farms that own them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Lifecycle status of a declared entity or farm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntityStatus {
    Pending,
    Ok,
    Error,
    Unknown,
    Disabled,
    Enable,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Pending => "PENDING",
            EntityStatus::Ok => "OK",
            EntityStatus::Error => "ERROR",
            EntityStatus::Unknown => "UNKNOWN",
            EntityStatus::Disabled => "DISABLED",
            EntityStatus::Enable => "ENABLE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(EntityStatus::Pending),
            "OK" => Some(EntityStatus::Ok),
            "ERROR" => Some(EntityStatus::Error),
            "UNKNOWN" => Some(EntityStatus::Unknown),
            "DISABLED" => Some(EntityStatus::Disabled),
            "ENABLE" => Some(EntityStatus::Enable),
            _ => None,
        }
    }
}

/// The four entity collections a farm runtime exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    VirtualHost,
    BackendPool,
    Backend,
    Rule,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::VirtualHost,
        EntityKind::BackendPool,
        EntityKind::Backend,
        EntityKind::Rule,
    ];

    /// Wire path of the collection on the farm API.
    pub fn as_path(&self) -> &'static str {
        match self {
            EntityKind::VirtualHost => "virtualhost",
            EntityKind::BackendPool => "backendpool",
            EntityKind::Backend => "backend",
            EntityKind::Rule => "rule",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            "virtualhost" => Some(EntityKind::VirtualHost),
            "backendpool" => Some(EntityKind::BackendPool),
            "backend" => Some(EntityKind::Backend),
            "rule" => Some(EntityKind::Rule),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_path())
    }
}

/// Relationship shape of an entity towards its parent(s).
///
/// A backend hangs under exactly one pool, a rule attaches to one or more
/// virtual hosts, and virtual hosts stand alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Relationship {
    Flat,
    SingleParent {
        parent: Option<String>,
        /// Whether any declared entity references this one as its parent.
        has_children: bool,
    },
    MultiParent { parents: Vec<String> },
}

impl Relationship {
    /// Parent-scoped match used by both the diff and the orchestrator
    /// lookup.
    ///
    /// Known quirk, kept on purpose: a `SingleParent` entity with
    /// dependents matches *any* remote parent id, which suppresses
    /// REMOVE/UPDATE detection for pool-like parents. Changing this would
    /// trigger mass removes of pool members on farms provisioned under the
    /// old rule; see DESIGN.md.
    pub fn matches_parent(&self, parent_id: &str) -> bool {
        match self {
            Relationship::Flat => true,
            Relationship::SingleParent { parent, has_children } => {
                // No declared parent means the empty scope, mirroring
                // expected_parents.
                parent.as_deref().unwrap_or("") == parent_id || *has_children
            }
            Relationship::MultiParent { parents } => {
                !parents.is_empty() && parents.iter().any(|p| p == parent_id)
            }
        }
    }

    /// Parent ids under which this entity is expected to appear remotely.
    /// Flat entities occupy the empty parent scope.
    pub fn expected_parents(&self) -> Vec<String> {
        match self {
            Relationship::Flat => vec![String::new()],
            Relationship::SingleParent { parent, .. } => {
                vec![parent.clone().unwrap_or_default()]
            }
            Relationship::MultiParent { parents } => parents.clone(),
        }
    }
}

/// A declared load-balancer entity.
///
/// `id` is the control-plane identity (immutable once persisted), `name`
/// the external identity unique within its kind, and `hash` a change
/// counter bumped on every mutation of id, name or properties. Equality
/// and hashing go by `name`, matching the remote farm's keying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    name: String,
    pub kind: EntityKind,
    pub status: EntityStatus,
    #[serde(default)]
    properties: HashMap<String, String>,
    #[serde(default)]
    hash: u32,
    pub farm_id: i64,
    pub relationship: Relationship,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_modified_at: DateTime<Utc>,
}

impl Entity {
    fn new(id: i64, name: &str, kind: EntityKind, farm_id: i64, relationship: Relationship) -> Self {
        debug_assert!(!name.is_empty(), "entity name must be non-empty");
        let now = Utc::now();
        Self {
            id,
            name: name.to_string(),
            kind,
            status: EntityStatus::Pending,
            properties: HashMap::new(),
            hash: 0,
            farm_id,
            relationship,
            description: None,
            created_at: now,
            last_modified_at: now,
        }
    }

    pub fn virtual_host(id: i64, name: &str, farm_id: i64) -> Self {
        Self::new(id, name, EntityKind::VirtualHost, farm_id, Relationship::Flat)
    }

    pub fn backend_pool(id: i64, name: &str, farm_id: i64) -> Self {
        Self::new(
            id,
            name,
            EntityKind::BackendPool,
            farm_id,
            Relationship::SingleParent { parent: None, has_children: false },
        )
    }

    pub fn backend(id: i64, name: &str, farm_id: i64, pool: &str) -> Self {
        Self::new(
            id,
            name,
            EntityKind::Backend,
            farm_id,
            Relationship::SingleParent { parent: Some(pool.to_string()), has_children: false },
        )
    }

    pub fn rule(id: i64, name: &str, farm_id: i64, parents: Vec<String>) -> Self {
        Self::new(id, name, EntityKind::Rule, farm_id, Relationship::MultiParent { parents })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn set_id(&mut self, id: i64) {
        self.bump_hash();
        self.id = id;
    }

    pub fn set_name(&mut self, name: &str) {
        debug_assert!(!name.is_empty(), "entity name must be non-empty");
        self.bump_hash();
        self.name = name.to_string();
        self.touch();
    }

    pub fn set_properties(&mut self, properties: HashMap<String, String>) {
        self.bump_hash();
        self.properties = properties;
        self.touch();
    }

    /// Change counter, wraps back to 0 at the top of the range.
    fn bump_hash(&mut self) {
        self.hash = if self.hash < u32::MAX { self.hash + 1 } else { 0 };
    }

    fn touch(&mut self) {
        self.last_modified_at = Utc::now();
    }

    /// Parent scopes this entity is expected to occupy on the farm.
    pub fn expected_parents(&self) -> Vec<String> {
        self.relationship.expected_parents()
    }

    /// Entity body as submitted to the farm runtime. The farm keys by the
    /// declared name and carries the control-plane id in `version`/`pk`.
    pub fn wire_json(&self) -> serde_json::Value {
        let mut body = json!({
            "id": self.name,
            "version": self.id,
            "pk": self.id,
            "properties": self.properties,
        });
        if let Relationship::SingleParent { parent: Some(parent), .. } = &self.relationship {
            body["parentId"] = json!(parent);
        }
        body
    }

    /// Like [`wire_json`](Self::wire_json) but pinned to one parent scope,
    /// for multi-parent entities submitted once per parent.
    pub fn wire_json_for_parent(&self, parent_id: &str) -> serde_json::Value {
        let mut body = self.wire_json();
        if !parent_id.is_empty() {
            body["parentId"] = json!(parent_id);
        }
        body
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.name == other.name
    }
}

impl Eq for Entity {}

impl std::hash::Hash for Entity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// Compound identity used for remote records and diff keys: `id@parentId`.
pub fn compound_key(id: &str, parent_id: &str) -> String {
    format!("{}@{}", id, parent_id)
}

/// A remote load-balancer runtime cluster with an HTTP control API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Farm {
    pub id: i64,
    pub name: String,
    pub domain: String,
    /// Base URL or host:port of the runtime control API.
    pub api: String,
    /// Logical grouping (e.g. staging, production).
    pub environment: String,
    /// Driver selector.
    pub provider: String,
    pub auto_reload: bool,
    pub status: EntityStatus,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Farm {
    pub fn new(id: i64, name: &str, domain: &str, api: &str, environment: &str, provider: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            domain: domain.to_string(),
            api: api.to_string(),
            environment: environment.to_string(),
            provider: provider.to_string(),
            auto_reload: true,
            status: EntityStatus::Pending,
            properties: HashMap::new(),
        }
    }

    pub fn with_auto_reload(mut self, auto_reload: bool) -> Self {
        self.auto_reload = auto_reload;
        self
    }

    pub fn with_status(mut self, status: EntityStatus) -> Self {
        self.status = status;
        self
    }
}
