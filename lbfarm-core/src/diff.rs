//! Diff engine: declared entities + observed remote records -> corrective
//! actions.
//!
//! Three-way set reconciliation per entity kind:
//! - declared but not remote        => CREATE
//! - remote but not declared        => REMOVE
//! - both, with version/pk mismatch => UPDATE
//!
//! Keys are `api/kind/id@parentId`; one pending action per key (last write
//! wins).

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::entity::{compound_key, Entity, EntityKind};

/// Corrective action emitted by the diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Create,
    Update,
    Remove,
    Callback,
}

/// One entry of the diff map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffAction {
    pub action: Action,
    pub id: String,
    pub parent_id: String,
    pub kind: EntityKind,
}

/// One element of a farm's JSON listing, as observed remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecord {
    pub id: String,
    pub parent_id: String,
    pub pk: String,
    pub version: String,
    pub entity_type: String,
    pub etag: String,
}

/// Observed remote state: per kind, records keyed by `id@parentId`.
pub type RemoteIndex = HashMap<EntityKind, HashMap<String, RemoteRecord>>;

fn diff_key(api: &str, kind: EntityKind, id: &str, parent_id: &str) -> String {
    format!("{}/{}/{}", api, kind.as_path(), compound_key(id, parent_id))
}

/// Compute the action set moving remote state toward declared state.
///
/// Pure and idempotent: unchanged inputs yield an identical (possibly
/// empty) map on every run.
pub fn compute(
    api: &str,
    declared: &HashMap<EntityKind, Vec<Entity>>,
    remote: &RemoteIndex,
) -> BTreeMap<String, DiffAction> {
    let mut actions = BTreeMap::new();
    let empty_declared = Vec::new();
    let empty_remote = HashMap::new();

    for kind in EntityKind::ALL {
        let entities = declared.get(&kind).unwrap_or(&empty_declared);
        let records = remote.get(&kind).unwrap_or(&empty_remote);

        // Update/remove pass: every remote record either backs a declared
        // entity (update when version/pk drifted from the control-plane id)
        // or is an orphan to remove.
        for record in records.values() {
            if record.entity_type != kind.as_path() {
                continue;
            }
            let matched = entities.iter().find(|entity| {
                entity.name() == record.id && entity.relationship.matches_parent(&record.parent_id)
            });
            match matched {
                Some(entity) => {
                    let expected = entity.id.to_string();
                    if record.version != expected || record.pk != expected {
                        debug!(kind = %kind, id = %record.id, parent = %record.parent_id, "update needed");
                        actions.insert(
                            diff_key(api, kind, &record.id, &record.parent_id),
                            DiffAction {
                                action: Action::Update,
                                id: record.id.clone(),
                                parent_id: record.parent_id.clone(),
                                kind,
                            },
                        );
                    }
                }
                None => {
                    debug!(kind = %kind, id = %record.id, parent = %record.parent_id, "remove needed");
                    actions.insert(
                        diff_key(api, kind, &record.id, &record.parent_id),
                        DiffAction {
                            action: Action::Remove,
                            id: record.id.clone(),
                            parent_id: record.parent_id.clone(),
                            kind,
                        },
                    );
                }
            }
        }

        // Create pass: every expected compound key absent remotely.
        for entity in entities {
            for parent_id in entity.expected_parents() {
                if !records.contains_key(&compound_key(entity.name(), &parent_id)) {
                    debug!(kind = %kind, id = %entity.name(), parent = %parent_id, "create needed");
                    actions.insert(
                        diff_key(api, kind, entity.name(), &parent_id),
                        DiffAction {
                            action: Action::Create,
                            id: entity.name().to_string(),
                            parent_id,
                            kind,
                        },
                    );
                }
            }
        }
    }

    actions
}
