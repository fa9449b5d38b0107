//! Distributed status cache: last-confirmed remote state per entity.
//!
//! One logical partition per entity kind, keyed `name#parentId`, valued by
//! either a serialized confirmation record or an explicitly pinned status
//! (sticky ERROR after a failed fix). Entities never read the cache
//! directly; they derive a status from it together with the owning farm's
//! auto-reload flag and the external router-sync signal.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::entity::{EntityKind, EntityStatus};

/// Separator between name and parent id in cache keys.
pub const KEY_SEPARATOR: char = '#';

/// Build the cache key for an entity within its kind partition.
pub fn cache_key(name: &str, parent_id: &str) -> String {
    format!("{}{}{}", name, KEY_SEPARATOR, parent_id)
}

/// Confirmation record stored after a successful remote apply or a remote
/// listing during sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEntity {
    pub id: String,
    /// Remote-reported version (a control-plane id) after a sync listing,
    /// or the entity change hash after a confirmed apply.
    pub version: i64,
    #[serde(default)]
    pub parent_id: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// What the cache holds for an entity: a pinned status or a confirmation
/// record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEntry {
    Status(EntityStatus),
    Record(CachedEntity),
}

/// Cache client seam. Implementations must be safe for concurrent reads
/// and writes from multiple orchestrator and consumer tasks; the engine
/// injects one shared instance at startup.
pub trait StatusCache: Send + Sync {
    fn get(&self, kind: EntityKind, key: &str) -> Option<CacheEntry>;
    fn put_record(&self, kind: EntityKind, key: &str, record: CachedEntity);
    fn put_status(&self, kind: EntityKind, key: &str, status: EntityStatus);
}

/// In-process implementation over serialized string values, the same
/// representation a remote key-value store would hold.
#[derive(Default)]
pub struct MemoryStatusCache {
    partitions: RwLock<HashMap<(EntityKind, String), String>>,
}

impl MemoryStatusCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusCache for MemoryStatusCache {
    fn get(&self, kind: EntityKind, key: &str) -> Option<CacheEntry> {
        let partitions = self.partitions.read().unwrap_or_else(|e| e.into_inner());
        let value = partitions.get(&(kind, key.to_string()))?;
        if let Some(status) = EntityStatus::parse(value) {
            return Some(CacheEntry::Status(status));
        }
        match serde_json::from_str::<CachedEntity>(value) {
            Ok(record) => Some(CacheEntry::Record(record)),
            Err(e) => {
                warn!(kind = %kind, key, "unreadable cache value dropped: {}", e);
                None
            }
        }
    }

    fn put_record(&self, kind: EntityKind, key: &str, record: CachedEntity) {
        let value = match serde_json::to_string(&record) {
            Ok(v) => v,
            Err(e) => {
                warn!(kind = %kind, key, "cache record not serializable: {}", e);
                return;
            }
        };
        let mut partitions = self.partitions.write().unwrap_or_else(|e| e.into_inner());
        partitions.insert((kind, key.to_string()), value);
    }

    fn put_status(&self, kind: EntityKind, key: &str, status: EntityStatus) {
        let mut partitions = self.partitions.write().unwrap_or_else(|e| e.into_inner());
        partitions.insert((kind, key.to_string()), status.as_str().to_string());
    }
}

/// External router synchronization signal for a farm's environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterSync {
    Sync,
    NoSync,
}

/// Derived entity status from the three independent signals.
///
/// - A pinned ERROR entry wins regardless of the other signals; only a
///   fresh confirmed cycle overwrites it.
/// - With auto-reload disabled the router-sync signal alone decides.
/// - With auto-reload enabled the cache decides: no entry means the change
///   was never confirmed (PENDING); a record is OK only when its version
///   matches the entity's change hash.
pub fn derive_status(
    auto_reload: bool,
    entry: Option<&CacheEntry>,
    router_sync: RouterSync,
    entity_hash: u32,
) -> EntityStatus {
    if let Some(CacheEntry::Status(EntityStatus::Error)) = entry {
        return EntityStatus::Error;
    }
    if !auto_reload {
        return match router_sync {
            RouterSync::Sync => EntityStatus::Ok,
            RouterSync::NoSync => EntityStatus::Pending,
        };
    }
    match entry {
        None => EntityStatus::Pending,
        Some(CacheEntry::Status(EntityStatus::Ok)) => EntityStatus::Ok,
        Some(CacheEntry::Status(_)) => EntityStatus::Pending,
        Some(CacheEntry::Record(record)) => {
            if record.version == i64::from(entity_hash) {
                EntityStatus::Ok
            } else {
                EntityStatus::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RouterSync::{NoSync, Sync};

    fn record(version: i64) -> CacheEntry {
        CacheEntry::Record(CachedEntity {
            id: "e1".to_string(),
            version,
            parent_id: String::new(),
            properties: HashMap::new(),
        })
    }

    const HASH: u32 = 7;

    fn ok_entry() -> CacheEntry {
        record(i64::from(HASH))
    }

    fn error_entry() -> CacheEntry {
        CacheEntry::Status(EntityStatus::Error)
    }

    #[test]
    fn truth_table() {
        use EntityStatus::{Error, Ok, Pending};

        // (auto_reload, cache entry, router sync) -> expected
        let cases: Vec<(bool, Option<CacheEntry>, RouterSync, EntityStatus)> = vec![
            (false, None, NoSync, Pending),
            (false, None, Sync, Ok),
            (false, Some(ok_entry()), NoSync, Pending),
            (false, Some(ok_entry()), Sync, Ok),
            (true, None, NoSync, Pending),
            (true, None, Sync, Pending),
            (true, Some(ok_entry()), NoSync, Ok),
            (true, Some(ok_entry()), Sync, Ok),
            (false, Some(error_entry()), NoSync, Error),
            (false, Some(error_entry()), Sync, Error),
            (true, Some(error_entry()), NoSync, Error),
            (true, Some(error_entry()), Sync, Error),
        ];

        for (line, (auto_reload, entry, sync, expected)) in cases.iter().enumerate() {
            let got = derive_status(*auto_reload, entry.as_ref(), *sync, HASH);
            assert_eq!(got, *expected, "truth table line {}", line + 1);
        }
    }

    #[test]
    fn version_mismatch_stays_pending() {
        let stale = record(i64::from(HASH) - 1);
        assert_eq!(
            derive_status(true, Some(&stale), NoSync, HASH),
            EntityStatus::Pending
        );
    }

    #[test]
    fn versions_beyond_u32_survive() {
        let big = i64::from(u32::MAX) + 1;
        assert_eq!(
            derive_status(true, Some(&record(big)), NoSync, HASH),
            EntityStatus::Pending
        );

        let cache = MemoryStatusCache::new();
        let key = cache_key("v1", "");
        cache.put_record(
            EntityKind::VirtualHost,
            &key,
            CachedEntity {
                id: "v1".to_string(),
                version: big,
                parent_id: String::new(),
                properties: HashMap::new(),
            },
        );
        match cache.get(EntityKind::VirtualHost, &key) {
            Some(CacheEntry::Record(r)) => assert_eq!(r.version, big),
            other => panic!("unexpected entry: {:?}", other),
        }
    }

    #[test]
    fn memory_cache_round_trips_records() {
        let cache = MemoryStatusCache::new();
        let key = cache_key("b1", "p1");
        cache.put_record(
            EntityKind::Backend,
            &key,
            CachedEntity {
                id: "b1".to_string(),
                version: 3,
                parent_id: "p1".to_string(),
                properties: HashMap::new(),
            },
        );

        match cache.get(EntityKind::Backend, &key) {
            Some(CacheEntry::Record(r)) => {
                assert_eq!(r.id, "b1");
                assert_eq!(r.version, 3);
                assert_eq!(r.parent_id, "p1");
            }
            other => panic!("unexpected entry: {:?}", other),
        }

        // Partitioned per kind.
        assert!(cache.get(EntityKind::Rule, &key).is_none());
    }

    #[test]
    fn pinned_status_overwrites_record() {
        let cache = MemoryStatusCache::new();
        let key = cache_key("v1", "");
        cache.put_record(
            EntityKind::VirtualHost,
            &key,
            CachedEntity {
                id: "v1".to_string(),
                version: 1,
                parent_id: String::new(),
                properties: HashMap::new(),
            },
        );
        cache.put_status(EntityKind::VirtualHost, &key, EntityStatus::Error);

        assert_eq!(
            cache.get(EntityKind::VirtualHost, &key),
            Some(CacheEntry::Status(EntityStatus::Error))
        );
    }
}
