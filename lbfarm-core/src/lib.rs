//! lbfarm-core: declared-state model and pure reconciliation logic.
//!
//! The control plane stores load-balancer configuration (virtual hosts,
//! backend pools, backends, routing rules) as declarative entities, each
//! owned by a farm (a remote load-balancer runtime cluster). This crate
//! holds everything that does not touch the network:
//! - the entity model and its relationship shapes,
//! - the diff engine (declared vs. observed -> corrective actions),
//! - the status cache abstraction and the derived-status truth table,
//! - the shared error taxonomy.

pub mod cache;
pub mod diff;
pub mod entity;
pub mod error;

pub use cache::{cache_key, derive_status, CacheEntry, CachedEntity, MemoryStatusCache, RouterSync, StatusCache};
pub use diff::{Action, DiffAction, RemoteIndex, RemoteRecord};
pub use entity::{compound_key, Entity, EntityKind, EntityStatus, Farm, Relationship};
pub use error::{EngineError, RepoError};
