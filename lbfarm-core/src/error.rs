//! Error taxonomy shared across the reconciliation engine.
//!
//! Callers pattern-match these variants instead of catching broad
//! exceptions: `NotFound` and `Conflict` are normal outcomes of racing
//! with the management API, not failures.

use thiserror::Error;

use crate::entity::EntityKind;

/// Repository-side failures.
#[derive(Debug, Error)]
pub enum RepoError {
    /// The entity or farm no longer exists (deleted out from under a
    /// reconciliation run).
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency conflict: a stale status write lost. The
    /// next scheduled cycle re-reconciles, so callers log and move on.
    #[error("stale write conflict: {0}")]
    Conflict(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

/// Engine-level failures surfacing from the orchestrator and consumers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Repo(#[from] RepoError),

    /// Farm infrastructure provisioning failed.
    #[error("provisioning failed for farm {farm}: {reason}")]
    Provisioning { farm: String, reason: String },

    /// No queue or repository registered for an entity kind. Programmer
    /// error: the diff item is dropped and reconciliation continues.
    #[error("no handler registered for entity kind {0}")]
    UnknownEntityType(EntityKind),
}
