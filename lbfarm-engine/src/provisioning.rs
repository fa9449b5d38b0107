//! Farm infrastructure provisioning seam.
//!
//! Creating or removing a farm means standing up or tearing down its
//! runtime cluster. The engine only cares about the outcome; the actual
//! mechanism (cloud API, config management, nothing at all) hides behind
//! this trait.

use async_trait::async_trait;
use lbfarm_core::{EngineError, Farm};
use tracing::info;

#[async_trait]
pub trait Provisioning: Send + Sync {
    async fn create(&self, farm: &Farm) -> Result<(), EngineError>;

    async fn remove(&self, farm: &Farm) -> Result<(), EngineError>;
}

/// No-op provisioner for deployments where farm runtimes are managed out
/// of band.
pub struct NullProvisioning;

#[async_trait]
impl Provisioning for NullProvisioning {
    async fn create(&self, farm: &Farm) -> Result<(), EngineError> {
        info!("farm {}: provisioning managed externally, nothing to create", farm.name);
        Ok(())
    }

    async fn remove(&self, farm: &Farm) -> Result<(), EngineError> {
        info!("farm {}: provisioning managed externally, nothing to remove", farm.name);
        Ok(())
    }
}
