//! Per-farm sync locks.
//!
//! At most one sync cycle runs per farm at a time; a second attempt must
//! observe the held lock and skip, never block. The trait seam lets a
//! distributed lock service back this in a clustered deployment.

use std::collections::HashSet;
use std::sync::Mutex;

/// Key guarding a farm's sync cycle.
pub fn sync_lock_key(farm_id: i64) -> String {
    format!("lock_farm_sync_{}", farm_id)
}

pub trait FarmLocker: Send + Sync {
    /// Try to take the lock; false when it is already held.
    fn try_lock(&self, key: &str) -> bool;

    fn unlock(&self, key: &str);
}

/// Process-local locker.
#[derive(Default)]
pub struct MemoryLocker {
    held: Mutex<HashSet<String>>,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FarmLocker for MemoryLocker {
    fn try_lock(&self, key: &str) -> bool {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.insert(key.to_string())
    }

    fn unlock(&self, key: &str) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(key);
    }
}
