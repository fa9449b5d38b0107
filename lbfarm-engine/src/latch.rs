//! Outstanding-fix counters, one per farm API.
//!
//! Each sync cycle records how many corrective actions it dispatched; the
//! entity consumers count them back down as applies complete. The counter
//! is observability plus a convergence hint, never a correctness gate: a
//! failed cycle resets it and the next sync re-derives the remainder.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, warn};

#[derive(Default)]
pub struct FixCounter {
    counts: Mutex<HashMap<String, u64>>,
}

impl FixCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the size of a freshly computed diff.
    pub fn put(&self, key: &str, value: u64) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.insert(key.to_string(), value);
        debug!("fix counter {} set to {}", key, value);
    }

    /// One corrective action finished; returns the remainder.
    pub fn decrement(&self, key: &str) -> Option<u64> {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        match counts.get_mut(key) {
            Some(count) => {
                *count = count.saturating_sub(1);
                debug!("fix counter {} down to {}", key, count);
                Some(*count)
            }
            None => {
                warn!("fix counter {} decremented without a put", key);
                None
            }
        }
    }

    pub fn reset(&self, key: &str) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.remove(key);
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.get(key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_down_to_zero_and_saturates() {
        let counter = FixCounter::new();
        counter.put("farm:9090", 2);

        assert_eq!(counter.decrement("farm:9090"), Some(1));
        assert_eq!(counter.decrement("farm:9090"), Some(0));
        assert_eq!(counter.decrement("farm:9090"), Some(0));
        assert_eq!(counter.get("farm:9090"), Some(0));
    }

    #[test]
    fn concurrent_decrements_lose_no_updates() {
        use std::sync::Arc;

        let counter = Arc::new(FixCounter::new());
        counter.put("farm:9090", 800);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    counter.decrement("farm:9090");
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.get("farm:9090"), Some(0));
    }

    #[test]
    fn decrement_without_put_is_benign() {
        let counter = FixCounter::new();
        assert_eq!(counter.decrement("unknown"), None);
    }

    #[test]
    fn reset_clears_the_key() {
        let counter = FixCounter::new();
        counter.put("farm:9090", 5);
        counter.reset("farm:9090");
        assert_eq!(counter.get("farm:9090"), None);
    }
}
