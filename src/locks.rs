//! Per-key and per-pair locks
//!
//! Mutations of a key's record, model metadata and quota happen under that key's async
//! mutex. Probes take a per-(key, model) try-lock so a second probe of the same pair is
//! skipped instead of queued.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct KeyLocks {
    keys: DashMap<String, Arc<Mutex<()>>>,
    probes: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a key's mutable state
    pub async fn lock_key(&self, key_id: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .keys
            .entry(key_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Claim the probe slot for a pair, or `None` if a probe is already running
    pub fn try_probe(&self, key_id: &str, model_id: &str) -> Option<OwnedMutexGuard<()>> {
        let mutex = self
            .probes
            .entry((key_id.to_string(), model_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.try_lock_owned().ok()
    }

    /// Forget every lock belonging to a removed key
    pub fn forget(&self, key_id: &str) {
        self.keys.remove(key_id);
        self.probes.retain(|(key, _), _| key != key_id);
    }
}
