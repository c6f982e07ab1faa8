//! Per-actor leases.
//!
//! Work items for the same actor key run one at a time; different keys run
//! in parallel. Leases are in-process async mutexes, released on drop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

/// Held while an actor is being driven. Dropping it releases the key.
#[derive(Debug)]
pub struct ActorLease {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl ActorLease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Debug, Default)]
pub struct ActorScopeManager {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ActorScopeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `key`.
    pub async fn acquire(&self, key: &str) -> ActorLease {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            // Drop idle entries; only the map holds them.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(key.to_string()).or_default().clone()
        };
        trace!(key, "waiting for actor lease");
        ActorLease {
            key: key.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Whether `key` is currently leased.
    pub fn is_held(&self, key: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.get(key).is_some_and(|l| l.try_lock().is_err())
    }
}
