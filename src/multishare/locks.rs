//! Keyed Locks
//!
//! Per-resource mutual exclusion keyed by volume ID, pool tag, instance or
//! share path. Entries are created on demand and removed when the last
//! holder releases them.

use crate::domain::model::{InstanceKey, ShareKey};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Set of named async locks
#[derive(Default, Clone)]
pub struct VolumeLocks {
    locks: Arc<LockMap>,
}

/// Held lock; releasing it drops the map entry once nobody else waits on it
pub struct LockGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Take the lock for `key` if nobody holds it
    pub fn try_acquire(&self, key: &str) -> Option<LockGuard> {
        let mutex = self.entry(key);
        match mutex.try_lock_owned() {
            Ok(guard) => Some(LockGuard {
                key: key.to_string(),
                guard: Some(guard),
                locks: self.locks.clone(),
            }),
            Err(_) => {
                trace!("Lock {} is held", key);
                None
            }
        }
    }

    /// Wait for the lock for `key`
    pub async fn acquire(&self, key: &str) -> LockGuard {
        let mutex = self.entry(key);
        let guard = mutex.lock_owned().await;
        LockGuard {
            key: key.to_string(),
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Number of live lock entries
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // The map holds one reference; any other means a waiter or holder.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Lock key serializing all placement decisions for a pool
pub fn pool_lock_key(pool_tag: &str) -> String {
    format!("pool/{}", pool_tag)
}

/// Lock key for an instance
pub fn instance_lock_key(key: &InstanceKey) -> String {
    key.uri()
}

/// Lock key for a share
pub fn share_lock_key(key: &ShareKey) -> String {
    key.uri()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_try_acquire_is_exclusive() {
        let locks = VolumeLocks::new();
        let held = locks.try_acquire("vol-1").unwrap();
        assert!(locks.try_acquire("vol-1").is_none());
        assert!(locks.try_acquire("vol-2").is_some());

        drop(held);
        assert!(locks.try_acquire("vol-1").is_some());
    }

    #[test]
    fn test_entries_are_removed_on_release() {
        let locks = VolumeLocks::new();
        {
            let _a = locks.try_acquire("a").unwrap();
            let _b = locks.try_acquire("b").unwrap();
            assert_eq!(locks.len(), 2);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_holder() {
        let locks = VolumeLocks::new();
        let held = locks.acquire("instance").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("instance").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[test]
    fn test_lock_keys() {
        let instance = InstanceKey::new("p", "l", "i");
        let share = ShareKey::new(instance.clone(), "s");
        assert_eq!(pool_lock_key("gold"), "pool/gold");
        assert_eq!(instance_lock_key(&instance), "projects/p/locations/l/instances/i");
        assert!(share_lock_key(&share).ends_with("/shares/s"));
    }
}
