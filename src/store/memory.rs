//! In-memory Record Store
//!
//! Implements the record store contract without an API server: resource
//! versions, optimistic concurrency, status sub-resource separation and
//! finalizer-gated deletion. Used by tests and standalone mode.

use crate::crd::{is_deleting, Record};
use crate::domain::ports::RecordStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

/// Record store backed by a map
pub struct MemoryRecordStore<K: Record> {
    objects: RwLock<BTreeMap<String, K>>,
    version: AtomicU64,
    /// Number of upcoming writes to reject with a conflict
    injected_conflicts: AtomicU32,
}

impl<K: Record> Default for MemoryRecordStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Record> MemoryRecordStore<K> {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            injected_conflicts: AtomicU32::new(0),
        }
    }

    /// Reject the next `count` updates with a conflict
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn conflict(name: &str) -> Error {
        Error::Conflict {
            kind: K::kind_name(),
            name: name.to_string(),
        }
    }

    fn not_found(name: &str) -> Error {
        Error::ResourceNotFound {
            kind: K::kind_name(),
            name: name.to_string(),
        }
    }

    /// Validate the incoming resource version against the stored object
    fn check_version(stored: &K, incoming: &K) -> Result<()> {
        match incoming.meta().resource_version.as_deref() {
            None => Ok(()),
            Some(rv) if Some(rv) == stored.meta().resource_version.as_deref() => Ok(()),
            Some(_) => Err(Self::conflict(&incoming.record_name())),
        }
    }

    fn finalizers_empty(record: &K) -> bool {
        record
            .meta()
            .finalizers
            .as_ref()
            .map(|f| f.is_empty())
            .unwrap_or(true)
    }
}

#[async_trait]
impl<K: Record> RecordStore<K> for MemoryRecordStore<K> {
    async fn wait_for_sync(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<K>> {
        Ok(self.objects.read().get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<K>> {
        Ok(self.objects.read().values().cloned().collect())
    }

    async fn create(&self, record: &K) -> Result<K> {
        let name = record.record_name();
        if name.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "{} must have a name",
                K::kind_name()
            )));
        }

        let mut objects = self.objects.write();
        if objects.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: K::kind_name(),
                name,
            });
        }

        let mut stored = record.clone();
        stored.replace_status(None);
        let meta = stored.meta_mut();
        meta.resource_version = Some(self.next_version());
        meta.creation_timestamp = Some(Time(chrono::Utc::now()));
        meta.deletion_timestamp = None;
        meta.uid = Some(uuid::Uuid::new_v4().to_string());

        objects.insert(name, stored.clone());
        Ok(stored)
    }

    async fn update(&self, record: &K) -> Result<K> {
        let name = record.record_name();
        if self.take_injected_conflict() {
            return Err(Self::conflict(&name));
        }

        let mut objects = self.objects.write();
        let stored = objects.get(&name).ok_or_else(|| Self::not_found(&name))?;
        Self::check_version(stored, record)?;

        let mut updated = record.clone();
        updated.replace_status(stored.status_ref().cloned());
        let deletion_timestamp = stored.meta().deletion_timestamp.clone();
        let meta = updated.meta_mut();
        meta.deletion_timestamp = deletion_timestamp;
        meta.creation_timestamp = stored.meta().creation_timestamp.clone();
        meta.uid = stored.meta().uid.clone();

        if is_deleting(updated.meta()) && Self::finalizers_empty(&updated) {
            debug!("Last finalizer removed from {}/{}, deleting", K::kind_name(), name);
            objects.remove(&name);
            return Ok(updated);
        }

        updated.meta_mut().resource_version = Some(self.next_version());
        objects.insert(name, updated.clone());
        Ok(updated)
    }

    async fn update_status(&self, record: &K) -> Result<K> {
        let name = record.record_name();
        if self.take_injected_conflict() {
            return Err(Self::conflict(&name));
        }

        let mut objects = self.objects.write();
        let stored = objects.get(&name).ok_or_else(|| Self::not_found(&name))?;
        Self::check_version(stored, record)?;

        let mut updated = stored.clone();
        updated.replace_status(record.status_ref().cloned());
        updated.meta_mut().resource_version = Some(self.next_version());
        objects.insert(name, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut objects = self.objects.write();
        let stored = objects.get_mut(name).ok_or_else(|| Self::not_found(name))?;

        if Self::finalizers_empty(stored) {
            objects.remove(name);
            return Ok(());
        }

        if !is_deleting(stored.meta()) {
            let version = self.next_version();
            let meta = stored.meta_mut();
            meta.deletion_timestamp = Some(Time(chrono::Utc::now()));
            meta.resource_version = Some(version);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{remove_finalizer, ShareInfo, ShareInfoSpec, ShareStatus};
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;

    fn share(name: &str) -> ShareInfo {
        ShareInfo::with_finalizer(
            name,
            ShareInfoSpec {
                share_name: name.replace('-', "_"),
                capacity_bytes: 1,
                instance_pool_tag: "pool".into(),
                region: "us-central1".into(),
                parameters: BTreeMap::new(),
                labels: BTreeMap::new(),
            },
        )
    }

    #[tokio::test]
    async fn test_create_ignores_status_and_rejects_duplicates() {
        let store = MemoryRecordStore::<ShareInfo>::new();
        let mut record = share("pvc-1");
        record.status_mut().share_status = ShareStatus::Ready;

        let created = store.create(&record).await.unwrap();
        assert!(created.status.is_none());
        assert!(created.metadata.resource_version.is_some());

        assert_matches!(
            store.create(&record).await,
            Err(Error::ResourceExists { .. })
        );
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = MemoryRecordStore::<ShareInfo>::new();
        let created = store.create(&share("pvc-1")).await.unwrap();

        let mut first = created.clone();
        first.spec.capacity_bytes = 2;
        store.update(&first).await.unwrap();

        let mut stale = created;
        stale.spec.capacity_bytes = 3;
        assert_matches!(store.update(&stale).await, Err(Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_status_and_spec_writes_are_separate() {
        let store = MemoryRecordStore::<ShareInfo>::new();
        let created = store.create(&share("pvc-1")).await.unwrap();

        let mut with_status = created.clone();
        with_status.spec.capacity_bytes = 99;
        with_status.status_mut().share_status = ShareStatus::Creating;
        let stored = store.update_status(&with_status).await.unwrap();
        assert_eq!(stored.spec.capacity_bytes, 1);
        assert_eq!(stored.share_status(), ShareStatus::Creating);

        let mut with_spec = stored.clone();
        with_spec.spec.capacity_bytes = 5;
        with_spec.status = None;
        let stored = store.update(&with_spec).await.unwrap();
        assert_eq!(stored.spec.capacity_bytes, 5);
        assert_eq!(stored.share_status(), ShareStatus::Creating);
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizer() {
        let store = MemoryRecordStore::<ShareInfo>::new();
        store.create(&share("pvc-1")).await.unwrap();

        store.delete("pvc-1").await.unwrap();
        let marked = store.get("pvc-1").await.unwrap().unwrap();
        assert!(marked.is_deleting());

        let mut released = marked.clone();
        remove_finalizer(&mut released.metadata);
        store.update(&released).await.unwrap();
        assert!(store.get("pvc-1").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_injected_conflicts_are_consumed() {
        let store = MemoryRecordStore::<ShareInfo>::new();
        let created = store.create(&share("pvc-1")).await.unwrap();
        store.inject_conflicts(1);
        assert_matches!(store.update(&created).await, Err(Error::Conflict { .. }));
        store.update(&created).await.unwrap();
    }
}
