//! Conflict Retry
//!
//! Read-modify-write helper for record updates. Each attempt re-reads the
//! object so the mutation is applied to the latest version; only
//! optimistic-concurrency conflicts are retried.

use crate::config::RetryPolicy;
use crate::crd::Record;
use crate::domain::ports::RecordStore;
use crate::error::Result;
use backoff::ExponentialBackoffBuilder;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Which part of the object a write replaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    /// Metadata and spec
    Object,
    /// Status sub-resource
    Status,
}

/// Apply `mutate` to the latest version of `name` and write it back.
///
/// `mutate` returns whether it changed anything; unchanged objects are not
/// written. Returns `None` if the object no longer exists. Conflicts are
/// retried with exponential backoff up to `policy.max_attempts`, after which
/// the conflict is returned to the caller.
pub async fn update_with_retry<K, F>(
    store: &dyn RecordStore<K>,
    name: &str,
    target: WriteTarget,
    policy: RetryPolicy,
    mutate: F,
) -> Result<Option<K>>
where
    K: Record,
    F: Fn(&mut K) -> bool + Send + Sync,
{
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(policy.initial_backoff)
        .with_max_interval(policy.max_backoff)
        .with_max_elapsed_time(None)
        .build();

    let attempts = AtomicU32::new(0);
    let attempts = &attempts;
    let mutate = &mutate;

    backoff::future::retry(backoff, || async move {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let mut record = match store.get(name).await.map_err(backoff::Error::permanent)? {
            Some(record) => record,
            None => return Ok(None),
        };
        if !mutate(&mut record) {
            return Ok(Some(record));
        }

        let written = match target {
            WriteTarget::Object => store.update(&record).await,
            WriteTarget::Status => store.update_status(&record).await,
        };

        match written {
            Ok(updated) => Ok(Some(updated)),
            Err(e) if e.is_conflict() && attempt < policy.max_attempts => {
                debug!(
                    "Conflict writing {}/{} (attempt {}/{}), retrying",
                    K::kind_name(),
                    name,
                    attempt,
                    policy.max_attempts
                );
                Err(backoff::Error::transient(e))
            }
            Err(e) => Err(backoff::Error::permanent(e)),
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ShareInfo, ShareInfoSpec, ShareStatus};
    use crate::error::Error;
    use crate::store::MemoryRecordStore;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    async fn seeded() -> MemoryRecordStore<ShareInfo> {
        let store = MemoryRecordStore::new();
        let spec = ShareInfoSpec {
            share_name: "pvc_1".into(),
            capacity_bytes: 1,
            instance_pool_tag: "pool".into(),
            region: "us-central1".into(),
            parameters: BTreeMap::new(),
            labels: BTreeMap::new(),
        };
        store
            .create(&ShareInfo::with_finalizer("pvc-1", spec))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_retries_through_conflicts() {
        let store = seeded().await;
        store.inject_conflicts(2);

        let updated = update_with_retry(&store, "pvc-1", WriteTarget::Status, policy(5), |s| {
            s.status_mut().share_status = ShareStatus::Creating;
            true
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(updated.share_status(), ShareStatus::Creating);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let store = seeded().await;
        store.inject_conflicts(10);

        let result = update_with_retry(&store, "pvc-1", WriteTarget::Object, policy(3), |s| {
            s.spec.capacity_bytes = 2;
            true
        })
        .await;
        assert_matches!(result, Err(Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_missing_and_unchanged_objects_are_not_written() {
        let store = seeded().await;
        let missing = update_with_retry(&store, "pvc-2", WriteTarget::Object, policy(3), |_| true)
            .await
            .unwrap();
        assert!(missing.is_none());

        let before = store.get("pvc-1").await.unwrap().unwrap();
        let after = update_with_retry(&store, "pvc-1", WriteTarget::Object, policy(3), |_| false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            before.metadata.resource_version,
            after.metadata.resource_version
        );
    }
}
