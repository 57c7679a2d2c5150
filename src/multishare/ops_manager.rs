//! Multishare Operations Manager
//!
//! Cloud-facing helpers shared by the reconciler and the direct workflow:
//! running-operation listing, instance eligibility, and construction of new
//! instances and shares.
//!
//! When the reconciler is disabled, admission calls the cloud through the
//! direct workflow implemented here. Each call inspects current cloud state,
//! starts at most one operation and returns [`Error::Pending`] until the
//! share is usable; callers retry.

use crate::config::{
    label_value, DriverConfig, LABEL_POOL_TAG, PARAM_CONNECT_MODE, PARAM_NETWORK, PARAM_RESERVED_IP_RANGE,
    PARAM_TIER,
};
use crate::domain::model::{
    InstanceKey, MultishareInstance, OpInfo, OpType, Operation, ResourceState, Share, ShareKey,
    WILDCARD,
};
use crate::domain::ports::FilestoreServiceRef;
use crate::error::{Error, Result};
use crate::multishare::cache::{OpsCache, ShareCreateOpInfo};
use crate::multishare::ipalloc;
use crate::multishare::locks::{instance_lock_key, pool_lock_key, share_lock_key, VolumeLocks};
use crate::multishare::sizing;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Running Operations
// =============================================================================

/// Keep operations that still matter: running ones, and failed ones that
/// finished within `retention` so their error stays visible and the failed
/// call is not retried immediately.
pub fn filter_running_ops(ops: &[Operation], retention: Duration, now: DateTime<Utc>) -> Vec<OpInfo> {
    let retention = chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
    ops.iter()
        .filter(|op| {
            if !op.done {
                return true;
            }
            match (&op.error, op.end_time) {
                (Some(_), Some(end)) => now - end <= retention,
                _ => false,
            }
        })
        .filter_map(OpInfo::from_operation)
        .collect()
}

/// List operations for the project in every location and keep the ones
/// that still gate new calls
pub async fn list_running_ops(
    filestore: &FilestoreServiceRef,
    project: &str,
    retention: Duration,
) -> Result<Vec<OpInfo>> {
    let ops = filestore.list_operations(project, WILDCARD).await?;
    let running = filter_running_ops(&ops, retention, Utc::now());
    debug!("{} of {} operations are active", running.len(), ops.len());
    Ok(running)
}

// =============================================================================
// Resource Construction
// =============================================================================

/// Labels stamped on every instance and share created for a pool
pub fn resource_labels(config: &DriverConfig, pool_tag: &str) -> BTreeMap<String, String> {
    let mut labels = config.cluster_labels();
    labels.insert(LABEL_POOL_TAG.to_string(), crate::config::label_value(pool_tag));
    labels
}

/// Build the instance to create from storage class parameters.
///
/// `used_ranges` are the reserved ranges of existing instances, consulted
/// when the class supplies a CIDR wider than one instance needs.
pub fn build_instance(
    config: &DriverConfig,
    key: InstanceKey,
    capacity_bytes: u64,
    pool_tag: &str,
    parameters: &BTreeMap<String, String>,
    used_ranges: &[String],
) -> Result<MultishareInstance> {
    let m = &config.multishare;
    let param = |name: &str, default: &str| {
        parameters
            .get(name)
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| default.to_string())
    };

    let reserved_ip_range = ipalloc::resolve_reserved_ip_range(
        parameters.get(PARAM_RESERVED_IP_RANGE).map(String::as_str),
        used_ranges,
    )?;

    Ok(MultishareInstance {
        key,
        tier: param(PARAM_TIER, &m.default_tier).to_uppercase(),
        network: param(PARAM_NETWORK, &m.default_network),
        connect_mode: param(PARAM_CONNECT_MODE, &m.default_connect_mode).to_uppercase(),
        reserved_ip_range,
        ip_address: None,
        capacity_bytes,
        capacity_step_size_gb: 0,
        max_share_count: m.max_shares_per_instance as u32,
        state: ResourceState::Unknown,
        labels: resource_labels(config, pool_tag),
    })
}

/// Generate a fresh instance name
pub fn new_instance_name(config: &DriverConfig) -> String {
    format!(
        "{}-{}",
        config.multishare.instance_name_prefix,
        uuid::Uuid::new_v4().simple()
    )
}

// =============================================================================
// Eligibility
// =============================================================================

/// Instances a new share could be placed on
#[derive(Debug, Clone, Default)]
pub struct EligibleInstances {
    /// READY with room for another share
    pub ready: Vec<MultishareInstance>,
    /// Busy or transitioning; may become usable
    pub non_ready: Vec<MultishareInstance>,
}

// =============================================================================
// Operations Manager
// =============================================================================

/// Direct (non-reconciler) share lifecycle against the cloud
pub struct MultishareOpsManager {
    config: DriverConfig,
    filestore: FilestoreServiceRef,
    ops_cache: Arc<OpsCache>,
    locks: VolumeLocks,
}

impl MultishareOpsManager {
    pub fn new(
        config: DriverConfig,
        filestore: FilestoreServiceRef,
        ops_cache: Arc<OpsCache>,
        locks: VolumeLocks,
    ) -> Self {
        Self {
            config,
            filestore,
            ops_cache,
            locks,
        }
    }

    /// Active operations for this project; also refreshes the op tracker
    pub async fn running_ops(&self) -> Result<Vec<OpInfo>> {
        let ops = list_running_ops(
            &self.filestore,
            &self.config.project,
            self.config.reconciler.op_error_retention(),
        )
        .await?;
        let pools: HashMap<String, String> = self
            .filestore
            .list_multishare_instances(&self.config.project, WILDCARD)
            .await?
            .into_iter()
            .filter_map(|i| Some((i.key.uri(), i.labels.get(LABEL_POOL_TAG)?.clone())))
            .collect();
        self.ops_cache
            .rebuild(&ops, |uri| pools.get(uri).cloned().unwrap_or_default());
        Ok(ops)
    }

    /// This cluster's instances of a pool in a region, with their shares
    async fn pool_instances(
        &self,
        pool_tag: &str,
        region: &str,
    ) -> Result<Vec<(MultishareInstance, Vec<Share>)>> {
        let pool_label = label_value(pool_tag);
        let instances = self
            .filestore
            .list_multishare_instances(&self.config.project, region)
            .await?;

        let mut result = Vec::new();
        for instance in instances {
            if !self.config.owns(&instance.labels)
                || instance.labels.get(LABEL_POOL_TAG) != Some(&pool_label)
            {
                continue;
            }
            let shares = self.filestore.list_shares(&instance.key).await?;
            result.push((instance, shares));
        }
        Ok(result)
    }

    /// Sort this pool's instances into ready and non-ready.
    ///
    /// An instance with an operation on it or on one of its shares is
    /// non-ready, unless the operation deletes the instance, in which case
    /// it is ignored. Without operations, a READY instance with room is
    /// ready and a CREATING, REPAIRING or UPDATING one is non-ready.
    pub async fn run_eligible_instance_check(
        &self,
        pool_tag: &str,
        region: &str,
        ops: &[OpInfo],
    ) -> Result<EligibleInstances> {
        let mut eligible = EligibleInstances::default();

        for (instance, shares) in self.pool_instances(pool_tag, region).await? {
            let uri = instance.key.uri();
            let instance_ops: Vec<&OpInfo> = ops.iter().filter(|op| op.instance_uri() == uri).collect();

            if !instance_ops.is_empty() {
                if instance_ops.iter().any(|op| op.op_type == OpType::InstanceDelete) {
                    debug!("Instance {} is being deleted, skipping", uri);
                } else {
                    eligible.non_ready.push(instance);
                }
                continue;
            }

            match instance.state {
                ResourceState::Ready if (shares.len() as u32) < instance.max_share_count => {
                    eligible.ready.push(instance)
                }
                ResourceState::Creating | ResourceState::Repairing | ResourceState::Updating => {
                    eligible.non_ready.push(instance)
                }
                _ => debug!("Instance {} in state {} is not eligible", uri, instance.state),
            }
        }

        debug!(
            "Pool {}: {} ready, {} non-ready instances",
            pool_tag,
            eligible.ready.len(),
            eligible.non_ready.len()
        );
        Ok(eligible)
    }

    /// Find a share of this cluster by name in any instance
    async fn find_share(&self, share_name: &str) -> Result<Option<Share>> {
        let shares = self
            .filestore
            .list_shares(&InstanceKey::wildcard(self.config.project.clone()))
            .await?;
        Ok(shares
            .into_iter()
            .find(|s| s.key.share == share_name && self.config.owns(&s.labels)))
    }

    /// Create-or-find a share of `capacity_bytes` in `pool_tag`.
    ///
    /// Returns the share once it is READY; until then returns
    /// [`Error::Pending`] after starting whatever step comes next.
    pub async fn setup_share(
        &self,
        share_name: &str,
        pool_tag: &str,
        region: &str,
        capacity_bytes: u64,
        parameters: &BTreeMap<String, String>,
    ) -> Result<Share> {
        let _pool_guard = self.locks.acquire(&pool_lock_key(pool_tag)).await;
        let class = label_value(pool_tag);

        if let Some(cached) = self.ops_cache.share_create_op(&class, share_name) {
            match self.filestore.get_operation(&cached.op.id).await? {
                Some(op) if !op.done => {
                    return Err(Error::Pending(format!(
                        "share {} is being created on {}",
                        share_name, cached.instance_handle
                    )))
                }
                Some(Operation {
                    error: Some(reason),
                    id,
                    ..
                }) => {
                    self.ops_cache.remove_op(&cached.op.target);
                    return Err(Error::OperationFailed { op_id: id, reason });
                }
                _ => self.ops_cache.remove_op(&cached.op.target),
            }
        }

        if let Some(share) = self.find_share(share_name).await? {
            if share.state == ResourceState::Ready {
                return Ok(share);
            }
            return Err(Error::Pending(format!(
                "share {} is {}",
                share.key, share.state
            )));
        }

        let ops = self.running_ops().await?;
        let eligible = self.run_eligible_instance_check(pool_tag, region, &ops).await?;

        for instance in &eligible.ready {
            let _instance_guard = self.locks.acquire(&instance_lock_key(&instance.key)).await;

            // Re-read under the lock: a sibling may have just placed a share here
            let current = match self.filestore.get_multishare_instance(&instance.key).await? {
                Some(current) if current.state == ResourceState::Ready => current,
                _ => continue,
            };
            let shares = self.filestore.list_shares(&current.key).await?;
            if shares.len() as u32 >= current.max_share_count {
                continue;
            }
            let used: u64 = shares.iter().map(|s| s.capacity_bytes).sum();

            if let Some(target) = sizing::instance_needs_expand(current.capacity_bytes, used, capacity_bytes) {
                let step = if current.capacity_step_size_gb > 0 {
                    current.capacity_step_size_gb * crate::domain::model::GIB
                } else {
                    self.config.multishare.default_step_bytes
                };
                let target = sizing::align_bytes(target, step);
                if target > self.config.multishare.max_instance_bytes {
                    debug!(
                        "Instance {} cannot grow to {} bytes, trying the next one",
                        current.key, target
                    );
                    continue;
                }

                info!(
                    "Expanding instance {} from {} to {} bytes for share {}",
                    current.key, current.capacity_bytes, target, share_name
                );
                let op = self
                    .filestore
                    .resize_multishare_instance(&current.key, target)
                    .await?;
                debug!("Instance resize started as {}", op.id);
                return Err(Error::Pending(format!(
                    "expanding instance {} for share {}",
                    current.key, share_name
                )));
            }

            let share = Share {
                key: ShareKey::new(current.key.clone(), share_name),
                capacity_bytes,
                state: ResourceState::Unknown,
                labels: resource_labels(&self.config, pool_tag),
            };
            info!("Creating share {} on {}", share_name, current.key);
            let op = self.filestore.create_share(&share).await?;
            if let Some(info) = OpInfo::from_operation(&op) {
                self.ops_cache.add_share_create_op(
                    &class,
                    share_name,
                    ShareCreateOpInfo {
                        instance_handle: current.key.uri(),
                        op: info,
                    },
                );
            }
            return Err(Error::Pending(format!(
                "share {} is being created on {}",
                share_name, current.key
            )));
        }

        if !eligible.non_ready.is_empty() {
            return Err(Error::Pending(format!(
                "waiting for {} instance(s) in pool {}",
                eligible.non_ready.len(),
                pool_tag
            )));
        }

        let capacity = sizing::target_instance_capacity(
            capacity_bytes,
            self.config.multishare.default_step_bytes,
            &self.config.multishare,
        );
        let key = InstanceKey::new(self.config.project.clone(), region, new_instance_name(&self.config));
        let used_ranges = self.used_ranges().await?;
        let instance = build_instance(&self.config, key, capacity, pool_tag, parameters, &used_ranges)?;
        info!(
            "No eligible instance in pool {}, creating {}",
            pool_tag, instance.key
        );
        let op = self.filestore.create_multishare_instance(&instance).await?;
        debug!("Instance create started as {}", op.id);
        Err(Error::Pending(format!(
            "creating instance {} for share {}",
            instance.key, share_name
        )))
    }

    /// Delete a share; `Ok` once it is gone.
    ///
    /// When the last share of an instance is gone the instance is deleted
    /// too, without waiting for it.
    pub async fn delete_share(&self, key: &ShareKey) -> Result<()> {
        let _guard = self.locks.acquire(&share_lock_key(key)).await;
        self.running_ops().await?;

        if let Some(op) = self.ops_cache.share_op(&key.uri()).filter(|op| op.err.is_none()) {
            return Err(Error::Pending(format!("{} is running on {}", op.op_type, key)));
        }

        match self.filestore.get_share(key).await? {
            Some(share) if share.state == ResourceState::Deleting => {
                Err(Error::Pending(format!("share {} is being deleted", key)))
            }
            Some(_) => {
                self.filestore.delete_share(key).await?;
                Err(Error::Pending(format!("deleting share {}", key)))
            }
            None => {
                self.delete_instance_if_empty(&key.instance).await;
                Ok(())
            }
        }
    }

    async fn delete_instance_if_empty(&self, key: &InstanceKey) {
        if !self.ops_cache.ops_for_instance(&key.uri()).is_empty() {
            return;
        }
        let _guard = self.locks.acquire(&instance_lock_key(key)).await;
        let result = async {
            let instance = match self.filestore.get_multishare_instance(key).await? {
                Some(instance) if self.config.owns(&instance.labels) => instance,
                _ => return Ok(()),
            };
            if instance.state != ResourceState::Ready
                || !self.filestore.list_shares(key).await?.is_empty()
            {
                return Ok(());
            }
            info!("Instance {} has no shares left, deleting it", key);
            self.filestore.delete_multishare_instance(key).await?;
            Ok::<(), Error>(())
        }
        .await;
        if let Err(e) = result {
            warn!("Failed to delete empty instance {}: {}", key, e);
        }
    }

    /// Grow a share to `capacity_bytes`, expanding its instance first if
    /// needed. Returns the share capacity once the share is large enough.
    pub async fn expand_share(&self, key: &ShareKey, capacity_bytes: u64) -> Result<u64> {
        let _guard = self.locks.acquire(&share_lock_key(key)).await;

        let share = self.filestore.get_share(key).await?.ok_or_else(|| Error::ResourceNotFound {
            kind: "Share".into(),
            name: key.uri(),
        })?;
        if share.capacity_bytes >= capacity_bytes && share.state == ResourceState::Ready {
            return Ok(share.capacity_bytes);
        }

        self.running_ops().await?;
        if let Some(op) = self.ops_cache.ops_for_instance(&key.instance.uri()).into_iter().next() {
            return Err(Error::Pending(format!(
                "{} is running on {}",
                op.op_type, op.target
            )));
        }
        if share.state != ResourceState::Ready {
            return Err(Error::Pending(format!("share {} is {}", key, share.state)));
        }

        let _instance_guard = self.locks.acquire(&instance_lock_key(&key.instance)).await;
        let instance = self
            .filestore
            .get_multishare_instance(&key.instance)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "Instance".into(),
                name: key.instance.uri(),
            })?;
        let used: u64 = self
            .filestore
            .list_shares(&key.instance)
            .await?
            .iter()
            .map(|s| s.capacity_bytes)
            .sum();

        let extra = capacity_bytes - share.capacity_bytes;
        if let Some(target) = sizing::instance_needs_expand(instance.capacity_bytes, used, extra) {
            let target = sizing::align_bytes(target, self.config.multishare.default_step_bytes);
            if target > self.config.multishare.max_instance_bytes {
                return Err(Error::InsufficientCapacity {
                    requested: extra,
                    available: instance.capacity_bytes.saturating_sub(used),
                });
            }
            info!("Expanding instance {} to {} bytes", key.instance, target);
            self.filestore
                .resize_multishare_instance(&key.instance, target)
                .await?;
            return Err(Error::Pending(format!("expanding instance {}", key.instance)));
        }

        info!("Expanding share {} to {} bytes", key, capacity_bytes);
        self.filestore.resize_share(key, capacity_bytes).await?;
        Err(Error::Pending(format!("expanding share {}", key)))
    }

    /// Reserved ranges of every instance in the project
    async fn used_ranges(&self) -> Result<Vec<String>> {
        Ok(self
            .filestore
            .list_multishare_instances(&self.config.project, WILDCARD)
            .await?
            .into_iter()
            .filter_map(|i| i.reserved_ip_range)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LABEL_CLUSTER_NAME;
    use crate::controlplane::backends::FakeFilestore;
    use crate::domain::model::{GIB, TIB};
    use crate::domain::ports::FilestoreService;
    use assert_matches::assert_matches;

    const REGION: &str = "us-central1";

    fn config() -> DriverConfig {
        let mut config = DriverConfig {
            project: "proj".into(),
            location: "us-central1-c".into(),
            cluster_name: "prod".into(),
            ..Default::default()
        };
        config.multishare.reconciler_enabled = false;
        config
    }

    fn manager(fake: Arc<FakeFilestore>) -> MultishareOpsManager {
        MultishareOpsManager::new(config(), fake, Arc::new(OpsCache::new()), VolumeLocks::new())
    }

    fn instance(name: &str, state: ResourceState) -> MultishareInstance {
        let mut instance = build_instance(
            &config(),
            InstanceKey::new("proj", REGION, name),
            TIB,
            "gold",
            &BTreeMap::new(),
            &[],
        )
        .unwrap();
        instance.state = state;
        instance
    }

    fn share_on(instance: &MultishareInstance, name: &str, bytes: u64) -> Share {
        Share {
            key: ShareKey::new(instance.key.clone(), name),
            capacity_bytes: bytes,
            state: ResourceState::Ready,
            labels: resource_labels(&config(), "gold"),
        }
    }

    fn op(target: &str, done: bool, error: Option<&str>, ended_secs_ago: i64) -> Operation {
        Operation {
            id: format!("op-{}", ended_secs_ago),
            target: target.into(),
            verb: "create".into(),
            done,
            error: error.map(String::from),
            create_time: Utc::now(),
            end_time: done.then(|| Utc::now() - chrono::Duration::seconds(ended_secs_ago)),
        }
    }

    #[test]
    fn test_filter_running_ops_keeps_recent_failures() {
        let target = "projects/p/locations/l/instances/i";
        let ops = vec![
            op(target, false, None, 0),
            op(target, true, None, 10),
            op(target, true, Some("quota"), 60),
            op(target, true, Some("quota"), 600),
        ];
        let running = filter_running_ops(&ops, Duration::from_secs(300), Utc::now());
        assert_eq!(running.len(), 2);
        assert!(running[0].err.is_none());
        assert_eq!(running[1].err.as_deref(), Some("quota"));
    }

    #[test]
    fn test_build_instance_uses_parameters() {
        let mut params = BTreeMap::new();
        params.insert(PARAM_TIER.to_string(), "enterprise".to_string());
        params.insert(PARAM_RESERVED_IP_RANGE.to_string(), "10.1.0.0/24".to_string());
        let instance = build_instance(
            &config(),
            InstanceKey::new("proj", REGION, "fs-1"),
            TIB,
            "Gold",
            &params,
            &["10.1.0.0/26".to_string()],
        )
        .unwrap();
        assert_eq!(instance.tier, "ENTERPRISE");
        assert_eq!(instance.network, "default");
        assert_eq!(instance.reserved_ip_range.as_deref(), Some("10.1.0.64/26"));
        assert_eq!(instance.labels[LABEL_POOL_TAG], "gold");
        assert_eq!(instance.labels[LABEL_CLUSTER_NAME], "prod");
        assert_eq!(instance.max_share_count, 10);
    }

    #[tokio::test]
    async fn test_deleting_instance_with_delete_op_is_ignored() {
        let fake = Arc::new(FakeFilestore::new());
        let deleting = instance("fs-1", ResourceState::Deleting);
        fake.insert_instance(deleting.clone());
        fake.insert_running_operation(&deleting.key.uri(), "delete");

        let mgr = manager(fake);
        let ops = mgr.running_ops().await.unwrap();
        let eligible = mgr.run_eligible_instance_check("gold", REGION, &ops).await.unwrap();
        assert!(eligible.ready.is_empty());
        assert!(eligible.non_ready.is_empty());
    }

    #[tokio::test]
    async fn test_eligibility_by_state_and_ops() {
        let fake = Arc::new(FakeFilestore::new());
        let ready = instance("fs-a", ResourceState::Ready);
        let creating = instance("fs-b", ResourceState::Creating);
        let busy = instance("fs-c", ResourceState::Ready);
        let broken = instance("fs-d", ResourceState::Error);
        let mut other_pool = instance("fs-e", ResourceState::Ready);
        other_pool.labels.insert(LABEL_POOL_TAG.into(), "silver".into());
        let mut full = instance("fs-f", ResourceState::Ready);
        full.max_share_count = 1;

        for i in [&ready, &creating, &busy, &broken, &other_pool, &full] {
            fake.insert_instance(i.clone());
        }
        fake.insert_share(share_on(&full, "s1", 100 * GIB));
        fake.insert_running_operation(&format!("{}/shares/x", busy.key.uri()), "create");

        let mgr = manager(fake);
        let ops = mgr.running_ops().await.unwrap();
        let eligible = mgr.run_eligible_instance_check("gold", REGION, &ops).await.unwrap();

        let names = |v: &[MultishareInstance]| v.iter().map(|i| i.key.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&eligible.ready), ["fs-a"]);
        assert_eq!(names(&eligible.non_ready), ["fs-b", "fs-c"]);
    }

    #[tokio::test]
    async fn test_setup_share_walks_through_instance_creation() {
        let fake = Arc::new(FakeFilestore::holding_operations());
        let mgr = manager(fake.clone());
        let params = BTreeMap::new();

        // Nothing exists: an instance is created
        assert_matches!(
            mgr.setup_share("pvc_1", "gold", REGION, 100 * GIB, &params).await,
            Err(Error::Pending(_))
        );
        assert_eq!(fake.call_count(OpType::InstanceCreate), 1);

        // Instance still creating: wait
        assert_matches!(
            mgr.setup_share("pvc_1", "gold", REGION, 100 * GIB, &params).await,
            Err(Error::Pending(_))
        );
        assert_eq!(fake.call_count(OpType::InstanceCreate), 1);

        fake.complete_pending();
        assert_matches!(
            mgr.setup_share("pvc_1", "gold", REGION, 100 * GIB, &params).await,
            Err(Error::Pending(_))
        );
        assert_eq!(fake.call_count(OpType::ShareCreate), 1);

        // Cached create op still running
        assert_matches!(
            mgr.setup_share("pvc_1", "gold", REGION, 100 * GIB, &params).await,
            Err(Error::Pending(_))
        );

        fake.complete_pending();
        let share = mgr
            .setup_share("pvc_1", "gold", REGION, 100 * GIB, &params)
            .await
            .unwrap();
        assert_eq!(share.capacity_bytes, 100 * GIB);
        assert_eq!(fake.call_count(OpType::ShareCreate), 1);
    }

    #[tokio::test]
    async fn test_setup_share_expands_full_instance() {
        let fake = Arc::new(FakeFilestore::new());
        let ready = instance("fs-a", ResourceState::Ready);
        fake.insert_instance(ready.clone());
        fake.insert_share(share_on(&ready, "s1", 100 * GIB));

        let mgr = manager(fake.clone());
        assert_matches!(
            mgr.setup_share("pvc_2", "gold", REGION, TIB, &BTreeMap::new()).await,
            Err(Error::Pending(_))
        );
        let grown = fake.get_multishare_instance(&ready.key).await.unwrap().unwrap();
        // 1 TiB + 100 GiB rounded up to the 256 GiB step
        assert_eq!(grown.capacity_bytes, TIB + 256 * GIB);
        assert_eq!(fake.call_count(OpType::ShareCreate), 0);
    }

    #[tokio::test]
    async fn test_delete_share_is_idempotent() {
        let fake = Arc::new(FakeFilestore::new());
        let ready = instance("fs-a", ResourceState::Ready);
        fake.insert_instance(ready.clone());
        let share = share_on(&ready, "s1", 100 * GIB);
        fake.insert_share(share.clone());

        let mgr = manager(fake.clone());
        assert_matches!(mgr.delete_share(&share.key).await, Err(Error::Pending(_)));
        mgr.delete_share(&share.key).await.unwrap();
        mgr.delete_share(&share.key).await.unwrap();

        // The emptied instance was deleted once
        assert_eq!(fake.call_count(OpType::InstanceDelete), 1);
    }

    #[tokio::test]
    async fn test_op_tracker_follows_listing_across_cycles() {
        let fake = Arc::new(FakeFilestore::new());
        let cache = Arc::new(OpsCache::new());
        let mgr = MultishareOpsManager::new(config(), fake.clone(), cache.clone(), VolumeLocks::new());
        let params = BTreeMap::new();

        for _ in 0..5 {
            let mut share = None;
            for _ in 0..4 {
                if let Ok(s) = mgr.setup_share("pvc_1", "gold", REGION, 100 * GIB, &params).await {
                    share = Some(s);
                    break;
                }
            }
            let share = share.unwrap();
            for _ in 0..3 {
                if mgr.delete_share(&share.key).await.is_ok() {
                    break;
                }
            }
        }

        let running = mgr.running_ops().await.unwrap();
        assert!(running.is_empty());
        assert_eq!(cache.len(), running.len());
        assert_eq!(fake.call_count(OpType::InstanceCreate), 5);
    }

    #[tokio::test]
    async fn test_delete_waits_for_running_share_op() {
        let fake = Arc::new(FakeFilestore::new());
        let ready = instance("fs-a", ResourceState::Ready);
        fake.insert_instance(ready.clone());
        let share = share_on(&ready, "s1", 100 * GIB);
        fake.insert_share(share.clone());
        fake.insert_running_operation(&share.key.uri(), "update");

        let mgr = manager(fake.clone());
        assert_matches!(mgr.delete_share(&share.key).await, Err(Error::Pending(_)));
        assert_eq!(fake.call_count(OpType::ShareDelete), 0);
    }
}
