//! Multishare Reconciler
//!
//! Periodic control loop and the sole authority for cloud mutations in
//! reconciler mode. Each pass:
//!
//! 1. Lists this cluster's instances and shares in every location
//! 2. Reconstructs missing InstanceInfo records and refreshes statuses
//! 3. Flags records whose cloud resource vanished after being observed
//! 4. Runs the assignment engine (repair, assign, delete/resize)
//! 5. Rebuilds the operation tracker from running operations
//! 6. Issues at most one call per instance, then per share
//! 7. Persists every record change
//!
//! Every step is idempotent; a failed pass is retried on the next tick.

use crate::config::{
    DriverConfig, LABEL_POOL_TAG, PARAM_CONNECT_MODE, PARAM_NETWORK, PARAM_RESERVED_IP_RANGE,
    PARAM_TIER,
};
use crate::crd::{remove_finalizer, InstanceInfo, InstanceStatus, Record, ShareInfo, ShareStatus};
use crate::domain::model::{
    record_name_for_share, InstanceKey, MultishareInstance, ResourceState, Share, ShareKey,
    WILDCARD,
};
use crate::domain::ports::{FilestoreServiceRef, RecordStore, RecordStoreRef};
use crate::error::Result;
use crate::leader::LeaderState;
use crate::multishare::assignment::{AssignmentEngine, AssignmentStats, RecordSet};
use crate::multishare::cache::OpsCache;
use crate::multishare::ops_manager::{build_instance, list_running_ops, resource_labels};
use crate::multishare::sizing;
use crate::store::{update_with_retry, WriteTarget};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Pass Summary
// =============================================================================

/// What one reconcile pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub assignment: AssignmentStats,
    pub records_created: usize,
    pub records_updated: usize,
    pub instance_creates: usize,
    pub instance_deletes: usize,
    pub instance_resizes: usize,
    pub share_creates: usize,
    pub share_deletes: usize,
    pub share_resizes: usize,
    pub skipped_for_running_op: usize,
    pub finalizers_removed: usize,
    pub anomalies: usize,
}

impl ReconcileSummary {
    /// Total cloud mutations issued
    pub fn cloud_calls(&self) -> usize {
        self.instance_creates
            + self.instance_deletes
            + self.instance_resizes
            + self.share_creates
            + self.share_deletes
            + self.share_resizes
    }
}

impl std::fmt::Display for ReconcileSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} cloud calls (instances +{} -{} ~{}, shares +{} -{} ~{}), \
             {} records created, {} updated, {} skipped for running ops, \
             {} finalizers removed, {} anomalies",
            self.cloud_calls(),
            self.instance_creates,
            self.instance_deletes,
            self.instance_resizes,
            self.share_creates,
            self.share_deletes,
            self.share_resizes,
            self.records_created,
            self.records_updated,
            self.skipped_for_running_op,
            self.finalizers_removed,
            self.anomalies
        )
    }
}

// =============================================================================
// Cloud Snapshot
// =============================================================================

/// This cluster's cloud resources, keyed by URI
#[derive(Debug, Default)]
struct CloudView {
    instances: BTreeMap<String, MultishareInstance>,
    shares: BTreeMap<String, Share>,
}

impl CloudView {
    fn shares_on<'a>(&'a self, instance_uri: &'a str) -> impl Iterator<Item = &'a Share> + 'a {
        self.shares
            .values()
            .filter(move |s| s.key.instance.uri() == instance_uri)
    }

    fn share_count(&self, instance_uri: &str) -> usize {
        self.shares_on(instance_uri).count()
    }

    fn used_bytes(&self, instance_uri: &str) -> u64 {
        self.shares_on(instance_uri).map(|s| s.capacity_bytes).sum()
    }
}

/// Records that lost their cloud resource after it was observed
#[derive(Debug, Default)]
struct Anomalies {
    instances: BTreeSet<String>,
    shares: BTreeSet<String>,
}

impl Anomalies {
    fn len(&self) -> usize {
        self.instances.len() + self.shares.len()
    }
}

/// Share slots and bytes claimed by creates issued earlier in the pass
type Reservations = HashMap<String, (u32, u64)>;

// =============================================================================
// Reconciler
// =============================================================================

pub struct MultishareReconciler {
    config: DriverConfig,
    filestore: FilestoreServiceRef,
    shares: RecordStoreRef<ShareInfo>,
    instances: RecordStoreRef<InstanceInfo>,
    ops_cache: Arc<OpsCache>,
    engine: AssignmentEngine,
}

impl MultishareReconciler {
    pub fn new(
        config: DriverConfig,
        filestore: FilestoreServiceRef,
        shares: RecordStoreRef<ShareInfo>,
        instances: RecordStoreRef<InstanceInfo>,
        ops_cache: Arc<OpsCache>,
    ) -> Arc<Self> {
        let engine = AssignmentEngine::new(config.multishare.clone(), config.project.clone());
        Arc::new(Self {
            config,
            filestore,
            shares,
            instances,
            ops_cache,
            engine,
        })
    }

    /// Run passes every interval while leading, until shutdown
    pub async fn run(
        self: Arc<Self>,
        leader: watch::Receiver<LeaderState>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            synced = async {
                self.shares.wait_for_sync().await?;
                self.instances.wait_for_sync().await
            } => synced?,
            _ = shutdown.cancelled() => return Ok(()),
        }
        info!(
            "Reconciler started, interval {}s",
            self.config.reconciler.interval_secs
        );

        let mut ticker = tokio::time::interval(self.config.reconciler.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reconciler stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            if *leader.borrow() != LeaderState::Leading {
                debug!("Not leading, skipping reconcile pass");
                continue;
            }

            match self.reconcile_once().await {
                Ok(summary) => info!("Reconcile pass complete: {}", summary),
                Err(e) if e.is_retryable() => {
                    warn!("Reconcile pass failed, retrying next tick: {}", e)
                }
                Err(e) => error!("Reconcile pass failed: {}", e),
            }
        }
    }

    /// Run a single pass
    pub async fn reconcile_once(&self) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();

        let cloud = self.observe_cloud().await?;
        let mut records = RecordSet::new(self.shares.list().await?, self.instances.list().await?);

        self.sync_from_cloud(&mut records, &cloud);
        let anomalies = find_anomalies(&records, &cloud);
        summary.anomalies = anomalies.len();

        summary.assignment = self.engine.run(&mut records);

        let ops = list_running_ops(
            &self.filestore,
            &self.config.project,
            self.config.reconciler.op_error_retention(),
        )
        .await?;
        self.ops_cache.rebuild(&ops, |uri| {
            RecordSet::instance_name_for_uri(uri)
                .and_then(|name| records.instances.get(&name))
                .map(|i| i.spec.pool_tag.clone())
                .unwrap_or_default()
        });

        let mut finalizer_removals = Vec::new();
        let called = self
            .drive_instances(&mut records, &cloud, &anomalies, &mut finalizer_removals, &mut summary)
            .await;
        self.drive_shares(&mut records, &cloud, &called, &anomalies, &mut summary)
            .await;

        self.persist(&records, &finalizer_removals, &mut summary).await;
        Ok(summary)
    }

    // =========================================================================
    // Observation
    // =========================================================================

    async fn observe_cloud(&self) -> Result<CloudView> {
        let project = &self.config.project;
        let instances = self
            .filestore
            .list_multishare_instances(project, WILDCARD)
            .await?;
        let shares = self
            .filestore
            .list_shares(&InstanceKey::wildcard(project.clone()))
            .await?;

        let view = CloudView {
            instances: instances
                .into_iter()
                .filter(|i| self.config.owns(&i.labels))
                .map(|i| (i.key.uri(), i))
                .collect(),
            shares: shares
                .into_iter()
                .filter(|s| self.config.owns(&s.labels))
                .map(|s| (s.key.uri(), s))
                .collect(),
        };
        debug!(
            "Observed {} instances and {} shares",
            view.instances.len(),
            view.shares.len()
        );
        Ok(view)
    }

    /// Reconstruct missing instance records and copy observed state into
    /// statuses. Instance share lists only grow here; removals are left to
    /// pointer repair.
    fn sync_from_cloud(&self, records: &mut RecordSet, cloud: &CloudView) {
        for (uri, instance) in &cloud.instances {
            let name = instance.key.record_name();
            if !records.instances.contains_key(&name) {
                let pool_tag = instance
                    .labels
                    .get(LABEL_POOL_TAG)
                    .cloned()
                    .unwrap_or_default();
                warn!(
                    "Instance {} has no record, reconstructing it in pool {:?}",
                    uri, pool_tag
                );
                let record = InstanceInfo::for_instance(
                    &instance.key,
                    instance.capacity_bytes,
                    &pool_tag,
                    instance_parameters(instance),
                );
                records.instances.insert(name.clone(), record);
            }

            let hosted: Vec<String> = cloud
                .shares_on(uri)
                .map(|s| record_name_for_share(&s.key.share))
                .filter(|n| records.shares.contains_key(n))
                .collect();

            if let Some(record) = records.instances.get_mut(&name) {
                let status = record.status_mut();
                status.instance_status = instance.state.into();
                status.capacity_bytes = instance.capacity_bytes;
                status.capacity_step_size_gb = instance.capacity_step_size_gb;
                status.ip_address = instance.ip_address.clone().unwrap_or_default();
                for share in hosted {
                    record.add_share(&share);
                }
            }
        }

        for share in records.shares.values_mut() {
            if share.is_deleted() {
                continue;
            }
            let observed = share
                .share_key()
                .and_then(|key| cloud.shares.get(&key.uri()));
            if let Some(observed) = observed {
                let status = share.status_mut();
                status.share_status = observed.state.into();
                status.capacity_bytes = observed.capacity_bytes;
            }
        }

        for share in cloud.shares.values() {
            if !records.shares.contains_key(&record_name_for_share(&share.key.share)) {
                warn!("Share {} has no record, leaving it untouched", share.key);
            }
        }
    }

    // =========================================================================
    // Instances
    // =========================================================================

    async fn drive_instances(
        &self,
        records: &mut RecordSet,
        cloud: &CloudView,
        anomalies: &Anomalies,
        finalizer_removals: &mut Vec<String>,
        summary: &mut ReconcileSummary,
    ) -> BTreeSet<String> {
        let mut called = BTreeSet::new();
        let mut used_ranges: Vec<String> = cloud
            .instances
            .values()
            .filter_map(|i| i.reserved_ip_range.clone())
            .collect();
        let names: Vec<String> = records.instances.keys().cloned().collect();

        for name in names {
            let record = match records.instances.get(&name) {
                Some(record) => record.clone(),
                None => continue,
            };
            let key = record.key();
            let uri = key.uri();
            let observed = cloud.instances.get(&uri);

            if let Some(op) = self.ops_cache.ops_for_instance(&uri).into_iter().next() {
                debug!("{} running on {}, skipping instance {}", op.op_type, op.target, name);
                summary.skipped_for_running_op += 1;
                if let Some(err) = self.ops_cache.instance_op(&uri).and_then(|op| op.err) {
                    set_instance_error(records, &name, &err);
                }
                continue;
            }

            let outcome = if record.is_deleting() {
                match observed {
                    None => {
                        info!("Instance {} is gone, releasing record {}", uri, name);
                        finalizer_removals.push(name);
                        continue;
                    }
                    Some(o) if o.state != ResourceState::Deleting && cloud.share_count(&uri) == 0 => {
                        info!("Deleting instance {}", uri);
                        summary.instance_deletes += 1;
                        called.insert(uri.clone());
                        self.filestore
                            .delete_multishare_instance(&key)
                            .await
                            .map(|_| Some(InstanceStatus::Deleting))
                    }
                    Some(_) => {
                        debug!("Instance {} still has shares, deferring delete", uri);
                        continue;
                    }
                }
            } else if observed.is_none() {
                if anomalies.instances.contains(&name) {
                    continue;
                }
                summary.instance_creates += 1;
                called.insert(uri.clone());
                self.create_instance(&record, &mut used_ranges)
                    .await
                    .map(|_| Some(InstanceStatus::Creating))
            } else if let Some(o) = observed.filter(|o| {
                o.state == ResourceState::Ready && o.capacity_bytes != record.spec.capacity_bytes
            }) {
                info!(
                    "Resizing instance {} from {} to {} bytes",
                    uri, o.capacity_bytes, record.spec.capacity_bytes
                );
                summary.instance_resizes += 1;
                called.insert(uri.clone());
                self.filestore
                    .resize_multishare_instance(&key, record.spec.capacity_bytes)
                    .await
                    .map(|_| Some(InstanceStatus::Updating))
            } else {
                Ok(None)
            };

            match outcome {
                Ok(next) => {
                    if let Some(instance) = records.instances.get_mut(&name) {
                        let status = instance.status_mut();
                        if let Some(next) = next {
                            status.instance_status = next;
                        }
                        status.error.clear();
                    }
                }
                Err(e) => {
                    warn!("Call on instance {} failed: {}", uri, e);
                    set_instance_error(records, &name, &e.to_string());
                }
            }
        }
        called
    }

    async fn create_instance(&self, record: &InstanceInfo, used_ranges: &mut Vec<String>) -> Result<()> {
        let instance = build_instance(
            &self.config,
            record.key(),
            record.spec.capacity_bytes,
            &record.spec.pool_tag,
            &record.spec.parameters,
            used_ranges,
        )?;
        info!(
            "Creating instance {} with {} bytes in pool {}",
            instance.key, instance.capacity_bytes, record.spec.pool_tag
        );
        self.filestore.create_multishare_instance(&instance).await?;
        if let Some(range) = instance.reserved_ip_range {
            used_ranges.push(range);
        }
        Ok(())
    }

    // =========================================================================
    // Shares
    // =========================================================================

    async fn drive_shares(
        &self,
        records: &mut RecordSet,
        cloud: &CloudView,
        called_instances: &BTreeSet<String>,
        anomalies: &Anomalies,
        summary: &mut ReconcileSummary,
    ) {
        let mut reserved = Reservations::new();
        let names: Vec<String> = records.shares.keys().cloned().collect();

        for name in names {
            let share = match records.shares.get(&name) {
                Some(share) if !share.is_deleted() => share.clone(),
                _ => continue,
            };
            let key = match share.share_key() {
                Some(key) => key,
                None => {
                    if share.is_deleting() {
                        info!("Share {} was never placed, marking it DELETED", name);
                        mark_share_deleted(records, &name, None);
                    }
                    continue;
                }
            };
            let share_uri = key.uri();
            let instance_uri = key.instance.uri();
            let observed = cloud.shares.get(&share_uri);

            if share.is_deleting() && observed.is_none() {
                info!("Share {} is gone, marking {} DELETED", share_uri, name);
                mark_share_deleted(records, &name, Some(&key.instance));
                continue;
            }

            if let Some(op) = self
                .ops_cache
                .share_op(&share_uri)
                .or_else(|| self.ops_cache.instance_op(&instance_uri))
            {
                debug!("{} running on {}, skipping share {}", op.op_type, op.target, name);
                summary.skipped_for_running_op += 1;
                if let Some(err) = &op.err {
                    set_share_failed(records, &name, err);
                }
                continue;
            }

            // The instance call issued above is not listed as an op until next pass
            if called_instances.contains(&instance_uri) {
                debug!("Instance {} was just called, deferring share {}", instance_uri, name);
                if !share.is_deleting() && observed.is_none() && !anomalies.shares.contains(&name) {
                    propagate_instance_state(records, &name);
                }
                continue;
            }

            let outcome = if share.is_deleting() {
                match observed {
                    Some(o) if o.state != ResourceState::Deleting => {
                        info!("Deleting share {}", share_uri);
                        summary.share_deletes += 1;
                        self.filestore
                            .delete_share(&key)
                            .await
                            .map(|_| Some(ShareStatus::Deleting))
                    }
                    _ => continue,
                }
            } else if observed.is_none() {
                if anomalies.shares.contains(&name) {
                    continue;
                }
                if !self.has_room(cloud, &instance_uri, 1, share.spec.capacity_bytes, &reserved) {
                    debug!("Instance {} cannot take share {} yet", instance_uri, name);
                    propagate_instance_state(records, &name);
                    continue;
                }
                summary.share_creates += 1;
                let created = self.create_share(&share, key).await;
                if created.is_ok() {
                    let entry = reserved.entry(instance_uri).or_default();
                    entry.0 += 1;
                    entry.1 += share.spec.capacity_bytes;
                }
                created.map(|_| Some(ShareStatus::Creating))
            } else if let Some(o) = observed.filter(|o| {
                o.state == ResourceState::Ready && o.capacity_bytes < share.spec.capacity_bytes
            }) {
                let extra = share.spec.capacity_bytes - o.capacity_bytes;
                if !self.has_room(cloud, &instance_uri, 0, extra, &reserved) {
                    debug!(
                        "Instance {} needs to grow before share {} can",
                        instance_uri, name
                    );
                    continue;
                }
                info!(
                    "Resizing share {} from {} to {} bytes",
                    share_uri, o.capacity_bytes, share.spec.capacity_bytes
                );
                summary.share_resizes += 1;
                let resized = self
                    .filestore
                    .resize_share(&key, share.spec.capacity_bytes)
                    .await;
                if resized.is_ok() {
                    reserved.entry(instance_uri).or_default().1 += extra;
                }
                resized.map(|_| Some(ShareStatus::Updating))
            } else {
                Ok(None)
            };

            if let Some(record) = records.shares.get_mut(&name) {
                match outcome {
                    Ok(next) => {
                        let status = record.status_mut();
                        if let Some(next) = next {
                            status.share_status = next;
                        }
                        status.error.clear();
                    }
                    Err(e) => {
                        warn!("Call on share {} failed: {}", share_uri, e);
                        let message = e.to_string();
                        let status = record.status_mut();
                        if status.error != message {
                            status.error = message;
                        }
                    }
                }
            }
        }
    }

    async fn create_share(&self, record: &ShareInfo, key: ShareKey) -> Result<()> {
        let mut labels = resource_labels(&self.config, &record.spec.instance_pool_tag);
        for (k, v) in &record.spec.labels {
            labels.entry(k.clone()).or_insert_with(|| v.clone());
        }
        let share = Share {
            key,
            capacity_bytes: record.spec.capacity_bytes,
            state: ResourceState::Unknown,
            labels,
        };
        info!(
            "Creating share {} with {} bytes",
            share.key, share.capacity_bytes
        );
        self.filestore.create_share(&share).await?;
        Ok(())
    }

    /// Whether a READY instance can take `new_shares` more shares and
    /// `extra_bytes` more capacity without growing
    fn has_room(
        &self,
        cloud: &CloudView,
        instance_uri: &str,
        new_shares: u32,
        extra_bytes: u64,
        reserved: &Reservations,
    ) -> bool {
        let instance = match cloud.instances.get(instance_uri) {
            Some(i) if i.state == ResourceState::Ready => i,
            _ => return false,
        };
        let (reserved_count, reserved_bytes) = reserved.get(instance_uri).copied().unwrap_or_default();
        let max_shares = if instance.max_share_count == 0 {
            self.config.multishare.max_shares_per_instance as u32
        } else {
            instance.max_share_count
        };
        let count = cloud.share_count(instance_uri) as u32 + reserved_count;
        if count + new_shares > max_shares {
            return false;
        }
        let used = cloud.used_bytes(instance_uri) + reserved_bytes;
        sizing::instance_needs_expand(instance.capacity_bytes, used, extra_bytes).is_none()
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    async fn persist(
        &self,
        records: &RecordSet,
        finalizer_removals: &[String],
        summary: &mut ReconcileSummary,
    ) {
        let changes = records.changes();
        if changes.is_empty() && finalizer_removals.is_empty() {
            return;
        }
        let policy = self.config.reconciler.retry_policy();

        for instance in &changes.new_instances {
            match self.instances.create(instance).await {
                Ok(_) => {
                    summary.records_created += 1;
                    if write_status(self.instances.as_ref(), instance, policy).await {
                        summary.records_updated += 1;
                    }
                }
                Err(e) => warn!("Failed to create InstanceInfo {}: {}", instance.name(), e),
            }
        }

        for instance in &changes.instance_specs {
            let spec = instance.spec.clone();
            let written = update_with_retry(
                self.instances.as_ref(),
                instance.name(),
                WriteTarget::Object,
                policy,
                |current| {
                    if current.spec == spec {
                        return false;
                    }
                    current.spec = spec.clone();
                    true
                },
            )
            .await;
            match written {
                Ok(_) => summary.records_updated += 1,
                Err(e) => warn!("Failed to update InstanceInfo {}: {}", instance.name(), e),
            }
        }

        for instance in &changes.instance_statuses {
            if write_status(self.instances.as_ref(), instance, policy).await {
                summary.records_updated += 1;
            }
        }

        for name in &changes.instance_deletions {
            if let Err(e) = self.instances.delete(name).await {
                warn!("Failed to mark InstanceInfo {} for deletion: {}", name, e);
            }
        }

        for share in &changes.share_statuses {
            if write_status(self.shares.as_ref(), share, policy).await {
                summary.records_updated += 1;
            }
        }

        for name in finalizer_removals {
            let removed = update_with_retry(
                self.instances.as_ref(),
                name,
                WriteTarget::Object,
                policy,
                |current| remove_finalizer(&mut current.metadata),
            )
            .await;
            match removed {
                Ok(_) => summary.finalizers_removed += 1,
                Err(e) => warn!("Failed to release InstanceInfo {}: {}", name, e),
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Storage class parameters recovered from a live instance
fn instance_parameters(instance: &MultishareInstance) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert(PARAM_TIER.to_string(), instance.tier.clone());
    params.insert(PARAM_NETWORK.to_string(), instance.network.clone());
    params.insert(PARAM_CONNECT_MODE.to_string(), instance.connect_mode.clone());
    if let Some(range) = &instance.reserved_ip_range {
        params.insert(PARAM_RESERVED_IP_RANGE.to_string(), range.clone());
    }
    params
}

/// Live records whose cloud resource disappeared after reaching READY.
/// These are logged and left alone rather than recreated.
fn find_anomalies(records: &RecordSet, cloud: &CloudView) -> Anomalies {
    let mut anomalies = Anomalies::default();

    for (name, instance) in &records.instances {
        if instance.is_deleting() || cloud.instances.contains_key(&instance.uri()) {
            continue;
        }
        if matches!(
            instance.instance_status(),
            InstanceStatus::Ready
                | InstanceStatus::Updating
                | InstanceStatus::Repairing
                | InstanceStatus::Suspended
        ) {
            error!(
                "Instance {} was {} but is missing from the cloud, possibly deleted out of band",
                instance.uri(),
                instance.instance_status()
            );
            anomalies.instances.insert(name.clone());
        }
    }

    for (name, share) in &records.shares {
        if share.is_deleting() {
            continue;
        }
        let key = match share.share_key() {
            Some(key) => key,
            None => continue,
        };
        if cloud.shares.contains_key(&key.uri()) {
            continue;
        }
        if matches!(share.share_status(), ShareStatus::Ready | ShareStatus::Updating) {
            error!(
                "Share {} was {} but is missing from the cloud, possibly deleted out of band",
                key,
                share.share_status()
            );
            anomalies.shares.insert(name.clone());
        }
    }

    anomalies
}

fn set_instance_error(records: &mut RecordSet, name: &str, message: &str) {
    if let Some(instance) = records.instances.get_mut(name) {
        if instance.error() != message {
            instance.status_mut().error = message.to_string();
        }
    }
}

fn set_share_failed(records: &mut RecordSet, name: &str, message: &str) {
    if let Some(share) = records.shares.get_mut(name) {
        let status = share.status_mut();
        status.share_status = ShareStatus::Error;
        if status.error != message {
            status.error = message.to_string();
        }
    }
}

/// A share waiting on its instance reflects the instance's error, if any
fn propagate_instance_state(records: &mut RecordSet, name: &str) {
    let instance_error = records
        .shares
        .get(name)
        .and_then(|share| records.instance_of(share))
        .map(|instance| instance.error().to_string())
        .unwrap_or_default();

    if let Some(share) = records.shares.get_mut(name) {
        let status = share.status_mut();
        if instance_error.is_empty() {
            status.share_status = ShareStatus::Creating;
            status.error.clear();
        } else {
            status.share_status = ShareStatus::Error;
            status.error = instance_error;
        }
    }
}

fn mark_share_deleted(records: &mut RecordSet, name: &str, instance: Option<&InstanceKey>) {
    if let Some(share) = records.shares.get_mut(name) {
        let status = share.status_mut();
        status.share_status = ShareStatus::Deleted;
        status.error.clear();
    }
    if let Some(key) = instance {
        if let Some(record) = records.instances.get_mut(&key.record_name()) {
            record.remove_share(name);
        }
    }
}

/// Write `record`'s in-memory status over the stored one
async fn write_status<K: Record>(
    store: &dyn RecordStore<K>,
    record: &K,
    policy: crate::config::RetryPolicy,
) -> bool {
    let desired = record.status_ref().cloned();
    let name = record.record_name();
    let written = update_with_retry(store, &name, WriteTarget::Status, policy, |current| {
        if current.status_ref() == desired.as_ref() {
            return false;
        }
        current.replace_status(desired.clone());
        true
    })
    .await;

    match written {
        Ok(_) => true,
        Err(e) => {
            warn!("Failed to write {} {} status: {}", K::kind_name(), name, e);
            false
        }
    }
}
