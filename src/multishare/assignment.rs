//! Assignment Engine
//!
//! Bin-packing core of the reconciler. Works on an in-memory snapshot of
//! all ShareInfo and InstanceInfo records (a name-keyed arena where the
//! share/instance pointers are plain names and URIs), then reports what
//! changed so the caller can persist it.
//!
//! A pass always runs in this order:
//! 1. [`AssignmentEngine::fix_two_way_pointers`]
//! 2. [`AssignmentEngine::assign_shares`]
//! 3. [`AssignmentEngine::delete_or_resize_instances`]

use crate::config::MultishareConfig;
use crate::crd::{InstanceInfo, InstanceStatus, ShareInfo};
use crate::domain::model::InstanceKey;
use crate::multishare::sizing;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

// =============================================================================
// Record Arena
// =============================================================================

/// Snapshot of every record, plus the originals for change detection
#[derive(Debug, Clone, Default)]
pub struct RecordSet {
    pub shares: BTreeMap<String, ShareInfo>,
    pub instances: BTreeMap<String, InstanceInfo>,
    original_shares: BTreeMap<String, ShareInfo>,
    original_instances: BTreeMap<String, InstanceInfo>,
    marked_for_deletion: BTreeSet<String>,
}

/// Writes needed to persist a [`RecordSet`]
#[derive(Debug, Clone, Default)]
pub struct RecordChanges {
    /// Instances with no stored record yet
    pub new_instances: Vec<InstanceInfo>,
    /// Instances whose spec changed
    pub instance_specs: Vec<InstanceInfo>,
    /// Existing instances whose status changed
    pub instance_statuses: Vec<InstanceInfo>,
    /// Instances to mark for deletion, written after any new instance
    pub instance_deletions: Vec<String>,
    /// Shares whose status changed
    pub share_statuses: Vec<ShareInfo>,
}

impl RecordChanges {
    pub fn is_empty(&self) -> bool {
        self.new_instances.is_empty()
            && self.instance_specs.is_empty()
            && self.instance_statuses.is_empty()
            && self.instance_deletions.is_empty()
            && self.share_statuses.is_empty()
    }
}

impl RecordSet {
    pub fn new(shares: Vec<ShareInfo>, instances: Vec<InstanceInfo>) -> Self {
        let shares: BTreeMap<_, _> = shares
            .into_iter()
            .map(|s| (s.name().to_string(), s))
            .collect();
        let instances: BTreeMap<_, _> = instances
            .into_iter()
            .map(|i| (i.name().to_string(), i))
            .collect();
        Self {
            original_shares: shares.clone(),
            original_instances: instances.clone(),
            shares,
            instances,
            marked_for_deletion: BTreeSet::new(),
        }
    }

    /// Record name of the instance a URI points at
    pub fn instance_name_for_uri(uri: &str) -> Option<String> {
        InstanceKey::parse_uri(uri).ok().map(|k| k.record_name())
    }

    /// Instance record a share points at
    pub fn instance_of(&self, share: &ShareInfo) -> Option<&InstanceInfo> {
        Self::instance_name_for_uri(share.instance_handle()).and_then(|n| self.instances.get(&n))
    }

    /// Set the deletion timestamp in memory and remember to persist it
    pub fn mark_instance_for_deletion(&mut self, name: &str) {
        if let Some(instance) = self.instances.get_mut(name) {
            if instance.metadata.deletion_timestamp.is_none() {
                instance.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
                self.marked_for_deletion.insert(name.to_string());
            }
        }
    }

    /// Compare against the snapshot taken at construction
    pub fn changes(&self) -> RecordChanges {
        let mut changes = RecordChanges::default();

        for (name, instance) in &self.instances {
            match self.original_instances.get(name) {
                None => changes.new_instances.push(instance.clone()),
                Some(original) => {
                    if original.spec != instance.spec {
                        changes.instance_specs.push(instance.clone());
                    }
                    if original.status != instance.status {
                        changes.instance_statuses.push(instance.clone());
                    }
                }
            }
        }
        changes.instance_deletions = self
            .marked_for_deletion
            .iter()
            .filter(|n| self.instances.contains_key(*n))
            .cloned()
            .collect();

        for (name, share) in &self.shares {
            if let Some(original) = self.original_shares.get(name) {
                if original.status != share.status {
                    changes.share_statuses.push(share.clone());
                }
            }
        }
        changes
    }
}

// =============================================================================
// Assignment Engine
// =============================================================================

/// Counts of what one engine run did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssignmentStats {
    pub pointers_repaired: usize,
    pub shares_assigned: usize,
    pub instances_synthesized: usize,
    pub instances_marked_for_deletion: usize,
    pub instances_resized: usize,
}

/// Packs shares onto instances
pub struct AssignmentEngine {
    config: MultishareConfig,
    project: String,
}

impl AssignmentEngine {
    pub fn new(config: MultishareConfig, project: impl Into<String>) -> Self {
        Self {
            config,
            project: project.into(),
        }
    }

    /// Run repair, assignment and delete/resize in order
    pub fn run(&self, records: &mut RecordSet) -> AssignmentStats {
        let mut stats = AssignmentStats {
            pointers_repaired: self.fix_two_way_pointers(records),
            ..Default::default()
        };
        let (assigned, synthesized) = self.assign_shares(records);
        stats.shares_assigned = assigned;
        stats.instances_synthesized = synthesized;
        let (deleted, resized) = self.delete_or_resize_instances(records);
        stats.instances_marked_for_deletion = deleted;
        stats.instances_resized = resized;
        stats
    }

    /// Make share handles and instance share lists agree.
    ///
    /// The share's handle wins when both sides name something; the instance
    /// wins when the share has no handle. Returns the number of repairs.
    pub fn fix_two_way_pointers(&self, records: &mut RecordSet) -> usize {
        let mut repairs = 0;
        let instance_names: Vec<String> = records.instances.keys().cloned().collect();

        // Instance side: drop stale, duplicate and foreign claims
        for instance_name in &instance_names {
            let (uri, claimed) = match records.instances.get(instance_name) {
                Some(i) => (i.uri(), i.share_names().to_vec()),
                None => continue,
            };

            let mut kept: Vec<String> = Vec::with_capacity(claimed.len());
            for share_name in claimed {
                if kept.contains(&share_name) {
                    warn!("Instance {} lists share {} twice", instance_name, share_name);
                    continue;
                }
                let share = match records.shares.get_mut(&share_name) {
                    Some(share) => share,
                    None => {
                        warn!(
                            "Instance {} lists share {} which has no record, dropping",
                            instance_name, share_name
                        );
                        continue;
                    }
                };
                if share.is_deleted() {
                    debug!("Dropping deleted share {} from {}", share_name, instance_name);
                    continue;
                }
                if share.instance_handle().is_empty() {
                    info!(
                        "Share {} has no instance handle, pointing it at {}",
                        share_name, uri
                    );
                    share.set_instance_handle(&uri);
                    kept.push(share_name);
                    continue;
                }
                if share.instance_handle() != uri {
                    warn!(
                        "Share {} points at {} but is listed by {}, dropping claim",
                        share_name,
                        share.instance_handle(),
                        uri
                    );
                    continue;
                }
                kept.push(share_name);
            }

            if let Some(instance) = records.instances.get_mut(instance_name) {
                if kept.as_slice() != instance.share_names() {
                    repairs += 1;
                    instance.status_mut().share_names = kept;
                }
            }
        }

        // Share side: every live share with a handle is listed by its instance
        let share_names: Vec<String> = records.shares.keys().cloned().collect();
        for share_name in share_names {
            let share = &records.shares[&share_name];
            if share.is_deleted() || share.instance_handle().is_empty() {
                continue;
            }
            let key = match share.parse_instance_handle() {
                Ok(Some(key)) => key,
                Ok(None) => continue,
                Err(e) => {
                    error!("Share {} has an unusable instance handle: {}", share_name, e);
                    continue;
                }
            };

            let instance_name = key.record_name();
            if !records.instances.contains_key(&instance_name) {
                if share.is_deleting() {
                    continue;
                }
                warn!(
                    "Share {} points at {} which has no record, reconstructing it",
                    share_name, key
                );
                let instance = InstanceInfo::for_instance(
                    &key,
                    self.config.min_instance_bytes,
                    &share.spec.instance_pool_tag,
                    share.spec.parameters.clone(),
                );
                records.instances.insert(instance_name.clone(), instance);
            }

            if let Some(instance) = records.instances.get_mut(&instance_name) {
                if instance.add_share(&share_name) {
                    repairs += 1;
                }
            }
        }

        repairs
    }

    /// Whether `share` may be placed on `instance`
    pub fn instance_fit_share(&self, instance: &InstanceInfo, share: &ShareInfo) -> bool {
        !instance.is_deleting()
            && instance.spec.pool_tag == share.spec.instance_pool_tag
            && instance.share_names().len() < self.config.max_shares_per_instance
            && instance.instance_status() != InstanceStatus::Updating
    }

    /// Place every unassigned share, first fit in record-name order, creating
    /// instance records when nothing fits. Returns (assigned, synthesized).
    pub fn assign_shares(&self, records: &mut RecordSet) -> (usize, usize) {
        let mut assigned = 0;
        let mut synthesized = 0;

        let pending: Vec<String> = records
            .shares
            .values()
            .filter(|s| s.instance_handle().is_empty() && !s.is_deleting() && !s.is_deleted())
            .map(|s| s.name().to_string())
            .collect();

        for share_name in pending {
            let share = records.shares[&share_name].clone();

            let target = records
                .instances
                .values()
                .find(|i| self.instance_fit_share(i, &share))
                .map(|i| i.name().to_string());

            let instance_name = match target {
                Some(name) => name,
                None => {
                    let instance = self.synthesize_instance(&share);
                    let name = instance.name().to_string();
                    info!(
                        "No instance fits share {} in pool {}, planning new instance {}",
                        share_name,
                        share.spec.instance_pool_tag,
                        instance.uri()
                    );
                    records.instances.insert(name.clone(), instance);
                    synthesized += 1;
                    name
                }
            };

            if let Some(instance) = records.instances.get_mut(&instance_name) {
                instance.add_share(&share_name);
                let uri = instance.uri();
                if let Some(share) = records.shares.get_mut(&share_name) {
                    share.set_instance_handle(&uri);
                }
                info!("Assigned share {} to {}", share_name, uri);
                assigned += 1;
            }
        }

        (assigned, synthesized)
    }

    /// Mark empty instances for deletion and resize the rest.
    /// Returns (marked, resized).
    pub fn delete_or_resize_instances(&self, records: &mut RecordSet) -> (usize, usize) {
        let mut marked = 0;
        let mut resized = 0;
        let names: Vec<String> = records.instances.keys().cloned().collect();

        for name in names {
            let instance = &records.instances[&name];
            if instance.is_deleting() {
                continue;
            }
            if instance.share_names().is_empty() {
                info!("Instance {} has no shares, marking for deletion", name);
                records.mark_instance_for_deletion(&name);
                marked += 1;
                continue;
            }
            if let Some(capacity) = sizing::resize_instance(instance, &records.shares, &self.config)
            {
                info!(
                    "Instance {} target capacity {} -> {} bytes",
                    name, instance.spec.capacity_bytes, capacity
                );
                if let Some(instance) = records.instances.get_mut(&name) {
                    instance.spec.capacity_bytes = capacity;
                }
                resized += 1;
            }
        }

        (marked, resized)
    }

    fn synthesize_instance(&self, share: &ShareInfo) -> InstanceInfo {
        let name = format!(
            "{}-{}",
            self.config.instance_name_prefix,
            uuid::Uuid::new_v4().simple()
        );
        let key = InstanceKey::new(self.project.clone(), share.spec.region.clone(), name);
        InstanceInfo::for_instance(
            &key,
            self.config.min_instance_bytes,
            &share.spec.instance_pool_tag,
            share.spec.parameters.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ShareInfoSpec, ShareStatus};
    use crate::domain::model::{GIB, TIB};

    const PROJECT: &str = "proj";
    const REGION: &str = "us-central1";

    fn engine() -> AssignmentEngine {
        AssignmentEngine::new(MultishareConfig::default(), PROJECT)
    }

    fn share(name: &str, pool: &str) -> ShareInfo {
        ShareInfo::with_finalizer(
            name,
            ShareInfoSpec {
                share_name: name.replace('-', "_"),
                capacity_bytes: 100 * GIB,
                instance_pool_tag: pool.into(),
                region: REGION.into(),
                parameters: BTreeMap::new(),
                labels: BTreeMap::new(),
            },
        )
    }

    fn instance(name: &str, pool: &str) -> InstanceInfo {
        let key = InstanceKey::new(PROJECT, REGION, name);
        let mut i = InstanceInfo::for_instance(&key, TIB, pool, BTreeMap::new());
        i.status_mut().instance_status = InstanceStatus::Ready;
        i
    }

    fn record_name(instance_name: &str) -> String {
        InstanceKey::new(PROJECT, REGION, instance_name).record_name()
    }

    /// Every claim is backed by the share's handle and every live handle is
    /// backed by a claim
    fn assert_pointers_consistent(records: &RecordSet) {
        for (name, instance) in &records.instances {
            let mut seen = BTreeSet::new();
            for s in instance.share_names() {
                assert!(seen.insert(s.clone()), "{} listed twice on {}", s, name);
                let share = records.shares.get(s).expect("claimed share exists");
                assert!(!share.is_deleted());
                assert_eq!(share.instance_handle(), instance.uri());
            }
        }
        for (name, share) in &records.shares {
            if share.is_deleted() || share.instance_handle().is_empty() {
                continue;
            }
            let instance = records.instance_of(share).expect("handle resolves");
            assert!(instance.has_share(name), "{} not listed by its instance", name);
        }
    }

    #[test]
    fn test_assignment_picks_lowest_name_first() {
        let mut records = RecordSet::new(
            vec![share("pvc-1", "gold")],
            vec![instance("fs-b", "gold"), instance("fs-a", "gold")],
        );
        let (assigned, synthesized) = engine().assign_shares(&mut records);
        assert_eq!((assigned, synthesized), (1, 0));
        assert!(records.instances[&record_name("fs-a")].has_share("pvc-1"));
        assert!(!records.instances[&record_name("fs-b")].has_share("pvc-1"));
        assert_pointers_consistent(&records);
    }

    #[test]
    fn test_eligibility_rules() {
        let e = engine();
        let s = share("pvc-1", "gold");

        assert!(e.instance_fit_share(&instance("fs-a", "gold"), &s));
        assert!(!e.instance_fit_share(&instance("fs-a", "silver"), &s));

        let mut updating = instance("fs-a", "gold");
        updating.status_mut().instance_status = InstanceStatus::Updating;
        assert!(!e.instance_fit_share(&updating, &s));

        let mut deleting = instance("fs-a", "gold");
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(!e.instance_fit_share(&deleting, &s));

        let mut full = instance("fs-a", "gold");
        for i in 0..10 {
            full.add_share(&format!("pvc-x{}", i));
        }
        assert!(!e.instance_fit_share(&full, &s));
    }

    #[test]
    fn test_synthesizes_instance_when_nothing_fits() {
        let mut records = RecordSet::new(
            vec![share("pvc-1", "gold"), share("pvc-2", "gold")],
            vec![instance("fs-a", "silver")],
        );
        let stats = engine().run(&mut records);
        assert_eq!(stats.instances_synthesized, 1);
        assert_eq!(stats.shares_assigned, 2);

        let created: Vec<&InstanceInfo> = records
            .instances
            .values()
            .filter(|i| i.spec.pool_tag == "gold")
            .collect();
        assert_eq!(created.len(), 1);
        assert!(created[0]
            .spec
            .instance_name
            .starts_with("fs-multishare-"));
        assert_eq!(created[0].spec.location, REGION);
        assert_eq!(created[0].share_names(), ["pvc-1", "pvc-2"]);
        assert_eq!(created[0].spec.capacity_bytes, TIB);

        let changes = records.changes();
        assert_eq!(changes.new_instances.len(), 1);
        assert_eq!(changes.share_statuses.len(), 2);
        // The silver instance holds no shares
        assert_eq!(changes.instance_deletions, vec![record_name("fs-a")]);
        assert_pointers_consistent(&records);
    }

    #[test]
    fn test_instance_wins_when_share_is_silent() {
        let mut i = instance("fs-a", "gold");
        i.add_share("pvc-1");
        let mut records = RecordSet::new(vec![share("pvc-1", "gold")], vec![i]);

        engine().fix_two_way_pointers(&mut records);
        assert_eq!(
            records.shares["pvc-1"].instance_handle(),
            records.instances[&record_name("fs-a")].uri()
        );
        assert_pointers_consistent(&records);
    }

    #[test]
    fn test_share_wins_over_stale_instance() {
        let mut a = instance("fs-a", "gold");
        a.add_share("pvc-1");
        let b = instance("fs-b", "gold");
        let mut s = share("pvc-1", "gold");
        s.set_instance_handle(&b.uri());

        let mut records = RecordSet::new(vec![s], vec![a, b]);
        engine().fix_two_way_pointers(&mut records);

        assert!(!records.instances[&record_name("fs-a")].has_share("pvc-1"));
        assert!(records.instances[&record_name("fs-b")].has_share("pvc-1"));
        assert_pointers_consistent(&records);
    }

    #[test]
    fn test_missing_instance_is_reconstructed_from_handle() {
        let mut s = share("pvc-1", "gold");
        s.set_instance_handle(&InstanceKey::new(PROJECT, REGION, "fs-gone").uri());
        let mut deleting = share("pvc-2", "gold");
        deleting.set_instance_handle(&InstanceKey::new(PROJECT, REGION, "fs-other").uri());
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        let mut records = RecordSet::new(vec![s, deleting], vec![]);
        engine().fix_two_way_pointers(&mut records);

        let rebuilt = &records.instances[&record_name("fs-gone")];
        assert!(rebuilt.has_share("pvc-1"));
        assert_eq!(rebuilt.spec.pool_tag, "gold");
        assert!(!records.instances.contains_key(&record_name("fs-other")));
    }

    #[test]
    fn test_dead_and_duplicate_claims_are_dropped() {
        let mut i = instance("fs-a", "gold");
        i.status_mut().share_names = vec![
            "pvc-1".into(),
            "pvc-1".into(),
            "pvc-missing".into(),
            "pvc-2".into(),
        ];
        let mut gone = share("pvc-2", "gold");
        gone.set_instance_handle(&i.uri());
        gone.status_mut().share_status = ShareStatus::Deleted;

        let mut records = RecordSet::new(vec![share("pvc-1", "gold"), gone], vec![i]);
        engine().fix_two_way_pointers(&mut records);
        assert_eq!(
            records.instances[&record_name("fs-a")].share_names(),
            ["pvc-1"]
        );
        assert_pointers_consistent(&records);
    }

    #[test]
    fn test_pointer_repair_converges_on_random_inputs() {
        // xorshift keeps the inputs reproducible
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for _ in 0..200 {
            let instance_names = ["fs-a", "fs-b", "fs-c"];
            let mut instances: Vec<InstanceInfo> =
                instance_names.iter().map(|n| instance(n, "gold")).collect();
            let mut shares = Vec::new();

            for n in 0..6 {
                let name = format!("pvc-{}", n);
                let mut s = share(&name, "gold");
                match next() % 5 {
                    0 => {}
                    1 => s.set_instance_handle(&instances[(next() % 3) as usize].uri()),
                    2 => s.set_instance_handle(&InstanceKey::new(PROJECT, REGION, "fs-z").uri()),
                    3 => s.status_mut().share_status = ShareStatus::Deleted,
                    _ => s.metadata.deletion_timestamp = Some(Time(chrono::Utc::now())),
                }
                for instance in instances.iter_mut() {
                    if next() % 3 == 0 {
                        instance.status_mut().share_names.push(name.clone());
                    }
                }
                shares.push(s);
            }
            instances[0].status_mut().share_names.push("pvc-ghost".into());

            let mut records = RecordSet::new(shares, instances);
            engine().fix_two_way_pointers(&mut records);
            assert_pointers_consistent(&records);

            // A second run finds nothing to repair
            assert_eq!(engine().fix_two_way_pointers(&mut records), 0);
        }
    }

    #[test]
    fn test_resize_follows_assigned_shares() {
        let mut i = instance("fs-a", "gold");
        let mut shares = Vec::new();
        for n in 0..10 {
            let name = format!("pvc-{}", n);
            let mut s = share(&name, "gold");
            s.spec.capacity_bytes = 200 * GIB;
            s.set_instance_handle(&i.uri());
            i.add_share(&name);
            shares.push(s);
        }

        let mut records = RecordSet::new(shares, vec![i]);
        let (marked, resized) = engine().delete_or_resize_instances(&mut records);
        assert_eq!((marked, resized), (0, 1));
        // 2000 GiB rounded up to a 256 GiB step
        assert_eq!(
            records.instances[&record_name("fs-a")].spec.capacity_bytes,
            2048 * GIB
        );
        assert_eq!(records.changes().instance_specs.len(), 1);
    }
}
