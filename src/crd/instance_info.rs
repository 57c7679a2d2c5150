//! InstanceInfo CRD
//!
//! Records one backing multishare instance: the desired capacity and pool
//! (spec) and the observed state plus the shares packed onto it (status).

use kube::api::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Record;
use crate::domain::model::{InstanceKey, ResourceState};

// =============================================================================
// InstanceInfo CRD
// =============================================================================

/// InstanceInfo mirrors a multishare instance, including instances that only
/// exist as a plan because the reconciler has not created them yet.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "multishare.storage.billyronks.io",
    version = "v1",
    kind = "InstanceInfo",
    plural = "instanceinfos",
    shortname = "ii",
    status = "InstanceInfoStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name": "Instance", "type": "string", "jsonPath": ".spec.instanceName"}"#,
    printcolumn = r#"{"name": "Pool", "type": "string", "jsonPath": ".spec.poolTag"}"#,
    printcolumn = r#"{"name": "Capacity", "type": "integer", "jsonPath": ".spec.capacityBytes"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.instanceStatus"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfoSpec {
    /// Project hosting the instance
    pub project: String,

    /// Instance location (region for enterprise multishare instances)
    pub location: String,

    /// Cloud instance name
    pub instance_name: String,

    /// Desired capacity in bytes
    pub capacity_bytes: u64,

    /// Pool of shares that may be packed onto this instance
    pub pool_tag: String,

    /// Storage class parameters used to create the instance
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of an InstanceInfo
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfoStatus {
    /// Observed capacity in bytes
    #[serde(default)]
    pub capacity_bytes: u64,

    /// Instance lifecycle state
    #[serde(default)]
    pub instance_status: InstanceStatus,

    /// ShareInfo names assigned to this instance, in assignment order
    #[serde(default)]
    pub share_names: Vec<String>,

    /// Resize granularity in GiB; 0 means the platform default
    #[serde(default)]
    pub capacity_step_size_gb: u64,

    /// Mount IP address
    #[serde(default)]
    pub ip_address: String,

    /// Last surfaced cloud error
    #[serde(default)]
    pub error: String,
}

/// Instance lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Creating,
    Ready,
    Updating,
    Repairing,
    Deleting,
    Error,
    Suspended,
    #[default]
    Unknown,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Creating => write!(f, "CREATING"),
            InstanceStatus::Ready => write!(f, "READY"),
            InstanceStatus::Updating => write!(f, "UPDATING"),
            InstanceStatus::Repairing => write!(f, "REPAIRING"),
            InstanceStatus::Deleting => write!(f, "DELETING"),
            InstanceStatus::Error => write!(f, "ERROR"),
            InstanceStatus::Suspended => write!(f, "SUSPENDED"),
            InstanceStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl From<ResourceState> for InstanceStatus {
    fn from(state: ResourceState) -> Self {
        match state {
            ResourceState::Creating => InstanceStatus::Creating,
            ResourceState::Ready => InstanceStatus::Ready,
            ResourceState::Updating => InstanceStatus::Updating,
            ResourceState::Repairing => InstanceStatus::Repairing,
            ResourceState::Deleting => InstanceStatus::Deleting,
            ResourceState::Error => InstanceStatus::Error,
            ResourceState::Suspended => InstanceStatus::Suspended,
            ResourceState::Unknown => InstanceStatus::Unknown,
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl Record for InstanceInfo {
    type Status = InstanceInfoStatus;

    fn status_ref(&self) -> Option<&InstanceInfoStatus> {
        self.status.as_ref()
    }

    fn replace_status(&mut self, status: Option<InstanceInfoStatus>) {
        self.status = status;
    }
}

impl InstanceInfo {
    /// Build a fresh record for `key`, named after its URI and carrying the
    /// multishare finalizer
    pub fn for_instance(
        key: &InstanceKey,
        capacity_bytes: u64,
        pool_tag: &str,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        let name = key.record_name();
        let mut instance = InstanceInfo::new(
            &name,
            InstanceInfoSpec {
                project: key.project.clone(),
                location: key.location.clone(),
                instance_name: key.name.clone(),
                capacity_bytes,
                pool_tag: pool_tag.to_string(),
                parameters,
            },
        );
        instance.metadata = ObjectMeta {
            name: Some(name),
            finalizers: Some(vec![super::MULTISHARE_FINALIZER.to_string()]),
            ..Default::default()
        };
        instance
    }

    /// Get the record name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// Key of the cloud instance
    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(
            self.spec.project.clone(),
            self.spec.location.clone(),
            self.spec.instance_name.clone(),
        )
    }

    /// URI of the cloud instance
    pub fn uri(&self) -> String {
        self.key().uri()
    }

    /// Whether deletion has been requested
    pub fn is_deleting(&self) -> bool {
        super::is_deleting(&self.metadata)
    }

    /// Current lifecycle state
    pub fn instance_status(&self) -> InstanceStatus {
        self.status
            .as_ref()
            .map(|s| s.instance_status)
            .unwrap_or_default()
    }

    /// Assigned ShareInfo names
    pub fn share_names(&self) -> &[String] {
        self.status
            .as_ref()
            .map(|s| s.share_names.as_slice())
            .unwrap_or(&[])
    }

    /// Whether `share` is assigned here
    pub fn has_share(&self, share: &str) -> bool {
        self.share_names().iter().any(|s| s == share)
    }

    /// Assign a share; returns true if it was not already listed
    pub fn add_share(&mut self, share: &str) -> bool {
        if self.has_share(share) {
            return false;
        }
        self.status_mut().share_names.push(share.to_string());
        true
    }

    /// Unassign a share; returns true if it was listed
    pub fn remove_share(&mut self, share: &str) -> bool {
        if !self.has_share(share) {
            return false;
        }
        self.status_mut().share_names.retain(|s| s != share);
        true
    }

    /// Mutable status, created on first access
    pub fn status_mut(&mut self) -> &mut InstanceInfoStatus {
        self.status.get_or_insert_with(InstanceInfoStatus::default)
    }

    /// Last surfaced error, empty when healthy
    pub fn error(&self) -> &str {
        self.status.as_ref().map(|s| s.error.as_str()).unwrap_or("")
    }
}
