//! ShareInfo CRD
//!
//! Records one tenant share: the desired capacity and pool it may join
//! (spec) and the instance it has been packed onto plus the observed cloud
//! state (status).

use kube::api::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Record;
use crate::domain::model::{InstanceKey, ResourceState, ShareKey};
use crate::error::Result;

// =============================================================================
// ShareInfo CRD
// =============================================================================

/// ShareInfo tracks a single share from admission until its cloud share is
/// confirmed deleted.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "multishare.storage.billyronks.io",
    version = "v1",
    kind = "ShareInfo",
    plural = "shareinfos",
    shortname = "si",
    status = "ShareInfoStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name": "Share", "type": "string", "jsonPath": ".spec.shareName"}"#,
    printcolumn = r#"{"name": "Pool", "type": "string", "jsonPath": ".spec.instancePoolTag"}"#,
    printcolumn = r#"{"name": "Capacity", "type": "integer", "jsonPath": ".spec.capacityBytes"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.shareStatus"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct ShareInfoSpec {
    /// Cloud share name
    pub share_name: String,

    /// Desired share capacity in bytes
    pub capacity_bytes: u64,

    /// Pool of instances this share may be packed onto
    pub instance_pool_tag: String,

    /// Region the share's instance must live in
    pub region: String,

    /// Storage class parameters used when a new instance is needed
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    /// Labels applied to the cloud share
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of a ShareInfo
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShareInfoStatus {
    /// URI of the assigned instance; empty until assigned
    #[serde(default)]
    pub instance_handle: String,

    /// Observed share capacity in bytes
    #[serde(default)]
    pub capacity_bytes: u64,

    /// Share lifecycle state
    #[serde(default)]
    pub share_status: ShareStatus,

    /// Last surfaced cloud error
    #[serde(default)]
    pub error: String,
}

/// Share lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShareStatus {
    Creating,
    Ready,
    Updating,
    Deleting,
    Deleted,
    Error,
    #[default]
    Unknown,
}

impl std::fmt::Display for ShareStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShareStatus::Creating => write!(f, "CREATING"),
            ShareStatus::Ready => write!(f, "READY"),
            ShareStatus::Updating => write!(f, "UPDATING"),
            ShareStatus::Deleting => write!(f, "DELETING"),
            ShareStatus::Deleted => write!(f, "DELETED"),
            ShareStatus::Error => write!(f, "ERROR"),
            ShareStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl From<ResourceState> for ShareStatus {
    fn from(state: ResourceState) -> Self {
        match state {
            ResourceState::Creating => ShareStatus::Creating,
            ResourceState::Ready => ShareStatus::Ready,
            ResourceState::Updating => ShareStatus::Updating,
            ResourceState::Deleting => ShareStatus::Deleting,
            ResourceState::Error => ShareStatus::Error,
            ResourceState::Repairing | ResourceState::Suspended | ResourceState::Unknown => {
                ShareStatus::Unknown
            }
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl Record for ShareInfo {
    type Status = ShareInfoStatus;

    fn status_ref(&self) -> Option<&ShareInfoStatus> {
        self.status.as_ref()
    }

    fn replace_status(&mut self, status: Option<ShareInfoStatus>) {
        self.status = status;
    }
}

impl ShareInfo {
    /// Build a fresh record carrying the multishare finalizer
    pub fn with_finalizer(name: &str, spec: ShareInfoSpec) -> Self {
        let mut share = ShareInfo::new(name, spec);
        share.metadata = ObjectMeta {
            name: Some(name.to_string()),
            finalizers: Some(vec![super::MULTISHARE_FINALIZER.to_string()]),
            ..Default::default()
        };
        share
    }

    /// Get the record name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// Whether deletion has been requested
    pub fn is_deleting(&self) -> bool {
        super::is_deleting(&self.metadata)
    }

    /// Assigned instance URI, empty when unassigned
    pub fn instance_handle(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.instance_handle.as_str())
            .unwrap_or("")
    }

    /// Parsed assigned instance key
    pub fn instance_key(&self) -> Option<InstanceKey> {
        let handle = self.instance_handle();
        if handle.is_empty() {
            return None;
        }
        InstanceKey::parse_uri(handle).ok()
    }

    /// Key of the cloud share, once assigned
    pub fn share_key(&self) -> Option<ShareKey> {
        self.instance_key()
            .map(|instance| ShareKey::new(instance, self.spec.share_name.clone()))
    }

    /// Current lifecycle state
    pub fn share_status(&self) -> ShareStatus {
        self.status
            .as_ref()
            .map(|s| s.share_status)
            .unwrap_or_default()
    }

    /// Whether the share is fully deleted in the cloud
    pub fn is_deleted(&self) -> bool {
        self.share_status() == ShareStatus::Deleted
    }

    /// Check if the share is ready with at least its desired capacity
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| {
                s.share_status == ShareStatus::Ready
                    && !s.instance_handle.is_empty()
                    && s.capacity_bytes >= self.spec.capacity_bytes
            })
            .unwrap_or(false)
    }

    /// Mutable status, created on first access
    pub fn status_mut(&mut self) -> &mut ShareInfoStatus {
        self.status.get_or_insert_with(ShareInfoStatus::default)
    }

    /// Point this share at an instance
    pub fn set_instance_handle(&mut self, handle: &str) {
        self.status_mut().instance_handle = handle.to_string();
    }

    /// Parse the instance handle, surfacing malformed values
    pub fn parse_instance_handle(&self) -> Result<Option<InstanceKey>> {
        let handle = self.instance_handle();
        if handle.is_empty() {
            return Ok(None);
        }
        InstanceKey::parse_uri(handle).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::GIB;

    fn spec() -> ShareInfoSpec {
        ShareInfoSpec {
            share_name: "pvc_1".into(),
            capacity_bytes: 100 * GIB,
            instance_pool_tag: "standard".into(),
            region: "us-central1".into(),
            parameters: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn test_share_ready_requires_handle_and_capacity() {
        let mut share = ShareInfo::with_finalizer("pvc-1", spec());
        assert!(!share.is_ready());
        assert!(super::super::has_finalizer(&share.metadata));

        share.status_mut().share_status = ShareStatus::Ready;
        share.status_mut().capacity_bytes = 100 * GIB;
        assert!(!share.is_ready());

        share.set_instance_handle("projects/p/locations/us-central1/instances/i");
        assert!(share.is_ready());
        assert_eq!(share.share_key().unwrap().share, "pvc_1");

        share.spec.capacity_bytes = 200 * GIB;
        assert!(!share.is_ready());
    }

    #[test]
    fn test_share_status_from_cloud_state() {
        assert_eq!(ShareStatus::from(ResourceState::Ready), ShareStatus::Ready);
        assert_eq!(ShareStatus::from(ResourceState::Repairing), ShareStatus::Unknown);
        assert_eq!(format!("{}", ShareStatus::Deleted), "DELETED");
    }
}
