//! Domain Model
//!
//! Cloud-side resource types (multishare instances, shares, long-running
//! operations) and the keys that identify them.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Units
// =============================================================================

/// One gibibyte
pub const GIB: u64 = 1 << 30;

/// One tebibyte
pub const TIB: u64 = 1 << 40;

/// Location/instance wildcard accepted by list calls
pub const WILDCARD: &str = "-";

// =============================================================================
// Resource Keys
// =============================================================================

/// Identifies a multishare instance by project, location and name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub project: String,
    pub location: String,
    pub name: String,
}

impl InstanceKey {
    pub fn new(
        project: impl Into<String>,
        location: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            location: location.into(),
            name: name.into(),
        }
    }

    /// Key matching every instance of a project in every location
    pub fn wildcard(project: impl Into<String>) -> Self {
        Self::new(project, WILDCARD, WILDCARD)
    }

    /// Resource URI: `projects/<p>/locations/<l>/instances/<n>`
    pub fn uri(&self) -> String {
        format!(
            "projects/{}/locations/{}/instances/{}",
            self.project, self.location, self.name
        )
    }

    /// Parse an instance URI
    pub fn parse_uri(uri: &str) -> Result<Self> {
        let parts: Vec<&str> = uri.split('/').collect();
        match parts.as_slice() {
            ["projects", project, "locations", location, "instances", name]
                if !project.is_empty() && !location.is_empty() && !name.is_empty() =>
            {
                Ok(Self::new(*project, *location, *name))
            }
            _ => Err(Error::InvalidArgument(format!(
                "malformed instance URI {:?}",
                uri
            ))),
        }
    }

    /// Name of the InstanceInfo record mirroring this instance
    pub fn record_name(&self) -> String {
        format!("{}.{}.{}", self.project, self.location, self.name).to_lowercase()
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.uri())
    }
}

/// Identifies a share within a multishare instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShareKey {
    pub instance: InstanceKey,
    pub share: String,
}

impl ShareKey {
    pub fn new(instance: InstanceKey, share: impl Into<String>) -> Self {
        Self {
            instance,
            share: share.into(),
        }
    }

    /// Resource URI: `<instance uri>/shares/<s>`
    pub fn uri(&self) -> String {
        format!("{}/shares/{}", self.instance.uri(), self.share)
    }

    /// Parse a share URI
    pub fn parse_uri(uri: &str) -> Result<Self> {
        let (instance, share) = uri.rsplit_once("/shares/").ok_or_else(|| {
            Error::InvalidArgument(format!("malformed share URI {:?}", uri))
        })?;
        if share.is_empty() || share.contains('/') {
            return Err(Error::InvalidArgument(format!(
                "malformed share URI {:?}",
                uri
            )));
        }
        Ok(Self::new(InstanceKey::parse_uri(instance)?, share))
    }
}

impl std::fmt::Display for ShareKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.uri())
    }
}

/// Convert a ShareInfo record name (a volume name) to a cloud share name
pub fn share_name_for_record(record_name: &str) -> String {
    record_name.to_lowercase().replace('-', "_")
}

/// Convert a cloud share name back to its ShareInfo record name
pub fn record_name_for_share(share_name: &str) -> String {
    share_name.replace('_', "-")
}

/// Derive the region of a zonal or regional location (`us-central1-c` -> `us-central1`)
pub fn region_of(location: &str) -> String {
    let parts: Vec<&str> = location.split('-').collect();
    if parts.len() == 3 && parts[2].len() == 1 {
        format!("{}-{}", parts[0], parts[1])
    } else {
        location.to_string()
    }
}

// =============================================================================
// Cloud Resources
// =============================================================================

/// Lifecycle state reported by the cloud for instances and shares
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceState {
    Creating,
    Ready,
    Updating,
    Repairing,
    Deleting,
    Error,
    Suspended,
    #[default]
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceState::Creating => write!(f, "CREATING"),
            ResourceState::Ready => write!(f, "READY"),
            ResourceState::Updating => write!(f, "UPDATING"),
            ResourceState::Repairing => write!(f, "REPAIRING"),
            ResourceState::Deleting => write!(f, "DELETING"),
            ResourceState::Error => write!(f, "ERROR"),
            ResourceState::Suspended => write!(f, "SUSPENDED"),
            ResourceState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// A multishare-enabled storage instance as seen by the cloud
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultishareInstance {
    pub key: InstanceKey,
    /// Service tier, e.g. ENTERPRISE
    pub tier: String,
    /// VPC network name
    pub network: String,
    /// DIRECT_PEERING or PRIVATE_SERVICE_ACCESS
    pub connect_mode: String,
    /// CIDR or allocated range name used for the instance IPs
    pub reserved_ip_range: Option<String>,
    /// Mount IP, once provisioned
    pub ip_address: Option<String>,
    pub capacity_bytes: u64,
    /// Resize granularity reported by the cloud; 0 when unknown
    pub capacity_step_size_gb: u64,
    pub max_share_count: u32,
    pub state: ResourceState,
    pub labels: BTreeMap<String, String>,
}

/// A share within a multishare instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Share {
    pub key: ShareKey,
    pub capacity_bytes: u64,
    pub state: ResourceState,
    pub labels: BTreeMap<String, String>,
}

/// A long-running cloud operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Opaque operation name
    pub id: String,
    /// URI of the instance or share the operation mutates
    pub target: String,
    /// create, update or delete
    pub verb: String,
    pub done: bool,
    pub error: Option<String>,
    pub create_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

// =============================================================================
// Classified Operations
// =============================================================================

/// Kind of mutation a running operation performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    InstanceCreate,
    InstanceDelete,
    InstanceUpdate,
    ShareCreate,
    ShareDelete,
    ShareUpdate,
}

impl OpType {
    pub fn is_instance_op(&self) -> bool {
        matches!(
            self,
            OpType::InstanceCreate | OpType::InstanceDelete | OpType::InstanceUpdate
        )
    }
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpType::InstanceCreate => write!(f, "instance-create"),
            OpType::InstanceDelete => write!(f, "instance-delete"),
            OpType::InstanceUpdate => write!(f, "instance-update"),
            OpType::ShareCreate => write!(f, "share-create"),
            OpType::ShareDelete => write!(f, "share-delete"),
            OpType::ShareUpdate => write!(f, "share-update"),
        }
    }
}

/// A running (or recently failed) operation attributed to one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpInfo {
    pub id: String,
    pub op_type: OpType,
    pub target: String,
    pub err: Option<String>,
}

impl OpInfo {
    /// Classify a cloud operation by target path and verb.
    ///
    /// Returns `None` for operations on anything other than an instance or
    /// a share, and for verbs other than create/update/delete.
    pub fn from_operation(op: &Operation) -> Option<Self> {
        let is_share = if ShareKey::parse_uri(&op.target).is_ok() {
            true
        } else if InstanceKey::parse_uri(&op.target).is_ok() {
            false
        } else {
            return None;
        };

        let op_type = match (is_share, op.verb.to_lowercase().as_str()) {
            (false, "create") => OpType::InstanceCreate,
            (false, "delete") => OpType::InstanceDelete,
            (false, "update") => OpType::InstanceUpdate,
            (true, "create") => OpType::ShareCreate,
            (true, "delete") => OpType::ShareDelete,
            (true, "update") => OpType::ShareUpdate,
            _ => return None,
        };

        Some(Self {
            id: op.id.clone(),
            op_type,
            target: op.target.clone(),
            err: op.error.clone(),
        })
    }

    /// URI of the instance this operation touches (the parent for share ops)
    pub fn instance_uri(&self) -> String {
        match ShareKey::parse_uri(&self.target) {
            Ok(key) => key.instance.uri(),
            Err(_) => self.target.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(target: &str, verb: &str) -> Operation {
        Operation {
            id: "operation-1".into(),
            target: target.into(),
            verb: verb.into(),
            done: false,
            error: None,
            create_time: Utc::now(),
            end_time: None,
        }
    }

    #[test]
    fn test_instance_key_uri_round_trip() {
        let key = InstanceKey::new("proj", "us-central1", "fs-abc");
        assert_eq!(key.uri(), "projects/proj/locations/us-central1/instances/fs-abc");
        assert_eq!(InstanceKey::parse_uri(&key.uri()).unwrap(), key);
        assert_eq!(key.record_name(), "proj.us-central1.fs-abc");
        assert!(InstanceKey::parse_uri("projects/proj/locations/us-central1").is_err());
    }

    #[test]
    fn test_share_key_parse() {
        let key = ShareKey::parse_uri(
            "projects/proj/locations/us-central1/instances/fs-abc/shares/pvc_1",
        )
        .unwrap();
        assert_eq!(key.share, "pvc_1");
        assert_eq!(key.instance.name, "fs-abc");
        assert!(ShareKey::parse_uri("projects/proj/locations/l/instances/i/shares/").is_err());
    }

    #[test]
    fn test_share_name_mapping() {
        assert_eq!(share_name_for_record("pvc-1234-abcd"), "pvc_1234_abcd");
        assert_eq!(record_name_for_share("pvc_1234_abcd"), "pvc-1234-abcd");
    }

    #[test]
    fn test_region_of() {
        assert_eq!(region_of("us-central1-c"), "us-central1");
        assert_eq!(region_of("us-central1"), "us-central1");
        assert_eq!(region_of("europe-west4-a"), "europe-west4");
    }

    #[test]
    fn test_classify_operations() {
        let instance = "projects/p/locations/l/instances/i";
        let share = "projects/p/locations/l/instances/i/shares/s";

        let info = OpInfo::from_operation(&op(instance, "create")).unwrap();
        assert_eq!(info.op_type, OpType::InstanceCreate);
        assert!(info.op_type.is_instance_op());

        let info = OpInfo::from_operation(&op(share, "update")).unwrap();
        assert_eq!(info.op_type, OpType::ShareUpdate);
        assert_eq!(info.instance_uri(), instance);

        assert!(OpInfo::from_operation(&op(instance, "restore")).is_none());
        assert!(OpInfo::from_operation(&op("projects/p/locations/l/backups/b", "create")).is_none());
    }

    #[test]
    fn test_resource_state_unknown_fallback() {
        let state: ResourceState = serde_json::from_str("\"RESTORING\"").unwrap();
        assert_eq!(state, ResourceState::Unknown);
        let state: ResourceState = serde_json::from_str("\"READY\"").unwrap();
        assert_eq!(state, ResourceState::Ready);
    }
}
