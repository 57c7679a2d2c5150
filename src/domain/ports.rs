//! Domain Ports - Core trait definitions for the multishare operator
//!
//! These traits define the boundaries between the reconciliation logic and
//! external systems: the cloud storage API, the record store, and the lease
//! primitive used for leader election. Adapters implement these traits to
//! provide concrete functionality.

use crate::domain::model::{InstanceKey, MultishareInstance, Operation, Share, ShareKey};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Provisioning Request/Response
// =============================================================================

/// Requested capacity bounds; zero means unset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityRange {
    pub required_bytes: u64,
    pub limit_bytes: u64,
}

/// How a volume is exposed to the workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Mount,
    Block,
}

/// Access mode requested for a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

/// One requested volume capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCapability {
    pub access_type: AccessType,
    pub access_mode: AccessMode,
}

/// Request to create a multishare volume
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Volume name chosen by the provisioner (e.g. `pvc-<uuid>`)
    pub name: String,
    pub capacity_range: Option<CapacityRange>,
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage class parameters
    pub parameters: BTreeMap<String, String>,
}

/// A provisioned volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub volume_id: String,
    pub capacity_bytes: u64,
    /// Attributes handed to the node plugin (`ip`, `share`)
    pub volume_context: BTreeMap<String, String>,
}

/// Result of a successful expansion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandVolumeResponse {
    pub capacity_bytes: u64,
}

// =============================================================================
// Filestore Service Port
// =============================================================================

/// Port for the cloud storage API.
///
/// Mutations never wait for completion: they return the long-running
/// operation handle and callers discover completion through
/// [`FilestoreService::list_operations`].
#[async_trait]
pub trait FilestoreService: Send + Sync {
    /// Start creating a multishare instance
    async fn create_multishare_instance(&self, instance: &MultishareInstance) -> Result<Operation>;

    /// Start deleting a multishare instance
    async fn delete_multishare_instance(&self, key: &InstanceKey) -> Result<Operation>;

    /// Start resizing a multishare instance
    async fn resize_multishare_instance(
        &self,
        key: &InstanceKey,
        capacity_bytes: u64,
    ) -> Result<Operation>;

    /// Get an instance, `None` if absent
    async fn get_multishare_instance(&self, key: &InstanceKey)
        -> Result<Option<MultishareInstance>>;

    /// List multishare instances; `location` may be the `-` wildcard
    async fn list_multishare_instances(
        &self,
        project: &str,
        location: &str,
    ) -> Result<Vec<MultishareInstance>>;

    /// Start creating a share
    async fn create_share(&self, share: &Share) -> Result<Operation>;

    /// Start deleting a share
    async fn delete_share(&self, key: &ShareKey) -> Result<Operation>;

    /// Start resizing a share
    async fn resize_share(&self, key: &ShareKey, capacity_bytes: u64) -> Result<Operation>;

    /// Get a share, `None` if absent
    async fn get_share(&self, key: &ShareKey) -> Result<Option<Share>>;

    /// List shares under `parent`; location and name may be wildcards
    async fn list_shares(&self, parent: &InstanceKey) -> Result<Vec<Share>>;

    /// List operations (running and finished) for a project and location
    async fn list_operations(&self, project: &str, location: &str) -> Result<Vec<Operation>>;

    /// Get a single operation by name
    async fn get_operation(&self, name: &str) -> Result<Option<Operation>>;
}

// =============================================================================
// Record Store Port
// =============================================================================

/// Port for the versioned record store holding ShareInfo/InstanceInfo.
///
/// Updates are optimistic: a stale `resourceVersion` fails with
/// [`crate::Error::Conflict`]. Deleting an object that carries finalizers only
/// sets its deletion timestamp; it disappears once the last finalizer is
/// removed.
#[async_trait]
pub trait RecordStore<K>: Send + Sync {
    /// Wait until the backing cache has completed its initial list
    async fn wait_for_sync(&self) -> Result<()>;

    async fn get(&self, name: &str) -> Result<Option<K>>;

    async fn list(&self) -> Result<Vec<K>>;

    /// Create an object; status is ignored
    async fn create(&self, record: &K) -> Result<K>;

    /// Replace metadata and spec; status is ignored
    async fn update(&self, record: &K) -> Result<K>;

    /// Replace status only
    async fn update_status(&self, record: &K) -> Result<K>;

    async fn delete(&self, name: &str) -> Result<()>;
}

// =============================================================================
// Lease Port
// =============================================================================

/// Port for the lease primitive backing leader election
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Acquire the lease for `holder`, or renew it if already held.
    /// Returns `false` if another holder owns an unexpired lease.
    async fn try_acquire_or_renew(&self, holder: &str, lease_duration: Duration) -> Result<bool>;

    /// Give up the lease if `holder` owns it
    async fn release(&self, holder: &str) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type FilestoreServiceRef = Arc<dyn FilestoreService>;
pub type RecordStoreRef<K> = Arc<dyn RecordStore<K>>;
pub type LeaseLockRef = Arc<dyn LeaseLock>;
