//! Request-time Admission
//!
//! Entry points behind CreateVolume, DeleteVolume and ControllerExpandVolume.
//! In reconciler mode these only read and write ShareInfo records and report
//! [`Error::Pending`] until the reconciler has realized the request; callers
//! retry. With the reconciler disabled they delegate to the direct workflow.

use crate::config::{DriverConfig, PARAM_POOL_TAG, PARAM_REGION};
use crate::controlplane::volume_id::VolumeId;
use crate::crd::{remove_finalizer, InstanceInfo, ShareInfo, ShareInfoSpec, ShareStatus};
use crate::domain::model::{record_name_for_share, share_name_for_record, ShareKey};
use crate::domain::ports::{
    AccessType, CapacityRange, CreateVolumeRequest, ExpandVolumeResponse, FilestoreServiceRef,
    RecordStoreRef, Volume, VolumeCapability,
};
use crate::error::{Error, Result};
use crate::multishare::cache::OpsCache;
use crate::multishare::locks::VolumeLocks;
use crate::multishare::ops_manager::MultishareOpsManager;
use crate::multishare::sizing;
use crate::store::{update_with_retry, WriteTarget};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Pool used when a storage class does not name one
pub const DEFAULT_POOL_TAG: &str = "default";

/// Volume context key carrying the instance IP
pub const CONTEXT_IP: &str = "ip";

/// Volume context key carrying the export path
pub const CONTEXT_SHARE: &str = "share";

/// Provisioning surface for multishare volumes
pub struct MultishareController {
    config: DriverConfig,
    filestore: FilestoreServiceRef,
    shares: RecordStoreRef<ShareInfo>,
    instances: RecordStoreRef<InstanceInfo>,
    ops_manager: MultishareOpsManager,
    volume_locks: VolumeLocks,
}

impl MultishareController {
    pub fn new(
        config: DriverConfig,
        filestore: FilestoreServiceRef,
        shares: RecordStoreRef<ShareInfo>,
        instances: RecordStoreRef<InstanceInfo>,
        ops_cache: Arc<OpsCache>,
    ) -> Self {
        let volume_locks = VolumeLocks::new();
        let ops_manager = MultishareOpsManager::new(
            config.clone(),
            filestore.clone(),
            ops_cache,
            volume_locks.clone(),
        );
        Self {
            config,
            filestore,
            shares,
            instances,
            ops_manager,
            volume_locks,
        }
    }

    fn reconciler_enabled(&self) -> bool {
        self.config.multishare.reconciler_enabled
    }

    // =========================================================================
    // CreateVolume
    // =========================================================================

    /// Create or poll a multishare volume
    pub async fn create_volume(&self, req: &CreateVolumeRequest) -> Result<Volume> {
        if req.name.is_empty() {
            return Err(Error::InvalidArgument("volume name is required".into()));
        }
        // Share names map `-` to `_`, so a `_` in the name would not map back
        if req.name.contains('_') {
            return Err(Error::InvalidArgument(format!(
                "volume name {} must not contain '_'",
                req.name
            )));
        }
        let _guard = self
            .volume_locks
            .try_acquire(&req.name)
            .ok_or_else(|| Error::Aborted(req.name.clone()))?;

        validate_capabilities(&req.volume_capabilities)?;
        let capacity = sizing::share_request_capacity(req.capacity_range.as_ref(), &self.config.multishare)?;

        let pool_tag = param_or(&req.parameters, PARAM_POOL_TAG, DEFAULT_POOL_TAG);
        let region = param_or(&req.parameters, PARAM_REGION, &self.config.region());
        let record_name = req.name.to_lowercase();
        let share_name = share_name_for_record(&record_name);

        if !self.reconciler_enabled() {
            let share = self
                .ops_manager
                .setup_share(&share_name, &pool_tag, &region, capacity, &req.parameters)
                .await?;
            let instance = self
                .filestore
                .get_multishare_instance(&share.key.instance)
                .await?
                .ok_or_else(|| Error::Pending(format!("instance {} not found", share.key.instance)))?;
            let ip = instance.ip_address.unwrap_or_default();
            return volume(&pool_tag, share.key, share.capacity_bytes, &ip);
        }

        let record = match self.shares.get(&record_name).await? {
            Some(record) => record,
            None => {
                let spec = ShareInfoSpec {
                    share_name,
                    capacity_bytes: capacity,
                    instance_pool_tag: pool_tag.clone(),
                    region,
                    parameters: req.parameters.clone(),
                    labels: BTreeMap::new(),
                };
                return match self
                    .shares
                    .create(&ShareInfo::with_finalizer(&record_name, spec))
                    .await
                {
                    Ok(_) => {
                        info!(
                            "Recorded share {} ({} bytes, pool {})",
                            record_name, capacity, pool_tag
                        );
                        Err(Error::Pending(format!("share {} recorded", record_name)))
                    }
                    Err(Error::ResourceExists { .. }) => {
                        Err(Error::Pending(format!("share {} recorded", record_name)))
                    }
                    Err(e) => Err(e),
                };
            }
        };

        if record.is_deleting() {
            return Err(Error::Pending(format!("share {} is being deleted", record_name)));
        }
        if record.spec.capacity_bytes != capacity {
            return Err(Error::VolumeMismatch {
                volume: req.name.clone(),
                reason: format!(
                    "capacity {} differs from requested {}",
                    record.spec.capacity_bytes, capacity
                ),
            });
        }
        if record.spec.instance_pool_tag != pool_tag {
            return Err(Error::VolumeMismatch {
                volume: req.name.clone(),
                reason: format!(
                    "pool {} differs from requested {}",
                    record.spec.instance_pool_tag, pool_tag
                ),
            });
        }

        match record.share_status() {
            ShareStatus::Error => Err(Error::Internal(status_error(&record))),
            _ if record.is_ready() => self.ready_volume(&record).await,
            status => Err(Error::Pending(format!("share {} is {}", record_name, status))),
        }
    }

    async fn ready_volume(&self, record: &ShareInfo) -> Result<Volume> {
        let key = record
            .share_key()
            .ok_or_else(|| Error::Pending(format!("share {} is not placed", record.name())))?;
        let ip = self
            .instances
            .get(&key.instance.record_name())
            .await?
            .and_then(|i| i.status)
            .map(|s| s.ip_address)
            .unwrap_or_default();
        if ip.is_empty() {
            return Err(Error::Pending(format!(
                "instance {} has no address yet",
                key.instance
            )));
        }
        let capacity = record
            .status
            .as_ref()
            .map(|s| s.capacity_bytes)
            .unwrap_or(record.spec.capacity_bytes);
        volume(&record.spec.instance_pool_tag, key, capacity, &ip)
    }

    // =========================================================================
    // DeleteVolume
    // =========================================================================

    /// Delete a volume; succeeds once the share is confirmed gone
    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let id = VolumeId::parse(volume_id)?;
        let _guard = self
            .volume_locks
            .try_acquire(volume_id)
            .ok_or_else(|| Error::Aborted(volume_id.to_string()))?;

        if !self.reconciler_enabled() {
            return self.ops_manager.delete_share(&id.share).await;
        }

        let record_name = record_name_for_share(&id.share.share);
        let record = match self.shares.get(&record_name).await? {
            Some(record) => record,
            None => {
                return match self.filestore.get_share(&id.share).await? {
                    None => {
                        debug!("Volume {} is already gone", volume_id);
                        Ok(())
                    }
                    Some(_) => Err(Error::Pending(format!(
                        "share {} still exists without a record",
                        id.share
                    ))),
                };
            }
        };

        if !record.is_deleting() {
            info!("Marking share {} for deletion", record_name);
            self.shares.delete(&record_name).await?;
            return Err(Error::Pending(format!("share {} marked for deletion", record_name)));
        }

        if record.is_deleted() {
            update_with_retry(
                self.shares.as_ref(),
                &record_name,
                WriteTarget::Object,
                self.config.reconciler.retry_policy(),
                |current| remove_finalizer(&mut current.metadata),
            )
            .await?;
            info!("Share {} deleted, record released", record_name);
            return Ok(());
        }

        Err(Error::Pending(format!(
            "share {} is {}",
            record_name,
            record.share_status()
        )))
    }

    // =========================================================================
    // ControllerExpandVolume
    // =========================================================================

    /// Grow a volume; succeeds once the share reports the new size
    pub async fn expand_volume(
        &self,
        volume_id: &str,
        range: CapacityRange,
    ) -> Result<ExpandVolumeResponse> {
        let id = VolumeId::parse(volume_id)?;
        let _guard = self
            .volume_locks
            .try_acquire(volume_id)
            .ok_or_else(|| Error::Aborted(volume_id.to_string()))?;
        let capacity = sizing::share_request_capacity(Some(&range), &self.config.multishare)?;

        if !self.reconciler_enabled() {
            let capacity_bytes = self.ops_manager.expand_share(&id.share, capacity).await?;
            return Ok(ExpandVolumeResponse { capacity_bytes });
        }

        let record_name = record_name_for_share(&id.share.share);
        let record = self
            .shares
            .get(&record_name)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "ShareInfo".into(),
                name: record_name.clone(),
            })?;

        if record.is_deleting() {
            return Err(Error::Pending(format!("share {} is being deleted", record_name)));
        }

        if record.spec.capacity_bytes < capacity {
            info!(
                "Expanding share {} from {} to {} bytes",
                record_name, record.spec.capacity_bytes, capacity
            );
            update_with_retry(
                self.shares.as_ref(),
                &record_name,
                WriteTarget::Object,
                self.config.reconciler.retry_policy(),
                |current| {
                    if current.spec.capacity_bytes >= capacity {
                        return false;
                    }
                    current.spec.capacity_bytes = capacity;
                    true
                },
            )
            .await?;
            return Err(Error::Pending(format!("share {} expansion recorded", record_name)));
        }

        let status = record.status.clone().unwrap_or_default();
        match status.share_status {
            ShareStatus::Error => Err(Error::Internal(status_error(&record))),
            ShareStatus::Ready if status.capacity_bytes >= capacity => Ok(ExpandVolumeResponse {
                capacity_bytes: status.capacity_bytes,
            }),
            other => Err(Error::Pending(format!("share {} is {}", record_name, other))),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Multishare volumes are filesystem mounts only
fn validate_capabilities(caps: &[VolumeCapability]) -> Result<()> {
    if caps.is_empty() {
        return Err(Error::InvalidArgument("volume capabilities are required".into()));
    }
    if caps.iter().any(|c| c.access_type == AccessType::Block) {
        return Err(Error::InvalidArgument(
            "block access is not supported for multishare volumes".into(),
        ));
    }
    Ok(())
}

fn param_or(params: &BTreeMap<String, String>, name: &str, default: &str) -> String {
    params
        .get(name)
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

fn status_error(record: &ShareInfo) -> String {
    record
        .status
        .as_ref()
        .map(|s| s.error.clone())
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| format!("share {} failed", record.spec.share_name))
}

fn volume(pool_tag: &str, key: ShareKey, capacity_bytes: u64, ip: &str) -> Result<Volume> {
    let mut context = BTreeMap::new();
    context.insert(CONTEXT_IP.to_string(), ip.to_string());
    context.insert(CONTEXT_SHARE.to_string(), format!("/{}", key.share));
    Ok(Volume {
        volume_id: VolumeId::new(pool_tag, key).to_string(),
        capacity_bytes,
        volume_context: context,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::FakeFilestore;
    use crate::domain::model::{GIB, TIB};
    use crate::domain::ports::{AccessMode, RecordStore};
    use crate::error::StatusCode;
    use crate::store::MemoryRecordStore;
    use assert_matches::assert_matches;

    struct Harness {
        shares: Arc<MemoryRecordStore<ShareInfo>>,
        controller: MultishareController,
    }

    fn harness() -> Harness {
        let config = DriverConfig {
            project: "proj".into(),
            location: "us-central1-c".into(),
            cluster_name: "prod".into(),
            ..Default::default()
        };
        let shares = Arc::new(MemoryRecordStore::<ShareInfo>::new());
        let controller = MultishareController::new(
            config,
            Arc::new(FakeFilestore::new()),
            shares.clone(),
            Arc::new(MemoryRecordStore::<InstanceInfo>::new()),
            Arc::new(OpsCache::new()),
        );
        Harness { shares, controller }
    }

    fn mount() -> VolumeCapability {
        VolumeCapability {
            access_type: AccessType::Mount,
            access_mode: AccessMode::MultiNodeMultiWriter,
        }
    }

    fn request(name: &str, bytes: u64) -> CreateVolumeRequest {
        let mut parameters = BTreeMap::new();
        parameters.insert(PARAM_POOL_TAG.to_string(), "gold".to_string());
        CreateVolumeRequest {
            name: name.into(),
            capacity_range: Some(CapacityRange {
                required_bytes: bytes,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![mount()],
            parameters,
        }
    }

    #[tokio::test]
    async fn test_create_records_share_then_pends() {
        let h = harness();
        let err = h.controller.create_volume(&request("PVC-1", 150 * GIB)).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::Unavailable);

        let record = h.shares.get("pvc-1").await.unwrap().unwrap();
        assert_eq!(record.spec.share_name, "pvc_1");
        assert_eq!(record.spec.capacity_bytes, 150 * GIB);
        assert_eq!(record.spec.instance_pool_tag, "gold");
        assert_eq!(record.spec.region, "us-central1");

        // Polling again does not create a second record
        assert_matches!(
            h.controller.create_volume(&request("PVC-1", 150 * GIB)).await,
            Err(Error::Pending(_))
        );
        assert_eq!(h.shares.len(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_requests() {
        let h = harness();

        let mut block = request("pvc-1", 100 * GIB);
        block.volume_capabilities.push(VolumeCapability {
            access_type: AccessType::Block,
            access_mode: AccessMode::SingleNodeWriter,
        });
        assert_matches!(h.controller.create_volume(&block).await, Err(Error::InvalidArgument(_)));

        let mut none = request("pvc-1", 100 * GIB);
        none.volume_capabilities.clear();
        assert_matches!(h.controller.create_volume(&none).await, Err(Error::InvalidArgument(_)));

        assert_matches!(
            h.controller.create_volume(&request("pvc-1", 2 * TIB)).await,
            Err(Error::OutOfRange(_))
        );
        assert!(h.shares.is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_underscore_names() {
        let h = harness();
        let err = h.controller.create_volume(&request("pvc_1", 100 * GIB)).await.unwrap_err();
        assert_matches!(err, Error::InvalidArgument(_));
        assert_eq!(err.status_code(), StatusCode::InvalidArgument);
        assert!(h.shares.is_empty());
    }

    #[tokio::test]
    async fn test_create_mismatch_is_already_exists() {
        let h = harness();
        let _ = h.controller.create_volume(&request("pvc-1", 100 * GIB)).await;
        let err = h.controller.create_volume(&request("pvc-1", 200 * GIB)).await.unwrap_err();
        assert_matches!(err, Error::VolumeMismatch { .. });
        assert_eq!(err.status_code(), StatusCode::AlreadyExists);
    }

    #[tokio::test]
    async fn test_create_surfaces_share_error() {
        let h = harness();
        let _ = h.controller.create_volume(&request("pvc-1", 100 * GIB)).await;

        let mut record = h.shares.get("pvc-1").await.unwrap().unwrap();
        record.status_mut().share_status = ShareStatus::Error;
        record.status_mut().error = "quota exceeded".into();
        h.shares.update_status(&record).await.unwrap();

        assert_matches!(
            h.controller.create_volume(&request("pvc-1", 100 * GIB)).await,
            Err(Error::Internal(msg)) if msg == "quota exceeded"
        );
    }

    #[tokio::test]
    async fn test_concurrent_request_is_aborted() {
        let h = harness();
        let _held = h.controller.volume_locks.try_acquire("pvc-1").unwrap();
        assert_matches!(
            h.controller.create_volume(&request("pvc-1", 100 * GIB)).await,
            Err(Error::Aborted(_))
        );
    }

    #[tokio::test]
    async fn test_delete_absent_volume_twice() {
        let h = harness();
        let id = "multishare/gold/proj/us-central1/fs-1/pvc_9";
        h.controller.delete_volume(id).await.unwrap();
        h.controller.delete_volume(id).await.unwrap();

        assert_matches!(
            h.controller.delete_volume("not-a-volume").await,
            Err(Error::InvalidVolumeId(_))
        );
    }

    #[tokio::test]
    async fn test_delete_marks_then_releases() {
        let h = harness();
        let _ = h.controller.create_volume(&request("pvc-1", 100 * GIB)).await;
        let id = "multishare/gold/proj/us-central1/fs-1/pvc_1";

        assert_matches!(h.controller.delete_volume(id).await, Err(Error::Pending(_)));
        let record = h.shares.get("pvc-1").await.unwrap().unwrap();
        assert!(record.is_deleting());

        // Still deleting until the reconciler confirms
        assert_matches!(h.controller.delete_volume(id).await, Err(Error::Pending(_)));

        let mut record = record;
        record.status_mut().share_status = ShareStatus::Deleted;
        h.shares.update_status(&record).await.unwrap();

        h.controller.delete_volume(id).await.unwrap();
        assert!(h.shares.is_empty());
    }

    #[tokio::test]
    async fn test_expand_bumps_spec() {
        let h = harness();
        let _ = h.controller.create_volume(&request("pvc-1", 100 * GIB)).await;
        let id = "multishare/gold/proj/us-central1/fs-1/pvc_1";
        let range = CapacityRange {
            required_bytes: 300 * GIB,
            limit_bytes: 0,
        };

        assert_matches!(h.controller.expand_volume(id, range).await, Err(Error::Pending(_)));
        let record = h.shares.get("pvc-1").await.unwrap().unwrap();
        assert_eq!(record.spec.capacity_bytes, 300 * GIB);

        let mut record = record;
        record.status_mut().share_status = ShareStatus::Ready;
        record.status_mut().capacity_bytes = 300 * GIB;
        h.shares.update_status(&record).await.unwrap();

        let resp = h.controller.expand_volume(id, range).await.unwrap();
        assert_eq!(resp.capacity_bytes, 300 * GIB);

        assert_matches!(
            h.controller
                .expand_volume("multishare/gold/proj/us-central1/fs-1/pvc_2", range)
                .await,
            Err(Error::ResourceNotFound { .. })
        );
    }
}
