//! End-to-end volume lifecycle against the in-memory Filestore and stores

use assert_matches::assert_matches;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_test::assert_ok;

use multishare_operator::config::PARAM_POOL_TAG;
use multishare_operator::controlplane::{CONTEXT_IP, CONTEXT_SHARE};
use multishare_operator::crd::{InstanceInfo, ShareInfo};
use multishare_operator::domain::model::{OpType, GIB};
use multishare_operator::domain::ports::{
    AccessMode, AccessType, CapacityRange, CreateVolumeRequest, RecordStore, Volume,
    VolumeCapability,
};
use multishare_operator::{
    DriverConfig, Error, FakeFilestore, MemoryRecordStore, MultishareController,
    MultishareReconciler, OpsCache, StatusCode,
};

struct Cluster {
    fake: Arc<FakeFilestore>,
    shares: Arc<MemoryRecordStore<ShareInfo>>,
    instances: Arc<MemoryRecordStore<InstanceInfo>>,
    controller: MultishareController,
    reconciler: Arc<MultishareReconciler>,
}

impl Cluster {
    fn new(fake: FakeFilestore, reconciler_enabled: bool) -> Self {
        let mut config = DriverConfig {
            project: "proj".into(),
            location: "us-central1-c".into(),
            cluster_name: "prod".into(),
            ..Default::default()
        };
        config.multishare.reconciler_enabled = reconciler_enabled;

        let fake = Arc::new(fake);
        let shares = Arc::new(MemoryRecordStore::<ShareInfo>::new());
        let instances = Arc::new(MemoryRecordStore::<InstanceInfo>::new());
        let ops_cache = Arc::new(OpsCache::new());
        let reconciler = MultishareReconciler::new(
            config.clone(),
            fake.clone(),
            shares.clone(),
            instances.clone(),
            ops_cache.clone(),
        );
        let controller = MultishareController::new(
            config,
            fake.clone(),
            shares.clone(),
            instances.clone(),
            ops_cache,
        );
        Self {
            fake,
            shares,
            instances,
            controller,
            reconciler,
        }
    }

    async fn passes(&self, count: usize) {
        for _ in 0..count {
            assert_ok!(self.reconciler.reconcile_once().await);
        }
    }

    /// Poll create, running a pass between attempts
    async fn provision(&self, req: &CreateVolumeRequest) -> Volume {
        for _ in 0..6 {
            match self.controller.create_volume(req).await {
                Ok(volume) => return volume,
                Err(e) => assert_eq!(e.status_code(), StatusCode::Unavailable, "{}", e),
            }
            self.passes(1).await;
        }
        panic!("volume {} never became ready", req.name);
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
        volume_capabilities: vec![VolumeCapability {
            access_type: AccessType::Mount,
            access_mode: AccessMode::MultiNodeMultiWriter,
        }],
        parameters,
    }
}

#[tokio::test]
async fn test_volume_provisioned_through_reconciler() {
    let cluster = Cluster::new(FakeFilestore::holding_operations(), true);
    let req = request("pvc-1", 100 * GIB);

    assert_matches!(cluster.controller.create_volume(&req).await, Err(Error::Pending(_)));

    // Instance create, then share create, each held until completed
    cluster.passes(1).await;
    assert_matches!(cluster.controller.create_volume(&req).await, Err(Error::Pending(_)));
    cluster.fake.complete_pending();
    cluster.passes(1).await;
    cluster.fake.complete_pending();
    cluster.passes(1).await;

    let volume = assert_ok!(cluster.controller.create_volume(&req).await);
    assert!(volume.volume_id.starts_with("multishare/gold/proj/us-central1/"));
    assert!(volume.volume_id.ends_with("/pvc_1"));
    assert_eq!(volume.capacity_bytes, 100 * GIB);
    assert_eq!(volume.volume_context[CONTEXT_SHARE], "/pvc_1");
    assert!(!volume.volume_context[CONTEXT_IP].is_empty());

    assert_eq!(cluster.fake.call_count(OpType::InstanceCreate), 1);
    assert_eq!(cluster.fake.call_count(OpType::ShareCreate), 1);
}

#[tokio::test]
async fn test_shares_share_one_instance() {
    let cluster = Cluster::new(FakeFilestore::new(), true);

    let first = cluster.provision(&request("pvc-1", 100 * GIB)).await;
    let second = cluster.provision(&request("pvc-2", 200 * GIB)).await;

    assert_eq!(cluster.instances.len(), 1);
    assert_eq!(cluster.fake.call_count(OpType::InstanceCreate), 1);
    assert_eq!(
        first.volume_context[CONTEXT_IP],
        second.volume_context[CONTEXT_IP]
    );

    // Nothing left to converge
    cluster.fake.reset_calls();
    let summary = assert_ok!(cluster.reconciler.reconcile_once().await);
    assert_eq!(summary.cloud_calls(), 0);
    assert!(cluster.fake.calls().is_empty());
}

#[tokio::test]
async fn test_volume_deleted_and_instance_released() {
    let cluster = Cluster::new(FakeFilestore::new(), true);
    let volume = cluster.provision(&request("pvc-1", 100 * GIB)).await;

    assert_matches!(
        cluster.controller.delete_volume(&volume.volume_id).await,
        Err(Error::Pending(_))
    );
    let record = cluster.shares.get("pvc-1").await.unwrap().unwrap();
    assert!(record.is_deleting());

    cluster.passes(2).await;
    assert_eq!(cluster.fake.call_count(OpType::ShareDelete), 1);
    assert_ok!(cluster.controller.delete_volume(&volume.volume_id).await);
    assert!(cluster.shares.is_empty());

    // Deleting again is a no-op
    assert_ok!(cluster.controller.delete_volume(&volume.volume_id).await);

    cluster.passes(3).await;
    assert_eq!(cluster.fake.call_count(OpType::InstanceDelete), 1);
    assert!(cluster.instances.is_empty());
}

#[tokio::test]
async fn test_volume_expanded() {
    let cluster = Cluster::new(FakeFilestore::new(), true);
    let volume = cluster.provision(&request("pvc-1", 100 * GIB)).await;
    let range = CapacityRange {
        required_bytes: 200 * GIB,
        limit_bytes: 0,
    };

    assert_matches!(
        cluster.controller.expand_volume(&volume.volume_id, range).await,
        Err(Error::Pending(_))
    );
    let record = cluster.shares.get("pvc-1").await.unwrap().unwrap();
    assert_eq!(record.spec.capacity_bytes, 200 * GIB);

    cluster.passes(2).await;
    let resp = assert_ok!(cluster.controller.expand_volume(&volume.volume_id, range).await);
    assert_eq!(resp.capacity_bytes, 200 * GIB);
    assert_eq!(cluster.fake.call_count(OpType::ShareUpdate), 1);
}

#[tokio::test]
async fn test_direct_mode_provisions_without_records() {
    let cluster = Cluster::new(FakeFilestore::new(), false);
    let req = request("pvc-1", 100 * GIB);

    let mut volume = None;
    for _ in 0..4 {
        match cluster.controller.create_volume(&req).await {
            Ok(v) => {
                volume = Some(v);
                break;
            }
            Err(e) => assert_matches!(e, Error::Pending(_)),
        }
    }
    let volume = volume.expect("direct create never completed");
    assert!(volume.volume_id.ends_with("/pvc_1"));
    assert!(!volume.volume_context[CONTEXT_IP].is_empty());
    assert!(cluster.shares.is_empty());
    assert!(cluster.instances.is_empty());

    if let Err(e) = cluster.controller.delete_volume(&volume.volume_id).await {
        assert_matches!(e, Error::Pending(_));
    }
    assert_ok!(cluster.controller.delete_volume(&volume.volume_id).await);
}
