//! Multishare Operator
//!
//! Packs many NFS shares onto a small pool of large Filestore multishare
//! instances, reconciling ShareInfo/InstanceInfo records against cloud
//! state.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                        Provisioning Surface                                  │
//! │        CreateVolume / DeleteVolume / ControllerExpandVolume                  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────┐      ┌─────────────────────────────────┐   │
//! │  │  ShareInfo / InstanceInfo   │◄────►│      Multishare Reconciler      │   │
//! │  │       (record store)        │      │  assignment · sizing · op cache │   │
//! │  └─────────────────────────────┘      └────────────────┬────────────────┘   │
//! │                                                        │                    │
//! │                                       ┌────────────────┴────────────────┐   │
//! │                                       │   Filestore (instances/shares)  │   │
//! │                                       └─────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Provisioning surface and Filestore backends
//! - [`multishare`]: Assignment, sizing, reconciler and direct workflow
//! - [`crd`]: Custom Resource Definitions
//! - [`store`]: Record store adapters
//! - [`leader`]: Lease-based leader election
//! - [`domain`]: Core domain types and traits
//! - [`error`]: Error types and handling

pub mod config;
pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;
pub mod leader;
pub mod multishare;
pub mod store;

// Re-export commonly used types
pub use config::DriverConfig;

pub use controlplane::{BackendFactory, FakeFilestore, FilestoreClient, MultishareController, VolumeId};

pub use crd::{InstanceInfo, InstanceInfoSpec, InstanceInfoStatus, ShareInfo, ShareInfoSpec, ShareInfoStatus};

pub use domain::ports::{
    CapacityRange, CreateVolumeRequest, FilestoreService, LeaseLock, RecordStore, Volume,
};

pub use error::{Error, ErrorAction, Result, StatusCode};

pub use leader::{KubeLeaseLock, LeaderElector, LeaderState, MemoryLeaseLock};

pub use multishare::{MultishareOpsManager, MultishareReconciler, OpsCache, ReconcileSummary};

pub use store::{KubeRecordStore, MemoryRecordStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
