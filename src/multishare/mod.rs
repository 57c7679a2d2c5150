//! Multishare Lifecycle
//!
//! Packs many shares onto a small pool of large instances:
//! - Assignment: bin-packing over ShareInfo/InstanceInfo records
//! - Sizing: instance capacity math and pre-flight checks
//! - Reconciler: periodic loop converging records and cloud state
//! - Ops manager: direct workflow used when the reconciler is off
//! - Cache and locks: running-operation tracker and keyed mutexes

pub mod assignment;
pub mod cache;
pub mod ipalloc;
pub mod locks;
pub mod ops_manager;
pub mod reconciler;
pub mod sizing;

pub use assignment::{AssignmentEngine, AssignmentStats, RecordChanges, RecordSet};
pub use cache::{OpsCache, ShareCreateOpInfo};
pub use locks::{LockGuard, VolumeLocks};
pub use ops_manager::{EligibleInstances, MultishareOpsManager};
pub use reconciler::{MultishareReconciler, ReconcileSummary};
