//! Record Stores
//!
//! Adapters for the [`RecordStore`](crate::domain::ports::RecordStore) port:
//! - Kubernetes: custom resources with a reflector cache
//! - Memory: same semantics without an API server

pub mod kubernetes;
pub mod memory;
pub mod retry;

pub use kubernetes::KubeRecordStore;
pub use memory::MemoryRecordStore;
pub use retry::{update_with_retry, WriteTarget};
