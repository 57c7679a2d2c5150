//! Custom Resource Definitions for the Multishare Operator
//!
//! This module contains the two record types the reconciler converges:
//! - ShareInfo: one tenant share and the instance it is packed onto
//! - InstanceInfo: one backing multishare instance and the shares it hosts

pub mod instance_info;
pub mod share_info;

pub use instance_info::*;
pub use share_info::*;

use kube::api::ObjectMeta;
use kube::Resource;
use std::fmt::Debug;

/// Finalizer held on every record until its cloud resource is confirmed gone
pub const MULTISHARE_FINALIZER: &str = "multishare.storage.billyronks.io/finalizer";

/// API group shared by the record types
pub const API_GROUP: &str = "multishare.storage.billyronks.io";

// =============================================================================
// Record Trait
// =============================================================================

/// A spec/status record kept in the record store
pub trait Record: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static {
    type Status: Clone + Debug + Default + PartialEq + Send + Sync;

    /// Borrow the status sub-resource
    fn status_ref(&self) -> Option<&Self::Status>;

    /// Replace the status sub-resource
    fn replace_status(&mut self, status: Option<Self::Status>);

    /// Record kind, for errors and logs
    fn kind_name() -> String {
        Self::kind(&()).to_string()
    }

    /// Record name, empty if unset
    fn record_name(&self) -> String {
        self.meta().name.clone().unwrap_or_default()
    }
}

// =============================================================================
// Metadata Helpers
// =============================================================================

/// Whether the object has been marked for deletion
pub fn is_deleting(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

/// Whether the object carries the multishare finalizer
pub fn has_finalizer(meta: &ObjectMeta) -> bool {
    meta.finalizers
        .as_ref()
        .map(|f| f.iter().any(|name| name == MULTISHARE_FINALIZER))
        .unwrap_or(false)
}

/// Add the multishare finalizer; returns true if it was missing
pub fn add_finalizer(meta: &mut ObjectMeta) -> bool {
    if has_finalizer(meta) {
        return false;
    }
    meta.finalizers
        .get_or_insert_with(Vec::new)
        .push(MULTISHARE_FINALIZER.to_string());
    true
}

/// Remove the multishare finalizer; returns true if it was present
pub fn remove_finalizer(meta: &mut ObjectMeta) -> bool {
    if !has_finalizer(meta) {
        return false;
    }
    if let Some(finalizers) = meta.finalizers.as_mut() {
        finalizers.retain(|name| name != MULTISHARE_FINALIZER);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalizer_helpers() {
        let mut meta = ObjectMeta::default();
        assert!(!has_finalizer(&meta));
        assert!(add_finalizer(&mut meta));
        assert!(!add_finalizer(&mut meta));
        assert_eq!(meta.finalizers.as_ref().unwrap().len(), 1);
        assert!(remove_finalizer(&mut meta));
        assert!(!remove_finalizer(&mut meta));
        assert!(meta.finalizers.unwrap().is_empty());
    }
}
