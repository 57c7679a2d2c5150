//! Operation Tracker
//!
//! In-memory view of outstanding cloud operations, grouped per storage
//! class (pool tag). Never persisted: replaced from the operation listing
//! whenever ops are listed. Share creates are also remembered between
//! listings so a retried request finds its in-flight create.

use crate::domain::model::{OpInfo, OpType, ShareKey};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// A share create in flight, remembered by share name so retried requests
/// find the instance the share was placed on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareCreateOpInfo {
    /// URI of the instance hosting the new share
    pub instance_handle: String,
    pub op: OpInfo,
}

/// Outstanding operations of one storage class
#[derive(Debug, Clone, Default)]
struct StorageClassInfo {
    /// Keyed by instance URI
    instance_ops: HashMap<String, OpInfo>,
    /// Keyed by share name
    share_create_ops: HashMap<String, ShareCreateOpInfo>,
    /// Keyed by share URI
    share_ops: HashMap<String, OpInfo>,
}

impl StorageClassInfo {
    fn is_empty(&self) -> bool {
        self.instance_ops.is_empty() && self.share_create_ops.is_empty() && self.share_ops.is_empty()
    }
}

/// Operation tracker shared by the reconciler and the direct workflow
#[derive(Debug, Default)]
pub struct OpsCache {
    classes: RwLock<HashMap<String, StorageClassInfo>>,
}

impl OpsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole cache with `ops`, grouping each by the storage
    /// class `class_of` returns for the instance URI it touches
    pub fn rebuild<F>(&self, ops: &[OpInfo], class_of: F)
    where
        F: Fn(&str) -> String,
    {
        let mut classes: HashMap<String, StorageClassInfo> = HashMap::new();
        for op in ops {
            let class = classes.entry(class_of(&op.instance_uri())).or_default();
            insert_op(class, op.clone());
        }
        debug!("Operation tracker rebuilt with {} ops", ops.len());
        *self.classes.write() = classes;
    }

    /// Remember a share create by share name
    pub fn add_share_create_op(&self, class: &str, share_name: &str, info: ShareCreateOpInfo) {
        let mut classes = self.classes.write();
        let entry = classes.entry(class.to_string()).or_default();
        entry.share_ops.insert(info.op.target.clone(), info.op.clone());
        entry.share_create_ops.insert(share_name.to_string(), info);
    }

    /// Pending share create for `share_name` in `class`
    pub fn share_create_op(&self, class: &str, share_name: &str) -> Option<ShareCreateOpInfo> {
        self.classes
            .read()
            .get(class)
            .and_then(|c| c.share_create_ops.get(share_name).cloned())
    }

    /// Operation targeting the instance itself
    pub fn instance_op(&self, instance_uri: &str) -> Option<OpInfo> {
        self.classes
            .read()
            .values()
            .find_map(|c| c.instance_ops.get(instance_uri).cloned())
    }

    /// Operation targeting a share
    pub fn share_op(&self, share_uri: &str) -> Option<OpInfo> {
        self.classes
            .read()
            .values()
            .find_map(|c| c.share_ops.get(share_uri).cloned())
    }

    /// Every operation touching an instance: its own plus those on its shares
    pub fn ops_for_instance(&self, instance_uri: &str) -> Vec<OpInfo> {
        let classes = self.classes.read();
        let mut ops = Vec::new();
        for class in classes.values() {
            if let Some(op) = class.instance_ops.get(instance_uri) {
                ops.push(op.clone());
            }
            ops.extend(
                class
                    .share_ops
                    .values()
                    .filter(|op| op.instance_uri() == instance_uri)
                    .cloned(),
            );
        }
        ops
    }

    /// Forget an operation once it is known to be finished
    pub fn remove_op(&self, target: &str) {
        let mut classes = self.classes.write();
        for class in classes.values_mut() {
            class.instance_ops.remove(target);
            class.share_ops.remove(target);
            class.share_create_ops.retain(|_, info| info.op.target != target);
        }
        classes.retain(|_, c| !c.is_empty());
    }

    /// Total number of tracked operations
    pub fn len(&self) -> usize {
        self.classes
            .read()
            .values()
            .map(|c| c.instance_ops.len() + c.share_ops.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn insert_op(class: &mut StorageClassInfo, op: OpInfo) {
    if op.op_type.is_instance_op() {
        class.instance_ops.insert(op.target.clone(), op);
        return;
    }
    if op.op_type == OpType::ShareCreate {
        if let Ok(key) = ShareKey::parse_uri(&op.target) {
            class.share_create_ops.insert(
                key.share.clone(),
                ShareCreateOpInfo {
                    instance_handle: key.instance.uri(),
                    op: op.clone(),
                },
            );
        }
    }
    class.share_ops.insert(op.target.clone(), op);
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSTANCE: &str = "projects/p/locations/l/instances/i";

    fn op(target: &str, op_type: OpType) -> OpInfo {
        OpInfo {
            id: format!("op-{}", target.len()),
            op_type,
            target: target.to_string(),
            err: None,
        }
    }

    #[test]
    fn test_rebuild_groups_by_class() {
        let cache = OpsCache::new();
        let share = format!("{}/shares/pvc_1", INSTANCE);
        cache.rebuild(
            &[
                op(INSTANCE, OpType::InstanceUpdate),
                op(&share, OpType::ShareCreate),
            ],
            |_| "gold".to_string(),
        );

        assert_eq!(cache.len(), 2);
        assert_eq!(
            cache.instance_op(INSTANCE).unwrap().op_type,
            OpType::InstanceUpdate
        );
        let create = cache.share_create_op("gold", "pvc_1").unwrap();
        assert_eq!(create.instance_handle, INSTANCE);
        assert_eq!(cache.ops_for_instance(INSTANCE).len(), 2);
        assert!(cache.share_create_op("silver", "pvc_1").is_none());

        cache.rebuild(&[], |_| String::new());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_op_clears_every_index() {
        let cache = OpsCache::new();
        let share = format!("{}/shares/pvc_1", INSTANCE);
        cache.add_share_create_op(
            "gold",
            "pvc_1",
            ShareCreateOpInfo {
                instance_handle: INSTANCE.to_string(),
                op: op(&share, OpType::ShareCreate),
            },
        );
        assert!(cache.share_op(&share).is_some());

        cache.remove_op(&share);
        assert!(cache.share_op(&share).is_none());
        assert!(cache.share_create_op("gold", "pvc_1").is_none());
        assert!(cache.is_empty());
    }
}
