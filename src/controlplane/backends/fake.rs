//! In-Memory Filestore
//!
//! Test double for the [`FilestoreService`] port, also used by standalone
//! mode. Operations either complete as soon as they are started or are held
//! until [`FakeFilestore::complete_pending`] runs, and failures can be
//! injected per operation kind.

use crate::domain::model::{
    InstanceKey, MultishareInstance, OpType, Operation, ResourceState, Share, ShareKey, WILDCARD,
};
use crate::domain::ports::FilestoreService;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Effect applied when a held operation completes
#[derive(Debug, Clone)]
enum Effect {
    CreateInstance(String),
    DeleteInstance(String),
    ResizeInstance(String, u64),
    CreateShare(String),
    DeleteShare(String),
    ResizeShare(String, u64),
}

#[derive(Debug, Default)]
struct FakeState {
    instances: BTreeMap<String, MultishareInstance>,
    shares: BTreeMap<String, Share>,
    operations: BTreeMap<String, Operation>,
    /// Operation id -> effect, for held operations
    pending: BTreeMap<String, Effect>,
    call_errors: HashMap<OpType, String>,
    op_errors: HashMap<OpType, String>,
    calls: Vec<(OpType, String)>,
    next_op: u64,
    next_ip: u32,
}

/// In-memory Filestore
#[derive(Debug, Default)]
pub struct FakeFilestore {
    state: Mutex<FakeState>,
    hold_operations: bool,
}

impl FakeFilestore {
    /// Fake whose operations complete immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Fake whose operations stay running until completed explicitly
    pub fn holding_operations() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            hold_operations: true,
        }
    }

    /// Make the next call of `kind` fail before starting an operation
    pub fn fail_next_call(&self, kind: OpType, message: &str) {
        self.state.lock().call_errors.insert(kind, message.to_string());
    }

    /// Make the next operation of `kind` finish with an error
    pub fn fail_next_operation(&self, kind: OpType, message: &str) {
        self.state.lock().op_errors.insert(kind, message.to_string());
    }

    /// Complete every held operation; returns how many completed
    pub fn complete_pending(&self) -> usize {
        let mut state = self.state.lock();
        let pending: Vec<(String, Effect)> = std::mem::take(&mut state.pending).into_iter().collect();
        let count = pending.len();
        for (op_id, effect) in pending {
            finish(&mut state, &op_id, effect, None);
        }
        count
    }

    /// Mutation calls made so far, in order
    pub fn calls(&self) -> Vec<(OpType, String)> {
        self.state.lock().calls.clone()
    }

    /// Number of mutation calls of `kind`
    pub fn call_count(&self, kind: OpType) -> usize {
        self.state.lock().calls.iter().filter(|(k, _)| *k == kind).count()
    }

    pub fn reset_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Insert an instance directly
    pub fn insert_instance(&self, instance: MultishareInstance) {
        self.state.lock().instances.insert(instance.key.uri(), instance);
    }

    /// Insert a share directly
    pub fn insert_share(&self, share: Share) {
        self.state.lock().shares.insert(share.key.uri(), share);
    }

    /// Remove an instance and its shares behind the operator's back
    pub fn remove_instance(&self, key: &InstanceKey) {
        let mut state = self.state.lock();
        let uri = key.uri();
        state.instances.remove(&uri);
        state.shares.retain(|_, s| s.key.instance != *key);
    }

    /// Force the state of an instance
    pub fn set_instance_state(&self, key: &InstanceKey, new_state: ResourceState) {
        if let Some(instance) = self.state.lock().instances.get_mut(&key.uri()) {
            instance.state = new_state;
        }
    }

    /// Record a running operation without a backing effect
    pub fn insert_running_operation(&self, target: &str, verb: &str) -> Operation {
        let mut state = self.state.lock();
        let project_location = op_parent(target);
        let op = new_operation(&mut state, &project_location, target, verb);
        state.operations.insert(op.id.clone(), op.clone());
        op
    }

    fn start(&self, kind: OpType, target: String, verb: &str, effect: Effect) -> Result<Operation> {
        let mut state = self.state.lock();
        state.calls.push((kind, target.clone()));
        if let Some(message) = state.call_errors.remove(&kind) {
            return Err(Error::FilestoreApi {
                status: 500,
                message,
            });
        }

        let op = new_operation(&mut state, &op_parent(&target), &target, verb);
        state.operations.insert(op.id.clone(), op.clone());
        begin(&mut state, &effect);

        let op_error = state.op_errors.remove(&kind);
        if op_error.is_some() || !self.hold_operations {
            finish(&mut state, &op.id, effect, op_error);
        } else {
            state.pending.insert(op.id.clone(), effect);
        }
        debug!("Fake {} on {} -> {}", kind, target, op.id);

        Ok(state.operations[&op.id].clone())
    }
}

fn op_parent(target: &str) -> String {
    let parts: Vec<&str> = target.split('/').collect();
    if parts.len() >= 4 {
        parts[..4].join("/")
    } else {
        target.to_string()
    }
}

fn new_operation(state: &mut FakeState, parent: &str, target: &str, verb: &str) -> Operation {
    state.next_op += 1;
    Operation {
        id: format!("{}/operations/operation-{}", parent, state.next_op),
        target: target.to_string(),
        verb: verb.to_string(),
        done: false,
        error: None,
        create_time: Utc::now(),
        end_time: None,
    }
}

/// Transitional state while an operation runs
fn begin(state: &mut FakeState, effect: &Effect) {
    match effect {
        Effect::CreateInstance(uri) | Effect::ResizeInstance(uri, _) | Effect::DeleteInstance(uri) => {
            if let Some(instance) = state.instances.get_mut(uri) {
                instance.state = match effect {
                    Effect::CreateInstance(_) => ResourceState::Creating,
                    Effect::DeleteInstance(_) => ResourceState::Deleting,
                    _ => ResourceState::Updating,
                };
            }
        }
        Effect::CreateShare(uri) | Effect::ResizeShare(uri, _) | Effect::DeleteShare(uri) => {
            if let Some(share) = state.shares.get_mut(uri) {
                share.state = match effect {
                    Effect::CreateShare(_) => ResourceState::Creating,
                    Effect::DeleteShare(_) => ResourceState::Deleting,
                    _ => ResourceState::Updating,
                };
            }
        }
    }
}

fn finish(state: &mut FakeState, op_id: &str, effect: Effect, error: Option<String>) {
    let failed = error.is_some();
    match effect {
        Effect::CreateInstance(uri) => {
            if failed {
                state.instances.remove(&uri);
            } else {
                state.next_ip += 1;
                let ip = format!("10.0.{}.{}", state.next_ip / 250, state.next_ip % 250 + 2);
                if let Some(instance) = state.instances.get_mut(&uri) {
                    instance.state = ResourceState::Ready;
                    instance.ip_address = Some(ip);
                }
            }
        }
        Effect::DeleteInstance(uri) => {
            if failed {
                if let Some(instance) = state.instances.get_mut(&uri) {
                    instance.state = ResourceState::Ready;
                }
            } else {
                state.instances.remove(&uri);
            }
        }
        Effect::ResizeInstance(uri, capacity) => {
            if let Some(instance) = state.instances.get_mut(&uri) {
                instance.state = ResourceState::Ready;
                if !failed {
                    instance.capacity_bytes = capacity;
                }
            }
        }
        Effect::CreateShare(uri) => {
            if failed {
                state.shares.remove(&uri);
            } else if let Some(share) = state.shares.get_mut(&uri) {
                share.state = ResourceState::Ready;
            }
        }
        Effect::DeleteShare(uri) => {
            if failed {
                if let Some(share) = state.shares.get_mut(&uri) {
                    share.state = ResourceState::Ready;
                }
            } else {
                state.shares.remove(&uri);
            }
        }
        Effect::ResizeShare(uri, capacity) => {
            if let Some(share) = state.shares.get_mut(&uri) {
                share.state = ResourceState::Ready;
                if !failed {
                    share.capacity_bytes = capacity;
                }
            }
        }
    }

    if let Some(op) = state.operations.get_mut(op_id) {
        op.done = true;
        op.error = error;
        op.end_time = Some(Utc::now());
    }
}

fn matches(pattern: &str, value: &str) -> bool {
    pattern == WILDCARD || pattern == value
}

fn not_found(kind: &str, name: &str) -> Error {
    Error::FilestoreApi {
        status: 404,
        message: format!("{} {} not found", kind, name),
    }
}

fn already_exists(kind: &str, name: &str) -> Error {
    Error::FilestoreApi {
        status: 409,
        message: format!("{} {} already exists", kind, name),
    }
}

#[async_trait]
impl FilestoreService for FakeFilestore {
    async fn create_multishare_instance(&self, instance: &MultishareInstance) -> Result<Operation> {
        let uri = instance.key.uri();
        {
            let mut state = self.state.lock();
            if state.instances.contains_key(&uri) {
                return Err(already_exists("instance", &uri));
            }
            let mut created = instance.clone();
            created.state = ResourceState::Creating;
            created.ip_address = None;
            state.instances.insert(uri.clone(), created);
        }
        let result = self.start(
            OpType::InstanceCreate,
            uri.clone(),
            "create",
            Effect::CreateInstance(uri.clone()),
        );
        if result.is_err() {
            self.state.lock().instances.remove(&uri);
        }
        result
    }

    async fn delete_multishare_instance(&self, key: &InstanceKey) -> Result<Operation> {
        let uri = key.uri();
        if !self.state.lock().instances.contains_key(&uri) {
            return Err(not_found("instance", &uri));
        }
        self.start(
            OpType::InstanceDelete,
            uri.clone(),
            "delete",
            Effect::DeleteInstance(uri),
        )
    }

    async fn resize_multishare_instance(
        &self,
        key: &InstanceKey,
        capacity_bytes: u64,
    ) -> Result<Operation> {
        let uri = key.uri();
        if !self.state.lock().instances.contains_key(&uri) {
            return Err(not_found("instance", &uri));
        }
        self.start(
            OpType::InstanceUpdate,
            uri.clone(),
            "update",
            Effect::ResizeInstance(uri, capacity_bytes),
        )
    }

    async fn get_multishare_instance(
        &self,
        key: &InstanceKey,
    ) -> Result<Option<MultishareInstance>> {
        Ok(self.state.lock().instances.get(&key.uri()).cloned())
    }

    async fn list_multishare_instances(
        &self,
        project: &str,
        location: &str,
    ) -> Result<Vec<MultishareInstance>> {
        Ok(self
            .state
            .lock()
            .instances
            .values()
            .filter(|i| i.key.project == project && matches(location, &i.key.location))
            .cloned()
            .collect())
    }

    async fn create_share(&self, share: &Share) -> Result<Operation> {
        let uri = share.key.uri();
        {
            let mut state = self.state.lock();
            let parent = share.key.instance.uri();
            let instance = state
                .instances
                .get(&parent)
                .ok_or_else(|| not_found("instance", &parent))?;
            let hosted = state
                .shares
                .values()
                .filter(|s| s.key.instance == share.key.instance)
                .count();
            if hosted as u32 >= instance.max_share_count {
                return Err(Error::FilestoreApi {
                    status: 400,
                    message: format!("instance {} is full", parent),
                });
            }
            if state.shares.contains_key(&uri) {
                return Err(already_exists("share", &uri));
            }
            let mut created = share.clone();
            created.state = ResourceState::Creating;
            state.shares.insert(uri.clone(), created);
        }
        let result = self.start(
            OpType::ShareCreate,
            uri.clone(),
            "create",
            Effect::CreateShare(uri.clone()),
        );
        if result.is_err() {
            self.state.lock().shares.remove(&uri);
        }
        result
    }

    async fn delete_share(&self, key: &ShareKey) -> Result<Operation> {
        let uri = key.uri();
        if !self.state.lock().shares.contains_key(&uri) {
            return Err(not_found("share", &uri));
        }
        self.start(OpType::ShareDelete, uri.clone(), "delete", Effect::DeleteShare(uri))
    }

    async fn resize_share(&self, key: &ShareKey, capacity_bytes: u64) -> Result<Operation> {
        let uri = key.uri();
        if !self.state.lock().shares.contains_key(&uri) {
            return Err(not_found("share", &uri));
        }
        self.start(
            OpType::ShareUpdate,
            uri.clone(),
            "update",
            Effect::ResizeShare(uri, capacity_bytes),
        )
    }

    async fn get_share(&self, key: &ShareKey) -> Result<Option<Share>> {
        Ok(self.state.lock().shares.get(&key.uri()).cloned())
    }

    async fn list_shares(&self, parent: &InstanceKey) -> Result<Vec<Share>> {
        Ok(self
            .state
            .lock()
            .shares
            .values()
            .filter(|s| {
                let i = &s.key.instance;
                i.project == parent.project
                    && matches(&parent.location, &i.location)
                    && matches(&parent.name, &i.name)
            })
            .cloned()
            .collect())
    }

    async fn list_operations(&self, project: &str, location: &str) -> Result<Vec<Operation>> {
        Ok(self
            .state
            .lock()
            .operations
            .values()
            .filter(|op| match InstanceKey::parse_uri(&op_instance_uri(&op.target)) {
                Ok(key) => key.project == project && matches(location, &key.location),
                Err(_) => false,
            })
            .cloned()
            .collect())
    }

    async fn get_operation(&self, name: &str) -> Result<Option<Operation>> {
        Ok(self.state.lock().operations.get(name).cloned())
    }
}

fn op_instance_uri(target: &str) -> String {
    match ShareKey::parse_uri(target) {
        Ok(key) => key.instance.uri(),
        Err(_) => target.to_string(),
    }
}
