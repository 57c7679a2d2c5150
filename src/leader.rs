//! Leader Election
//!
//! Only one replica may mutate the cloud. Replicas race for a lease; the
//! holder renews it every retry period and steps down to standby when it
//! cannot renew within the renew deadline. The current state is published
//! on a watch channel that the reconciler consults before each pass.

use crate::config::LeaderElectionConfig;
use crate::domain::ports::{LeaseLock, LeaseLockRef};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Leader State
// =============================================================================

/// Leadership of this replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    Standby,
    Leading,
}

impl std::fmt::Display for LeaderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaderState::Standby => write!(f, "standby"),
            LeaderState::Leading => write!(f, "leading"),
        }
    }
}

// =============================================================================
// Elector
// =============================================================================

pub struct LeaderElector {
    lock: LeaseLockRef,
    identity: String,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
    state: watch::Sender<LeaderState>,
    last_renew: Mutex<Option<Instant>>,
}

impl LeaderElector {
    pub fn new(lock: LeaseLockRef, identity: impl Into<String>, config: &LeaderElectionConfig) -> Arc<Self> {
        let (state, _) = watch::channel(LeaderState::Standby);
        Arc::new(Self {
            lock,
            identity: identity.into(),
            lease_duration: Duration::from_secs(config.lease_duration_secs),
            renew_deadline: Duration::from_secs(config.renew_deadline_secs),
            retry_period: Duration::from_secs(config.retry_period_secs.max(1)),
            state,
            last_renew: Mutex::new(None),
        })
    }

    /// Receiver that follows leadership changes
    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    pub fn is_leading(&self) -> bool {
        self.state() == LeaderState::Leading
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn transition(&self, next: LeaderState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!("Leadership for {}: {} -> {}", self.identity, previous, next);
        }
    }

    /// One acquire-or-renew attempt; returns the resulting state
    pub async fn try_lead(&self) -> LeaderState {
        match self
            .lock
            .try_acquire_or_renew(&self.identity, self.lease_duration)
            .await
        {
            Ok(true) => {
                *self.last_renew.lock() = Some(Instant::now());
                self.transition(LeaderState::Leading);
            }
            Ok(false) => {
                debug!("Lease held by another replica");
                self.transition(LeaderState::Standby);
            }
            Err(e) => {
                warn!("Lease renewal failed: {}", e);
                let expired = self
                    .last_renew
                    .lock()
                    .map(|at| at.elapsed() >= self.renew_deadline)
                    .unwrap_or(true);
                if expired {
                    self.transition(LeaderState::Standby);
                }
            }
        }
        self.state()
    }

    /// Campaign until shutdown, then give the lease up
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Leader election started for {} (lease {}s, renew deadline {}s)",
            self.identity,
            self.lease_duration.as_secs(),
            self.renew_deadline.as_secs()
        );
        let mut ticker = tokio::time::interval(self.retry_period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.try_lead().await;
                }
            }
        }

        if self.is_leading() {
            if let Err(e) = self.lock.release(&self.identity).await {
                warn!("Failed to release lease: {}", e);
            }
        }
        self.transition(LeaderState::Standby);
        Ok(())
    }
}

/// Channel pinned to [`LeaderState::Leading`], for single-replica setups
pub fn always_leading() -> (watch::Sender<LeaderState>, watch::Receiver<LeaderState>) {
    watch::channel(LeaderState::Leading)
}

// =============================================================================
// Kubernetes Lease
// =============================================================================

/// Lease lock backed by a `coordination.k8s.io/v1` Lease
pub struct KubeLeaseLock {
    api: Api<Lease>,
    name: String,
}

impl KubeLeaseLock {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }
}

fn lease_expired(spec: &LeaseSpec, now: chrono::DateTime<Utc>) -> bool {
    match (&spec.renew_time, spec.lease_duration_seconds) {
        (Some(MicroTime(renewed)), Some(secs)) => {
            *renewed + chrono::Duration::seconds(i64::from(secs)) < now
        }
        _ => true,
    }
}

fn lost_race(result: std::result::Result<Lease, kube::Error>) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(false),
        Err(e) => Err(Error::Kube(e)),
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    async fn try_acquire_or_renew(&self, holder: &str, lease_duration: Duration) -> Result<bool> {
        let now = Utc::now();
        let seconds = i32::try_from(lease_duration.as_secs()).unwrap_or(i32::MAX);

        let mut lease = match self.api.get_opt(&self.name).await? {
            Some(lease) => lease,
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.name.clone()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec {
                        holder_identity: Some(holder.to_string()),
                        lease_duration_seconds: Some(seconds),
                        acquire_time: Some(MicroTime(now)),
                        renew_time: Some(MicroTime(now)),
                        lease_transitions: Some(0),
                        ..Default::default()
                    }),
                };
                return lost_race(self.api.create(&PostParams::default(), &lease).await);
            }
        };

        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        let current = spec.holder_identity.clone().unwrap_or_default();
        if current != holder {
            if !current.is_empty() && !lease_expired(spec, now) {
                return Ok(false);
            }
            debug!("Taking over lease {} from {:?}", self.name, current);
            spec.holder_identity = Some(holder.to_string());
            spec.acquire_time = Some(MicroTime(now));
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        }
        spec.renew_time = Some(MicroTime(now));
        spec.lease_duration_seconds = Some(seconds);

        lost_race(
            self.api
                .replace(&self.name, &PostParams::default(), &lease)
                .await,
        )
    }

    async fn release(&self, holder: &str) -> Result<()> {
        let mut lease = match self.api.get_opt(&self.name).await? {
            Some(lease) => lease,
            None => return Ok(()),
        };
        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        if spec.holder_identity.as_deref() != Some(holder) {
            return Ok(());
        }
        spec.holder_identity = None;
        spec.renew_time = None;
        self.api
            .replace(&self.name, &PostParams::default(), &lease)
            .await?;
        info!("Released lease {}", self.name);
        Ok(())
    }
}

// =============================================================================
// In-memory Lease
// =============================================================================

/// Process-local lease, for standalone mode and tests
#[derive(Debug, Default)]
pub struct MemoryLeaseLock {
    holder: Mutex<Option<(String, Instant)>>,
}

impl MemoryLeaseLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self) -> Option<String> {
        self.holder.lock().as_ref().map(|(h, _)| h.clone())
    }
}

#[async_trait]
impl LeaseLock for MemoryLeaseLock {
    async fn try_acquire_or_renew(&self, holder: &str, lease_duration: Duration) -> Result<bool> {
        let mut current = self.holder.lock();
        let now = Instant::now();
        match current.as_ref() {
            Some((owner, expires)) if owner != holder && *expires > now => Ok(false),
            _ => {
                *current = Some((holder.to_string(), now + lease_duration));
                Ok(true)
            }
        }
    }

    async fn release(&self, holder: &str) -> Result<()> {
        let mut current = self.holder.lock();
        if current.as_ref().map(|(owner, _)| owner == holder).unwrap_or(false) {
            *current = None;
        }
        Ok(())
    }
}
