//! Driver Configuration
//!
//! Every tunable of the operator in one explicit struct. Loaded from an
//! optional YAML file, then overridden by command-line arguments in `main`.

use crate::domain::model::{region_of, GIB, TIB};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Label Keys
// =============================================================================

/// Label carrying the owning cluster name on cloud resources
pub const LABEL_CLUSTER_NAME: &str = "multishare_cluster_name";

/// Label carrying the owning cluster location on cloud resources
pub const LABEL_CLUSTER_LOCATION: &str = "multishare_cluster_location";

/// Label carrying the instance pool tag on cloud resources
pub const LABEL_POOL_TAG: &str = "multishare_pool_tag";

// =============================================================================
// Storage Class Parameters
// =============================================================================

/// Pool tag restricting which instances a share may join
pub const PARAM_POOL_TAG: &str = "instance-pool-tag";
pub const PARAM_TIER: &str = "tier";
pub const PARAM_NETWORK: &str = "network";
pub const PARAM_CONNECT_MODE: &str = "connect-mode";
pub const PARAM_RESERVED_IP_RANGE: &str = "reserved-ip-range";
/// Overrides the region derived from the cluster location
pub const PARAM_REGION: &str = "region";

// =============================================================================
// Configuration
// =============================================================================

/// Top-level operator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DriverConfig {
    /// Project owning the instances
    pub project: String,
    /// Cluster location (zone or region)
    pub location: String,
    /// Cluster name, stamped on every cloud resource
    pub cluster_name: String,
    pub multishare: MultishareConfig,
    pub reconciler: ReconcilerConfig,
    pub leader_election: LeaderElectionConfig,
    pub filestore: FilestoreConfig,
}

/// Packing and sizing limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MultishareConfig {
    /// Run the reconciler; when false, admission calls the cloud directly
    pub reconciler_enabled: bool,
    pub max_shares_per_instance: usize,
    pub min_instance_bytes: u64,
    pub max_instance_bytes: u64,
    pub min_share_bytes: u64,
    pub max_share_bytes: u64,
    /// Step used when an instance does not report its own
    pub default_step_bytes: u64,
    /// Prefix of generated instance names
    pub instance_name_prefix: String,
    pub default_tier: String,
    pub default_network: String,
    pub default_connect_mode: String,
}

impl Default for MultishareConfig {
    fn default() -> Self {
        Self {
            reconciler_enabled: true,
            max_shares_per_instance: 10,
            min_instance_bytes: TIB,
            max_instance_bytes: 10 * TIB,
            min_share_bytes: 100 * GIB,
            max_share_bytes: TIB,
            default_step_bytes: 256 * GIB,
            instance_name_prefix: "fs-multishare".to_string(),
            default_tier: "ENTERPRISE".to_string(),
            default_network: "default".to_string(),
            default_connect_mode: "DIRECT_PEERING".to_string(),
        }
    }
}

/// Reconciliation loop timing and retry budget
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconcilerConfig {
    pub interval_secs: u64,
    /// How long an operation that failed stays visible
    pub op_error_retention_secs: u64,
    pub conflict_retry_attempts: u32,
    pub conflict_initial_backoff_ms: u64,
    pub conflict_max_backoff_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            op_error_retention_secs: 300,
            conflict_retry_attempts: 5,
            conflict_initial_backoff_ms: 50,
            conflict_max_backoff_ms: 2_000,
        }
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn op_error_retention(&self) -> Duration {
        Duration::from_secs(self.op_error_retention_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.conflict_retry_attempts.max(1),
            initial_backoff: Duration::from_millis(self.conflict_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.conflict_max_backoff_ms),
        }
    }
}

/// Bounded exponential backoff for optimistic-concurrency conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        ReconcilerConfig::default().retry_policy()
    }
}

/// Lease-based leader election
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LeaderElectionConfig {
    pub enabled: bool,
    pub namespace: String,
    pub lease_name: String,
    /// Holder identity; a random one is generated when empty
    pub identity: String,
    pub lease_duration_secs: u64,
    pub renew_deadline_secs: u64,
    pub retry_period_secs: u64,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "kube-system".to_string(),
            lease_name: "multishare-operator".to_string(),
            identity: String::new(),
            lease_duration_secs: 15,
            renew_deadline_secs: 10,
            retry_period_secs: 2,
        }
    }
}

/// Filestore REST endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilestoreConfig {
    pub endpoint: String,
    pub api_version: String,
    /// Bearer token; omitted for emulators
    pub access_token: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for FilestoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://file.googleapis.com".to_string(),
            api_version: "v1beta1".to_string(),
            access_token: None,
            request_timeout_secs: 30,
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl DriverConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: DriverConfig = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.project.is_empty() {
            return Err(Error::Configuration("project must be set".into()));
        }
        if self.location.is_empty() {
            return Err(Error::Configuration("location must be set".into()));
        }
        if self.cluster_name.is_empty() {
            return Err(Error::Configuration("cluster name must be set".into()));
        }

        let m = &self.multishare;
        if m.default_step_bytes == 0 {
            return Err(Error::Configuration("default step must be non-zero".into()));
        }
        if m.min_instance_bytes > m.max_instance_bytes {
            return Err(Error::Configuration(format!(
                "min instance size {} exceeds max {}",
                m.min_instance_bytes, m.max_instance_bytes
            )));
        }
        if m.min_share_bytes > m.max_share_bytes {
            return Err(Error::Configuration(format!(
                "min share size {} exceeds max {}",
                m.min_share_bytes, m.max_share_bytes
            )));
        }
        if m.max_shares_per_instance == 0 {
            return Err(Error::Configuration(
                "max shares per instance must be non-zero".into(),
            ));
        }
        let full_instance = (m.max_shares_per_instance as u64).saturating_mul(m.max_share_bytes);
        if full_instance > m.max_instance_bytes {
            return Err(Error::Configuration(format!(
                "{} shares of {} bytes cannot fit in a {} byte instance",
                m.max_shares_per_instance, m.max_share_bytes, m.max_instance_bytes
            )));
        }
        if self.reconciler.interval_secs == 0 {
            return Err(Error::Configuration("reconcile interval must be non-zero".into()));
        }

        let le = &self.leader_election;
        if le.enabled && le.renew_deadline_secs >= le.lease_duration_secs {
            return Err(Error::Configuration(
                "renew deadline must be shorter than the lease duration".into(),
            ));
        }
        Ok(())
    }

    /// Region new instances are created in by default
    pub fn region(&self) -> String {
        region_of(&self.location)
    }

    /// Labels identifying resources owned by this cluster
    pub fn cluster_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_CLUSTER_NAME.to_string(), label_value(&self.cluster_name));
        labels.insert(LABEL_CLUSTER_LOCATION.to_string(), label_value(&self.location));
        labels
    }

    /// Whether a cloud resource carries this cluster's labels
    pub fn owns(&self, labels: &BTreeMap<String, String>) -> bool {
        self.cluster_labels()
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// Cloud label values allow lowercase letters, digits, `_` and `-`
pub fn label_value(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(63)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> DriverConfig {
        DriverConfig {
            project: "proj".into(),
            location: "us-central1-c".into(),
            cluster_name: "prod".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_is_valid_once_identity_is_set() {
        assert!(DriverConfig::default().validate().is_err());
        valid().validate().unwrap();
        assert_eq!(valid().region(), "us-central1");
    }

    #[test]
    fn test_validate_rejects_overpacked_instances() {
        let mut config = valid();
        config.multishare.max_shares_per_instance = 11;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let mut config = valid();
        config.multishare.default_step_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_merges_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "project: proj\nlocation: us-east1\nclusterName: blue\nmultishare:\n  maxSharesPerInstance: 5\nreconciler:\n  intervalSecs: 30\n"
        )
        .unwrap();

        let config = DriverConfig::from_file(file.path()).unwrap();
        assert_eq!(config.project, "proj");
        assert_eq!(config.multishare.max_shares_per_instance, 5);
        assert_eq!(config.multishare.min_instance_bytes, TIB);
        assert_eq!(config.reconciler.interval(), Duration::from_secs(30));
        config.validate().unwrap();
    }

    #[test]
    fn test_cluster_ownership() {
        let config = valid();
        let mut labels = config.cluster_labels();
        assert!(config.owns(&labels));
        labels.insert(LABEL_CLUSTER_NAME.into(), "other".into());
        assert!(!config.owns(&labels));
        assert!(!config.owns(&BTreeMap::new()));
    }

    #[test]
    fn test_label_value_sanitizes() {
        assert_eq!(label_value("Prod.Cluster"), "prod_cluster");
    }
}
