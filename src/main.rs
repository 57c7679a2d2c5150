//! Multishare Operator
//!
//! Runs the multishare reconciler for one cluster. Shares are packed onto
//! Filestore multishare instances labelled with the cluster name and
//! location; only the elected leader drives cloud mutations.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use multishare_operator::crd::{InstanceInfo, ShareInfo};
use multishare_operator::domain::ports::{LeaseLockRef, RecordStoreRef};
use multishare_operator::leader::always_leading;
use multishare_operator::{
    BackendFactory, DriverConfig, KubeLeaseLock, KubeRecordStore, LeaderElector,
    MemoryLeaseLock, MemoryRecordStore, MultishareController, MultishareReconciler, OpsCache,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Multishare Operator - packs NFS shares onto Filestore multishare instances
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(long, env = "MULTISHARE_CONFIG")]
    config: Option<PathBuf>,

    /// Project owning the instances
    #[arg(long, env = "PROJECT")]
    project: Option<String>,

    /// Cluster location (zone or region)
    #[arg(long, env = "LOCATION")]
    location: Option<String>,

    /// Cluster name stamped on cloud resources
    #[arg(long, env = "CLUSTER_NAME")]
    cluster_name: Option<String>,

    /// Filestore API endpoint
    #[arg(long, env = "FILESTORE_ENDPOINT")]
    filestore_endpoint: Option<String>,

    /// Reconcile interval in seconds
    #[arg(long, env = "RECONCILE_INTERVAL")]
    reconcile_interval_secs: Option<u64>,

    /// Disable the reconciler and provision shares directly
    #[arg(long, env = "DISABLE_RECONCILER")]
    disable_reconciler: bool,

    /// Disable leader election
    #[arg(long, env = "DISABLE_LEADER_ELECTION")]
    disable_leader_election: bool,

    /// Lease holder identity
    #[arg(long, env = "POD_NAME")]
    identity: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run in standalone mode (no Kubernetes, in-memory Filestore)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<DriverConfig> {
        let mut config = match &self.config {
            Some(path) => DriverConfig::from_file(path)?,
            None => DriverConfig::default(),
        };

        if let Some(project) = &self.project {
            config.project = project.clone();
        }
        if let Some(location) = &self.location {
            config.location = location.clone();
        }
        if let Some(cluster_name) = &self.cluster_name {
            config.cluster_name = cluster_name.clone();
        }
        if let Some(endpoint) = &self.filestore_endpoint {
            config.filestore.endpoint = endpoint.clone();
        }
        if let Some(secs) = self.reconcile_interval_secs {
            config.reconciler.interval_secs = secs;
        }
        if self.disable_reconciler {
            config.multishare.reconciler_enabled = false;
        }
        if self.disable_leader_election || self.standalone {
            config.leader_election.enabled = false;
        }
        if let Some(identity) = &self.identity {
            config.leader_election.identity = identity.clone();
        }
        if config.leader_election.identity.is_empty() {
            config.leader_election.identity = format!("multishare-{}", uuid::Uuid::new_v4());
        }

        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = args.load_config()?;

    info!("Starting Multishare Operator");
    info!("  Version: {}", multishare_operator::VERSION);
    info!("  Project: {}", config.project);
    info!("  Location: {}", config.location);
    info!("  Cluster: {}", config.cluster_name);
    info!("  Reconciler: {}", config.multishare.reconciler_enabled);
    info!("  Leader election: {}", config.leader_election.enabled);
    info!("  Standalone mode: {}", args.standalone);

    let shutdown = CancellationToken::new();

    let filestore = BackendFactory::create(&config.filestore, args.standalone)?;

    let (shares, instances, lease): (
        RecordStoreRef<ShareInfo>,
        RecordStoreRef<InstanceInfo>,
        LeaseLockRef,
    ) = if args.standalone {
        (
            Arc::new(MemoryRecordStore::<ShareInfo>::new()),
            Arc::new(MemoryRecordStore::<InstanceInfo>::new()),
            Arc::new(MemoryLeaseLock::new()),
        )
    } else {
        let client = kube::Client::try_default().await?;
        info!("Connected to Kubernetes API");
        (
            KubeRecordStore::<ShareInfo>::spawn(client.clone(), shutdown.clone()),
            KubeRecordStore::<InstanceInfo>::spawn(client.clone(), shutdown.clone()),
            Arc::new(KubeLeaseLock::new(
                client,
                &config.leader_election.namespace,
                &config.leader_election.lease_name,
            )),
        )
    };

    let ops_cache = Arc::new(OpsCache::new());
    let mut tasks = Vec::new();

    // Hold the pinned sender for the lifetime of main
    let (_pinned, pinned_rx) = always_leading();
    let leader_rx = if config.leader_election.enabled {
        let elector = LeaderElector::new(
            lease,
            config.leader_election.identity.clone(),
            &config.leader_election,
        );
        let rx = elector.subscribe();
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move { elector.run(token).await }));
        rx
    } else {
        pinned_rx
    };

    if config.multishare.reconciler_enabled {
        let reconciler = MultishareReconciler::new(
            config.clone(),
            filestore.clone(),
            shares.clone(),
            instances.clone(),
            ops_cache.clone(),
        );
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move { reconciler.run(leader_rx, token).await }));
    } else {
        info!("Reconciler disabled, shares are provisioned directly");
    }

    // The provisioning RPC server is an external collaborator; it embeds the
    // library and serves requests through this controller.
    let _controller = MultishareController::new(config, filestore, shares, instances, ops_cache);
    info!("Multishare controller ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();

    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Task failed: {}", e),
            Err(e) => warn!("Task aborted: {}", e),
        }
    }

    info!("Operator shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "reqwest=warn"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
