//! Cloud Storage CSI Driver
//!
//! Kubernetes CSI driver that provisions Google Cloud Storage buckets and
//! mounts them into pods with gcsfuse.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use csi_gcs::credentials::{DEFAULT_KEY_STORAGE_PATH, KeyStore};
use csi_gcs::driver::{self, Driver, Lifecycle};
use csi_gcs::identity::{self, DRIVER_NAME, IdentityService};
use csi_gcs::metrics;
use csi_gcs::mounter::{GcsFuseMounter, Mounter};
use csi_gcs::registry::KubectlClient;
use csi_gcs::storage::{GcloudStorage, ObjectStore};
use csi_gcs::{ControllerService, NodeService};

/// CLI arguments for the CSI driver
#[derive(Parser, Debug)]
#[command(name = "csi-gcs")]
#[command(version, about = "Cloud Storage CSI Driver for Kubernetes")]
struct Args {
    /// CSI endpoint (unix socket URI)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///csi/csi.sock")]
    endpoint: String,

    /// Node name reported by NodeGetInfo (defaults to the hostname)
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Driver name
    #[arg(long, env = "DRIVER_NAME", default_value = DRIVER_NAME)]
    driver_name: String,

    /// Run in controller mode (enables controller service)
    #[arg(long, env = "CSI_CONTROLLER", default_value_t = false, action = clap::ArgAction::Set)]
    controller: bool,

    /// Run in node mode (enables node service)
    #[arg(long, env = "CSI_NODE", default_value_t = true, action = clap::ArgAction::Set)]
    node: bool,

    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Directory for service account keys taken from secrets
    #[arg(long, env = "KEY_STORAGE_PATH", default_value = DEFAULT_KEY_STORAGE_PATH)]
    key_storage_path: PathBuf,

    #[arg(long, default_value = "gcloud")]
    gcloud_path: PathBuf,

    #[arg(long, default_value = "gcsfuse")]
    gcsfuse_path: PathBuf,

    #[arg(long, default_value = "kubectl")]
    kubectl_path: PathBuf,

    /// Read claim annotations, publish readiness and record mounts
    #[arg(long, env = "CLUSTER_INTEGRATION", default_value_t = false, action = clap::ArgAction::Set)]
    cluster_integration: bool,

    /// Delete pods whose mounts were lost when the driver restarted
    #[arg(long, env = "DELETE_ORPHANED_PODS", default_value_t = false, action = clap::ArgAction::Set)]
    delete_orphaned_pods: bool,

    /// Seconds to wait for gcsfuse to mount
    #[arg(long, default_value_t = 10)]
    mount_timeout_secs: u64,

    /// Seconds allowed for snapshot and clone copies
    #[arg(long, default_value_t = 3600)]
    copy_timeout_secs: u64,

    /// Seconds allowed for emptying a bucket on DeleteVolume
    #[arg(long, default_value_t = 3600)]
    purge_timeout_secs: u64,

    /// Print build information as JSON and exit
    #[arg(long)]
    version_json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.version_json {
        println!("{}", identity::version_json()?);
        return Ok(());
    }

    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))?;
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Initialize Prometheus metrics endpoint if configured
    if let Some(addr) = args.metrics_addr
        && let Err(e) = metrics::init_metrics(addr)
    {
        return Err(format!("Failed to initialize metrics: {}", e).into());
    }

    // Determine node name
    let node_name = match args.node_name {
        Some(name) => name,
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    info!(
        driver_name = %args.driver_name,
        endpoint = %args.endpoint,
        node_name = %node_name,
        controller_mode = %args.controller,
        node_mode = %args.node,
        cluster_integration = %args.cluster_integration,
        "Starting Cloud Storage CSI Driver"
    );

    let store: Arc<dyn ObjectStore> = Arc::new(
        GcloudStorage::new(&args.gcloud_path)
            .with_purge_timeout(Duration::from_secs(args.purge_timeout_secs)),
    );
    let keys = KeyStore::new(&args.key_storage_path);
    let kubectl = args
        .cluster_integration
        .then(|| Arc::new(KubectlClient::new(&args.kubectl_path)));

    let controller = args.controller.then(|| {
        let service = ControllerService::new(store.clone(), keys.clone())
            .with_copy_timeout(Duration::from_secs(args.copy_timeout_secs));
        match &kubectl {
            Some(cluster) => service.with_cluster(cluster.clone()),
            None => service,
        }
    });

    let mounter: Arc<dyn Mounter> = Arc::new(
        GcsFuseMounter::new(&args.gcsfuse_path)
            .with_mount_timeout(Duration::from_secs(args.mount_timeout_secs)),
    );

    let mut lifecycle = None;
    let node = if args.node {
        let service = NodeService::new(node_name.clone(), mounter.clone(), store, keys);
        Some(match &kubectl {
            Some(client) => {
                lifecycle = Some(Lifecycle {
                    node_name: node_name.clone(),
                    driver_name: args.driver_name.clone(),
                    cluster: client.clone(),
                    registry: client.clone(),
                    mounter,
                    delete_orphaned_pods: args.delete_orphaned_pods,
                });
                service.with_registry(client.clone())
            }
            None => service,
        })
    } else {
        None
    };

    let driver = Driver {
        identity: IdentityService::new(args.driver_name.clone()),
        controller,
        node,
        lifecycle,
    };
    driver
        .serve(&args.endpoint, driver::shutdown_signal())
        .await?;

    info!("CSI driver shutdown complete");
    Ok(())
}
