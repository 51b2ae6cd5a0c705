//! Durable mount bookkeeping and cluster integration.
//!
//! The node service records every publish as a [`MountRecord`] so that a
//! restarted driver can find pods whose FUSE helper died with it. Those
//! pods are deleted and recreated by their controllers, which remounts
//! their volumes.

mod error;
mod kubectl;
mod memory;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use error::{RegistryError, Result};
pub use kubectl::KubectlClient;
pub use memory::MemoryCluster;

use crate::metrics;
use crate::mounter::{MountState, Mounter};

/// Volume context key carrying the owning pod's name.
pub const POD_NAME_CONTEXT: &str = "csi.storage.k8s.io/pod.name";
/// Volume context key carrying the owning pod's namespace.
pub const POD_NAMESPACE_CONTEXT: &str = "csi.storage.k8s.io/pod.namespace";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
}

impl PodRef {
    pub fn from_context(context: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            name: context.get(POD_NAME_CONTEXT)?.clone(),
            namespace: context.get(POD_NAMESPACE_CONTEXT)?.clone(),
        })
    }
}

/// One published volume on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountRecord {
    pub node: String,
    pub target_path: PathBuf,
    pub volume_handle: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodRef>,
}

impl MountRecord {
    pub fn name(&self) -> String {
        record_name(&self.volume_handle, &self.target_path, &self.node)
    }
}

/// Stable object name for a publish: lowercase hex CRC32 of
/// `<volume>-<target>-<node>`.
pub fn record_name(volume_id: &str, target_path: &Path, node: &str) -> String {
    let key = format!("{}-{}-{}", volume_id, target_path.display(), node);
    format!("{:x}", crc32fast::hash(key.as_bytes()))
}

#[tonic::async_trait]
pub trait MountRegistry: Send + Sync {
    /// Create or replace a record.
    async fn create(&self, record: &MountRecord) -> Result<()>;

    async fn list_for_node(&self, node: &str) -> Result<Vec<MountRecord>>;

    /// Delete by name. Deleting a missing record succeeds.
    async fn delete(&self, name: &str) -> Result<()>;
}

#[tonic::async_trait]
pub trait ClusterApi: Send + Sync {
    /// Set the `<driver>/driver-ready` node label.
    async fn set_driver_ready(&self, node: &str, driver_name: &str, ready: bool) -> Result<()>;

    /// Delete a pod without waiting. A missing pod is not an error.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn pvc_annotations(&self, namespace: &str, name: &str)
    -> Result<HashMap<String, String>>;
}

/// Label key announcing that the driver on a node is serving.
pub fn readiness_label(driver_name: &str) -> String {
    format!("{}/driver-ready", driver_name)
}

/// Update the readiness label, logging instead of failing.
pub async fn signal_readiness(cluster: &dyn ClusterApi, node: &str, driver_name: &str, ready: bool) {
    match cluster.set_driver_ready(node, driver_name, ready).await {
        Ok(()) => info!(node = %node, ready, "Updated driver readiness"),
        Err(e) => warn!(node = %node, ready, error = %e, "Failed to update driver readiness"),
    }
}

/// Outcome of an orphan sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub examined: usize,
    pub pods_deleted: usize,
    pub records_deleted: usize,
}

/// Delete pods whose mounts did not survive a driver restart.
///
/// A record is orphaned when its target is stale or gone. Healthy mounts
/// are left alone. A failed pod delete keeps the record for the next run.
pub async fn reconcile_orphans(
    node: &str,
    registry: &dyn MountRegistry,
    cluster: &dyn ClusterApi,
    mounter: &dyn Mounter,
) -> Result<ReconcileSummary> {
    let records = registry.list_for_node(node).await?;
    let mut summary = ReconcileSummary {
        examined: records.len(),
        ..Default::default()
    };
    info!(node = %node, records = records.len(), "Checking for orphaned mounts");

    for record in records {
        let target = &record.target_path;
        let state = match mounter.probe(target).await {
            Ok(state) => state,
            Err(e) => {
                warn!(target = %target.display(), error = %e, "Failed to probe mount, skipping");
                continue;
            }
        };

        match state {
            MountState::Mounted => {
                debug!(target = %target.display(), "Mount is healthy");
                continue;
            }
            MountState::Stale => {
                if let Err(e) = mounter.unmount(target).await {
                    warn!(target = %target.display(), error = %e, "Failed to clean up stale mount");
                }
            }
            MountState::NotMounted => {}
        }

        if let Some(pod) = &record.pod {
            info!(
                pod = %pod.name,
                namespace = %pod.namespace,
                volume_id = %record.volume_handle,
                "Deleting pod with orphaned mount"
            );
            if let Err(e) = cluster.delete_pod(&pod.namespace, &pod.name).await {
                warn!(pod = %pod.name, namespace = %pod.namespace, error = %e, "Failed to delete pod");
                continue;
            }
            summary.pods_deleted += 1;
            metrics::record_orphaned_pod_deleted();
        }

        match registry.delete(&record.name()).await {
            Ok(()) => summary.records_deleted += 1,
            Err(e) => warn!(record = %record.name(), error = %e, "Failed to delete mount record"),
        }
    }

    info!(
        pods_deleted = summary.pods_deleted,
        records_deleted = summary.records_deleted,
        "Orphan reconciliation finished"
    );
    Ok(summary)
}
