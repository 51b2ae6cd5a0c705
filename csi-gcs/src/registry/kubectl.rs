use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::error::{RegistryError, Result};
use super::{ClusterApi, MountRecord, MountRegistry, readiness_label};
use crate::exec::Invocation;

const API_VERSION: &str = "gcs.csi.io/v1beta1";
const KIND: &str = "PublishedVolume";
const RESOURCE: &str = "publishedvolumes.gcs.csi.io";
/// Label selecting the records that belong to a node.
pub const NODE_LABEL: &str = "gcs.csi.io/node";

const KUBECTL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishedVolume {
    api_version: String,
    kind: String,
    metadata: ObjectMeta,
    spec: MountRecord,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    annotations: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(default)]
    metadata: ObjectMeta,
}

impl PublishedVolume {
    fn new(record: &MountRecord) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ObjectMeta {
                name: record.name(),
                labels: BTreeMap::from([(NODE_LABEL.to_string(), record.node.clone())]),
                annotations: HashMap::new(),
            },
            spec: record.clone(),
        }
    }
}

/// Cluster access through the `kubectl` binary and its in-cluster config.
#[derive(Debug, Clone)]
pub struct KubectlClient {
    binary: PathBuf,
}

impl KubectlClient {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn kubectl(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<String> {
        let mut invocation = Invocation::new(&self.binary)
            .args(args)
            .timeout(KUBECTL_TIMEOUT);
        if let Some(data) = stdin {
            invocation = invocation.stdin(data);
        }
        let output = invocation.run().await?;

        if !output.success {
            if output.stderr.contains("NotFound") {
                return Err(RegistryError::NotFound(output.stderr));
            }
            return Err(RegistryError::CommandFailed(output.stderr));
        }
        Ok(output.stdout)
    }
}

impl Default for KubectlClient {
    fn default() -> Self {
        Self::new("kubectl")
    }
}

#[tonic::async_trait]
impl MountRegistry for KubectlClient {
    #[instrument(skip(self, record), fields(record = %record.name()))]
    async fn create(&self, record: &MountRecord) -> Result<()> {
        let manifest = serde_json::to_vec(&PublishedVolume::new(record))?;
        self.kubectl(&["apply", "-f", "-"], Some(&manifest)).await?;
        debug!("Stored mount record");
        Ok(())
    }

    async fn list_for_node(&self, node: &str) -> Result<Vec<MountRecord>> {
        let selector = format!("{}={}", NODE_LABEL, node);
        let stdout = self
            .kubectl(&["get", RESOURCE, "-l", &selector, "-o", "json"], None)
            .await?;
        let list: ObjectList<PublishedVolume> = serde_json::from_str(&stdout)?;
        Ok(list.items.into_iter().map(|item| item.spec).collect())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.kubectl(&["delete", RESOURCE, name, "--ignore-not-found"], None)
            .await?;
        Ok(())
    }
}

#[tonic::async_trait]
impl ClusterApi for KubectlClient {
    async fn set_driver_ready(&self, node: &str, driver_name: &str, ready: bool) -> Result<()> {
        let label = format!("{}={}", readiness_label(driver_name), ready);
        self.kubectl(&["label", "node", node, &label, "--overwrite"], None)
            .await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.kubectl(
            &[
                "delete",
                "pod",
                name,
                "-n",
                namespace,
                "--ignore-not-found",
                "--wait=false",
            ],
            None,
        )
        .await?;
        Ok(())
    }

    async fn pvc_annotations(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<HashMap<String, String>> {
        let stdout = self
            .kubectl(&["get", "pvc", name, "-n", namespace, "-o", "json"], None)
            .await?;
        let pvc: Metadata = serde_json::from_str(&stdout)?;
        Ok(pvc.metadata.annotations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn record() -> MountRecord {
        MountRecord {
            node: "node-1".to_string(),
            target_path: PathBuf::from("/var/lib/kubelet/pods/p/volumes/v"),
            volume_handle: "bucket-a".to_string(),
            options: BTreeMap::new(),
            pod: None,
        }
    }

    #[test]
    fn test_manifest_shape() {
        let value = serde_json::to_value(PublishedVolume::new(&record())).unwrap();
        assert_eq!(value["apiVersion"], API_VERSION);
        assert_eq!(value["kind"], KIND);
        assert_eq!(value["metadata"]["name"], record().name());
        assert_eq!(value["metadata"]["labels"][NODE_LABEL], "node-1");
        assert_eq!(value["spec"]["volumeHandle"], "bucket-a");
        assert!(value["metadata"].get("annotations").is_none());
    }

    #[test]
    fn test_parse_list() {
        let json = r#"{
            "apiVersion": "v1",
            "kind": "List",
            "items": [{
                "apiVersion": "gcs.csi.io/v1beta1",
                "kind": "PublishedVolume",
                "metadata": {"name": "abc", "labels": {"gcs.csi.io/node": "node-1"}, "uid": "u"},
                "spec": {"node": "node-1", "targetPath": "/mnt/t", "volumeHandle": "v",
                         "pod": {"name": "web-0", "namespace": "apps"}}
            }]
        }"#;
        let list: ObjectList<PublishedVolume> = serde_json::from_str(json).unwrap();
        assert_eq!(list.items.len(), 1);
        let spec = &list.items[0].spec;
        assert_eq!(spec.target_path, Path::new("/mnt/t"));
        assert_eq!(spec.pod.as_ref().unwrap().namespace, "apps");

        let empty: ObjectList<PublishedVolume> = serde_json::from_str(r#"{"items": []}"#).unwrap();
        assert!(empty.items.is_empty());
    }

    #[test]
    fn test_parse_pvc_annotations() {
        let json = r#"{"metadata": {"name": "data", "annotations": {"gcs.csi.io/location": "EU"}}}"#;
        let pvc: Metadata = serde_json::from_str(json).unwrap();
        assert_eq!(pvc.metadata.annotations.get("gcs.csi.io/location").unwrap(), "EU");

        let pvc: Metadata = serde_json::from_str(r#"{"metadata": {"name": "data"}}"#).unwrap();
        assert!(pvc.metadata.annotations.is_empty());
    }

    #[tokio::test]
    async fn test_failed_command() {
        let client = KubectlClient::new("false");
        let err = client.delete("abc").await.unwrap_err();
        assert!(matches!(err, RegistryError::CommandFailed(_)));
    }
}
