use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::error::{RegistryError, Result};
use super::{ClusterApi, MountRecord, MountRegistry, PodRef};

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<String, MountRecord>,
    readiness: HashMap<String, bool>,
    readiness_history: Vec<bool>,
    pvc_annotations: HashMap<(String, String), HashMap<String, String>>,
    pods_deleted: Vec<PodRef>,
    fail_writes: bool,
}

/// In-process registry and cluster used by tests.
#[derive(Debug, Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn records(&self) -> Vec<MountRecord> {
        self.state().records.values().cloned().collect()
    }

    pub fn readiness(&self, node: &str) -> Option<bool> {
        self.state().readiness.get(node).copied()
    }

    /// Every readiness value set so far, oldest first.
    pub fn readiness_history(&self) -> Vec<bool> {
        self.state().readiness_history.clone()
    }

    pub fn pods_deleted(&self) -> Vec<PodRef> {
        self.state().pods_deleted.clone()
    }

    pub fn set_pvc_annotations(&self, namespace: &str, name: &str, annotations: HashMap<String, String>) {
        self.state()
            .pvc_annotations
            .insert((namespace.to_string(), name.to_string()), annotations);
    }

    /// Make record writes fail.
    pub fn fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }
}

#[tonic::async_trait]
impl MountRegistry for MemoryCluster {
    async fn create(&self, record: &MountRecord) -> Result<()> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(RegistryError::CommandFailed("registry unavailable".to_string()));
        }
        state.records.insert(record.name(), record.clone());
        Ok(())
    }

    async fn list_for_node(&self, node: &str) -> Result<Vec<MountRecord>> {
        Ok(self
            .state()
            .records
            .values()
            .filter(|r| r.node == node)
            .cloned()
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(RegistryError::CommandFailed("registry unavailable".to_string()));
        }
        state.records.remove(name);
        Ok(())
    }
}

#[tonic::async_trait]
impl ClusterApi for MemoryCluster {
    async fn set_driver_ready(&self, node: &str, _driver_name: &str, ready: bool) -> Result<()> {
        let mut state = self.state();
        state.readiness.insert(node.to_string(), ready);
        state.readiness_history.push(ready);
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.state().pods_deleted.push(PodRef {
            name: name.to_string(),
            namespace: namespace.to_string(),
        });
        Ok(())
    }

    async fn pvc_annotations(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<HashMap<String, String>> {
        self.state()
            .pvc_annotations
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("pvc {}/{}", namespace, name)))
    }
}
