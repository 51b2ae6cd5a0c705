use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::error::{Result, StoreError};
use super::{NewBucket, ObjectStore};
use crate::bucket::BucketAttrs;

#[derive(Debug, Default, Clone)]
struct MemoryBucket {
    location: String,
    project_id: String,
    labels: BTreeMap<String, String>,
    objects: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct State {
    buckets: HashMap<String, MemoryBucket>,
    denied: HashSet<String>,
}

/// In-process [`ObjectStore`] used by tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_access(state: &State, bucket: &str) -> Result<()> {
        if state.denied.contains(bucket) {
            return Err(StoreError::PermissionDenied(format!(
                "access to bucket {} denied",
                bucket
            )));
        }
        Ok(())
    }

    /// Seed a bucket as-is, bypassing create-time labeling.
    pub fn insert_bucket(&self, attrs: BucketAttrs) {
        self.state().buckets.insert(
            attrs.name,
            MemoryBucket {
                location: attrs.location,
                labels: attrs.labels,
                ..Default::default()
            },
        );
    }

    pub fn insert_object(&self, bucket: &str, name: &str, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        let entry = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;
        entry.objects.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    pub fn object_names(&self, bucket: &str) -> Vec<String> {
        self.state()
            .buckets
            .get(bucket)
            .map(|b| b.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn bucket(&self, bucket: &str) -> Option<BucketAttrs> {
        self.state().buckets.get(bucket).map(|b| BucketAttrs {
            name: bucket.to_string(),
            location: b.location.clone(),
            labels: b.labels.clone(),
        })
    }

    pub fn project_of(&self, bucket: &str) -> Option<String> {
        self.state()
            .buckets
            .get(bucket)
            .map(|b| b.project_id.clone())
    }

    pub fn bucket_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state().buckets.keys().cloned().collect();
        names.sort();
        names
    }

    /// Make every call touching `bucket` fail with a permission error.
    pub fn deny(&self, bucket: &str) {
        self.state().denied.insert(bucket.to_string());
    }
}

#[tonic::async_trait]
impl ObjectStore for MemoryStore {
    async fn get_bucket(
        &self,
        _key_file: Option<&Path>,
        bucket: &str,
    ) -> Result<Option<BucketAttrs>> {
        Self::check_access(&self.state(), bucket)?;
        Ok(self.bucket(bucket))
    }

    async fn create_bucket(&self, _key_file: Option<&Path>, bucket: &NewBucket) -> Result<()> {
        let mut state = self.state();
        Self::check_access(&state, &bucket.name)?;
        if state.buckets.contains_key(&bucket.name) {
            return Err(StoreError::BucketExists(bucket.name.clone()));
        }
        state.buckets.insert(
            bucket.name.clone(),
            MemoryBucket {
                location: bucket.location.clone(),
                project_id: bucket.project_id.clone(),
                labels: bucket.labels.clone(),
                objects: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn update_labels(
        &self,
        _key_file: Option<&Path>,
        bucket: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state();
        Self::check_access(&state, bucket)?;
        let entry = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;
        entry
            .labels
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn delete_bucket(&self, _key_file: Option<&Path>, bucket: &str) -> Result<()> {
        let mut state = self.state();
        Self::check_access(&state, bucket)?;
        state
            .buckets
            .remove(bucket)
            .map(|_| ())
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))
    }

    async fn list_objects(
        &self,
        _key_file: Option<&Path>,
        bucket: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        let state = self.state();
        Self::check_access(&state, bucket)?;
        let entry = state
            .buckets
            .get(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;
        Ok(entry.objects.keys().take(limit).cloned().collect())
    }

    async fn copy_objects(
        &self,
        _key_file: Option<&Path>,
        source: &str,
        destination: &str,
    ) -> Result<()> {
        let mut state = self.state();
        Self::check_access(&state, source)?;
        Self::check_access(&state, destination)?;
        let objects = state
            .buckets
            .get(source)
            .ok_or_else(|| StoreError::BucketNotFound(source.to_string()))?
            .objects
            .clone();
        let target = state
            .buckets
            .get_mut(destination)
            .ok_or_else(|| StoreError::BucketNotFound(destination.to_string()))?;
        target.objects.extend(objects);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_bucket(name: &str) -> NewBucket {
        NewBucket {
            name: name.to_string(),
            project_id: "proj".to_string(),
            location: "EU".to_string(),
            kms_key_id: None,
            labels: BTreeMap::from([("type".to_string(), "volume".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_create_and_describe() {
        let store = MemoryStore::new();
        store.create_bucket(None, &new_bucket("b")).await.unwrap();

        let attrs = store.get_bucket(None, "b").await.unwrap().unwrap();
        assert_eq!(attrs.location, "EU");
        assert_eq!(attrs.labels.get("type").unwrap(), "volume");
        assert_eq!(store.project_of("b").unwrap(), "proj");

        let err = store.create_bucket(None, &new_bucket("b")).await.unwrap_err();
        assert!(matches!(err, StoreError::BucketExists(_)));
    }

    #[tokio::test]
    async fn test_copy_and_list() {
        let store = MemoryStore::new();
        store.create_bucket(None, &new_bucket("src")).await.unwrap();
        store.create_bucket(None, &new_bucket("dst")).await.unwrap();
        store.insert_object("src", "a.txt", b"a").unwrap();
        store.insert_object("src", "b.txt", b"b").unwrap();

        store.copy_objects(None, "src", "dst").await.unwrap();

        assert_eq!(store.object_names("dst"), vec!["a.txt", "b.txt"]);
        assert_eq!(store.list_objects(None, "dst", 1).await.unwrap(), vec!["a.txt"]);
    }

    #[tokio::test]
    async fn test_denied_bucket() {
        let store = MemoryStore::new();
        store.create_bucket(None, &new_bucket("b")).await.unwrap();
        store.deny("b");

        let err = store.list_objects(None, "b", 1).await.unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_delete_missing() {
        let store = MemoryStore::new();
        let err = store.delete_bucket(None, "nope").await.unwrap_err();
        assert!(matches!(err, StoreError::BucketNotFound(_)));
    }
}
