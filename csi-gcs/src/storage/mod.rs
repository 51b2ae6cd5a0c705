//! Object store access.
//!
//! The controller and node services only need a handful of bucket-level
//! operations, captured by [`ObjectStore`]. [`GcloudStorage`] drives the
//! `gcloud storage` CLI; [`MemoryStore`] keeps everything in process.

mod error;
mod gcloud;
mod memory;

use std::collections::BTreeMap;
use std::path::Path;

pub use error::{Result, StoreError};
pub use gcloud::GcloudStorage;
pub use memory::MemoryStore;

use crate::bucket::BucketAttrs;

/// Parameters for a bucket that does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBucket {
    pub name: String,
    pub project_id: String,
    pub location: String,
    /// Cloud KMS key used as the bucket's default encryption key.
    pub kms_key_id: Option<String>,
    pub labels: BTreeMap<String, String>,
}

/// Bucket-level operations used by the driver.
///
/// Every call takes the credentials to act with; `None` means the
/// backend's ambient credentials.
#[tonic::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Metadata of `bucket`, or `None` if it does not exist.
    async fn get_bucket(&self, key_file: Option<&Path>, bucket: &str)
    -> Result<Option<BucketAttrs>>;

    async fn create_bucket(&self, key_file: Option<&Path>, bucket: &NewBucket) -> Result<()>;

    /// Add or overwrite labels, leaving the others untouched.
    async fn update_labels(
        &self,
        key_file: Option<&Path>,
        bucket: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Delete `bucket` together with every object in it.
    async fn delete_bucket(&self, key_file: Option<&Path>, bucket: &str) -> Result<()>;

    /// Up to `limit` object names from `bucket`.
    async fn list_objects(
        &self,
        key_file: Option<&Path>,
        bucket: &str,
        limit: usize,
    ) -> Result<Vec<String>>;

    /// Copy every object of `source` into `destination`.
    async fn copy_objects(
        &self,
        key_file: Option<&Path>,
        source: &str,
        destination: &str,
    ) -> Result<()>;
}
