use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::error::{Result, StoreError};
use super::{NewBucket, ObjectStore};
use crate::bucket::BucketAttrs;
use crate::exec::{CommandOutput, Invocation};

/// Default limit for metadata calls. Content copies are bounded by the caller.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
/// Default limit for emptying a bucket before deleting it.
const DEFAULT_PURGE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Subset of `gcloud storage buckets describe` output.
#[derive(Debug, Deserialize)]
struct DescribeOutput {
    #[serde(default)]
    name: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

/// Map a failed gcloud run to a store error using its stderr.
fn check_command_result(output: &CommandOutput, bucket: &str) -> Result<()> {
    if output.success {
        return Ok(());
    }

    let stderr = output.stderr.to_lowercase();

    if stderr.contains("not found") || stderr.contains("404") || stderr.contains("does not exist")
    {
        return Err(StoreError::BucketNotFound(bucket.to_string()));
    }
    if stderr.contains("403")
        || stderr.contains("401")
        || stderr.contains("permission")
        || stderr.contains("forbidden")
        || stderr.contains("does not have")
        || stderr.contains("access denied")
    {
        return Err(StoreError::PermissionDenied(format!(
            "{}: {}",
            bucket, output.stderr
        )));
    }
    if stderr.contains("409") || stderr.contains("already exists") || stderr.contains("already own")
    {
        return Err(StoreError::BucketExists(bucket.to_string()));
    }
    if stderr.contains("400") || stderr.contains("invalid") {
        return Err(StoreError::InvalidRequest(format!(
            "{}: {}",
            bucket, output.stderr
        )));
    }

    Err(StoreError::CommandFailed(format!(
        "{}: {}",
        bucket, output.stderr
    )))
}

/// gcloud reports an empty wildcard match as a failure.
fn matched_nothing(output: &CommandOutput) -> bool {
    !output.success && output.stderr.to_lowercase().contains("matched no objects")
}

fn url(bucket: &str) -> String {
    format!("gs://{}", bucket)
}

fn format_labels(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// [`ObjectStore`] backed by the `gcloud storage` command line.
#[derive(Debug, Clone)]
pub struct GcloudStorage {
    binary: PathBuf,
    command_timeout: Duration,
    purge_timeout: Duration,
}

impl GcloudStorage {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            purge_timeout: DEFAULT_PURGE_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_purge_timeout(mut self, timeout: Duration) -> Self {
        self.purge_timeout = timeout;
        self
    }

    fn gcloud(&self, key_file: Option<&Path>) -> Invocation<'static> {
        Invocation::new(&self.binary)
            .credential_file(key_file)
            .env("CLOUDSDK_CORE_DISABLE_PROMPTS", "1")
    }
}

impl Default for GcloudStorage {
    fn default() -> Self {
        Self::new("gcloud")
    }
}

#[tonic::async_trait]
impl ObjectStore for GcloudStorage {
    #[instrument(skip(self, key_file))]
    async fn get_bucket(
        &self,
        key_file: Option<&Path>,
        bucket: &str,
    ) -> Result<Option<BucketAttrs>> {
        let output = self
            .gcloud(key_file)
            .args([
                "storage",
                "buckets",
                "describe",
                &url(bucket),
                "--format=json(name,location,labels)",
            ])
            .timeout(self.command_timeout)
            .run()
            .await?;

        match check_command_result(&output, bucket) {
            Ok(()) => {}
            Err(StoreError::BucketNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        }

        let parsed: DescribeOutput = serde_json::from_str(&output.stdout)
            .map_err(|e| StoreError::ParseError(format!("{}: {}", bucket, e)))?;

        Ok(Some(BucketAttrs {
            name: if parsed.name.is_empty() {
                bucket.to_string()
            } else {
                parsed.name
            },
            location: parsed.location,
            labels: parsed.labels.unwrap_or_default(),
        }))
    }

    #[instrument(skip(self, key_file, bucket), fields(bucket = %bucket.name))]
    async fn create_bucket(&self, key_file: Option<&Path>, bucket: &NewBucket) -> Result<()> {
        let mut args = vec![
            "storage".to_string(),
            "buckets".to_string(),
            "create".to_string(),
            url(&bucket.name),
            format!("--project={}", bucket.project_id),
            format!("--location={}", bucket.location),
        ];
        if let Some(kms_key) = &bucket.kms_key_id {
            args.push(format!("--default-encryption-key={}", kms_key));
        }

        info!(location = %bucket.location, "Creating bucket");
        let output = self
            .gcloud(key_file)
            .args(&args)
            .timeout(self.command_timeout)
            .run()
            .await?;
        check_command_result(&output, &bucket.name)?;

        // Labels are a second call; a failure here leaves an unlabeled
        // bucket that a retried CreateVolume completes.
        if !bucket.labels.is_empty() {
            self.update_labels(key_file, &bucket.name, &bucket.labels)
                .await?;
        }
        Ok(())
    }

    #[instrument(skip(self, key_file))]
    async fn update_labels(
        &self,
        key_file: Option<&Path>,
        bucket: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let output = self
            .gcloud(key_file)
            .args([
                "storage".to_string(),
                "buckets".to_string(),
                "update".to_string(),
                url(bucket),
                format!("--update-labels={}", format_labels(labels)),
            ])
            .timeout(self.command_timeout)
            .run()
            .await?;
        check_command_result(&output, bucket)
    }

    #[instrument(skip(self, key_file))]
    async fn delete_bucket(&self, key_file: Option<&Path>, bucket: &str) -> Result<()> {
        let objects = format!("{}/**", url(bucket));
        let output = self
            .gcloud(key_file)
            .args(["storage", "rm", "--recursive", "--all-versions", &objects])
            .timeout(self.purge_timeout)
            .run()
            .await?;
        if matched_nothing(&output) {
            debug!(bucket = %bucket, "Bucket has no objects to remove");
        } else {
            check_command_result(&output, bucket)?;
        }

        let output = self
            .gcloud(key_file)
            .args(["storage", "buckets", "delete", &url(bucket)])
            .timeout(self.command_timeout)
            .run()
            .await?;
        check_command_result(&output, bucket)
    }

    #[instrument(skip(self, key_file))]
    async fn list_objects(
        &self,
        key_file: Option<&Path>,
        bucket: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        let output = self
            .gcloud(key_file)
            .args([
                "storage".to_string(),
                "objects".to_string(),
                "list".to_string(),
                url(bucket),
                format!("--limit={}", limit),
                "--format=value(name)".to_string(),
            ])
            .timeout(self.command_timeout)
            .run()
            .await?;

        if matched_nothing(&output) {
            return Ok(Vec::new());
        }
        check_command_result(&output, bucket)?;

        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .take(limit)
            .map(String::from)
            .collect())
    }

    #[instrument(skip(self, key_file))]
    async fn copy_objects(
        &self,
        key_file: Option<&Path>,
        source: &str,
        destination: &str,
    ) -> Result<()> {
        info!("Copying bucket contents");
        let output = self
            .gcloud(key_file)
            .args([
                "storage",
                "rsync",
                "--recursive",
                &url(source),
                &url(destination),
            ])
            .run()
            .await?;

        if let Err(e) = check_command_result(&output, source) {
            warn!(error = %e, "Copy failed");
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            success: false,
            code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_classify_not_found() {
        let out = failed("ERROR: (gcloud.storage.buckets.describe) gs://missing not found: 404.");
        assert!(matches!(
            check_command_result(&out, "missing"),
            Err(StoreError::BucketNotFound(b)) if b == "missing"
        ));
    }

    #[test]
    fn test_classify_permission_denied() {
        let out = failed(
            "ERROR: HTTPError 403: sa@p.iam.gserviceaccount.com does not have storage.buckets.get access",
        );
        assert!(matches!(
            check_command_result(&out, "b"),
            Err(StoreError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_classify_conflict() {
        let out = failed("ERROR: HTTPError 409: The requested bucket name is not available.");
        assert!(matches!(
            check_command_result(&out, "b"),
            Err(StoreError::BucketExists(_))
        ));
    }

    #[test]
    fn test_classify_other() {
        let out = failed("ERROR: connection reset");
        assert!(matches!(
            check_command_result(&out, "b"),
            Err(StoreError::CommandFailed(_))
        ));
    }

    #[test]
    fn test_matched_nothing() {
        let out = failed(
            "ERROR: (gcloud.storage.rm) The following URLs matched no objects or files:\n-gs://b/**",
        );
        assert!(matched_nothing(&out));
        assert!(!matched_nothing(&failed("ERROR: 500")));
    }

    #[test]
    fn test_describe_output_parse() {
        let json = r#"{"labels": {"capacity": "1024", "type": "volume"}, "location": "US", "name": "b"}"#;
        let parsed: DescribeOutput = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.name, "b");
        assert_eq!(parsed.labels.unwrap().get("type").unwrap(), "volume");

        let parsed: DescribeOutput = serde_json::from_str(r#"{"location": "EU"}"#).unwrap();
        assert!(parsed.labels.is_none());
    }

    #[test]
    fn test_format_labels() {
        let labels = BTreeMap::from([
            ("type".to_string(), "volume".to_string()),
            ("capacity".to_string(), "5".to_string()),
        ]);
        assert_eq!(format_labels(&labels), "capacity=5,type=volume");
    }

    #[tokio::test]
    async fn test_delete_bucket_purge_is_bounded() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake-gcloud");
        std::fs::write(&script, "#!/bin/sh
exec sleep 30
").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let store = GcloudStorage::new(&script).with_purge_timeout(Duration::from_millis(100));
        let started = std::time::Instant::now();
        let err = store.delete_bucket(None, "huge").await.unwrap_err();

        assert!(matches!(err, StoreError::Timeout(_)), "{err}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
