//! Volume option resolution.
//!
//! Options reach the driver from several places: the StorageClass parameters,
//! the provisioner secret, the `mountOptions` of a volume capability, and
//! annotations on the claim. [`VolumeOptions::resolve`] folds an ordered list
//! of those sources over a set of defaults. Later sources win, and only keys
//! from [`OptionKey::ALL`] are ever taken.

use std::collections::HashMap;
use std::fmt::{self, Display};

use tracing::{debug, warn};

use crate::credentials::{CONTEXT_KEY_FILE, CONTEXT_KEY_NAME};

/// Prefix of claim annotations understood by the driver.
pub const ANNOTATION_PREFIX: &str = "gcs.csi.io/";

/// Keys the container orchestrator injects into parameters and volume context.
const RESERVED_PREFIX: &str = "csi.storage.k8s.io/";

/// Default bucket location for provisioned buckets.
pub const DEFAULT_LOCATION: &str = "US";

// ============================================================================
// OptionKey
// ============================================================================

/// How a mount flag value is validated and normalised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Text,
    Octal,
    Integer,
    Bool,
}

/// A recognized option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OptionKey {
    Bucket,
    ProjectId,
    KmsKeyId,
    Location,
    FuseMountOptions,
    DirMode,
    FileMode,
    Uid,
    Gid,
    ImplicitDirs,
    BillingProject,
    LimitBytesPerSec,
    LimitOpsPerSec,
    StatCacheTtl,
    TypeCacheTtl,
}

impl OptionKey {
    /// Every key, in the order helper flags are emitted.
    pub const ALL: [OptionKey; 15] = [
        OptionKey::Bucket,
        OptionKey::ProjectId,
        OptionKey::KmsKeyId,
        OptionKey::Location,
        OptionKey::FuseMountOptions,
        OptionKey::DirMode,
        OptionKey::FileMode,
        OptionKey::Uid,
        OptionKey::Gid,
        OptionKey::ImplicitDirs,
        OptionKey::BillingProject,
        OptionKey::LimitBytesPerSec,
        OptionKey::LimitOpsPerSec,
        OptionKey::StatCacheTtl,
        OptionKey::TypeCacheTtl,
    ];

    /// Name used in parameters, secrets and volume context.
    pub const fn flag_name(self) -> &'static str {
        match self {
            OptionKey::Bucket => "bucket",
            OptionKey::ProjectId => "projectId",
            OptionKey::KmsKeyId => "kmsKeyId",
            OptionKey::Location => "location",
            OptionKey::FuseMountOptions => "fuseMountOptions",
            OptionKey::DirMode => "dirMode",
            OptionKey::FileMode => "fileMode",
            OptionKey::Uid => "uid",
            OptionKey::Gid => "gid",
            OptionKey::ImplicitDirs => "implicitDirs",
            OptionKey::BillingProject => "billingProject",
            OptionKey::LimitBytesPerSec => "limitBytesPerSec",
            OptionKey::LimitOpsPerSec => "limitOpsPerSec",
            OptionKey::StatCacheTtl => "statCacheTTL",
            OptionKey::TypeCacheTtl => "typeCacheTTL",
        }
    }

    /// Annotation name without [`ANNOTATION_PREFIX`].
    pub const fn annotation_suffix(self) -> &'static str {
        match self {
            OptionKey::Bucket => "bucket",
            OptionKey::ProjectId => "project-id",
            OptionKey::KmsKeyId => "kms-key-id",
            OptionKey::Location => "location",
            OptionKey::FuseMountOptions => "fuse-mount-options",
            OptionKey::DirMode => "dir-mode",
            OptionKey::FileMode => "file-mode",
            OptionKey::Uid => "uid",
            OptionKey::Gid => "gid",
            OptionKey::ImplicitDirs => "implicit-dirs",
            OptionKey::BillingProject => "billing-project",
            OptionKey::LimitBytesPerSec => "limit-bytes-per-sec",
            OptionKey::LimitOpsPerSec => "limit-ops-per-sec",
            OptionKey::StatCacheTtl => "stat-cache-ttl",
            OptionKey::TypeCacheTtl => "type-cache-ttl",
        }
    }

    /// Name accepted in a capability's mount flags.
    pub const fn mount_flag(self) -> &'static str {
        match self {
            OptionKey::FuseMountOptions => "fuse-mount-option",
            other => other.annotation_suffix(),
        }
    }

    /// gcsfuse `-o` option name. Keys that only matter for provisioning
    /// have none, and raw fuse options are passed through untouched.
    const fn fuse_option(self) -> Option<&'static str> {
        match self {
            OptionKey::DirMode => Some("dir_mode"),
            OptionKey::FileMode => Some("file_mode"),
            OptionKey::Uid => Some("uid"),
            OptionKey::Gid => Some("gid"),
            OptionKey::ImplicitDirs => Some("implicit_dirs"),
            OptionKey::BillingProject => Some("billing_project"),
            OptionKey::LimitBytesPerSec => Some("limit_bytes_per_sec"),
            OptionKey::LimitOpsPerSec => Some("limit_ops_per_sec"),
            OptionKey::StatCacheTtl => Some("stat_cache_ttl"),
            OptionKey::TypeCacheTtl => Some("type_cache_ttl"),
            _ => None,
        }
    }

    const fn value_kind(self) -> ValueKind {
        match self {
            OptionKey::DirMode | OptionKey::FileMode => ValueKind::Octal,
            OptionKey::Uid
            | OptionKey::Gid
            | OptionKey::LimitBytesPerSec
            | OptionKey::LimitOpsPerSec => ValueKind::Integer,
            OptionKey::ImplicitDirs => ValueKind::Bool,
            _ => ValueKind::Text,
        }
    }

    pub fn from_flag_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.flag_name() == name)
    }

    /// Look up a full annotation name, prefix included.
    pub fn from_annotation(annotation: &str) -> Option<Self> {
        let suffix = annotation.strip_prefix(ANNOTATION_PREFIX)?;
        Self::ALL.into_iter().find(|k| k.annotation_suffix() == suffix)
    }

    pub fn from_mount_flag(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.mount_flag() == name)
    }
}

impl Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.flag_name())
    }
}

// ============================================================================
// Sources
// ============================================================================

/// One layer of configuration, applied by [`VolumeOptions::merge`].
#[derive(Debug, Clone, Copy)]
pub enum OptionSource<'a> {
    /// Secret fields, keyed by flag name. Non-option keys (the service
    /// account key itself) are skipped quietly.
    Secrets(&'a HashMap<String, String>),
    /// `mountOptions` strings from a volume capability.
    MountFlags(&'a [String]),
    /// Claim annotations. Only keys under [`ANNOTATION_PREFIX`] are read.
    Annotations(&'a HashMap<String, String>),
    /// Request parameters or volume context, keyed by flag name or by
    /// annotation name.
    Parameters(&'a HashMap<String, String>),
}

// ============================================================================
// VolumeOptions
// ============================================================================

/// Effective configuration of a volume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeOptions {
    pub bucket: Option<String>,
    pub project_id: Option<String>,
    pub kms_key_id: Option<String>,
    pub location: Option<String>,
    /// Comma separated raw fuse options.
    pub fuse_mount_options: Option<String>,
    pub dir_mode: Option<String>,
    pub file_mode: Option<String>,
    pub uid: Option<String>,
    pub gid: Option<String>,
    pub implicit_dirs: Option<String>,
    pub billing_project: Option<String>,
    pub limit_bytes_per_sec: Option<String>,
    pub limit_ops_per_sec: Option<String>,
    pub stat_cache_ttl: Option<String>,
    pub type_cache_ttl: Option<String>,
}

impl VolumeOptions {
    /// Defaults used when provisioning a bucket.
    pub fn provisioning_defaults(bucket: String) -> Self {
        Self {
            bucket: Some(bucket),
            location: Some(DEFAULT_LOCATION.to_string()),
            ..Default::default()
        }
    }

    /// Defaults used when mounting: the bucket is the volume id.
    pub fn mount_defaults(volume_id: &str) -> Self {
        Self {
            bucket: Some(volume_id.to_string()),
            ..Default::default()
        }
    }

    fn slot(&self, key: OptionKey) -> &Option<String> {
        match key {
            OptionKey::Bucket => &self.bucket,
            OptionKey::ProjectId => &self.project_id,
            OptionKey::KmsKeyId => &self.kms_key_id,
            OptionKey::Location => &self.location,
            OptionKey::FuseMountOptions => &self.fuse_mount_options,
            OptionKey::DirMode => &self.dir_mode,
            OptionKey::FileMode => &self.file_mode,
            OptionKey::Uid => &self.uid,
            OptionKey::Gid => &self.gid,
            OptionKey::ImplicitDirs => &self.implicit_dirs,
            OptionKey::BillingProject => &self.billing_project,
            OptionKey::LimitBytesPerSec => &self.limit_bytes_per_sec,
            OptionKey::LimitOpsPerSec => &self.limit_ops_per_sec,
            OptionKey::StatCacheTtl => &self.stat_cache_ttl,
            OptionKey::TypeCacheTtl => &self.type_cache_ttl,
        }
    }

    fn slot_mut(&mut self, key: OptionKey) -> &mut Option<String> {
        match key {
            OptionKey::Bucket => &mut self.bucket,
            OptionKey::ProjectId => &mut self.project_id,
            OptionKey::KmsKeyId => &mut self.kms_key_id,
            OptionKey::Location => &mut self.location,
            OptionKey::FuseMountOptions => &mut self.fuse_mount_options,
            OptionKey::DirMode => &mut self.dir_mode,
            OptionKey::FileMode => &mut self.file_mode,
            OptionKey::Uid => &mut self.uid,
            OptionKey::Gid => &mut self.gid,
            OptionKey::ImplicitDirs => &mut self.implicit_dirs,
            OptionKey::BillingProject => &mut self.billing_project,
            OptionKey::LimitBytesPerSec => &mut self.limit_bytes_per_sec,
            OptionKey::LimitOpsPerSec => &mut self.limit_ops_per_sec,
            OptionKey::StatCacheTtl => &mut self.stat_cache_ttl,
            OptionKey::TypeCacheTtl => &mut self.type_cache_ttl,
        }
    }

    pub fn get(&self, key: OptionKey) -> Option<&str> {
        self.slot(key).as_deref()
    }

    pub fn set(&mut self, key: OptionKey, value: impl Into<String>) {
        *self.slot_mut(key) = Some(value.into());
    }

    /// Fold `sources` over `defaults`, in order.
    ///
    /// For the layering used by CreateVolume this means:
    /// `resolve(defaults, &[Secrets, MountFlags, Annotations, Parameters])`.
    pub fn resolve(defaults: VolumeOptions, sources: &[OptionSource<'_>]) -> VolumeOptions {
        let mut options = defaults;
        for source in sources {
            options.merge(source);
        }
        options
    }

    /// Apply a single source on top of the current values.
    pub fn merge(&mut self, source: &OptionSource<'_>) {
        match source {
            OptionSource::Secrets(fields) => {
                for (name, value) in fields.iter() {
                    match OptionKey::from_flag_name(name) {
                        Some(key) => self.set(key, value.clone()),
                        None => debug!(field = %name, "Ignoring non-option secret field"),
                    }
                }
            }
            OptionSource::Annotations(annotations) => {
                for (name, value) in annotations.iter() {
                    if !name.starts_with(ANNOTATION_PREFIX) {
                        continue;
                    }
                    match OptionKey::from_annotation(name) {
                        Some(key) => self.set(key, value.clone()),
                        None => warn!(annotation = %name, "Unknown annotation, ignoring"),
                    }
                }
            }
            OptionSource::Parameters(parameters) => {
                // Annotation spellings first so the plain name wins when both are set
                for (name, value) in parameters.iter() {
                    if let Some(key) = OptionKey::from_annotation(name) {
                        self.set(key, value.clone());
                    }
                }
                for (name, value) in parameters.iter() {
                    match OptionKey::from_flag_name(name) {
                        Some(key) => self.set(key, value.clone()),
                        None if OptionKey::from_annotation(name).is_some() => {}
                        None if is_passthrough_key(name) => {}
                        None => warn!(parameter = %name, "Unknown parameter, ignoring"),
                    }
                }
            }
            OptionSource::MountFlags(flags) => self.merge_mount_flags(flags),
        }
    }

    fn merge_mount_flags(&mut self, flags: &[String]) {
        let mut fuse_options: Vec<String> = Vec::new();
        let mut tokens = flags
            .iter()
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .peekable();

        while let Some(token) = tokens.next() {
            let dashed = token.starts_with('-');
            let stripped = token.trim_start_matches('-');
            let (name, inline) = match stripped.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (stripped, None),
            };

            let Some(key) = OptionKey::from_mount_flag(name) else {
                warn!(flag = %token, "Unknown mount flag, ignoring");
                continue;
            };

            let raw = match (key.value_kind(), inline) {
                (_, Some(value)) => value.to_string(),
                (ValueKind::Bool, None) => "true".to_string(),
                // `--uid 1000` style, value in the following token
                (_, None) => match tokens.next_if(|next| dashed && !next.starts_with('-')) {
                    Some(value) => value.to_string(),
                    None => {
                        warn!(flag = %token, "Mount flag is missing a value, ignoring");
                        continue;
                    }
                },
            };

            match normalize_flag_value(key, &raw) {
                Ok(Some(value)) if key == OptionKey::FuseMountOptions => fuse_options.push(value),
                Ok(Some(value)) => self.set(key, value),
                Ok(None) => {}
                Err(e) => warn!(flag = %token, error = %e, "Invalid mount flag value, ignoring"),
            }
        }

        if !fuse_options.is_empty() {
            self.set(OptionKey::FuseMountOptions, fuse_options.join(","));
        }
    }

    /// Project the options to gcsfuse `-o` values.
    ///
    /// Raw fuse options come first, followed by the named options in
    /// [`OptionKey::ALL`] order. The implicit directories flag is only
    /// emitted when it is `true`.
    pub fn fuse_flags(&self) -> Vec<String> {
        let mut flags: Vec<String> = self
            .fuse_mount_options
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        for key in OptionKey::ALL {
            let (Some(option), Some(value)) = (key.fuse_option(), self.get(key)) else {
                continue;
            };
            if key.value_kind() == ValueKind::Bool {
                if value.eq_ignore_ascii_case("true") {
                    flags.push(option.to_string());
                }
            } else {
                flags.push(format!("{}={}", option, value));
            }
        }

        flags
    }

    /// Flag-name map handed back to the orchestrator as volume context.
    pub fn to_context(&self) -> HashMap<String, String> {
        OptionKey::ALL
            .into_iter()
            .filter_map(|key| self.get(key).map(|v| (key.flag_name().to_string(), v.to_string())))
            .collect()
    }
}

/// Parameters that are legitimately present but carry no option.
fn is_passthrough_key(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX) || name == CONTEXT_KEY_FILE || name == CONTEXT_KEY_NAME
}

/// Validate a mount flag value. `Ok(None)` means the flag leaves the option
/// unset (a false boolean, or `-1` for numeric options).
fn normalize_flag_value(key: OptionKey, raw: &str) -> Result<Option<String>, String> {
    match key.value_kind() {
        ValueKind::Text if raw.is_empty() => Ok(None),
        ValueKind::Text => Ok(Some(raw.to_string())),
        ValueKind::Octal => u32::from_str_radix(raw, 8)
            .map(|mode| Some(format!("0{:o}", mode)))
            .map_err(|e| format!("expected an octal mode: {}", e)),
        ValueKind::Integer => match raw.parse::<i64>() {
            Ok(-1) => Ok(None),
            Ok(n) => Ok(Some(n.to_string())),
            Err(e) => Err(format!("expected an integer: {}", e)),
        },
        ValueKind::Bool => match raw.to_ascii_lowercase().as_str() {
            "1" | "t" | "true" => Ok(Some("true".to_string())),
            "0" | "f" | "false" => Ok(None),
            _ => Err(format!("expected a boolean, got '{}'", raw)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn flags(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_precedence_across_layers() {
        let defaults = VolumeOptions::mount_defaults("a");
        let secrets = map(&[("bucket", "b")]);
        let annotations = map(&[("gcs.csi.io/bucket", "c")]);
        let parameters = map(&[("bucket", "d")]);

        let resolved = VolumeOptions::resolve(
            defaults,
            &[
                OptionSource::Secrets(&secrets),
                OptionSource::Annotations(&annotations),
                OptionSource::Parameters(&parameters),
            ],
        );

        assert_eq!(resolved.bucket.as_deref(), Some("d"));
    }

    #[test]
    fn test_later_layers_only_override_their_keys() {
        let defaults = VolumeOptions::provisioning_defaults("test".into());
        let parameters = map(&[("bucket", "test2"), ("projectId", "csi-gcs"), ("foo", "bar")]);

        let resolved =
            VolumeOptions::resolve(defaults, &[OptionSource::Parameters(&parameters)]);

        assert_eq!(resolved.bucket.as_deref(), Some("test2"));
        assert_eq!(resolved.location.as_deref(), Some("US"));
        assert_eq!(resolved.project_id.as_deref(), Some("csi-gcs"));
        assert_eq!(resolved.to_context().len(), 3);
    }

    #[test]
    fn test_annotations_require_prefix() {
        let annotations = map(&[
            ("gcs.csi.io/bucket", "test2"),
            ("gcs.csi.io/project-id", "csi-gcs"),
            ("gcs.csi.io/foo", "bar"),
            ("bucket", "ignored"),
        ]);
        let mut options = VolumeOptions::provisioning_defaults("test".into());
        options.merge(&OptionSource::Annotations(&annotations));

        assert_eq!(options.bucket.as_deref(), Some("test2"));
        assert_eq!(options.project_id.as_deref(), Some("csi-gcs"));
        assert_eq!(options.location.as_deref(), Some("US"));
    }

    #[test]
    fn test_secrets_skip_key_material() {
        let secrets = map(&[("key", "{\"type\": \"service_account\"}"), ("projectId", "p1")]);
        let mut options = VolumeOptions::default();
        options.merge(&OptionSource::Secrets(&secrets));

        assert_eq!(options.project_id.as_deref(), Some("p1"));
        assert_eq!(options.to_context().len(), 1);
    }

    #[test]
    fn test_mount_flags_merge() {
        let mount_flags = flags(&[
            "--bucket=test2",
            "--project-id=csi-gcs",
            "--implicit-dirs",
            "--dir-mode=0600",
            "--file-mode=600",
            "--fuse-mount-option=foo,bar",
            "--fuse-mount-option=baz",
        ]);
        let mut options = VolumeOptions::provisioning_defaults("test".into());
        options.merge(&OptionSource::MountFlags(&mount_flags));

        let expected = map(&[
            ("bucket", "test2"),
            ("implicitDirs", "true"),
            ("dirMode", "0600"),
            ("fileMode", "0600"),
            ("location", "US"),
            ("fuseMountOptions", "foo,bar,baz"),
            ("projectId", "csi-gcs"),
        ]);
        assert_eq!(options.to_context(), expected);
    }

    #[test]
    fn test_mount_flags_accept_bare_and_split_forms() {
        let mount_flags = flags(&["implicit-dirs", "uid=1000", "--gid", "2000", "--bogus=1"]);
        let mut options = VolumeOptions::default();
        options.merge(&OptionSource::MountFlags(&mount_flags));

        assert_eq!(options.implicit_dirs.as_deref(), Some("true"));
        assert_eq!(options.uid.as_deref(), Some("1000"));
        assert_eq!(options.gid.as_deref(), Some("2000"));
    }

    #[test]
    fn test_mount_flags_drop_invalid_values() {
        let mount_flags = flags(&["--dir-mode=999", "--uid=abc", "--implicit-dirs=false", "--uid=-1"]);
        let mut options = VolumeOptions::default();
        options.merge(&OptionSource::MountFlags(&mount_flags));

        assert_eq!(options, VolumeOptions::default());
    }

    #[test]
    fn test_fuse_flags_projection_order() {
        let parameters = map(&[
            ("fuseMountOptions", "foo,bar"),
            ("implicitDirs", "true"),
            ("dirMode", "0600"),
        ]);
        let options =
            VolumeOptions::resolve(VolumeOptions::default(), &[OptionSource::Parameters(&parameters)]);

        assert_eq!(
            options.fuse_flags(),
            vec!["foo", "bar", "dir_mode=0600", "implicit_dirs"]
        );
    }

    #[test]
    fn test_fuse_flags_full_projection() {
        let parameters = map(&[
            ("bucket", "b"),
            ("projectId", "p"),
            ("implicitDirs", "false"),
            ("uid", "1000"),
            ("gid", "1000"),
            ("fileMode", "0644"),
            ("billingProject", "payer"),
            ("limitBytesPerSec", "1024"),
            ("limitOpsPerSec", "10"),
            ("statCacheTTL", "1m"),
            ("typeCacheTTL", "30s"),
        ]);
        let options =
            VolumeOptions::resolve(VolumeOptions::default(), &[OptionSource::Parameters(&parameters)]);

        assert_eq!(
            options.fuse_flags(),
            vec![
                "file_mode=0644",
                "uid=1000",
                "gid=1000",
                "billing_project=payer",
                "limit_bytes_per_sec=1024",
                "limit_ops_per_sec=10",
                "stat_cache_ttl=1m",
                "type_cache_ttl=30s",
            ]
        );
    }

    #[test]
    fn test_parameters_accept_annotation_names() {
        let parameters = map(&[
            ("gcs.csi.io/kms-key-id", "projects/p/locations/l/keyRings/r/cryptoKeys/k"),
            ("csi.storage.k8s.io/pvc/name", "claim"),
            ("key_name", "sa"),
        ]);
        let mut options = VolumeOptions::default();
        options.merge(&OptionSource::Parameters(&parameters));

        assert!(options.kms_key_id.is_some());
        assert_eq!(options.to_context().len(), 1);
    }

    #[test]
    fn test_parameter_flag_name_beats_annotation_name() {
        for _ in 0..64 {
            let parameters = map(&[
                ("bucket", "from-flag"),
                ("gcs.csi.io/bucket", "from-annotation"),
                ("gcs.csi.io/location", "EU"),
            ]);
            let mut options = VolumeOptions::default();
            options.merge(&OptionSource::Parameters(&parameters));

            assert_eq!(options.get(OptionKey::Bucket), Some("from-flag"));
            assert_eq!(options.get(OptionKey::Location), Some("EU"));
        }
    }

    #[test]
    fn test_key_name_lookups() {
        for key in OptionKey::ALL {
            assert_eq!(OptionKey::from_flag_name(key.flag_name()), Some(key));
            assert_eq!(OptionKey::from_mount_flag(key.mount_flag()), Some(key));
            let annotation = format!("{}{}", ANNOTATION_PREFIX, key.annotation_suffix());
            assert_eq!(OptionKey::from_annotation(&annotation), Some(key));
        }
        assert_eq!(OptionKey::from_annotation("bucket"), None);
    }
}
