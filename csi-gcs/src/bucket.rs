//! Bucket naming and label conventions.
//!
//! Volumes and snapshots are both plain buckets. What a bucket represents is
//! recorded in its labels: `type` says volume or snapshot, `capacity` holds
//! the logical size ceiling in bytes, and snapshots carry `source-volume`.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

/// Characters kept from the requested name before the checksum suffix.
pub const MAX_NAME_PREFIX: usize = 48;

pub const LABEL_TYPE: &str = "type";
pub const LABEL_CAPACITY: &str = "capacity";
pub const LABEL_SOURCE_VOLUME: &str = "source-volume";

/// Map a CSI volume or snapshot name to a bucket name.
///
/// The result is the lowercased name cut to [`MAX_NAME_PREFIX`] characters,
/// followed by `-` and the hex CRC32 of the untruncated name, so names that
/// only differ past the cut still land on different buckets.
pub fn derive_bucket_name(name: &str) -> String {
    let prefix: String = name.to_lowercase().chars().take(MAX_NAME_PREFIX).collect();
    format!("{}-{:x}", prefix, crc32fast::hash(name.as_bytes()))
}

// ============================================================================
// BucketKind
// ============================================================================

/// What a managed bucket stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    Volume,
    Snapshot,
}

impl BucketKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            BucketKind::Volume => "volume",
            BucketKind::Snapshot => "snapshot",
        }
    }
}

impl Display for BucketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BucketKind {
    type Err = BucketKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "volume" => Ok(BucketKind::Volume),
            "snapshot" => Ok(BucketKind::Snapshot),
            _ => Err(BucketKindParseError(s.to_string())),
        }
    }
}

/// Error returned when a `type` label holds an unknown value.
#[derive(Debug, Clone)]
pub struct BucketKindParseError(String);

impl Display for BucketKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown bucket type '{}': expected 'volume' or 'snapshot'",
            self.0
        )
    }
}

impl std::error::Error for BucketKindParseError {}

// ============================================================================
// BucketAttrs
// ============================================================================

/// Metadata of an existing bucket as reported by the object store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketAttrs {
    pub name: String,
    pub location: String,
    pub labels: BTreeMap<String, String>,
}

impl BucketAttrs {
    /// Kind recorded in the `type` label, `None` when absent or unrecognized.
    pub fn kind(&self) -> Option<BucketKind> {
        self.labels.get(LABEL_TYPE).and_then(|v| v.parse().ok())
    }

    pub fn is_kind(&self, kind: BucketKind) -> bool {
        self.kind() == Some(kind)
    }

    /// Stored capacity. A missing, zero, or unparsable label means the
    /// capacity has not been set yet.
    pub fn capacity(&self) -> Option<i64> {
        self.labels
            .get(LABEL_CAPACITY)
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|c| *c > 0)
    }

    pub fn source_volume(&self) -> Option<&str> {
        self.labels.get(LABEL_SOURCE_VOLUME).map(String::as_str)
    }
}

/// Labels for a freshly provisioned volume bucket.
pub fn volume_labels(capacity: i64) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_TYPE.to_string(), BucketKind::Volume.to_string()),
        (LABEL_CAPACITY.to_string(), capacity.max(0).to_string()),
    ])
}

/// Labels for a snapshot bucket taken from `source_volume`.
pub fn snapshot_labels(source_volume: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_TYPE.to_string(), BucketKind::Snapshot.to_string()),
        (LABEL_SOURCE_VOLUME.to_string(), source_volume.to_string()),
    ])
}

/// Single-label update for the capacity ceiling.
pub fn capacity_label(capacity: i64) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_CAPACITY.to_string(), capacity.max(0).to_string())])
}
