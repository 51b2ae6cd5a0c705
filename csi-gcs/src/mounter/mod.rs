//! Mount supervision.
//!
//! [`Mounter`] is the seam between the node service and the FUSE helper.
//! [`GcsFuseMounter`] spawns `gcsfuse` and watches the host mount table;
//! tests substitute their own implementation.

mod gcsfuse;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tonic::Status;

pub use gcsfuse::GcsFuseMounter;

/// Everything needed to mount one bucket at one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub bucket: String,
    pub target: PathBuf,
    /// `None` lets the helper use ambient credentials.
    pub key_file: Option<PathBuf>,
    /// Helper options without the `-o=` prefix.
    pub flags: Vec<String>,
    pub read_only: bool,
}

/// What the host says about a mount target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Mounted,
    /// The mount point exists but its FUSE connection is gone.
    Stale,
    NotMounted,
}

#[derive(Error, Debug)]
pub enum MountError {
    #[error("invalid mount target: {0}")]
    InvalidTarget(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid mount arguments: {0}")]
    InvalidArgument(String),

    #[error("mount of {target} did not appear within {after:?}")]
    Timeout { target: String, after: Duration },

    #[error("mount helper failed: {0}")]
    HelperFailed(String),

    #[error("unmount failed: {0}")]
    UnmountFailed(String),

    #[error("mount helper {pid} for {target} is still running")]
    ProcessLingering { pid: u32, target: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl MountError {
    /// Short label for the failure metric.
    pub fn reason(&self) -> &'static str {
        match self {
            MountError::InvalidTarget(_) => "invalid_target",
            MountError::PermissionDenied(_) => "permission_denied",
            MountError::InvalidArgument(_) => "invalid_argument",
            MountError::Timeout { .. } => "timeout",
            MountError::HelperFailed(_) => "helper_failed",
            MountError::UnmountFailed(_) => "unmount_failed",
            MountError::ProcessLingering { .. } => "process_lingering",
            MountError::Io(_) => "io",
        }
    }
}

impl From<MountError> for Status {
    fn from(err: MountError) -> Self {
        match &err {
            MountError::InvalidTarget(_) | MountError::InvalidArgument(_) => {
                Status::invalid_argument(err.to_string())
            }
            MountError::PermissionDenied(_) => Status::permission_denied(err.to_string()),
            _ => Status::internal(err.to_string()),
        }
    }
}

/// Host-side mount operations used by the node service.
#[tonic::async_trait]
pub trait Mounter: Send + Sync {
    /// Mount and return once the target shows up in the mount table.
    async fn mount(&self, request: &MountRequest) -> Result<(), MountError>;

    /// Unmount and wait for the helper process to go away.
    async fn unmount(&self, target: &Path) -> Result<(), MountError>;

    /// Mounted or stale. Creates a missing target directory.
    async fn is_mounted(&self, target: &Path) -> Result<bool, MountError>;

    /// Three-state check without side effects.
    async fn probe(&self, target: &Path) -> Result<MountState, MountError>;
}
