//! Cloud Storage CSI Driver Library
//!
//! Kubernetes CSI driver that exposes Google Cloud Storage buckets as
//! volumes and mounts them on nodes with gcsfuse.
//!
//! This library provides:
//! - CSI Identity, Controller, and Node service implementations
//! - Object store, mount helper and cluster collaborators behind traits
//! - Platform-specific mount/unmount operations

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod bucket;
pub mod controller;
pub mod credentials;
pub mod driver;
pub mod exec;
pub mod identity;
pub mod logging;
pub mod metrics;
pub mod mount_table;
pub mod mounter;
pub mod node;
pub mod options;
pub mod platform;
pub mod registry;
pub mod storage;

pub use controller::ControllerService;
pub use driver::{Driver, Lifecycle};
pub use identity::{DRIVER_NAME, DRIVER_VERSION, IdentityService};
pub use node::NodeService;
