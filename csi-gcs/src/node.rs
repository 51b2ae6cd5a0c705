//! CSI Node Service Implementation
//!
//! Mounts buckets into pod target paths through the mount helper.
//!
//! Each `(volume id, target path)` pair is reference counted: repeated
//! publishes share one helper process and only the last unpublish
//! unmounts it. Host-specific work is delegated to a [`Mounter`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::credentials::{self, KeyStore};
use crate::csi;
use crate::logging::observe;
use crate::metrics;
use crate::mount_table::{MountEntry, MountKey, MountTable};
use crate::mounter::{MountRequest, MountState, Mounter};
use crate::options::{OptionSource, VolumeOptions};
use crate::registry::{MountRecord, MountRegistry, PodRef, record_name};
use crate::storage::ObjectStore;

/// CSI Node Service
///
/// Implements the CSI Node service which handles:
/// - Volume publishing (mount the bucket at the target path)
/// - Volume unpublishing (unmount once the last publish is gone)
/// - Expansion acknowledgement for mounted volumes
/// - Node identity and capability reporting
pub struct NodeService {
    /// The node identifier for this CSI node
    node_id: String,
    mounter: Arc<dyn Mounter>,
    store: Arc<dyn ObjectStore>,
    keys: KeyStore,
    mounts: MountTable,
    /// Durable publish records, when cluster integration is enabled.
    registry: Option<Arc<dyn MountRegistry>>,
}

impl NodeService {
    pub fn new(
        node_id: String,
        mounter: Arc<dyn Mounter>,
        store: Arc<dyn ObjectStore>,
        keys: KeyStore,
    ) -> Self {
        Self {
            node_id,
            mounter,
            store,
            keys,
            mounts: MountTable::new(),
            registry: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn MountRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    /// Validate that a path is safe to hand to the mount helper.
    /// Returns an error if the path contains dangerous characters.
    fn validate_path(path: &str) -> Result<(), Status> {
        if path.is_empty() {
            return Err(Status::invalid_argument("Path cannot be empty"));
        }

        // Check for absolute path
        if !path.starts_with('/') {
            return Err(Status::invalid_argument("Path must be absolute"));
        }

        // Disallow dangerous characters that could enable shell injection
        let dangerous_chars = [
            ';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r', '\0',
        ];
        if let Some(c) = path.chars().find(|c| dangerous_chars.contains(c)) {
            return Err(Status::invalid_argument(format!(
                "Path contains dangerous character: '{}'",
                c.escape_default()
            )));
        }

        // Disallow path traversal
        if Path::new(path)
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Status::invalid_argument(
                "Path cannot contain '..' (path traversal)",
            ));
        }

        Ok(())
    }

    fn validate_volume(volume_id: &str, target_path: &str) -> Result<(), Status> {
        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        Self::validate_path(target_path)
    }

    async fn remember(&self, req: &csi::NodePublishVolumeRequest, options: &VolumeOptions) {
        let Some(registry) = &self.registry else {
            return;
        };
        let record = MountRecord {
            node: self.node_id.clone(),
            target_path: PathBuf::from(&req.target_path),
            volume_handle: req.volume_id.clone(),
            options: options.to_context().into_iter().collect::<BTreeMap<_, _>>(),
            pod: PodRef::from_context(&req.volume_context),
        };
        if let Err(e) = registry.create(&record).await {
            warn!(volume_id = %req.volume_id, error = %e, "Failed to store mount record");
        }
    }

    async fn forget(&self, volume_id: &str, target_path: &Path) {
        let Some(registry) = &self.registry else {
            return;
        };
        let name = record_name(volume_id, target_path, &self.node_id);
        if let Err(e) = registry.delete(&name).await {
            warn!(volume_id = %volume_id, record = %name, error = %e, "Failed to delete mount record");
        }
    }

    async fn do_publish(
        &self,
        req: csi::NodePublishVolumeRequest,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        Self::validate_volume(&req.volume_id, &req.target_path)?;
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("Volume capability is required"))?;
        let mount_flags = match &capability.access_type {
            Some(csi::volume_capability::AccessType::Mount(mount)) => mount.mount_flags.as_slice(),
            _ => return Err(Status::invalid_argument("Only mount access is supported")),
        };

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            read_only = req.readonly,
            "NodePublishVolume request"
        );

        let target = PathBuf::from(&req.target_path);
        let mut slot = self
            .mounts
            .lock(MountKey::new(&req.volume_id, &target))
            .await;

        if let Some(entry) = slot.entry_mut() {
            entry.ref_count += 1;
            info!(
                volume_id = %req.volume_id,
                ref_count = entry.ref_count,
                "Volume already published at target"
            );
            return Ok(Response::new(csi::NodePublishVolumeResponse {}));
        }

        let options = VolumeOptions::resolve(
            VolumeOptions::mount_defaults(&req.volume_id),
            &[
                OptionSource::Secrets(&req.secrets),
                OptionSource::MountFlags(mount_flags),
                OptionSource::Parameters(&req.volume_context),
            ],
        );
        let bucket = options
            .bucket
            .clone()
            .unwrap_or_else(|| req.volume_id.clone());
        let flags = options.fuse_flags();

        let key_file = self.keys.for_mount(&req.volume_context, &req.secrets)?;

        if let Err(e) = self.store.list_objects(key_file.path(), &bucket, 1).await {
            error!(bucket = %bucket, error = %e, "Bucket is not reachable");
            credentials::discard(key_file);
            return Err(e.into());
        }

        let already_mounted = match self.mounter.is_mounted(&target).await {
            Ok(mounted) => mounted,
            Err(e) => {
                credentials::discard(key_file);
                return Err(e.into());
            }
        };

        if already_mounted {
            info!(target_path = %req.target_path, "Target already mounted, adopting it");
        } else {
            let request = MountRequest {
                bucket: bucket.clone(),
                target: target.clone(),
                key_file: key_file.path().map(Path::to_path_buf),
                flags: flags.clone(),
                read_only: req.readonly,
            };
            if let Err(e) = self.mounter.mount(&request).await {
                error!(volume_id = %req.volume_id, error = %e, "Mount failed");
                metrics::record_mount_failure(e.reason());
                credentials::discard(key_file);
                return Err(e.into());
            }
        }

        slot.insert(MountEntry {
            bucket,
            target_path: target,
            ref_count: 1,
            flags,
            read_only: req.readonly,
            key_file,
        });
        metrics::set_active_mounts(self.mounts.active_mounts());

        self.remember(&req, &options).await;

        info!(volume_id = %req.volume_id, target_path = %req.target_path, "Volume published successfully");
        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    async fn do_unpublish(
        &self,
        req: csi::NodeUnpublishVolumeRequest,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        Self::validate_volume(&req.volume_id, &req.target_path)?;

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "NodeUnpublishVolume request"
        );

        let target = PathBuf::from(&req.target_path);
        let mut slot = self
            .mounts
            .lock(MountKey::new(&req.volume_id, &target))
            .await;

        let Some(entry) = slot.entry_mut() else {
            info!(volume_id = %req.volume_id, "Volume not published at target, nothing to do");
            return Ok(Response::new(csi::NodeUnpublishVolumeResponse {}));
        };

        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            info!(
                volume_id = %req.volume_id,
                ref_count = entry.ref_count,
                "Target still in use"
            );
            return Ok(Response::new(csi::NodeUnpublishVolumeResponse {}));
        }

        let unmounted = match self.mounter.is_mounted(&target).await {
            Ok(true) => self.mounter.unmount(&target).await,
            Ok(false) => {
                debug!(target_path = %req.target_path, "Target already unmounted");
                Ok(())
            }
            Err(e) => Err(e),
        };
        if let Err(e) = unmounted {
            error!(volume_id = %req.volume_id, error = %e, "Unmount failed");
            metrics::record_mount_failure(e.reason());
            if let Some(entry) = slot.entry_mut() {
                entry.ref_count += 1;
            }
            return Err(e.into());
        }

        if let Some(entry) = slot.take() {
            credentials::discard(entry.key_file);
        }
        metrics::set_active_mounts(self.mounts.active_mounts());
        drop(slot);

        self.forget(&req.volume_id, &target).await;

        info!(volume_id = %req.volume_id, target_path = %req.target_path, "Volume unpublished successfully");
        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    async fn do_expand(
        &self,
        req: csi::NodeExpandVolumeRequest,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if req.volume_path.is_empty() {
            return Err(Status::invalid_argument("Volume path is required"));
        }
        Self::validate_path(&req.volume_path)?;

        info!(volume_id = %req.volume_id, volume_path = %req.volume_path, "NodeExpandVolume request");

        let state = self.mounter.probe(Path::new(&req.volume_path)).await?;
        if state == MountState::NotMounted {
            return Err(Status::not_found(format!(
                "Volume path {} is not mounted",
                req.volume_path
            )));
        }

        let capacity_bytes = match req.capacity_range {
            Some(r) if r.required_bytes > 0 => r.required_bytes,
            Some(r) => r.limit_bytes.max(0),
            None => 0,
        };
        Ok(Response::new(csi::NodeExpandVolumeResponse { capacity_bytes }))
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        observe("node_stage_volume", request, |_| async {
            Err(Status::unimplemented("NodeStageVolume is not supported"))
        })
        .await
    }

    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        observe("node_unstage_volume", request, |_| async {
            Err(Status::unimplemented("NodeUnstageVolume is not supported"))
        })
        .await
    }

    /// Mount the bucket at the target path.
    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        observe("node_publish_volume", request, move |r| {
            self.do_publish(r.into_inner())
        })
        .await
    }

    /// Drop one publish, unmounting after the last.
    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        observe("node_unpublish_volume", request, move |r| {
            self.do_unpublish(r.into_inner())
        })
        .await
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        observe("node_get_volume_stats", request, |_| async {
            Err(Status::unimplemented("NodeGetVolumeStats is not supported"))
        })
        .await
    }

    async fn node_expand_volume(
        &self,
        request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        observe("node_expand_volume", request, move |r| {
            self.do_expand(r.into_inner())
        })
        .await
    }

    async fn node_get_capabilities(
        &self,
        request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        use csi::node_service_capability::rpc::Type;

        observe("node_get_capabilities", request, |_| async {
            Ok(Response::new(csi::NodeGetCapabilitiesResponse {
                capabilities: vec![csi::NodeServiceCapability {
                    r#type: Some(csi::node_service_capability::Type::Rpc(
                        csi::node_service_capability::Rpc {
                            r#type: Type::ExpandVolume as i32,
                        },
                    )),
                }],
            }))
        })
        .await
    }

    async fn node_get_info(
        &self,
        request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        observe("node_get_info", request, move |_| async move {
            info!(node_id = %self.node_id, "NodeGetInfo request");

            Ok(Response::new(csi::NodeGetInfoResponse {
                node_id: self.node_id.clone(),
                max_volumes_per_node: 0, // No limit
                accessible_topology: None,
            }))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path_valid() {
        assert!(NodeService::validate_path("/var/lib/kubelet/pods/abc/volumes/kubernetes.io~csi/pv/mount").is_ok());
        assert!(NodeService::validate_path("/mnt/volume").is_ok());
        assert!(NodeService::validate_path("/mnt/my..volume").is_ok());
    }

    #[test]
    fn test_validate_path_invalid() {
        // Empty path
        assert!(NodeService::validate_path("").is_err());

        // Relative path
        assert!(NodeService::validate_path("var/lib").is_err());

        // Path traversal
        assert!(NodeService::validate_path("/var/../etc").is_err());

        // Dangerous characters
        assert!(NodeService::validate_path("/var;ls").is_err());
        assert!(NodeService::validate_path("/var|cat").is_err());
        assert!(NodeService::validate_path("/var$HOME").is_err());
        assert!(NodeService::validate_path("/var`id`").is_err());
        assert!(NodeService::validate_path("/var\nx").is_err());
    }

    #[test]
    fn test_validate_volume() {
        let status = NodeService::validate_volume("", "/mnt/t").unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(NodeService::validate_volume("bucket", "/mnt/t").is_ok());
    }
}
