//! CSI Controller Service Implementation
//!
//! Provisions buckets as volumes and snapshots. Capacity, type and lineage
//! live in bucket labels, so every operation is a read-check-write against
//! the object store and is safe to retry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use prost_types::Timestamp;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::bucket::{
    BucketAttrs, BucketKind, LABEL_TYPE, capacity_label, derive_bucket_name, snapshot_labels,
    volume_labels,
};
use crate::credentials::{self, KeyStore};
use crate::csi;
use crate::logging::observe;
use crate::options::{DEFAULT_LOCATION, OptionSource, VolumeOptions};
use crate::registry::ClusterApi;
use crate::storage::{NewBucket, ObjectStore, StoreError};

/// Default bound on a content copy for clones and snapshots.
pub const DEFAULT_COPY_TIMEOUT: Duration = Duration::from_secs(3600);

/// Parameters the external provisioner adds for the claim being served.
pub const PVC_NAME_PARAMETER: &str = "csi.storage.k8s.io/pvc/name";
pub const PVC_NAMESPACE_PARAMETER: &str = "csi.storage.k8s.io/pvc/namespace";

/// CSI Controller Service
///
/// Implements the CSI Controller service which handles:
/// - Volume creation (optionally cloned from a volume or snapshot) and deletion
/// - Capacity expansion
/// - Snapshot creation and deletion
/// - Capability reporting
pub struct ControllerService {
    store: Arc<dyn ObjectStore>,
    keys: KeyStore,
    /// Source of claim annotations, when cluster integration is enabled.
    cluster: Option<Arc<dyn ClusterApi>>,
    copy_timeout: Duration,
}

impl ControllerService {
    pub fn new(store: Arc<dyn ObjectStore>, keys: KeyStore) -> Self {
        Self {
            store,
            keys,
            cluster: None,
            copy_timeout: DEFAULT_COPY_TIMEOUT,
        }
    }

    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterApi>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn with_copy_timeout(mut self, timeout: Duration) -> Self {
        self.copy_timeout = timeout;
        self
    }

    /// Requested size: required bytes, then limit bytes, then zero.
    fn requested_capacity(range: Option<&csi::CapacityRange>) -> i64 {
        match range {
            Some(r) if r.required_bytes > 0 => r.required_bytes,
            Some(r) if r.limit_bytes > 0 => r.limit_bytes,
            _ => 0,
        }
    }

    /// Every capability must ask for filesystem (mount) access.
    fn validate_capabilities(capabilities: &[csi::VolumeCapability]) -> Result<(), Status> {
        if capabilities.is_empty() {
            return Err(Status::invalid_argument("Volume capabilities are required"));
        }
        for capability in capabilities {
            match capability.access_type {
                Some(csi::volume_capability::AccessType::Mount(_)) => {}
                Some(csi::volume_capability::AccessType::Block(_)) => {
                    return Err(Status::invalid_argument("Block volumes are not supported"));
                }
                None => {
                    return Err(Status::invalid_argument(
                        "Volume capability has no access type, only mount access is supported",
                    ));
                }
            }
        }
        Ok(())
    }

    fn mount_flags(capability: &csi::VolumeCapability) -> Option<&[String]> {
        match &capability.access_type {
            Some(csi::volume_capability::AccessType::Mount(mount)) => {
                Some(mount.mount_flags.as_slice())
            }
            _ => None,
        }
    }

    /// Annotations of the claim behind a CreateVolume call, if known.
    async fn claim_annotations(&self, parameters: &HashMap<String, String>) -> HashMap<String, String> {
        let (Some(cluster), Some(name), Some(namespace)) = (
            self.cluster.as_ref(),
            parameters.get(PVC_NAME_PARAMETER),
            parameters.get(PVC_NAMESPACE_PARAMETER),
        ) else {
            return HashMap::new();
        };

        match cluster.pvc_annotations(namespace, name).await {
            Ok(annotations) => annotations,
            Err(e) => {
                warn!(pvc = %name, namespace = %namespace, error = %e, "Failed to read claim annotations");
                HashMap::new()
            }
        }
    }

    /// Fetch a bucket that must exist and carry `kind`.
    async fn require_bucket(
        &self,
        key_file: Option<&Path>,
        name: &str,
        kind: BucketKind,
    ) -> Result<BucketAttrs, Status> {
        let attrs = self
            .store
            .get_bucket(key_file, name)
            .await?
            .ok_or_else(|| Status::not_found(format!("{} {} does not exist", kind, name)))?;
        if !attrs.is_kind(kind) {
            return Err(Status::failed_precondition(format!(
                "Bucket {} is not a {}",
                name, kind
            )));
        }
        Ok(attrs)
    }

    fn project_id(options: &VolumeOptions, bucket: &str) -> Result<String, Status> {
        options
            .project_id
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                Status::invalid_argument(format!("projectId is required to create bucket {}", bucket))
            })
    }

    async fn copy_content(
        &self,
        key_file: Option<&Path>,
        source: &str,
        destination: &str,
    ) -> Result<(), Status> {
        info!(source = %source, destination = %destination, "Copying bucket content");
        match tokio::time::timeout(
            self.copy_timeout,
            self.store.copy_objects(key_file, source, destination),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(Status::deadline_exceeded(format!(
                "Copying {} to {} did not finish within {:?}",
                source, destination, self.copy_timeout
            ))),
        }
    }

    /// Resolve and check a clone source, returning its bucket.
    async fn content_source_bucket(
        &self,
        key_file: Option<&Path>,
        source: Option<&csi::VolumeContentSource>,
    ) -> Result<Option<String>, Status> {
        use csi::volume_content_source::Type;

        let Some(source) = source else {
            return Ok(None);
        };
        let (bucket, kind) = match &source.r#type {
            Some(Type::Snapshot(s)) => (&s.snapshot_id, BucketKind::Snapshot),
            Some(Type::Volume(v)) => (&v.volume_id, BucketKind::Volume),
            None => return Err(Status::invalid_argument("Volume content source has no type")),
        };
        if bucket.is_empty() {
            return Err(Status::invalid_argument("Volume content source id is required"));
        }
        self.require_bucket(key_file, bucket, kind).await?;
        Ok(Some(bucket.clone()))
    }

    /// Bring an existing bucket in line with a CreateVolume request and
    /// return its capacity.
    async fn adopt_existing_volume(
        &self,
        key_file: Option<&Path>,
        attrs: &BucketAttrs,
        derived_name: &str,
        capacity: i64,
    ) -> Result<i64, Status> {
        match attrs.kind() {
            Some(BucketKind::Volume) => {}
            None if !attrs.labels.contains_key(LABEL_TYPE) && attrs.name == derived_name => {
                // Created by an earlier attempt that failed before labeling
                warn!(bucket = %attrs.name, "Completing labels of a partially created volume");
                self.store
                    .update_labels(key_file, &attrs.name, &volume_labels(capacity))
                    .await?;
                return Ok(capacity);
            }
            _ => {
                return Err(Status::failed_precondition(format!(
                    "Bucket {} exists and is not a volume",
                    attrs.name
                )));
            }
        }

        match attrs.capacity() {
            None => {
                self.store
                    .update_labels(key_file, &attrs.name, &capacity_label(capacity))
                    .await?;
                Ok(capacity)
            }
            Some(existing) if existing < capacity => Err(Status::already_exists(format!(
                "Volume {} exists with capacity {} smaller than the requested {}",
                attrs.name, existing, capacity
            ))),
            Some(existing) => Ok(existing),
        }
    }

    async fn do_create_volume(
        &self,
        req: csi::CreateVolumeRequest,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        if req.name.is_empty() {
            return Err(Status::invalid_argument("Volume name is required"));
        }
        Self::validate_capabilities(&req.volume_capabilities)?;

        info!(name = %req.name, "CreateVolume request");

        let annotations = self.claim_annotations(&req.parameters).await;
        let derived_name = derive_bucket_name(&req.name);

        let mut sources = vec![OptionSource::Secrets(&req.secrets)];
        sources.extend(
            req.volume_capabilities
                .iter()
                .filter_map(Self::mount_flags)
                .map(OptionSource::MountFlags),
        );
        sources.push(OptionSource::Annotations(&annotations));
        sources.push(OptionSource::Parameters(&req.parameters));
        let options = VolumeOptions::resolve(
            VolumeOptions::provisioning_defaults(derived_name.clone()),
            &sources,
        );

        let bucket = options.bucket.clone().unwrap_or_else(|| derived_name.clone());
        let capacity = Self::requested_capacity(req.capacity_range.as_ref());
        debug!(bucket = %bucket, capacity, "Resolved volume options");

        let key = self.keys.from_secrets(&req.secrets)?;
        let result = self
            .provision_volume(key.path(), &req, &options, &bucket, &derived_name, capacity)
            .await;
        credentials::discard(key);
        let capacity_bytes = result?;

        info!(volume_id = %bucket, capacity_bytes, "Volume created successfully");

        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some(csi::Volume {
                capacity_bytes,
                volume_id: bucket,
                volume_context: options.to_context(),
                content_source: req.volume_content_source,
                accessible_topology: vec![],
            }),
        }))
    }

    async fn provision_volume(
        &self,
        key_file: Option<&Path>,
        req: &csi::CreateVolumeRequest,
        options: &VolumeOptions,
        bucket: &str,
        derived_name: &str,
        capacity: i64,
    ) -> Result<i64, Status> {
        let source = self
            .content_source_bucket(key_file, req.volume_content_source.as_ref())
            .await?;

        let stored_capacity = match self.store.get_bucket(key_file, bucket).await? {
            Some(attrs) => {
                debug!(bucket = %bucket, "Bucket already exists");
                self.adopt_existing_volume(key_file, &attrs, derived_name, capacity)
                    .await?
            }
            None => {
                let new_bucket = NewBucket {
                    name: bucket.to_string(),
                    project_id: Self::project_id(options, bucket)?,
                    location: options
                        .location
                        .clone()
                        .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
                    kms_key_id: options.kms_key_id.clone(),
                    labels: volume_labels(capacity),
                };
                self.store.create_bucket(key_file, &new_bucket).await?;
                capacity
            }
        };

        if let Some(source) = source {
            self.copy_content(key_file, &source, bucket).await?;
        }
        Ok(stored_capacity)
    }

    /// Shared DeleteVolume / DeleteSnapshot path. A missing bucket is
    /// already deleted.
    async fn delete_typed(
        &self,
        key_file: Option<&Path>,
        name: &str,
        kind: BucketKind,
    ) -> Result<(), Status> {
        let Some(attrs) = self.store.get_bucket(key_file, name).await? else {
            info!(bucket = %name, "Bucket not found, treating as already deleted");
            return Ok(());
        };
        if !attrs.is_kind(kind) {
            return Err(Status::failed_precondition(format!(
                "Bucket {} is not a {}",
                name, kind
            )));
        }
        match self.store.delete_bucket(key_file, name).await {
            Ok(()) | Err(StoreError::BucketNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn do_delete_volume(
        &self,
        req: csi::DeleteVolumeRequest,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }

        info!(volume_id = %req.volume_id, "DeleteVolume request");

        let key = self.keys.from_secrets(&req.secrets)?;
        let result = self
            .delete_typed(key.path(), &req.volume_id, BucketKind::Volume)
            .await;
        credentials::discard(key);
        result?;

        info!(volume_id = %req.volume_id, "Volume deleted successfully");
        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    async fn do_validate_volume_capabilities(
        &self,
        req: csi::ValidateVolumeCapabilitiesRequest,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("Volume capabilities are required"));
        }

        let key = self.keys.from_secrets(&req.secrets)?;
        let result = self
            .require_bucket(key.path(), &req.volume_id, BucketKind::Volume)
            .await;
        credentials::discard(key);
        result?;

        let unsupported = req.volume_capabilities.iter().any(|c| {
            !matches!(
                c.access_type,
                Some(csi::volume_capability::AccessType::Mount(_))
            )
        });
        if unsupported {
            return Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: "Only mount access is supported".to_string(),
            }));
        }

        Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
                parameters: req.parameters,
            }),
            message: String::new(),
        }))
    }

    async fn do_create_snapshot(
        &self,
        req: csi::CreateSnapshotRequest,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        if req.name.is_empty() {
            return Err(Status::invalid_argument("Snapshot name is required"));
        }
        if req.source_volume_id.is_empty() {
            return Err(Status::invalid_argument("Source volume ID is required"));
        }

        info!(
            name = %req.name,
            source_volume_id = %req.source_volume_id,
            "CreateSnapshot request"
        );

        let key = self.keys.from_secrets(&req.secrets)?;
        let result = self.take_snapshot(key.path(), &req).await;
        credentials::discard(key);
        let snapshot = result?;

        info!(
            snapshot_id = %snapshot.snapshot_id,
            size_bytes = snapshot.size_bytes,
            "Snapshot created successfully"
        );
        Ok(Response::new(csi::CreateSnapshotResponse {
            snapshot: Some(snapshot),
        }))
    }

    async fn take_snapshot(
        &self,
        key_file: Option<&Path>,
        req: &csi::CreateSnapshotRequest,
    ) -> Result<csi::Snapshot, Status> {
        let source = self
            .require_bucket(key_file, &req.source_volume_id, BucketKind::Volume)
            .await?;

        let derived_name = derive_bucket_name(&req.name);
        let options = VolumeOptions::resolve(
            VolumeOptions::provisioning_defaults(derived_name.clone()),
            &[
                OptionSource::Secrets(&req.secrets),
                OptionSource::Parameters(&req.parameters),
            ],
        );
        let snapshot_bucket = options.bucket.clone().unwrap_or(derived_name);

        match self.store.get_bucket(key_file, &snapshot_bucket).await? {
            Some(existing) => {
                if !existing.is_kind(BucketKind::Snapshot) {
                    return Err(Status::failed_precondition(format!(
                        "Bucket {} exists and is not a snapshot",
                        snapshot_bucket
                    )));
                }
                if existing.source_volume() != Some(req.source_volume_id.as_str()) {
                    return Err(Status::already_exists(format!(
                        "Snapshot {} already exists for a different source volume",
                        snapshot_bucket
                    )));
                }
                debug!(snapshot_id = %snapshot_bucket, "Snapshot bucket already exists");
            }
            None => {
                let new_bucket = NewBucket {
                    name: snapshot_bucket.clone(),
                    project_id: Self::project_id(&options, &snapshot_bucket)?,
                    location: options
                        .location
                        .clone()
                        .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
                    kms_key_id: options.kms_key_id.clone(),
                    labels: snapshot_labels(&req.source_volume_id),
                };
                self.store.create_bucket(key_file, &new_bucket).await?;
            }
        }

        self.copy_content(key_file, &req.source_volume_id, &snapshot_bucket)
            .await?;

        Ok(csi::Snapshot {
            size_bytes: source.capacity().unwrap_or(0),
            snapshot_id: snapshot_bucket,
            source_volume_id: req.source_volume_id.clone(),
            creation_time: Some(Timestamp::from(SystemTime::now())),
            ready_to_use: true,
        })
    }

    async fn do_delete_snapshot(
        &self,
        req: csi::DeleteSnapshotRequest,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        if req.snapshot_id.is_empty() {
            return Err(Status::invalid_argument("Snapshot ID is required"));
        }

        info!(snapshot_id = %req.snapshot_id, "DeleteSnapshot request");

        let key = self.keys.from_secrets(&req.secrets)?;
        let result = self
            .delete_typed(key.path(), &req.snapshot_id, BucketKind::Snapshot)
            .await;
        credentials::discard(key);
        result?;

        info!(snapshot_id = %req.snapshot_id, "Snapshot deleted successfully");
        Ok(Response::new(csi::DeleteSnapshotResponse {}))
    }

    async fn do_expand_volume(
        &self,
        req: csi::ControllerExpandVolumeRequest,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        let Some(range) = req.capacity_range.as_ref() else {
            return Err(Status::invalid_argument(
                "Capacity range is required for volume expansion",
            ));
        };
        let requested = Self::requested_capacity(Some(range));

        info!(
            volume_id = %req.volume_id,
            requested_bytes = requested,
            "ControllerExpandVolume request"
        );

        let key = self.keys.from_secrets(&req.secrets)?;
        let result = self.grow(key.path(), &req.volume_id, requested).await;
        credentials::discard(key);
        let capacity_bytes = result?;

        info!(volume_id = %req.volume_id, capacity_bytes, "Volume capacity updated");
        Ok(Response::new(csi::ControllerExpandVolumeResponse {
            capacity_bytes,
            // Capacity is a logical ceiling; the mount needs no change
            node_expansion_required: false,
        }))
    }

    /// Raise the capacity label to `requested`, never lowering it.
    async fn grow(
        &self,
        key_file: Option<&Path>,
        volume_id: &str,
        requested: i64,
    ) -> Result<i64, Status> {
        let attrs = self
            .require_bucket(key_file, volume_id, BucketKind::Volume)
            .await?;
        let current = attrs.capacity().unwrap_or(0);
        if requested <= current {
            debug!(volume_id = %volume_id, current, requested, "Capacity already sufficient");
            return Ok(current);
        }
        self.store
            .update_labels(key_file, volume_id, &capacity_label(requested))
            .await?;
        Ok(requested)
    }

    fn capabilities() -> Vec<csi::ControllerServiceCapability> {
        use csi::controller_service_capability::rpc::Type;

        [
            Type::CreateDeleteVolume,
            Type::ExpandVolume,
            Type::CreateDeleteSnapshot,
            Type::CloneVolume,
        ]
        .into_iter()
        .map(|rpc| csi::ControllerServiceCapability {
            r#type: Some(csi::controller_service_capability::Type::Rpc(
                csi::controller_service_capability::Rpc { r#type: rpc as i32 },
            )),
        })
        .collect()
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    /// Create a new volume.
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        observe("create_volume", request, move |r| {
            self.do_create_volume(r.into_inner())
        })
        .await
    }

    /// Delete a volume.
    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        observe("delete_volume", request, move |r| {
            self.do_delete_volume(r.into_inner())
        })
        .await
    }

    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        observe("controller_publish_volume", request, |_| async {
            Err(Status::unimplemented("ControllerPublishVolume is not supported"))
        })
        .await
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        observe("controller_unpublish_volume", request, |_| async {
            Err(Status::unimplemented("ControllerUnpublishVolume is not supported"))
        })
        .await
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        observe("validate_volume_capabilities", request, move |r| {
            self.do_validate_volume_capabilities(r.into_inner())
        })
        .await
    }

    async fn list_volumes(
        &self,
        request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        observe("list_volumes", request, |_| async {
            Err(Status::unimplemented("ListVolumes is not supported"))
        })
        .await
    }

    async fn get_capacity(
        &self,
        request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        observe("get_capacity", request, |_| async {
            Err(Status::unimplemented("GetCapacity is not supported"))
        })
        .await
    }

    /// Report controller capabilities.
    async fn controller_get_capabilities(
        &self,
        request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        observe("controller_get_capabilities", request, |_| async {
            Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
                capabilities: Self::capabilities(),
            }))
        })
        .await
    }

    /// Create a snapshot.
    async fn create_snapshot(
        &self,
        request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        observe("create_snapshot", request, move |r| {
            self.do_create_snapshot(r.into_inner())
        })
        .await
    }

    /// Delete a snapshot.
    async fn delete_snapshot(
        &self,
        request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        observe("delete_snapshot", request, move |r| {
            self.do_delete_snapshot(r.into_inner())
        })
        .await
    }

    async fn list_snapshots(
        &self,
        request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        observe("list_snapshots", request, |_| async {
            Err(Status::unimplemented("ListSnapshots is not supported"))
        })
        .await
    }

    /// Expand a volume.
    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        observe("controller_expand_volume", request, move |r| {
            self.do_expand_volume(r.into_inner())
        })
        .await
    }

    async fn controller_get_volume(
        &self,
        request: Request<csi::ControllerGetVolumeRequest>,
    ) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        observe("controller_get_volume", request, |_| async {
            Err(Status::unimplemented("ControllerGetVolume is not supported"))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount_capability(flags: &[&str]) -> csi::VolumeCapability {
        csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(
                csi::volume_capability::MountVolume {
                    fs_type: String::new(),
                    mount_flags: flags.iter().map(|f| f.to_string()).collect(),
                },
            )),
            access_mode: None,
        }
    }

    #[test]
    fn test_requested_capacity() {
        let range = |required, limit| csi::CapacityRange {
            required_bytes: required,
            limit_bytes: limit,
        };
        assert_eq!(ControllerService::requested_capacity(None), 0);
        assert_eq!(ControllerService::requested_capacity(Some(&range(10, 20))), 10);
        assert_eq!(ControllerService::requested_capacity(Some(&range(0, 20))), 20);
        assert_eq!(ControllerService::requested_capacity(Some(&range(-1, 0))), 0);
    }

    #[test]
    fn test_validate_capabilities() {
        assert!(ControllerService::validate_capabilities(&[]).is_err());
        assert!(ControllerService::validate_capabilities(&[mount_capability(&[])]).is_ok());

        let block = csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Block(
                csi::volume_capability::BlockVolume {},
            )),
            access_mode: None,
        };
        let status =
            ControllerService::validate_capabilities(&[mount_capability(&[]), block]).unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let untyped = csi::VolumeCapability {
            access_type: None,
            access_mode: None,
        };
        let status = ControllerService::validate_capabilities(&[untyped]).unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn test_capabilities() {
        use csi::controller_service_capability::rpc::Type;

        let advertised: Vec<i32> = ControllerService::capabilities()
            .into_iter()
            .filter_map(|c| match c.r#type {
                Some(csi::controller_service_capability::Type::Rpc(rpc)) => Some(rpc.r#type),
                None => None,
            })
            .collect();
        assert_eq!(
            advertised,
            vec![
                Type::CreateDeleteVolume as i32,
                Type::ExpandVolume as i32,
                Type::CreateDeleteSnapshot as i32,
                Type::CloneVolume as i32,
            ]
        );
    }
}
