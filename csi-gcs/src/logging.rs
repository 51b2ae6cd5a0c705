//! Per-RPC logging and metrics.
//!
//! Every service method runs through [`observe`], which logs the request
//! with secret values replaced, times the call and logs failures with
//! their status code.

use std::fmt::Debug;
use std::future::Future;

use tonic::{Request, Response, Status};
use tracing::{debug, error};

use crate::csi;
use crate::metrics::OperationTimer;

/// Replacement for every secret value in logged requests.
pub const STRIPPED: &str = "***stripped***";

/// Debug rendering of a request that is safe to log.
pub trait Sanitize: Debug {
    fn sanitized(&self) -> String;
}

/// Requests carrying a `secrets` map.
macro_rules! sanitize_secrets {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Sanitize for $ty {
                fn sanitized(&self) -> String {
                    let mut copy = self.clone();
                    copy.secrets
                        .values_mut()
                        .for_each(|value| *value = STRIPPED.to_string());
                    format!("{:?}", copy)
                }
            }
        )*
    };
}

/// Requests with nothing to hide.
macro_rules! sanitize_plain {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Sanitize for $ty {
                fn sanitized(&self) -> String {
                    format!("{:?}", self)
                }
            }
        )*
    };
}

sanitize_secrets!(
    csi::CreateVolumeRequest,
    csi::DeleteVolumeRequest,
    csi::ControllerPublishVolumeRequest,
    csi::ControllerUnpublishVolumeRequest,
    csi::ValidateVolumeCapabilitiesRequest,
    csi::CreateSnapshotRequest,
    csi::DeleteSnapshotRequest,
    csi::ListSnapshotsRequest,
    csi::ControllerExpandVolumeRequest,
    csi::NodeStageVolumeRequest,
    csi::NodePublishVolumeRequest,
);

sanitize_plain!(
    csi::GetPluginInfoRequest,
    csi::GetPluginCapabilitiesRequest,
    csi::ProbeRequest,
    csi::ListVolumesRequest,
    csi::GetCapacityRequest,
    csi::ControllerGetCapabilitiesRequest,
    csi::ControllerGetVolumeRequest,
    csi::NodeUnstageVolumeRequest,
    csi::NodeUnpublishVolumeRequest,
    csi::NodeGetVolumeStatsRequest,
    csi::NodeExpandVolumeRequest,
    csi::NodeGetCapabilitiesRequest,
    csi::NodeGetInfoRequest,
);

/// Run one RPC handler with logging and metrics around it.
pub async fn observe<Req, Resp, F, Fut>(
    method: &'static str,
    request: Request<Req>,
    handler: F,
) -> Result<Response<Resp>, Status>
where
    Req: Sanitize,
    Resp: Debug,
    F: FnOnce(Request<Req>) -> Fut,
    Fut: Future<Output = Result<Response<Resp>, Status>>,
{
    debug!(method, request = %request.get_ref().sanitized(), "GRPC call");
    let timer = OperationTimer::new(method);

    match handler(request).await {
        Ok(response) => {
            debug!(method, response = ?response.get_ref(), "GRPC response");
            timer.success();
            Ok(response)
        }
        Err(status) => {
            error!(method, code = ?status.code(), message = %status.message(), "GRPC error");
            timer.failure(&format!("{:?}", status.code()));
            Err(status)
        }
    }
}
