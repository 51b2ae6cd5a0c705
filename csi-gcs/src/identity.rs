//! CSI Identity Service Implementation
//!
//! Provides plugin identification and capability reporting to Kubernetes.

use serde::Serialize;
use tonic::{Request, Response, Status};

use crate::csi;
use crate::logging::observe;

pub const DRIVER_NAME: &str = "gcs.csi.io";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VersionInfo {
    driver_version: &'static str,
    target_family: &'static str,
    platform: String,
}

/// Build information as a JSON document.
pub fn version_json() -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&VersionInfo {
        driver_version: DRIVER_VERSION,
        target_family: std::env::consts::FAMILY,
        platform: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
    })
}

/// CSI Identity Service
///
/// Implements the CSI Identity service which provides:
/// - Plugin identification (name and version)
/// - Plugin capability reporting
/// - Readiness probing
pub struct IdentityService {
    driver_name: String,
}

impl IdentityService {
    pub fn new(driver_name: impl Into<String>) -> Self {
        Self {
            driver_name: driver_name.into(),
        }
    }
}

impl Default for IdentityService {
    fn default() -> Self {
        Self::new(DRIVER_NAME)
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    /// Returns the name and version of the CSI plugin.
    async fn get_plugin_info(
        &self,
        request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        observe("get_plugin_info", request, move |_| async move {
            Ok(Response::new(csi::GetPluginInfoResponse {
                name: self.driver_name.clone(),
                vendor_version: DRIVER_VERSION.to_string(),
                manifest: std::collections::HashMap::new(),
            }))
        })
        .await
    }

    /// Returns the capabilities of the CSI plugin.
    async fn get_plugin_capabilities(
        &self,
        request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        observe("get_plugin_capabilities", request, move |_| async move {
            // Controller service and online volume expansion
            let capabilities = vec![
                csi::PluginCapability {
                    r#type: Some(csi::plugin_capability::Type::Service(
                        csi::plugin_capability::Service {
                            r#type: csi::plugin_capability::service::Type::ControllerService
                                as i32,
                        },
                    )),
                },
                csi::PluginCapability {
                    r#type: Some(csi::plugin_capability::Type::VolumeExpansion(
                        csi::plugin_capability::VolumeExpansion {
                            r#type: csi::plugin_capability::volume_expansion::Type::Online as i32,
                        },
                    )),
                },
            ];

            Ok(Response::new(csi::GetPluginCapabilitiesResponse { capabilities }))
        })
        .await
    }

    /// Probes the plugin to check if it is ready.
    async fn probe(
        &self,
        request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        observe("probe", request, move |_| async move {
            Ok(Response::new(csi::ProbeResponse { ready: Some(true) }))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csi::identity_server::Identity;

    #[tokio::test]
    async fn test_get_plugin_info() {
        let service = IdentityService::new("custom.gcs.csi.io");
        let request = Request::new(csi::GetPluginInfoRequest {});
        let response = Identity::get_plugin_info(&service, request).await.unwrap();
        let info = response.into_inner();

        assert_eq!(info.name, "custom.gcs.csi.io");
        assert_eq!(info.vendor_version, DRIVER_VERSION);
    }

    #[tokio::test]
    async fn test_get_plugin_capabilities() {
        let service = IdentityService::default();
        let request = Request::new(csi::GetPluginCapabilitiesRequest {});
        let response = Identity::get_plugin_capabilities(&service, request).await.unwrap();
        let caps = response.into_inner();

        assert_eq!(caps.capabilities.len(), 2);
        assert!(caps.capabilities.iter().any(|c| matches!(
            c.r#type,
            Some(csi::plugin_capability::Type::VolumeExpansion(_))
        )));
    }

    #[tokio::test]
    async fn test_probe() {
        let service = IdentityService::default();
        let request = Request::new(csi::ProbeRequest {});
        let response = Identity::probe(&service, request).await.unwrap();

        assert_eq!(response.into_inner().ready, Some(true));
    }

    #[test]
    fn test_version_json() {
        let value: serde_json::Value = serde_json::from_str(&version_json().unwrap()).unwrap();
        assert_eq!(value["driverVersion"], DRIVER_VERSION);
        assert_eq!(
            value["platform"],
            format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH)
        );
    }
}
