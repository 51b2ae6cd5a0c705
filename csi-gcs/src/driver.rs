//! Process lifecycle: endpoint binding, service assembly, readiness and
//! orphan recovery around the gRPC server.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::UnixListener;
use tokio::signal;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::Status;
use tonic::transport::Server;
use tracing::{error, info, warn};

use crate::controller::ControllerService;
use crate::csi::controller_server::ControllerServer;
use crate::csi::identity_server::IdentityServer;
use crate::csi::node_server::NodeServer;
use crate::identity::IdentityService;
use crate::mounter::Mounter;
use crate::node::NodeService;
use crate::registry::{ClusterApi, MountRegistry, reconcile_orphans, signal_readiness};

const UNIX_SCHEME: &str = "unix://";

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("unsupported endpoint {0}: only unix:// is supported")]
    UnsupportedScheme(String),

    #[error("endpoint {0} has no socket path")]
    MissingPath(String),

    #[error("failed to prepare socket {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<EndpointError> for Status {
    fn from(err: EndpointError) -> Self {
        match &err {
            EndpointError::UnsupportedScheme(_) | EndpointError::MissingPath(_) => {
                Status::invalid_argument(err.to_string())
            }
            EndpointError::Io { .. } => Status::internal(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error("gRPC server error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// Socket path of a `unix://` endpoint.
pub fn parse_endpoint(endpoint: &str) -> Result<PathBuf, EndpointError> {
    let path = endpoint
        .strip_prefix(UNIX_SCHEME)
        .ok_or_else(|| EndpointError::UnsupportedScheme(endpoint.to_string()))?;
    if path.is_empty() {
        return Err(EndpointError::MissingPath(endpoint.to_string()));
    }
    Ok(PathBuf::from(path))
}

/// Bind `path`, replacing a socket left behind by a previous run.
pub fn bind(path: &Path) -> Result<UnixListener, EndpointError> {
    let io_err = |source| EndpointError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_err(e)),
    }
    UnixListener::bind(path).map_err(io_err)
}

/// Cluster hooks run by a node plugin around serving.
pub struct Lifecycle {
    pub node_name: String,
    pub driver_name: String,
    pub cluster: Arc<dyn ClusterApi>,
    pub registry: Arc<dyn MountRegistry>,
    pub mounter: Arc<dyn Mounter>,
    pub delete_orphaned_pods: bool,
}

impl Lifecycle {
    async fn ready(&self, ready: bool) {
        signal_readiness(
            self.cluster.as_ref(),
            &self.node_name,
            &self.driver_name,
            ready,
        )
        .await;
    }

    async fn recover(&self) {
        if !self.delete_orphaned_pods {
            return;
        }
        if let Err(e) = reconcile_orphans(
            &self.node_name,
            self.registry.as_ref(),
            self.cluster.as_ref(),
            self.mounter.as_ref(),
        )
        .await
        {
            warn!(error = %e, "Orphan reconciliation failed");
        }
    }
}

/// The assembled plugin.
pub struct Driver {
    pub identity: IdentityService,
    pub controller: Option<ControllerService>,
    pub node: Option<NodeService>,
    pub lifecycle: Option<Lifecycle>,
}

impl Driver {
    /// Serve on `endpoint` until `shutdown` resolves.
    pub async fn serve<F>(self, endpoint: &str, shutdown: F) -> Result<(), DriverError>
    where
        F: Future<Output = ()>,
    {
        let path = parse_endpoint(endpoint)?;

        if let Some(lifecycle) = &self.lifecycle {
            lifecycle.ready(false).await;
            lifecycle.recover().await;
        }

        let listener = bind(&path)?;
        info!(
            endpoint = %endpoint,
            controller = self.controller.is_some(),
            node = self.node.is_some(),
            "CSI server listening"
        );

        // The server polls this future from its accept loop, so readiness is
        // only advertised once connections are being taken.
        let lifecycle = self.lifecycle;
        let stopping = async {
            if let Some(lifecycle) = &lifecycle {
                lifecycle.ready(true).await;
            }
            shutdown.await;
            info!("Shutdown signal received, draining connections...");
            if let Some(lifecycle) = &lifecycle {
                lifecycle.ready(false).await;
            }
        };

        let result = Server::builder()
            .add_service(IdentityServer::new(self.identity))
            .add_optional_service(self.controller.map(ControllerServer::new))
            .add_optional_service(self.node.map(NodeServer::new))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), stopping)
            .await;

        if let Err(e) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "Failed to remove socket");
        }
        result.map_err(|e| {
            error!(error = %e, "CSI server failed");
            DriverError::from(e)
        })
    }
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or SIGHUP)
pub async fn shutdown_signal() {
    use signal::unix::{SignalKind, signal};

    // Install signal handlers, logging errors but continuing with available handlers
    let install = |kind: SignalKind, name: &str| match signal(kind) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Failed to install {} handler: {}", name, e);
            None
        }
    };
    let mut sigterm = install(SignalKind::terminate(), "SIGTERM");
    let mut sigint = install(SignalKind::interrupt(), "SIGINT");
    let mut sighup = install(SignalKind::hangup(), "SIGHUP");

    // Missing handlers never fire
    async fn recv(stream: Option<&mut signal::unix::Signal>) {
        match stream {
            Some(stream) => {
                stream.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    tokio::select! {
        _ = recv(sigterm.as_mut()) => info!("Received SIGTERM"),
        _ = recv(sigint.as_mut()) => info!("Received SIGINT"),
        _ = recv(sighup.as_mut()) => info!("Received SIGHUP, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("unix:///csi/csi.sock").unwrap(),
            PathBuf::from("/csi/csi.sock")
        );
        assert!(matches!(
            parse_endpoint("tcp://127.0.0.1:10000"),
            Err(EndpointError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            parse_endpoint("/csi/csi.sock"),
            Err(EndpointError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            parse_endpoint("unix://"),
            Err(EndpointError::MissingPath(_))
        ));
    }

    #[test]
    fn test_endpoint_error_status() {
        let status = Status::from(EndpointError::UnsupportedScheme("tcp://x".to_string()));
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("csi.sock");

        let first = bind(&path).unwrap();
        drop(first);
        assert!(path.exists());

        // The leftover socket file must not block a restart
        let _second = bind(&path).unwrap();
        assert!(path.exists());
    }
}
