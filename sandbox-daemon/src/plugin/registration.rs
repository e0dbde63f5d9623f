//! Kubelet registration and socket probing over Unix domain sockets.

use sandbox_api::deviceplugin::v1beta1::registration_client::RegistrationClient;
use sandbox_api::deviceplugin::v1beta1::{DevicePluginOptions, RegisterRequest, VERSION};
use sandbox_core::{PluginError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info};

/// Pause between connection attempts while a socket is not accepting yet.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Open a gRPC channel to a Unix socket.
///
/// Keeps redialing until the socket accepts or `timeout` expires, so a
/// socket that does not exist yet is waited for rather than failed on.
pub async fn connect(socket_path: &Path, timeout: Duration) -> anyhow::Result<Channel> {
    // Dummy URI, required by tonic but unused for Unix sockets
    let endpoint = Endpoint::try_from("http://[::]:50051")?.connect_timeout(timeout);

    let mut last_error: Option<String> = None;
    let attempts = async {
        loop {
            let path: PathBuf = socket_path.to_path_buf();
            let connector = service_fn(move |_: Uri| UnixStream::connect(path.clone()));
            match endpoint.connect_with_connector(connector).await {
                Ok(channel) => return channel,
                Err(e) => {
                    debug!(socket = %socket_path.display(), error = %e, "Socket not accepting yet");
                    last_error = Some(format!("{:#}", e));
                }
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    };

    let result = tokio::time::timeout(timeout, attempts).await;
    result.map_err(|_| match last_error {
        Some(e) => anyhow::anyhow!("timed out after {:?}: {}", timeout, e),
        None => anyhow::anyhow!("timed out after {:?}", timeout),
    })
}

/// Wait until the plugin's own gRPC server accepts connections.
pub async fn probe(socket_path: &Path, timeout: Duration) -> Result<()> {
    connect(socket_path, timeout).await.map(drop).map_err(|e| PluginError::ServerNotReady {
        path: socket_path.to_path_buf(),
        reason: format!("{:#}", e),
    })
}

/// Register a plugin endpoint with kubelet.
///
/// `endpoint` is the socket file name relative to the device plugin directory.
pub async fn register(
    kubelet_socket: &Path,
    endpoint: &str,
    resource_name: &str,
    timeout: Duration,
) -> Result<()> {
    let failed = |reason: String| PluginError::RegistrationFailed {
        resource: resource_name.to_string(),
        reason,
    };

    let channel = connect(kubelet_socket, timeout).await.map_err(|e| failed(format!("{:#}", e)))?;
    let mut client = RegistrationClient::new(channel);

    let request = RegisterRequest {
        version: VERSION.to_string(),
        endpoint: endpoint.to_string(),
        resource_name: resource_name.to_string(),
        options: Some(DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: false,
        }),
    };

    tokio::time::timeout(timeout, client.register(request))
        .await
        .map_err(|_| failed(format!("timed out after {:?}", timeout)))?
        .map_err(|status| failed(status.message().to_string()))?;

    info!(resource = resource_name, endpoint, "Registered device plugin with kubelet");
    Ok(())
}
