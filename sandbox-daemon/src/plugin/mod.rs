//! Kubelet device plugin instance.
//!
//! One [`SandboxDevicePlugin`] serves one device class on its own Unix socket.
//!
//! ```text
//!   Created ──start()──▶ Starting ──registered──▶ Serving
//!      ▲                    │                        │
//!      │              probe/register              stop() / socket removed
//!      │                 failure                     │
//!      └──────────────── Stopped ◀── Terminating ◀───┘
//! ```
//!
//! A serving instance owns three tasks: the tonic server, the health watcher
//! and at most one active ListAndWatch session. The per-generation terminate
//! signal ends all of them; the process-wide stop signal ends them for good.

mod allocate;
mod health;
mod registration;

use sandbox_api::deviceplugin::v1beta1::device_plugin_server::{DevicePlugin, DevicePluginServer};
use sandbox_api::deviceplugin::v1beta1::{
    AllocateRequest, AllocateResponse, Device, DevicePluginOptions, Empty, ListAndWatchResponse,
    PreStartContainerRequest, PreStartContainerResponse, PreferredAllocationRequest,
    PreferredAllocationResponse, HEALTHY, UNHEALTHY,
};
use sandbox_core::observability::metrics;
use sandbox_core::{paths, Config, DiscoverySnapshot, PluginError, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tokio_stream::Stream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

/// Bound on graceful server shutdown before the task is aborted.
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Start attempts made by one restart before giving up.
const RESTART_ATTEMPTS: u32 = 3;

/// Pause between restart attempts.
const RESTART_BACKOFF: Duration = Duration::from_millis(500);

/// Device health as reported to kubelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceHealth {
    Healthy,
    Unhealthy,
}

impl DeviceHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => HEALTHY,
            Self::Unhealthy => UNHEALTHY,
        }
    }
}

/// A health change for one isolation unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub unit: String,
    pub health: DeviceHealth,
}

/// Settings shared by every plugin instance.
#[derive(Debug, Clone)]
pub struct PluginSettings {
    pub device_plugin_path: PathBuf,
    pub kubelet_socket: PathBuf,
    pub resource_namespace: String,
    pub vfio_root: PathBuf,
    pub connection_timeout: Duration,
}

impl From<&Config> for PluginSettings {
    fn from(config: &Config) -> Self {
        Self {
            device_plugin_path: config.device_plugin_path.clone(),
            kubelet_socket: config.kubelet_socket(),
            resource_namespace: config.device_namespace.clone(),
            vfio_root: config.vfio_root.clone(),
            connection_timeout: config.connection_timeout(),
        }
    }
}

/// Resources owned by a serving instance.
struct Serving {
    term: watch::Sender<bool>,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<std::result::Result<(), tonic::transport::Error>>,
}

impl Serving {
    /// End sessions and the watcher, stop the server, remove the socket.
    async fn shutdown(self, class: &str, socket_path: &Path) -> Result<()> {
        let _ = self.term.send(true);
        let _ = self.shutdown.send(());

        let mut server = self.server;
        match tokio::time::timeout(SERVER_STOP_TIMEOUT, &mut server).await {
            Ok(Ok(Ok(()))) => debug!(class, "gRPC server stopped"),
            Ok(Ok(Err(e))) => warn!(class, error = %e, "gRPC server exited with error"),
            Ok(Err(e)) => warn!(class, error = %e, "gRPC server task failed"),
            Err(_) => {
                warn!(class, "gRPC server did not stop in time, aborting");
                server.abort();
            }
        }

        remove_socket(socket_path)
    }
}

struct Inner {
    class_name: String,
    resource_name: String,
    socket_path: PathBuf,
    device_root: PathBuf,
    settings: PluginSettings,
    snapshot: Arc<DiscoverySnapshot>,
    devices: std::sync::Mutex<Vec<Device>>,
    health_tx: mpsc::Sender<HealthEvent>,
    health_rx: Mutex<mpsc::Receiver<HealthEvent>>,
    stop: watch::Receiver<bool>,
    state: Mutex<Option<Serving>>,
}

/// Device plugin for one device class.
#[derive(Clone)]
pub struct SandboxDevicePlugin {
    inner: Arc<Inner>,
}

impl SandboxDevicePlugin {
    /// Create a stopped instance advertising `devices`.
    pub fn new(
        class_name: impl Into<String>,
        device_root: impl Into<PathBuf>,
        devices: Vec<Device>,
        snapshot: Arc<DiscoverySnapshot>,
        settings: PluginSettings,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let class_name = class_name.into();
        let (health_tx, health_rx) = mpsc::channel(1);
        let inner = Inner {
            resource_name: format!("{}/{}", settings.resource_namespace, class_name),
            socket_path: paths::plugin_socket_path(&settings.device_plugin_path, &class_name),
            device_root: device_root.into(),
            class_name,
            settings,
            snapshot,
            devices: std::sync::Mutex::new(devices),
            health_tx,
            health_rx: Mutex::new(health_rx),
            stop,
            state: Mutex::new(None),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn class_name(&self) -> &str {
        &self.inner.class_name
    }

    /// Kubelet resource name, `<namespace>/<class>`.
    pub fn resource_name(&self) -> &str {
        &self.inner.resource_name
    }

    pub fn socket_path(&self) -> &Path {
        &self.inner.socket_path
    }

    pub fn device_root(&self) -> &Path {
        &self.inner.device_root
    }

    /// Current device list with health.
    pub fn devices(&self) -> Vec<Device> {
        self.inner.devices.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub async fn is_serving(&self) -> bool {
        self.inner.state.lock().await.is_some()
    }

    pub(crate) fn health_sender(&self) -> mpsc::Sender<HealthEvent> {
        self.inner.health_tx.clone()
    }

    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.inner.stop.clone()
    }

    /// Serve, register with kubelet and start watching device health.
    ///
    /// A probe or registration failure tears the endpoint down again before
    /// the error is returned.
    #[instrument(skip(self), fields(class = %self.inner.class_name))]
    pub async fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.is_some() {
            return Err(PluginError::AlreadyStarted { class: self.inner.class_name.clone() });
        }

        let socket_path = &self.inner.socket_path;
        remove_socket(socket_path)?;
        let listener = UnixListener::bind(socket_path)
            .map_err(|e| PluginError::SocketBind { path: socket_path.clone(), source: e })?;

        let (term_tx, term_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let service = PluginService::new(self.clone(), term_rx.clone());
        let server = tokio::spawn(
            Server::builder().add_service(DevicePluginServer::new(service)).serve_with_incoming_shutdown(
                UnixListenerStream::new(listener),
                async {
                    let _ = shutdown_rx.await;
                },
            ),
        );
        let serving = Serving { term: term_tx, shutdown: shutdown_tx, server };

        if let Err(e) = self.connect_and_register().await {
            serving.shutdown(&self.inner.class_name, socket_path).await?;
            return Err(e);
        }

        if let Err(e) = health::spawn_watcher(self.clone(), term_rx) {
            serving.shutdown(&self.inner.class_name, socket_path).await?;
            return Err(e);
        }

        *state = Some(serving);
        metrics::set_plugin_devices(&self.inner.class_name, self.devices().len());
        info!(
            resource = %self.inner.resource_name,
            socket = %socket_path.display(),
            "Device plugin serving"
        );
        Ok(())
    }

    async fn connect_and_register(&self) -> Result<()> {
        let timeout = self.inner.settings.connection_timeout;
        registration::probe(&self.inner.socket_path, timeout).await?;

        let endpoint = self
            .inner
            .socket_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        registration::register(&self.inner.settings.kubelet_socket, &endpoint, &self.inner.resource_name, timeout)
            .await
    }

    /// Stop serving. Stopping a stopped instance is a no-op.
    #[instrument(skip(self), fields(class = %self.inner.class_name))]
    pub async fn stop(&self) -> Result<()> {
        let Some(serving) = self.inner.state.lock().await.take() else {
            return Ok(());
        };
        serving.shutdown(&self.inner.class_name, &self.inner.socket_path).await?;
        metrics::set_plugin_devices(&self.inner.class_name, 0);
        info!("Device plugin stopped");
        Ok(())
    }

    /// Stop then start again, e.g. after kubelet restarted.
    ///
    /// Start is retried up to [`RESTART_ATTEMPTS`] times, since kubelet may
    /// still be coming back. Boxed because the health watcher, itself
    /// spawned by `start`, calls it.
    pub fn restart(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            metrics::record_plugin_restart(&self.inner.class_name);
            self.stop().await?;

            let mut stop = self.stop_signal();
            let mut attempt = 1;
            loop {
                let err = match self.start().await {
                    Ok(()) => return Ok(()),
                    Err(e) => e,
                };
                let stopping = *stop.borrow();
                if attempt >= RESTART_ATTEMPTS || stopping {
                    return Err(err);
                }
                warn!(
                    class = %self.inner.class_name,
                    attempt,
                    error = %err,
                    "Device plugin restart failed, retrying"
                );
                attempt += 1;

                let stopped = tokio::select! {
                    _ = signalled(&mut stop) => true,
                    _ = tokio::time::sleep(RESTART_BACKOFF) => false,
                };
                if stopped {
                    return Err(err);
                }
            }
        })
    }

    fn list_response(&self) -> ListAndWatchResponse {
        ListAndWatchResponse { devices: self.devices() }
    }

    fn apply_health(&self, event: &HealthEvent) {
        let mut devices = self.inner.devices.lock().unwrap_or_else(PoisonError::into_inner);
        match devices.iter_mut().find(|d| d.id == event.unit) {
            Some(device) => {
                device.health = event.health.as_str().to_string();
                info!(
                    class = %self.inner.class_name,
                    unit = %event.unit,
                    health = event.health.as_str(),
                    "Device health changed"
                );
                metrics::record_health_transition(&self.inner.class_name, event.health.as_str());
            }
            None => {
                warn!(class = %self.inner.class_name, unit = %event.unit, "Health event for unknown device");
            }
        }
    }

    /// One ListAndWatch session: the full list now, then after every health event.
    async fn watch_session(
        self,
        tx: mpsc::Sender<std::result::Result<ListAndWatchResponse, Status>>,
        mut term: watch::Receiver<bool>,
    ) {
        let class = self.inner.class_name.clone();
        let mut stop = self.stop_signal();

        if tx.send(Ok(self.list_response())).await.is_err() {
            return;
        }

        let mut events = tokio::select! {
            biased;
            _ = signalled(&mut stop) => return,
            _ = signalled(&mut term) => return,
            _ = tx.closed() => return,
            events = self.inner.health_rx.lock() => events,
        };

        loop {
            let event = tokio::select! {
                biased;
                _ = signalled(&mut stop) => {
                    debug!(class = %class, "ListAndWatch ended: stopping");
                    break;
                }
                _ = signalled(&mut term) => {
                    debug!(class = %class, "ListAndWatch ended: plugin terminated");
                    break;
                }
                _ = tx.closed() => {
                    debug!(class = %class, "ListAndWatch ended: client went away");
                    break;
                }
                event = events.recv() => event,
            };

            let Some(event) = event else { break };
            self.apply_health(&event);
            if tx.send(Ok(self.list_response())).await.is_err() {
                break;
            }
        }
    }
}

/// gRPC surface of one serving generation.
#[derive(Clone)]
pub struct PluginService {
    plugin: SandboxDevicePlugin,
    term: watch::Receiver<bool>,
}

impl PluginService {
    pub fn new(plugin: SandboxDevicePlugin, term: watch::Receiver<bool>) -> Self {
        Self { plugin, term }
    }
}

#[tonic::async_trait]
impl DevicePlugin for PluginService {
    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = std::result::Result<ListAndWatchResponse, Status>> + Send>>;

    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: false,
        }))
    }

    #[instrument(skip(self, _request), fields(class = %self.plugin.class_name()))]
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<Self::ListAndWatchStream>, Status> {
        info!("gRPC: ListAndWatch");

        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(self.plugin.clone().watch_session(tx, self.term.clone()));

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream) as Self::ListAndWatchStream))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> std::result::Result<Response<PreferredAllocationResponse>, Status> {
        Ok(Response::new(PreferredAllocationResponse::default()))
    }

    #[instrument(skip(self, request), fields(class = %self.plugin.class_name()))]
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> std::result::Result<Response<AllocateResponse>, Status> {
        let request = request.into_inner();
        let inner = &self.plugin.inner;

        match allocate::allocate(&inner.snapshot, &inner.settings.vfio_root, &request) {
            Ok(response) => {
                metrics::record_allocation(&inner.class_name, true);
                info!(containers = response.container_responses.len(), "Allocated devices");
                Ok(Response::new(response))
            }
            Err(e) => {
                metrics::record_allocation(&inner.class_name, false);
                warn!(error = %e, "Allocation failed");
                if e.is_allocation_error() {
                    Err(Status::invalid_argument(e.to_string()))
                } else {
                    Err(Status::internal(e.to_string()))
                }
            }
        }
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> std::result::Result<Response<PreStartContainerResponse>, Status> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}

/// Resolve once `rx` turns true or its sender is gone.
pub(crate) async fn signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|v| *v).await;
}

/// Remove a socket file, tolerating its absence.
fn remove_socket(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PluginError::io(path, e)),
    }
}

/// Healthy device entries for a list of unit keys.
pub fn healthy_devices<'a>(units: impl IntoIterator<Item = &'a String>) -> Vec<Device> {
    units
        .into_iter()
        .map(|id| Device { id: id.clone(), health: HEALTHY.to_string(), topology: None })
        .collect()
}
