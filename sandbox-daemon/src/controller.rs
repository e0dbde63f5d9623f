//! Plugin controller.
//!
//! Turns a discovery snapshot into one device plugin per device class, keeps
//! the ones that started, and stops them all on shutdown.

use crate::plugin::{healthy_devices, PluginSettings, SandboxDevicePlugin};
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use sandbox_api::deviceplugin::v1beta1::Device;
use sandbox_core::{paths, Config, DiscoverySnapshot, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Lifecycle surface the controller needs from a plugin.
#[async_trait]
pub trait ManagedPlugin: Send + Sync {
    fn class_name(&self) -> &str;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

#[async_trait]
impl ManagedPlugin for SandboxDevicePlugin {
    fn class_name(&self) -> &str {
        SandboxDevicePlugin::class_name(self)
    }

    async fn start(&self) -> Result<()> {
        SandboxDevicePlugin::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        SandboxDevicePlugin::stop(self).await
    }
}

/// Builds plugin instances; tests substitute their own.
pub trait PluginFactory: Send + Sync {
    fn create(&self, class_name: &str, device_root: &Path, devices: Vec<Device>) -> Arc<dyn ManagedPlugin>;
}

/// Factory for real kubelet-facing plugins.
pub struct ProductionFactory {
    snapshot: Arc<DiscoverySnapshot>,
    settings: PluginSettings,
    stop: watch::Receiver<bool>,
}

impl ProductionFactory {
    pub fn new(snapshot: Arc<DiscoverySnapshot>, config: &Config, stop: watch::Receiver<bool>) -> Self {
        Self { snapshot, settings: PluginSettings::from(config), stop }
    }
}

impl PluginFactory for ProductionFactory {
    fn create(&self, class_name: &str, device_root: &Path, devices: Vec<Device>) -> Arc<dyn ManagedPlugin> {
        Arc::new(SandboxDevicePlugin::new(
            class_name,
            device_root,
            devices,
            self.snapshot.clone(),
            self.settings.clone(),
            self.stop.clone(),
        ))
    }
}

/// One plugin to create: its class name and the unit keys it advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginPlan {
    pub class_name: String,
    pub units: Vec<String>,
}

/// Plan one plugin per resolved class name, in device ID order.
///
/// Device classes resolving to the same name (an alias covering several GPU
/// models) share a single plugin.
pub fn plan_plugins(snapshot: &DiscoverySnapshot, config: &Config) -> Vec<PluginPlan> {
    let mut plans: Vec<PluginPlan> = Vec::new();

    for (class_id, units) in snapshot.classes() {
        let class_name = snapshot.class_display_name(class_id, config);
        match plans.iter_mut().find(|p| p.class_name == class_name) {
            Some(plan) => plan.units.extend(units.iter().cloned()),
            None => plans.push(PluginPlan { class_name, units: units.clone() }),
        }
    }

    plans
}

pub struct PluginController {
    snapshot: Arc<DiscoverySnapshot>,
    config: Config,
    factory: Arc<dyn PluginFactory>,
    plugins: Vec<Arc<dyn ManagedPlugin>>,
}

impl PluginController {
    pub fn new(snapshot: Arc<DiscoverySnapshot>, config: Config, factory: Arc<dyn PluginFactory>) -> Self {
        Self { snapshot, config, factory, plugins: Vec::new() }
    }

    /// Directory the health watchers observe for device nodes.
    pub fn device_root(&self) -> PathBuf {
        paths::device_sensing_root(&self.config.vfio_root, self.snapshot.iommufd())
    }

    /// Names of the plugins currently tracked.
    pub fn running(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.class_name().to_string()).collect()
    }

    /// Create and start a plugin per class. Failures are logged and dropped.
    pub async fn start_plugins(&mut self) -> usize {
        let device_root = self.device_root();
        info!(
            iommufd = self.snapshot.iommufd(),
            device_root = %device_root.display(),
            classes = self.snapshot.classes().len(),
            "Starting device plugins"
        );
        if let Some(gpu) = self.snapshot.gpu_class_name(&self.config) {
            info!(resource = %format!("{}/{}", self.config.device_namespace, gpu), "GPU resource");
        }

        for plan in plan_plugins(&self.snapshot, &self.config) {
            info!(class = %plan.class_name, devices = ?plan.units, "Creating device plugin");
            let plugin = self.factory.create(&plan.class_name, &device_root, healthy_devices(&plan.units));
            match plugin.start().await {
                Ok(()) => self.plugins.push(plugin),
                Err(e) => error!(class = %plan.class_name, error = %e, "Error starting device plugin"),
            }
        }

        info!(running = ?self.running(), "Device plugins started");
        self.plugins.len()
    }

    /// Stop every tracked plugin.
    pub async fn stop_plugins(&mut self) {
        info!("Shutting down device plugin controller");
        for plugin in self.plugins.drain(..) {
            if let Err(e) = plugin.stop().await {
                warn!(class = %plugin.class_name(), error = %e, "Failed to stop device plugin");
            }
        }
    }

    /// Start plugins, block until shutdown, then stop them.
    pub async fn run(mut self, shutdown: ShutdownSignal) {
        let started = self.start_plugins().await;
        if started == 0 {
            warn!("No device plugins running");
        }
        shutdown.wait().await;
        self.stop_plugins().await;
    }
}
