use anyhow::Context;
use clap::Parser;
use sandbox_core::cdi::generate_cdi_specs;
use sandbox_core::vfio::SysfsEnumerator;
use sandbox_core::{init_observability, Config, DeviceDiscovery};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

mod controller;
mod plugin;
mod shutdown;

use controller::{PluginController, ProductionFactory};
use shutdown::ShutdownSignal;

#[derive(Parser, Debug)]
#[command(name = "sandbox-device-plugin")]
#[command(about = "Kubelet device plugin for VFIO-bound GPUs and NVSwitches", long_about = None)]
struct Args {
    /// JSON configuration file; flags override its values
    #[arg(short, long, env = "SANDBOX_PLUGIN_CONFIG")]
    config: Option<PathBuf>,

    /// Resource class name for every GPU
    #[arg(long, env = "PGPU_ALIAS")]
    pgpu_alias: Option<String>,

    /// Resource class name for every NVSwitch
    #[arg(long, env = "NVSWITCH_ALIAS")]
    nvswitch_alias: Option<String>,

    /// Directory for generated CDI specs
    #[arg(long, env = "CDI_ROOT")]
    cdi_root: Option<PathBuf>,

    #[arg(long, env = "CDI_VENDOR")]
    cdi_vendor: Option<String>,

    /// Resource namespace advertised to kubelet
    #[arg(long, env = "DEVICE_NAMESPACE")]
    device_namespace: Option<String>,

    /// Host filesystem root (for running inside a container)
    #[arg(long, env = "HOST_ROOT")]
    host_root: Option<PathBuf>,

    #[arg(long, env = "SYSFS_ROOT")]
    sysfs_root: Option<PathBuf>,

    #[arg(long, env = "DEVICE_PLUGIN_PATH")]
    device_plugin_path: Option<PathBuf>,

    /// Kubelet registration socket [default: <device-plugin-path>/kubelet.sock]
    #[arg(long, env = "KUBELET_SOCKET")]
    kubelet_socket: Option<PathBuf>,

    /// VFIO device node directory
    #[arg(long, env = "VFIO_ROOT")]
    vfio_root: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Expose Prometheus metrics on this port
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,
}

impl Args {
    /// Layer flag values over a base configuration.
    fn apply(self, mut config: Config) -> anyhow::Result<Config> {
        if let Some(alias) = self.pgpu_alias {
            config.pgpu_alias = Some(alias);
        }
        if let Some(alias) = self.nvswitch_alias {
            config.nvswitch_alias = Some(alias);
        }
        if let Some(cdi_root) = self.cdi_root {
            config.cdi_root = cdi_root;
        }
        if let Some(vendor) = self.cdi_vendor {
            config.cdi_vendor = vendor;
        }
        if let Some(namespace) = self.device_namespace {
            config.device_namespace = namespace;
        }
        if let Some(host_root) = self.host_root {
            config.host_root = host_root;
        }
        if let Some(sysfs_root) = self.sysfs_root {
            config.sysfs_root = sysfs_root;
        }
        if let Some(path) = self.device_plugin_path {
            config.device_plugin_path = path;
        }
        if let Some(socket) = self.kubelet_socket {
            config.kubelet_socket = Some(socket);
        }
        if let Some(vfio_root) = self.vfio_root {
            config.vfio_root = vfio_root;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if self.metrics_port.is_some() {
            config.metrics_port = self.metrics_port;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let base = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::default(),
    };
    let config = args.apply(base)?;

    // Initialize observability FIRST
    init_observability(&config.log_level, config.metrics_port)
        .map_err(|e| anyhow::anyhow!("Failed to initialize observability: {}", e))?;

    info!(version = env!("CARGO_PKG_VERSION"), "Sandbox device plugin starting");

    let enumerator = Arc::new(SysfsEnumerator::new(&config.sysfs_root));
    let snapshot = DeviceDiscovery::new(enumerator, &config.host_root)
        .discover()
        .context("Device discovery failed")?;
    let snapshot = Arc::new(snapshot);

    // CDI failures do not keep the device plugins from starting
    match generate_cdi_specs(&snapshot, &config) {
        Ok(written) => info!(specs = written.len(), "CDI specs generated"),
        Err(e) => error!(error = %e, "Failed to generate CDI specs"),
    }

    let shutdown = ShutdownSignal::new();
    shutdown::listen_for_signals(shutdown.clone());

    let factory = Arc::new(ProductionFactory::new(snapshot.clone(), &config, shutdown.subscribe()));
    PluginController::new(snapshot, config, factory).run(shutdown).await;

    info!("Sandbox device plugin stopped");
    Ok(())
}
