//! Configuration management.

use crate::error::{PluginError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration for the sandbox device plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Resource namespace advertised to kubelet (`<namespace>/<class>`).
    pub device_namespace: String,
    /// Class name override for every discovered GPU.
    pub pgpu_alias: Option<String>,
    /// Class name override for every discovered NVSwitch.
    pub nvswitch_alias: Option<String>,
    /// Directory holding generated CDI specs.
    pub cdi_root: PathBuf,
    /// Vendor half of the CDI `kind`.
    pub cdi_vendor: String,
    /// Host filesystem root, used for the IOMMUFD capability probe.
    pub host_root: PathBuf,
    /// Sysfs mount used for PCI enumeration.
    pub sysfs_root: PathBuf,
    /// VFIO device node directory.
    pub vfio_root: PathBuf,
    /// Kubelet device plugin socket directory.
    pub device_plugin_path: PathBuf,
    /// Kubelet registration socket; `<device_plugin_path>/kubelet.sock` when unset.
    pub kubelet_socket: Option<PathBuf>,
    /// Bound for the readiness probe and the registration call.
    pub connection_timeout_secs: u64,
    pub log_level: String,
    /// Prometheus exporter port; metrics are not exported when unset.
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_namespace: "nvidia.com".to_string(),
            pgpu_alias: None,
            nvswitch_alias: None,
            cdi_root: PathBuf::from(paths::CDI_ROOT),
            cdi_vendor: "nvidia.com".to_string(),
            host_root: PathBuf::from("/"),
            sysfs_root: PathBuf::from("/sys"),
            vfio_root: PathBuf::from(paths::VFIO_DEVICE_PATH),
            device_plugin_path: PathBuf::from(paths::DEVICE_PLUGIN_PATH),
            kubelet_socket: None,
            connection_timeout_secs: 5,
            log_level: "info".to_string(),
            metrics_port: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| PluginError::InvalidConfig {
            reason: format!("Failed to read config {}: {}", path.display(), e),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            PluginError::InvalidConfig { reason: format!("Failed to parse config: {}", e) }
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot produce a working plugin.
    pub fn validate(&self) -> Result<()> {
        if self.device_namespace.is_empty() {
            return Err(PluginError::InvalidConfig {
                reason: "device namespace must not be empty".to_string(),
            });
        }
        if self.cdi_vendor.is_empty() {
            return Err(PluginError::InvalidConfig {
                reason: "CDI vendor must not be empty".to_string(),
            });
        }
        if self.connection_timeout_secs == 0 {
            return Err(PluginError::InvalidConfig {
                reason: "connection timeout must be at least one second".to_string(),
            });
        }
        Ok(())
    }

    /// Kubelet registration socket, explicit or derived from the plugin directory.
    pub fn kubelet_socket(&self) -> PathBuf {
        match &self.kubelet_socket {
            Some(socket) => socket.clone(),
            None => self.device_plugin_path.join(paths::KUBELET_SOCKET_NAME),
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Alias configured for the GPU or NVSwitch category, ignoring empty values.
    pub fn alias_for(&self, nvswitch: bool) -> Option<&str> {
        let alias = if nvswitch { &self.nvswitch_alias } else { &self.pgpu_alias };
        alias.as_deref().filter(|a| !a.is_empty())
    }
}
