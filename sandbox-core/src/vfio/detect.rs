//! PCI enumeration for Linux systems.
//!
//! Scans `<sysfs>/bus/pci/devices` for NVIDIA devices.

use crate::vfio::device::{vendor, PciDevice, PCI_DEVICES_PATH};
use crate::error::{PluginError, Result};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Source of PCI devices for a discovery pass.
pub trait PciEnumerator: Send + Sync {
    /// Return every NVIDIA PCI device on the host.
    fn get_all_devices(&self) -> Result<Vec<PciDevice>>;
}

/// Enumerates devices from a sysfs mount.
#[derive(Debug, Clone)]
pub struct SysfsEnumerator {
    sysfs_root: PathBuf,
}

impl SysfsEnumerator {
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self { sysfs_root: sysfs_root.into() }
    }
}

impl PciEnumerator for SysfsEnumerator {
    fn get_all_devices(&self) -> Result<Vec<PciDevice>> {
        let pci_path = self.sysfs_root.join(PCI_DEVICES_PATH);
        if !pci_path.exists() {
            return Err(PluginError::Enumeration {
                reason: format!("PCI sysfs not found at {}", pci_path.display()),
            });
        }

        let mut devices = Vec::new();

        for entry in fs::read_dir(&pci_path).map_err(|e| PluginError::io(&pci_path, e))? {
            let entry = entry.map_err(|e| PluginError::io(&pci_path, e))?;

            let device = match PciDevice::from_sysfs(&entry.path()) {
                Ok(d) => d,
                Err(e) => {
                    debug!(path = %entry.path().display(), error = %e, "Skipping unreadable PCI device");
                    continue;
                }
            };

            if device.vendor_id != vendor::NVIDIA {
                continue;
            }

            devices.push(device);
        }

        // Sort by PCI address
        devices.sort_by(|a, b| a.address.cmp(&b.address));

        Ok(devices)
    }
}

/// Look up an NVIDIA model name from its device ID.
///
/// This is a basic lookup table for data center parts. Unknown IDs get a
/// generic name that still carries the ID.
pub fn lookup_nvidia_model(device_id: u16) -> String {
    // Full list: https://pci-ids.ucw.cz/read/PC/10de
    match device_id {
        // Data center / HPC
        0x20b0 => "NVIDIA A100-SXM4-40GB".to_string(),
        0x20b2 => "NVIDIA A100-SXM4-80GB".to_string(),
        0x20b5 => "NVIDIA A100-PCIE-40GB".to_string(),
        0x20f1 => "NVIDIA A100-PCIE-80GB".to_string(),
        0x2330 => "NVIDIA H100 PCIe".to_string(),
        0x2331 => "NVIDIA H100 SXM".to_string(),
        0x2335 => "NVIDIA H200 SXM".to_string(),
        0x2901 => "NVIDIA B200".to_string(),
        0x26b1 => "NVIDIA L4".to_string(),
        0x26b5 => "NVIDIA L40".to_string(),
        0x26b9 => "NVIDIA L40S".to_string(),
        0x1db1 => "NVIDIA Tesla V100-SXM2-16GB".to_string(),
        0x1db4 => "NVIDIA Tesla V100-PCIE-16GB".to_string(),
        0x1db6 => "NVIDIA Tesla V100-PCIE-32GB".to_string(),
        0x1e04 => "NVIDIA Tesla T4".to_string(),

        // NVSwitch
        0x1af1 => "NVIDIA A100 NVSwitch".to_string(),
        0x22a3 => "NVIDIA H100 NVSwitch".to_string(),

        _ => format!("NVIDIA Device [{:04x}]", device_id),
    }
}
