//! PCI device abstraction for VFIO passthrough.

use crate::error::{PluginError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Sysfs path for PCI devices, relative to the sysfs mount.
pub const PCI_DEVICES_PATH: &str = "bus/pci/devices";

/// VFIO-PCI driver name.
pub const VFIO_PCI_DRIVER: &str = "vfio-pci";

/// Regular expression to validate PCI address format: 0000:01:00.0
static PCI_ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7]$")
        .expect("Invalid PCI address regex")
});

/// PCI class codes (base class + subclass, programming interface stripped).
pub mod class {
    /// VGA compatible controller (0x0300xx)
    pub const VGA_CONTROLLER: u32 = 0x0300;
    /// 3D controller (0x0302xx) - NVIDIA compute GPUs
    pub const CONTROLLER_3D: u32 = 0x0302;
    /// Other bridge device (0x0680xx) - NVSwitch
    pub const BRIDGE_OTHER: u32 = 0x0680;
}

/// Known vendor IDs.
pub mod vendor {
    pub const NVIDIA: u16 = 0x10de;
}

/// PCI device information as reported by the enumeration provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDevice {
    /// PCI address (e.g., "0000:01:00.0")
    pub address: String,
    /// Vendor ID (e.g., 0x10de for NVIDIA)
    pub vendor_id: u16,
    /// Device ID (e.g., 0x2330 for H100 PCIe)
    pub device_id: u16,
    /// Full 24-bit class code (e.g., 0x030200)
    pub class: u32,
    /// Current driver (None if unbound)
    pub driver: Option<String>,
    /// IOMMU group number
    pub iommu_group: Option<u32>,
    /// IOMMUFD character device name (e.g., "vfio3")
    pub iommu_fd: Option<String>,
    /// Human-readable device name
    pub device_name: String,
}

impl PciDevice {
    /// Read device information from a sysfs device directory.
    pub fn from_sysfs(sysfs_path: &Path) -> Result<Self> {
        let address = sysfs_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if !is_valid_pci_address(&address) {
            return Err(PluginError::Enumeration {
                reason: format!(
                    "Invalid PCI address format: {} (expected: 0000:01:00.0)",
                    address
                ),
            });
        }

        let vendor_id = read_sysfs_hex(&sysfs_path.join("vendor"))? as u16;
        let device_id = read_sysfs_hex(&sysfs_path.join("device"))? as u16;
        let class = read_sysfs_hex(&sysfs_path.join("class"))?;

        let driver = read_link_name(&sysfs_path.join("driver"));
        let iommu_group = read_link_name(&sysfs_path.join("iommu_group")).and_then(|g| g.parse().ok());
        let iommu_fd = read_iommu_fd(sysfs_path);
        let device_name = super::detect::lookup_nvidia_model(device_id);

        debug!(
            address = %address,
            device = %format!("{:04x}", device_id),
            driver = ?driver,
            iommu_group = ?iommu_group,
            iommu_fd = ?iommu_fd,
            "Read PCI device info"
        );

        Ok(Self { address, vendor_id, device_id, class, driver, iommu_group, iommu_fd, device_name })
    }

    /// Check if this device is a GPU (VGA or 3D controller).
    pub fn is_gpu(&self) -> bool {
        let base = self.class >> 8;
        base == class::VGA_CONTROLLER || base == class::CONTROLLER_3D
    }

    /// Check if this device is an NVIDIA NVSwitch.
    pub fn is_nvswitch(&self) -> bool {
        self.vendor_id == vendor::NVIDIA && self.class >> 8 == class::BRIDGE_OTHER
    }

    /// Check if device is currently bound to vfio-pci.
    pub fn is_vfio_bound(&self) -> bool {
        self.driver.as_deref() == Some(VFIO_PCI_DRIVER)
    }

    /// Human-readable device type used in logs.
    pub fn kind(&self) -> &'static str {
        if self.is_nvswitch() {
            "NVSwitch"
        } else {
            "GPU"
        }
    }
}

/// Validate PCI address format.
pub fn is_valid_pci_address(address: &str) -> bool {
    PCI_ADDRESS_REGEX.is_match(address)
}

/// Read a hexadecimal value (with or without `0x`) from a sysfs file.
fn read_sysfs_hex(path: &Path) -> Result<u32> {
    let raw = fs::read_to_string(path).map_err(|e| PluginError::io(path, e))?;
    let value = raw.trim();
    u32::from_str_radix(value.trim_start_matches("0x"), 16).map_err(|e| {
        PluginError::Enumeration {
            reason: format!("Invalid hex value {:?} in {}: {}", value, path.display(), e),
        }
    })
}

/// Resolve a sysfs symlink (driver, iommu_group) to the name of its target.
fn read_link_name(link: &Path) -> Option<String> {
    fs::read_link(link)
        .ok()
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().to_string()))
}

/// Read the IOMMUFD character device bound to this device, if the kernel exposes one.
fn read_iommu_fd(device_path: &Path) -> Option<String> {
    let vfio_dev: PathBuf = device_path.join("vfio-dev");
    let mut names: Vec<String> = fs::read_dir(&vfio_dev)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| name.starts_with("vfio"))
        .collect();
    names.sort();
    names.into_iter().next()
}
