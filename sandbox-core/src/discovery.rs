//! Device discovery and classification.
//!
//! One discovery pass enumerates PCI devices, keeps the GPUs and NVSwitches
//! bound to `vfio-pci` and indexes them twice:
//!
//! - by isolation unit (IOMMUFD handle name, or IOMMU group number), which is
//!   what kubelet allocates and CDI names;
//! - by device class (4-hex-digit device ID), which decides how many plugin
//!   instances run and which units each one advertises.
//!
//! The result is an immutable [`DiscoverySnapshot`]. A failed pass returns an
//! error and leaves whatever snapshot the caller already holds untouched.

use crate::config::Config;
use crate::error::Result;
use crate::naming::format_device_name;
use crate::observability::metrics;
use crate::vfio::{iommufd_supported, PciDevice, PciEnumerator};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// A VFIO-bound GPU or NVSwitch as captured at discovery time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfioDevice {
    /// PCI address (e.g., "0000:01:00.0")
    pub address: String,
    pub device_id: u16,
    pub device_name: String,
    pub iommu_group: u32,
    /// IOMMUFD handle name (e.g., "vfio3")
    pub iommu_fd: Option<String>,
    pub is_nvswitch: bool,
}

impl VfioDevice {
    /// Device ID formatted as a class key (e.g., "2330").
    pub fn class_id(&self) -> String {
        format_class_id(self.device_id)
    }
}

/// Format a PCI device ID as a 4-hex-digit class key.
pub fn format_class_id(device_id: u16) -> String {
    format!("{:04x}", device_id)
}

/// Immutable result of one discovery pass.
#[derive(Debug, Clone, Default)]
pub struct DiscoverySnapshot {
    iommufd: bool,
    units: HashMap<String, Vec<VfioDevice>>,
    classes: BTreeMap<String, Vec<String>>,
    nvswitch_classes: BTreeSet<String>,
}

impl DiscoverySnapshot {
    /// Build a snapshot from already-filtered devices.
    ///
    /// Unit keys are the IOMMUFD handle when `iommufd` is set and the device
    /// has one, the group number otherwise. A unit key joins a class only the
    /// first time the key is seen.
    pub fn from_devices(iommufd: bool, devices: impl IntoIterator<Item = VfioDevice>) -> Self {
        let mut snapshot = Self { iommufd, ..Self::default() };

        for dev in devices {
            let key = match (&dev.iommu_fd, iommufd) {
                (Some(fd), true) => fd.clone(),
                _ => dev.iommu_group.to_string(),
            };
            debug!(address = %dev.address, unit = %key, "Iommu key (group/fd)");

            let class_id = dev.class_id();
            if !snapshot.units.contains_key(&key) {
                snapshot.classes.entry(class_id.clone()).or_default().push(key.clone());
            }
            if dev.is_nvswitch {
                snapshot.nvswitch_classes.insert(class_id);
            }
            snapshot.units.entry(key).or_default().push(dev);
        }

        snapshot
    }

    /// Whether the host runs in IOMMUFD mode.
    pub fn iommufd(&self) -> bool {
        self.iommufd
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Devices sharing one isolation unit.
    pub fn unit(&self, key: &str) -> Option<&[VfioDevice]> {
        self.units.get(key).map(Vec::as_slice)
    }

    /// All isolation units, unordered.
    pub fn units(&self) -> &HashMap<String, Vec<VfioDevice>> {
        &self.units
    }

    /// Device class ID -> unit keys, in discovery order.
    pub fn classes(&self) -> &BTreeMap<String, Vec<String>> {
        &self.classes
    }

    /// Unit keys for one device class.
    pub fn class_units(&self, class_id: &str) -> &[String] {
        self.classes.get(class_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_nvswitch_class(&self, class_id: &str) -> bool {
        self.nvswitch_classes.contains(class_id)
    }

    pub fn nvswitch_classes(&self) -> &BTreeSet<String> {
        &self.nvswitch_classes
    }

    /// Formatted name of the first device with this class ID, empty if none.
    pub fn device_name_for_class(&self, class_id: &str) -> String {
        self.class_units(class_id)
            .iter()
            .filter_map(|key| self.units.get(key))
            .flatten()
            .chain(self.units.values().flatten())
            .find(|dev| dev.class_id() == class_id)
            .map(|dev| {
                // Padding in the model name would leave a separator at either end
                format_device_name(&dev.device_name).trim_matches(['_', '-']).to_string()
            })
            .unwrap_or_default()
    }

    /// Class name advertised for a device class.
    ///
    /// Resolution order: configured alias for the category, formatted device
    /// name, raw device ID.
    pub fn class_display_name(&self, class_id: &str, config: &Config) -> String {
        if let Some(alias) = config.alias_for(self.is_nvswitch_class(class_id)) {
            return alias.to_string();
        }
        let name = self.device_name_for_class(class_id);
        if name.is_empty() {
            warn!(device_id = %class_id, "Could not find device name for device id");
            return class_id.to_string();
        }
        name
    }

    /// Name of the first GPU class, used to address the GPU resource.
    pub fn gpu_class_name(&self, config: &Config) -> Option<String> {
        self.classes
            .keys()
            .find(|id| !self.is_nvswitch_class(id))
            .map(|id| self.class_display_name(id, config))
    }
}

/// Runs discovery passes against an enumeration provider.
pub struct DeviceDiscovery {
    enumerator: Arc<dyn PciEnumerator>,
    host_root: PathBuf,
}

impl DeviceDiscovery {
    pub fn new(enumerator: Arc<dyn PciEnumerator>, host_root: impl Into<PathBuf>) -> Self {
        Self { enumerator, host_root: host_root.into() }
    }

    /// Discover every GPU and NVSwitch bound to `vfio-pci`.
    #[instrument(skip(self), fields(host_root = %self.host_root.display()))]
    pub fn discover(&self) -> Result<DiscoverySnapshot> {
        let iommufd = iommufd_supported(&self.host_root)?;
        let devices = self.enumerator.get_all_devices()?;

        let kept = devices.into_iter().filter_map(|dev| accept_device(dev, iommufd));
        let snapshot = DiscoverySnapshot::from_devices(iommufd, kept);

        info!(
            iommufd,
            units = snapshot.units.len(),
            classes = snapshot.classes.len(),
            nvswitch_classes = snapshot.nvswitch_classes.len(),
            "Device discovery complete"
        );
        metrics::set_discovered_units(snapshot.units.len());

        Ok(snapshot)
    }
}

/// Filter one enumerated device, converting the ones worth keeping.
fn accept_device(dev: PciDevice, iommufd: bool) -> Option<VfioDevice> {
    if !dev.is_gpu() && !dev.is_nvswitch() {
        return None;
    }

    if !dev.is_vfio_bound() {
        info!(
            kind = dev.kind(),
            address = %dev.address,
            driver = ?dev.driver,
            "Skipping device: driver is not vfio-pci"
        );
        return None;
    }

    let Some(iommu_group) = dev.iommu_group else {
        warn!(kind = dev.kind(), address = %dev.address, "Skipping device without IOMMU group");
        return None;
    };

    info!(kind = dev.kind(), address = %dev.address, name = %dev.device_name, "Found device");
    if iommufd && dev.iommu_fd.is_none() {
        warn!(address = %dev.address, "IOMMUFD is supported but device has no IOMMUFD handle");
    }

    Some(VfioDevice {
        is_nvswitch: dev.is_nvswitch(),
        address: dev.address,
        device_id: dev.device_id,
        device_name: dev.device_name,
        iommu_group,
        iommu_fd: dev.iommu_fd,
    })
}
