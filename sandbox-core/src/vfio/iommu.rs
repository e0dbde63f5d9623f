//! IOMMU isolation handling for VFIO passthrough.
//!
//! IOMMU groups are the smallest unit of device isolation. All devices in an
//! IOMMU group share the same memory isolation domain, so a group is handed to
//! a container as a whole.
//!
//! With IOMMUFD the kernel instead exposes one character device per PCI
//! device (`/dev/vfio/devices/vfioN`). Whether the host supports it is decided
//! once by the presence of `/dev/iommu`; discovery, allocation and CDI
//! generation all read that single answer from the discovery snapshot.

use crate::error::{PluginError, Result};
use crate::paths::IOMMU_DEVICE_PATH;
use std::cmp::Ordering;
use std::io::ErrorKind;
use std::path::Path;

/// Check whether the host supports IOMMUFD.
///
/// A missing `/dev/iommu` means legacy group mode; any other stat failure is
/// an error.
pub fn iommufd_supported(host_root: &Path) -> Result<bool> {
    let path = host_root.join(IOMMU_DEVICE_PATH);
    match std::fs::metadata(&path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(PluginError::CapabilityCheck { path, source: e }),
    }
}

/// Numeric part of a unit key: `"vfio10"` -> 10, `"8"` -> 8.
///
/// Leading ASCII letters are stripped; anything unparsable sorts as 0.
pub fn unit_key_number(key: &str) -> u64 {
    key.trim_start_matches(|c: char| c.is_ascii_alphabetic()).parse().unwrap_or(0)
}

/// Order unit keys by their numeric suffix, falling back to the key itself on ties.
pub fn compare_unit_keys(a: &str, b: &str) -> Ordering {
    unit_key_number(a).cmp(&unit_key_number(b)).then_with(|| a.cmp(b))
}
