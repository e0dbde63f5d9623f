//! VFIO (Virtual Function I/O) device handling for Linux.
//!
//! VFIO exposes direct device access to userspace. Devices bound to the
//! `vfio-pci` driver can be handed to sandboxed containers through the VFIO
//! device nodes under `/dev/vfio`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     VFIO Discovery                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  PciEnumerator (SysfsEnumerator)                            │
//! │  └── get_all_devices() - NVIDIA devices from sysfs          │
//! │                                                             │
//! │  PciDevice                                                  │
//! │  └── class, driver, IOMMU group, IOMMUFD handle             │
//! │                                                             │
//! │  iommu                                                      │
//! │  ├── iommufd_supported() - /dev/iommu capability probe      │
//! │  └── compare_unit_keys() - numeric unit key ordering        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod detect;
mod device;
mod iommu;

pub use detect::{lookup_nvidia_model, PciEnumerator, SysfsEnumerator};
pub use device::{is_valid_pci_address, vendor, PciDevice, PCI_DEVICES_PATH, VFIO_PCI_DRIVER};
pub use iommu::{compare_unit_keys, iommufd_supported, unit_key_number};
