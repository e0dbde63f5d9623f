//! Centralized path conventions.
//!
//! Socket names and VFIO device node layouts must agree between discovery,
//! allocation and CDI generation, so every component builds them here.

use std::path::{Path, PathBuf};

/// Kubelet device plugin socket directory.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins";

/// Kubelet registration socket name inside [`DEVICE_PLUGIN_PATH`].
pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";

/// VFIO device node directory.
pub const VFIO_DEVICE_PATH: &str = "/dev/vfio";

/// Default CDI spec directory.
pub const CDI_ROOT: &str = "/var/run/cdi";

/// Character device whose presence enables IOMMUFD mode, relative to the host root.
pub const IOMMU_DEVICE_PATH: &str = "dev/iommu";

/// Socket path served by the plugin for `class_name`.
pub fn plugin_socket_path(device_plugin_path: &Path, class_name: &str) -> PathBuf {
    device_plugin_path.join(format!("sandbox-{}.sock", class_name))
}

/// Legacy VFIO container node shared by every group.
pub fn vfio_control_node(vfio_root: &Path) -> PathBuf {
    vfio_root.join("vfio")
}

/// Legacy per-group node.
pub fn vfio_group_node(vfio_root: &Path, group_key: &str) -> PathBuf {
    vfio_root.join(group_key)
}

/// Directory holding IOMMUFD character devices.
pub fn iommufd_dir(vfio_root: &Path) -> PathBuf {
    vfio_root.join("devices")
}

/// IOMMUFD node for one device handle.
pub fn iommufd_node(vfio_root: &Path, fd_name: &str) -> PathBuf {
    iommufd_dir(vfio_root).join(fd_name)
}

/// Directory whose entries signal device presence for the health watcher.
pub fn device_sensing_root(vfio_root: &Path, iommufd: bool) -> PathBuf {
    if iommufd {
        iommufd_dir(vfio_root)
    } else {
        vfio_root.to_path_buf()
    }
}
