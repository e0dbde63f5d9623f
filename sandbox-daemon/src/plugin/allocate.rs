//! Allocate request handling.
//!
//! Requests name isolation units by key; the response lists the VFIO device
//! nodes the runtime must expose. Either every requested unit resolves or the
//! whole call fails.

use sandbox_api::deviceplugin::v1beta1::{
    AllocateRequest, AllocateResponse, ContainerAllocateResponse, DeviceSpec,
};
use sandbox_core::paths;
use sandbox_core::{DiscoverySnapshot, PluginError, Result};
use std::path::Path;

/// Read/write plus mknod, as kubelet expects for VFIO nodes.
pub const DEVICE_PERMISSIONS: &str = "mrw";

/// Build the response for an allocation request.
pub fn allocate(
    snapshot: &DiscoverySnapshot,
    vfio_root: &Path,
    request: &AllocateRequest,
) -> Result<AllocateResponse> {
    let mut response = AllocateResponse::default();

    for container in &request.container_requests {
        let mut devices = Vec::new();
        for key in &container.devices_ids {
            devices.extend(unit_device_specs(snapshot, vfio_root, key)?);
        }
        response
            .container_responses
            .push(ContainerAllocateResponse { devices, ..Default::default() });
    }

    Ok(response)
}

/// Device nodes for one isolation unit.
fn unit_device_specs(snapshot: &DiscoverySnapshot, vfio_root: &Path, key: &str) -> Result<Vec<DeviceSpec>> {
    let unit = snapshot.unit(key).ok_or_else(|| PluginError::UnknownUnit { key: key.to_string() })?;

    if snapshot.iommufd() {
        return unit
            .iter()
            .map(|dev| {
                let fd = dev
                    .iommu_fd
                    .as_deref()
                    .ok_or_else(|| PluginError::MissingIommuFd { address: dev.address.clone() })?;
                Ok(device_spec(&paths::iommufd_node(vfio_root, fd)))
            })
            .collect();
    }

    Ok(vec![
        device_spec(&paths::vfio_control_node(vfio_root)),
        device_spec(&paths::vfio_group_node(vfio_root, key)),
    ])
}

fn device_spec(path: &Path) -> DeviceSpec {
    let path = path.to_string_lossy().into_owned();
    DeviceSpec { container_path: path.clone(), host_path: path, permissions: DEVICE_PERMISSIONS.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_api::deviceplugin::v1beta1::ContainerAllocateRequest;
    use sandbox_core::VfioDevice;

    fn device(address: &str, group: u32, fd: Option<&str>) -> VfioDevice {
        VfioDevice {
            address: address.to_string(),
            device_id: 0x1b80,
            device_name: "GeForce GTX 1080".to_string(),
            iommu_group: group,
            iommu_fd: fd.map(str::to_string),
            is_nvswitch: false,
        }
    }

    fn request(keys: &[&[&str]]) -> AllocateRequest {
        AllocateRequest {
            container_requests: keys
                .iter()
                .map(|ids| ContainerAllocateRequest {
                    devices_ids: ids.iter().map(|s| s.to_string()).collect(),
                })
                .collect(),
        }
    }

    fn host_paths(response: &ContainerAllocateResponse) -> Vec<&str> {
        response.devices.iter().map(|d| d.host_path.as_str()).collect()
    }

    #[test]
    fn test_legacy_group_allocation() {
        let snapshot = DiscoverySnapshot::from_devices(
            false,
            vec![device("0000:01:00.0", 1, None), device("0000:02:00.0", 2, None)],
        );

        let response = allocate(&snapshot, Path::new("/dev/vfio"), &request(&[&["1"]])).unwrap();
        assert_eq!(response.container_responses.len(), 1);

        let container = &response.container_responses[0];
        assert_eq!(host_paths(container), vec!["/dev/vfio/vfio", "/dev/vfio/1"]);
        for spec in &container.devices {
            assert_eq!(spec.container_path, spec.host_path);
            assert_eq!(spec.permissions, "mrw");
        }
    }

    #[test]
    fn test_legacy_two_nodes_per_key() {
        let snapshot = DiscoverySnapshot::from_devices(
            false,
            vec![device("0000:01:00.0", 1, None), device("0000:02:00.0", 2, None)],
        );

        let response =
            allocate(&snapshot, Path::new("/dev/vfio"), &request(&[&["1", "2"]])).unwrap();
        assert_eq!(
            host_paths(&response.container_responses[0]),
            vec!["/dev/vfio/vfio", "/dev/vfio/1", "/dev/vfio/vfio", "/dev/vfio/2"]
        );
    }

    #[test]
    fn test_iommufd_allocation() {
        let snapshot =
            DiscoverySnapshot::from_devices(true, vec![device("0000:01:00.0", 7, Some("vfio3"))]);

        let response = allocate(&snapshot, Path::new("/dev/vfio"), &request(&[&["vfio3"]])).unwrap();
        assert_eq!(host_paths(&response.container_responses[0]), vec!["/dev/vfio/devices/vfio3"]);
    }

    #[test]
    fn test_iommufd_missing_handle_fails() {
        // Unit keyed by group because the device has no handle
        let snapshot = DiscoverySnapshot::from_devices(true, vec![device("0000:01:00.0", 7, None)]);

        let err = allocate(&snapshot, Path::new("/dev/vfio"), &request(&[&["7"]])).unwrap_err();
        assert!(matches!(err, PluginError::MissingIommuFd { .. }));
    }

    #[test]
    fn test_unknown_key_fails_whole_request() {
        let snapshot = DiscoverySnapshot::from_devices(false, vec![device("0000:01:00.0", 1, None)]);

        let err = allocate(&snapshot, Path::new("/dev/vfio"), &request(&[&["1"], &["42"]])).unwrap_err();
        assert!(matches!(err, PluginError::UnknownUnit { ref key } if key == "42"));
        assert_eq!(err.to_string(), "invalid allocation request: unknown iommu id: 42");
    }

    #[test]
    fn test_empty_request() {
        let snapshot = DiscoverySnapshot::default();
        let response = allocate(&snapshot, Path::new("/dev/vfio"), &AllocateRequest::default()).unwrap();
        assert!(response.container_responses.is_empty());
    }
}
