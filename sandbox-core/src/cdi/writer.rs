//! CDI spec generation from a discovery snapshot.

use super::spec::{validate_kind_part, ContainerEdits, Device, DeviceNode, Spec};
use crate::config::Config;
use crate::discovery::{DiscoverySnapshot, VfioDevice};
use crate::error::{PluginError, Result};
use crate::observability::metrics;
use crate::paths;
use crate::vfio::compare_unit_keys;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Which devices of the snapshot one spec covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecScope {
    /// Every GPU, or every NVSwitch (alias mode).
    Category { nvswitch: bool },
    /// The device IDs sharing one class name (per-type mode).
    DeviceClasses(BTreeSet<String>),
}

impl SpecScope {
    fn includes(&self, dev: &VfioDevice) -> bool {
        match self {
            Self::Category { nvswitch } => dev.is_nvswitch == *nvswitch,
            Self::DeviceClasses(ids) => ids.contains(&dev.class_id()),
        }
    }
}

/// Writes CDI specs for every device class of a snapshot.
pub struct CdiWriter<'a> {
    snapshot: &'a DiscoverySnapshot,
    config: &'a Config,
}

impl<'a> CdiWriter<'a> {
    pub fn new(snapshot: &'a DiscoverySnapshot, config: &'a Config) -> Self {
        Self { snapshot, config }
    }

    /// Class name and scope of every spec to generate, GPUs first.
    ///
    /// Device IDs whose names resolve to the same class share one spec, so no
    /// two specs are written to the same file.
    pub fn plan(&self) -> Vec<(String, SpecScope)> {
        let mut plan = Vec::new();

        for nvswitch in [false, true] {
            if let Some(alias) = self.config.alias_for(nvswitch) {
                plan.push((alias.to_string(), SpecScope::Category { nvswitch }));
                continue;
            }

            let class_ids: BTreeSet<String> = self
                .snapshot
                .units()
                .values()
                .flatten()
                .filter(|dev| dev.is_nvswitch == nvswitch)
                .map(VfioDevice::class_id)
                .collect();

            for id in class_ids {
                let name = self.snapshot.device_name_for_class(&id);
                let class = if name.is_empty() { id.clone() } else { name };
                match plan.iter_mut().find(|(name, scope)| {
                    *name == class && matches!(scope, SpecScope::DeviceClasses(_))
                }) {
                    Some((_, SpecScope::DeviceClasses(ids))) => {
                        ids.insert(id);
                    }
                    _ => plan.push((class, SpecScope::DeviceClasses(BTreeSet::from([id])))),
                }
            }
        }

        plan
    }

    /// Build the spec for one class, or `None` when no device falls in scope.
    ///
    /// Units are visited in ascending numeric key order. Each device gets an
    /// ordinal entry plus entries named after its group number and IOMMUFD
    /// handle; repeated names are dropped.
    pub fn build_spec(&self, class: &str, scope: &SpecScope) -> Option<Spec> {
        let vfio_root = &self.config.vfio_root;

        let mut keys: Vec<&String> = self.snapshot.units().keys().collect();
        keys.sort_by(|a, b| compare_unit_keys(a, b));

        let mut devices = Vec::new();
        let mut seen = HashSet::new();
        let mut idx = 0usize;

        for key in keys {
            let Some(unit) = self.snapshot.unit(key) else { continue };
            for dev in unit.iter().filter(|dev| scope.includes(dev)) {
                let edits = ContainerEdits { device_nodes: device_nodes(vfio_root, key, dev, self.snapshot.iommufd()) };

                let mut names = vec![idx.to_string(), dev.iommu_group.to_string()];
                names.extend(dev.iommu_fd.clone());
                for name in names {
                    if seen.insert(name.clone()) {
                        devices.push(Device { name, container_edits: edits.clone() });
                    }
                }

                debug!(idx, address = %dev.address, unit = %key, class, "Added CDI device");
                idx += 1;
            }
        }

        if devices.is_empty() {
            info!(class, "No devices found for CDI spec");
            return None;
        }

        Some(Spec::new(&self.config.cdi_vendor, class, devices))
    }

    /// Generate and write every spec, stopping at the first failure.
    ///
    /// Returns the paths written. Nothing is written, and the CDI directory is
    /// not created, when the snapshot holds no devices.
    #[instrument(skip(self), fields(cdi_root = %self.config.cdi_root.display()))]
    pub fn write_all(&self) -> Result<Vec<PathBuf>> {
        if self.snapshot.is_empty() {
            info!("No devices discovered, skipping CDI spec generation");
            return Ok(Vec::new());
        }

        validate_kind_part(&self.config.cdi_vendor)?;
        let cdi_root = &self.config.cdi_root;
        fs::create_dir_all(cdi_root).map_err(|e| PluginError::io(cdi_root, e))?;

        let mut written = Vec::new();
        for (class, scope) in self.plan() {
            validate_kind_part(&class)?;
            let Some(spec) = self.build_spec(&class, &scope) else { continue };
            let path = write_spec(cdi_root, &spec)?;
            info!(path = %path.display(), devices = spec.devices.len(), "Generated CDI spec");
            written.push(path);
        }

        Ok(written)
    }
}

/// Generate CDI specs for a snapshot with the given configuration.
pub fn generate_cdi_specs(snapshot: &DiscoverySnapshot, config: &Config) -> Result<Vec<PathBuf>> {
    CdiWriter::new(snapshot, config).write_all()
}

/// Device nodes injected for one device of a unit.
fn device_nodes(vfio_root: &Path, key: &str, dev: &VfioDevice, iommufd: bool) -> Vec<DeviceNode> {
    let node = |path: PathBuf| DeviceNode { path: path.to_string_lossy().into_owned() };
    match (&dev.iommu_fd, iommufd) {
        (Some(fd), true) => vec![node(paths::iommufd_node(vfio_root, fd))],
        _ => vec![node(paths::vfio_control_node(vfio_root)), node(paths::vfio_group_node(vfio_root, key))],
    }
}

/// Write a spec next to its final location, then rename it into place.
fn write_spec(cdi_root: &Path, spec: &Spec) -> Result<PathBuf> {
    let yaml = spec.to_yaml()?;
    let path = cdi_root.join(spec.file_name());
    let tmp = cdi_root.join(format!(".{}.tmp", spec.file_name()));

    fs::write(&tmp, yaml).map_err(|e| PluginError::io(&tmp, e))?;
    fs::rename(&tmp, &path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        PluginError::io(&path, e)
    })?;
    metrics::record_cdi_spec_written();

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu(address: &str, device_id: u16, name: &str, group: u32, fd: Option<&str>) -> VfioDevice {
        VfioDevice {
            address: address.to_string(),
            device_id,
            device_name: name.to_string(),
            iommu_group: group,
            iommu_fd: fd.map(str::to_string),
            is_nvswitch: false,
        }
    }

    fn nvswitch(address: &str, group: u32, fd: Option<&str>) -> VfioDevice {
        VfioDevice { is_nvswitch: true, ..gpu(address, 0x22a3, "NVIDIA H100 NVSwitch", group, fd) }
    }

    fn test_config(cdi_root: &Path) -> Config {
        Config { cdi_root: cdi_root.to_path_buf(), ..Config::default() }
    }

    fn names(spec: &Spec) -> Vec<&str> {
        spec.devices.iter().map(|d| d.name.as_str()).collect()
    }

    fn scope(ids: &[&str]) -> SpecScope {
        SpecScope::DeviceClasses(ids.iter().map(|id| id.to_string()).collect())
    }

    fn paths_of(device: &Device) -> Vec<&str> {
        device.container_edits.device_nodes.iter().map(|n| n.path.as_str()).collect()
    }

    #[test]
    fn test_legacy_nodes_and_numeric_order() {
        let snapshot = DiscoverySnapshot::from_devices(
            false,
            vec![
                gpu("0000:03:00.0", 0x2330, "NVIDIA H100 PCIe", 10, None),
                gpu("0000:01:00.0", 0x2330, "NVIDIA H100 PCIe", 8, None),
                gpu("0000:02:00.0", 0x2330, "NVIDIA H100 PCIe", 9, None),
            ],
        );
        let config = Config { pgpu_alias: Some("pgpu".to_string()), ..Config::default() };
        let writer = CdiWriter::new(&snapshot, &config);

        let spec = writer.build_spec("pgpu", &SpecScope::Category { nvswitch: false }).unwrap();
        assert_eq!(spec.kind, "nvidia.com/pgpu");
        assert_eq!(names(&spec), vec!["0", "8", "1", "9", "2", "10"]);
        assert_eq!(paths_of(&spec.devices[0]), vec!["/dev/vfio/vfio", "/dev/vfio/8"]);
        assert_eq!(paths_of(&spec.devices[5]), vec!["/dev/vfio/vfio", "/dev/vfio/10"]);
    }

    #[test]
    fn test_iommufd_nodes() {
        let snapshot = DiscoverySnapshot::from_devices(
            true,
            vec![
                gpu("0000:02:00.0", 0x2330, "NVIDIA H100 PCIe", 66, Some("vfio10")),
                gpu("0000:01:00.0", 0x2330, "NVIDIA H100 PCIe", 65, Some("vfio9")),
            ],
        );
        let config = Config::default();
        let writer = CdiWriter::new(&snapshot, &config);

        let spec = writer.build_spec("pgpu", &SpecScope::Category { nvswitch: false }).unwrap();
        assert_eq!(names(&spec), vec!["0", "65", "vfio9", "1", "66", "vfio10"]);
        for device in &spec.devices[..3] {
            assert_eq!(paths_of(device), vec!["/dev/vfio/devices/vfio9"]);
        }
        assert_eq!(paths_of(&spec.devices[3]), vec!["/dev/vfio/devices/vfio10"]);
    }

    #[test]
    fn test_fd_mode_device_without_handle_uses_group_nodes() {
        let snapshot =
            DiscoverySnapshot::from_devices(true, vec![gpu("0000:01:00.0", 0x2330, "NVIDIA H100 PCIe", 4, None)]);
        let config = Config::default();
        let spec = CdiWriter::new(&snapshot, &config)
            .build_spec("pgpu", &SpecScope::Category { nvswitch: false })
            .unwrap();

        assert_eq!(names(&spec), vec!["0", "4"]);
        assert_eq!(paths_of(&spec.devices[0]), vec!["/dev/vfio/vfio", "/dev/vfio/4"]);
    }

    #[test]
    fn test_duplicate_names_suppressed() {
        // Ordinal 1 collides with group 1 of the first device
        let snapshot = DiscoverySnapshot::from_devices(
            false,
            vec![
                gpu("0000:01:00.0", 0x2330, "NVIDIA H100 PCIe", 1, None),
                gpu("0000:02:00.0", 0x2330, "NVIDIA H100 PCIe", 2, None),
            ],
        );
        let config = Config::default();
        let spec = CdiWriter::new(&snapshot, &config)
            .build_spec("pgpu", &SpecScope::Category { nvswitch: false })
            .unwrap();

        assert_eq!(names(&spec), vec!["0", "1", "2"]);
    }

    #[test]
    fn test_plan_per_type_and_alias() {
        let snapshot = DiscoverySnapshot::from_devices(
            false,
            vec![
                gpu("0000:01:00.0", 0x1b80, "GeForce GTX 1080", 1, None),
                gpu("0000:02:00.0", 0x1b81, "[]", 2, None),
                nvswitch("0000:03:00.0", 3, None),
            ],
        );

        let config = Config::default();
        let plan = CdiWriter::new(&snapshot, &config).plan();
        assert_eq!(
            plan,
            vec![
                ("GEFORCE_GTX_1080".to_string(), scope(&["1b80"])),
                ("1b81".to_string(), scope(&["1b81"])),
                ("NVIDIA_H100_NVSWITCH".to_string(), scope(&["22a3"])),
            ]
        );

        let config = Config {
            pgpu_alias: Some("pgpu".to_string()),
            nvswitch_alias: Some("nvswitch".to_string()),
            ..Config::default()
        };
        let plan = CdiWriter::new(&snapshot, &config).plan();
        assert_eq!(
            plan,
            vec![
                ("pgpu".to_string(), SpecScope::Category { nvswitch: false }),
                ("nvswitch".to_string(), SpecScope::Category { nvswitch: true }),
            ]
        );
    }

    #[test]
    fn test_write_all_alias_mode() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = DiscoverySnapshot::from_devices(
            false,
            vec![
                gpu("0000:01:00.0", 0x1b80, "GeForce GTX 1080", 1, None),
                gpu("0000:02:00.0", 0x1b81, "GeForce GTX 1070", 2, None),
                nvswitch("0000:03:00.0", 3, None),
            ],
        );
        let config = Config {
            pgpu_alias: Some("pgpu".to_string()),
            nvswitch_alias: Some("nvswitch".to_string()),
            ..test_config(dir.path())
        };

        let written = generate_cdi_specs(&snapshot, &config).unwrap();
        assert_eq!(
            written,
            vec![dir.path().join("nvidia.com-pgpu.yaml"), dir.path().join("nvidia.com-nvswitch.yaml")]
        );

        let gpu_spec: Spec =
            serde_yaml::from_str(&fs::read_to_string(&written[0]).unwrap()).unwrap();
        assert_eq!(gpu_spec.kind, "nvidia.com/pgpu");
        assert_eq!(names(&gpu_spec), vec!["0", "1", "2"]);

        let switch_spec: Spec =
            serde_yaml::from_str(&fs::read_to_string(&written[1]).unwrap()).unwrap();
        assert_eq!(names(&switch_spec), vec!["0", "3"]);
        assert_eq!(paths_of(&switch_spec.devices[1]), vec!["/dev/vfio/vfio", "/dev/vfio/3"]);

        // Regeneration overwrites in place
        let again = generate_cdi_specs(&snapshot, &config).unwrap();
        assert_eq!(again, written);
        let files = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 2);
    }

    #[test]
    fn test_write_all_per_type_mode() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = DiscoverySnapshot::from_devices(
            false,
            vec![
                gpu("0000:01:00.0", 0x1b80, "GeForce GTX 1080", 1, None),
                gpu("0000:02:00.0", 0x1b81, "GeForce GTX 1070", 2, None),
            ],
        );

        let written = generate_cdi_specs(&snapshot, &test_config(dir.path())).unwrap();
        assert_eq!(
            written,
            vec![
                dir.path().join("nvidia.com-GEFORCE_GTX_1080.yaml"),
                dir.path().join("nvidia.com-GEFORCE_GTX_1070.yaml"),
            ]
        );
    }

    #[test]
    fn test_per_type_same_name_shares_spec() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = DiscoverySnapshot::from_devices(
            false,
            vec![
                gpu("0000:01:00.0", 0x2330, "NVIDIA Device", 1, None),
                gpu("0000:02:00.0", 0x2331, "NVIDIA Device", 2, None),
            ],
        );
        let config = test_config(dir.path());

        let plan = CdiWriter::new(&snapshot, &config).plan();
        assert_eq!(plan, vec![("NVIDIA_DEVICE".to_string(), scope(&["2330", "2331"]))]);

        let written = generate_cdi_specs(&snapshot, &config).unwrap();
        assert_eq!(written, vec![dir.path().join("nvidia.com-NVIDIA_DEVICE.yaml")]);

        let spec: Spec = serde_yaml::from_str(&fs::read_to_string(&written[0]).unwrap()).unwrap();
        assert_eq!(names(&spec), vec!["0", "1", "2"]);
        assert_eq!(paths_of(&spec.devices[0]), vec!["/dev/vfio/vfio", "/dev/vfio/1"]);
        assert_eq!(paths_of(&spec.devices[2]), vec!["/dev/vfio/vfio", "/dev/vfio/2"]);
    }

    #[test]
    fn test_padded_device_name_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = DiscoverySnapshot::from_devices(
            false,
            vec![
                gpu("0000:01:00.0", 0x2330, " NVIDIA H100 ", 1, None),
                gpu("0000:02:00.0", 0x1b80, "GeForce GTX 1080", 2, None),
            ],
        );

        let written = generate_cdi_specs(&snapshot, &test_config(dir.path())).unwrap();
        assert_eq!(
            written,
            vec![
                dir.path().join("nvidia.com-GEFORCE_GTX_1080.yaml"),
                dir.path().join("nvidia.com-NVIDIA_H100.yaml"),
            ]
        );
    }

    #[test]
    fn test_empty_snapshot_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cdi_root = dir.path().join("cdi");
        let written = generate_cdi_specs(&DiscoverySnapshot::default(), &test_config(&cdi_root)).unwrap();
        assert!(written.is_empty());
        assert!(!cdi_root.exists());
    }

    #[test]
    fn test_no_nvswitch_skips_spec() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = DiscoverySnapshot::from_devices(
            false,
            vec![gpu("0000:01:00.0", 0x1b80, "GeForce GTX 1080", 1, None)],
        );
        let config = Config {
            pgpu_alias: Some("pgpu".to_string()),
            nvswitch_alias: Some("nvswitch".to_string()),
            ..test_config(dir.path())
        };

        let written = generate_cdi_specs(&snapshot, &config).unwrap();
        assert_eq!(written, vec![dir.path().join("nvidia.com-pgpu.yaml")]);
    }

    #[test]
    fn test_directory_failure_is_propagated() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "").unwrap();

        let snapshot = DiscoverySnapshot::from_devices(
            false,
            vec![gpu("0000:01:00.0", 0x1b80, "GeForce GTX 1080", 1, None)],
        );
        let result = generate_cdi_specs(&snapshot, &test_config(&blocker.join("cdi")));
        assert!(matches!(result, Err(PluginError::IoError { .. })));
    }

    #[test]
    fn test_invalid_alias_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = DiscoverySnapshot::from_devices(
            false,
            vec![gpu("0000:01:00.0", 0x1b80, "GeForce GTX 1080", 1, None)],
        );
        let config = Config { pgpu_alias: Some("bad/alias".to_string()), ..test_config(dir.path()) };

        let result = generate_cdi_specs(&snapshot, &config);
        assert!(matches!(result, Err(PluginError::InvalidCdiClass { .. })));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
