//! CDI spec document types.
//!
//! Only the subset of the Container Device Interface schema the plugin emits:
//! a kind, a list of named devices and the device nodes each one injects.

use crate::error::{PluginError, Result};
use serde::{Deserialize, Serialize};

/// Schema version understood by Kata-based sandbox runtimes.
pub const CDI_VERSION: &str = "0.5.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    pub cdi_version: String,
    /// `<vendor>/<class>`, e.g. `nvidia.com/pgpu`
    pub kind: String,
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub name: String,
    pub container_edits: ContainerEdits,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerEdits {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_nodes: Vec<DeviceNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceNode {
    pub path: String,
}

impl Spec {
    pub fn new(vendor: &str, class: &str, devices: Vec<Device>) -> Self {
        Self { cdi_version: CDI_VERSION.to_string(), kind: format!("{}/{}", vendor, class), devices }
    }

    /// File name derived from the kind: `nvidia.com/pgpu` -> `nvidia.com-pgpu.yaml`.
    pub fn file_name(&self) -> String {
        format!("{}.yaml", self.kind.replace('/', "-"))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| PluginError::CdiSerialize { name: self.kind.clone(), reason: e.to_string() })
    }
}

/// Validate one half of a CDI kind.
///
/// Names are non-empty, use only ASCII alphanumerics plus `_`, `-` and `.`,
/// and start and end with an alphanumeric.
pub fn validate_kind_part(name: &str) -> Result<()> {
    let invalid = |reason: &str| PluginError::InvalidCdiClass {
        class: name.to_string(),
        reason: reason.to_string(),
    };

    let (Some(first), Some(last)) = (name.chars().next(), name.chars().last()) else {
        return Err(invalid("name is empty"));
    };
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return Err(invalid("name must start and end with a letter or digit"));
    }
    if let Some(c) = name.chars().find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '_' | '-' | '.')) {
        return Err(invalid(&format!("invalid character {:?}", c)));
    }
    Ok(())
}
