//! Container Device Interface (CDI) spec generation.
//!
//! Runtimes that understand CDI can inject VFIO device nodes into a sandbox by
//! symbolic name (e.g. `nvidia.com/pgpu=0`) without privileged mode. Each
//! device class gets one spec file, `<vendor>-<class>.yaml`, under the CDI
//! root.

mod spec;
mod writer;

pub use spec::{validate_kind_part, ContainerEdits, Device, DeviceNode, Spec, CDI_VERSION};
pub use writer::{generate_cdi_specs, CdiWriter, SpecScope};
