//! Core library for the sandbox device plugin.
//!
//! Device discovery, CDI generation and the types shared with the daemon.

pub mod cdi;
pub mod config;
pub mod discovery;
pub mod error;
pub mod naming;
pub mod observability;
pub mod paths;
pub mod vfio;

pub use config::Config;
pub use discovery::{DeviceDiscovery, DiscoverySnapshot, VfioDevice};
pub use error::{PluginError, Result};
pub use observability::init as init_observability;
