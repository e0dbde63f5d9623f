//! Error types for the sandbox device plugin.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for device plugin operations.
pub type Result<T> = std::result::Result<T, PluginError>;

/// Main error type for the sandbox device plugin.
#[derive(Error, Debug)]
pub enum PluginError {
    // Discovery errors
    #[error("Failed to check IOMMUFD support at {path:?}: {source}")]
    CapabilityCheck {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("PCI device enumeration failed: {reason}")]
    Enumeration { reason: String },

    // Allocation errors
    #[error("invalid allocation request: unknown iommu id: {key}")]
    UnknownUnit { key: String },

    #[error("iommufd device not available for device {address}")]
    MissingIommuFd { address: String },

    // Plugin lifecycle errors
    #[error("gRPC server already started for {class}")]
    AlreadyStarted { class: String },

    #[error("Failed to bind device plugin socket {path:?}: {source}")]
    SocketBind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("gRPC server at {path:?} not ready: {reason}")]
    ServerNotReady { path: PathBuf, reason: String },

    #[error("Failed to register {resource} with kubelet: {reason}")]
    RegistrationFailed { resource: String, reason: String },

    #[error("Failed to watch {path:?}: {reason}")]
    WatchFailed { path: PathBuf, reason: String },

    // CDI errors
    #[error("Invalid CDI class name {class:?}: {reason}")]
    InvalidCdiClass { class: String, reason: String },

    #[error("Failed to serialize CDI spec {name}: {reason}")]
    CdiSerialize { name: String, reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PluginError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Wrap an I/O error with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoError { path: path.into(), source }
    }

    /// Whether this error rejects an allocation request (as opposed to a host failure).
    pub fn is_allocation_error(&self) -> bool {
        matches!(self, Self::UnknownUnit { .. } | Self::MissingIommuFd { .. })
    }
}
