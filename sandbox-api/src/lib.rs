//! Kubelet device plugin gRPC API.
//!
//! The protobuf definitions in `proto/deviceplugin.proto` mirror the kubelet
//! `deviceplugin/v1beta1` package and are code-generated via `tonic-build`.

pub mod deviceplugin {
    pub mod v1beta1 {
        tonic::include_proto!("v1beta1");

        /// API version sent in registration requests.
        pub const VERSION: &str = "v1beta1";

        /// Health value reported for a usable device.
        pub const HEALTHY: &str = "Healthy";

        /// Health value reported for a missing device.
        pub const UNHEALTHY: &str = "Unhealthy";
    }
}
