//! Generated gRPC bindings for the kubelet device plugin API.
//!
//! The kubelet exposes a `Registration` service on its own unix socket and
//! expects every device plugin to expose the `DevicePlugin` service on a
//! socket of its own, both inside [`DEVICE_PLUGIN_PATH`]. The proto source
//! lives in `proto/api.proto` and tracks the upstream v1beta1 definition.
#![allow(clippy::doc_markdown)]

pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

/// Version of the device plugin API these bindings were built against.
pub const VERSION: &str = "v1beta1";

/// Directory where the kubelet expects device plugin sockets.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";

/// The kubelet's registration socket.
pub const KUBELET_SOCKET: &str = "/var/lib/kubelet/device-plugins/kubelet.sock";

/// Health value for a device that is fit for allocation.
pub const HEALTHY: &str = "Healthy";

/// Health value for a device that should no longer be scheduled.
pub const UNHEALTHY: &str = "Unhealthy";
