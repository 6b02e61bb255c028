//! Kubernetes device plugin advertising the node's RDMA devices.
//!
//! The daemon discovers RDMA capable network adapters through sysfs,
//! advertises them to the kubelet as an extended resource and injects the
//! matching `/dev/infiniband` device nodes into containers on allocation.

pub mod config;
pub mod device_list;
pub mod discovery;
pub mod health;
pub mod logging;
pub mod server;
pub mod supervisor;
pub mod watcher;
