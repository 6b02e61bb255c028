//! RDMA device discovery.
//!
//! This module builds the node's RDMA inventory by scanning sysfs. It pairs
//! each InfiniBand uverbs device with the network interface that lives on the
//! same PCI function, by comparing the `device/resource` descriptor that both
//! class entries expose. Two entries that are backed by the same function have
//! byte-identical descriptors.
//!
//! # Key Components
//!
//! - [`InventorySource`]: Access to the device lists and descriptors, so tests
//!   can substitute a fake filesystem
//! - [`SysfsInventory`]: The production source, rooted at `/sys`
//! - [`correlate`]: The pairing pass producing [`Device`] records
//!
//! A descriptor that cannot be read only removes the affected entry from the
//! candidate set; discovery fails as a whole only when a class directory
//! itself cannot be enumerated.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use thiserror::Error;
use tracing::debug;

/// An InfiniBand device as exposed by the verbs layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdmaDevice {
    /// Kernel name of the device, e.g. `mlx5_0`
    pub name: String,
    /// Name of the uverbs character device, e.g. `uverbs0`
    pub dev_name: String,
}

/// An RDMA device joined with the network interface on the same PCI function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// The verbs side of the pairing
    pub rdma: RdmaDevice,
    /// Name of the paired network interface, e.g. `eth2`
    pub netdev: String,
}

/// Errors that can occur while enumerating the RDMA inventory.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to enumerate InfiniBand devices under {path}")]
    RdmaEnumeration { path: PathBuf },
    #[error("Failed to enumerate network interfaces under {path}")]
    NetEnumeration { path: PathBuf },
}

/// Access to the raw device lists and their pairing descriptors.
///
/// Descriptor reads return `io::Result` so that a missing or unreadable
/// entry can be told apart from an enumeration failure and skipped.
pub trait InventorySource {
    /// All uverbs devices present on the node.
    fn rdma_devices(&self) -> Result<Vec<RdmaDevice>, Report<DiscoveryError>>;

    /// All network interface names present on the node.
    fn net_devices(&self) -> Result<Vec<String>, Report<DiscoveryError>>;

    /// Raw pairing descriptor of an RDMA device.
    fn rdma_resource(&self, name: &str) -> io::Result<Vec<u8>>;

    /// Raw pairing descriptor of a network interface.
    fn net_resource(&self, name: &str) -> io::Result<Vec<u8>>;
}

/// Production [`InventorySource`] backed by sysfs.
#[derive(Debug, Clone)]
pub struct SysfsInventory {
    root: PathBuf,
}

impl SysfsInventory {
    /// Creates a source rooted at the given sysfs mount, `/sys` in
    /// production.
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn verbs_class_dir(&self) -> PathBuf {
        self.root.join("class/infiniband_verbs")
    }

    fn net_class_dir(&self) -> PathBuf {
        self.root.join("class/net")
    }

    /// Lists the entries of a class directory in name order.
    ///
    /// A missing class directory means the subsystem is absent, which is
    /// reported as an empty inventory rather than an error.
    fn sorted_class_entries(dir: &Path) -> io::Result<Vec<String>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }
}

impl InventorySource for SysfsInventory {
    fn rdma_devices(&self) -> Result<Vec<RdmaDevice>, Report<DiscoveryError>> {
        let class_dir = self.verbs_class_dir();
        let entries = Self::sorted_class_entries(&class_dir).change_context(
            DiscoveryError::RdmaEnumeration {
                path: class_dir.clone(),
            },
        )?;

        let mut devices = Vec::new();
        for entry in entries {
            if !entry.starts_with("uverbs") {
                continue;
            }
            let ibdev_path = class_dir.join(&entry).join("ibdev");
            match fs::read_to_string(&ibdev_path) {
                Ok(name) => devices.push(RdmaDevice {
                    name: name.trim().to_string(),
                    dev_name: entry,
                }),
                Err(e) => {
                    // The device can vanish between enumeration and read.
                    debug!("skipping {}: {e}", ibdev_path.display());
                }
            }
        }
        Ok(devices)
    }

    fn net_devices(&self) -> Result<Vec<String>, Report<DiscoveryError>> {
        let class_dir = self.net_class_dir();
        Self::sorted_class_entries(&class_dir).change_context(DiscoveryError::NetEnumeration {
            path: class_dir,
        })
    }

    fn rdma_resource(&self, name: &str) -> io::Result<Vec<u8>> {
        fs::read(self.root.join("class/infiniband").join(name).join("device/resource"))
    }

    fn net_resource(&self, name: &str) -> io::Result<Vec<u8>> {
        fs::read(self.net_class_dir().join(name).join("device/resource"))
    }
}

/// Builds the node inventory from the sysfs mount at `root`.
pub fn discover<P: Into<PathBuf>>(root: P) -> Result<Vec<Device>, Report<DiscoveryError>> {
    correlate(&SysfsInventory::with_root(root))
}

/// Pairs RDMA devices with network interfaces by descriptor equality.
///
/// Every netdev descriptor is read once up front, then each RDMA device is
/// compared against the collected keys. Output order follows the RDMA device
/// order of the source, so a deterministic source yields a deterministic
/// inventory. An RDMA device whose descriptor matches several interfaces
/// produces one record per match.
pub fn correlate<S: InventorySource>(source: &S) -> Result<Vec<Device>, Report<DiscoveryError>> {
    let rdma_devices = source.rdma_devices()?;
    let net_devices = source.net_devices()?;

    let mut net_keys: Vec<(String, Vec<u8>)> = Vec::with_capacity(net_devices.len());
    for netdev in net_devices {
        match source.net_resource(&netdev) {
            Ok(key) => net_keys.push((netdev, key)),
            Err(e) => debug!("no pairing descriptor for {netdev}: {e}"),
        }
    }

    let mut devices = Vec::new();
    for rdma in rdma_devices {
        let key = match source.rdma_resource(&rdma.name) {
            Ok(key) => key,
            Err(e) => {
                debug!("no pairing descriptor for {}: {e}", rdma.name);
                continue;
            }
        };
        for (netdev, net_key) in &net_keys {
            if *net_key == key {
                devices.push(Device {
                    rdma: rdma.clone(),
                    netdev: netdev.clone(),
                });
            }
        }
    }
    Ok(devices)
}
