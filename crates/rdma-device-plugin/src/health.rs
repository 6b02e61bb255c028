//! Device health monitoring.
//!
//! The monitor periodically asks a [`HealthProbe`] about every advertised
//! device and reports failures to the device list task. Each device is
//! reported at most once per plugin lifetime; the advertised health never
//! returns to healthy, a restart rebuilds the list instead.
//!
//! The production probe reads the InfiniBand port state from sysfs. A device
//! counts as healthy while at least one of its ports is ACTIVE.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::device_list::DeviceEvent;
use crate::discovery::Device;

const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Verdict source for a single device.
pub trait HealthProbe: Send + Sync {
    fn device_healthy(&self, device: &Device) -> bool;
}

/// [`HealthProbe`] backed by the sysfs port state of the device.
#[derive(Debug, Clone)]
pub struct PortStateProbe {
    sysfs_root: PathBuf,
}

impl Default for PortStateProbe {
    fn default() -> Self {
        Self::with_root("/sys")
    }
}

impl PortStateProbe {
    /// Creates a probe rooted at the given sysfs mount, `/sys` in
    /// production.
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            sysfs_root: root.into(),
        }
    }

    fn ports_dir(&self, device: &Device) -> PathBuf {
        self.sysfs_root
            .join("class/infiniband")
            .join(&device.rdma.name)
            .join("ports")
    }
}

impl HealthProbe for PortStateProbe {
    fn device_healthy(&self, device: &Device) -> bool {
        let ports_dir = self.ports_dir(device);
        let ports = match fs::read_dir(&ports_dir) {
            Ok(ports) => ports,
            Err(e) => {
                // No ports directory means the device is gone.
                debug!("cannot read {}: {e}", ports_dir.display());
                return false;
            }
        };
        for port in ports.filter_map(|entry| entry.ok()) {
            let state_path = port.path().join("state");
            match fs::read_to_string(&state_path) {
                Ok(state) if state.contains("ACTIVE") => return true,
                Ok(state) => debug!(
                    "port state {} for {}: {}",
                    state_path.display(),
                    device.rdma.name,
                    state.trim()
                ),
                Err(e) => debug!("cannot read {}: {e}", state_path.display()),
            }
        }
        false
    }
}

/// Periodic health checker for the advertised devices.
pub struct HealthMonitor {
    devices: Vec<Device>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    probe: Box<dyn HealthProbe>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(devices: Vec<Device>, events: mpsc::UnboundedSender<DeviceEvent>) -> Self {
        Self {
            devices,
            events,
            probe: Box::new(PortStateProbe::default()),
            interval: DEFAULT_PROBE_INTERVAL,
        }
    }

    pub fn with_probe(mut self, probe: Box<dyn HealthProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Probes on a fixed interval until cancellation. The first round runs
    /// immediately, so a device that is already degraded at startup is
    /// reported without waiting a full period.
    pub async fn run(self, token: CancellationToken) {
        let mut reported: HashSet<String> = HashSet::new();
        let mut interval_timer = time::interval(self.interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval_timer.tick() => self.check_devices(&mut reported),
            }
        }
        debug!("health monitor exiting");
    }

    fn check_devices(&self, reported: &mut HashSet<String>) {
        for device in &self.devices {
            if reported.contains(&device.rdma.name) {
                continue;
            }
            if self.probe.device_healthy(device) {
                continue;
            }
            info!("device {} became unhealthy", device.rdma.name);
            reported.insert(device.rdma.name.clone());
            if self
                .events
                .send(DeviceEvent::MarkUnhealthy(device.rdma.name.clone()))
                .is_err()
            {
                warn!("device list task is gone, stopping health reports");
                return;
            }
        }
    }
}
