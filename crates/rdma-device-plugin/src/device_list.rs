//! Advertised device list ownership.
//!
//! A single task owns the list of devices reported to the kubelet. Everything
//! else talks to it through [`DeviceEvent`] messages: `ListAndWatch` handlers
//! subscribe, the health monitor marks devices unhealthy. Because only the
//! task mutates the list, a new subscriber always receives the current
//! snapshot before any later update, and every health transition produces
//! exactly one broadcast to each subscriber.
//!
//! Health only ever moves from healthy to unhealthy. A fresh task (and with
//! it a fresh all-healthy list) is created on every plugin restart.

use device_plugin_pb::api;
use device_plugin_pb::HEALTHY;
use device_plugin_pb::UNHEALTHY;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

/// Messages understood by the device list task.
#[derive(Debug)]
pub enum DeviceEvent {
    /// Attach a new `ListAndWatch` subscriber. The current snapshot is sent
    /// immediately, further snapshots follow on every health transition.
    Subscribe(mpsc::UnboundedSender<api::ListAndWatchResponse>),
    /// Mark the named device unhealthy and rebroadcast the list.
    MarkUnhealthy(String),
}

/// Owner of the advertised device list.
pub struct DeviceListBroadcaster {
    devices: Vec<api::Device>,
    subscribers: Vec<mpsc::UnboundedSender<api::ListAndWatchResponse>>,
    events: mpsc::UnboundedReceiver<DeviceEvent>,
}

impl DeviceListBroadcaster {
    /// Creates a broadcaster advertising every ID as healthy.
    pub fn new(device_ids: Vec<String>, events: mpsc::UnboundedReceiver<DeviceEvent>) -> Self {
        let devices = device_ids
            .into_iter()
            .map(|id| api::Device {
                id,
                health: HEALTHY.to_string(),
                topology: None,
            })
            .collect();
        Self {
            devices,
            subscribers: Vec::new(),
            events,
        }
    }

    /// Processes events until cancellation. Dropping the subscribers on exit
    /// is what terminates the outstanding `ListAndWatch` streams.
    pub async fn run(mut self, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(DeviceEvent::Subscribe(subscriber)) => self.subscribe(subscriber),
                    Some(DeviceEvent::MarkUnhealthy(id)) => self.mark_unhealthy(&id),
                    None => break,
                },
            }
        }
        debug!("device list task exiting");
    }

    fn snapshot(&self) -> api::ListAndWatchResponse {
        api::ListAndWatchResponse {
            devices: self.devices.clone(),
        }
    }

    fn subscribe(&mut self, subscriber: mpsc::UnboundedSender<api::ListAndWatchResponse>) {
        if subscriber.send(self.snapshot()).is_ok() {
            self.subscribers.push(subscriber);
        }
    }

    fn mark_unhealthy(&mut self, id: &str) {
        // The kubelet merges list entries by ID with the last one winning;
        // a duplicated ID must degrade in every position.
        let mut matched = false;
        for device in self.devices.iter_mut().filter(|device| device.id == id) {
            device.health = UNHEALTHY.to_string();
            matched = true;
        }
        if !matched {
            warn!("health report for unknown device {id}, ignoring");
            return;
        }
        let snapshot = self.snapshot();
        self.subscribers
            .retain(|subscriber| subscriber.send(snapshot.clone()).is_ok());
    }
}
