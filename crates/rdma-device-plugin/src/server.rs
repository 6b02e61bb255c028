//! Device plugin gRPC server and kubelet registration.
//!
//! [`RdmaDevicePlugin`] owns one serving session: the unix socket inside the
//! kubelet's device plugin directory, the gRPC server task, the device list
//! task and the health monitor. A session is started once, stopped once and
//! then discarded; the supervisor builds a fresh instance for every restart.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use device_plugin_pb::api::device_plugin_server::DevicePlugin;
use device_plugin_pb::api::device_plugin_server::DevicePluginServer;
use device_plugin_pb::api::registration_client::RegistrationClient;
use device_plugin_pb::api::AllocateRequest;
use device_plugin_pb::api::AllocateResponse;
use device_plugin_pb::api::ContainerAllocateResponse;
use device_plugin_pb::api::DevicePluginOptions;
use device_plugin_pb::api::DeviceSpec;
use device_plugin_pb::api::Empty;
use device_plugin_pb::api::ListAndWatchResponse;
use device_plugin_pb::api::PreStartContainerRequest;
use device_plugin_pb::api::PreStartContainerResponse;
use device_plugin_pb::api::PreferredAllocationRequest;
use device_plugin_pb::api::PreferredAllocationResponse;
use device_plugin_pb::api::RegisterRequest;
use error_stack::Report;
use futures::Stream;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tower::service_fn;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::device_list::DeviceEvent;
use crate::device_list::DeviceListBroadcaster;
use crate::discovery::discover;
use crate::discovery::Device;
use crate::discovery::DiscoveryError;
use crate::health::HealthMonitor;
use crate::health::PortStateProbe;

/// Name of the socket this plugin serves on, relative to the plugin directory.
pub const SERVER_SOCK_NAME: &str = "rdma.sock";

/// Name of the kubelet's registration socket inside the plugin directory.
pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";

/// Resource name advertised when none is configured.
pub const DEFAULT_RESOURCE_NAME: &str = "tencent.com/rdma";

/// Connection manager device injected into every allocation.
pub const RDMA_CM_DEVICE: &str = "/dev/infiniband/rdma_cm";

/// KNEM device injected when the host has the knem module loaded.
pub const KNEM_DEVICE: &str = "/dev/knem";

/// Sysfs entry whose presence signals that knem is available.
pub const KNEM_SYSFS: &str = "/sys/class/misc/knem";

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Paths and naming for one plugin instance.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// Directory holding the kubelet socket and all plugin sockets
    pub plugin_dir: PathBuf,
    /// Extended resource name the devices are advertised under
    pub resource_name: String,
    /// Path probed to decide whether to expose the knem device
    pub knem_marker: PathBuf,
    /// Sysfs mount that discovery and the health probe read from
    pub sysfs_root: PathBuf,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from(device_plugin_pb::DEVICE_PLUGIN_PATH),
            resource_name: DEFAULT_RESOURCE_NAME.to_string(),
            knem_marker: PathBuf::from(KNEM_SYSFS),
            sysfs_root: PathBuf::from("/sys"),
        }
    }
}

impl PluginConfig {
    /// Socket this plugin serves on.
    pub fn socket_path(&self) -> PathBuf {
        self.plugin_dir.join(SERVER_SOCK_NAME)
    }

    /// The kubelet's registration socket.
    pub fn kubelet_socket(&self) -> PathBuf {
        self.plugin_dir.join(KUBELET_SOCKET_NAME)
    }
}

/// RDMA device plugin for Kubernetes.
#[derive(Debug)]
pub struct RdmaDevicePlugin {
    config: PluginConfig,
    /// Inventory in discovery order
    devices: Vec<Device>,
    /// Allocation lookup by device ID
    registry: Arc<HashMap<String, Device>>,
    event_tx: mpsc::UnboundedSender<DeviceEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<DeviceEvent>>,
    token: CancellationToken,
    server_task: Option<JoinHandle<()>>,
    list_task: Option<JoinHandle<()>>,
    health_task: Option<JoinHandle<()>>,
}

impl RdmaDevicePlugin {
    /// Runs device discovery and builds a plugin around the result.
    ///
    /// Returns `Ok(None)` when the node has no paired RDMA devices, which is
    /// not an error; the caller decides whether to retry later.
    pub fn new(config: PluginConfig) -> Result<Option<Self>, Report<DiscoveryError>> {
        let devices = discover(&config.sysfs_root)?;
        if devices.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::with_devices(devices, config)))
    }

    /// Builds a plugin around an externally supplied inventory.
    ///
    /// A device paired with several interfaces arrives once per interface;
    /// the kubelet merges list entries by ID, so only the first record of
    /// each ID is kept.
    pub fn with_devices(devices: Vec<Device>, config: PluginConfig) -> Self {
        let mut seen = HashSet::new();
        let devices: Vec<Device> = devices
            .into_iter()
            .filter(|device| seen.insert(device.rdma.name.clone()))
            .collect();
        let registry = devices
            .iter()
            .map(|device| (device.rdma.name.clone(), device.clone()))
            .collect();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            config,
            devices,
            registry: Arc::new(registry),
            event_tx,
            event_rx: Some(event_rx),
            token: CancellationToken::new(),
            server_task: None,
            list_task: None,
            health_task: None,
        }
    }

    /// IDs advertised to the kubelet, in discovery order.
    pub fn device_ids(&self) -> Vec<String> {
        self.devices
            .iter()
            .map(|device| device.rdma.name.clone())
            .collect()
    }

    /// Socket this plugin serves on.
    pub fn socket_path(&self) -> PathBuf {
        self.config.socket_path()
    }

    /// Starts the gRPC server and registers with the kubelet. On any failure
    /// the session is stopped again so no socket or task leaks.
    pub async fn serve(&mut self) -> anyhow::Result<()> {
        if let Err(e) = self.start().await {
            let _ = self.stop().await;
            return Err(e);
        }
        info!("starting to serve on {}", self.socket_path().display());

        if let Err(e) = self.register().await {
            let _ = self.stop().await;
            return Err(e);
        }
        info!("registered device plugin with kubelet");
        Ok(())
    }

    /// Binds the plugin socket and spawns the server, device list and health
    /// monitor tasks. The socket is probed with a real connection before
    /// returning, so a success here means the kubelet will be able to reach
    /// the plugin.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let socket_path = self.socket_path();
        info!("start device plugin server: {}", socket_path.display());

        let events = self.event_rx.take().context("device plugin already started")?;

        cleanup_socket(&socket_path)
            .with_context(|| format!("remove stale socket {}", socket_path.display()))?;
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("bind {}", socket_path.display()))?;

        let service = DevicePluginService::new(
            Arc::clone(&self.registry),
            self.event_tx.clone(),
            self.config.knem_marker.clone(),
        );
        let cancellation_token = self.token.clone();
        self.server_task = Some(tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    async move {
                        cancellation_token.cancelled().await;
                        info!("shutting down gRPC server");
                    },
                )
                .await;
            if let Err(e) = result {
                error!("device plugin server error: {e}");
            }
        }));

        let broadcaster = DeviceListBroadcaster::new(self.device_ids(), events);
        self.list_task = Some(tokio::spawn(broadcaster.run(self.token.clone())));

        // The kubelet reaches the plugin through this socket; prove it
        // accepts connections before registering it.
        dial(&socket_path, DIAL_TIMEOUT)
            .await
            .with_context(|| format!("probe {}", socket_path.display()))?;

        let monitor = HealthMonitor::new(self.devices.clone(), self.event_tx.clone())
            .with_probe(Box::new(PortStateProbe::with_root(&self.config.sysfs_root)));
        self.health_task = Some(tokio::spawn(monitor.run(self.token.clone())));

        Ok(())
    }

    /// Registers this plugin's socket and resource name with the kubelet.
    pub async fn register(&self) -> anyhow::Result<()> {
        let kubelet_socket = self.config.kubelet_socket();
        info!(
            "registering device plugin with kubelet: {}",
            kubelet_socket.display()
        );

        let channel = dial(&kubelet_socket, DIAL_TIMEOUT).await?;
        let mut client = RegistrationClient::new(channel);

        let request = RegisterRequest {
            version: device_plugin_pb::VERSION.to_string(),
            endpoint: SERVER_SOCK_NAME.to_string(),
            resource_name: self.config.resource_name.clone(),
            options: None,
        };

        match client.register(Request::new(request)).await {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("failed to register device plugin with kubelet: {}", e);
                Err(anyhow::anyhow!("registration failed: {}", e))
            }
        }
    }

    /// Stops the session and removes the plugin socket. Safe to call on a
    /// session that never started or has already been stopped.
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        let Some(mut server_task) = self.server_task.take() else {
            return Ok(());
        };
        info!("stopping device plugin server");
        self.token.cancel();

        match time::timeout(STOP_TIMEOUT, &mut server_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("device plugin server task failed: {e}"),
            Err(_) => {
                warn!("gRPC server did not drain within {STOP_TIMEOUT:?}, aborting");
                server_task.abort();
            }
        }

        for task in [self.list_task.take(), self.health_task.take()]
            .into_iter()
            .flatten()
        {
            let _ = task.await;
        }

        let socket_path = self.socket_path();
        cleanup_socket(&socket_path)
            .with_context(|| format!("remove socket {}", socket_path.display()))?;
        Ok(())
    }

    /// Marks a device unhealthy as if the health monitor had reported it.
    pub fn report_unhealthy(&self, id: &str) {
        let _ = self
            .event_tx
            .send(DeviceEvent::MarkUnhealthy(id.to_string()));
    }
}

/// Connects to a unix socket speaking gRPC, with a connect timeout.
pub async fn dial<P: AsRef<Path>>(socket_path: P, timeout: Duration) -> anyhow::Result<Channel> {
    let path = socket_path.as_ref().to_path_buf();

    // The HTTP URL is a placeholder since the connector ignores it.
    let endpoint = Endpoint::from_static("http://tonic");
    let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let path = path.clone();
        async move {
            match UnixStream::connect(path).await {
                Ok(stream) => Ok(TokioIo::new(stream)),
                Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
            }
        }
    }));

    let channel = time::timeout(timeout, connect)
        .await
        .map_err(|_| anyhow::anyhow!("timed out dialing {}", socket_path.as_ref().display()))?
        .with_context(|| format!("dial {}", socket_path.as_ref().display()))?;
    Ok(channel)
}

fn cleanup_socket(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// DevicePlugin service implementation answering the kubelet.
#[derive(Debug)]
pub struct DevicePluginService {
    devices: Arc<HashMap<String, Device>>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    knem_marker: PathBuf,
    options: DevicePluginOptions,
}

impl DevicePluginService {
    pub fn new(
        devices: Arc<HashMap<String, Device>>,
        events: mpsc::UnboundedSender<DeviceEvent>,
        knem_marker: PathBuf,
    ) -> Self {
        Self {
            devices,
            events,
            knem_marker,
            options: DevicePluginOptions::default(),
        }
    }

    /// Device nodes a container needs for the requested IDs: one uverbs
    /// device per ID plus the connection manager, plus knem when present.
    fn device_specs(&self, ids: &[String]) -> Result<Vec<DeviceSpec>, Status> {
        let mut specs = Vec::with_capacity(ids.len() + 2);
        for id in ids {
            let device = self.devices.get(id).ok_or_else(|| {
                Status::invalid_argument(format!(
                    "invalid allocation request: unknown device: {id}"
                ))
            })?;
            let path = format!("/dev/infiniband/{}", device.rdma.dev_name);
            debug!("exposing {} as {path}", device.rdma.name);
            specs.push(device_spec(&path));
        }
        specs.push(device_spec(RDMA_CM_DEVICE));
        if self.knem_marker.exists() {
            specs.push(device_spec(KNEM_DEVICE));
        }
        Ok(specs)
    }
}

fn device_spec(path: &str) -> DeviceSpec {
    DeviceSpec {
        container_path: path.to_string(),
        host_path: path.to_string(),
        permissions: "rw".to_string(),
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    /// get device plugin options
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");

        Ok(Response::new(self.options))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// stream the device list, resending it on every health change
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("kubelet subscribed to the device list");

        let (tx, rx) = mpsc::unbounded_channel();
        self.events
            .send(DeviceEvent::Subscribe(tx))
            .map_err(|_| Status::unavailable("device plugin is shutting down"))?;

        let stream = UnboundedReceiverStream::new(rx).map(Ok);
        Ok(Response::new(Box::pin(stream)))
    }

    /// get preferred device allocation
    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        let req = request.into_inner();
        debug!("getting preferred device allocation: {:?}", req);

        // Not advertised in the options, so the kubelet should not call
        // this; answer the empty preference anyway.
        let response = PreferredAllocationResponse {
            container_responses: vec![],
        };
        Ok(Response::new(response))
    }

    /// allocate devices to containers
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        info!("allocation request: {:?}", req);

        let mut container_responses = Vec::new();
        for container_req in req.container_requests {
            let devices = self.device_specs(&container_req.devices_ids)?;
            container_responses.push(ContainerAllocateResponse {
                envs: HashMap::new(),
                mounts: Vec::new(),
                devices,
                annotations: HashMap::new(),
                cdi_devices: Vec::new(),
            });
        }

        let response = AllocateResponse {
            container_responses,
        };
        Ok(Response::new(response))
    }

    /// pre-start container hook, not required by this plugin
    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("pre-start container: {:?}", request.into_inner());

        Ok(Response::new(PreStartContainerResponse {}))
    }
}
