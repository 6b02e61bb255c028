//! End to end tests for the device plugin gRPC surface, over real unix
//! sockets in a temporary plugin directory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use device_plugin_pb::api::device_plugin_client::DevicePluginClient;
use device_plugin_pb::api::registration_server::Registration;
use device_plugin_pb::api::registration_server::RegistrationServer;
use device_plugin_pb::api::AllocateRequest;
use device_plugin_pb::api::ContainerAllocateRequest;
use device_plugin_pb::api::Empty;
use device_plugin_pb::api::ListAndWatchResponse;
use device_plugin_pb::api::RegisterRequest;
use rdma_device_plugin::discovery::Device;
use rdma_device_plugin::discovery::RdmaDevice;
use rdma_device_plugin::server::dial;
use rdma_device_plugin::server::PluginConfig;
use rdma_device_plugin::server::RdmaDevicePlugin;
use similar_asserts::assert_eq;
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Request;
use tonic::Response;
use tonic::Status;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

fn device(name: &str, dev_name: &str, netdev: &str) -> Device {
    Device {
        rdma: RdmaDevice {
            name: name.to_string(),
            dev_name: dev_name.to_string(),
        },
        netdev: netdev.to_string(),
    }
}

fn test_config(dir: &Path) -> PluginConfig {
    PluginConfig {
        plugin_dir: dir.to_path_buf(),
        resource_name: "tencent.com/rdma".to_string(),
        knem_marker: dir.join("knem-absent"),
        sysfs_root: dir.join("sys"),
    }
}

fn write_port_state(dir: &Path, device: &str, state: &str) {
    let ports = dir.join("sys/class/infiniband").join(device).join("ports/1");
    std::fs::create_dir_all(&ports).expect("should create ports directory");
    std::fs::write(ports.join("state"), state).expect("should write port state");
}

fn test_plugin(dir: &Path) -> RdmaDevicePlugin {
    // Give both devices an ACTIVE port so the health monitor sees them up.
    write_port_state(dir, "mlx5_0", "4: ACTIVE\n");
    write_port_state(dir, "mlx5_1", "4: ACTIVE\n");
    RdmaDevicePlugin::with_devices(
        vec![
            device("mlx5_0", "uverbs0", "eth2"),
            device("mlx5_1", "uverbs1", "eth3"),
        ],
        test_config(dir),
    )
}

async fn started_plugin(dir: &Path) -> RdmaDevicePlugin {
    let mut plugin = test_plugin(dir);
    plugin.start().await.expect("plugin should start");
    plugin
}

async fn connect(plugin: &RdmaDevicePlugin) -> DevicePluginClient<Channel> {
    let channel = dial(plugin.socket_path(), DIAL_TIMEOUT)
        .await
        .expect("plugin socket should accept connections");
    DevicePluginClient::new(channel)
}

fn health_by_id(response: &ListAndWatchResponse) -> Vec<(String, String)> {
    response
        .devices
        .iter()
        .map(|device| (device.id.clone(), device.health.clone()))
        .collect()
}

/// Registration endpoint standing in for the kubelet.
struct FakeKubelet {
    requests: Arc<Mutex<Vec<RegisterRequest>>>,
}

#[tonic::async_trait]
impl Registration for FakeKubelet {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<Empty>, Status> {
        self.requests.lock().await.push(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

fn spawn_fake_kubelet(dir: &Path) -> (Arc<Mutex<Vec<RegisterRequest>>>, CancellationToken) {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let kubelet = FakeKubelet {
        requests: Arc::clone(&requests),
    };
    let listener =
        UnixListener::bind(dir.join("kubelet.sock")).expect("should bind kubelet socket");
    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(RegistrationServer::new(kubelet))
            .serve_with_incoming_shutdown(
                tokio_stream::wrappers::UnixListenerStream::new(listener),
                async move {
                    shutdown.cancelled().await;
                },
            )
            .await
            .expect("fake kubelet should serve");
    });
    (requests, token)
}

#[test_log::test(tokio::test)]
async fn plugin_replaces_a_stale_socket_on_start() {
    let dir = TempDir::new().expect("should create temp dir");
    let config = test_config(dir.path());
    std::fs::write(config.socket_path(), b"stale").expect("should plant stale socket");

    let mut plugin = started_plugin(dir.path()).await;
    let mut client = connect(&plugin).await;
    let options = client
        .get_device_plugin_options(Empty {})
        .await
        .expect("options call should succeed")
        .into_inner();
    assert!(!options.pre_start_required);
    assert!(!options.get_preferred_allocation_available);

    plugin.stop().await.expect("plugin should stop");
}

#[test_log::test(tokio::test)]
async fn list_and_watch_streams_snapshots_and_health_changes() {
    let dir = TempDir::new().expect("should create temp dir");
    let mut plugin = started_plugin(dir.path()).await;
    let mut client = connect(&plugin).await;

    let mut stream = client
        .list_and_watch(Empty {})
        .await
        .expect("list_and_watch should start")
        .into_inner();

    let first = timeout(Duration::from_secs(5), stream.message())
        .await
        .expect("initial snapshot should arrive promptly")
        .expect("stream should be healthy")
        .expect("stream should not end yet");
    assert_eq!(
        health_by_id(&first),
        vec![
            ("mlx5_0".to_string(), "Healthy".to_string()),
            ("mlx5_1".to_string(), "Healthy".to_string()),
        ],
        "first message should list every device as healthy"
    );

    plugin.report_unhealthy("mlx5_1");
    let second = timeout(Duration::from_secs(5), stream.message())
        .await
        .expect("update should arrive promptly")
        .expect("stream should be healthy")
        .expect("stream should not end yet");
    assert_eq!(
        health_by_id(&second),
        vec![
            ("mlx5_0".to_string(), "Healthy".to_string()),
            ("mlx5_1".to_string(), "Unhealthy".to_string()),
        ],
        "update should be a full snapshot with the device degraded"
    );

    // A subscriber arriving now starts from the degraded state.
    let mut late_stream = client
        .list_and_watch(Empty {})
        .await
        .expect("second watch should start")
        .into_inner();
    let late_first = timeout(Duration::from_secs(5), late_stream.message())
        .await
        .expect("snapshot should arrive promptly")
        .expect("stream should be healthy")
        .expect("stream should not end yet");
    assert_eq!(
        health_by_id(&late_first),
        vec![
            ("mlx5_0".to_string(), "Healthy".to_string()),
            ("mlx5_1".to_string(), "Unhealthy".to_string()),
        ],
        "a late subscriber should see the current state"
    );

    plugin.stop().await.expect("plugin should stop");
    let end = timeout(Duration::from_secs(10), stream.message())
        .await
        .expect("stream should settle within the stop timeout");
    assert!(
        matches!(end, Ok(None)),
        "stop should end the stream cleanly, got {end:?}"
    );
}

#[test_log::test(tokio::test)]
async fn health_monitor_degrades_devices_without_active_ports() {
    let dir = TempDir::new().expect("should create temp dir");
    let mut plugin = test_plugin(dir.path());
    write_port_state(dir.path(), "mlx5_1", "1: DOWN\n");
    plugin.start().await.expect("plugin should start");

    let mut client = connect(&plugin).await;
    let mut stream = client
        .list_and_watch(Empty {})
        .await
        .expect("list_and_watch should start")
        .into_inner();

    // The first probe round runs at startup; depending on timing the
    // degradation lands in the initial snapshot or in a follow-up.
    let degraded = vec![
        ("mlx5_0".to_string(), "Healthy".to_string()),
        ("mlx5_1".to_string(), "Unhealthy".to_string()),
    ];
    loop {
        let snapshot = timeout(Duration::from_secs(5), stream.message())
            .await
            .expect("snapshot should arrive promptly")
            .expect("stream should be healthy")
            .expect("stream should not end yet");
        if health_by_id(&snapshot) == degraded {
            break;
        }
    }

    plugin.stop().await.expect("plugin should stop");
}

#[test_log::test(tokio::test)]
async fn allocate_builds_per_container_device_lists() {
    let dir = TempDir::new().expect("should create temp dir");
    let mut plugin = started_plugin(dir.path()).await;
    let mut client = connect(&plugin).await;

    let response = client
        .allocate(AllocateRequest {
            container_requests: vec![
                ContainerAllocateRequest {
                    devices_ids: vec!["mlx5_0".to_string()],
                },
                ContainerAllocateRequest {
                    devices_ids: vec!["mlx5_1".to_string()],
                },
            ],
        })
        .await
        .expect("allocation should succeed")
        .into_inner();

    let paths: Vec<Vec<String>> = response
        .container_responses
        .iter()
        .map(|container| {
            container
                .devices
                .iter()
                .map(|spec| spec.host_path.clone())
                .collect()
        })
        .collect();
    assert_eq!(
        paths,
        vec![
            vec![
                "/dev/infiniband/uverbs0".to_string(),
                "/dev/infiniband/rdma_cm".to_string(),
            ],
            vec![
                "/dev/infiniband/uverbs1".to_string(),
                "/dev/infiniband/rdma_cm".to_string(),
            ],
        ],
        "each container should only receive its own devices plus the helpers"
    );

    plugin.stop().await.expect("plugin should stop");
}

#[test_log::test(tokio::test)]
async fn allocate_rejects_unknown_devices() {
    let dir = TempDir::new().expect("should create temp dir");
    let mut plugin = started_plugin(dir.path()).await;
    let mut client = connect(&plugin).await;

    let status = client
        .allocate(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_ids: vec!["mlx5_0".to_string(), "mlx5_9".to_string()],
            }],
        })
        .await
        .expect_err("unknown device should fail the request");
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    assert_eq!(
        status.message(),
        "invalid allocation request: unknown device: mlx5_9"
    );

    plugin.stop().await.expect("plugin should stop");
}

#[test_log::test(tokio::test)]
async fn stop_removes_the_socket_and_is_idempotent() {
    let dir = TempDir::new().expect("should create temp dir");
    let mut plugin = started_plugin(dir.path()).await;
    let socket_path = plugin.socket_path();
    assert!(socket_path.exists(), "socket should exist while serving");

    plugin.stop().await.expect("first stop should succeed");
    assert!(!socket_path.exists(), "stop should remove the socket");

    plugin.stop().await.expect("second stop should be a no-op");
}

#[test_log::test(tokio::test)]
async fn serve_registers_with_the_kubelet() {
    let dir = TempDir::new().expect("should create temp dir");
    let (requests, kubelet_token) = spawn_fake_kubelet(dir.path());

    let mut plugin = test_plugin(dir.path());
    plugin.serve().await.expect("serve should succeed");

    let seen = requests.lock().await;
    assert_eq!(seen.len(), 1, "exactly one registration should happen");
    assert_eq!(seen[0].version, "v1beta1");
    assert_eq!(seen[0].endpoint, "rdma.sock");
    assert_eq!(seen[0].resource_name, "tencent.com/rdma");
    drop(seen);

    plugin.stop().await.expect("plugin should stop");
    kubelet_token.cancel();
}

#[test_log::test(tokio::test)]
async fn serve_without_a_kubelet_fails_and_cleans_up() {
    let dir = TempDir::new().expect("should create temp dir");
    let mut plugin = test_plugin(dir.path());

    plugin
        .serve()
        .await
        .expect_err("registration should fail without a kubelet socket");
    assert!(
        !plugin.socket_path().exists(),
        "a failed serve should not leave its socket behind"
    );
}
