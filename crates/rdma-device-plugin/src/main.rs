use anyhow::Result;
use clap::Parser;
use rdma_device_plugin::config::Cli;
use rdma_device_plugin::logging;
use rdma_device_plugin::server::PluginConfig;
use rdma_device_plugin::supervisor::Supervisor;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    logging::init(&cli.log_level);

    tracing::info!(
        "Starting RDMA device plugin, resource name {}",
        cli.resource_name
    );

    let config = PluginConfig {
        resource_name: cli.resource_name,
        ..PluginConfig::default()
    };

    let supervisor = Supervisor::new(config)?;
    supervisor.run().await
}
