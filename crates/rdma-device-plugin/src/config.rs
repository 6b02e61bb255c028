use clap::Parser;

use crate::server::DEFAULT_RESOURCE_NAME;

/// Command line configuration of the daemon.
#[derive(Parser, Debug)]
#[command(name = "rdma-device-plugin", about, long_about = None, version)]
pub struct Cli {
    #[arg(
        long,
        env = "RDMA_DP_LOG_LEVEL",
        default_value = "info",
        help = "Logging level: error, warn, info, debug or trace"
    )]
    pub log_level: String,

    #[arg(
        long,
        env = "RDMA_DP_RESOURCE_NAME",
        default_value = DEFAULT_RESOURCE_NAME,
        help = "Extended resource name the RDMA devices are advertised under"
    )]
    pub resource_name: String,
}
