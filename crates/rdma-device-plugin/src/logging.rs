//! provides logging helpers

use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// initiate the global tracing subscriber
///
/// `log_level` supplies the default directive; `RUST_LOG` still overrides it.
pub fn init(log_level: &str) {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(parse_level(log_level).into())
        .from_env_lossy();

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter);

    registry().with(fmt_layer).init();
}

fn parse_level(log_level: &str) -> filter::LevelFilter {
    log_level.parse().unwrap_or(filter::LevelFilter::INFO)
}
