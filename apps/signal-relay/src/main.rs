mod config;
mod handlers;
mod registry;
mod relay;
mod server;
mod telemetry;
mod websocket;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use crate::config::{Cli, RelayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RelayConfig::try_from(cli)?;
    let telemetry = telemetry::Telemetry::init(config.metrics_enabled)?;
    info!(
        listen_addr = %config.listen_addr,
        cookie_name = %config.cookie_name,
        metrics_enabled = config.metrics_enabled,
        "starting signal-relay"
    );

    server::run(config, telemetry.metrics_handle()).await
}
