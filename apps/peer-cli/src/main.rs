mod app;
mod cli;
mod files;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Cli, PeerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Output goes to stdout; logs stay quiet unless RUST_LOG asks for more.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    let config = PeerConfig::try_from(Cli::parse())?;
    app::run(config).await
}
