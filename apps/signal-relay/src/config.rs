use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "signal-relay",
    author,
    version,
    about = "Signaling relay that introduces peers and forwards their negotiation messages"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "PEERDROP_LISTEN_ADDR", default_value = "0.0.0.0:3000")]
    pub listen_addr: String,

    /// Cookie carrying the assigned peer id on the upgrade response.
    #[arg(long, env = "PEERDROP_COOKIE_NAME", default_value = "peer_id")]
    pub cookie_name: String,

    /// Grace period applied during shutdown.
    #[arg(long, env = "PEERDROP_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,

    /// Skip installing the Prometheus recorder; `/metrics` answers 404.
    #[arg(long, env = "PEERDROP_DISABLE_METRICS", default_value_t = false)]
    pub disable_metrics: bool,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub cookie_name: String,
    pub shutdown_grace: Duration,
    pub metrics_enabled: bool,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if !is_cookie_token(&cli.cookie_name) {
            bail!("invalid cookie name: {:?}", cli.cookie_name);
        }
        Ok(RelayConfig {
            listen_addr,
            cookie_name: cli.cookie_name,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            metrics_enabled: !cli.disable_metrics,
        })
    }
}

fn is_cookie_token(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
