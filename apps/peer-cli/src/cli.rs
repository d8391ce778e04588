use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peer_link::signaling::relay_url;
use peer_link::LinkConfig;
use signal_proto::PeerId;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "peer-cli")]
#[command(about = "Exchange text and files with other peers through a signaling relay")]
pub struct Cli {
    /// Relay WebSocket URL.
    #[arg(long, env = "PEERDROP_RELAY_URL", default_value = "ws://localhost:3000")]
    pub relay: String,

    /// Peer ids whose offers are answered automatically; `all` accepts anyone.
    #[arg(long = "accept-from", env = "PEERDROP_ACCEPT_FROM", value_delimiter = ',')]
    pub accept_from: Vec<String>,

    /// Directory received files are written to.
    #[arg(long, env = "PEERDROP_OUT_DIR", default_value = ".")]
    pub out_dir: PathBuf,

    /// How long to wait for registration and channel setup.
    #[arg(long, env = "PEERDROP_CONNECT_TIMEOUT_SECS", default_value_t = 30)]
    pub connect_timeout_secs: u64,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Stay online, answering permitted offers and saving what arrives
    Listen,

    /// Print our assigned identity and who else is online
    Peers,

    /// Open a channel to a peer and send one text message
    SendText {
        /// Recipient peer id
        #[arg(long)]
        to: String,

        text: String,
    },

    /// Open a channel to a peer and send a file
    SendFile {
        /// Recipient peer id
        #[arg(long)]
        to: String,

        path: PathBuf,

        /// MIME type announced with the file (guessed from the extension otherwise)
        #[arg(long)]
        mime: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub enum Action {
    Listen,
    Peers,
    SendText { to: PeerId, text: String },
    SendFile { to: PeerId, path: PathBuf, mime: Option<String> },
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub relay_url: Url,
    pub accept_from: Vec<String>,
    pub out_dir: PathBuf,
    pub connect_timeout: Duration,
    pub link: LinkConfig,
    pub action: Action,
}

impl TryFrom<Cli> for PeerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let relay_url =
            relay_url(&cli.relay).with_context(|| format!("invalid relay url: {}", cli.relay))?;
        let action = match cli.command {
            Commands::Listen => Action::Listen,
            Commands::Peers => Action::Peers,
            Commands::SendText { to, text } => Action::SendText {
                to: PeerId::new(to),
                text,
            },
            Commands::SendFile { to, path, mime } => Action::SendFile {
                to: PeerId::new(to),
                path,
                mime,
            },
        };
        Ok(PeerConfig {
            relay_url,
            accept_from: cli
                .accept_from
                .into_iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
            out_dir: cli.out_dir,
            connect_timeout: Duration::from_secs(cli.connect_timeout_secs.max(1)),
            link: LinkConfig::from_env(),
            action,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<PeerConfig> {
        let cli = Cli::try_parse_from(std::iter::once("peer-cli").chain(args.iter().copied()))?;
        PeerConfig::try_from(cli)
    }

    #[test_timeout::timeout]
    fn send_file_arguments() {
        let config = parse(&[
            "--relay",
            "wss://relay.example.com",
            "--accept-from",
            "a, b,,",
            "send-file",
            "--to",
            "peer-1",
            "notes.txt",
            "--mime",
            "text/plain",
        ])
        .unwrap();
        assert_eq!(config.relay_url.as_str(), "wss://relay.example.com/");
        assert_eq!(config.accept_from, vec!["a".to_string(), "b".to_string()]);
        match config.action {
            Action::SendFile { to, path, mime } => {
                assert_eq!(to, PeerId::from("peer-1"));
                assert_eq!(path, PathBuf::from("notes.txt"));
                assert_eq!(mime.as_deref(), Some("text/plain"));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn rejects_http_relay() {
        assert!(parse(&["--relay", "http://localhost:3000", "listen"]).is_err());
    }

    #[test_timeout::timeout]
    fn send_text_requires_recipient() {
        assert!(parse(&["send-text", "hello"]).is_err());
        let config = parse(&["send-text", "--to", "x", "hello"]).unwrap();
        assert!(matches!(config.action, Action::SendText { ref text, .. } if text == "hello"));
    }
}
