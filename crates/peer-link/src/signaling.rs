//! WebSocket connection to the relay.
//!
//! Outbound envelopes produced by the coordinator are written as JSON text;
//! inbound text (and UTF-8 binary) frames are decoded and fed back to the
//! coordinator. When the socket ends the coordinator is asked to shut down.

use futures_util::{SinkExt, StreamExt};
use signal_proto::Envelope;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};
use url::Url;

use crate::session::CoordinatorHandle;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("relay url must use ws or wss, got {0}")]
    UnsupportedScheme(String),
    #[error("relay connection failed: {0}")]
    Connect(#[from] WsError),
}

/// Running reader/writer pair for one relay socket.
pub struct RelayConnection {
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl RelayConnection {
    /// Resolves once the relay side of the socket has ended.
    pub async fn closed(self) {
        let _ = self.reader.await;
        self.writer.abort();
    }

    pub fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

pub fn relay_url(raw: &str) -> Result<Url, SignalingError> {
    let url = Url::parse(raw)?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(SignalingError::UnsupportedScheme(other.to_string())),
    }
}

pub async fn connect(
    url: &str,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    coordinator: CoordinatorHandle,
) -> Result<RelayConnection, SignalingError> {
    let url = relay_url(url)?;
    let (stream, _) = connect_async(url.as_str()).await?;
    debug!(target: "peer_link::signaling", %url, "relay connected");
    let (mut ws_write, mut ws_read) = stream.split();

    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            let text = match envelope.encode() {
                Ok(text) => text,
                Err(err) => {
                    warn!(target: "peer_link::signaling", error = %err, "failed to encode envelope");
                    continue;
                }
            };
            trace!(target: "peer_link::signaling", kind = %envelope.kind(), to = %envelope.to(), "ws out");
            if ws_write.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(message) = ws_read.next().await {
            let decoded = match message {
                Ok(Message::Text(text)) => Envelope::decode(text.as_str()),
                Ok(Message::Binary(data)) => Envelope::decode_bytes(&data),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(err) => {
                    match &err {
                        WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                            debug!(target: "peer_link::signaling", "relay socket closed: {err}");
                        }
                        _ => warn!(target: "peer_link::signaling", "relay socket error: {err}"),
                    }
                    break;
                }
            };
            match decoded {
                Ok(envelope) => {
                    trace!(target: "peer_link::signaling", kind = %envelope.kind(), from = %envelope.from(), "ws in");
                    if coordinator.relay(envelope).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(target: "peer_link::signaling", error = %err, "malformed envelope from relay dropped");
                }
            }
        }
        let _ = coordinator.shutdown();
    });

    Ok(RelayConnection { writer, reader })
}
