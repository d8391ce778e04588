use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use signal_proto::PeerId;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::relay::Relay;
use crate::server::AppState;

pub const BANNER: &str = "peerdrop signaling relay\n";

const METRIC_UPGRADE_FAILURES: &str = "peerdrop_relay_upgrade_failures_total";

fn wants_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

/// Catch-all route: any path upgrades to a relay socket, plain requests get
/// the banner on `/` and 404 elsewhere.
pub async fn upgrade_handler(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !wants_upgrade(&headers) {
        return if uri.path() == "/" {
            (StatusCode::OK, BANNER).into_response()
        } else {
            StatusCode::NOT_FOUND.into_response()
        };
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!(path = %uri.path(), error = %rejection, "websocket upgrade rejected");
            counter!(METRIC_UPGRADE_FAILURES, 1);
            return (StatusCode::BAD_REQUEST, rejection.body_text()).into_response();
        }
    };
    if !state.relay.registry().is_open() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let peer_id = PeerId::generate();
    let cookie = HeaderValue::from_str(&format!("{}={}", state.cookie_name, peer_id));
    let relay = state.relay.clone();
    let socket_id = peer_id.clone();
    let mut response = ws
        .on_failed_upgrade(|err| warn!(error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| handle_connection(socket, relay, socket_id));
    match cookie {
        Ok(value) => {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
        Err(err) => warn!(peer_id = %peer_id, error = %err, "peer id cookie not set"),
    }
    response
}

async fn handle_connection(socket: WebSocket, relay: Relay, peer_id: PeerId) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Arc<str>>();

    if let Err(err) = relay.connect(peer_id.clone(), tx) {
        warn!(peer_id = %peer_id, error = %err, "peer registration failed");
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    }

    let writer_peer = peer_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(Message::Text(text.to_string())).await.is_err() {
                break;
            }
        }
        debug!(peer_id = %writer_peer, "writer task finished");
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                relay.handle_text(&peer_id, &text);
            }
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => {
                    relay.handle_text(&peer_id, text);
                }
                Err(_) => warn!(peer_id = %peer_id, len = bytes.len(), "non UTF-8 binary frame dropped"),
            },
            Ok(Message::Close(frame)) => {
                info!(
                    peer_id = %peer_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(peer_id = %peer_id, error = %err, "error receiving message");
                break;
            }
        }
    }

    relay.disconnect(&peer_id);
    writer.abort();
}
