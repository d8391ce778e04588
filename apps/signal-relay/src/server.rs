use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::RelayConfig;
use crate::handlers::{favicon, health, metrics};
use crate::registry::PeerRegistry;
use crate::relay::Relay;
use crate::websocket::upgrade_handler;

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub cookie_name: Arc<str>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(relay: Relay, cookie_name: &str, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            relay,
            cookie_name: Arc::from(cookie_name),
            metrics,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/favicon.ico", get(favicon))
        .route("/metrics", get(metrics))
        .fallback(upgrade_handler)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(config: RelayConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let registry = PeerRegistry::new();
    let state = AppState::new(Relay::new(registry.clone()), &config.cookie_name, metrics);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("signal-relay listening on {}", config.listen_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(registry.clone()))
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        online = registry.len(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal(registry: PeerRegistry) {
    let _ = signal::ctrl_c().await;
    registry.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::Value;
    use signal_proto::{Envelope, EnvelopeKind, PeerId, PeerInfo, SessionDescription};
    use std::net::SocketAddr;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState::new(Relay::default(), "peer_id", None)
    }

    async fn call(state: &AppState, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn plain(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn health_reports_registry() {
        let state = test_state();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        state.relay.connect(PeerId::from("a"), tx).unwrap();

        let (status, body) = call(&state, plain("/health")).await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["clientsCount"], 1);
        assert!(json["timestamp"].as_str().is_some_and(|ts| ts.ends_with('Z')));

        state.relay.registry().shutdown();
        let (status, body) = call(&state, plain("/health")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "unhealthy");
    }

    #[test_timeout::tokio_timeout_test]
    async fn plain_routes() {
        let state = test_state();
        let (status, body) = call(&state, plain("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, crate::websocket::BANNER.as_bytes());

        assert_eq!(call(&state, plain("/favicon.ico")).await.0, StatusCode::NO_CONTENT);
        assert_eq!(call(&state, plain("/rooms/1")).await.0, StatusCode::NOT_FOUND);
        assert_eq!(call(&state, plain("/metrics")).await.0, StatusCode::NOT_FOUND);
    }

    #[test_timeout::tokio_timeout_test]
    async fn incomplete_upgrade_is_bad_request() {
        let state = test_state();
        let request = Request::builder()
            .uri("/anything")
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "upgrade")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&state, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(state.relay.registry().is_empty());
    }

    async fn spawn_relay() -> (SocketAddr, AppState) {
        let state = test_state();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (addr, state)
    }

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn next_envelope(client: &mut Client) -> Envelope {
        loop {
            match client.next().await.expect("socket open").expect("frame") {
                WsMessage::Text(text) => return Envelope::decode(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    async fn join(addr: SocketAddr, path: &str) -> (Client, PeerInfo) {
        let (mut client, response) = tokio_tungstenite::connect_async(format!("ws://{addr}{path}"))
            .await
            .unwrap();
        let greeting = next_envelope(&mut client).await;
        assert_eq!(greeting.kind(), EnvelopeKind::Welcome);
        let info: PeerInfo = greeting.payload().unwrap();
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|value| value.to_str().ok())
            .unwrap()
            .to_string();
        assert_eq!(cookie, format!("peer_id={}", info.id));
        let announced = next_envelope(&mut client).await;
        assert_eq!(announced.payload::<PeerInfo>().unwrap().id, info.id);
        (client, info)
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn websocket_session_end_to_end() {
        let (addr, state) = spawn_relay().await;

        let (mut a, a_info) = join(addr, "/").await;
        let (mut b, b_info) = join(addr, "/any/path").await;
        assert_eq!(state.relay.registry().len(), 2);

        let announced = next_envelope(&mut a).await;
        assert_eq!(announced.payload::<PeerInfo>().unwrap().id, b_info.id);

        let offer = Envelope::offer(
            b_info.id.clone(),
            a_info.id.clone(),
            &SessionDescription::offer("v=0\r\n"),
        )
        .unwrap()
        .encode()
        .unwrap();
        b.send(WsMessage::Text(offer.clone().into())).await.unwrap();
        match a.next().await.unwrap().unwrap() {
            WsMessage::Text(text) => assert_eq!(text.as_str(), offer),
            other => panic!("unexpected frame {other:?}"),
        }

        b.send(WsMessage::Text("not json".into())).await.unwrap();
        b.close(None).await.unwrap();

        let leave = next_envelope(&mut a).await;
        assert_eq!(leave.kind(), EnvelopeKind::Leave);
        assert_eq!(leave.payload::<PeerInfo>().unwrap().id, b_info.id);
        assert_eq!(state.relay.registry().len(), 1);
    }
}
