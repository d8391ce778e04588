//! [`ChannelProvider`] backed by the `webrtc` crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use signal_proto::{IceCandidate, SdpKind, SessionDescription};
use tracing::{debug, trace, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::session::{
    ChannelProvider, ConnectionState, DataChannel, ProviderError, ProviderEvent, ProviderEvents,
    ProviderFactory,
};

/// Channel the initiator opens before its offer so the SDP carries a data
/// section. Never used for payloads.
pub const TRIGGER_CHANNEL_LABEL: &str = "temp-triggering-channel";

/// Outbound buffer level above which sends wait for the SCTP queue to drain.
const HIGH_WATER_BYTES: usize = 1024 * 1024;
const DRAIN_POLL: Duration = Duration::from_millis(10);

fn engine(err: webrtc::Error) -> ProviderError {
    ProviderError::Engine(err.to_string())
}

pub struct WebRtcFactory {
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl ProviderFactory for WebRtcFactory {
    async fn create(
        &self,
        events: ProviderEvents,
    ) -> Result<Arc<dyn ChannelProvider>, ProviderError> {
        let api = APIBuilder::new().build();
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(config).await.map_err(engine)?);

        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        events.emit(ProviderEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        warn!(target: "peer_link::rtc", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let state_events = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let events = state_events.clone();
                Box::pin(async move {
                    debug!(target: "peer_link::rtc", remote = %events.remote(), ?state, "peer connection state");
                    let mapped = match state {
                        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                            ConnectionState::New
                        }
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    };
                    events.emit(ProviderEvent::ConnectionState(mapped));
                })
            },
        ));

        let channel_events = events.clone();
        peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let events = channel_events.clone();
            Box::pin(async move {
                debug!(target: "peer_link::rtc", label = channel.label(), "remote data channel");
                let channel = wire_channel(channel, &events);
                events.emit(ProviderEvent::RemoteChannel(channel));
            })
        }));

        Ok(Arc::new(WebRtcProvider {
            peer_connection,
            events,
        }))
    }
}

struct WebRtcProvider {
    peer_connection: Arc<RTCPeerConnection>,
    events: ProviderEvents,
}

#[async_trait]
impl ChannelProvider for WebRtcProvider {
    async fn create_offer(&self) -> Result<SessionDescription, ProviderError> {
        let trigger = self
            .peer_connection
            .create_data_channel(TRIGGER_CHANNEL_LABEL, None)
            .await
            .map_err(engine)?;
        wire_channel(trigger, &self.events);

        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(engine)?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(engine)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ProviderError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(engine)?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(engine)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ProviderError> {
        let remote = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
            SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp),
            SdpKind::Rollback => {
                return Err(ProviderError::UnsupportedDescription("rollback".into()))
            }
        }
        .map_err(engine)?;
        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(engine)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ProviderError> {
        if self.peer_connection.remote_description().await.is_none() {
            return Err(ProviderError::NoRemoteDescription);
        }
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(engine)
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, ProviderError> {
        let channel = self
            .peer_connection
            .create_data_channel(label, None)
            .await
            .map_err(engine)?;
        Ok(wire_channel(channel, &self.events))
    }

    async fn close(&self) -> Result<(), ProviderError> {
        self.peer_connection.close().await.map_err(engine)
    }
}

/// Forwards open/close/message callbacks of `channel` as provider events.
fn wire_channel(channel: Arc<RTCDataChannel>, events: &ProviderEvents) -> Arc<dyn DataChannel> {
    let label = channel.label().to_string();

    let open_events = events.clone();
    let open_label = label.clone();
    channel.on_open(Box::new(move || {
        Box::pin(async move {
            open_events.emit(ProviderEvent::ChannelOpen { label: open_label });
        })
    }));

    let close_events = events.clone();
    let close_label = label.clone();
    channel.on_close(Box::new(move || {
        let events = close_events.clone();
        let label = close_label.clone();
        Box::pin(async move {
            events.emit(ProviderEvent::ChannelClosed { label });
        })
    }));

    let message_events = events.clone();
    let message_label = label.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let events = message_events.clone();
        let label = message_label.clone();
        Box::pin(async move {
            if !message.is_string {
                trace!(target: "peer_link::rtc", %label, len = message.data.len(), "binary message ignored");
                return;
            }
            match String::from_utf8(message.data.to_vec()) {
                Ok(text) => {
                    events.emit(ProviderEvent::Message { label, text });
                }
                Err(_) => warn!(target: "peer_link::rtc", %label, "non UTF-8 text message dropped"),
            }
        })
    }));

    Arc::new(RtcDataChannel {
        inner: channel,
        label,
    })
}

struct RtcDataChannel {
    inner: Arc<RTCDataChannel>,
    label: String,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), ProviderError> {
        if !self.is_open() {
            return Err(ProviderError::ChannelClosed(self.label.clone()));
        }
        while self.inner.buffered_amount().await > HIGH_WATER_BYTES {
            if !self.is_open() {
                return Err(ProviderError::ChannelClosed(self.label.clone()));
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        self.inner.send_text(text).await.map_err(engine)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ProviderError> {
        self.inner.close().await.map_err(engine)
    }
}
