use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use signal_proto::{IceCandidate, PeerId, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;

use super::coordinator::CoordinatorEvent;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("channel provider error: {0}")]
    Engine(String),
    #[error("remote description has not been applied")]
    NoRemoteDescription,
    #[error("unsupported session description: {0}")]
    UnsupportedDescription(String),
    #[error("data channel {0} is not open")]
    ChannelClosed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// One point-to-point connection with a single remote peer.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Creates an offer and installs it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, ProviderError>;

    /// Creates an answer to the applied remote offer and installs it locally.
    async fn create_answer(&self) -> Result<SessionDescription, ProviderError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ProviderError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ProviderError>;

    async fn create_data_channel(&self, label: &str)
        -> Result<Arc<dyn DataChannel>, ProviderError>;

    async fn close(&self) -> Result<(), ProviderError>;
}

/// Text message channel riding on a [`ChannelProvider`] connection.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<(), ProviderError>;

    async fn close(&self) -> Result<(), ProviderError>;
}

pub enum ProviderEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    /// The remote side opened a data channel.
    RemoteChannel(Arc<dyn DataChannel>),
    ChannelOpen { label: String },
    ChannelClosed { label: String },
    Message { label: String, text: String },
}

impl fmt::Debug for ProviderEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            ProviderEvent::ConnectionState(state) => {
                f.debug_tuple("ConnectionState").field(state).finish()
            }
            ProviderEvent::RemoteChannel(channel) => {
                f.debug_tuple("RemoteChannel").field(&channel.label()).finish()
            }
            ProviderEvent::ChannelOpen { label } => {
                f.debug_struct("ChannelOpen").field("label", label).finish()
            }
            ProviderEvent::ChannelClosed { label } => {
                f.debug_struct("ChannelClosed").field("label", label).finish()
            }
            ProviderEvent::Message { label, text } => f
                .debug_struct("Message")
                .field("label", label)
                .field("len", &text.len())
                .finish(),
        }
    }
}

/// Sink a provider uses to report asynchronous happenings back to the
/// coordinator, tagged with the session generation it was created for.
#[derive(Clone)]
pub struct ProviderEvents {
    remote: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl ProviderEvents {
    pub(crate) fn new(
        remote: PeerId,
        generation: u64,
        tx: mpsc::UnboundedSender<CoordinatorEvent>,
    ) -> Self {
        Self {
            remote,
            generation,
            tx,
        }
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the coordinator is gone.
    pub fn emit(&self, event: ProviderEvent) -> bool {
        self.tx
            .send(CoordinatorEvent::Provider {
                remote: self.remote.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn create(&self, events: ProviderEvents)
        -> Result<Arc<dyn ChannelProvider>, ProviderError>;
}
