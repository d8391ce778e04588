//! Per-remote session negotiation.

pub mod candidates;
pub mod coordinator;
pub mod identity;
pub mod mock;
pub mod policy;
pub mod provider;
pub mod state;

use signal_proto::{CodecError, PeerId};
use thiserror::Error;

pub use candidates::{CandidateQueue, Exhausted, PendingCandidate, RetryPolicy};
pub use coordinator::{Command, Coordinator, CoordinatorEvent, CoordinatorHandle, PeerEvent};
pub use identity::LocalIdentity;
pub use policy::{AcceptAll, AllowList, OfferDecision, OfferPolicy, RejectAll, ALLOW_ALL};
pub use provider::{
    ChannelProvider, ConnectionState, DataChannel, ProviderError, ProviderEvent, ProviderEvents,
    ProviderFactory,
};
pub use state::{ChannelState, Role, SessionState, StateError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no peer id assigned by the relay yet")]
    NotRegistered,
    #[error("cannot open a session with ourselves")]
    SelfConnect,
    #[error("session with {0} is already active")]
    AlreadyActive(PeerId),
    #[error("no session with {0}")]
    UnknownSession(PeerId),
    #[error("unexpected answer from {remote}: role {role:?}, state {state:?}")]
    UnexpectedAnswer {
        remote: PeerId,
        role: Role,
        state: ChannelState,
    },
    #[error("data channel to {0} is not open")]
    ChannelNotReady(PeerId),
    #[error("coordinator has stopped")]
    Stopped,
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}
