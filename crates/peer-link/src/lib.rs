//! Peer side of the relay: negotiates a direct channel with another peer and
//! moves text and files over it.
//!
//! The [`session::Coordinator`] owns every per-remote session and consumes a
//! single event stream fed by the relay connection ([`signaling`]), the
//! channel provider ([`rtc`] or [`session::mock`]) and the embedding UI.

pub mod config;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod transfer;

pub use config::LinkConfig;
pub use session::{
    Command, Coordinator, CoordinatorEvent, CoordinatorHandle, PeerEvent, SessionError,
};
pub use transfer::{ReceivedFile, TransferError, TransferEvent};
