//! Wire formats shared by the relay and its peers.
//! Kept free of runtime dependencies so the relay, the peer library and any
//! browser-side port agree on one definition of every message.

pub mod envelope;
pub mod frame;

pub use envelope::{
    CodecError, Envelope, EnvelopeKind, IceCandidate, PeerId, PeerInfo, Recipient, SdpKind,
    SessionDescription, SERVER_SENDER,
};
pub use frame::{expected_chunks, FileMetadata, Frame, CHUNK_SIZE};
