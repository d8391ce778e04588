use std::borrow::Borrow;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Sender id used on envelopes authored by the relay itself.
pub const SERVER_SENDER: &str = "server";

const RECIPIENT_ALL: &str = "all";
const RECIPIENT_NEW_USER: &str = "new-user";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("envelope is not valid UTF-8")]
    NotUtf8,
    #[error("unexpected payload for {kind}: {source}")]
    Payload {
        kind: EnvelopeKind,
        source: serde_json::Error,
    },
}

/// Opaque identifier the relay hands out for every live connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Addressing of an envelope. Serialized as a bare string on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Recipient {
    /// Fan out to every registered peer, the sender included.
    All,
    /// Synthetic recipient of the greeting a freshly connected peer receives.
    NewUser,
    Peer(PeerId),
}

impl From<String> for Recipient {
    fn from(value: String) -> Self {
        match value.as_str() {
            RECIPIENT_ALL => Recipient::All,
            RECIPIENT_NEW_USER => Recipient::NewUser,
            _ => Recipient::Peer(PeerId(value)),
        }
    }
}

impl From<Recipient> for String {
    fn from(value: Recipient) -> Self {
        match value {
            Recipient::All => RECIPIENT_ALL.to_string(),
            Recipient::NewUser => RECIPIENT_NEW_USER.to_string(),
            Recipient::Peer(id) => id.0,
        }
    }
}

impl From<PeerId> for Recipient {
    fn from(value: PeerId) -> Self {
        Recipient::Peer(value)
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::All => f.write_str(RECIPIENT_ALL),
            Recipient::NewUser => f.write_str(RECIPIENT_NEW_USER),
            Recipient::Peer(id) => f.write_str(id.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    #[serde(rename = "welcome")]
    Welcome,
    #[serde(rename = "leave")]
    Leave,
    #[serde(rename = "offer")]
    Offer,
    #[serde(rename = "answer")]
    Answer,
    #[serde(rename = "ice")]
    IceCandidate,
    #[serde(rename = "file-start")]
    FileStart,
    #[serde(rename = "file-chunk")]
    FileChunk,
    #[serde(rename = "file-end")]
    FileEnd,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Welcome => "welcome",
            EnvelopeKind::Leave => "leave",
            EnvelopeKind::Offer => "offer",
            EnvelopeKind::Answer => "answer",
            EnvelopeKind::IceCandidate => "ice",
            EnvelopeKind::FileStart => "file-start",
            EnvelopeKind::FileChunk => "file-chunk",
            EnvelopeKind::FileEnd => "file-end",
        }
    }

    /// Kinds only the relay may emit; peers sending them are ignored.
    pub fn is_server_authored(self) -> bool {
        matches!(self, EnvelopeKind::Welcome | EnvelopeKind::Leave)
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity block carried by `welcome` and `leave`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    #[serde(default)]
    pub username: String,
    /// Connect time in epoch milliseconds.
    #[serde(rename = "createAt", default)]
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description exchanged in `offer`/`answer` payloads, shaped like the
/// browser's `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate, shaped like the browser's `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// A relay message. Fields are private: an envelope is never mutated after
/// construction, and routing only looks at `kind` and `to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    kind: EnvelopeKind,
    from: PeerId,
    to: Recipient,
    #[serde(default)]
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    clients: Option<Vec<PeerId>>,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, from: PeerId, to: impl Into<Recipient>, data: Value) -> Self {
        Self {
            kind,
            from,
            to: to.into(),
            data,
            clients: None,
        }
    }

    pub fn with_payload<T: Serialize>(
        kind: EnvelopeKind,
        from: PeerId,
        to: impl Into<Recipient>,
        payload: &T,
    ) -> Result<Self, CodecError> {
        let data =
            serde_json::to_value(payload).map_err(|source| CodecError::Payload { kind, source })?;
        Ok(Self::new(kind, from, to, data))
    }

    /// Greeting for a freshly connected peer: its own identity plus the ids
    /// of everyone else online.
    pub fn welcome_new_user(info: &PeerInfo, clients: Vec<PeerId>) -> Result<Self, CodecError> {
        let mut envelope = Self::with_payload(
            EnvelopeKind::Welcome,
            PeerId::from(SERVER_SENDER),
            Recipient::NewUser,
            info,
        )?;
        envelope.clients = Some(clients);
        Ok(envelope)
    }

    pub fn welcome_all(info: &PeerInfo) -> Result<Self, CodecError> {
        Self::with_payload(
            EnvelopeKind::Welcome,
            PeerId::from(SERVER_SENDER),
            Recipient::All,
            info,
        )
    }

    pub fn leave(info: &PeerInfo) -> Result<Self, CodecError> {
        Self::with_payload(
            EnvelopeKind::Leave,
            PeerId::from(SERVER_SENDER),
            Recipient::All,
            info,
        )
    }

    pub fn offer(
        from: PeerId,
        to: PeerId,
        description: &SessionDescription,
    ) -> Result<Self, CodecError> {
        Self::with_payload(EnvelopeKind::Offer, from, to, description)
    }

    pub fn answer(
        from: PeerId,
        to: PeerId,
        description: &SessionDescription,
    ) -> Result<Self, CodecError> {
        Self::with_payload(EnvelopeKind::Answer, from, to, description)
    }

    pub fn ice(from: PeerId, to: PeerId, candidate: &IceCandidate) -> Result<Self, CodecError> {
        Self::with_payload(EnvelopeKind::IceCandidate, from, to, candidate)
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    pub fn from(&self) -> &PeerId {
        &self.from
    }

    pub fn to(&self) -> &Recipient {
        &self.to
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn clients(&self) -> Option<&[PeerId]> {
        self.clients.as_deref()
    }

    /// Decode `data` into a typed payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        T::deserialize(&self.data).map_err(|source| CodecError::Payload {
            kind: self.kind,
            source,
        })
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Binary frames are accepted when they carry UTF-8 JSON.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let text = std::str::from_utf8(bytes).map_err(|_| CodecError::NotUtf8)?;
        Self::decode(text)
    }
}
