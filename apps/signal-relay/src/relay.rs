//! Presence announcements and envelope routing.
//!
//! The relay never interprets offers, answers, candidates or file frames. It
//! decodes just enough of each envelope to find the recipient and forwards the
//! original text untouched.

use std::sync::Arc;

use chrono::Utc;
use metrics::{counter, gauge};
use rand::seq::SliceRandom;
use rand::Rng;
use signal_proto::{CodecError, Envelope, PeerId, PeerInfo, Recipient};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::registry::{PeerRegistry, PeerSender, RegistryError};

pub const METRIC_CONNECTIONS_TOTAL: &str = "peerdrop_relay_connections_total";
pub const METRIC_DISCONNECTIONS_TOTAL: &str = "peerdrop_relay_disconnections_total";
pub const METRIC_PEERS_ONLINE: &str = "peerdrop_relay_peers_online";
pub const METRIC_FORWARDED_TOTAL: &str = "peerdrop_relay_envelopes_forwarded_total";
pub const METRIC_DROPPED_TOTAL: &str = "peerdrop_relay_envelopes_dropped_total";

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "dusky", "eager", "fuzzy", "gentle", "hazy", "icy", "jolly",
    "keen", "lucky", "misty", "nimble", "odd", "plucky", "quiet", "rusty", "sunny", "tidy",
];
const NOUNS: &[&str] = &[
    "badger", "crane", "dingo", "egret", "ferret", "gecko", "heron", "ibis", "jackal", "koala",
    "lemur", "marten", "newt", "otter", "puffin", "quokka", "raven", "stoat", "tapir", "wombat",
];

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("target peer {0} is not connected")]
    TargetNotFound(PeerId),
    #[error("recipient {0} cannot be addressed by peers")]
    Unroutable(Recipient),
}

impl RouteError {
    fn reason(&self) -> &'static str {
        match self {
            RouteError::TargetNotFound(_) => "target_not_found",
            RouteError::Unroutable(_) => "unroutable",
        }
    }
}

/// Human-friendly display name such as `misty-otter-42`.
pub fn random_username() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("otter");
    format!("{adjective}-{noun}-{}", rng.gen_range(10..100))
}

#[derive(Clone, Default)]
pub struct Relay {
    registry: PeerRegistry,
}

impl Relay {
    pub fn new(registry: PeerRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Registers a new connection, greets it with the current roster and
    /// announces it to everyone.
    pub fn connect(&self, id: PeerId, handle: PeerSender) -> Result<PeerInfo, RelayError> {
        let info = PeerInfo {
            id: id.clone(),
            username: random_username(),
            created_at: Utc::now().timestamp_millis(),
        };
        self.registry.register(info.clone(), handle)?;
        let frames = Envelope::welcome_new_user(&info, self.registry.ids_except(&id))
            .and_then(|greeting| greeting.encode())
            .and_then(|greeting| Ok((greeting, Envelope::welcome_all(&info)?.encode()?)));
        let (greeting, announcement) = match frames {
            Ok(frames) => frames,
            Err(err) => {
                self.registry.unregister(&id);
                return Err(err.into());
            }
        };
        self.registry.send_to(&id, Arc::from(greeting));
        let announced = self.registry.broadcast(Arc::from(announcement));

        counter!(METRIC_CONNECTIONS_TOTAL, 1);
        gauge!(METRIC_PEERS_ONLINE, self.registry.len() as f64);
        info!(
            peer_id = %id,
            username = %info.username,
            announced,
            online = self.registry.len(),
            "peer connected"
        );
        Ok(info)
    }

    /// Removes `id` and tells the remaining peers. Repeated calls are no-ops.
    pub fn disconnect(&self, id: &PeerId) -> bool {
        let Some(record) = self.registry.unregister(id) else {
            return false;
        };
        match Envelope::leave(&record.info).and_then(|leave| leave.encode()) {
            Ok(text) => {
                self.registry.broadcast(Arc::from(text));
            }
            Err(err) => warn!(peer_id = %id, error = %err, "failed to encode leave"),
        }
        counter!(METRIC_DISCONNECTIONS_TOTAL, 1);
        gauge!(METRIC_PEERS_ONLINE, self.registry.len() as f64);
        info!(
            peer_id = %id,
            connected_for_secs = (Utc::now() - record.joined_at).num_seconds(),
            online = self.registry.len(),
            "peer disconnected"
        );
        true
    }

    /// Routes one text frame received from `from`. Returns how many peers it
    /// was delivered to; anything undeliverable is logged and dropped.
    pub fn handle_text(&self, from: &PeerId, raw: &str) -> usize {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(peer_id = %from, error = %err, "malformed envelope dropped");
                counter!(METRIC_DROPPED_TOTAL, 1, "reason" => "malformed");
                return 0;
            }
        };
        if envelope.kind().is_server_authored() {
            warn!(peer_id = %from, kind = %envelope.kind(), "peer sent a relay-only envelope");
            counter!(METRIC_DROPPED_TOTAL, 1, "reason" => "server_kind");
            return 0;
        }
        if envelope.from() != from {
            debug!(peer_id = %from, claimed = %envelope.from(), "sender field differs from connection");
        }

        match self.route(&envelope, Arc::from(raw)) {
            Ok(delivered) => {
                counter!(
                    METRIC_FORWARDED_TOTAL,
                    delivered as u64,
                    "kind" => envelope.kind().as_str()
                );
                delivered
            }
            Err(err) => {
                warn!(peer_id = %from, kind = %envelope.kind(), error = %err, "envelope dropped");
                counter!(METRIC_DROPPED_TOTAL, 1, "reason" => err.reason());
                0
            }
        }
    }

    pub fn route(&self, envelope: &Envelope, raw: Arc<str>) -> Result<usize, RouteError> {
        match envelope.to() {
            Recipient::All => Ok(self.registry.broadcast(raw)),
            Recipient::Peer(target) => {
                if self.registry.send_to(target, raw) {
                    Ok(1)
                } else {
                    Err(RouteError::TargetNotFound(target.clone()))
                }
            }
            other @ Recipient::NewUser => Err(RouteError::Unroutable(other.clone())),
        }
    }
}
