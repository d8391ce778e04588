use std::collections::BTreeSet;

use signal_proto::{PeerId, PeerInfo};
use tracing::{debug, info};

use super::SessionError;

/// Who we are according to the relay, and who else is online.
#[derive(Debug, Default)]
pub struct LocalIdentity {
    info: Option<PeerInfo>,
    peers: BTreeSet<PeerId>,
}

impl LocalIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&self) -> Option<&PeerInfo> {
        self.info.as_ref()
    }

    pub fn id(&self) -> Option<&PeerId> {
        self.info.as_ref().map(|info| &info.id)
    }

    pub fn require_id(&self) -> Result<&PeerId, SessionError> {
        self.id().ok_or(SessionError::NotRegistered)
    }

    pub fn is_local(&self, id: &PeerId) -> bool {
        self.id() == Some(id)
    }

    pub fn set_local(&mut self, info: PeerInfo) {
        info!(target: "peer_link::identity", id = %info.id, "assigned peer id");
        self.peers.remove(&info.id);
        self.info = Some(info);
    }

    /// Replaces the known peer set, skipping our own id.
    pub fn set_peers<I>(&mut self, peers: I)
    where
        I: IntoIterator<Item = PeerId>,
    {
        let own = self.id().cloned();
        self.peers = peers
            .into_iter()
            .filter(|peer| Some(peer) != own.as_ref())
            .collect();
        debug!(target: "peer_link::identity", count = self.peers.len(), "peer list replaced");
    }

    pub fn add_peer(&mut self, peer: PeerId) -> bool {
        if self.is_local(&peer) {
            return false;
        }
        let added = self.peers.insert(peer);
        debug!(target: "peer_link::identity", count = self.peers.len(), added, "peer joined");
        added
    }

    pub fn remove_peer(&mut self, peer: &PeerId) -> bool {
        let removed = self.peers.remove(peer);
        debug!(target: "peer_link::identity", count = self.peers.len(), removed, "peer left");
        removed
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.iter()
    }

    pub fn knows(&self, peer: &PeerId) -> bool {
        self.peers.contains(peer)
    }
}
