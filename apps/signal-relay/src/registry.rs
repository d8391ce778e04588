use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use signal_proto::{PeerId, PeerInfo};
use thiserror::Error;
use tokio::sync::mpsc;

/// Outbound queue feeding one connection's socket writer.
pub type PeerSender = mpsc::UnboundedSender<Arc<str>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("peer {0} is already registered")]
    DuplicateId(PeerId),
    #[error("registry is shutting down")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub info: PeerInfo,
    pub joined_at: DateTime<Utc>,
    handle: PeerSender,
}

impl PeerRecord {
    fn deliver(&self, text: Arc<str>) -> bool {
        self.handle.send(text).is_ok()
    }
}

/// Live connections keyed by peer id.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    peers: DashMap<PeerId, PeerRecord>,
    open: AtomicBool,
}

impl Default for RegistryInner {
    fn default() -> Self {
        Self {
            peers: DashMap::new(),
            open: AtomicBool::new(true),
        }
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, info: PeerInfo, handle: PeerSender) -> Result<(), RegistryError> {
        if !self.is_open() {
            return Err(RegistryError::Closed);
        }
        match self.inner.peers.entry(info.id.clone()) {
            Entry::Occupied(entry) => Err(RegistryError::DuplicateId(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(PeerRecord {
                    info,
                    joined_at: Utc::now(),
                    handle,
                });
                Ok(())
            }
        }
    }

    /// Removes `id`; `None` when it was already gone.
    pub fn unregister(&self, id: &PeerId) -> Option<PeerRecord> {
        self.inner.peers.remove(id).map(|(_, record)| record)
    }

    pub fn get(&self, id: &PeerId) -> Option<PeerRecord> {
        self.inner.peers.get(id).map(|entry| entry.value().clone())
    }

    /// Queues `text` for `id`. False when the peer is unknown or its writer has gone.
    pub fn send_to(&self, id: &PeerId, text: Arc<str>) -> bool {
        // Clone the record out so no shard guard outlives the lookup.
        match self.get(id) {
            Some(record) => record.deliver(text),
            None => false,
        }
    }

    /// Queues `text` for every registered peer, returning how many accepted it.
    pub fn broadcast(&self, text: Arc<str>) -> usize {
        let snapshot: Vec<PeerRecord> = self
            .inner
            .peers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        snapshot
            .into_iter()
            .filter(|record| record.deliver(text.clone()))
            .count()
    }

    /// Registered ids other than `id`, sorted.
    pub fn ids_except(&self, id: &PeerId) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .inner
            .peers
            .iter()
            .filter(|entry| entry.key() != id)
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.peers.is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Stops accepting registrations. Existing peers stay until they disconnect.
    pub fn shutdown(&self) {
        self.inner.open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str) -> PeerInfo {
        PeerInfo {
            id: PeerId::from(id),
            username: format!("user-{id}"),
            created_at: 0,
        }
    }

    #[test_timeout::timeout]
    fn register_rejects_duplicates() {
        let registry = PeerRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(info("a"), tx.clone()).unwrap();
        assert_eq!(
            registry.register(info("a"), tx),
            Err(RegistryError::DuplicateId(PeerId::from("a")))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test_timeout::timeout]
    fn unregister_is_idempotent() {
        let registry = PeerRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(info("a"), tx).unwrap();
        let record = registry.unregister(&PeerId::from("a")).expect("record");
        assert_eq!(record.info.username, "user-a");
        assert!(registry.unregister(&PeerId::from("a")).is_none());
        assert!(registry.is_empty());
    }

    #[test_timeout::timeout]
    fn send_to_and_broadcast() {
        let registry = PeerRegistry::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        registry.register(info("a"), a_tx).unwrap();
        registry.register(info("b"), b_tx).unwrap();

        assert!(registry.send_to(&PeerId::from("b"), Arc::from("direct")));
        assert!(!registry.send_to(&PeerId::from("ghost"), Arc::from("lost")));
        assert_eq!(registry.broadcast(Arc::from("everyone")), 2);

        assert_eq!(&*b_rx.try_recv().unwrap(), "direct");
        assert_eq!(&*b_rx.try_recv().unwrap(), "everyone");
        assert_eq!(&*a_rx.try_recv().unwrap(), "everyone");
        assert!(a_rx.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn dropped_writer_is_not_counted() {
        let registry = PeerRegistry::new();
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        registry.register(info("a"), a_tx).unwrap();
        registry.register(info("b"), b_tx).unwrap();
        drop(a_rx);
        assert_eq!(registry.broadcast(Arc::from("x")), 1);
        assert!(!registry.send_to(&PeerId::from("a"), Arc::from("x")));
    }

    #[test_timeout::timeout]
    fn ids_except_is_sorted() {
        let registry = PeerRegistry::new();
        for id in ["c", "a", "b"] {
            let (tx, _rx) = mpsc::unbounded_channel();
            registry.register(info(id), tx).unwrap();
        }
        assert_eq!(
            registry.ids_except(&PeerId::from("b")),
            vec![PeerId::from("a"), PeerId::from("c")]
        );
    }

    #[test_timeout::timeout]
    fn shutdown_refuses_new_peers() {
        let registry = PeerRegistry::new();
        registry.shutdown();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(registry.register(info("a"), tx), Err(RegistryError::Closed));
        assert!(!registry.is_open());
    }
}
