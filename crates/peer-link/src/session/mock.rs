//! In-memory channel provider for exercising the coordinator without a network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use signal_proto::{IceCandidate, PeerId, SessionDescription};

use super::provider::{
    ChannelProvider, DataChannel, ProviderError, ProviderEvent, ProviderEvents, ProviderFactory,
};

#[derive(Default)]
pub struct MockFactory {
    providers: Mutex<Vec<Arc<MockProvider>>>,
    fail_offers: AtomicBool,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Providers created afterwards fail `create_offer`.
    pub fn fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }

    /// Most recent provider created for `remote`.
    pub fn provider_for(&self, remote: &PeerId) -> Option<Arc<MockProvider>> {
        self.providers
            .lock()
            .iter()
            .rev()
            .find(|provider| provider.events.remote() == remote)
            .cloned()
    }

    pub fn created(&self) -> usize {
        self.providers.lock().len()
    }
}

#[async_trait]
impl ProviderFactory for MockFactory {
    async fn create(
        &self,
        events: ProviderEvents,
    ) -> Result<Arc<dyn ChannelProvider>, ProviderError> {
        let provider = Arc::new(MockProvider {
            events,
            fail_offer: self.fail_offers.load(Ordering::SeqCst),
            log: Mutex::new(ProviderLog::default()),
            channels: Mutex::new(Vec::new()),
        });
        self.providers.lock().push(provider.clone());
        Ok(provider)
    }
}

/// Calls observed by a [`MockProvider`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProviderLog {
    pub offers: usize,
    pub answers: usize,
    pub remote_descriptions: Vec<SessionDescription>,
    pub candidates: Vec<IceCandidate>,
    pub closed: bool,
}

pub struct MockProvider {
    events: ProviderEvents,
    fail_offer: bool,
    log: Mutex<ProviderLog>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
}

impl MockProvider {
    pub fn log(&self) -> ProviderLog {
        self.log.lock().clone()
    }

    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    /// Injects an event as if the underlying engine produced it.
    pub fn emit(&self, event: ProviderEvent) -> bool {
        self.events.emit(event)
    }

    pub fn channel(&self, label: &str) -> Option<Arc<MockChannel>> {
        self.channels
            .lock()
            .iter()
            .find(|channel| channel.label == label)
            .cloned()
    }

    pub fn channel_labels(&self) -> Vec<String> {
        self.channels
            .lock()
            .iter()
            .map(|channel| channel.label.clone())
            .collect()
    }
}

#[async_trait]
impl ChannelProvider for MockProvider {
    async fn create_offer(&self) -> Result<SessionDescription, ProviderError> {
        if self.fail_offer {
            return Err(ProviderError::Engine("offer refused by mock".into()));
        }
        let mut log = self.log.lock();
        log.offers += 1;
        Ok(SessionDescription::offer(format!(
            "mock-offer-{}-{}",
            self.events.remote(),
            log.offers
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ProviderError> {
        let mut log = self.log.lock();
        if log.remote_descriptions.is_empty() {
            return Err(ProviderError::NoRemoteDescription);
        }
        log.answers += 1;
        Ok(SessionDescription::answer(format!(
            "mock-answer-{}-{}",
            self.events.remote(),
            log.answers
        )))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ProviderError> {
        self.log.lock().remote_descriptions.push(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ProviderError> {
        let mut log = self.log.lock();
        if log.remote_descriptions.is_empty() {
            return Err(ProviderError::NoRemoteDescription);
        }
        log.candidates.push(candidate);
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, ProviderError> {
        let channel = Arc::new(MockChannel::new(label));
        self.channels.lock().push(channel.clone());
        self.events.emit(ProviderEvent::ChannelOpen {
            label: label.to_string(),
        });
        Ok(channel)
    }

    async fn close(&self) -> Result<(), ProviderError> {
        self.log.lock().closed = true;
        Ok(())
    }
}

/// Data channel that records every message sent through it.
pub struct MockChannel {
    label: String,
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl MockChannel {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DataChannel for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<(), ProviderError> {
        if !self.is_open() {
            return Err(ProviderError::ChannelClosed(self.label.clone()));
        }
        self.sent.lock().push(text);
        Ok(())
    }

    async fn close(&self) -> Result<(), ProviderError> {
        self.set_open(false);
        Ok(())
    }
}
