use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use signal_proto::{
    Envelope, EnvelopeKind, FileMetadata, IceCandidate, PeerId, PeerInfo, Recipient,
    SessionDescription,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::candidates::{CandidateQueue, RetryPolicy};
use super::identity::LocalIdentity;
use super::policy::{OfferDecision, OfferPolicy};
use super::provider::{
    ChannelProvider, ConnectionState, DataChannel, ProviderEvent, ProviderEvents, ProviderFactory,
};
use super::state::{ChannelState, Role, SessionState};
use super::SessionError;
use crate::config::LinkConfig;
use crate::transfer::{self, AbortReason, Reassembler, TransferEvent};

/// Everything the coordinator reacts to, on one serialized stream.
pub enum CoordinatorEvent {
    Relay(Envelope),
    Provider {
        remote: PeerId,
        generation: u64,
        event: ProviderEvent,
    },
    Command(Command),
}

#[derive(Debug, Clone)]
pub enum Command {
    Connect {
        to: PeerId,
    },
    SendText {
        to: PeerId,
        text: String,
    },
    SendFile {
        to: PeerId,
        metadata: FileMetadata,
        payload: Bytes,
    },
    Close {
        to: PeerId,
    },
    Shutdown,
}

/// Notifications for the embedding UI.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Registered {
        info: PeerInfo,
        peers: Vec<PeerId>,
    },
    PeerJoined(PeerInfo),
    PeerLeft(PeerInfo),
    OfferRejected {
        from: PeerId,
    },
    SessionState {
        remote: PeerId,
        state: ChannelState,
    },
    ChannelReady {
        remote: PeerId,
        label: String,
    },
    Transfer {
        from: PeerId,
        event: TransferEvent,
    },
    TextSent {
        to: PeerId,
    },
    FileSent {
        to: PeerId,
        name: String,
    },
    SendFailed {
        to: PeerId,
        error: String,
    },
    CandidateFailed {
        remote: PeerId,
        candidate: IceCandidate,
    },
}

/// Cloneable sender into a running [`Coordinator`].
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl CoordinatorHandle {
    pub fn send(&self, event: CoordinatorEvent) -> Result<(), SessionError> {
        self.tx.send(event).map_err(|_| SessionError::Stopped)
    }

    pub fn relay(&self, envelope: Envelope) -> Result<(), SessionError> {
        self.send(CoordinatorEvent::Relay(envelope))
    }

    pub fn command(&self, command: Command) -> Result<(), SessionError> {
        self.send(CoordinatorEvent::Command(command))
    }

    pub fn connect(&self, to: PeerId) -> Result<(), SessionError> {
        self.command(Command::Connect { to })
    }

    pub fn send_text(&self, to: PeerId, text: String) -> Result<(), SessionError> {
        self.command(Command::SendText { to, text })
    }

    pub fn send_file(
        &self,
        to: PeerId,
        metadata: FileMetadata,
        payload: Bytes,
    ) -> Result<(), SessionError> {
        self.command(Command::SendFile {
            to,
            metadata,
            payload,
        })
    }

    pub fn close(&self, to: PeerId) -> Result<(), SessionError> {
        self.command(Command::Close { to })
    }

    pub fn shutdown(&self) -> Result<(), SessionError> {
        self.command(Command::Shutdown)
    }
}

struct Session {
    state: SessionState,
    generation: u64,
    provider: Arc<dyn ChannelProvider>,
    candidates: CandidateQueue,
    remote_applied: bool,
    description_sent: bool,
    held_local: Vec<IceCandidate>,
    channel: Option<Arc<dyn DataChannel>>,
    reassembler: Reassembler,
}

/// Drives negotiation with every remote peer.
///
/// The coordinator never shares its sessions; relay envelopes, provider
/// callbacks and UI commands all arrive through [`CoordinatorEvent`] and are
/// handled one at a time, with the candidate retry deadline folded into the
/// same loop.
pub struct Coordinator {
    identity: LocalIdentity,
    sessions: HashMap<PeerId, Session>,
    factory: Arc<dyn ProviderFactory>,
    policy: Arc<dyn OfferPolicy>,
    retry: RetryPolicy,
    max_file_bytes: u64,
    relay: mpsc::UnboundedSender<Envelope>,
    events_tx: mpsc::UnboundedSender<CoordinatorEvent>,
    inbox: mpsc::UnboundedReceiver<CoordinatorEvent>,
    ui: mpsc::UnboundedSender<PeerEvent>,
    next_generation: u64,
}

impl Coordinator {
    /// `relay` receives every envelope to be written to the relay socket.
    pub fn new(
        config: &LinkConfig,
        factory: Arc<dyn ProviderFactory>,
        policy: Arc<dyn OfferPolicy>,
        relay: mpsc::UnboundedSender<Envelope>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events_tx, inbox) = mpsc::unbounded_channel();
        let (ui, ui_rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            identity: LocalIdentity::new(),
            sessions: HashMap::new(),
            factory,
            policy,
            retry: config.retry,
            max_file_bytes: config.max_file_bytes,
            relay,
            events_tx,
            inbox,
            ui,
            next_generation: 0,
        };
        (coordinator, ui_rx)
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            tx: self.events_tx.clone(),
        }
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn session_state(&self, remote: &PeerId) -> Option<&SessionState> {
        self.sessions.get(remote).map(|session| &session.state)
    }

    pub async fn run(mut self) {
        loop {
            let deadline = self.next_deadline();
            let event = tokio::select! {
                event = self.inbox.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = wait_until(deadline) => {
                    self.poll_candidates(Instant::now()).await;
                    continue;
                }
            };
            if matches!(event, CoordinatorEvent::Command(Command::Shutdown)) {
                self.close_all().await;
                info!(target: "peer_link::session", "coordinator stopped");
                break;
            }
            if let Err(err) = self.dispatch(event).await {
                warn!(target: "peer_link::session", error = %err, "event handling failed");
            }
        }
    }

    pub async fn dispatch(&mut self, event: CoordinatorEvent) -> Result<(), SessionError> {
        match event {
            CoordinatorEvent::Relay(envelope) => self.handle_envelope(envelope).await,
            CoordinatorEvent::Provider {
                remote,
                generation,
                event,
            } => self.handle_provider_event(remote, generation, event).await,
            CoordinatorEvent::Command(command) => self.handle_command(command).await,
        }
    }

    /// Earliest instant a parked candidate is due for another attempt.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter_map(|session| session.candidates.next_due())
            .min()
    }

    /// Retries every parked candidate due at `now`.
    pub async fn poll_candidates(&mut self, now: Instant) {
        let mut exhausted = Vec::new();
        for (remote, session) in self.sessions.iter_mut() {
            for pending in session.candidates.take_due(now) {
                if session.remote_applied {
                    apply_candidate(remote, session.provider.as_ref(), pending.candidate).await;
                    continue;
                }
                if let Err(spent) = session.candidates.requeue(pending, now) {
                    warn!(
                        target: "peer_link::session",
                        %remote,
                        attempts = spent.attempts,
                        "candidate retries exhausted"
                    );
                    exhausted.push((remote.clone(), spent.candidate));
                }
            }
        }
        for (remote, candidate) in exhausted {
            self.emit(PeerEvent::CandidateFailed { remote, candidate });
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) -> Result<(), SessionError> {
        match envelope.kind() {
            EnvelopeKind::Welcome => self.handle_welcome(&envelope),
            EnvelopeKind::Leave => self.handle_leave(&envelope).await,
            EnvelopeKind::Offer => {
                let description: SessionDescription = envelope.payload()?;
                self.handle_offer(envelope.from().clone(), description).await
            }
            EnvelopeKind::Answer => {
                let description: SessionDescription = envelope.payload()?;
                self.handle_answer(envelope.from().clone(), description).await
            }
            EnvelopeKind::IceCandidate => {
                let candidate: IceCandidate = envelope.payload()?;
                self.handle_candidate(envelope.from().clone(), candidate)
                    .await
            }
            kind @ (EnvelopeKind::FileStart | EnvelopeKind::FileChunk | EnvelopeKind::FileEnd) => {
                warn!(
                    target: "peer_link::session",
                    from = %envelope.from(),
                    %kind,
                    "transfer frame over the relay ignored"
                );
                Ok(())
            }
        }
    }

    fn handle_welcome(&mut self, envelope: &Envelope) -> Result<(), SessionError> {
        let info: PeerInfo = envelope.payload()?;
        match envelope.to() {
            Recipient::NewUser => {
                self.identity.set_local(info.clone());
                self.identity
                    .set_peers(envelope.clients().unwrap_or_default().iter().cloned());
                let peers = self.identity.peers().cloned().collect();
                self.emit(PeerEvent::Registered { info, peers });
            }
            _ => {
                if self.identity.is_local(&info.id) {
                    return Ok(());
                }
                if self.identity.add_peer(info.id.clone()) {
                    self.emit(PeerEvent::PeerJoined(info));
                }
            }
        }
        Ok(())
    }

    async fn handle_leave(&mut self, envelope: &Envelope) -> Result<(), SessionError> {
        let info: PeerInfo = envelope.payload()?;
        self.identity.remove_peer(&info.id);
        if self.sessions.contains_key(&info.id) {
            info!(target: "peer_link::session", remote = %info.id, "remote left; closing session");
            self.teardown(&info.id, ChannelState::Closed, AbortReason::ChannelClosed)
                .await;
        }
        self.emit(PeerEvent::PeerLeft(info));
        Ok(())
    }

    /// Starts a session as initiator and sends the offer.
    pub async fn initiate(&mut self, remote: PeerId) -> Result<(), SessionError> {
        let local = self.identity.require_id()?.clone();
        if remote == local {
            return Err(SessionError::SelfConnect);
        }
        if self.sessions.contains_key(&remote) {
            return Err(SessionError::AlreadyActive(remote));
        }

        let mut session = self.open_session(&remote).await?;
        session.state.assign_role(Role::Initiator)?;
        let offer = match session.provider.create_offer().await {
            Ok(offer) => offer,
            Err(err) => {
                self.abandon(&remote, session, ChannelState::Failed).await;
                return Err(err.into());
            }
        };
        session.state.transition(ChannelState::OfferSent)?;
        self.send_relay(Envelope::offer(local, remote.clone(), &offer)?);
        self.mark_description_sent(&remote, &mut session)?;
        info!(target: "peer_link::session", %remote, "offer sent");
        self.sessions.insert(remote.clone(), session);
        self.emit(PeerEvent::SessionState {
            remote,
            state: ChannelState::OfferSent,
        });
        Ok(())
    }

    /// Consults the offer policy, resolves glare and answers accepted offers.
    pub async fn handle_offer(
        &mut self,
        from: PeerId,
        description: SessionDescription,
    ) -> Result<(), SessionError> {
        let local = self.identity.require_id()?.clone();
        if from == local {
            return Ok(());
        }
        if self.policy.evaluate(&from) == OfferDecision::Reject {
            info!(target: "peer_link::session", %from, "offer rejected by policy");
            self.emit(PeerEvent::OfferRejected { from });
            return Ok(());
        }

        if let Some(existing) = self.sessions.get(&from) {
            let glare = existing.state.role() == Role::Initiator
                && existing.state.channel_state() == ChannelState::OfferSent;
            if glare && local < from {
                debug!(target: "peer_link::session", %from, "glare: keeping initiator role");
                return Ok(());
            }
            debug!(
                target: "peer_link::session",
                %from,
                glare,
                "replacing existing session for incoming offer"
            );
            self.teardown(&from, ChannelState::Closed, AbortReason::Superseded)
                .await;
        }

        let mut session = self.open_session(&from).await?;
        session.state.assign_role(Role::Responder)?;
        session.state.transition(ChannelState::OfferReceived)?;
        if let Err(err) = session.provider.set_remote_description(description).await {
            self.abandon(&from, session, ChannelState::Failed).await;
            return Err(err.into());
        }
        session.remote_applied = true;
        let answer = match session.provider.create_answer().await {
            Ok(answer) => answer,
            Err(err) => {
                self.abandon(&from, session, ChannelState::Failed).await;
                return Err(err.into());
            }
        };
        session.state.transition(ChannelState::Answered)?;
        self.send_relay(Envelope::answer(local, from.clone(), &answer)?);
        self.mark_description_sent(&from, &mut session)?;
        info!(target: "peer_link::session", %from, "answer sent");
        self.sessions.insert(from.clone(), session);
        self.emit(PeerEvent::SessionState {
            remote: from,
            state: ChannelState::Answered,
        });
        Ok(())
    }

    pub async fn handle_answer(
        &mut self,
        from: PeerId,
        description: SessionDescription,
    ) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(&from)
            .ok_or_else(|| SessionError::UnknownSession(from.clone()))?;
        let role = session.state.role();
        let state = session.state.channel_state();
        if role != Role::Initiator || state != ChannelState::OfferSent {
            return Err(SessionError::UnexpectedAnswer {
                remote: from,
                role,
                state,
            });
        }
        let provider = session.provider.clone();
        if let Err(err) = provider.set_remote_description(description).await {
            self.teardown(&from, ChannelState::Failed, AbortReason::ChannelClosed)
                .await;
            return Err(err.into());
        }

        let Some(session) = self.sessions.get_mut(&from) else {
            return Ok(());
        };
        session.state.transition(ChannelState::Answered)?;
        session.remote_applied = true;
        let parked = session.candidates.drain();
        if !parked.is_empty() {
            debug!(target: "peer_link::session", %from, count = parked.len(), "flushing parked candidates");
        }
        for candidate in parked {
            apply_candidate(&from, provider.as_ref(), candidate).await;
        }
        self.emit(PeerEvent::SessionState {
            remote: from,
            state: ChannelState::Answered,
        });
        Ok(())
    }

    pub async fn handle_candidate(
        &mut self,
        from: PeerId,
        candidate: IceCandidate,
    ) -> Result<(), SessionError> {
        let Some(session) = self.sessions.get_mut(&from) else {
            warn!(target: "peer_link::session", %from, "candidate for unknown session dropped");
            return Ok(());
        };
        if session.remote_applied {
            apply_candidate(&from, session.provider.as_ref(), candidate).await;
            return Ok(());
        }
        if let Err(spent) = session.candidates.defer(candidate, Instant::now()) {
            warn!(target: "peer_link::session", %from, "candidate retries exhausted");
            self.emit(PeerEvent::CandidateFailed {
                remote: from,
                candidate: spent.candidate,
            });
        } else {
            debug!(target: "peer_link::session", %from, "candidate parked until remote description");
        }
        Ok(())
    }

    async fn handle_provider_event(
        &mut self,
        remote: PeerId,
        generation: u64,
        event: ProviderEvent,
    ) -> Result<(), SessionError> {
        let Some(session) = self.sessions.get_mut(&remote) else {
            debug!(target: "peer_link::session", %remote, ?event, "event for closed session ignored");
            return Ok(());
        };
        if session.generation != generation {
            debug!(
                target: "peer_link::session",
                %remote,
                generation,
                current = session.generation,
                "stale provider event ignored"
            );
            return Ok(());
        }

        match event {
            ProviderEvent::LocalCandidate(candidate) => {
                if session.description_sent {
                    let local = self.identity.require_id()?.clone();
                    self.send_relay(Envelope::ice(local, remote, &candidate)?);
                } else {
                    session.held_local.push(candidate);
                }
            }
            ProviderEvent::ConnectionState(state) => {
                debug!(target: "peer_link::session", %remote, ?state, "connection state");
                match state {
                    ConnectionState::Connected => self.on_connected(&remote).await?,
                    ConnectionState::Failed | ConnectionState::Disconnected => {
                        self.teardown(&remote, ChannelState::Failed, AbortReason::ChannelClosed)
                            .await
                    }
                    ConnectionState::Closed => {
                        self.teardown(&remote, ChannelState::Closed, AbortReason::ChannelClosed)
                            .await
                    }
                    ConnectionState::New | ConnectionState::Connecting => {}
                }
            }
            ProviderEvent::RemoteChannel(channel) => {
                if session.state.role() != Role::Responder {
                    debug!(
                        target: "peer_link::session",
                        %remote,
                        label = channel.label(),
                        "remote channel ignored by initiator"
                    );
                    return Ok(());
                }
                let label = channel.label().to_string();
                let open = channel.is_open();
                session.channel = Some(channel);
                debug!(target: "peer_link::session", %remote, %label, "adopted remote channel");
                if open {
                    self.emit(PeerEvent::ChannelReady { remote, label });
                }
            }
            ProviderEvent::ChannelOpen { label } => {
                let current = session
                    .channel
                    .as_ref()
                    .is_some_and(|channel| channel.label() == label);
                if current {
                    self.emit(PeerEvent::ChannelReady { remote, label });
                }
            }
            ProviderEvent::ChannelClosed { label } => {
                let current = session
                    .channel
                    .as_ref()
                    .is_some_and(|channel| channel.label() == label);
                if current {
                    session.channel = None;
                    if let Some(aborted) = session.reassembler.abort(AbortReason::ChannelClosed) {
                        self.emit(PeerEvent::Transfer {
                            from: remote,
                            event: aborted,
                        });
                    }
                }
            }
            ProviderEvent::Message { label, text } => {
                let events = session.reassembler.handle_message(&text);
                debug!(target: "peer_link::session", %remote, %label, events = events.len(), "channel message");
                for event in events {
                    self.emit(PeerEvent::Transfer {
                        from: remote.clone(),
                        event,
                    });
                }
            }
        }
        Ok(())
    }

    async fn on_connected(&mut self, remote: &PeerId) -> Result<(), SessionError> {
        let local = self.identity.require_id()?.clone();
        let Some(session) = self.sessions.get_mut(remote) else {
            return Ok(());
        };
        session.state.transition(ChannelState::Connected)?;
        let role = session.state.role();
        info!(target: "peer_link::session", %remote, ?role, "connected");
        let previous = match role {
            Role::Initiator => session.channel.take(),
            _ => None,
        };
        let provider = session.provider.clone();
        self.emit(PeerEvent::SessionState {
            remote: remote.clone(),
            state: ChannelState::Connected,
        });
        if role != Role::Initiator {
            return Ok(());
        }

        if let Some(old) = previous {
            if let Err(err) = old.close().await {
                debug!(target: "peer_link::session", %remote, error = %err, "closing previous channel failed");
            }
        }
        let label = format!("{local}<->{remote}");
        match provider.create_data_channel(&label).await {
            Ok(channel) => {
                if let Some(session) = self.sessions.get_mut(remote) {
                    session.channel = Some(channel);
                }
                Ok(())
            }
            Err(err) => {
                self.teardown(remote, ChannelState::Failed, AbortReason::ChannelClosed)
                    .await;
                Err(err.into())
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), SessionError> {
        match command {
            Command::Connect { to } => self.initiate(to).await,
            Command::SendText { to, text } => {
                let channel = self.open_channel(&to)?;
                let ui = self.ui.clone();
                tokio::spawn(async move {
                    let event = match transfer::send_text(channel.as_ref(), text).await {
                        Ok(()) => PeerEvent::TextSent { to },
                        Err(err) => PeerEvent::SendFailed {
                            to,
                            error: err.to_string(),
                        },
                    };
                    let _ = ui.send(event);
                });
                Ok(())
            }
            Command::SendFile {
                to,
                metadata,
                payload,
            } => {
                let channel = self.open_channel(&to)?;
                let ui = self.ui.clone();
                tokio::spawn(async move {
                    let event =
                        match transfer::send_file(channel.as_ref(), &metadata, payload).await {
                            Ok(()) => PeerEvent::FileSent {
                                to,
                                name: metadata.name,
                            },
                            Err(err) => PeerEvent::SendFailed {
                                to,
                                error: err.to_string(),
                            },
                        };
                    let _ = ui.send(event);
                });
                Ok(())
            }
            Command::Close { to } => {
                if !self.sessions.contains_key(&to) {
                    return Err(SessionError::UnknownSession(to));
                }
                self.teardown(&to, ChannelState::Closed, AbortReason::ChannelClosed)
                    .await;
                Ok(())
            }
            Command::Shutdown => {
                self.close_all().await;
                Ok(())
            }
        }
    }

    fn open_channel(&self, to: &PeerId) -> Result<Arc<dyn DataChannel>, SessionError> {
        self.sessions
            .get(to)
            .and_then(|session| session.channel.clone())
            .filter(|channel| channel.is_open())
            .ok_or_else(|| SessionError::ChannelNotReady(to.clone()))
    }

    async fn open_session(&mut self, remote: &PeerId) -> Result<Session, SessionError> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let events = ProviderEvents::new(remote.clone(), generation, self.events_tx.clone());
        let provider = self.factory.create(events).await?;
        Ok(Session {
            state: SessionState::new(remote.clone()),
            generation,
            provider,
            candidates: CandidateQueue::new(self.retry),
            remote_applied: false,
            description_sent: false,
            held_local: Vec::new(),
            channel: None,
            reassembler: Reassembler::new(self.max_file_bytes),
        })
    }

    /// Records that the offer/answer left, then releases candidates the
    /// provider produced before it did.
    fn mark_description_sent(
        &self,
        remote: &PeerId,
        session: &mut Session,
    ) -> Result<(), SessionError> {
        session.description_sent = true;
        let local = self.identity.require_id()?;
        for candidate in session.held_local.drain(..) {
            self.send_relay(Envelope::ice(local.clone(), remote.clone(), &candidate)?);
        }
        Ok(())
    }

    /// Ends a session that never made it into the session map.
    async fn abandon(&mut self, remote: &PeerId, mut session: Session, state: ChannelState) {
        let _ = session.state.transition(state);
        if let Err(err) = session.provider.close().await {
            debug!(target: "peer_link::session", %remote, error = %err, "provider close failed");
        }
        self.emit(PeerEvent::SessionState {
            remote: remote.clone(),
            state,
        });
    }

    async fn teardown(&mut self, remote: &PeerId, state: ChannelState, reason: AbortReason) {
        let Some(mut session) = self.sessions.remove(remote) else {
            return;
        };
        if let Err(err) = session.state.transition(state) {
            debug!(target: "peer_link::session", %remote, error = %err, "teardown of finished session");
        }
        session.candidates.clear();
        if let Some(aborted) = session.reassembler.abort(reason) {
            self.emit(PeerEvent::Transfer {
                from: remote.clone(),
                event: aborted,
            });
        }
        if let Some(channel) = session.channel.take() {
            let _ = channel.close().await;
        }
        if let Err(err) = session.provider.close().await {
            debug!(target: "peer_link::session", %remote, error = %err, "provider close failed");
        }
        info!(target: "peer_link::session", %remote, ?state, "session ended");
        self.emit(PeerEvent::SessionState {
            remote: remote.clone(),
            state,
        });
    }

    async fn close_all(&mut self) {
        let remotes: Vec<PeerId> = self.sessions.keys().cloned().collect();
        for remote in remotes {
            self.teardown(&remote, ChannelState::Closed, AbortReason::ChannelClosed)
                .await;
        }
    }

    fn send_relay(&self, envelope: Envelope) {
        if self.relay.send(envelope).is_err() {
            warn!(target: "peer_link::session", "relay connection gone; envelope dropped");
        }
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.ui.send(event);
    }
}

async fn apply_candidate(remote: &PeerId, provider: &dyn ChannelProvider, candidate: IceCandidate) {
    if let Err(err) = provider.add_ice_candidate(candidate).await {
        warn!(target: "peer_link::session", %remote, error = %err, "failed to apply candidate");
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mock::{MockChannel, MockFactory, MockProvider};
    use crate::session::policy::{AcceptAll, RejectAll};
    use crate::transfer::{split_payload, ReceivedFile};
    use signal_proto::Frame;
    use std::time::Duration;

    fn info(id: &str) -> PeerInfo {
        PeerInfo {
            id: PeerId::from(id),
            username: format!("user-{id}"),
            created_at: 1_700_000_000_000,
        }
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    struct Harness {
        coordinator: Coordinator,
        factory: Arc<MockFactory>,
        relay_rx: mpsc::UnboundedReceiver<Envelope>,
        ui_rx: mpsc::UnboundedReceiver<PeerEvent>,
    }

    impl Harness {
        async fn new(local: &str, policy: Arc<dyn OfferPolicy>) -> Self {
            let factory = MockFactory::new();
            let (relay_tx, relay_rx) = mpsc::unbounded_channel();
            let (coordinator, ui_rx) =
                Coordinator::new(&LinkConfig::default(), factory.clone(), policy, relay_tx);
            let mut harness = Self {
                coordinator,
                factory,
                relay_rx,
                ui_rx,
            };
            harness
                .relay(Envelope::welcome_new_user(&info(local), vec![]).unwrap())
                .await
                .expect("welcome");
            harness.ui_events();
            harness
        }

        async fn relay(&mut self, envelope: Envelope) -> Result<(), SessionError> {
            self.coordinator
                .dispatch(CoordinatorEvent::Relay(envelope))
                .await
        }

        async fn command(&mut self, command: Command) -> Result<(), SessionError> {
            self.coordinator
                .dispatch(CoordinatorEvent::Command(command))
                .await
        }

        /// Dispatches everything providers have queued so far.
        async fn pump(&mut self) {
            while let Ok(event) = self.coordinator.inbox.try_recv() {
                let _ = self.coordinator.dispatch(event).await;
            }
        }

        fn relayed(&mut self) -> Vec<Envelope> {
            let mut out = Vec::new();
            while let Ok(envelope) = self.relay_rx.try_recv() {
                out.push(envelope);
            }
            out
        }

        fn ui_events(&mut self) -> Vec<PeerEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.ui_rx.try_recv() {
                out.push(event);
            }
            out
        }

        fn provider(&self, remote: &str) -> Arc<MockProvider> {
            self.factory
                .provider_for(&PeerId::from(remote))
                .expect("provider created")
        }

        fn state(&self, remote: &str) -> Option<(Role, ChannelState)> {
            self.coordinator
                .session_state(&PeerId::from(remote))
                .map(|state| (state.role(), state.channel_state()))
        }

        /// Drives an initiator session with `remote` up to Connected.
        async fn connect_as_initiator(&mut self, remote: &str) {
            let local = self.coordinator.identity().id().cloned().unwrap();
            self.command(Command::Connect {
                to: PeerId::from(remote),
            })
            .await
            .expect("connect");
            self.relay(
                Envelope::answer(
                    PeerId::from(remote),
                    local,
                    &SessionDescription::answer("remote-answer"),
                )
                .unwrap(),
            )
            .await
            .expect("answer");
            self.provider(remote)
                .emit(ProviderEvent::ConnectionState(ConnectionState::Connected));
            self.pump().await;
        }

        /// Drives a responder session with `remote` up to Connected with the
        /// remote-created channel adopted.
        async fn connect_as_responder(&mut self, remote: &str) -> Arc<MockChannel> {
            let local = self.coordinator.identity().id().cloned().unwrap();
            self.relay(
                Envelope::offer(
                    PeerId::from(remote),
                    local.clone(),
                    &SessionDescription::offer("remote-offer"),
                )
                .unwrap(),
            )
            .await
            .expect("offer");
            let provider = self.provider(remote);
            provider.emit(ProviderEvent::ConnectionState(ConnectionState::Connected));
            let channel = Arc::new(MockChannel::new(format!("{remote}<->{local}")));
            provider.emit(ProviderEvent::RemoteChannel(channel.clone()));
            self.pump().await;
            channel
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn welcome_sets_identity_and_tracks_peers() {
        let mut h = Harness::new("a", Arc::new(AcceptAll)).await;
        h.relay(Envelope::welcome_new_user(&info("a"), vec![PeerId::from("b")]).unwrap())
            .await
            .unwrap();
        h.relay(Envelope::welcome_all(&info("a")).unwrap())
            .await
            .unwrap();
        h.relay(Envelope::welcome_all(&info("c")).unwrap())
            .await
            .unwrap();
        assert_eq!(
            h.ui_events(),
            vec![
                PeerEvent::Registered {
                    info: info("a"),
                    peers: vec![PeerId::from("b")],
                },
                PeerEvent::PeerJoined(info("c")),
            ]
        );
        assert!(h.coordinator.identity().knows(&PeerId::from("c")));
    }

    #[test_timeout::tokio_timeout_test]
    async fn initiator_sends_offer_before_candidates() {
        let mut h = Harness::new("a", Arc::new(AcceptAll)).await;
        h.command(Command::Connect {
            to: PeerId::from("b"),
        })
        .await
        .unwrap();
        assert_eq!(h.state("b"), Some((Role::Initiator, ChannelState::OfferSent)));

        h.provider("b")
            .emit(ProviderEvent::LocalCandidate(candidate(1)));
        h.pump().await;

        let relayed = h.relayed();
        assert_eq!(relayed.len(), 2);
        assert_eq!(relayed[0].kind(), EnvelopeKind::Offer);
        assert_eq!(relayed[0].from(), &PeerId::from("a"));
        assert_eq!(relayed[0].to(), &Recipient::Peer(PeerId::from("b")));
        assert_eq!(relayed[1].kind(), EnvelopeKind::IceCandidate);
        assert_eq!(relayed[1].payload::<IceCandidate>().unwrap(), candidate(1));
    }

    #[test_timeout::tokio_timeout_test]
    async fn connect_requires_registration_and_rejects_self() {
        let factory = MockFactory::new();
        let (relay_tx, _relay_rx) = mpsc::unbounded_channel();
        let (mut coordinator, _ui) = Coordinator::new(
            &LinkConfig::default(),
            factory.clone(),
            Arc::new(AcceptAll),
            relay_tx,
        );
        assert!(matches!(
            coordinator.initiate(PeerId::from("b")).await,
            Err(SessionError::NotRegistered)
        ));

        let mut h = Harness::new("a", Arc::new(AcceptAll)).await;
        assert!(matches!(
            h.coordinator.initiate(PeerId::from("a")).await,
            Err(SessionError::SelfConnect)
        ));
        h.coordinator.initiate(PeerId::from("b")).await.unwrap();
        assert!(matches!(
            h.coordinator.initiate(PeerId::from("b")).await,
            Err(SessionError::AlreadyActive(_))
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_offer_never_reaches_relay() {
        let mut h = Harness::new("a", Arc::new(AcceptAll)).await;
        h.factory.fail_offers(true);
        let err = h
            .coordinator
            .initiate(PeerId::from("b"))
            .await
            .expect_err("offer fails");
        assert!(matches!(err, SessionError::Provider(_)));
        assert!(h.relayed().is_empty());
        assert_eq!(h.state("b"), None);
        assert!(h.provider("b").log().closed);
        assert_eq!(
            h.ui_events(),
            vec![PeerEvent::SessionState {
                remote: PeerId::from("b"),
                state: ChannelState::Failed,
            }]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejected_offer_has_no_side_effects() {
        let mut h = Harness::new("b", Arc::new(RejectAll)).await;
        h.relay(
            Envelope::offer(
                PeerId::from("a"),
                PeerId::from("b"),
                &SessionDescription::offer("x"),
            )
            .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(
            h.ui_events(),
            vec![PeerEvent::OfferRejected {
                from: PeerId::from("a")
            }]
        );
        assert_eq!(h.factory.created(), 0);
        assert!(h.relayed().is_empty());
        assert_eq!(h.state("a"), None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn accepted_offer_is_answered() {
        let mut h = Harness::new("b", Arc::new(AcceptAll)).await;
        let offer = SessionDescription::offer("remote-offer");
        h.relay(Envelope::offer(PeerId::from("a"), PeerId::from("b"), &offer).unwrap())
            .await
            .unwrap();
        assert_eq!(h.state("a"), Some((Role::Responder, ChannelState::Answered)));
        assert_eq!(h.provider("a").log().remote_descriptions, vec![offer]);

        let relayed = h.relayed();
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].kind(), EnvelopeKind::Answer);
        assert_eq!(relayed[0].to(), &Recipient::Peer(PeerId::from("a")));

        let err = h
            .relay(
                Envelope::answer(
                    PeerId::from("a"),
                    PeerId::from("b"),
                    &SessionDescription::answer("late"),
                )
                .unwrap(),
            )
            .await
            .expect_err("responder cannot take an answer");
        assert!(matches!(err, SessionError::UnexpectedAnswer { .. }));
    }

    #[test_timeout::tokio_timeout_test]
    async fn early_candidates_flush_once_on_answer() {
        let mut h = Harness::new("a", Arc::new(AcceptAll)).await;
        h.coordinator.initiate(PeerId::from("b")).await.unwrap();
        for n in 1..=2 {
            h.relay(Envelope::ice(PeerId::from("b"), PeerId::from("a"), &candidate(n)).unwrap())
                .await
                .unwrap();
        }
        assert!(h.provider("b").log().candidates.is_empty());

        h.relay(
            Envelope::answer(
                PeerId::from("b"),
                PeerId::from("a"),
                &SessionDescription::answer("remote-answer"),
            )
            .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(
            h.provider("b").log().candidates,
            vec![candidate(1), candidate(2)]
        );

        h.coordinator
            .poll_candidates(Instant::now() + Duration::from_secs(60))
            .await;
        assert_eq!(h.provider("b").log().candidates.len(), 2);
        assert_eq!(h.coordinator.next_deadline(), None);

        h.relay(Envelope::ice(PeerId::from("b"), PeerId::from("a"), &candidate(3)).unwrap())
            .await
            .unwrap();
        assert_eq!(h.provider("b").log().candidates.len(), 3);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn parked_candidate_gives_up_after_bounded_retries() {
        let mut h = Harness::new("a", Arc::new(AcceptAll)).await;
        h.coordinator.initiate(PeerId::from("b")).await.unwrap();
        h.ui_events();
        h.relay(Envelope::ice(PeerId::from("b"), PeerId::from("a"), &candidate(7)).unwrap())
            .await
            .unwrap();

        let start = Instant::now();
        let max_attempts = LinkConfig::default().retry.max_attempts;
        for tick in 1..max_attempts - 1 {
            h.coordinator
                .poll_candidates(start + Duration::from_secs(tick.into()))
                .await;
            assert!(h.ui_events().is_empty(), "gave up early at tick {tick}");
        }
        h.coordinator
            .poll_candidates(start + Duration::from_secs((max_attempts - 1).into()))
            .await;
        assert_eq!(
            h.ui_events(),
            vec![PeerEvent::CandidateFailed {
                remote: PeerId::from("b"),
                candidate: candidate(7),
            }]
        );
        assert_eq!(h.coordinator.next_deadline(), None);
        assert!(h.provider("b").log().candidates.is_empty());
        assert_eq!(h.state("b"), Some((Role::Initiator, ChannelState::OfferSent)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn glare_lower_id_keeps_initiator_role() {
        let mut h = Harness::new("a", Arc::new(AcceptAll)).await;
        h.coordinator.initiate(PeerId::from("b")).await.unwrap();
        h.relay(
            Envelope::offer(
                PeerId::from("b"),
                PeerId::from("a"),
                &SessionDescription::offer("theirs"),
            )
            .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(h.state("b"), Some((Role::Initiator, ChannelState::OfferSent)));
        assert_eq!(h.factory.created(), 1);
        let kinds: Vec<_> = h.relayed().iter().map(Envelope::kind).collect();
        assert_eq!(kinds, vec![EnvelopeKind::Offer]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn glare_higher_id_answers() {
        let mut h = Harness::new("b", Arc::new(AcceptAll)).await;
        h.coordinator.initiate(PeerId::from("a")).await.unwrap();
        let abandoned = h.provider("a");
        h.relay(
            Envelope::offer(
                PeerId::from("a"),
                PeerId::from("b"),
                &SessionDescription::offer("theirs"),
            )
            .unwrap(),
        )
        .await
        .unwrap();
        assert!(abandoned.log().closed);
        assert_eq!(h.factory.created(), 2);
        assert_eq!(h.state("a"), Some((Role::Responder, ChannelState::Answered)));
        let kinds: Vec<_> = h.relayed().iter().map(Envelope::kind).collect();
        assert_eq!(kinds, vec![EnvelopeKind::Offer, EnvelopeKind::Answer]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn initiator_opens_labelled_channel_and_sends_text() {
        let mut h = Harness::new("a", Arc::new(AcceptAll)).await;
        h.connect_as_initiator("b").await;
        assert_eq!(h.state("b"), Some((Role::Initiator, ChannelState::Connected)));
        let provider = h.provider("b");
        assert_eq!(provider.channel_labels(), vec!["a<->b".to_string()]);
        let events = h.ui_events();
        assert!(events.contains(&PeerEvent::ChannelReady {
            remote: PeerId::from("b"),
            label: "a<->b".into(),
        }));

        h.command(Command::SendText {
            to: PeerId::from("b"),
            text: "hello".into(),
        })
        .await
        .unwrap();
        assert_eq!(
            h.ui_rx.recv().await,
            Some(PeerEvent::TextSent {
                to: PeerId::from("b")
            })
        );
        let sent = provider.channel("a<->b").unwrap().sent();
        assert_eq!(sent, vec![Frame::text("hello").encode().unwrap()]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn send_without_channel_is_refused() {
        let mut h = Harness::new("a", Arc::new(AcceptAll)).await;
        h.coordinator.initiate(PeerId::from("b")).await.unwrap();
        let err = h
            .command(Command::SendText {
                to: PeerId::from("b"),
                text: "too early".into(),
            })
            .await
            .expect_err("no channel yet");
        assert!(matches!(err, SessionError::ChannelNotReady(_)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn responder_receives_file_over_adopted_channel() {
        let mut h = Harness::new("b", Arc::new(AcceptAll)).await;
        let channel = h.connect_as_responder("a").await;
        assert_eq!(h.state("a"), Some((Role::Responder, ChannelState::Connected)));
        assert!(h.ui_events().contains(&PeerEvent::ChannelReady {
            remote: PeerId::from("a"),
            label: channel.label().to_string(),
        }));

        let payload = Bytes::from(vec![42u8; 40_000]);
        let metadata = FileMetadata {
            name: "photo.jpg".into(),
            size: 40_000,
            mime_type: "image/jpeg".into(),
        };
        let provider = h.provider("a");
        let label = channel.label().to_string();
        let mut frames = vec![Frame::FileStart {
            metadata: metadata.clone(),
        }];
        frames.extend(split_payload(&payload).unwrap().iter().map(|c| c.to_frame()));
        frames.push(Frame::FileEnd {
            name: "photo.jpg".into(),
        });
        for frame in frames {
            provider.emit(ProviderEvent::Message {
                label: label.clone(),
                text: frame.encode().unwrap(),
            });
        }
        h.pump().await;

        assert_eq!(
            h.ui_events(),
            vec![
                PeerEvent::Transfer {
                    from: PeerId::from("a"),
                    event: TransferEvent::FileStarted(metadata.clone()),
                },
                PeerEvent::Transfer {
                    from: PeerId::from("a"),
                    event: TransferEvent::FileReceived(ReceivedFile { metadata, payload }),
                },
            ]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn failure_mid_transfer_reports_abort_and_tears_down() {
        let mut h = Harness::new("b", Arc::new(AcceptAll)).await;
        let channel = h.connect_as_responder("a").await;
        h.ui_events();
        let provider = h.provider("a");
        let metadata = FileMetadata {
            name: "big.bin".into(),
            size: 50_000,
            mime_type: String::new(),
        };
        provider.emit(ProviderEvent::Message {
            label: channel.label().to_string(),
            text: Frame::FileStart {
                metadata: metadata.clone(),
            }
            .encode()
            .unwrap(),
        });
        provider.emit(ProviderEvent::ConnectionState(ConnectionState::Failed));
        h.pump().await;

        assert_eq!(
            h.ui_events(),
            vec![
                PeerEvent::Transfer {
                    from: PeerId::from("a"),
                    event: TransferEvent::FileStarted(metadata.clone()),
                },
                PeerEvent::Transfer {
                    from: PeerId::from("a"),
                    event: TransferEvent::Aborted {
                        metadata,
                        received_chunks: 0,
                        reason: AbortReason::ChannelClosed,
                    },
                },
                PeerEvent::SessionState {
                    remote: PeerId::from("a"),
                    state: ChannelState::Failed,
                },
            ]
        );
        assert_eq!(h.state("a"), None);
        assert!(provider.log().closed);
        assert!(!channel.is_open());
    }

    #[test_timeout::tokio_timeout_test]
    async fn leave_closes_open_session() {
        let mut h = Harness::new("a", Arc::new(AcceptAll)).await;
        h.relay(Envelope::welcome_all(&info("b")).unwrap())
            .await
            .unwrap();
        h.coordinator.initiate(PeerId::from("b")).await.unwrap();
        h.ui_events();

        h.relay(Envelope::leave(&info("b")).unwrap()).await.unwrap();
        assert_eq!(h.state("b"), None);
        assert!(h.provider("b").log().closed);
        assert!(!h.coordinator.identity().knows(&PeerId::from("b")));
        assert_eq!(
            h.ui_events(),
            vec![
                PeerEvent::SessionState {
                    remote: PeerId::from("b"),
                    state: ChannelState::Closed,
                },
                PeerEvent::PeerLeft(info("b")),
            ]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn events_from_replaced_session_are_ignored() {
        let mut h = Harness::new("a", Arc::new(AcceptAll)).await;
        h.coordinator.initiate(PeerId::from("b")).await.unwrap();
        let first = h.provider("b");
        h.command(Command::Close {
            to: PeerId::from("b"),
        })
        .await
        .unwrap();
        h.coordinator.initiate(PeerId::from("b")).await.unwrap();
        let second = h.provider("b");
        assert_ne!(first.generation(), second.generation());

        first.emit(ProviderEvent::ConnectionState(ConnectionState::Failed));
        first.emit(ProviderEvent::LocalCandidate(candidate(9)));
        h.pump().await;
        assert_eq!(h.state("b"), Some((Role::Initiator, ChannelState::OfferSent)));
        assert!(h
            .relayed()
            .iter()
            .all(|envelope| envelope.kind() == EnvelopeKind::Offer));
    }

    #[test_timeout::tokio_timeout_test]
    async fn run_loop_stops_on_shutdown() {
        let factory = MockFactory::new();
        let (relay_tx, _relay_rx) = mpsc::unbounded_channel();
        let (coordinator, mut ui) = Coordinator::new(
            &LinkConfig::default(),
            factory.clone(),
            Arc::new(AcceptAll),
            relay_tx,
        );
        let handle = coordinator.handle();
        let task = tokio::spawn(coordinator.run());
        handle
            .relay(Envelope::welcome_new_user(&info("a"), vec![]).unwrap())
            .unwrap();
        assert!(matches!(
            ui.recv().await,
            Some(PeerEvent::Registered { .. })
        ));
        handle.shutdown().unwrap();
        task.await.expect("coordinator task");
        assert!(matches!(
            handle.connect(PeerId::from("b")),
            Err(SessionError::Stopped)
        ));
    }
}
