use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use peer_link::rtc::WebRtcFactory;
use peer_link::session::{AllowList, ChannelState, RejectAll};
use peer_link::signaling::{self, RelayConnection};
use peer_link::{Coordinator, CoordinatorHandle, PeerEvent, TransferEvent};
use signal_proto::{PeerId, PeerInfo};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::cli::{Action, PeerConfig};
use crate::files;

/// Time given to the data channel to flush after the last frame is queued.
const LINGER: Duration = Duration::from_secs(2);

struct Peer {
    handle: CoordinatorHandle,
    events: UnboundedReceiver<PeerEvent>,
    connection: RelayConnection,
    driver: tokio::task::JoinHandle<()>,
    connect_timeout: Duration,
}

pub async fn run(config: PeerConfig) -> Result<()> {
    let mut peer = start(&config).await?;
    let outcome = peer.execute(&config).await;
    peer.stop().await;
    outcome
}

async fn start(config: &PeerConfig) -> Result<Peer> {
    let factory = Arc::new(WebRtcFactory::new(config.link.ice_servers.clone()));
    let policy = Arc::new(AllowList::new(
        config.accept_from.iter().cloned(),
        Box::new(RejectAll),
    ));
    let (relay_tx, relay_rx) = tokio::sync::mpsc::unbounded_channel();
    let (coordinator, events) = Coordinator::new(&config.link, factory, policy, relay_tx);
    let handle = coordinator.handle();
    let connection = signaling::connect(config.relay_url.as_str(), relay_rx, handle.clone())
        .await
        .with_context(|| format!("failed to reach relay at {}", config.relay_url))?;
    let driver = tokio::spawn(coordinator.run());
    Ok(Peer {
        handle,
        events,
        connection,
        driver,
        connect_timeout: config.connect_timeout,
    })
}

impl Peer {
    async fn execute(&mut self, config: &PeerConfig) -> Result<()> {
        let (me, online) = self.registered().await?;
        info!(peer_id = %me.id, username = %me.username, online = online.len(), "registered with relay");

        match config.action.clone() {
            Action::Peers => {
                println!("you: {} ({})", me.id, me.username);
                if online.is_empty() {
                    println!("no other peers online");
                }
                for id in &online {
                    println!("peer: {id}");
                }
                Ok(())
            }
            Action::Listen => self.listen(config).await,
            Action::SendText { to, text } => {
                self.open_channel(&to, &online).await?;
                self.handle.send_text(to.clone(), text)?;
                self.await_sent(&to).await
            }
            Action::SendFile { to, path, mime } => {
                let (metadata, payload) = files::load(&path, mime).await?;
                self.open_channel(&to, &online).await?;
                info!(to = %to, name = %metadata.name, size = metadata.size, "sending file");
                self.handle.send_file(to.clone(), metadata, payload)?;
                self.await_sent(&to).await
            }
        }
    }

    async fn next_event(&mut self, deadline: Instant) -> Result<PeerEvent> {
        match tokio::time::timeout_at(deadline, self.events.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => bail!("relay connection closed"),
            Err(_) => bail!("timed out after {:?}", self.connect_timeout),
        }
    }

    async fn registered(&mut self) -> Result<(PeerInfo, Vec<PeerId>)> {
        let deadline = Instant::now() + self.connect_timeout;
        loop {
            if let PeerEvent::Registered { info, peers } = self.next_event(deadline).await? {
                return Ok((info, peers));
            }
        }
    }

    async fn open_channel(&mut self, to: &PeerId, online: &[PeerId]) -> Result<()> {
        if !online.contains(to) {
            bail!("peer {to} is not online");
        }
        self.handle.connect(to.clone())?;
        let deadline = Instant::now() + self.connect_timeout;
        loop {
            match self.next_event(deadline).await? {
                PeerEvent::ChannelReady { remote, label } if &remote == to => {
                    debug!(%remote, %label, "channel ready");
                    return Ok(());
                }
                PeerEvent::SessionState { remote, state } if &remote == to => {
                    if matches!(state, ChannelState::Failed | ChannelState::Closed) {
                        bail!("session with {to} ended before the channel opened ({state:?})");
                    }
                }
                PeerEvent::PeerLeft(info) if &info.id == to => bail!("peer {to} went offline"),
                other => debug!(event = ?other, "ignored while connecting"),
            }
        }
    }

    async fn await_sent(&mut self, to: &PeerId) -> Result<()> {
        let deadline = Instant::now() + self.connect_timeout;
        loop {
            match self.next_event(deadline).await? {
                PeerEvent::TextSent { to: sent } if &sent == to => {
                    println!("text delivered to {to}");
                    break;
                }
                PeerEvent::FileSent { to: sent, name } if &sent == to => {
                    println!("{name} delivered to {to}");
                    break;
                }
                PeerEvent::SendFailed { to: failed, error } if &failed == to => {
                    return Err(anyhow!("send to {to} failed: {error}"));
                }
                other => debug!(event = ?other, "ignored while sending"),
            }
        }
        tokio::time::sleep(LINGER).await;
        Ok(())
    }

    async fn listen(&mut self, config: &PeerConfig) -> Result<()> {
        if config.accept_from.is_empty() {
            warn!("no --accept-from entries; every incoming offer will be declined");
        }
        loop {
            let event = tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => bail!("relay connection closed"),
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted; leaving");
                    return Ok(());
                }
            };
            self.report(config, event).await;
        }
    }

    async fn report(&self, config: &PeerConfig, event: PeerEvent) {
        match event {
            PeerEvent::PeerJoined(info) => println!("+ {} ({})", info.id, info.username),
            PeerEvent::PeerLeft(info) => println!("- {} ({})", info.id, info.username),
            PeerEvent::OfferRejected { from } => println!("declined offer from {from}"),
            PeerEvent::ChannelReady { remote, .. } => println!("channel open with {remote}"),
            PeerEvent::Transfer { from, event } => match event {
                TransferEvent::Text(text) => println!("{from}: {text}"),
                TransferEvent::FileStarted(metadata) => {
                    println!("{from} is sending {} ({} bytes)", metadata.name, metadata.size)
                }
                TransferEvent::FileReceived(file) => match files::save(&config.out_dir, &file).await {
                    Ok(path) => println!("saved {} from {from}", path.display()),
                    Err(err) => warn!(from = %from, error = %err, "could not save received file"),
                },
                TransferEvent::FileFailed { metadata, error } => {
                    warn!(from = %from, name = %metadata.name, error = %error, "transfer failed")
                }
                TransferEvent::Aborted {
                    metadata,
                    received_chunks,
                    reason,
                } => warn!(
                    from = %from,
                    name = %metadata.name,
                    received_chunks,
                    ?reason,
                    "transfer aborted"
                ),
            },
            PeerEvent::CandidateFailed { remote, .. } => {
                warn!(remote = %remote, "gave up on a network candidate")
            }
            other => debug!(event = ?other, "peer event"),
        }
    }

    async fn stop(self) {
        let _ = self.handle.shutdown();
        if timeout(Duration::from_secs(5), self.driver).await.is_err() {
            warn!("coordinator did not stop in time");
        }
        self.connection.abort();
    }
}
