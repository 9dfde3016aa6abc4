//! Peer connection registry.
//!
//! One entry per remote session id. Each entry owns a transport link and a
//! negotiation worker task that applies remote payloads in arrival order.
//! Everything a link or worker wants to tell the coordinator comes back as
//! a [`PeerEvent`] stamped with the connection's epoch, so continuations
//! belonging to a destroyed connection can be recognised and dropped.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionState, Role};
use crate::error::{Error, Result};
use crate::media::{LocalMedia, MediaKind};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription, SessionId, SignalData};

/// An inbound media track from a remote peer.
#[async_trait]
pub trait InboundTrack: Send + Sync {
    fn id(&self) -> String;
    fn stream_id(&self) -> String;
    fn kind(&self) -> MediaKind;
    /// Next RTP payload, or `None` once the track has ended.
    async fn read_payload(&self) -> Option<Bytes>;
}

pub enum PeerEventKind {
    /// Local state changed in a way that needs a fresh offer.
    NegotiationNeeded,
    LocalCandidate(IceCandidate),
    /// An offer or answer the worker produced, ready to be relayed.
    LocalDescription(SessionDescription),
    Track(Arc<dyn InboundTrack>),
    StateChanged(ConnectionState),
    NegotiationFailed(String),
    /// Timer set when the connection went `Disconnected`.
    StaleCheck,
}

impl PeerEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            PeerEventKind::NegotiationNeeded => "negotiation-needed",
            PeerEventKind::LocalCandidate(_) => "local-candidate",
            PeerEventKind::LocalDescription(_) => "local-description",
            PeerEventKind::Track(_) => "track",
            PeerEventKind::StateChanged(_) => "state-changed",
            PeerEventKind::NegotiationFailed(_) => "negotiation-failed",
            PeerEventKind::StaleCheck => "stale-check",
        }
    }
}

pub struct PeerEvent {
    pub session_id: SessionId,
    pub epoch: u64,
    pub kind: PeerEventKind,
}

/// Where a link and its worker report. Cloned into transport callbacks.
#[derive(Clone)]
pub struct PeerEventSink {
    session_id: SessionId,
    epoch: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub fn new(session_id: SessionId, epoch: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            session_id,
            epoch,
            tx,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns false once nobody is listening any more.
    pub fn emit(&self, kind: PeerEventKind) -> bool {
        self.tx
            .send(PeerEvent {
                session_id: self.session_id.clone(),
                epoch: self.epoch,
                kind,
            })
            .is_ok()
    }
}

/// One transport-level connection to a remote peer.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Attach every local track, or set up receive-only media when there is
    /// nothing to send. Expected to trigger `NegotiationNeeded`.
    async fn attach_media(&self, media: Option<&LocalMedia>) -> Result<()>;
    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;
    /// Create an answer to the applied remote offer and install it.
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn apply_remote(&self, description: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Build a link whose callbacks report through `events`.
    async fn connect(&self, events: PeerEventSink) -> Result<Arc<dyn PeerLink>>;
}

enum PeerCommand {
    Negotiate,
    Remote(SignalData),
}

pub struct PeerConnection {
    role: Role,
    epoch: u64,
    state: ConnectionState,
    disconnected_since: Option<Instant>,
    link: Arc<dyn PeerLink>,
    events: PeerEventSink,
    inbox: mpsc::UnboundedSender<PeerCommand>,
    worker: JoinHandle<()>,
}

impl PeerConnection {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// How long the connection has been continuously `Disconnected`.
    pub fn disconnected_for(&self) -> Option<Duration> {
        self.disconnected_since.map(|since| since.elapsed())
    }

    pub fn events(&self) -> &PeerEventSink {
        &self.events
    }
}

pub struct PeerRegistry {
    connector: Arc<dyn PeerConnector>,
    peers: HashMap<SessionId, PeerConnection>,
    events: mpsc::UnboundedSender<PeerEvent>,
    next_epoch: u64,
    max_pending_candidates: usize,
}

impl PeerRegistry {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        events: mpsc::UnboundedSender<PeerEvent>,
        max_pending_candidates: usize,
    ) -> Self {
        Self {
            connector,
            peers: HashMap::new(),
            events,
            next_epoch: 0,
            max_pending_candidates,
        }
    }

    /// Callers check [`contains`](Self::contains) first; a duplicate here is
    /// an ordering anomaly, reported as `DuplicateConnection`.
    pub async fn create(
        &mut self,
        session_id: &SessionId,
        role: Role,
        media: Option<&LocalMedia>,
    ) -> Result<&PeerConnection> {
        if self.peers.contains_key(session_id) {
            return Err(Error::DuplicateConnection(session_id.clone()));
        }

        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let events = PeerEventSink::new(session_id.clone(), epoch, self.events.clone());

        let link = self
            .connector
            .connect(events.clone())
            .await
            .map_err(|e| Error::negotiation(session_id, e))?;
        if let Err(e) = link.attach_media(media).await {
            let _ = link.close().await;
            return Err(Error::negotiation(session_id, e));
        }

        let (inbox, commands) = mpsc::unbounded_channel();
        let worker = NegotiationWorker {
            session_id: session_id.clone(),
            role,
            link: link.clone(),
            events: events.clone(),
            pending: VecDeque::new(),
            max_pending: self.max_pending_candidates,
            remote_ready: false,
            awaiting_answer: false,
            renegotiate: false,
        };
        let worker = tokio::spawn(worker.run(commands));

        debug!(peer = %session_id, %role, epoch, "peer connection created");
        let connection = PeerConnection {
            role,
            epoch,
            state: ConnectionState::Connecting,
            disconnected_since: None,
            link,
            events,
            inbox,
            worker,
        };
        match self.peers.entry(session_id.clone()) {
            Entry::Vacant(slot) => Ok(&*slot.insert(connection)),
            Entry::Occupied(_) => Err(Error::DuplicateConnection(session_id.clone())),
        }
    }

    /// Route an inbound SDP or ICE payload to its connection.
    pub fn attach_signal(&self, session_id: &SessionId, data: SignalData) -> Result<()> {
        let peer = self
            .peers
            .get(session_id)
            .ok_or_else(|| Error::UnknownPeer(session_id.clone()))?;
        peer.inbox
            .send(PeerCommand::Remote(data))
            .map_err(|_| Error::negotiation(session_id, "negotiation worker stopped"))
    }

    pub fn negotiate(&self, session_id: &SessionId) -> Result<()> {
        let peer = self
            .peers
            .get(session_id)
            .ok_or_else(|| Error::UnknownPeer(session_id.clone()))?;
        peer.inbox
            .send(PeerCommand::Negotiate)
            .map_err(|_| Error::negotiation(session_id, "negotiation worker stopped"))
    }

    /// Idempotent. Any negotiation in flight for the peer is cancelled.
    pub async fn destroy(&mut self, session_id: &SessionId) -> bool {
        let Some(peer) = self.peers.remove(session_id) else {
            return false;
        };
        peer.worker.abort();
        if let Err(e) = peer.link.close().await {
            debug!(peer = %session_id, error = %e, "error while closing peer connection");
        }
        info!(peer = %session_id, "peer connection destroyed");
        true
    }

    pub async fn destroy_all(&mut self) {
        let peers: Vec<(SessionId, PeerConnection)> = self.peers.drain().collect();
        for (_, peer) in &peers {
            peer.worker.abort();
        }
        let closes = peers.iter().map(|(id, peer)| async move {
            if let Err(e) = peer.link.close().await {
                debug!(peer = %id, error = %e, "error while closing peer connection");
            }
        });
        futures::future::join_all(closes).await;
        if !peers.is_empty() {
            info!(count = peers.len(), "all peer connections destroyed");
        }
    }

    /// Whether an event stamped `epoch` still belongs to a live connection.
    pub fn is_current(&self, session_id: &SessionId, epoch: u64) -> bool {
        self.peers
            .get(session_id)
            .map_or(false, |peer| peer.epoch == epoch)
    }

    pub fn set_state(&mut self, session_id: &SessionId, state: ConnectionState) {
        if let Some(peer) = self.peers.get_mut(session_id) {
            if state == ConnectionState::Disconnected {
                peer.disconnected_since.get_or_insert_with(Instant::now);
            } else {
                peer.disconnected_since = None;
            }
            peer.state = state;
        }
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&PeerConnection> {
        self.peers.get(session_id)
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.peers.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Drop for PeerRegistry {
    fn drop(&mut self) {
        for peer in self.peers.values() {
            peer.worker.abort();
        }
    }
}

/// Applies remote payloads for one peer strictly in arrival order.
struct NegotiationWorker {
    session_id: SessionId,
    role: Role,
    link: Arc<dyn PeerLink>,
    events: PeerEventSink,
    pending: VecDeque<IceCandidate>,
    max_pending: usize,
    remote_ready: bool,
    awaiting_answer: bool,
    renegotiate: bool,
}

impl NegotiationWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<PeerCommand>) {
        while let Some(command) = commands.recv().await {
            let result = match command {
                PeerCommand::Negotiate => self.negotiate().await,
                PeerCommand::Remote(data) => self.on_remote(data).await,
            };
            if let Err(e) = result {
                warn!(peer = %self.session_id, error = %e, "negotiation failed");
                self.events.emit(PeerEventKind::NegotiationFailed(e.to_string()));
                break;
            }
        }
    }

    async fn negotiate(&mut self) -> Result<()> {
        if self.role == Role::Responder {
            debug!(peer = %self.session_id, "responder waits for the remote offer");
            return Ok(());
        }
        if self.awaiting_answer {
            self.renegotiate = true;
            return Ok(());
        }
        let offer = self.link.create_offer().await?;
        self.awaiting_answer = true;
        debug!(peer = %self.session_id, "offer created");
        self.events.emit(PeerEventKind::LocalDescription(offer));
        Ok(())
    }

    async fn on_remote(&mut self, data: SignalData) -> Result<()> {
        match data {
            SignalData::Sdp { sdp } => match sdp.kind {
                SdpKind::Offer => {
                    if self.awaiting_answer {
                        warn!(peer = %self.session_id, "offer received while our own is outstanding; dropped");
                        return Ok(());
                    }
                    self.link.apply_remote(sdp).await?;
                    self.remote_ready = true;
                    self.flush_candidates().await;
                    let answer = self.link.create_answer().await?;
                    debug!(peer = %self.session_id, "answer created");
                    self.events.emit(PeerEventKind::LocalDescription(answer));
                }
                SdpKind::Answer | SdpKind::Pranswer => {
                    if !self.awaiting_answer {
                        debug!(peer = %self.session_id, "unsolicited answer dropped");
                        return Ok(());
                    }
                    let kind = sdp.kind;
                    self.link.apply_remote(sdp).await?;
                    self.remote_ready = true;
                    self.flush_candidates().await;
                    if kind == SdpKind::Answer {
                        self.awaiting_answer = false;
                        if std::mem::take(&mut self.renegotiate) {
                            self.negotiate().await?;
                        }
                    }
                }
                SdpKind::Rollback => {
                    debug!(peer = %self.session_id, "rollback ignored");
                }
            },
            SignalData::Candidate { candidate } => {
                if self.remote_ready {
                    self.apply_candidate(candidate).await;
                } else if self.max_pending == 0 {
                    debug!(peer = %self.session_id, "early candidate dropped; buffering disabled");
                } else {
                    if self.pending.len() >= self.max_pending {
                        self.pending.pop_front();
                        warn!(peer = %self.session_id, "early candidate buffer full; oldest dropped");
                    }
                    self.pending.push_back(candidate);
                }
            }
        }
        Ok(())
    }

    async fn flush_candidates(&mut self) {
        while let Some(candidate) = self.pending.pop_front() {
            self.apply_candidate(candidate).await;
        }
    }

    /// A rejected candidate costs one path, not the connection.
    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.link.add_ice_candidate(candidate).await {
            warn!(peer = %self.session_id, error = %e, "error adding ICE candidate");
        }
    }
}
