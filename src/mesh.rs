//! Mesh coordinator.
//!
//! Owns the local media, the signaling channel and the peer registry for one
//! room session, and keeps the set of peer connections equal to the set of
//! remote participants the relay has announced. All state lives on a single
//! task; relay frames and peer events are fed through [`MeshCoordinator::handle`]
//! one at a time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::connection::{ConnectionState, Role};
use crate::error::{Error, Result};
use crate::media::{LocalMedia, MediaDevices, MediaSource};
use crate::registry::{PeerConnector, PeerEvent, PeerEventKind, PeerRegistry};
use crate::room::{RemoteStreams, Roster, StreamMap};
use crate::signaling::{
    ClientMessage, LocalIdentity, Participant, RelayConnector, RelayMessage, RoomId, SessionId,
    SignalData, SignalingChannel,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeshState {
    Idle,
    /// Media is live and `join-room` was sent; waiting for the roster.
    Joining,
    Active,
    Closing,
}

impl fmt::Display for MeshState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshState::Idle => write!(f, "Idle"),
            MeshState::Joining => write!(f, "Joining"),
            MeshState::Active => write!(f, "Active"),
            MeshState::Closing => write!(f, "Closing"),
        }
    }
}

pub enum MeshInput {
    Relay(RelayMessage),
    /// The relay socket went away.
    ChannelClosed,
    Peer(PeerEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub session_id: SessionId,
    pub role: Role,
    pub state: ConnectionState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshSnapshot {
    pub state: MeshState,
    pub room_id: Option<RoomId>,
    pub local_session: Option<SessionId>,
    /// Remote participants in join order.
    pub participants: Vec<Participant>,
    pub connections: Vec<PeerSummary>,
}

/// Everything that exists only while we are in a room. Dropping it ends the
/// session: the event channel closes with it, so nothing queued for an old
/// session can reach a new one.
struct RoomSession {
    epoch: u64,
    room_id: RoomId,
    channel: SignalingChannel,
    roster: Roster,
    registry: PeerRegistry,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
}

pub struct MeshCoordinator {
    config: MeshConfig,
    relay: Arc<dyn RelayConnector>,
    connector: Arc<dyn PeerConnector>,
    media: MediaSource,
    streams: RemoteStreams,
    state: watch::Sender<MeshState>,
    epoch: u64,
    session: Option<RoomSession>,
}

impl MeshCoordinator {
    pub fn new(
        config: MeshConfig,
        relay: Arc<dyn RelayConnector>,
        connector: Arc<dyn PeerConnector>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        let media = MediaSource::new(devices, config.media);
        let (state, _) = watch::channel(MeshState::Idle);
        Self {
            config,
            relay,
            connector,
            media,
            streams: RemoteStreams::new(),
            state,
            epoch: 0,
            session: None,
        }
    }

    pub fn state(&self) -> MeshState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<MeshState> {
        self.state.subscribe()
    }

    pub fn remote_streams(&self) -> &RemoteStreams {
        &self.streams
    }

    pub fn media(&self) -> &MediaSource {
        &self.media
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) {
        self.media.set_audio_enabled(enabled);
    }

    /// Acquire media, connect to the relay and announce ourselves in
    /// `room_id`. On error nothing stays acquired.
    pub async fn enable(&mut self, room_id: RoomId, identity: LocalIdentity) -> Result<()> {
        if let Some(session) = &self.session {
            return Err(Error::InvalidState(format!(
                "already in room {}",
                session.room_id
            )));
        }

        let media = self.media.enable().await?;

        let channel = match self.relay.connect(&self.config.relay_url).await {
            Ok(channel) => channel,
            Err(e) => {
                self.media.disable();
                return Err(match e {
                    Error::ChannelUnavailable(_) => e,
                    other => Error::ChannelUnavailable(other.to_string()),
                });
            }
        };
        if let Err(e) = channel.join_room(&room_id, &identity).await {
            self.media.disable();
            return Err(e);
        }

        self.epoch += 1;
        let (events, peer_events) = mpsc::unbounded_channel();
        let registry = PeerRegistry::new(
            self.connector.clone(),
            events,
            self.config.max_pending_candidates,
        );
        info!(
            room = %room_id,
            user = %identity.user_id,
            stream = media.stream_id(),
            epoch = self.epoch,
            "joining room"
        );
        self.session = Some(RoomSession {
            epoch: self.epoch,
            room_id,
            channel,
            roster: Roster::new(),
            registry,
            peer_events,
        });
        self.set_state(MeshState::Joining);
        Ok(())
    }

    /// Leave the room. Idempotent; when it returns every connection is
    /// closed, the devices are released and the surface is empty.
    pub async fn disable(&mut self) {
        let Some(mut session) = self.session.take() else {
            self.media.disable();
            return;
        };
        self.set_state(MeshState::Closing);

        session.registry.destroy_all().await;
        self.media.disable();
        if let Err(e) = session.channel.send(ClientMessage::LeaveRoom).await {
            debug!(error = %e, "leave-room not delivered");
        }
        session.channel.disconnect();
        session.roster.clear();
        self.streams.clear();

        info!(room = %session.room_id, epoch = session.epoch, "left room");
        self.set_state(MeshState::Idle);
    }

    /// Wait for the next relay frame or peer event. `None` while idle.
    pub async fn next_input(&mut self) -> Option<MeshInput> {
        let session = self.session.as_mut()?;
        tokio::select! {
            msg = session.channel.recv() => Some(match msg {
                Some(msg) => MeshInput::Relay(msg),
                None => MeshInput::ChannelClosed,
            }),
            Some(event) = session.peer_events.recv() => Some(MeshInput::Peer(event)),
        }
    }

    pub fn try_next_input(&mut self) -> Option<MeshInput> {
        let session = self.session.as_mut()?;
        match session.channel.try_recv() {
            Ok(msg) => return Some(MeshInput::Relay(msg)),
            Err(TryRecvError::Disconnected) => return Some(MeshInput::ChannelClosed),
            Err(TryRecvError::Empty) => {}
        }
        session.peer_events.try_recv().ok().map(MeshInput::Peer)
    }

    pub async fn handle(&mut self, input: MeshInput) {
        match input {
            MeshInput::Relay(msg) => self.on_relay(msg).await,
            MeshInput::ChannelClosed => {
                if self.session.is_some() {
                    warn!("signaling channel lost; leaving room");
                    self.disable().await;
                }
            }
            MeshInput::Peer(event) => self.on_peer_event(event).await,
        }
    }

    async fn on_relay(&mut self, msg: RelayMessage) {
        let Self {
            session,
            media,
            streams,
            state,
            ..
        } = self;
        let Some(session) = session.as_mut() else {
            return;
        };
        debug!(event = msg.name(), "relay event");

        match msg {
            RelayMessage::Connected { session_id } => {
                debug!(session = %session_id, "relay assigned session id");
                if session.roster.set_local(session_id) {
                    warn!("relay listed our own session as a remote participant");
                }
            }
            RelayMessage::AllUsers(participants) => {
                info!(count = participants.len(), "received room roster");
                // Listed oldest first; admitted newest first so orders descend.
                for participant in participants.into_iter().rev() {
                    session.roster.admit_existing(participant);
                }
                state.send_if_modified(|s| {
                    if *s == MeshState::Joining {
                        *s = MeshState::Active;
                        true
                    } else {
                        false
                    }
                });
            }
            RelayMessage::UserJoined(participant) => {
                let session_id = participant.session_id.clone();
                let name = participant.name.clone();
                if session.roster.admit_joined(participant) {
                    info!(peer = %session_id, %name, "participant joined");
                } else {
                    debug!(peer = %session_id, "repeated join announcement");
                }
            }
            RelayMessage::UserLeft { session_id } => {
                if session.roster.remove(&session_id).is_some() {
                    info!(peer = %session_id, "participant left");
                } else {
                    debug!(peer = %session_id, "leave for unknown participant");
                }
            }
            RelayMessage::Signal { from, data } => {
                let kind = data.kind();
                match session.registry.attach_signal(&from, data) {
                    Ok(()) => debug!(peer = %from, kind, "signal routed"),
                    Err(e) if e.is_protocol_anomaly() => {
                        debug!(peer = %from, kind, error = %e, "signal dropped")
                    }
                    Err(e) => warn!(peer = %from, kind, error = %e, "signal not routed"),
                }
                return;
            }
            RelayMessage::Error { message } => {
                warn!(%message, "relay reported an error");
                return;
            }
        }

        let local = media.current_stream();
        reconcile(session, local.as_ref(), streams).await;
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        let Self {
            session,
            streams,
            config,
            ..
        } = self;
        let Some(session) = session.as_mut() else {
            return;
        };
        let PeerEvent {
            session_id,
            epoch,
            kind,
        } = event;
        if !session.registry.is_current(&session_id, epoch) {
            debug!(peer = %session_id, epoch, event = kind.name(), "event for a destroyed connection dropped");
            return;
        }

        match kind {
            PeerEventKind::NegotiationNeeded => {
                if let Err(e) = session.registry.negotiate(&session_id) {
                    warn!(peer = %session_id, error = %e, "could not start negotiation");
                }
            }
            PeerEventKind::LocalCandidate(candidate) => {
                send_signal(&session.channel, &session_id, candidate.into()).await;
            }
            PeerEventKind::LocalDescription(description) => {
                send_signal(&session.channel, &session_id, description.into()).await;
            }
            PeerEventKind::Track(track) => {
                let kind = track.kind();
                if streams.attach_track(&session_id, track) {
                    info!(peer = %session_id, ?kind, "remote track attached");
                }
            }
            PeerEventKind::StateChanged(state) => {
                session.registry.set_state(&session_id, state);
                match state {
                    ConnectionState::Connected => info!(peer = %session_id, "peer connected"),
                    ConnectionState::Disconnected => {
                        let timeout = config.stale_peer_timeout();
                        warn!(peer = %session_id, timeout_ms = timeout.as_millis() as u64, "peer disconnected");
                        if let Some(peer) = session.registry.get(&session_id) {
                            let events = peer.events().clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(timeout).await;
                                events.emit(PeerEventKind::StaleCheck);
                            });
                        }
                    }
                    ended if ended.is_terminal() => {
                        drop_peer(session, streams, &session_id, "connection ended").await;
                    }
                    _ => {}
                }
            }
            PeerEventKind::NegotiationFailed(reason) => {
                drop_peer(session, streams, &session_id, &reason).await;
            }
            PeerEventKind::StaleCheck => {
                let timeout = config.stale_peer_timeout();
                let still_down = session
                    .registry
                    .get(&session_id)
                    .and_then(|peer| peer.disconnected_for())
                    .map_or(false, |down| down >= timeout);
                if still_down {
                    drop_peer(session, streams, &session_id, "stale connection").await;
                }
            }
        }
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        let Some(session) = &self.session else {
            return MeshSnapshot {
                state: self.state(),
                room_id: None,
                local_session: None,
                participants: Vec::new(),
                connections: Vec::new(),
            };
        };
        let connections = session
            .registry
            .session_ids()
            .into_iter()
            .filter_map(|session_id| {
                let peer = session.registry.get(&session_id)?;
                Some(PeerSummary {
                    role: peer.role(),
                    state: peer.state(),
                    session_id,
                })
            })
            .collect();
        MeshSnapshot {
            state: self.state(),
            room_id: Some(session.room_id.clone()),
            local_session: session.roster.local().cloned(),
            participants: session.roster.participants(),
            connections,
        }
    }

    fn set_state(&self, state: MeshState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "mesh state changed");
        }
    }

    /// Move the coordinator onto its own task.
    pub fn spawn(self) -> (MeshHandle, JoinHandle<()>) {
        let (commands, rx) = mpsc::channel(32);
        let handle = MeshHandle {
            commands,
            state: self.state.subscribe(),
            streams: self.streams.subscribe(),
            local_media: self.media.subscribe(),
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let in_room = self.session.is_some();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.execute(command).await,
                    None => break,
                },
                Some(input) = self.next_input(), if in_room => self.handle(input).await,
            }
        }
        self.disable().await;
        debug!("mesh coordinator stopped");
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::Enable {
                room_id,
                identity,
                reply,
            } => {
                let result = self.enable(room_id, identity).await;
                if let Err(e) = &result {
                    warn!(error = %e, "could not join room");
                }
                let _ = reply.send(result);
            }
            Command::Disable { reply } => {
                self.disable().await;
                let _ = reply.send(());
            }
            Command::SetAudioEnabled(enabled) => self.set_audio_enabled(enabled),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }
}

async fn send_signal(channel: &SignalingChannel, to: &SessionId, data: SignalData) {
    let kind = data.kind();
    match channel.send_signal(to, data).await {
        Ok(()) => debug!(peer = %to, kind, "signal sent"),
        Err(e) => warn!(peer = %to, kind, error = %e, "failed to send signal"),
    }
}

/// Bring the registry and the surface in line with the roster.
async fn reconcile(session: &mut RoomSession, media: Option<&LocalMedia>, streams: &RemoteStreams) {
    for session_id in session.registry.session_ids() {
        if !session.roster.contains(&session_id) {
            session.registry.destroy(&session_id).await;
        }
    }
    for session_id in streams.session_ids() {
        if !session.roster.contains(&session_id) {
            streams.remove(&session_id);
        }
    }

    let missing: Vec<(Participant, Role)> = session
        .roster
        .entries()
        .into_iter()
        .filter(|entry| !session.registry.contains(&entry.participant.session_id))
        .map(|entry| (entry.participant.clone(), entry.role()))
        .collect();

    for (participant, role) in missing {
        streams.show(&participant);
        match session
            .registry
            .create(&participant.session_id, role, media)
            .await
        {
            Ok(_) => info!(
                peer = %participant.session_id,
                name = %participant.name,
                %role,
                "connecting to participant"
            ),
            Err(e) => {
                warn!(peer = %participant.session_id, error = %e, "could not connect to participant");
                session.roster.remove(&participant.session_id);
                streams.remove(&participant.session_id);
            }
        }
    }
}

async fn drop_peer(
    session: &mut RoomSession,
    streams: &RemoteStreams,
    session_id: &SessionId,
    reason: &str,
) {
    warn!(peer = %session_id, reason, "dropping participant");
    session.registry.destroy(session_id).await;
    session.roster.remove(session_id);
    streams.remove(session_id);
}

enum Command {
    Enable {
        room_id: RoomId,
        identity: LocalIdentity,
        reply: oneshot::Sender<Result<()>>,
    },
    Disable {
        reply: oneshot::Sender<()>,
    },
    SetAudioEnabled(bool),
    Snapshot {
        reply: oneshot::Sender<MeshSnapshot>,
    },
}

/// Cloneable handle to a spawned coordinator. The coordinator leaves the
/// room and stops once every handle is dropped.
#[derive(Clone)]
pub struct MeshHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<MeshState>,
    streams: watch::Receiver<StreamMap>,
    local_media: watch::Receiver<Option<LocalMedia>>,
}

impl MeshHandle {
    pub async fn enable(&self, room_id: RoomId, identity: LocalIdentity) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Enable {
            room_id,
            identity,
            reply,
        })
        .await?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn disable(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Disable { reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<()> {
        self.send(Command::SetAudioEnabled(enabled)).await
    }

    pub async fn snapshot(&self) -> Result<MeshSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    pub fn state(&self) -> watch::Receiver<MeshState> {
        self.state.clone()
    }

    pub fn remote_streams(&self) -> watch::Receiver<StreamMap> {
        self.streams.clone()
    }

    pub fn local_media(&self) -> watch::Receiver<Option<LocalMedia>> {
        self.local_media.clone()
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| stopped())
    }
}

fn stopped() -> Error {
    Error::InvalidState("mesh coordinator stopped".to_string())
}
