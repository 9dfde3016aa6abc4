#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use meshcall::config::MediaConstraints;
use meshcall::media::{Capture, CaptureHandle};
use meshcall::registry::{PeerEventKind, PeerEventSink};
use meshcall::signaling::{
    ClientMessage, IceCandidate, RelayEndpoint, RelayMessage, SdpKind, SessionDescription,
    SignalData,
};
use meshcall::{
    ConnectionState, Error, InboundTrack, LocalMedia, MediaDevices, MediaKind, MeshConfig,
    MeshCoordinator, Participant, PeerConnector, PeerLink, RelayConnector, Result, SessionId,
    SignalingChannel,
};

pub fn participant(id: &str) -> Participant {
    Participant {
        session_id: id.into(),
        user_id: format!("user-{}", id),
        name: id.to_uppercase(),
    }
}

pub fn candidate(n: u16) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{} 1 udp 2130706431 10.0.0.{} 5000 typ host", n, n),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

pub struct FakeTrack {
    id: String,
    stream_id: String,
    kind: MediaKind,
}

#[async_trait]
impl InboundTrack for FakeTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn stream_id(&self) -> String {
        self.stream_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn read_payload(&self) -> Option<Bytes> {
        None
    }
}

#[derive(Debug, Default, Clone)]
pub struct LinkLog {
    /// `Some(sending)` once media was attached.
    pub attached: Option<bool>,
    pub offers: usize,
    pub answers: usize,
    pub remote: Vec<SdpKind>,
    pub candidates: Vec<IceCandidate>,
    pub closed: bool,
}

/// Stands in for a transport connection. Answers immediately, reports a
/// candidate with every offer, and "connects" as soon as a remote
/// description lands.
pub struct FakeLink {
    pub events: PeerEventSink,
    reject_remote: bool,
    log: Mutex<LinkLog>,
}

impl FakeLink {
    pub fn log(&self) -> LinkLog {
        self.log.lock().unwrap().clone()
    }

    pub fn session_id(&self) -> &SessionId {
        self.events.session_id()
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn attach_media(&self, media: Option<&LocalMedia>) -> Result<()> {
        self.log.lock().unwrap().attached = Some(media.is_some());
        self.events.emit(PeerEventKind::NegotiationNeeded);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let n = {
            let mut log = self.log.lock().unwrap();
            log.offers += 1;
            log.offers
        };
        self.events
            .emit(PeerEventKind::LocalCandidate(candidate(n as u16)));
        Ok(SessionDescription::offer(format!("offer-{}", n)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let n = {
            let mut log = self.log.lock().unwrap();
            log.answers += 1;
            log.answers
        };
        Ok(SessionDescription::answer(format!("answer-{}", n)))
    }

    async fn apply_remote(&self, description: SessionDescription) -> Result<()> {
        if self.reject_remote {
            return Err(Error::InvalidState("malformed description".into()));
        }
        self.log.lock().unwrap().remote.push(description.kind);
        let stream_id = format!("stream-{}", self.session_id());
        for (id, kind) in [("audio", MediaKind::Audio), ("video", MediaKind::Video)] {
            self.events.emit(PeerEventKind::Track(Arc::new(FakeTrack {
                id: id.to_owned(),
                stream_id: stream_id.clone(),
                kind,
            })));
        }
        self.events
            .emit(PeerEventKind::StateChanged(ConnectionState::Connected));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        if log.remote.is_empty() {
            return Err(Error::InvalidState("no remote description".into()));
        }
        log.candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.log.lock().unwrap().closed = true;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnector {
    links: Mutex<Vec<Arc<FakeLink>>>,
    reject_remote: Mutex<HashSet<SessionId>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Links created for `session_id` from now on refuse remote descriptions.
    pub fn reject_remote_from(&self, session_id: &str) {
        self.reject_remote
            .lock()
            .unwrap()
            .insert(SessionId::from(session_id));
    }

    pub fn links(&self) -> Vec<Arc<FakeLink>> {
        self.links.lock().unwrap().clone()
    }

    pub fn links_for(&self, session_id: &str) -> Vec<Arc<FakeLink>> {
        self.links()
            .into_iter()
            .filter(|link| link.session_id().as_str() == session_id)
            .collect()
    }

    /// The most recent link for `session_id`.
    pub fn link(&self, session_id: &str) -> Arc<FakeLink> {
        self.links_for(session_id)
            .pop()
            .unwrap_or_else(|| panic!("no link for {}", session_id))
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(&self, events: PeerEventSink) -> Result<Arc<dyn PeerLink>> {
        let reject_remote = self
            .reject_remote
            .lock()
            .unwrap()
            .contains(events.session_id());
        let link = Arc::new(FakeLink {
            events,
            reject_remote,
            log: Mutex::new(LinkLog::default()),
        });
        self.links.lock().unwrap().push(link.clone());
        Ok(link)
    }
}

#[derive(Default)]
pub struct FakeDevices {
    pub opened: Arc<AtomicUsize>,
    pub stopped: Arc<AtomicUsize>,
    pub deny: bool,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn denying() -> Arc<Self> {
        Arc::new(Self {
            deny: true,
            ..Default::default()
        })
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

struct FakeCapture {
    stopped: Arc<AtomicUsize>,
    done: bool,
}

impl CaptureHandle for FakeCapture {
    fn stop(&mut self) {
        if !self.done {
            self.done = true;
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn open(&self, constraints: MediaConstraints) -> Result<Capture> {
        if self.deny {
            return Err(Error::PermissionDenied("camera access refused".into()));
        }
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Capture {
            media: LocalMedia::with_constraints(format!("local-{}", n), constraints),
            handle: Box::new(FakeCapture {
                stopped: self.stopped.clone(),
                done: false,
            }),
        })
    }
}

/// Hands out pre-made in-process channels, one per `connect`. The test
/// plays the relay through the matching [`RelayEndpoint`].
#[derive(Default)]
pub struct ScriptedRelay {
    channels: Mutex<VecDeque<SignalingChannel>>,
    connects: AtomicUsize,
}

impl ScriptedRelay {
    pub fn new() -> (Arc<Self>, RelayEndpoint) {
        let relay = Arc::new(Self::default());
        let endpoint = relay.push();
        (relay, endpoint)
    }

    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self) -> RelayEndpoint {
        let (channel, endpoint) = SignalingChannel::pair(64);
        self.channels.lock().unwrap().push_back(channel);
        endpoint
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayConnector for ScriptedRelay {
    async fn connect(&self, relay_url: &str) -> Result<SignalingChannel> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.channels
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::ChannelUnavailable(format!("{}: connection refused", relay_url)))
    }
}

pub fn fast_config() -> MeshConfig {
    MeshConfig {
        ice_servers: vec![],
        stale_peer_timeout_ms: 50,
        ..Default::default()
    }
}

pub struct Harness {
    pub mesh: MeshCoordinator,
    pub relay: Arc<ScriptedRelay>,
    pub endpoint: RelayEndpoint,
    pub connector: Arc<FakeConnector>,
    pub devices: Arc<FakeDevices>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_devices(FakeDevices::new())
    }

    pub fn with_devices(devices: Arc<FakeDevices>) -> Self {
        Self::build(fast_config(), devices)
    }

    pub fn with_config(config: MeshConfig) -> Self {
        Self::build(config, FakeDevices::new())
    }

    fn build(config: MeshConfig, devices: Arc<FakeDevices>) -> Self {
        let (relay, endpoint) = ScriptedRelay::new();
        let connector = FakeConnector::new();
        let mesh = MeshCoordinator::new(
            config,
            relay.clone(),
            connector.clone(),
            devices.clone(),
        );
        Self {
            mesh,
            relay,
            endpoint,
            connector,
            devices,
        }
    }

    /// Enable, consume the join frame and take `me` as our session id.
    pub async fn join(&mut self, me: &str) {
        self.mesh
            .enable("room-1".into(), meshcall::LocalIdentity::new("me", "Me"))
            .await
            .expect("enable");
        match self.endpoint.from_client.recv().await {
            Some(ClientMessage::JoinRoom { room_id, .. }) => assert_eq!(room_id.as_str(), "room-1"),
            other => panic!("expected join-room, got {:?}", other),
        }
        self.deliver(RelayMessage::Connected {
            session_id: me.into(),
        })
        .await;
    }

    pub async fn deliver(&mut self, msg: RelayMessage) {
        self.endpoint.to_client.send(msg).await.expect("relay send");
        self.settle().await;
    }

    pub async fn signal(&mut self, from: &str, data: impl Into<SignalData>) {
        self.deliver(RelayMessage::Signal {
            from: from.into(),
            data: data.into(),
        })
        .await;
    }

    /// Run the coordinator until nothing is left to handle.
    pub async fn settle(&mut self) {
        settle(&mut self.mesh).await;
    }

    /// Frames the coordinator sent to the relay since the last call.
    pub fn sent(&mut self) -> Vec<ClientMessage> {
        let mut sent = Vec::new();
        while let Ok(msg) = self.endpoint.from_client.try_recv() {
            sent.push(msg);
        }
        sent
    }

    pub fn connection_ids(&self) -> Vec<String> {
        self.mesh
            .snapshot()
            .connections
            .into_iter()
            .map(|c| c.session_id.to_string())
            .collect()
    }

    pub fn tile_ids(&self) -> Vec<String> {
        self.mesh
            .remote_streams()
            .session_ids()
            .into_iter()
            .map(|id| id.to_string())
            .collect()
    }
}

pub async fn settle(mesh: &mut MeshCoordinator) {
    loop {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        match mesh.try_next_input() {
            Some(input) => mesh.handle(input).await,
            None => break,
        }
    }
}

/// Signals addressed to `to`, in send order.
pub fn signals_to(sent: &[ClientMessage], to: &str) -> Vec<SignalData> {
    sent.iter()
        .filter_map(|msg| match msg {
            ClientMessage::Signal { to: target, data } if target.as_str() == to => {
                Some(data.clone())
            }
            _ => None,
        })
        .collect()
}
