//! Signaling relay.
//!
//! [`RelayRooms`] is the room bookkeeping with no I/O: feed it client frames
//! and it returns the frames to deliver. [`RelayHub`] puts it behind a lock
//! and fans deliveries out to per-client queues; [`RelayServer`] accepts
//! WebSocket clients into a hub and [`LocalRelay`] connects in-process
//! clients to one.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::signaling::{
    ClientMessage, Participant, RelayConnector, RelayMessage, RoomId, SessionId, SignalingChannel,
};

pub type Delivery = (SessionId, RelayMessage);

#[derive(Debug, Default)]
pub struct RelayRooms {
    /// Members of each room in join order.
    rooms: HashMap<RoomId, Vec<Participant>>,
    membership: HashMap<SessionId, RoomId>,
}

impl RelayRooms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, session_id: &SessionId) -> Vec<Delivery> {
        vec![(
            session_id.clone(),
            RelayMessage::Connected {
                session_id: session_id.clone(),
            },
        )]
    }

    pub fn handle(&mut self, from: &SessionId, msg: ClientMessage) -> Vec<Delivery> {
        match msg {
            ClientMessage::JoinRoom {
                room_id,
                user_id,
                name,
            } => self.join(
                room_id,
                Participant {
                    session_id: from.clone(),
                    user_id,
                    name,
                },
            ),
            ClientMessage::Signal { to, data } => {
                let same_room = matches!(
                    (self.membership.get(from), self.membership.get(&to)),
                    (Some(a), Some(b)) if a == b
                );
                if same_room {
                    vec![(
                        to,
                        RelayMessage::Signal {
                            from: from.clone(),
                            data,
                        },
                    )]
                } else {
                    vec![(
                        from.clone(),
                        RelayMessage::Error {
                            message: format!("{} is not in your room", to),
                        },
                    )]
                }
            }
            ClientMessage::LeaveRoom => self.leave(from),
        }
    }

    /// The socket closed.
    pub fn disconnect(&mut self, session_id: &SessionId) -> Vec<Delivery> {
        self.leave(session_id)
    }

    fn join(&mut self, room_id: RoomId, participant: Participant) -> Vec<Delivery> {
        let mut deliveries = self.leave(&participant.session_id);

        let members = self.rooms.entry(room_id.clone()).or_default();
        deliveries.push((
            participant.session_id.clone(),
            RelayMessage::AllUsers(members.clone()),
        ));
        for member in members.iter() {
            deliveries.push((
                member.session_id.clone(),
                RelayMessage::UserJoined(participant.clone()),
            ));
        }
        debug!(room = %room_id, session = %participant.session_id, members = members.len() + 1, "joined room");
        self.membership
            .insert(participant.session_id.clone(), room_id);
        members.push(participant);
        deliveries
    }

    fn leave(&mut self, session_id: &SessionId) -> Vec<Delivery> {
        let Some(room_id) = self.membership.remove(session_id) else {
            return Vec::new();
        };
        let mut deliveries = Vec::new();
        if let Some(members) = self.rooms.get_mut(&room_id) {
            members.retain(|m| &m.session_id != session_id);
            for member in members.iter() {
                deliveries.push((
                    member.session_id.clone(),
                    RelayMessage::UserLeft {
                        session_id: session_id.clone(),
                    },
                ));
            }
            if members.is_empty() {
                self.rooms.remove(&room_id);
            }
        }
        debug!(room = %room_id, session = %session_id, "left room");
        deliveries
    }

    pub fn members(&self, room_id: &RoomId) -> Vec<Participant> {
        self.rooms.get(room_id).cloned().unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[derive(Default)]
struct HubState {
    rooms: RelayRooms,
    clients: HashMap<SessionId, mpsc::Sender<RelayMessage>>,
}

/// Shared relay state for any number of client transports.
#[derive(Clone, Default)]
pub struct RelayHub {
    state: Arc<Mutex<HubState>>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        // Rooms stay consistent even if a holder panicked mid-dispatch.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, session_id: SessionId, tx: mpsc::Sender<RelayMessage>) {
        let mut state = self.lock();
        state.clients.insert(session_id.clone(), tx);
        let deliveries = state.rooms.connect(&session_id);
        dispatch(&state, deliveries);
    }

    pub fn handle(&self, from: &SessionId, msg: ClientMessage) {
        let mut state = self.lock();
        if !state.clients.contains_key(from) {
            return;
        }
        let deliveries = state.rooms.handle(from, msg);
        dispatch(&state, deliveries);
    }

    pub fn unregister(&self, session_id: &SessionId) {
        let mut state = self.lock();
        if state.clients.remove(session_id).is_none() {
            return;
        }
        let deliveries = state.rooms.disconnect(session_id);
        dispatch(&state, deliveries);
    }

    /// Cut a client off without telling its room, the way a dead TCP
    /// connection looks until the relay notices it.
    pub fn sever(&self, session_id: &SessionId) {
        self.lock().clients.remove(session_id);
    }

    pub fn members(&self, room_id: &RoomId) -> Vec<Participant> {
        self.lock().rooms.members(room_id)
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }
}

fn dispatch(state: &HubState, deliveries: Vec<Delivery>) {
    for (to, msg) in deliveries {
        let Some(tx) = state.clients.get(&to) else {
            debug!(session = %to, event = msg.name(), "no client for delivery");
            continue;
        };
        match tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                warn!(session = %to, event = msg.name(), "client queue full; frame dropped")
            }
            Err(TrySendError::Closed(_)) => debug!(session = %to, "client queue closed"),
        }
    }
}

/// In-process relay. Each `connect` yields a channel wired straight into
/// the hub.
#[derive(Clone)]
pub struct LocalRelay {
    hub: RelayHub,
    buffer: usize,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new(RelayHub::new())
    }
}

impl LocalRelay {
    pub fn new(hub: RelayHub) -> Self {
        Self { hub, buffer: 256 }
    }

    pub fn hub(&self) -> &RelayHub {
        &self.hub
    }
}

#[async_trait]
impl RelayConnector for LocalRelay {
    async fn connect(&self, _relay_url: &str) -> Result<SignalingChannel> {
        let (channel, mut endpoint) = SignalingChannel::pair(self.buffer);
        let session_id = SessionId::random();
        self.hub.register(session_id.clone(), endpoint.to_client);

        let hub = self.hub.clone();
        tokio::spawn(async move {
            while let Some(msg) = endpoint.from_client.recv().await {
                hub.handle(&session_id, msg);
            }
            hub.unregister(&session_id);
        });
        Ok(channel)
    }
}

pub struct RelayServer {
    listener: TcpListener,
    hub: RelayHub,
}

impl RelayServer {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            hub: RelayHub::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn hub(&self) -> &RelayHub {
        &self.hub
    }

    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "relay listening");
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            let hub = self.hub.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_client(stream, hub).await {
                    warn!(%peer_addr, error = %e, "relay client failed");
                }
            });
        }
    }
}

async fn serve_client(stream: TcpStream, hub: RelayHub) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();

    let session_id = SessionId::random();
    let (tx, mut rx) = mpsc::channel::<RelayMessage>(256);
    hub.register(session_id.clone(), tx);
    info!(session = %session_id, "relay client connected");

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "failed to encode relay frame");
                    continue;
                }
            };
            if write.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => hub.handle(&session_id, msg),
                Err(e) => debug!(session = %session_id, error = %e, "dropping unparseable client frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(session = %session_id, error = %e, "relay client read failed");
                break;
            }
        }
    }

    hub.unregister(&session_id);
    // A severed client still holds its queue; make sure the writer ends.
    writer.abort();
    info!(session = %session_id, "relay client disconnected");
    Ok(())
}
