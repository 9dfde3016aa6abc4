//! Relay protocol types and the client side of the signaling channel.
//!
//! Frames are JSON text messages of the form `{"event": ..., "data": ...}`.
//! The channel never looks inside `signal` payloads; it only moves them.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Transient identifier the relay assigns to each socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Who we are, as supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub user_id: String,
    pub name: String,
}

impl LocalIdentity {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub session_id: SessionId,
    pub user_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Opaque negotiation payload carried by `signal` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalData {
    Sdp { sdp: SessionDescription },
    Candidate { candidate: IceCandidate },
}

impl SignalData {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalData::Sdp { sdp } => match sdp.kind {
                SdpKind::Offer => "offer",
                SdpKind::Answer => "answer",
                SdpKind::Pranswer => "pranswer",
                SdpKind::Rollback => "rollback",
            },
            SignalData::Candidate { .. } => "candidate",
        }
    }
}

impl From<SessionDescription> for SignalData {
    fn from(sdp: SessionDescription) -> Self {
        SignalData::Sdp { sdp }
    }
}

impl From<IceCandidate> for SignalData {
    fn from(candidate: IceCandidate) -> Self {
        SignalData::Candidate { candidate }
    }
}

/// Frames sent by a client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: RoomId,
        user_id: String,
        name: String,
    },
    Signal {
        to: SessionId,
        data: SignalData,
    },
    LeaveRoom,
}

/// Frames sent by the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RelayMessage {
    /// First frame on every socket: the id the relay assigned to it.
    #[serde(rename_all = "camelCase")]
    Connected { session_id: SessionId },
    AllUsers(Vec<Participant>),
    UserJoined(Participant),
    #[serde(rename_all = "camelCase")]
    UserLeft { session_id: SessionId },
    Signal {
        from: SessionId,
        data: SignalData,
    },
    Error {
        message: String,
    },
}

impl RelayMessage {
    pub fn name(&self) -> &'static str {
        match self {
            RelayMessage::Connected { .. } => "connected",
            RelayMessage::AllUsers(_) => "all-users",
            RelayMessage::UserJoined(_) => "user-joined",
            RelayMessage::UserLeft { .. } => "user-left",
            RelayMessage::Signal { .. } => "signal",
            RelayMessage::Error { .. } => "error",
        }
    }
}

/// The relay's side of an in-process channel made by [`SignalingChannel::pair`].
pub struct RelayEndpoint {
    pub from_client: mpsc::Receiver<ClientMessage>,
    pub to_client: mpsc::Sender<RelayMessage>,
}

pub struct SignalingChannel {
    outgoing: Option<mpsc::Sender<ClientMessage>>,
    incoming: mpsc::Receiver<RelayMessage>,
    reader: Option<JoinHandle<()>>,
    closed: bool,
}

impl SignalingChannel {
    pub fn from_parts(
        outgoing: mpsc::Sender<ClientMessage>,
        incoming: mpsc::Receiver<RelayMessage>,
    ) -> Self {
        Self {
            outgoing: Some(outgoing),
            incoming,
            reader: None,
            closed: false,
        }
    }

    /// In-process channel with no socket behind it.
    pub fn pair(capacity: usize) -> (Self, RelayEndpoint) {
        let (client_tx, client_rx) = mpsc::channel(capacity);
        let (relay_tx, relay_rx) = mpsc::channel(capacity);
        (
            Self::from_parts(client_tx, relay_rx),
            RelayEndpoint {
                from_client: client_rx,
                to_client: relay_tx,
            },
        )
    }

    pub async fn join_room(&self, room_id: &RoomId, identity: &LocalIdentity) -> Result<()> {
        self.send(ClientMessage::JoinRoom {
            room_id: room_id.clone(),
            user_id: identity.user_id.clone(),
            name: identity.name.clone(),
        })
        .await
    }

    /// Best effort: a send that reaches the relay is not acknowledged.
    pub async fn send_signal(&self, to: &SessionId, data: SignalData) -> Result<()> {
        self.send(ClientMessage::Signal {
            to: to.clone(),
            data,
        })
        .await
    }

    pub async fn send(&self, msg: ClientMessage) -> Result<()> {
        let tx = self
            .outgoing
            .as_ref()
            .ok_or_else(|| Error::ChannelUnavailable("channel disconnected".to_string()))?;
        tx.send(msg)
            .await
            .map_err(|e| Error::ChannelUnavailable(format!("failed to send message: {}", e)))
    }

    /// Next relay event, or `None` once the relay went away or
    /// [`disconnect`](Self::disconnect) was called.
    pub async fn recv(&mut self) -> Option<RelayMessage> {
        if self.closed {
            return None;
        }
        self.incoming.recv().await
    }

    /// Non-blocking [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> std::result::Result<RelayMessage, TryRecvError> {
        if self.closed {
            return Err(TryRecvError::Disconnected);
        }
        self.incoming.try_recv()
    }

    pub fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Dropping the sender lets the writer flush and close the socket.
        self.outgoing = None;
        self.incoming.close();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        debug!("signaling channel disconnected");
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Opens signaling channels. The coordinator only sees this seam, so the
/// relay transport can be swapped without touching the mesh logic.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, relay_url: &str) -> Result<SignalingChannel>;
}

pub struct WsRelayConnector {
    buffer: usize,
}

impl WsRelayConnector {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
        }
    }
}

impl Default for WsRelayConnector {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl RelayConnector for WsRelayConnector {
    async fn connect(&self, relay_url: &str) -> Result<SignalingChannel> {
        let (ws_stream, _) = connect_async(relay_url)
            .await
            .map_err(|e| Error::ChannelUnavailable(format!("{}: {}", relay_url, e)))?;
        info!(relay = relay_url, "connected to signaling relay");

        let (mut write, mut read) = ws_stream.split();
        let (tx, rx) = mpsc::channel(self.buffer);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ClientMessage>(self.buffer);

        // Handle outgoing messages
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "failed to encode client frame");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!(error = %e, "relay write failed");
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Handle incoming messages
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RelayMessage>(&text) {
                        Ok(msg) => {
                            if tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping unparseable relay frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "relay read failed");
                        break;
                    }
                }
            }
            debug!("relay reader finished");
        });

        let mut channel = SignalingChannel::from_parts(outgoing_tx, rx);
        channel.reader = Some(reader);
        Ok(channel)
    }
}
