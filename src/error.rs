use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

use crate::signaling::SessionId;

#[derive(Debug, Error)]
pub enum Error {
    /// The relay could not be reached or the socket went away.
    #[error("signaling channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("media permission denied: {0}")]
    PermissionDenied(String),

    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("peer connection already exists for {0}")]
    DuplicateConnection(SessionId),

    #[error("no peer connection for {0}")]
    UnknownPeer(SessionId),

    #[error("negotiation with {session_id} failed: {reason}")]
    NegotiationFailure { session_id: SessionId, reason: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn negotiation(session_id: &SessionId, reason: impl ToString) -> Self {
        Error::NegotiationFailure {
            session_id: session_id.clone(),
            reason: reason.to_string(),
        }
    }

    /// Ordering anomalies the transport may produce by redelivering or
    /// reordering messages. These are logged and dropped, never fatal.
    pub fn is_protocol_anomaly(&self) -> bool {
        matches!(self, Error::DuplicateConnection(_) | Error::UnknownPeer(_))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
