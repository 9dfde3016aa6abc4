pub mod audio;
pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod mesh;
pub mod registry;
pub mod relay;
pub mod room;
pub mod rtc;
pub mod signaling;

pub use crate::audio::SystemDevices;
pub use crate::config::{MediaConstraints, MeshConfig};
pub use crate::connection::{assign_role, ConnectionState, JoinOrder, Role};
pub use crate::error::{Error, Result};
pub use crate::media::{LocalMedia, MediaDevices, MediaKind, MediaSource};
pub use crate::mesh::{MeshCoordinator, MeshHandle, MeshInput, MeshSnapshot, MeshState, PeerSummary};
pub use crate::registry::{InboundTrack, PeerConnector, PeerLink, PeerRegistry};
pub use crate::relay::{LocalRelay, RelayHub, RelayRooms, RelayServer};
pub use crate::room::{RemoteStream, RemoteStreamEntry, RemoteStreams, StreamMap};
pub use crate::rtc::RtcConnector;
pub use crate::signaling::{
    LocalIdentity, Participant, RelayConnector, RoomId, SessionId, SignalingChannel,
    WsRelayConnector,
};
