use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::Result;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub relay_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    /// How long a connection may sit in `Disconnected` before the peer is
    /// dropped from the mesh.
    pub stale_peer_timeout_ms: u64,
    /// Remote ICE candidates held per peer while no remote description is set.
    pub max_pending_candidates: usize,
    pub signaling_buffer: usize,
    pub media: MediaConstraints,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_owned(),
            ice_servers: vec![IceServerConfig {
                urls: vec![DEFAULT_STUN_SERVER.to_owned()],
                ..Default::default()
            }],
            stale_peer_timeout_ms: 10_000,
            max_pending_candidates: 64,
            signaling_buffer: 100,
            media: MediaConstraints::default(),
        }
    }
}

impl MeshConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn stale_peer_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_peer_timeout_ms)
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}
