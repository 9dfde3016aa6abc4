//! Local capture: the stream every peer connection sends, and the
//! controller that owns its hardware lifetime.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::MediaConstraints;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for MediaKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Audio,
        }
    }
}

impl From<MediaKind> for RTPCodecType {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        }
    }
}

#[derive(Clone)]
pub struct LocalTrack {
    pub kind: MediaKind,
    pub track: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    /// Audio is G.711 mu-law at 8 kHz mono; video is VP8 and is written by
    /// whatever camera pipeline the application plugs in.
    pub fn new(kind: MediaKind, stream_id: &str) -> Self {
        let (codec, id) = match kind {
            MediaKind::Audio => (
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_PCMU.to_owned(),
                    clock_rate: 8000,
                    channels: 1,
                    ..Default::default()
                },
                "audio",
            ),
            MediaKind::Video => (
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                "video",
            ),
        };
        Self {
            kind,
            track: Arc::new(TrackLocalStaticSample::new(
                codec,
                id.to_owned(),
                stream_id.to_owned(),
            )),
        }
    }
}

struct LocalMediaInner {
    stream_id: String,
    tracks: Vec<LocalTrack>,
    live: AtomicBool,
    audio_enabled: AtomicBool,
}

/// The local captured stream. Cheap to clone; every clone is a read-only
/// view of the same tracks.
#[derive(Clone)]
pub struct LocalMedia {
    inner: Arc<LocalMediaInner>,
}

impl LocalMedia {
    pub fn new(stream_id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            inner: Arc::new(LocalMediaInner {
                stream_id: stream_id.into(),
                tracks,
                live: AtomicBool::new(true),
                audio_enabled: AtomicBool::new(true),
            }),
        }
    }

    pub fn with_constraints(stream_id: impl Into<String>, constraints: MediaConstraints) -> Self {
        let stream_id = stream_id.into();
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(MediaKind::Audio, &stream_id));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(MediaKind::Video, &stream_id));
        }
        Self::new(stream_id, tracks)
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.inner.tracks
    }

    pub fn track(&self, kind: MediaKind) -> Option<&LocalTrack> {
        self.inner.tracks.iter().find(|t| t.kind == kind)
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::Acquire)
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.inner.audio_enabled.load(Ordering::Acquire)
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.inner.audio_enabled.store(enabled, Ordering::Release);
    }

    fn stop(&self) {
        self.inner.live.store(false, Ordering::Release);
    }

    pub fn ptr_eq(&self, other: &LocalMedia) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMedia")
            .field("stream_id", &self.inner.stream_id)
            .field("tracks", &self.inner.tracks.iter().map(|t| t.kind).collect::<Vec<_>>())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Holds the hardware behind a [`LocalMedia`]. `stop` releases it and must
/// be safe to call more than once.
pub trait CaptureHandle: Send {
    fn stop(&mut self);
}

pub struct Capture {
    pub media: LocalMedia,
    pub handle: Box<dyn CaptureHandle>,
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire the devices the constraints ask for. Fails with
    /// `PermissionDenied` or `DeviceUnavailable`.
    async fn open(&self, constraints: MediaConstraints) -> Result<Capture>;
}

/// Sole owner of the local stream. Every successful `enable` is paired with
/// exactly one release, either an explicit `disable` or drop.
pub struct MediaSource {
    devices: Arc<dyn MediaDevices>,
    constraints: MediaConstraints,
    active: Option<Capture>,
    audio_enabled: bool,
    preview: watch::Sender<Option<LocalMedia>>,
}

impl MediaSource {
    pub fn new(devices: Arc<dyn MediaDevices>, constraints: MediaConstraints) -> Self {
        let (preview, _) = watch::channel(None);
        Self {
            devices,
            constraints,
            active: None,
            audio_enabled: true,
            preview,
        }
    }

    pub async fn enable(&mut self) -> Result<LocalMedia> {
        if let Some(capture) = &self.active {
            return Ok(capture.media.clone());
        }
        if !self.constraints.audio && !self.constraints.video {
            return Err(Error::DeviceUnavailable(
                "neither audio nor video requested".to_string(),
            ));
        }

        let capture = self.devices.open(self.constraints).await?;
        capture.media.set_audio_enabled(self.audio_enabled);
        let media = capture.media.clone();
        info!(stream = media.stream_id(), tracks = media.tracks().len(), "local media enabled");
        self.active = Some(capture);
        self.preview.send_replace(Some(media.clone()));
        Ok(media)
    }

    pub fn disable(&mut self) {
        if let Some(mut capture) = self.active.take() {
            capture.media.stop();
            capture.handle.stop();
            self.preview.send_replace(None);
            info!(stream = capture.media.stream_id(), "local media released");
        }
    }

    pub fn current_stream(&self) -> Option<LocalMedia> {
        self.active.as_ref().map(|c| c.media.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.active.is_some()
    }

    /// Mutes or unmutes the microphone without releasing it.
    pub fn set_audio_enabled(&mut self, enabled: bool) {
        self.audio_enabled = enabled;
        if let Some(capture) = &self.active {
            capture.media.set_audio_enabled(enabled);
        }
        debug!(enabled, "microphone toggled");
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<LocalMedia>> {
        self.preview.subscribe()
    }
}

impl Drop for MediaSource {
    fn drop(&mut self) {
        self.disable();
    }
}
