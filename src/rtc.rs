//! [`PeerConnector`] backed by webrtc-rs.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::MeshConfig;
use crate::connection::ConnectionState;
use crate::error::{Error, Result};
use crate::media::{LocalMedia, MediaKind};
use crate::registry::{InboundTrack, PeerConnector, PeerEventKind, PeerEventSink, PeerLink};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};

pub struct RtcConnector {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcConnector {
    pub fn new(config: &MeshConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: config.rtc_ice_servers(),
        })
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(&self, events: PeerEventSink) -> Result<Arc<dyn PeerLink>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(self.api.new_peer_connection(config).await?);
        wire_callbacks(&peer_connection, &events);
        Ok(Arc::new(RtcPeerLink {
            peer_connection,
            events,
        }))
    }
}

fn wire_callbacks(peer_connection: &RTCPeerConnection, events: &PeerEventSink) {
    let sink = events.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            // `None` marks the end of gathering.
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    sink.emit(PeerEventKind::LocalCandidate(init.into()));
                }
                Err(e) => warn!(peer = %sink.session_id(), error = %e, "failed to serialize ICE candidate"),
            }
        })
    }));

    let sink = events.clone();
    peer_connection.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            let sink = sink.clone();
            Box::pin(async move {
                info!(
                    peer = %sink.session_id(),
                    track = %track.id(),
                    kind = %track.kind(),
                    "remote track arrived"
                );
                sink.emit(PeerEventKind::Track(Arc::new(RtcInboundTrack { track })));
            })
        },
    ));

    let sink = events.clone();
    peer_connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let sink = sink.clone();
        Box::pin(async move {
            debug!(peer = %sink.session_id(), state = %s, "peer connection state changed");
            sink.emit(PeerEventKind::StateChanged(ConnectionState::from(s)));
        })
    }));

    let sink = events.clone();
    peer_connection.on_negotiation_needed(Box::new(move || {
        let sink = sink.clone();
        Box::pin(async move {
            sink.emit(PeerEventKind::NegotiationNeeded);
        })
    }));
}

pub struct RtcPeerLink {
    peer_connection: Arc<RTCPeerConnection>,
    events: PeerEventSink,
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn attach_media(&self, media: Option<&LocalMedia>) -> Result<()> {
        for kind in [MediaKind::Audio, MediaKind::Video] {
            match media.and_then(|m| m.track(kind)) {
                Some(local) => {
                    let sender = self
                        .peer_connection
                        .add_track(Arc::clone(&local.track) as Arc<dyn TrackLocal + Send + Sync>)
                        .await?;
                    // Read incoming RTCP packets so the interceptors keep running.
                    tokio::spawn(async move {
                        let mut rtcp_buf = vec![0u8; 1500];
                        while sender.read(&mut rtcp_buf).await.is_ok() {}
                    });
                }
                None => {
                    self.peer_connection
                        .add_transceiver_from_kind(
                            kind.into(),
                            Some(RTCRtpTransceiverInit {
                                direction: RTCRtpTransceiverDirection::Recvonly,
                                send_encodings: vec![],
                            }),
                        )
                        .await?;
                }
            }
        }
        debug!(peer = %self.events.session_id(), sending = media.is_some(), "media attached");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await?;
        from_rtc(answer)
    }

    async fn apply_remote(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc(description)?;
        self.peer_connection
            .set_remote_description(description)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(candidate.into())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection.close().await?;
        Ok(())
    }
}

pub struct RtcInboundTrack {
    track: Arc<TrackRemote>,
}

#[async_trait]
impl InboundTrack for RtcInboundTrack {
    fn id(&self) -> String {
        self.track.id()
    }

    fn stream_id(&self) -> String {
        self.track.stream_id()
    }

    fn kind(&self) -> MediaKind {
        self.track.kind().into()
    }

    async fn read_payload(&self) -> Option<Bytes> {
        match self.track.read_rtp().await {
            Ok((packet, _)) => Some(packet.payload),
            Err(e) => {
                debug!(track = %self.track.id(), error = %e, "remote track ended");
                None
            }
        }
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
    let sdp = description.sdp;
    let rtc = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(sdp)?,
        SdpKind::Rollback => {
            return Err(Error::InvalidState(
                "rollback descriptions are not supported".to_string(),
            ))
        }
    };
    Ok(rtc)
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(Error::InvalidState(
                "local description has no type".to_string(),
            ))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}
