//! The remote stream surface: one tile per remote participant, observable
//! through a `watch` channel.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::media::MediaKind;
use crate::registry::InboundTrack;
use crate::signaling::{Participant, SessionId};

#[derive(Clone)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<Arc<dyn InboundTrack>>,
}

impl RemoteStream {
    pub fn track(&self, kind: MediaKind) -> Option<&Arc<dyn InboundTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.iter().map(|t| t.id()).collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RemoteStreamEntry {
    pub user_id: String,
    pub display_name: String,
    pub video_enabled: bool,
    /// `None` while the tile is a placeholder.
    pub stream: Option<RemoteStream>,
}

pub type StreamMap = BTreeMap<SessionId, RemoteStreamEntry>;

pub struct RemoteStreams {
    tx: watch::Sender<StreamMap>,
}

impl Default for RemoteStreams {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteStreams {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(StreamMap::new());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamMap> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> StreamMap {
        self.tx.borrow().clone()
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.tx.borrow().contains_key(session_id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.tx.borrow().keys().cloned().collect()
    }

    /// Adds a placeholder tile unless the participant already has one.
    pub(crate) fn show(&self, participant: &Participant) {
        self.tx.send_if_modified(|map| {
            if map.contains_key(&participant.session_id) {
                return false;
            }
            map.insert(
                participant.session_id.clone(),
                RemoteStreamEntry {
                    user_id: participant.user_id.clone(),
                    display_name: participant.name.clone(),
                    video_enabled: false,
                    stream: None,
                },
            );
            true
        });
    }

    /// Returns false when the participant has no tile, e.g. it was dropped
    /// while the track was in flight.
    pub(crate) fn attach_track(&self, session_id: &SessionId, track: Arc<dyn InboundTrack>) -> bool {
        self.tx.send_if_modified(|map| {
            let Some(entry) = map.get_mut(session_id) else {
                return false;
            };
            let stream = entry.stream.get_or_insert_with(|| RemoteStream {
                id: track.stream_id(),
                tracks: Vec::new(),
            });
            let track_id = track.id();
            stream.tracks.retain(|t| t.id() != track_id);
            stream.tracks.push(track);
            entry.video_enabled = true;
            true
        })
    }

    pub(crate) fn remove(&self, session_id: &SessionId) -> bool {
        self.tx
            .send_if_modified(|map| map.remove(session_id).is_some())
    }

    pub(crate) fn clear(&self) {
        self.tx.send_if_modified(|map| {
            let had_entries = !map.is_empty();
            map.clear();
            had_entries
        });
    }
}
