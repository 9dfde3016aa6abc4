use std::collections::HashMap;

use crate::connection::{assign_role, JoinOrder, Role};
use crate::signaling::{Participant, SessionId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub participant: Participant,
    pub order: JoinOrder,
}

impl RosterEntry {
    /// Our side of the pair this entry forms with the local participant.
    pub fn role(&self) -> Role {
        assign_role(JoinOrder::LOCAL, self.order).unwrap_or(Role::Responder)
    }
}

/// Remote participants currently in the room, keyed by session id. Never
/// contains the local session.
#[derive(Debug, Default)]
pub struct Roster {
    entries: HashMap<SessionId, RosterEntry>,
    local: Option<SessionId>,
    earliest: i64,
    latest: i64,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the session id the relay gave us, evicting it if a roster
    /// already listed it.
    pub fn set_local(&mut self, session_id: SessionId) -> bool {
        let evicted = self.entries.remove(&session_id).is_some();
        self.local = Some(session_id);
        evicted
    }

    pub fn local(&self) -> Option<&SessionId> {
        self.local.as_ref()
    }

    /// Someone who was already in the room when we joined.
    pub fn admit_existing(&mut self, participant: Participant) -> bool {
        let order = JoinOrder(self.earliest - 1);
        let admitted = self.admit(participant, order);
        if admitted {
            self.earliest = order.0;
        }
        admitted
    }

    /// Someone who joined after us.
    pub fn admit_joined(&mut self, participant: Participant) -> bool {
        let order = JoinOrder(self.latest + 1);
        let admitted = self.admit(participant, order);
        if admitted {
            self.latest = order.0;
        }
        admitted
    }

    /// Redelivered announcements keep the original order; the display
    /// fields are refreshed.
    fn admit(&mut self, participant: Participant, order: JoinOrder) -> bool {
        if self.local.as_ref() == Some(&participant.session_id) {
            return false;
        }
        if let Some(entry) = self.entries.get_mut(&participant.session_id) {
            entry.participant = participant;
            return false;
        }
        self.entries.insert(
            participant.session_id.clone(),
            RosterEntry { participant, order },
        );
        true
    }

    pub fn remove(&mut self, session_id: &SessionId) -> Option<RosterEntry> {
        self.entries.remove(session_id)
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&RosterEntry> {
        self.entries.get(session_id)
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.entries.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in join order.
    pub fn entries(&self) -> Vec<&RosterEntry> {
        let mut entries: Vec<&RosterEntry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.order);
        entries
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.entries()
            .into_iter()
            .map(|entry| entry.participant.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.local = None;
        self.earliest = 0;
        self.latest = 0;
    }
}
