//! Session storage for one orchestrator

use std::collections::BTreeMap;

use super::client::{ClientSession, SessionState};
use super::control::SessionId;

/// Sessions keyed by id, plus the count of those feeding the stream.
///
/// Lives behind the orchestrator's session lock.
#[derive(Default)]
pub(crate) struct SessionArena {
    pub(crate) sessions: BTreeMap<SessionId, ClientSession>,
    pub(crate) active_count: usize,
    next_id: u64,
}

impl SessionArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh id. Ids are never reused.
    pub(crate) fn next_id(&mut self) -> SessionId {
        self.next_id += 1;
        SessionId(self.next_id)
    }

    pub(crate) fn insert(&mut self, session: ClientSession) {
        self.sessions.insert(session.id(), session);
    }

    pub(crate) fn remove(&mut self, id: SessionId) -> Option<ClientSession> {
        self.sessions.remove(&id)
    }

    pub(crate) fn get(&self, id: SessionId) -> Option<&ClientSession> {
        self.sessions.get(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop finished sessions. Returns how many went.
    pub(crate) fn reap_finished(&mut self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|id, session| {
            if session.is_finished() {
                tracing::debug!(session = %id, "Removing finished session");
                false
            } else {
                true
            }
        });
        let removed = before - self.sessions.len();
        if removed > 0 {
            tracing::info!("Sessions: {} ({} removed)", self.sessions.len(), removed);
        }
        removed
    }

    /// Any session still folding staged audio for a drain
    pub(crate) fn any_draining(&self) -> bool {
        self.sessions
            .values()
            .any(|session| session.state() == SessionState::Draining1)
    }

    /// The only session, if exactly one exists
    pub(crate) fn sole_session_mut(&mut self) -> Option<&mut ClientSession> {
        if self.sessions.len() == 1 {
            self.sessions.values_mut().next()
        } else {
            None
        }
    }
}
