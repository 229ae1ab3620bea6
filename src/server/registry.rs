use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::game::rules::Position;
use crate::models::{ConnId, ParticipantId, Session, SessionId, SessionSummary};

/// Owns every live session, keyed by id. Nothing outside the registry
/// holds a `Session` reference across a suspension point; timer callbacks
/// always re-look-up by id and treat a miss as a benign race.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Allocate an id and insert a fresh session. The caller is expected
    /// to start the first turn's clock immediately.
    pub fn create(
        &mut self,
        white: (ParticipantId, ConnId),
        black: (ParticipantId, ConnId),
        position: Position,
        allotment: Duration,
        now: Instant,
    ) -> &mut Session {
        let id = Uuid::new_v4();
        self.sessions
            .entry(id)
            .or_insert_with(|| Session::new(id, white, black, position, allotment, now))
    }

    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    /// Safe on ids that no longer exist.
    pub fn remove(&mut self, id: &SessionId) -> Option<Session> {
        self.sessions.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SessionId, &Session)> {
        self.sessions.iter()
    }

    /// Whether this connection belongs to a connected participant of a
    /// still-active session (such a client must not re-enter matchmaking).
    pub fn is_playing(&self, conn: ConnId) -> bool {
        self.sessions.values().any(|session| {
            session.is_active()
                && session
                    .participants()
                    .iter()
                    .any(|p| p.conn == conn && p.is_connected())
        })
    }

    /// The session (if any) whose participant currently carries this
    /// transport ref.
    pub fn find_session_of_conn(&self, conn: ConnId) -> Option<SessionId> {
        self.sessions
            .iter()
            .find(|(_, session)| session.participants().iter().any(|p| p.conn == conn))
            .map(|(id, _)| *id)
    }

    /// Live snapshot of watchable sessions: active, both sides connected.
    /// Order is unspecified.
    pub fn list_active(&self) -> Vec<SessionSummary> {
        self.sessions
            .iter()
            .filter(|(_, session)| session.is_active() && session.both_connected())
            .map(|(id, session)| SessionSummary {
                id: *id,
                name: session.display_name(),
                moves: session.history.len(),
            })
            .collect()
    }
}
