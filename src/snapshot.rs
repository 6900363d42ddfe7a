//! Versioned snapshots of a [`Target`]'s state.
//!
//! Snapshots of the same target are compared only through their
//! [`Fingerprint`]: a `(status, revision)` pair. For sessions the revision is
//! the authority's move counter; the lobby has no counter, so its revision is
//! a content hash.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::protocol::{BoardState, LobbyData, Session, SessionId, SessionStatus};

/// The unit of subscription: the lobby or one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Lobby,
    Session(SessionId),
}

impl Target {
    /// Returns `true` for [`Target::Lobby`].
    pub fn is_lobby(&self) -> bool {
        matches!(self, Self::Lobby)
    }

    /// The session id, if this target names a session.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::Lobby => None,
            Self::Session(id) => Some(*id),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lobby => f.write_str("lobby"),
            Self::Session(id) => write!(f, "session:{id}"),
        }
    }
}

/// The comparable part of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub status: SessionStatus,
    pub revision: u64,
}

impl Fingerprint {
    pub fn new(status: SessionStatus, revision: u64) -> Self {
        Self { status, revision }
    }

    /// Returns `true` if `self` is strictly newer than `previous`, comparing
    /// `(status rank, revision)` lexicographically. Equal pairs never
    /// supersede each other, so the first observation wins.
    pub fn supersedes(&self, previous: &Fingerprint) -> bool {
        (self.status.rank(), self.revision) > (previous.status.rank(), previous.revision)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.status, self.revision)
    }
}

/// The viewer's active session as seen from the lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActiveGame {
    Idle,
    Playing(SessionId),
}

/// Target-specific snapshot content.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Session {
        session: Box<Session>,
        /// `None` when the source sent only the session header.
        board: Option<BoardState>,
    },
    Lobby {
        lobby: Box<LobbyData>,
        /// `None` when the source did not report the viewer's active session.
        active: Option<ActiveGame>,
    },
}

/// An immutable view of a target at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    target: Target,
    fingerprint: Fingerprint,
    payload: Payload,
}

impl Snapshot {
    /// A session snapshot, optionally with its board detail.
    pub fn session(session: Session, board: Option<BoardState>) -> Self {
        Self {
            target: Target::Session(session.id),
            fingerprint: Fingerprint::new(session.status, session.move_count),
            payload: Payload::Session {
                session: Box::new(session),
                board,
            },
        }
    }

    /// A lobby snapshot, optionally with the viewer's active session.
    pub fn lobby(lobby: LobbyData, active: Option<ActiveGame>) -> Self {
        Self {
            target: Target::Lobby,
            fingerprint: Fingerprint::new(SessionStatus::Active, lobby_revision(&lobby, active)),
            payload: Payload::Lobby {
                lobby: Box::new(lobby),
                active,
            },
        }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Returns `true` once every detail needed for display is present.
    pub fn is_complete(&self) -> bool {
        match &self.payload {
            Payload::Session { board, .. } => board.is_some(),
            Payload::Lobby { active, .. } => active.is_some(),
        }
    }

    /// The session header, for session snapshots.
    pub fn as_session(&self) -> Option<&Session> {
        match &self.payload {
            Payload::Session { session, .. } => Some(session),
            Payload::Lobby { .. } => None,
        }
    }

    /// Attach board detail to a session snapshot. No-op for the lobby.
    #[must_use]
    pub fn with_board(mut self, detail: BoardState) -> Self {
        if let Payload::Session { board, .. } = &mut self.payload {
            *board = Some(detail);
        }
        self
    }

    /// Attach the active session to a lobby snapshot, re-hashing its revision.
    /// No-op for sessions.
    #[must_use]
    pub fn with_active(self, active: ActiveGame) -> Self {
        match self.payload {
            Payload::Lobby { lobby, .. } => Self::lobby(*lobby, Some(active)),
            payload @ Payload::Session { .. } => Self {
                target: self.target,
                fingerprint: self.fingerprint,
                payload,
            },
        }
    }
}

fn lobby_revision(lobby: &LobbyData, active: Option<ActiveGame>) -> u64 {
    let mut hasher = DefaultHasher::new();
    lobby.hash(&mut hasher);
    active.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::protocol::{Color, Player};

    fn session(status: SessionStatus, move_count: u64) -> Session {
        Session {
            id: 7,
            white_player: Player {
                id: 1,
                username: "alice".into(),
            },
            black_player: Player {
                id: 2,
                username: "bob".into(),
            },
            current_turn: Color::White,
            status,
            move_count,
            winner: None,
            outcome: None,
            created_at: None,
            updated_at: None,
            moves: vec![],
        }
    }

    #[test]
    fn higher_revision_supersedes() {
        let old = Fingerprint::new(SessionStatus::Active, 4);
        let new = Fingerprint::new(SessionStatus::Active, 5);
        assert!(new.supersedes(&old));
        assert!(!old.supersedes(&new));
        assert!(!old.supersedes(&old));
    }

    #[test]
    fn terminal_status_supersedes_same_revision() {
        let active = Fingerprint::new(SessionStatus::Active, 9);
        let resigned = Fingerprint::new(SessionStatus::Resigned, 9);
        assert!(resigned.supersedes(&active));
        assert!(!active.supersedes(&resigned));
    }

    #[test]
    fn session_snapshot_uses_move_count() {
        let snap = Snapshot::session(session(SessionStatus::Active, 12), None);
        assert_eq!(snap.target(), Target::Session(7));
        assert_eq!(snap.fingerprint(), Fingerprint::new(SessionStatus::Active, 12));
        assert!(!snap.is_complete());
    }

    #[test]
    fn lobby_revision_tracks_content() {
        let empty = Snapshot::lobby(LobbyData::default(), Some(ActiveGame::Idle));
        let again = Snapshot::lobby(LobbyData::default(), Some(ActiveGame::Idle));
        assert_eq!(empty.fingerprint(), again.fingerprint());

        let playing = Snapshot::lobby(LobbyData::default(), Some(ActiveGame::Playing(3)));
        assert_ne!(empty.fingerprint(), playing.fingerprint());
    }

    #[test]
    fn with_active_completes_lobby() {
        let partial = Snapshot::lobby(LobbyData::default(), None);
        assert!(!partial.is_complete());
        let full = partial.with_active(ActiveGame::Idle);
        assert!(full.is_complete());
        assert_eq!(
            full.fingerprint(),
            Snapshot::lobby(LobbyData::default(), Some(ActiveGame::Idle)).fingerprint()
        );
    }

    #[test]
    fn target_display() {
        assert_eq!(Target::Lobby.to_string(), "lobby");
        assert_eq!(Target::Session(42).to_string(), "session:42");
    }
}
