//! Observable view state.
//!
//! The [`ViewStore`] holds what presentation shows for each mounted target.
//! The sync loop writes merged snapshots into it; view models read it and
//! attach user-facing messages after their own actions.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::protocol::{BoardState, LobbyData, Session, SessionId};
use crate::snapshot::{ActiveGame, Fingerprint, Payload, Snapshot};

/// What the session screen shows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionView {
    pub session: Option<Session>,
    pub board: Option<BoardState>,
    /// Confirmation of the viewer's last action.
    pub message: Option<String>,
    /// Why the viewer's last action failed.
    pub error: Option<String>,
}

impl SessionView {
    pub fn id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|session| session.id)
    }

    /// Returns `true` once the session has a terminal status.
    pub fn is_over(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.status.is_terminal())
    }
}

/// What the lobby screen shows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LobbyView {
    pub lobby: LobbyData,
    pub active: Option<ActiveGame>,
    pub message: Option<String>,
    pub error: Option<String>,
}

/// View state of every mounted target.
#[derive(Debug, Default)]
pub struct ViewStore {
    sessions: Mutex<HashMap<SessionId, SessionView>>,
    lobby: Mutex<Option<LobbyView>>,
}

impl ViewStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn session(&self, id: SessionId) -> Option<SessionView> {
        self.sessions.lock().await.get(&id).cloned()
    }

    pub async fn lobby(&self) -> Option<LobbyView> {
        self.lobby.lock().await.clone()
    }

    /// Replace the data part of a view with `snapshot`, keeping its messages.
    /// Returns the updated view.
    pub(crate) async fn apply(&self, snapshot: &Snapshot) -> ViewUpdate {
        match snapshot.payload() {
            Payload::Session { session, board } => {
                let mut sessions = self.sessions.lock().await;
                let view = sessions.entry(session.id).or_default();
                view.session = Some(session.as_ref().clone());
                if board.is_some() {
                    view.board.clone_from(board);
                }
                ViewUpdate::Session(Box::new(view.clone()))
            }
            Payload::Lobby { lobby, active } => {
                let mut slot = self.lobby.lock().await;
                let view = slot.get_or_insert_with(LobbyView::default);
                view.lobby = lobby.as_ref().clone();
                if active.is_some() {
                    view.active = *active;
                }
                ViewUpdate::Lobby(Box::new(view.clone()))
            }
        }
    }

    /// Apply a session snapshot outside the sync loop.
    ///
    /// Only views that already exist are written, and only if `snapshot`
    /// supersedes the session they show. The check and the write happen
    /// under one lock. Returns `None` when nothing was written.
    pub(crate) async fn apply_newer(&self, snapshot: &Snapshot) -> Option<SessionView> {
        let Payload::Session { session, board } = snapshot.payload() else {
            return None;
        };
        let mut sessions = self.sessions.lock().await;
        let view = sessions.get_mut(&session.id)?;
        if let Some(shown) = &view.session {
            let shown = Fingerprint::new(shown.status, shown.move_count);
            if !snapshot.fingerprint().supersedes(&shown) {
                return None;
            }
        }
        view.session = Some(session.as_ref().clone());
        if board.is_some() {
            view.board.clone_from(board);
        }
        Some(view.clone())
    }

    /// Mutate a mounted session's view in place. Returns `None` if the
    /// session has no view.
    pub(crate) async fn update_session<F>(&self, id: SessionId, f: F) -> Option<SessionView>
    where
        F: FnOnce(&mut SessionView),
    {
        let mut sessions = self.sessions.lock().await;
        let view = sessions.get_mut(&id)?;
        f(view);
        Some(view.clone())
    }

    pub(crate) async fn update_lobby<F>(&self, f: F) -> Option<LobbyView>
    where
        F: FnOnce(&mut LobbyView),
    {
        let mut slot = self.lobby.lock().await;
        let view = slot.as_mut()?;
        f(view);
        Some(view.clone())
    }

    pub(crate) async fn remove_session(&self, id: SessionId) {
        self.sessions.lock().await.remove(&id);
    }

    pub(crate) async fn remove_lobby(&self) {
        *self.lobby.lock().await = None;
    }
}

/// Result of [`ViewStore::apply`].
#[derive(Debug, Clone)]
pub(crate) enum ViewUpdate {
    Session(Box<SessionView>),
    Lobby(Box<LobbyView>),
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
    use crate::protocol::{Color, Player, SessionStatus};

    fn session(move_count: u64) -> Session {
        Session {
            id: 4,
            white_player: Player {
                id: 1,
                username: "alice".into(),
            },
            black_player: Player {
                id: 2,
                username: "bob".into(),
            },
            current_turn: Color::White,
            status: SessionStatus::Active,
            move_count,
            winner: None,
            outcome: None,
            created_at: None,
            updated_at: None,
            moves: vec![],
        }
    }

    #[tokio::test]
    async fn apply_keeps_messages() {
        let store = ViewStore::new();
        store.apply(&Snapshot::session(session(0), None)).await;
        store
            .update_session(4, |view| view.message = Some("Move made: e2 to e4".into()))
            .await
            .unwrap();

        store.apply(&Snapshot::session(session(1), None)).await;

        let view = store.session(4).await.unwrap();
        assert_eq!(view.session.unwrap().move_count, 1);
        assert_eq!(view.message.as_deref(), Some("Move made: e2 to e4"));
    }

    #[tokio::test]
    async fn apply_newer_never_moves_a_view_backwards() {
        let store = ViewStore::new();
        store.apply(&Snapshot::session(session(6), None)).await;

        assert!(store.apply_newer(&Snapshot::session(session(5), None)).await.is_none());
        assert!(store.apply_newer(&Snapshot::session(session(6), None)).await.is_none());
        assert_eq!(store.session(4).await.unwrap().session.unwrap().move_count, 6);

        let view = store.apply_newer(&Snapshot::session(session(7), None)).await.unwrap();
        assert_eq!(view.session.unwrap().move_count, 7);
    }

    #[tokio::test]
    async fn released_views_are_not_recreated() {
        let store = ViewStore::new();
        store.apply(&Snapshot::session(session(2), None)).await;
        store.remove_session(4).await;

        let late = store
            .update_session(4, |view| view.error = Some("Not your turn".into()))
            .await;
        assert!(late.is_none());
        assert!(store.apply_newer(&Snapshot::session(session(3), None)).await.is_none());
        assert!(store.session(4).await.is_none());

        assert!(store.update_lobby(|view| view.message = None).await.is_none());
        assert!(store.lobby().await.is_none());
    }

    #[tokio::test]
    async fn removed_views_are_gone() {
        let store = ViewStore::new();
        store.apply(&Snapshot::session(session(0), None)).await;
        store.apply(&Snapshot::lobby(LobbyData::default(), Some(ActiveGame::Idle))).await;

        store.remove_session(4).await;
        store.remove_lobby().await;

        assert!(store.session(4).await.is_none());
        assert!(store.lobby().await.is_none());
    }
}
