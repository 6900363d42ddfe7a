//! Events delivered to the consumer of a [`SyncClient`](crate::SyncClient).

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{BoardState, Player, PlayerId, Session, SessionId, SessionStatus};
use crate::snapshot::Target;
use crate::view::{LobbyView, SessionView};

/// User-facing notice for a session that ended on the other party's action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalNotice {
    pub session_id: SessionId,
    pub status: SessionStatus,
    /// The other participant, when known.
    pub opponent: Option<Player>,
    message: String,
}

impl TerminalNotice {
    /// Build the notice shown to `viewer`, or `None` if `viewer` initiated the
    /// transition (or the session is not terminal).
    ///
    /// A resignation is announced to the winner. A completed session is
    /// announced to the side to move, i.e. the one who did not make the final
    /// move.
    pub fn for_viewer(
        session: &Session,
        board: Option<&BoardState>,
        viewer: PlayerId,
    ) -> Option<Self> {
        let opponent = session.opponent_of(viewer).cloned();
        let message = match session.status {
            SessionStatus::Active => return None,
            SessionStatus::Resigned => {
                if session.winner_id() != Some(viewer) {
                    return None;
                }
                let name = opponent
                    .as_ref()
                    .map_or("Your opponent", |player| player.username.as_str());
                format!("{name} has resigned. You win!")
            }
            SessionStatus::Completed => {
                if session.color_of(viewer) != Some(session.current_turn) {
                    return None;
                }
                board
                    .and_then(|board| board.result.clone())
                    .filter(|result| !result.is_empty())
                    .unwrap_or_else(|| "Game over".to_string())
            }
        };
        Some(Self {
            session_id: session.id,
            status: session.status,
            opponent,
            message,
        })
    }

    /// Text to show the user.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Events emitted by the sync loop.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A watched session's view changed.
    SessionUpdated(Box<SessionView>),
    /// The lobby view changed.
    LobbyUpdated(Box<LobbyView>),
    /// A watched session ended on the other party's action. Emitted at most
    /// once per subscription, after the session's connection and poller are
    /// torn down.
    SessionEnded(TerminalNotice),
    /// The viewer resigned; the session was torn down without waiting for an
    /// echo from the authority.
    SessionLeft { id: SessionId },
    /// The lobby reported an active session for the viewer.
    ActiveSessionFound { id: SessionId },
    /// The initial load of a target failed; the last state (if any) is kept.
    LoadFailed { target: Target, error: String },
    /// A push connection opened.
    ChannelOpened { target: Target },
    /// A push connection closed on its own.
    ChannelClosed {
        target: Target,
        code: Option<u16>,
        reconnecting: bool,
    },
    /// The sync loop stopped. Always the last event.
    Disconnected { reason: Option<String> },
}

/// Emit an event without blocking the sync loop. If the channel is full the
/// event is dropped with a warning.
pub(crate) fn emit(events: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!(
                "event channel full, dropping event: {:?}",
                std::mem::discriminant(&dropped)
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}

/// Emit an event that must never be lost, waiting for capacity if the
/// channel is full.
///
/// Used for [`SyncEvent::SessionEnded`] and [`SyncEvent::Disconnected`].
/// The sync loop stalls until the consumer drains the channel.
pub(crate) async fn deliver(events: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    if events.send(event).await.is_err() {
        debug!("event channel closed, receiver dropped");
    }
}

/// Emit the final [`SyncEvent::Disconnected`].
pub(crate) async fn emit_disconnected(events: &mpsc::Sender<SyncEvent>, reason: Option<String>) {
    deliver(events, SyncEvent::Disconnected { reason }).await;
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
    use crate::protocol::{Color, ParticipantRef};

    fn session(status: SessionStatus, turn: Color, winner: Option<u64>) -> Session {
        Session {
            id: 9,
            white_player: Player {
                id: 1,
                username: "alice".into(),
            },
            black_player: Player {
                id: 2,
                username: "bob".into(),
            },
            current_turn: turn,
            status,
            move_count: 30,
            winner: winner.map(ParticipantRef::Id),
            outcome: None,
            created_at: None,
            updated_at: None,
            moves: vec![],
        }
    }

    #[test]
    fn resignation_is_announced_to_the_winner_only() {
        let resigned = session(SessionStatus::Resigned, Color::White, Some(2));

        let notice = TerminalNotice::for_viewer(&resigned, None, 2).unwrap();
        assert_eq!(notice.message(), "alice has resigned. You win!");
        assert_eq!(notice.opponent.unwrap().id, 1);

        assert!(TerminalNotice::for_viewer(&resigned, None, 1).is_none());
    }

    #[test]
    fn completion_is_announced_to_the_side_to_move() {
        let mated = session(SessionStatus::Completed, Color::Black, Some(1));
        let board = BoardState {
            board_dict: Default::default(),
            current_turn: Color::Black,
            is_my_turn: true,
            is_game_over: true,
            result: Some("Checkmate! White wins.".into()),
        };

        let notice = TerminalNotice::for_viewer(&mated, Some(&board), 2).unwrap();
        assert_eq!(notice.message(), "Checkmate! White wins.");
        assert!(TerminalNotice::for_viewer(&mated, Some(&board), 1).is_none());

        let without_board = TerminalNotice::for_viewer(&mated, None, 2).unwrap();
        assert_eq!(without_board.message(), "Game over");
    }

    #[test]
    fn active_sessions_have_no_notice() {
        let active = session(SessionStatus::Active, Color::White, None);
        assert!(TerminalNotice::for_viewer(&active, None, 1).is_none());
        assert!(TerminalNotice::for_viewer(&active, None, 2).is_none());
    }

    #[tokio::test]
    async fn full_channel_drops_but_disconnected_waits() {
        let (tx, mut rx) = mpsc::channel(1);
        emit(&tx, SyncEvent::SessionLeft { id: 1 });
        emit(&tx, SyncEvent::SessionLeft { id: 2 });

        let sender = tokio::spawn(async move { emit_disconnected(&tx, None).await });

        assert!(matches!(rx.recv().await, Some(SyncEvent::SessionLeft { id: 1 })));
        assert!(matches!(
            rx.recv().await,
            Some(SyncEvent::Disconnected { reason: None })
        ));
        sender.await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn delivered_notice_waits_for_room() {
        let (tx, mut rx) = mpsc::channel(1);
        emit(&tx, SyncEvent::SessionLeft { id: 1 });

        let resigned = session(SessionStatus::Resigned, Color::White, Some(2));
        let notice = TerminalNotice::for_viewer(&resigned, None, 2).unwrap();
        let sender =
            tokio::spawn(async move { deliver(&tx, SyncEvent::SessionEnded(notice)).await });

        assert!(matches!(rx.recv().await, Some(SyncEvent::SessionLeft { id: 1 })));
        match rx.recv().await {
            Some(SyncEvent::SessionEnded(notice)) => {
                assert_eq!(notice.message(), "alice has resigned. You win!");
            }
            other => panic!("expected the terminal notice, got {other:?}"),
        }
        sender.await.unwrap();
    }
}
