#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Protocol parsing tests.
//!
//! Verifies that authority JSON (session headers, board detail, lobby data,
//! write responses and push envelopes) decodes into the client's types the way
//! the sync engine expects.

use gambit_sync::protocol::{
    is_intentional_close, BoardState, ChallengeAccepted, ChallengeStatus, Color, LobbyData,
    MoveAccepted, Outcome, ParticipantRef, PushMessage, Session, SessionStatus,
};
use gambit_sync::snapshot::{ActiveGame, Fingerprint, Snapshot, Target};
use gambit_sync::SyncError;
use serde_json::json;

fn header(status: &str, move_count: u64, winner: serde_json::Value) -> serde_json::Value {
    json!({
        "id": 12,
        "white_player": { "id": 1, "username": "alice" },
        "black_player": { "id": 2, "username": "bob" },
        "current_turn": "black",
        "status": status,
        "move_count": move_count,
        "winner": winner,
        "outcome": null,
        "created_at": "2026-03-01T10:00:00Z",
        "updated_at": "2026-03-01T10:05:00Z",
        "moves": [
            { "from_square": "e2", "to_square": "e4", "piece": "P", "notation": "e4" }
        ]
    })
}

// ════════════════════════════════════════════════════════════════════
// Session headers
// ════════════════════════════════════════════════════════════════════

#[test]
fn active_session_header_parses() {
    let session: Session = serde_json::from_value(header("active", 1, json!(null))).unwrap();
    assert_eq!(session.id, 12);
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.current_turn, Color::Black);
    assert_eq!(session.move_count, 1);
    assert_eq!(session.moves.len(), 1);
    assert_eq!(session.winner_id(), None);
    assert_eq!(session.color_of(1), Some(Color::White));
    assert_eq!(session.color_of(9), None);
    assert_eq!(session.opponent_of(2).map(|p| p.username.as_str()), Some("alice"));
}

#[test]
fn winner_may_be_inlined_or_a_bare_id() {
    let inlined: Session =
        serde_json::from_value(header("resigned", 4, json!({ "id": 2, "username": "bob" })))
            .unwrap();
    assert!(matches!(inlined.winner, Some(ParticipantRef::Full(_))));
    assert_eq!(inlined.winner_id(), Some(2));

    let bare: Session = serde_json::from_value(header("resigned", 4, json!(1))).unwrap();
    assert_eq!(bare.winner, Some(ParticipantRef::Id(1)));
    assert_eq!(bare.winner_id(), Some(1));
}

#[test]
fn outcome_uses_snake_case() {
    let mut value = header("completed", 20, json!(1));
    value["outcome"] = json!("white_wins");
    let session: Session = serde_json::from_value(value).unwrap();
    assert_eq!(session.outcome, Some(Outcome::WhiteWins));
    assert!(session.status.is_terminal());
}

#[test]
fn optional_header_fields_may_be_absent() {
    let session: Session = serde_json::from_value(json!({
        "id": 3,
        "white_player": { "id": 1, "username": "alice" },
        "black_player": { "id": 2, "username": "bob" },
        "current_turn": "white",
        "status": "active",
        "move_count": 0
    }))
    .unwrap();
    assert!(session.moves.is_empty());
    assert!(session.created_at.is_none());
}

#[test]
fn unknown_status_is_an_error() {
    let result = serde_json::from_value::<Session>(header("paused", 0, json!(null)));
    assert!(result.is_err());
}

#[test]
fn status_rank_orders_lifecycle() {
    assert!(SessionStatus::Active.rank() < SessionStatus::Completed.rank());
    assert!(SessionStatus::Active.rank() < SessionStatus::Resigned.rank());
    assert!(!SessionStatus::Active.is_terminal());
}

// ════════════════════════════════════════════════════════════════════
// Board, lobby and write responses
// ════════════════════════════════════════════════════════════════════

#[test]
fn board_state_parses_result() {
    let board: BoardState = serde_json::from_value(json!({
        "board_dict": { "e4": "P", "e8": "k" },
        "current_turn": "black",
        "is_my_turn": false,
        "is_game_over": true,
        "result": "Checkmate! White wins"
    }))
    .unwrap();
    assert_eq!(board.board_dict.get("e4").map(String::as_str), Some("P"));
    assert!(board.is_game_over);
    assert_eq!(board.result.as_deref(), Some("Checkmate! White wins"));
}

#[test]
fn lobby_history_keeps_only_finished_sessions() {
    let active: Session = serde_json::from_value(header("active", 3, json!(null))).unwrap();
    let finished: Session = serde_json::from_value(header("completed", 30, json!(2))).unwrap();
    let lobby = LobbyData::new(vec![], vec![], vec![active, finished]);
    assert_eq!(lobby.game_history.len(), 1);
    assert_eq!(lobby.game_history[0].status, SessionStatus::Completed);
}

#[test]
fn move_response_uses_game_key() {
    let accepted: MoveAccepted = serde_json::from_value(json!({
        "success": true,
        "message": "Move made: e2 to e4",
        "game": header("active", 1, json!(null))
    }))
    .unwrap();
    assert_eq!(accepted.session.move_count, 1);
    assert_eq!(accepted.message, "Move made: e2 to e4");
}

#[test]
fn challenge_accept_response_carries_session() {
    let accepted: ChallengeAccepted = serde_json::from_value(json!({
        "success": true,
        "message": "Challenge accepted",
        "challenge": {
            "id": 5,
            "challenger": { "id": 2, "username": "bob" },
            "challenged": { "id": 1, "username": "alice" },
            "status": "accepted"
        },
        "game": header("active", 0, json!(null))
    }))
    .unwrap();
    assert_eq!(
        accepted.challenge.as_ref().map(|c| c.status),
        Some(ChallengeStatus::Accepted)
    );
    assert_eq!(accepted.session.map(|s| s.id), Some(12));
}

// ════════════════════════════════════════════════════════════════════
// Push envelopes
// ════════════════════════════════════════════════════════════════════

#[test]
fn session_refresh_with_board() {
    let text = json!({
        "action": "game_refresh",
        "data": {
            "game": header("active", 2, json!(null)),
            "board_state": {
                "board_dict": {},
                "current_turn": "white",
                "is_my_turn": true,
                "is_game_over": false
            }
        }
    })
    .to_string();
    let PushMessage::SessionRefresh(refresh) = PushMessage::parse(&text, false).unwrap() else {
        panic!("expected session refresh");
    };
    assert_eq!(refresh.session.move_count, 2);
    assert!(refresh.board.is_some());
}

#[test]
fn session_refresh_header_only() {
    let text = json!({
        "action": "refresh",
        "data": { "game": header("resigned", 6, json!(1)) }
    })
    .to_string();
    let PushMessage::SessionRefresh(refresh) = PushMessage::parse(&text, false).unwrap() else {
        panic!("expected session refresh");
    };
    assert!(refresh.board.is_none());
    let snapshot = Snapshot::session(refresh.session, refresh.board);
    assert!(!snapshot.is_complete());
    assert_eq!(
        snapshot.fingerprint(),
        Fingerprint::new(SessionStatus::Resigned, 6)
    );
}

#[test]
fn refresh_without_usable_data_becomes_reload() {
    for text in [
        r#"{"action":"reload"}"#,
        r#"{"action":"refresh"}"#,
        r#"{"action":"refresh","data":null}"#,
        r#"{"action":"game_refresh","data":{"board_state":null}}"#,
    ] {
        assert!(
            matches!(PushMessage::parse(text, false).unwrap(), PushMessage::Reload),
            "{text}"
        );
    }
}

#[test]
fn lobby_refresh_filters_history() {
    let text = json!({
        "action": "lobby_refresh",
        "data": {
            "available_players": [{ "id": 3, "username": "carol" }],
            "pending_challenges": [],
            "game_history": [header("active", 1, json!(null)), header("resigned", 8, json!(2))]
        }
    })
    .to_string();
    let PushMessage::LobbyRefresh(lobby) = PushMessage::parse(&text, true).unwrap() else {
        panic!("expected lobby refresh");
    };
    assert_eq!(lobby.available_players.len(), 1);
    assert_eq!(lobby.game_history.len(), 1);
}

#[test]
fn unknown_action_is_rejected() {
    let err = PushMessage::parse(r#"{"action":"chat","data":{}}"#, false).unwrap_err();
    assert!(matches!(err, SyncError::UnsupportedAction(action) if action == "chat"));
}

#[test]
fn malformed_frames_are_serialization_errors() {
    for text in ["not json", r#"{"data":{}}"#, r#"{"action":"refresh","data":{"game":42}}"#] {
        let err = PushMessage::parse(text, false).unwrap_err();
        assert!(matches!(err, SyncError::Serialization(_)), "{text}: {err}");
    }
}

// ════════════════════════════════════════════════════════════════════
// Snapshots and close codes
// ════════════════════════════════════════════════════════════════════

#[test]
fn lobby_fingerprint_tracks_content() {
    let empty = Snapshot::lobby(LobbyData::default(), Some(ActiveGame::Idle));
    let same = Snapshot::lobby(LobbyData::default(), Some(ActiveGame::Idle));
    let playing = Snapshot::lobby(LobbyData::default(), Some(ActiveGame::Playing(4)));
    assert_eq!(empty.target(), Target::Lobby);
    assert_eq!(empty.fingerprint(), same.fingerprint());
    assert_ne!(empty.fingerprint(), playing.fingerprint());
}

#[test]
fn session_fingerprint_orders_by_status_then_revision() {
    let active = Fingerprint::new(SessionStatus::Active, 10);
    let later = Fingerprint::new(SessionStatus::Active, 11);
    let resigned = Fingerprint::new(SessionStatus::Resigned, 10);
    assert!(later.supersedes(&active));
    assert!(resigned.supersedes(&later));
    assert!(!active.supersedes(&active));
    assert!(!later.supersedes(&resigned));
}

#[test]
fn only_normal_and_going_away_are_intentional() {
    assert!(is_intentional_close(Some(1000)));
    assert!(is_intentional_close(Some(1001)));
    assert!(!is_intentional_close(Some(1006)));
    assert!(!is_intentional_close(Some(4000)));
    assert!(!is_intentional_close(None));
}
