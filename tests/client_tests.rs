//! End-to-end tests for the sync client.
//!
//! Drives a real `SyncClient` with the scripted `MockAuthority` and
//! `MockConnector` from `tests/common`, checking what reaches the event
//! channel and the authority.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

mod common;

use std::time::Duration;

use gambit_sync::protocol::{LobbyData, CLOSE_ABNORMAL, CLOSE_NORMAL};
use gambit_sync::snapshot::ActiveGame;
use gambit_sync::{ResignOutcome, SquareRole, SyncError, SyncEvent, Target};
use tokio_test::{assert_err, assert_ok};

use common::{
    active, board, drain_for, has_move_count, is_ended, is_opened, lobby_refresh_frame, player_json, reload_frame,
    session, session_refresh_frame, start_client, wait_for, AuthorityState, MockAuthority,
    MockConnector, ALICE, BOB, GAME,
};

const SESSION: Target = Target::Session(GAME);

fn count(events: &[SyncEvent], pred: impl Fn(&SyncEvent) -> bool) -> usize {
    events.iter().filter(|event| pred(event)).count()
}

// ════════════════════════════════════════════════════════════════════
// Mounting
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn watching_a_session_loads_it_and_opens_push() {
    let authority = MockAuthority::new(AuthorityState::default());
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let game = client.watch_session(GAME).unwrap();
    let (event, _) = wait_for(&mut events, |e| matches!(e, SyncEvent::SessionUpdated(_))).await;
    let SyncEvent::SessionUpdated(view) = event else {
        unreachable!()
    };
    assert_eq!(view.id(), Some(GAME));
    assert!(view.board.is_some());
    assert!(!view.is_over());

    wait_for(&mut events, is_opened(SESSION)).await;
    assert_eq!(connector.connects(), 1);

    let current = game.current().await.expect("view stored");
    assert_eq!(current.session.as_ref().map(|s| s.move_count), Some(0));

    client.shutdown().await;
}

#[tokio::test]
async fn failed_initial_load_is_filled_in_by_polling() {
    let authority = MockAuthority::new(AuthorityState {
        fail_board: true,
        ..AuthorityState::default()
    });
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let game = client.watch_session(GAME).unwrap();
    let (event, _) = wait_for(&mut events, |e| matches!(e, SyncEvent::LoadFailed { .. })).await;
    assert!(matches!(event, SyncEvent::LoadFailed { target: SESSION, .. }));
    assert!(game.current().await.is_none());

    // Nothing changes on the authority; the first good poll still loads.
    authority.update(|state| state.fail_board = false);
    wait_for(&mut events, has_move_count(0)).await;
    assert!(game.current().await.unwrap().board.is_some());

    client.shutdown().await;
}

#[tokio::test]
async fn poll_picks_up_changes_without_push() {
    let authority = MockAuthority::new(AuthorityState::default());
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let _game = client.watch_session(GAME).unwrap();
    wait_for(&mut events, is_opened(SESSION)).await;

    authority.update(|state| state.session = active(3));
    let (event, _) = wait_for(&mut events, |e| {
        matches!(e, SyncEvent::SessionUpdated(view)
            if view.session.as_ref().is_some_and(|s| s.move_count == 3))
    })
    .await;
    let SyncEvent::SessionUpdated(view) = event else {
        unreachable!()
    };
    assert!(view.board.is_some(), "poll result is completed before applying");

    client.shutdown().await;
}

#[tokio::test]
async fn poll_change_survives_a_failed_board_pull() {
    let authority = MockAuthority::new(AuthorityState::default());
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let game = client.watch_session(GAME).unwrap();
    wait_for(&mut events, is_opened(SESSION)).await;
    let boards = authority.count("fetch_board");

    authority.update(|state| {
        state.session = active(5);
        state.fail_board = true;
    });
    let failing = drain_for(&mut events, Duration::from_millis(300)).await;
    assert_eq!(count(&failing, has_move_count(5)), 0);
    assert!(
        authority.count("fetch_board") >= boards + 2,
        "the change was not offered again after the failed pull"
    );
    assert_eq!(
        game.current().await.unwrap().session.map(|s| s.move_count),
        Some(0)
    );

    authority.update(|state| state.fail_board = false);
    wait_for(&mut events, has_move_count(5)).await;
    assert_eq!(
        game.current().await.unwrap().session.map(|s| s.move_count),
        Some(5)
    );

    client.shutdown().await;
}

#[tokio::test]
async fn unchanged_state_is_not_reapplied() {
    let authority = MockAuthority::new(AuthorityState::default());
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let _game = client.watch_session(GAME).unwrap();
    wait_for(&mut events, is_opened(SESSION)).await;

    // Same revision on push while the poller keeps seeing it too.
    connector.push(SESSION, session_refresh_frame(&active(0), None));
    let seen = drain_for(&mut events, Duration::from_millis(300)).await;
    assert_eq!(
        count(&seen, |e| matches!(e, SyncEvent::SessionUpdated(_))),
        0,
        "unexpected updates: {seen:?}"
    );

    client.shutdown().await;
}

#[tokio::test]
async fn reload_frame_always_pulls() {
    let authority = MockAuthority::new(AuthorityState::default());
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let _game = client.watch_session(GAME).unwrap();
    wait_for(&mut events, is_opened(SESSION)).await;
    let boards = authority.count("fetch_board");

    connector.push(SESSION, reload_frame());
    wait_for(&mut events, |e| matches!(e, SyncEvent::SessionUpdated(_))).await;
    assert!(authority.count("fetch_board") > boards);

    client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Terminal states
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn opponent_resignation_seen_on_both_channels_ends_once() {
    let authority = MockAuthority::new(AuthorityState::default());
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let _game = client.watch_session(GAME).unwrap();
    wait_for(&mut events, is_opened(SESSION)).await;

    // The poller and the push frame race to report the same resignation.
    let resigned = session("resigned", 4, "black", Some(ALICE));
    authority.update(|state| state.session = resigned.clone());
    connector.push(SESSION, session_refresh_frame(&resigned, Some(&board("black", None))));

    let (event, _) = wait_for(&mut events, is_ended).await;
    let SyncEvent::SessionEnded(notice) = event else {
        unreachable!()
    };
    assert_eq!(notice.session_id, GAME);
    assert_eq!(notice.message(), "bob has resigned. You win!");
    assert_eq!(notice.opponent.as_ref().map(|p| p.id), Some(BOB));

    let later = drain_for(&mut events, Duration::from_millis(300)).await;
    assert_eq!(count(&later, is_ended), 0, "duplicate ending: {later:?}");

    client.shutdown().await;
}

#[tokio::test]
async fn completion_is_announced_to_the_side_to_move() {
    let authority = MockAuthority::new(AuthorityState::default());
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let _game = client.watch_session(GAME).unwrap();
    wait_for(&mut events, is_opened(SESSION)).await;

    authority.update(|state| {
        state.session = session("completed", 5, "white", Some(BOB));
        state.board = board("white", Some("Checkmate! Black wins"));
    });

    let (event, _) = wait_for(&mut events, is_ended).await;
    let SyncEvent::SessionEnded(notice) = event else {
        unreachable!()
    };
    assert_eq!(notice.message(), "Checkmate! Black wins");

    client.shutdown().await;
}

#[tokio::test]
async fn session_over_on_mount_is_not_announced() {
    let authority = MockAuthority::new(AuthorityState {
        session: session("resigned", 2, "white", Some(ALICE)),
        ..AuthorityState::default()
    });
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let game = client.watch_session(GAME).unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::SessionUpdated(_))).await;
    let later = drain_for(&mut events, Duration::from_millis(200)).await;
    assert_eq!(count(&later, is_ended), 0);
    assert_eq!(connector.connects(), 0, "ended sessions are not connected");
    assert!(game.current().await.unwrap().is_over());

    client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Moves
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn invalid_move_is_rejected_without_any_request() {
    let authority = MockAuthority::new(AuthorityState::default());
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let game = client.watch_session(GAME).unwrap();
    wait_for(&mut events, is_opened(SESSION)).await;

    let err = game.submit_move("z9", "e4").await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::InvalidSquare {
            role: SquareRole::From,
            ..
        }
    ));
    let err = game.submit_move("", "e4").await.unwrap_err();
    assert!(matches!(err, SyncError::MissingSquares));
    assert!(err.is_validation());
    assert_eq!(authority.writes(), 0);

    let view = game.current().await.unwrap();
    assert_eq!(view.error.as_deref(), Some(err.to_string().as_str()));

    client.shutdown().await;
}

#[tokio::test]
async fn accepted_move_updates_view_before_returning() {
    let authority = MockAuthority::new(AuthorityState::default());
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let game = client.watch_session(GAME).unwrap();
    wait_for(&mut events, is_opened(SESSION)).await;

    let accepted = assert_ok!(game.submit_move(" E2 ", "e4").await);
    assert_eq!(accepted.message, "Moved e2 to e4");

    let view = game.current().await.unwrap();
    assert_eq!(view.session.as_ref().map(|s| s.move_count), Some(1));
    assert_eq!(view.message.as_deref(), Some("Moved e2 to e4"));
    assert!(view.error.is_none());

    client.shutdown().await;
}

#[tokio::test]
async fn push_ahead_of_the_move_response_is_kept() {
    let authority = MockAuthority::new(AuthorityState::default());
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let game = client.watch_session(GAME).unwrap();
    wait_for(&mut events, is_opened(SESSION)).await;

    // The opponent's reply reaches the viewer before the move response does.
    authority.update(|state| {
        state.session = active(6);
        state.move_response = Some(active(5));
    });
    connector.push(SESSION, session_refresh_frame(&active(6), Some(&board("white", None))));
    wait_for(&mut events, has_move_count(6)).await;

    let accepted = assert_ok!(game.submit_move("e7", "e5").await);
    assert_eq!(accepted.session.move_count, 5);

    let view = game.current().await.unwrap();
    assert_eq!(view.session.as_ref().map(|s| s.move_count), Some(6));
    assert_eq!(view.message.as_deref(), Some("Moved e7 to e5"));

    let later = drain_for(&mut events, Duration::from_millis(200)).await;
    assert_eq!(count(&later, has_move_count(5)), 0, "view went backwards: {later:?}");
    assert_eq!(
        game.current().await.unwrap().session.map(|s| s.move_count),
        Some(6)
    );

    client.shutdown().await;
}

#[tokio::test]
async fn move_with_failed_board_pull_still_converges() {
    let authority = MockAuthority::new(AuthorityState::default());
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let game = client.watch_session(GAME).unwrap();
    wait_for(&mut events, is_opened(SESSION)).await;

    authority.update(|state| state.fail_board = true);
    let accepted = assert_ok!(game.submit_move("e2", "e4").await);
    assert_eq!(accepted.session.move_count, 1);

    let view = game.current().await.unwrap();
    assert_eq!(view.message.as_deref(), Some("Moved e2 to e4"));
    assert_eq!(view.session.as_ref().map(|s| s.move_count), Some(0));

    authority.update(|state| state.fail_board = false);
    wait_for(&mut events, has_move_count(1)).await;

    client.shutdown().await;
}

#[tokio::test]
async fn rejected_move_surfaces_the_authority_message() {
    let authority = MockAuthority::new(AuthorityState {
        reject_moves: Some("Illegal move: king would be in check".into()),
        ..AuthorityState::default()
    });
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let game = client.watch_session(GAME).unwrap();
    wait_for(&mut events, is_opened(SESSION)).await;

    let err = game.submit_move("e1", "e2").await.unwrap_err();
    assert_eq!(err.to_string(), "Illegal move: king would be in check");
    let view = game.current().await.unwrap();
    assert_eq!(
        view.error.as_deref(),
        Some("Illegal move: king would be in check")
    );
    assert_eq!(view.session.as_ref().map(|s| s.move_count), Some(0));

    client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Resignation
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn cancelled_resignation_sends_nothing() {
    let authority = MockAuthority::new(AuthorityState::default());
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let game = client.watch_session(GAME).unwrap();
    wait_for(&mut events, is_opened(SESSION)).await;

    let outcome = assert_ok!(game.resign(|| false).await);
    assert_eq!(outcome, ResignOutcome::Cancelled);
    assert_eq!(authority.count("resign"), 0);
    assert!(!game.current().await.unwrap().is_over());

    client.shutdown().await;
}

#[tokio::test]
async fn confirmed_resignation_leaves_without_notice() {
    let authority = MockAuthority::new(AuthorityState::default());
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let game = client.watch_session(GAME).unwrap();
    wait_for(&mut events, is_opened(SESSION)).await;

    let outcome = game.resign(|| true).await.unwrap();
    assert_eq!(outcome, ResignOutcome::Resigned);
    assert_eq!(authority.count("resign"), 1);

    let (event, _) = wait_for(&mut events, |e| matches!(e, SyncEvent::SessionLeft { .. })).await;
    assert!(matches!(event, SyncEvent::SessionLeft { id: GAME }));

    // The poller would now see the resignation; it has been stopped.
    let later = drain_for(&mut events, Duration::from_millis(300)).await;
    assert_eq!(count(&later, is_ended), 0, "resigning party notified: {later:?}");
    assert!(game.current().await.is_none(), "view released");

    client.shutdown().await;
}

#[tokio::test]
async fn late_action_after_leaving_does_not_recreate_the_view() {
    let authority = MockAuthority::new(AuthorityState::default());
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let game = client.watch_session(GAME).unwrap();
    wait_for(&mut events, is_opened(SESSION)).await;

    assert_ok!(game.resign(|| true).await);
    wait_for(&mut events, |e| matches!(e, SyncEvent::SessionLeft { .. })).await;
    assert!(game.current().await.is_none());

    authority.update(|state| state.reject_moves = Some("Game is not active".into()));
    let err = assert_err!(game.submit_move("e2", "e4").await);
    assert_eq!(err.to_string(), "Game is not active");
    assert_err!(game.submit_move("z9", "e4").await);

    assert!(game.current().await.is_none(), "released view came back");

    client.shutdown().await;
}

#[tokio::test]
async fn failed_resignation_keeps_the_session() {
    let authority = MockAuthority::new(AuthorityState {
        reject_resign: Some("Game is not active".into()),
        ..AuthorityState::default()
    });
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let game = client.watch_session(GAME).unwrap();
    wait_for(&mut events, is_opened(SESSION)).await;

    let err = game.resign(|| true).await.unwrap_err();
    assert_eq!(err.to_string(), "Game is not active");
    let view = game.current().await.unwrap();
    assert_eq!(view.error.as_deref(), Some("Game is not active"));

    client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Push connection lifecycle
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn abnormal_close_reconnects_after_delay() {
    let authority = MockAuthority::new(AuthorityState::default());
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let _game = client.watch_session(GAME).unwrap();
    wait_for(&mut events, is_opened(SESSION)).await;

    connector.close(SESSION, Some(CLOSE_ABNORMAL));
    let (event, _) = wait_for(&mut events, |e| matches!(e, SyncEvent::ChannelClosed { .. })).await;
    assert!(matches!(
        event,
        SyncEvent::ChannelClosed {
            code: Some(CLOSE_ABNORMAL),
            reconnecting: true,
            ..
        }
    ));
    wait_for(&mut events, is_opened(SESSION)).await;
    assert_eq!(connector.connects(), 2);

    client.shutdown().await;
}

#[tokio::test]
async fn normal_close_is_not_retried() {
    let authority = MockAuthority::new(AuthorityState::default());
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let _game = client.watch_session(GAME).unwrap();
    wait_for(&mut events, is_opened(SESSION)).await;

    connector.close(SESSION, Some(CLOSE_NORMAL));
    let (event, _) = wait_for(&mut events, |e| matches!(e, SyncEvent::ChannelClosed { .. })).await;
    assert!(matches!(
        event,
        SyncEvent::ChannelClosed {
            reconnecting: false,
            ..
        }
    ));
    let later = drain_for(&mut events, Duration::from_millis(300)).await;
    assert_eq!(count(&later, |e| matches!(e, SyncEvent::ChannelOpened { .. })), 0);
    assert_eq!(connector.connects(), 1);

    client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Lobby
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn lobby_reports_active_session_once() {
    let authority = MockAuthority::new(AuthorityState {
        active: Some(active(2)),
        ..AuthorityState::default()
    });
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let lobby = client.watch_lobby().unwrap();
    let (event, _) =
        wait_for(&mut events, |e| matches!(e, SyncEvent::ActiveSessionFound { .. })).await;
    assert!(matches!(event, SyncEvent::ActiveSessionFound { id: GAME }));
    assert_eq!(
        lobby.current().await.unwrap().active,
        Some(ActiveGame::Playing(GAME))
    );
    wait_for(&mut events, is_opened(Target::Lobby)).await;

    // A lobby refresh changes the content but not the active session.
    let data = LobbyData::new(
        vec![serde_json::from_value(player_json(BOB)).unwrap()],
        vec![],
        vec![session("completed", 9, "black", Some(ALICE))],
    );
    authority.update(|state| state.lobby = data.clone());
    connector.push(Target::Lobby, lobby_refresh_frame(&data));
    let (event, before) =
        wait_for(&mut events, |e| matches!(e, SyncEvent::LobbyUpdated(_))).await;
    let SyncEvent::LobbyUpdated(view) = event else {
        unreachable!()
    };
    assert_eq!(view.lobby.available_players.len(), 1);
    assert_eq!(view.lobby.game_history.len(), 1);

    let later = drain_for(&mut events, Duration::from_millis(200)).await;
    let found = |e: &SyncEvent| matches!(e, SyncEvent::ActiveSessionFound { .. });
    assert_eq!(count(&before, found) + count(&later, found), 0);

    client.shutdown().await;
}

#[tokio::test]
async fn accepting_a_challenge_returns_the_new_session() {
    let authority = MockAuthority::new(AuthorityState {
        accepted_session: Some(active(0)),
        ..AuthorityState::default()
    });
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let lobby = client.watch_lobby().unwrap();
    wait_for(&mut events, is_opened(Target::Lobby)).await;

    let id = lobby.accept(11).await.unwrap();
    assert_eq!(id, GAME);
    let view = lobby.current().await.unwrap();
    assert_eq!(view.message.as_deref(), Some("Challenge accepted"));

    client.shutdown().await;
}

#[tokio::test]
async fn challenge_rejections_are_shown_verbatim() {
    let authority = MockAuthority::new(AuthorityState::default());
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let lobby = client.watch_lobby().unwrap();
    wait_for(&mut events, is_opened(Target::Lobby)).await;

    let err = lobby.challenge(ALICE).await.unwrap_err();
    assert_eq!(err.to_string(), "You cannot challenge yourself");
    assert_eq!(
        lobby.current().await.unwrap().error.as_deref(),
        Some("You cannot challenge yourself")
    );

    let err = assert_err!(lobby.decline(3).await);
    assert_eq!(err.to_string(), "Challenge no longer pending");

    let message = lobby.challenge(BOB).await.unwrap();
    assert_eq!(message, "Challenge sent");
    let view = lobby.current().await.unwrap();
    assert_eq!(view.message.as_deref(), Some("Challenge sent"));
    assert!(view.error.is_none());

    client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Shutdown
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn shutdown_ends_with_disconnected() {
    let authority = MockAuthority::new(AuthorityState::default());
    let connector = MockConnector::new();
    let (mut client, mut events) = start_client(authority.clone(), connector.clone());

    let game = client.watch_session(GAME).unwrap();
    wait_for(&mut events, is_opened(SESSION)).await;

    client.shutdown().await;
    wait_for(&mut events, |e| matches!(e, SyncEvent::Disconnected { .. })).await;
    assert!(!client.is_running());
    assert!(matches!(game.refresh(), Err(SyncError::NotRunning)));
}
