//! Shared test helpers for integration tests.
//!
//! Provides a scriptable [`MockAuthority`], a [`MockConnector`] whose sockets
//! are driven from the test, and JSON fixtures shaped like the authority's
//! wire format.

#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gambit_sync::protocol::{
    BoardState, ChallengeAccepted, ChallengeId, LobbyData, MoveAccepted, PlayerId, Session,
    SessionId,
};
use gambit_sync::{
    Authority, Connector, Square, SyncClient, SyncConfig, SyncError, SyncEvent, Target, Transport,
};
use serde_json::json;
use tokio::sync::mpsc;

pub const ALICE: PlayerId = 1;
pub const BOB: PlayerId = 2;
pub const CAROL: PlayerId = 3;
pub const GAME: SessionId = 7;

// ── JSON fixtures ───────────────────────────────────────────────────

pub fn player_json(id: PlayerId) -> serde_json::Value {
    let name = match id {
        ALICE => "alice",
        BOB => "bob",
        CAROL => "carol",
        _ => "someone",
    };
    json!({ "id": id, "username": name })
}

/// A session header between ALICE (white) and BOB (black).
pub fn session_json(
    id: SessionId,
    status: &str,
    move_count: u64,
    turn: &str,
    winner: Option<PlayerId>,
) -> serde_json::Value {
    json!({
        "id": id,
        "white_player": player_json(ALICE),
        "black_player": player_json(BOB),
        "current_turn": turn,
        "status": status,
        "move_count": move_count,
        "winner": winner.map(player_json),
        "created_at": "2026-01-01T00:00:00Z",
        "moves": []
    })
}

pub fn session(status: &str, move_count: u64, turn: &str, winner: Option<PlayerId>) -> Session {
    serde_json::from_value(session_json(GAME, status, move_count, turn, winner))
        .expect("session fixture")
}

pub fn active(move_count: u64) -> Session {
    let turn = if move_count % 2 == 0 { "white" } else { "black" };
    session("active", move_count, turn, None)
}

pub fn board_json(turn: &str, result: Option<&str>) -> serde_json::Value {
    json!({
        "board_dict": { "e1": "K", "e8": "k" },
        "current_turn": turn,
        "is_my_turn": turn == "white",
        "is_game_over": result.is_some(),
        "result": result
    })
}

pub fn board(turn: &str, result: Option<&str>) -> BoardState {
    serde_json::from_value(board_json(turn, result)).expect("board fixture")
}

/// A push frame carrying a full session refresh.
pub fn session_refresh_frame(session: &Session, board: Option<&BoardState>) -> String {
    json!({
        "action": "refresh",
        "data": { "game": session, "board_state": board }
    })
    .to_string()
}

pub fn reload_frame() -> String {
    json!({ "action": "reload" }).to_string()
}

pub fn lobby_refresh_frame(lobby: &LobbyData) -> String {
    json!({ "action": "lobby_refresh", "data": lobby }).to_string()
}

// ── MockAuthority ───────────────────────────────────────────────────

/// Scripted authority state.
#[derive(Debug, Clone)]
pub struct AuthorityState {
    pub session: Session,
    pub board: BoardState,
    pub lobby: LobbyData,
    pub active: Option<Session>,
    /// When set, `submit_move` is rejected with this message.
    pub reject_moves: Option<String>,
    /// When set, `resign` fails with this message.
    pub reject_resign: Option<String>,
    /// Session returned by `accept_challenge`.
    pub accepted_session: Option<Session>,
    /// When set, `fetch_board` fails.
    pub fail_board: bool,
    /// When set, the next accepted move answers with this session instead of
    /// the advanced one, as if a later push overtook the response.
    pub move_response: Option<Session>,
}

impl Default for AuthorityState {
    fn default() -> Self {
        Self {
            session: active(0),
            board: board("white", None),
            lobby: LobbyData::default(),
            active: None,
            reject_moves: None,
            reject_resign: None,
            accepted_session: None,
            fail_board: false,
            move_response: None,
        }
    }
}

/// In-memory authority. Every call is recorded by name.
#[derive(Default)]
pub struct MockAuthority {
    pub state: Mutex<AuthorityState>,
    calls: Mutex<Vec<String>>,
}

impl MockAuthority {
    pub fn new(state: AuthorityState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn update(&self, f: impl FnOnce(&mut AuthorityState)) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == name).count()
    }

    /// Calls that change the authority's state.
    pub fn writes(&self) -> usize {
        ["submit_move", "resign", "create_challenge", "accept_challenge", "decline_challenge"]
            .iter()
            .map(|name| self.count(name))
            .sum()
    }

    fn record(&self, name: &str) {
        self.calls.lock().unwrap().push(name.to_string());
    }
}

#[async_trait]
impl Authority for MockAuthority {
    async fn fetch_session(&self, _id: SessionId) -> Result<Session, SyncError> {
        self.record("fetch_session");
        Ok(self.state.lock().unwrap().session.clone())
    }

    async fn fetch_board(&self, _id: SessionId) -> Result<BoardState, SyncError> {
        self.record("fetch_board");
        let state = self.state.lock().unwrap();
        if state.fail_board {
            return Err(SyncError::Http("GET games/7/board_state/ returned 502".into()));
        }
        Ok(state.board.clone())
    }

    async fn fetch_lobby(&self) -> Result<LobbyData, SyncError> {
        self.record("fetch_lobby");
        Ok(self.state.lock().unwrap().lobby.clone())
    }

    async fn fetch_active_session(&self) -> Result<Option<Session>, SyncError> {
        self.record("fetch_active_session");
        Ok(self.state.lock().unwrap().active.clone())
    }

    async fn submit_move(
        &self,
        _id: SessionId,
        from: Square,
        to: Square,
    ) -> Result<MoveAccepted, SyncError> {
        self.record("submit_move");
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.reject_moves.clone() {
            return Err(SyncError::rejected(message));
        }
        if let Some(session) = state.move_response.take() {
            return Ok(MoveAccepted {
                session,
                message: format!("Moved {from} to {to}"),
            });
        }
        let next = active(state.session.move_count + 1);
        state.session = next.clone();
        state.board = board(if next.move_count % 2 == 0 { "white" } else { "black" }, None);
        Ok(MoveAccepted {
            session: next,
            message: format!("Moved {from} to {to}"),
        })
    }

    async fn resign(&self, _id: SessionId) -> Result<(), SyncError> {
        self.record("resign");
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.reject_resign.clone() {
            return Err(SyncError::rejected(message));
        }
        let count = state.session.move_count;
        state.session = session("resigned", count, "white", Some(BOB));
        Ok(())
    }

    async fn create_challenge(&self, player: PlayerId) -> Result<ChallengeAccepted, SyncError> {
        self.record("create_challenge");
        if player == ALICE {
            return Err(SyncError::rejected("You cannot challenge yourself"));
        }
        Ok(ChallengeAccepted {
            message: "Challenge sent".into(),
            challenge: None,
            session: None,
        })
    }

    async fn accept_challenge(&self, _id: ChallengeId) -> Result<ChallengeAccepted, SyncError> {
        self.record("accept_challenge");
        let session = self.state.lock().unwrap().accepted_session.clone();
        Ok(ChallengeAccepted {
            message: "Challenge accepted".into(),
            challenge: None,
            session,
        })
    }

    async fn decline_challenge(&self, _id: ChallengeId) -> Result<ChallengeAccepted, SyncError> {
        self.record("decline_challenge");
        Err(SyncError::rejected("Challenge no longer pending"))
    }
}

// ── MockConnector ───────────────────────────────────────────────────

/// What a test can do to an open mock socket.
#[derive(Debug)]
pub enum SocketInput {
    Frame(String),
    Close(Option<u16>),
}

/// A push socket fed from the test through an unbounded channel.
pub struct MockSocket {
    rx: mpsc::UnboundedReceiver<SocketInput>,
    close_code: Option<u16>,
}

#[async_trait]
impl Transport for MockSocket {
    async fn recv(&mut self) -> Option<Result<String, SyncError>> {
        match self.rx.recv().await {
            Some(SocketInput::Frame(text)) => Some(Ok(text)),
            Some(SocketInput::Close(code)) => {
                self.close_code = code;
                None
            }
            // Test dropped its handle; keep the socket open until shutdown.
            None => std::future::pending().await,
        }
    }

    fn close_code(&self) -> Option<u16> {
        self.close_code
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Connector that hands out [`MockSocket`]s and keeps the feeding end of the
/// most recent socket per target.
#[derive(Default)]
pub struct MockConnector {
    sockets: Mutex<HashMap<Target, mpsc::UnboundedSender<SocketInput>>>,
    connects: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Deliver a text frame on `target`'s current socket.
    pub fn push(&self, target: Target, text: String) {
        let sockets = self.sockets.lock().unwrap();
        let tx = sockets.get(&target).expect("no socket for target");
        tx.send(SocketInput::Frame(text)).expect("socket gone");
    }

    /// Close `target`'s current socket from the server side.
    pub fn close(&self, target: Target, code: Option<u16>) {
        let sockets = self.sockets.lock().unwrap();
        let tx = sockets.get(&target).expect("no socket for target");
        tx.send(SocketInput::Close(code)).expect("socket gone");
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, target: &Target) -> Result<Box<dyn Transport>, SyncError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.sockets.lock().unwrap().insert(*target, tx);
        Ok(Box::new(MockSocket {
            rx,
            close_code: None,
        }))
    }
}

// ── Client helpers ──────────────────────────────────────────────────

/// Config with fast polling and reconnects for ALICE.
pub fn fast_config() -> SyncConfig {
    SyncConfig::new(ALICE)
        .with_lobby_poll_interval(Duration::from_millis(50))
        .with_session_poll_interval(Duration::from_millis(50))
        .with_reconnect_delay(Duration::from_millis(100))
        .with_shutdown_timeout(Duration::from_secs(1))
}

pub fn start_client(
    authority: Arc<MockAuthority>,
    connector: Arc<MockConnector>,
) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    SyncClient::start(authority, connector, fast_config())
}

/// Wait for the first event matching `pred`, collecting everything received
/// before it. Panics after two seconds.
pub async fn wait_for(
    events: &mut mpsc::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> (SyncEvent, Vec<SyncEvent>) {
    let mut seen = Vec::new();
    let found = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
            seen.push(event);
        }
    })
    .await;
    match found {
        Ok(event) => (event, seen),
        Err(_) => panic!("timed out waiting for event; saw {seen:?}"),
    }
}

/// Collect every event that arrives within `window`.
pub async fn drain_for(events: &mut mpsc::Receiver<SyncEvent>, window: Duration) -> Vec<SyncEvent> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        seen.push(event);
    }
    seen
}

pub fn is_opened(target: Target) -> impl Fn(&SyncEvent) -> bool {
    move |event| matches!(event, SyncEvent::ChannelOpened { target: t } if *t == target)
}

/// Matches a session update showing `move_count`.
pub fn has_move_count(move_count: u64) -> impl Fn(&SyncEvent) -> bool {
    move |event| {
        matches!(event, SyncEvent::SessionUpdated(view)
            if view.session.as_ref().is_some_and(|s| s.move_count == move_count))
    }
}

pub fn is_ended(event: &SyncEvent) -> bool {
    matches!(event, SyncEvent::SessionEnded(_))
}
