//! Reconciliation Engine: the single merge point for every snapshot source.
//!
//! Push refreshes, push reloads, poll changes, the initial load and the
//! viewer's own write responses all arrive as a [`Candidate`] and go through
//! [`ReconciliationEngine::merge`]. Per target the engine keeps a
//! [`ReconciliationState`] and enforces, in order:
//!
//! 1. **Mount guard**: candidates for unmounted targets are discarded.
//! 2. **Terminal latch**: once a target has ended nothing is merged again.
//! 3. **Completion**: snapshots missing their detail (session board, lobby
//!    active session) are completed with a pull before anything is shown.
//!    Payload-less candidates are replaced by a full pull.
//! 4. **Monotonicity**: a session snapshot must supersede the last one by
//!    `(status rank, revision)`; ties keep the first observation. The lobby
//!    has no order, so its snapshots only need a different content hash.
//!    Initial loads and reloads skip this filter.
//! 5. **Terminal handling**: the first terminal snapshot latches the target,
//!    tears down its connection and poller, and only then notifies the viewer
//!    if they did not cause the transition. The notice waits for room on the
//!    event channel rather than being dropped.
//!
//! The engine is owned by the sync loop and handles one candidate at a time.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::authority::{self, Authority, AuthorityFetch};
use crate::channel::{ChannelEvent, ChannelEventKind, ConnectionState};
use crate::client::SyncConfig;
use crate::event::{self, SyncEvent, TerminalNotice};
use crate::poller::{PollEvent, SnapshotFetch, SnapshotPoller};
use crate::protocol::{PushMessage, SessionRefresh, SessionStatus};
use crate::registry::ConnectionRegistry;
use crate::snapshot::{ActiveGame, Fingerprint, Payload, Snapshot, Target};
use crate::view::{ViewStore, ViewUpdate};

/// Identifies one consumer's subscription to a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a target as seen by the engine.
///
/// `Init → Active → {Completed, Resigned}`; terminal phases are absorbing.
/// The lobby never leaves `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Active,
    Completed,
    Resigned,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Resigned)
    }
}

/// Per-target bookkeeping, owned exclusively by the engine.
#[derive(Debug, Clone)]
pub struct ReconciliationState {
    subscription: SubscriptionId,
    last: Option<Fingerprint>,
    phase: Phase,
    terminal_handled: bool,
    mounted: bool,
    active_session: Option<ActiveGame>,
}

impl ReconciliationState {
    fn new(subscription: SubscriptionId) -> Self {
        Self {
            subscription,
            last: None,
            phase: Phase::Init,
            terminal_handled: false,
            mounted: true,
            active_session: None,
        }
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }

    /// Fingerprint of the last applied snapshot.
    pub fn last(&self) -> Option<Fingerprint> {
        self.last
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn terminal_handled(&self) -> bool {
        self.terminal_handled
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    fn admits(&self, target: Target, fingerprint: Fingerprint) -> bool {
        match (self.last, target) {
            (None, _) => true,
            (Some(last), Target::Lobby) => fingerprint != last,
            (Some(last), Target::Session(_)) => fingerprint.supersedes(&last),
        }
    }

    fn record(&mut self, fingerprint: Fingerprint) {
        self.last = Some(fingerprint);
        if !self.phase.is_terminal() {
            self.phase = Phase::Active;
        }
    }

    /// Set the terminal flag. Returns `true` only for the call that set it.
    fn latch_terminal(&mut self, status: SessionStatus) -> bool {
        if self.terminal_handled {
            return false;
        }
        self.terminal_handled = true;
        self.phase = match status {
            SessionStatus::Resigned => Phase::Resigned,
            SessionStatus::Active | SessionStatus::Completed => Phase::Completed,
        };
        true
    }

    fn unmount(&mut self) {
        self.mounted = false;
    }
}

/// Where a candidate snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The load performed when a target is mounted.
    Initial,
    /// A push refresh.
    Push,
    /// A poll change.
    Poll,
    /// A reload signal or explicit refresh; always pulls and always applies.
    Reload,
    /// The response to the viewer's own write.
    Action,
}

impl Source {
    fn bypasses_filter(self) -> bool {
        matches!(self, Self::Initial | Self::Reload)
    }
}

/// A snapshot offered to the engine. `None` asks for a full pull.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub target: Target,
    pub source: Source,
    pub snapshot: Option<Snapshot>,
}

impl Candidate {
    pub fn new(source: Source, snapshot: Snapshot) -> Self {
        Self {
            target: snapshot.target(),
            source,
            snapshot: Some(snapshot),
        }
    }

    pub fn reload(target: Target) -> Self {
        Self {
            target,
            source: Source::Reload,
            snapshot: None,
        }
    }
}

/// What [`ReconciliationEngine::merge`] did with a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Applied to the view. `ended` is set when this candidate latched the
    /// terminal state, `notified` when the viewer was told about it.
    Applied { ended: bool, notified: bool },
    /// Not newer than what was already applied.
    Stale,
    /// The target is not mounted.
    Unmounted,
    /// The target already ended.
    Ended,
    /// Completing or pulling the snapshot failed.
    Failed,
}

/// Merges snapshots into the view store and drives per-target teardown.
pub struct ReconciliationEngine {
    config: SyncConfig,
    authority: Arc<dyn Authority>,
    fetch: Arc<dyn SnapshotFetch>,
    registry: ConnectionRegistry,
    poller: SnapshotPoller,
    store: Arc<ViewStore>,
    events: mpsc::Sender<SyncEvent>,
    states: HashMap<Target, ReconciliationState>,
}

impl ReconciliationEngine {
    pub fn new(
        config: SyncConfig,
        authority: Arc<dyn Authority>,
        registry: ConnectionRegistry,
        poller: SnapshotPoller,
        store: Arc<ViewStore>,
        events: mpsc::Sender<SyncEvent>,
    ) -> Self {
        let fetch = Arc::new(AuthorityFetch::new(Arc::clone(&authority)));
        Self {
            config,
            authority,
            fetch,
            registry,
            poller,
            store,
            events,
            states: HashMap::new(),
        }
    }

    pub fn state(&self, target: Target) -> Option<&ReconciliationState> {
        self.states.get(&target)
    }

    pub fn connection_state(&self, target: Target) -> Option<ConnectionState> {
        self.registry.state(target)
    }

    pub fn is_polling(&self, target: Target) -> bool {
        self.poller.is_running(target)
    }

    /// Mount `target` for `subscription`: load it, then open its push
    /// connection and start polling unless it has already ended.
    ///
    /// Mounting a target again replaces its state with a fresh one.
    pub async fn mount(&mut self, target: Target, subscription: SubscriptionId) {
        info!(target = %target, %subscription, "mounting target");
        self.states
            .insert(target, ReconciliationState::new(subscription));

        match authority::pull_full(self.authority.as_ref(), target).await {
            Ok(snapshot) => {
                self.merge(Candidate::new(Source::Initial, snapshot)).await;
            }
            Err(e) => {
                warn!(target = %target, error = %e, "initial load failed");
                self.emit(SyncEvent::LoadFailed {
                    target,
                    error: e.to_string(),
                });
            }
        }

        let Some(state) = self.states.get(&target) else {
            return;
        };
        if state.terminal_handled || !state.mounted {
            return;
        }
        let last = state.last;

        self.registry.connect(target);
        let interval = match target {
            Target::Lobby => self.config.lobby_poll_interval,
            Target::Session(_) => self.config.session_poll_interval,
        };
        self.poller.start(target, interval, Arc::clone(&self.fetch));
        match last {
            Some(fingerprint) => self.poller.seed(target, fingerprint),
            // Nothing loaded yet, so the first poll has to be merged.
            None => self.poller.rewind(target, None),
        }
    }

    /// Unmount `target` if `subscription` is still the current one.
    ///
    /// Releases the connection, the poller and the view. Returns `false` for
    /// stale or unknown subscriptions.
    pub async fn unmount(&mut self, target: Target, subscription: SubscriptionId) -> bool {
        match self.states.get(&target) {
            Some(state) if state.subscription == subscription => {}
            _ => {
                debug!(target = %target, %subscription, "ignoring unmount of stale subscription");
                return false;
            }
        }
        self.release(target).await;
        info!(target = %target, "target unmounted");
        true
    }

    /// Record the viewer's own resignation: latch, tear down and leave without
    /// waiting for an echo.
    pub async fn resigned(&mut self, target: Target) {
        let Some(state) = self.states.get_mut(&target) else {
            return;
        };
        state.latch_terminal(SessionStatus::Resigned);
        self.release(target).await;
        if let Target::Session(id) = target {
            info!(target = %target, "viewer resigned, leaving session");
            self.emit(SyncEvent::SessionLeft { id });
        }
    }

    /// Release every target. Used when the sync loop stops.
    pub async fn shutdown(&mut self) {
        let targets: Vec<Target> = self.states.keys().copied().collect();
        for target in targets {
            self.release(target).await;
        }
        self.poller.stop_all();
        self.registry.disconnect_all();
    }

    /// Route a push connection event.
    pub async fn handle_channel(&mut self, event: ChannelEvent) -> Option<MergeOutcome> {
        let target = event.target;
        match event.kind {
            ChannelEventKind::Opened => {
                self.emit(SyncEvent::ChannelOpened { target });
                None
            }
            ChannelEventKind::Closed { code, reconnecting } => {
                self.emit(SyncEvent::ChannelClosed {
                    target,
                    code,
                    reconnecting,
                });
                None
            }
            ChannelEventKind::Message(PushMessage::Reload) => {
                debug!(target = %target, "push reload");
                Some(self.merge(Candidate::reload(target)).await)
            }
            ChannelEventKind::Message(PushMessage::SessionRefresh(refresh)) => {
                let SessionRefresh { session, board } = *refresh;
                if target.session_id() != Some(session.id) {
                    warn!(target = %target, session = session.id, "refresh for another session, dropping");
                    return None;
                }
                let snapshot = Snapshot::session(session, board);
                Some(self.merge(Candidate::new(Source::Push, snapshot)).await)
            }
            ChannelEventKind::Message(PushMessage::LobbyRefresh(lobby)) => {
                if !target.is_lobby() {
                    warn!(target = %target, "lobby refresh on a session channel, dropping");
                    return None;
                }
                let snapshot = Snapshot::lobby(*lobby, None);
                Some(self.merge(Candidate::new(Source::Push, snapshot)).await)
            }
        }
    }

    /// Route a poll change.
    ///
    /// The poller has already moved its baseline to the reported snapshot.
    /// If the merge fails it is rewound to what the view holds, so the change
    /// is offered again on the next tick.
    pub async fn handle_poll(&mut self, event: PollEvent) -> MergeOutcome {
        let target = event.target;
        let outcome = self
            .merge(Candidate {
                target,
                source: Source::Poll,
                snapshot: Some(event.snapshot),
            })
            .await;
        if outcome == MergeOutcome::Failed {
            let last = self.states.get(&target).and_then(ReconciliationState::last);
            self.poller.rewind(target, last);
        }
        outcome
    }

    /// Merge one candidate.
    pub async fn merge(&mut self, candidate: Candidate) -> MergeOutcome {
        let Candidate {
            target,
            source,
            snapshot,
        } = candidate;

        match self.states.get(&target) {
            Some(state) if state.mounted => {
                if state.terminal_handled {
                    debug!(target = %target, ?source, "target already ended, discarding snapshot");
                    return MergeOutcome::Ended;
                }
                // Session fingerprints do not depend on the board, so stale
                // headers are dropped before paying for the detail pull.
                if let Some(snapshot) = &snapshot {
                    if !source.bypasses_filter()
                        && !target.is_lobby()
                        && !state.admits(target, snapshot.fingerprint())
                    {
                        debug!(target = %target, ?source, fingerprint = %snapshot.fingerprint(), "stale snapshot");
                        return MergeOutcome::Stale;
                    }
                }
            }
            _ => {
                debug!(target = %target, ?source, "discarding snapshot for unmounted target");
                return MergeOutcome::Unmounted;
            }
        }

        let pulled = match snapshot {
            Some(snapshot) if snapshot.is_complete() => Ok(snapshot),
            Some(snapshot) => {
                debug!(target = %target, ?source, "snapshot missing detail, pulling");
                authority::complete(self.authority.as_ref(), snapshot).await
            }
            None => authority::pull_full(self.authority.as_ref(), target).await,
        };
        let snapshot = match pulled {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(target = %target, ?source, error = %e, "pull failed, keeping last state");
                return MergeOutcome::Failed;
            }
        };

        let fingerprint = snapshot.fingerprint();
        let Some(state) = self.states.get_mut(&target) else {
            return MergeOutcome::Unmounted;
        };
        if !source.bypasses_filter() && !state.admits(target, fingerprint) {
            debug!(target = %target, ?source, %fingerprint, "stale snapshot");
            return MergeOutcome::Stale;
        }
        let first = state.phase == Phase::Init;
        state.record(fingerprint);
        self.poller.seed(target, fingerprint);
        debug!(target = %target, ?source, %fingerprint, "snapshot applied");

        match self.store.apply(&snapshot).await {
            ViewUpdate::Session(view) => self.emit(SyncEvent::SessionUpdated(view)),
            ViewUpdate::Lobby(view) => self.emit(SyncEvent::LobbyUpdated(view)),
        }

        match snapshot.payload() {
            Payload::Lobby { active, .. } => {
                if let Some(active) = *active {
                    self.observe_active_session(active);
                }
                MergeOutcome::Applied {
                    ended: false,
                    notified: false,
                }
            }
            Payload::Session { session, board } => {
                if !session.status.is_terminal() {
                    return MergeOutcome::Applied {
                        ended: false,
                        notified: false,
                    };
                }
                let latched = self
                    .states
                    .get_mut(&target)
                    .is_some_and(|state| state.latch_terminal(session.status));
                if !latched {
                    return MergeOutcome::Ended;
                }
                info!(target = %target, ?source, status = %session.status, "terminal state latched");
                self.teardown(target);

                let notice = if first || source == Source::Action {
                    None
                } else {
                    TerminalNotice::for_viewer(session, board.as_ref(), self.config.viewer)
                };
                let notified = notice.is_some();
                if let Some(notice) = notice {
                    info!(target = %target, message = notice.message(), "session ended");
                    event::deliver(&self.events, SyncEvent::SessionEnded(notice)).await;
                }
                MergeOutcome::Applied {
                    ended: true,
                    notified,
                }
            }
        }
    }

    fn observe_active_session(&mut self, active: ActiveGame) {
        let Some(state) = self.states.get_mut(&Target::Lobby) else {
            return;
        };
        if state.active_session == Some(active) {
            return;
        }
        state.active_session = Some(active);
        if let ActiveGame::Playing(id) = active {
            info!(session = id, "active session found");
            self.emit(SyncEvent::ActiveSessionFound { id });
        }
    }

    /// Stop polling and close the push connection of `target`.
    fn teardown(&mut self, target: Target) {
        let polled = self.poller.stop(target);
        let connected = self.registry.disconnect(target);
        debug!(target = %target, polled, connected, "target torn down");
    }

    /// Unmount and forget `target`, releasing everything it holds.
    async fn release(&mut self, target: Target) {
        if let Some(mut state) = self.states.remove(&target) {
            state.unmount();
        }
        self.teardown(target);
        match target {
            Target::Session(id) => self.store.remove_session(id).await,
            Target::Lobby => self.store.remove_lobby().await,
        }
    }

    fn emit(&self, event: SyncEvent) {
        event::emit(&self.events, event);
    }
}

impl fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("viewer", &self.config.viewer)
            .field("states", &self.states)
            .field("registry", &self.registry)
            .field("poller", &self.poller)
            .finish()
    }
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
    use crate::error::{Result, SyncError};
    use crate::protocol::{
        BoardState, ChallengeAccepted, ChallengeId, Color, LobbyData, MoveAccepted,
        ParticipantRef, Player, PlayerId, Session, SessionId,
    };
    use crate::square::Square;
    use crate::transport::{Connector, Transport};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const ALICE: PlayerId = 1;
    const BOB: PlayerId = 2;
    const GAME: Target = Target::Session(1);

    fn session(
        status: SessionStatus,
        move_count: u64,
        turn: Color,
        winner: Option<PlayerId>,
    ) -> Session {
        Session {
            id: 1,
            white_player: Player {
                id: ALICE,
                username: "alice".into(),
            },
            black_player: Player {
                id: BOB,
                username: "bob".into(),
            },
            current_turn: turn,
            status,
            move_count,
            winner: winner.map(ParticipantRef::Id),
            outcome: None,
            created_at: None,
            updated_at: None,
            moves: vec![],
        }
    }

    fn active(move_count: u64) -> Session {
        session(SessionStatus::Active, move_count, Color::White, None)
    }

    fn board(marker: &str) -> BoardState {
        BoardState {
            board_dict: BTreeMap::from([("e4".to_string(), marker.to_string())]),
            current_turn: Color::White,
            is_my_turn: true,
            is_game_over: false,
            result: None,
        }
    }

    struct StubAuthority {
        session: Mutex<Session>,
        board: Mutex<BoardState>,
        lobby: Mutex<LobbyData>,
        active: Mutex<Option<Session>>,
        session_pulls: AtomicUsize,
        board_pulls: AtomicUsize,
        active_pulls: AtomicUsize,
        offline: AtomicBool,
        board_offline: AtomicBool,
    }

    impl StubAuthority {
        fn new(session: Session) -> Arc<Self> {
            Arc::new(Self {
                session: Mutex::new(session),
                board: Mutex::new(board("P")),
                lobby: Mutex::new(LobbyData::default()),
                active: Mutex::new(None),
                session_pulls: AtomicUsize::new(0),
                board_pulls: AtomicUsize::new(0),
                active_pulls: AtomicUsize::new(0),
                offline: AtomicBool::new(false),
                board_offline: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Authority for StubAuthority {
        async fn fetch_session(&self, _id: SessionId) -> Result<Session> {
            self.session_pulls.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(SyncError::Http("connection refused".into()));
            }
            Ok(self.session.lock().clone())
        }

        async fn fetch_board(&self, _id: SessionId) -> Result<BoardState> {
            self.board_pulls.fetch_add(1, Ordering::SeqCst);
            if self.board_offline.load(Ordering::SeqCst) {
                return Err(SyncError::Http("board_state returned 502 Bad Gateway".into()));
            }
            Ok(self.board.lock().clone())
        }

        async fn fetch_lobby(&self) -> Result<LobbyData> {
            Ok(self.lobby.lock().clone())
        }

        async fn fetch_active_session(&self) -> Result<Option<Session>> {
            self.active_pulls.fetch_add(1, Ordering::SeqCst);
            Ok(self.active.lock().clone())
        }

        async fn submit_move(&self, _id: SessionId, _from: Square, _to: Square) -> Result<MoveAccepted> {
            Err(SyncError::NotFound)
        }

        async fn resign(&self, _id: SessionId) -> Result<()> {
            Err(SyncError::NotFound)
        }

        async fn create_challenge(&self, _player: PlayerId) -> Result<ChallengeAccepted> {
            Err(SyncError::NotFound)
        }

        async fn accept_challenge(&self, _id: ChallengeId) -> Result<ChallengeAccepted> {
            Err(SyncError::NotFound)
        }

        async fn decline_challenge(&self, _id: ChallengeId) -> Result<ChallengeAccepted> {
            Err(SyncError::NotFound)
        }
    }

    /// Connects never complete; the registry slot stays `Connecting`.
    struct StalledConnector;

    #[async_trait]
    impl Connector for StalledConnector {
        async fn connect(&self, _target: &Target) -> std::result::Result<Box<dyn Transport>, SyncError> {
            std::future::pending().await
        }
    }

    struct Fixture {
        engine: ReconciliationEngine,
        authority: Arc<StubAuthority>,
        store: Arc<ViewStore>,
        events: mpsc::Receiver<SyncEvent>,
        _channel_rx: mpsc::Receiver<ChannelEvent>,
        _poll_rx: mpsc::Receiver<PollEvent>,
    }

    impl Fixture {
        fn new(viewer: PlayerId, session: Session) -> Self {
            Self::with_capacity(viewer, session, 64)
        }

        fn with_capacity(viewer: PlayerId, session: Session, capacity: usize) -> Self {
            let authority = StubAuthority::new(session);
            let (channel_tx, channel_rx) = mpsc::channel(16);
            let (poll_tx, poll_rx) = mpsc::channel(16);
            let (event_tx, events) = mpsc::channel(capacity);
            let config = SyncConfig::new(viewer);
            let registry = ConnectionRegistry::new(
                Arc::new(StalledConnector),
                channel_tx,
                config.reconnect_delay,
            );
            let store = Arc::new(ViewStore::new());
            let engine = ReconciliationEngine::new(
                config,
                authority.clone(),
                registry,
                SnapshotPoller::new(poll_tx),
                Arc::clone(&store),
                event_tx,
            );
            Self {
                engine,
                authority,
                store,
                events,
                _channel_rx: channel_rx,
                _poll_rx: poll_rx,
            }
        }

        fn drain(&mut self) -> Vec<SyncEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        async fn push(&mut self, session: Session) -> MergeOutcome {
            let refresh = SessionRefresh {
                session,
                board: None,
            };
            self.engine
                .handle_channel(ChannelEvent {
                    target: GAME,
                    kind: ChannelEventKind::Message(PushMessage::SessionRefresh(Box::new(refresh))),
                })
                .await
                .unwrap()
        }

        async fn poll(&mut self, session: Session) -> MergeOutcome {
            self.engine
                .handle_poll(PollEvent {
                    target: GAME,
                    snapshot: Snapshot::session(session, None),
                })
                .await
        }
    }

    fn count<F: Fn(&SyncEvent) -> bool>(events: &[SyncEvent], f: F) -> usize {
        events.iter().filter(|event| f(event)).count()
    }

    fn ended(events: &[SyncEvent]) -> usize {
        count(events, |event| matches!(event, SyncEvent::SessionEnded(_)))
    }

    fn updates(events: &[SyncEvent]) -> usize {
        count(events, |event| matches!(event, SyncEvent::SessionUpdated(_)))
    }

    #[tokio::test]
    async fn mount_loads_and_starts_both_channels() {
        let mut fx = Fixture::new(BOB, active(4));
        fx.engine.mount(GAME, SubscriptionId::new()).await;

        let state = fx.engine.state(GAME).unwrap();
        assert_eq!(state.phase(), Phase::Active);
        assert_eq!(state.last(), Some(Fingerprint::new(SessionStatus::Active, 4)));
        assert!(fx.engine.is_polling(GAME));
        assert_eq!(fx.engine.connection_state(GAME), Some(ConnectionState::Connecting));
        assert_eq!(fx.engine.poller.baseline(GAME), state.last());

        let view = fx.store.session(1).await.unwrap();
        assert_eq!(view.board, Some(board("P")));
        assert_eq!(updates(&fx.drain()), 1);
    }

    #[tokio::test]
    async fn resignation_from_push_and_poll_ends_once() {
        let mut fx = Fixture::new(BOB, active(10));
        fx.engine.mount(GAME, SubscriptionId::new()).await;
        fx.drain();

        let resigned = session(SessionStatus::Resigned, 10, Color::White, Some(BOB));
        assert_eq!(
            fx.push(resigned.clone()).await,
            MergeOutcome::Applied {
                ended: true,
                notified: true
            }
        );
        assert_eq!(fx.poll(resigned.clone()).await, MergeOutcome::Ended);
        assert_eq!(fx.push(resigned).await, MergeOutcome::Ended);

        let events = fx.drain();
        assert_eq!(ended(&events), 1);
        let notice = events
            .iter()
            .find_map(|event| match event {
                SyncEvent::SessionEnded(notice) => Some(notice.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(notice.message(), "alice has resigned. You win!");

        assert!(!fx.engine.is_polling(GAME));
        assert_eq!(fx.engine.connection_state(GAME), None);
        let state = fx.engine.state(GAME).unwrap();
        assert!(state.terminal_handled());
        assert_eq!(state.phase(), Phase::Resigned);
    }

    #[tokio::test]
    async fn resignation_first_seen_by_poll_ends_once() {
        let mut fx = Fixture::new(BOB, active(10));
        fx.engine.mount(GAME, SubscriptionId::new()).await;
        fx.drain();

        let resigned = session(SessionStatus::Resigned, 10, Color::White, Some(BOB));
        fx.poll(resigned.clone()).await;
        fx.push(resigned.clone()).await;
        fx.poll(resigned).await;

        assert_eq!(ended(&fx.drain()), 1);
    }

    #[tokio::test]
    async fn resigning_party_is_not_notified() {
        let mut fx = Fixture::new(ALICE, active(10));
        fx.engine.mount(GAME, SubscriptionId::new()).await;
        fx.drain();

        let resigned = session(SessionStatus::Resigned, 10, Color::White, Some(BOB));
        assert_eq!(
            fx.push(resigned).await,
            MergeOutcome::Applied {
                ended: true,
                notified: false
            }
        );
        assert_eq!(ended(&fx.drain()), 0);
        assert!(!fx.engine.is_polling(GAME));
    }

    #[tokio::test]
    async fn duplicate_pairs_update_the_view_once() {
        let mut fx = Fixture::new(BOB, active(4));
        fx.engine.mount(GAME, SubscriptionId::new()).await;
        fx.drain();

        assert!(matches!(fx.push(active(5)).await, MergeOutcome::Applied { .. }));
        assert_eq!(fx.poll(active(5)).await, MergeOutcome::Stale);
        assert_eq!(fx.push(active(5)).await, MergeOutcome::Stale);

        assert_eq!(updates(&fx.drain()), 1);
    }

    #[tokio::test]
    async fn older_snapshots_are_not_reapplied() {
        let mut fx = Fixture::new(BOB, active(8));
        fx.engine.mount(GAME, SubscriptionId::new()).await;
        fx.drain();

        assert_eq!(fx.push(active(7)).await, MergeOutcome::Stale);
        // Stale headers are dropped before the board is pulled.
        assert_eq!(fx.authority.board_pulls.load(Ordering::SeqCst), 1);
        assert_eq!(updates(&fx.drain()), 0);
    }

    #[tokio::test]
    async fn header_only_refresh_pulls_board_before_applying() {
        let mut fx = Fixture::new(BOB, active(4));
        fx.engine.mount(GAME, SubscriptionId::new()).await;
        *fx.authority.board.lock() = board("N");

        fx.push(active(5)).await;

        assert_eq!(fx.authority.board_pulls.load(Ordering::SeqCst), 2);
        let view = fx.store.session(1).await.unwrap();
        assert_eq!(view.session.unwrap().move_count, 5);
        assert_eq!(view.board, Some(board("N")));
    }

    #[tokio::test]
    async fn reload_pulls_even_without_change() {
        let mut fx = Fixture::new(BOB, active(4));
        fx.engine.mount(GAME, SubscriptionId::new()).await;
        fx.drain();

        let outcome = fx
            .engine
            .handle_channel(ChannelEvent {
                target: GAME,
                kind: ChannelEventKind::Message(PushMessage::Reload),
            })
            .await;

        assert!(matches!(outcome, Some(MergeOutcome::Applied { .. })));
        assert_eq!(fx.authority.session_pulls.load(Ordering::SeqCst), 2);
        assert_eq!(updates(&fx.drain()), 1);
    }

    #[tokio::test]
    async fn session_already_over_on_mount_is_torn_down_silently() {
        let over = session(SessionStatus::Completed, 40, Color::Black, Some(ALICE));
        let mut fx = Fixture::new(BOB, over.clone());
        fx.engine.mount(GAME, SubscriptionId::new()).await;

        let state = fx.engine.state(GAME).unwrap();
        assert!(state.terminal_handled());
        assert_eq!(state.phase(), Phase::Completed);
        assert!(!fx.engine.is_polling(GAME));
        assert_eq!(fx.engine.connection_state(GAME), None);

        assert_eq!(fx.push(over).await, MergeOutcome::Ended);
        assert_eq!(ended(&fx.drain()), 0);
    }

    #[tokio::test]
    async fn completion_notifies_the_side_to_move() {
        let mut fx = Fixture::new(BOB, active(20));
        fx.engine.mount(GAME, SubscriptionId::new()).await;
        fx.drain();

        let mut final_board = board("Q");
        final_board.result = Some("Checkmate! White wins.".into());
        *fx.authority.board.lock() = final_board;

        let mated = session(SessionStatus::Completed, 21, Color::Black, Some(ALICE));
        fx.poll(mated).await;

        let events = fx.drain();
        let notices: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                SyncEvent::SessionEnded(notice) => Some(notice.message().to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(notices, vec!["Checkmate! White wins.".to_string()]);
    }

    #[tokio::test]
    async fn own_action_ends_without_notice() {
        let mut fx = Fixture::new(BOB, active(20));
        fx.engine.mount(GAME, SubscriptionId::new()).await;
        fx.drain();

        // Even a response naming the viewer as the side to move is the
        // viewer's own doing.
        let mated = session(SessionStatus::Completed, 21, Color::Black, Some(BOB));
        let snapshot = Snapshot::session(mated, Some(board("Q")));
        let outcome = fx.engine.merge(Candidate::new(Source::Action, snapshot)).await;

        assert_eq!(
            outcome,
            MergeOutcome::Applied {
                ended: true,
                notified: false
            }
        );
        assert_eq!(ended(&fx.drain()), 0);
        assert!(!fx.engine.is_polling(GAME));
    }

    #[tokio::test]
    async fn unmounted_targets_discard_snapshots() {
        let mut fx = Fixture::new(BOB, active(3));
        let current = SubscriptionId::new();
        fx.engine.mount(GAME, current).await;

        assert!(!fx.engine.unmount(GAME, SubscriptionId::new()).await);
        assert!(fx.engine.state(GAME).is_some());

        assert!(fx.engine.unmount(GAME, current).await);
        assert!(fx.engine.state(GAME).is_none());
        assert!(!fx.engine.is_polling(GAME));
        assert_eq!(fx.engine.connection_state(GAME), None);
        assert!(fx.store.session(1).await.is_none());

        assert_eq!(fx.push(active(4)).await, MergeOutcome::Unmounted);
        assert!(fx.store.session(1).await.is_none());
    }

    #[tokio::test]
    async fn own_resignation_leaves_without_notice() {
        let mut fx = Fixture::new(ALICE, active(6));
        fx.engine.mount(GAME, SubscriptionId::new()).await;
        fx.drain();

        fx.engine.resigned(GAME).await;

        let events = fx.drain();
        assert!(matches!(events.as_slice(), [SyncEvent::SessionLeft { id: 1 }]));
        assert!(!fx.engine.is_polling(GAME));
        assert_eq!(fx.engine.connection_state(GAME), None);

        let echo = session(SessionStatus::Resigned, 6, Color::White, Some(BOB));
        assert_eq!(fx.push(echo).await, MergeOutcome::Unmounted);
    }

    #[tokio::test]
    async fn lobby_refresh_is_completed_and_reports_active_session_once() {
        let mut fx = Fixture::new(BOB, active(0));
        fx.engine.mount(Target::Lobby, SubscriptionId::new()).await;
        assert_eq!(fx.authority.active_pulls.load(Ordering::SeqCst), 1);
        fx.drain();

        *fx.authority.active.lock() = Some(active(0));
        let lobby = LobbyData::new(
            vec![Player {
                id: 3,
                username: "carol".into(),
            }],
            vec![],
            vec![],
        );
        let refresh = ChannelEvent {
            target: Target::Lobby,
            kind: ChannelEventKind::Message(PushMessage::LobbyRefresh(Box::new(lobby.clone()))),
        };
        fx.engine.handle_channel(refresh.clone()).await;
        assert_eq!(fx.authority.active_pulls.load(Ordering::SeqCst), 2);

        let view = fx.store.lobby().await.unwrap();
        assert_eq!(view.lobby, lobby);
        assert_eq!(view.active, Some(ActiveGame::Playing(1)));

        // Same content again: nothing new to show or report.
        assert_eq!(
            fx.engine.handle_channel(refresh).await,
            Some(MergeOutcome::Stale)
        );

        let events = fx.drain();
        let found = count(&events, |event| {
            matches!(event, SyncEvent::ActiveSessionFound { id: 1 })
        });
        assert_eq!(found, 1);
        assert_eq!(
            count(&events, |event| matches!(event, SyncEvent::LobbyUpdated(_))),
            1
        );
    }

    #[tokio::test]
    async fn failed_initial_load_is_reported_and_sync_continues() {
        let mut fx = Fixture::new(BOB, active(0));
        fx.authority.offline.store(true, Ordering::SeqCst);

        fx.engine.mount(GAME, SubscriptionId::new()).await;

        let events = fx.drain();
        assert!(matches!(
            events.as_slice(),
            [SyncEvent::LoadFailed { target: GAME, .. }]
        ));
        let state = fx.engine.state(GAME).unwrap();
        assert_eq!(state.phase(), Phase::Init);
        assert_eq!(state.last(), None);
        assert!(fx.engine.is_polling(GAME));
        assert!(fx.engine.connection_state(GAME).is_some());

        // The next push is the first observation and fills the view.
        fx.authority.offline.store(false, Ordering::SeqCst);
        assert!(matches!(fx.push(active(1)).await, MergeOutcome::Applied { .. }));
        assert!(fx.store.session(1).await.is_some());
    }

    #[tokio::test]
    async fn failed_poll_merge_rewinds_the_poller() {
        let mut fx = Fixture::new(BOB, active(4));
        fx.engine.mount(GAME, SubscriptionId::new()).await;
        fx.drain();

        // The poller moved its baseline when it reported the change.
        fx.engine
            .poller
            .seed(GAME, Fingerprint::new(SessionStatus::Active, 5));
        fx.authority.board_offline.store(true, Ordering::SeqCst);

        assert_eq!(fx.poll(active(5)).await, MergeOutcome::Failed);
        assert_eq!(
            fx.engine.poller.baseline(GAME),
            Some(Fingerprint::new(SessionStatus::Active, 4))
        );
        let view = fx.store.session(1).await.unwrap();
        assert_eq!(view.session.unwrap().move_count, 4);
        assert_eq!(updates(&fx.drain()), 0);

        // The next tick offers the same change again and it goes through.
        fx.authority.board_offline.store(false, Ordering::SeqCst);
        assert!(matches!(fx.poll(active(5)).await, MergeOutcome::Applied { .. }));
        assert_eq!(
            fx.engine.poller.baseline(GAME),
            Some(Fingerprint::new(SessionStatus::Active, 5))
        );
        let view = fx.store.session(1).await.unwrap();
        assert_eq!(view.session.unwrap().move_count, 5);
    }

    #[tokio::test]
    async fn resignation_lost_to_a_failed_pull_is_still_announced() {
        let mut fx = Fixture::new(BOB, active(9));
        fx.engine.mount(GAME, SubscriptionId::new()).await;
        fx.drain();

        let resigned = session(SessionStatus::Resigned, 9, Color::White, Some(BOB));
        fx.authority.board_offline.store(true, Ordering::SeqCst);
        assert_eq!(fx.poll(resigned.clone()).await, MergeOutcome::Failed);
        assert!(fx.engine.is_polling(GAME));
        assert_eq!(ended(&fx.drain()), 0);

        fx.authority.board_offline.store(false, Ordering::SeqCst);
        assert_eq!(
            fx.poll(resigned).await,
            MergeOutcome::Applied {
                ended: true,
                notified: true
            }
        );
        assert_eq!(ended(&fx.drain()), 1);
    }

    #[tokio::test]
    async fn terminal_notice_survives_a_full_event_channel() {
        let mut fx = Fixture::with_capacity(BOB, active(10), 1);
        // The initial load's update fills the only slot.
        fx.engine.mount(GAME, SubscriptionId::new()).await;

        let resigned = session(SessionStatus::Resigned, 10, Color::White, Some(BOB));
        let refresh = SessionRefresh {
            session: resigned,
            board: None,
        };
        let Fixture { engine, events, .. } = &mut fx;
        let merge = engine.handle_channel(ChannelEvent {
            target: GAME,
            kind: ChannelEventKind::Message(PushMessage::SessionRefresh(Box::new(refresh))),
        });
        let consume = async {
            let mut seen = Vec::new();
            while let Some(event) = events.recv().await {
                let done = matches!(event, SyncEvent::SessionEnded(_));
                seen.push(event);
                if done {
                    break;
                }
            }
            seen
        };

        let (outcome, seen) = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            async { tokio::join!(merge, consume) },
        )
        .await
        .expect("terminal notice was dropped");

        assert_eq!(
            outcome,
            Some(MergeOutcome::Applied {
                ended: true,
                notified: true
            })
        );
        assert_eq!(ended(&seen), 1);
        assert!(matches!(seen.first(), Some(SyncEvent::SessionUpdated(_))));
    }
}
