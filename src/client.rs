//! Async synchronization client.
//!
//! [`SyncClient`] is a thin handle that talks to a background sync loop over an
//! unbounded command channel. The loop exclusively owns the
//! [`ReconciliationEngine`] and multiplexes consumer commands, push connection
//! events and poll changes with `tokio::select!`, handling one at a time.
//! Events are emitted on a bounded channel returned from [`SyncClient::start`].
//!
//! # Example
//!
//! ```rust,ignore
//! let authority = Arc::new(HttpAuthority::new("http://localhost:8000/api")?);
//! let connector = Arc::new(WebSocketConnector::new("ws://localhost:8000"));
//! let (client, mut events) = SyncClient::start(authority, connector, SyncConfig::new(viewer_id));
//!
//! let game = client.watch_session(42)?;
//! game.submit_move("e2", "e4").await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SyncEvent::SessionEnded(notice) => println!("{}", notice.message()),
//!         SyncEvent::Disconnected { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::authority::Authority;
use crate::channel::ChannelEvent;
use crate::engine::{Candidate, ReconciliationEngine, Source, SubscriptionId};
use crate::error::{Result, SyncError};
use crate::event::{self, SyncEvent};
use crate::lobby::LobbyViewModel;
use crate::poller::{PollEvent, SnapshotPoller};
use crate::protocol::{PlayerId, SessionId};
use crate::registry::ConnectionRegistry;
use crate::session::SessionViewModel;
use crate::snapshot::{Snapshot, Target};
use crate::transport::Connector;
use crate::view::{LobbyView, SessionView, ViewStore};

/// Default interval between lobby polls.
const DEFAULT_LOBBY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default interval between session polls.
const DEFAULT_SESSION_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default delay before reconnecting an abnormally closed push connection.
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the internal channels feeding the sync loop.
const INTERNAL_CHANNEL_CAPACITY: usize = 64;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`SyncClient`].
///
/// The only required field is the viewer's player id; it decides who gets
/// told when a session ends.
///
/// # Example
///
/// ```
/// use gambit_sync::client::SyncConfig;
/// use std::time::Duration;
///
/// let config = SyncConfig::new(7)
///     .with_session_poll_interval(Duration::from_secs(5))
///     .with_event_channel_capacity(512);
/// assert_eq!(config.viewer, 7);
/// assert_eq!(config.reconnect_delay, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Player id of the local viewer.
    pub viewer: PlayerId,
    /// Interval between lobby polls. Defaults to **2 seconds**.
    pub lobby_poll_interval: Duration,
    /// Interval between session polls. Defaults to **2 seconds**.
    pub session_poll_interval: Duration,
    /// Delay before the single reconnect attempt after an abnormal close.
    /// Defaults to **5 seconds**.
    pub reconnect_delay: Duration,
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer cannot keep up, events are dropped (with a warning
    /// logged) to avoid blocking the sync loop. The `Disconnected` event is
    /// always delivered regardless of capacity.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Timeout for the graceful shutdown.
    ///
    /// Defaults to **1 second**. A zero timeout aborts the sync loop
    /// immediately without waiting for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl SyncConfig {
    /// Create a configuration for `viewer` with default values.
    pub fn new(viewer: PlayerId) -> Self {
        Self {
            viewer,
            lobby_poll_interval: DEFAULT_LOBBY_POLL_INTERVAL,
            session_poll_interval: DEFAULT_SESSION_POLL_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_lobby_poll_interval(mut self, interval: Duration) -> Self {
        self.lobby_poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_session_poll_interval(mut self, interval: Duration) -> Self {
        self.session_poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the capacity of the bounded event channel.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Set the timeout for the graceful shutdown.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

// ── Commands ────────────────────────────────────────────────────────

/// Requests from handles and view models to the sync loop.
#[derive(Debug)]
pub(crate) enum Command {
    Watch {
        target: Target,
        subscription: SubscriptionId,
    },
    Unwatch {
        target: Target,
        subscription: SubscriptionId,
    },
    /// A write response to merge as an action-sourced snapshot.
    Applied(Box<Snapshot>),
    /// The viewer resigned the session.
    Resigned(Target),
    /// Force a full pull of a target.
    Refresh(Target),
}

/// Cloneable sender half shared by the client and its view models.
#[derive(Debug, Clone)]
pub(crate) struct LoopHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    running: Arc<AtomicBool>,
}

impl LoopHandle {
    /// Queue a command for the sync loop.
    pub(crate) fn send(&self, command: Command) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(SyncError::NotRunning);
        }
        self.cmd_tx
            .send(command)
            .map_err(|_| SyncError::NotRunning)
    }

    /// Queue a command during teardown, ignoring a stopped loop.
    pub(crate) fn send_quietly(&self, command: Command) {
        let _ = self.cmd_tx.send(command);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

// ── Client handle ───────────────────────────────────────────────────

/// Async handle to the synchronization loop.
///
/// Created via [`SyncClient::start`], which spawns the sync loop and returns
/// this handle together with an event receiver. Must be called from within a
/// tokio runtime.
pub struct SyncClient {
    handle: LoopHandle,
    authority: Arc<dyn Authority>,
    store: Arc<ViewStore>,
    viewer: PlayerId,
    /// Handle to the background sync loop task.
    task: Option<tokio::task::JoinHandle<()>>,
    /// Oneshot sender to signal the sync loop to shut down gracefully.
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl SyncClient {
    /// Start the sync loop and return a handle plus event receiver.
    ///
    /// # Arguments
    ///
    /// * `authority`: Pull and write endpoints of the remote authority.
    /// * `connector`: Opens push connections per target.
    /// * `config`: Viewer id and timing configuration.
    ///
    /// # Returns
    ///
    /// A tuple of `(client_handle, event_receiver)`. The event receiver yields
    /// [`SyncEvent`]s until the client shuts down.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start(
        authority: Arc<dyn Authority>,
        connector: Arc<dyn Connector>,
        config: SyncConfig,
    ) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        // Clamp capacity to at least 1 (tokio panics on 0).
        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel::<SyncEvent>(capacity);
        let (channel_tx, channel_rx) = mpsc::channel::<ChannelEvent>(INTERNAL_CHANNEL_CAPACITY);
        let (poll_tx, poll_rx) = mpsc::channel::<PollEvent>(INTERNAL_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let store = Arc::new(ViewStore::new());
        let running = Arc::new(AtomicBool::new(true));
        let registry = ConnectionRegistry::new(connector, channel_tx, config.reconnect_delay);
        let engine = ReconciliationEngine::new(
            config.clone(),
            Arc::clone(&authority),
            registry,
            SnapshotPoller::new(poll_tx),
            Arc::clone(&store),
            event_tx.clone(),
        );

        let task = tokio::spawn(sync_loop(
            engine,
            cmd_rx,
            channel_rx,
            poll_rx,
            event_tx,
            Arc::clone(&running),
            shutdown_rx,
        ));

        let client = Self {
            handle: LoopHandle { cmd_tx, running },
            authority,
            store,
            viewer: config.viewer,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout: config.shutdown_timeout,
        };

        (client, event_rx)
    }

    // ── Subscriptions ───────────────────────────────────────────────

    /// Mount session `id`: load it, then keep it in sync over push and poll.
    ///
    /// Dropping the returned view model unmounts the session.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotRunning`] if the sync loop has stopped.
    pub fn watch_session(&self, id: SessionId) -> Result<SessionViewModel> {
        let subscription = self.watch(Target::Session(id))?;
        Ok(SessionViewModel::new(
            id,
            subscription,
            self.handle.clone(),
            Arc::clone(&self.authority),
            Arc::clone(&self.store),
        ))
    }

    /// Mount the lobby. Dropping the returned view model unmounts it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotRunning`] if the sync loop has stopped.
    pub fn watch_lobby(&self) -> Result<LobbyViewModel> {
        let subscription = self.watch(Target::Lobby)?;
        Ok(LobbyViewModel::new(
            subscription,
            self.handle.clone(),
            Arc::clone(&self.authority),
            Arc::clone(&self.store),
        ))
    }

    /// Force a full pull of `target`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotRunning`] if the sync loop has stopped.
    pub fn refresh(&self, target: Target) -> Result<()> {
        self.handle.send(Command::Refresh(target))
    }

    fn watch(&self, target: Target) -> Result<SubscriptionId> {
        let subscription = SubscriptionId::new();
        self.handle.send(Command::Watch {
            target,
            subscription,
        })?;
        Ok(subscription)
    }

    /// Shut down the client, closing every connection and poller.
    ///
    /// After calling this method, the event receiver yields
    /// [`SyncEvent::Disconnected`] and then `None`.
    pub async fn shutdown(&mut self) {
        debug!("SyncClient: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        // Await the sync loop with a timeout. If it doesn't exit in time,
        // abort it so the task cannot detach and run indefinitely.
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("sync loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("sync loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("sync loop aborted: {join_err}");
                    }
                }
            }
        }

        self.handle.running.store(false, Ordering::Release);
    }

    // ── State accessors ─────────────────────────────────────────────

    /// Returns `true` while the sync loop accepts commands.
    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    pub fn viewer(&self) -> PlayerId {
        self.viewer
    }

    /// Current view of session `id`, if it is mounted and loaded.
    pub async fn session_view(&self, id: SessionId) -> Option<SessionView> {
        self.store.session(id).await
    }

    /// Current lobby view, if the lobby is mounted and loaded.
    pub async fn lobby_view(&self) -> Option<LobbyView> {
        self.store.lobby().await
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("viewer", &self.viewer)
            .field("running", &self.is_running())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        // No graceful path without an executor: abort the loop. Dropping the
        // engine drops the registry and the poller, which abort their tasks.
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.handle.running.store(false, Ordering::Release);
    }
}

// ── Sync loop ───────────────────────────────────────────────────────

/// Background loop owning the engine.
///
/// Exits on the shutdown signal or when every command sender is gone. Both
/// paths release all targets and emit `Disconnected`.
async fn sync_loop(
    mut engine: ReconciliationEngine,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut channel_rx: mpsc::Receiver<ChannelEvent>,
    mut poll_rx: mpsc::Receiver<PollEvent>,
    event_tx: mpsc::Sender<SyncEvent>,
    running: Arc<AtomicBool>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!("sync loop started");

    loop {
        tokio::select! {
            // Branch 1: command from the client or a view model
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => handle_command(&mut engine, cmd).await,
                    None => {
                        debug!("command channel closed, shutting down sync loop");
                        break;
                    }
                }
            }

            // Branch 2: shutdown signal
            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                break;
            }

            // Branch 3: push connection event
            Some(event) = channel_rx.recv() => {
                engine.handle_channel(event).await;
            }

            // Branch 4: poll change
            Some(event) = poll_rx.recv() => {
                engine.handle_poll(event).await;
            }
        }
    }

    running.store(false, Ordering::Release);
    engine.shutdown().await;
    event::emit_disconnected(&event_tx, Some("client shut down".into())).await;
    debug!("sync loop exited");
}

async fn handle_command(engine: &mut ReconciliationEngine, cmd: Command) {
    match cmd {
        Command::Watch {
            target,
            subscription,
        } => engine.mount(target, subscription).await,
        Command::Unwatch {
            target,
            subscription,
        } => {
            engine.unmount(target, subscription).await;
        }
        Command::Applied(snapshot) => {
            engine
                .merge(Candidate::new(Source::Action, *snapshot))
                .await;
        }
        Command::Resigned(target) => engine.resigned(target).await,
        Command::Refresh(target) => {
            engine.merge(Candidate::reload(target)).await;
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::protocol::{
        BoardState, ChallengeAccepted, ChallengeId, Color, LobbyData, MoveAccepted, Player,
        Session, SessionStatus,
    };
    use crate::square::Square;
    use crate::transport::Transport;
    use async_trait::async_trait;

    /// Authority serving one fixed session; optionally hangs forever.
    struct FixedAuthority {
        hang: bool,
    }

    fn session() -> Session {
        Session {
            id: 5,
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
            move_count: 0,
            winner: None,
            outcome: None,
            created_at: None,
            updated_at: None,
            moves: vec![],
        }
    }

    #[async_trait]
    impl Authority for FixedAuthority {
        async fn fetch_session(&self, _id: SessionId) -> Result<Session> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(session())
        }

        async fn fetch_board(&self, _id: SessionId) -> Result<BoardState> {
            Ok(BoardState {
                board_dict: Default::default(),
                current_turn: Color::White,
                is_my_turn: true,
                is_game_over: false,
                result: None,
            })
        }

        async fn fetch_lobby(&self) -> Result<LobbyData> {
            Ok(LobbyData::default())
        }

        async fn fetch_active_session(&self) -> Result<Option<Session>> {
            Ok(None)
        }

        async fn submit_move(&self, _id: SessionId, _from: Square, _to: Square) -> Result<MoveAccepted> {
            unimplemented!()
        }

        async fn resign(&self, _id: SessionId) -> Result<()> {
            unimplemented!()
        }

        async fn create_challenge(&self, _player: PlayerId) -> Result<ChallengeAccepted> {
            unimplemented!()
        }

        async fn accept_challenge(&self, _id: ChallengeId) -> Result<ChallengeAccepted> {
            unimplemented!()
        }

        async fn decline_challenge(&self, _id: ChallengeId) -> Result<ChallengeAccepted> {
            unimplemented!()
        }
    }

    struct StalledConnector;

    #[async_trait]
    impl Connector for StalledConnector {
        async fn connect(&self, _target: &Target) -> std::result::Result<Box<dyn Transport>, SyncError> {
            std::future::pending().await
        }
    }

    fn start(hang: bool, config: SyncConfig) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
        SyncClient::start(
            Arc::new(FixedAuthority { hang }),
            Arc::new(StalledConnector),
            config,
        )
    }

    #[tokio::test]
    async fn config_defaults() {
        let config = SyncConfig::new(9);
        assert_eq!(config.viewer, 9);
        assert_eq!(config.lobby_poll_interval, Duration::from_secs(2));
        assert_eq!(config.session_poll_interval, Duration::from_secs(2));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn config_builder_methods() {
        let config = SyncConfig::new(9)
            .with_lobby_poll_interval(Duration::from_millis(500))
            .with_session_poll_interval(Duration::from_secs(3))
            .with_reconnect_delay(Duration::from_secs(1))
            .with_shutdown_timeout(Duration::from_secs(4));
        assert_eq!(config.lobby_poll_interval, Duration::from_millis(500));
        assert_eq!(config.session_poll_interval, Duration::from_secs(3));
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(4));
    }

    #[tokio::test]
    async fn event_channel_capacity_is_clamped_to_one() {
        let config = SyncConfig::new(1).with_event_channel_capacity(0);
        assert_eq!(config.event_channel_capacity, 1);
    }

    #[tokio::test]
    async fn zero_event_channel_capacity_does_not_panic() {
        let mut config = SyncConfig::new(1);
        // Bypass the builder to hit the clamp in `start`.
        config.event_channel_capacity = 0;
        let (mut client, mut events) = start(false, config);
        client.shutdown().await;
        assert!(matches!(
            events.recv().await,
            Some(SyncEvent::Disconnected { .. })
        ));
    }

    #[tokio::test]
    async fn watch_session_loads_the_view() {
        let (mut client, mut events) = start(false, SyncConfig::new(2));
        let game = client.watch_session(5).unwrap();

        match events.recv().await.unwrap() {
            SyncEvent::SessionUpdated(view) => assert_eq!(view.id(), Some(5)),
            other => panic!("expected SessionUpdated, got {other:?}"),
        }
        assert!(game.current().await.is_some());
        assert!(client.session_view(5).await.is_some());

        client.shutdown().await;
    }

    #[tokio::test]
    async fn dropping_the_view_model_unmounts() {
        let (mut client, mut events) = start(false, SyncConfig::new(2));
        let game = client.watch_session(5).unwrap();
        events.recv().await.unwrap();

        drop(game);
        client.refresh(Target::Session(5)).unwrap();
        client.shutdown().await;

        // The refresh after unmount produced nothing but the final event.
        assert!(matches!(
            events.recv().await,
            Some(SyncEvent::Disconnected { .. })
        ));
        assert!(client.session_view(5).await.is_none());
    }

    #[tokio::test]
    async fn shutdown_emits_disconnected_and_stops_commands() {
        let (mut client, mut events) = start(false, SyncConfig::new(1));
        assert!(client.is_running());
        client.shutdown().await;
        assert!(!client.is_running());

        assert!(matches!(
            events.recv().await,
            Some(SyncEvent::Disconnected { reason: Some(_) })
        ));
        assert!(events.recv().await.is_none());

        assert!(matches!(
            client.watch_lobby(),
            Err(SyncError::NotRunning)
        ));
        assert!(matches!(
            client.refresh(Target::Lobby),
            Err(SyncError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn shutdown_timeout_aborts_stuck_loop() {
        let config = SyncConfig::new(1).with_shutdown_timeout(Duration::from_millis(50));
        let (mut client, _events) = start(true, config);
        client.watch_session(5).unwrap();
        // Let the loop pick up the watch and hang in the initial load.
        tokio::task::yield_now().await;

        let result = tokio::time::timeout(Duration::from_secs(2), client.shutdown()).await;
        assert!(result.is_ok(), "shutdown should not hang past its timeout");
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn drop_aborts_the_loop() {
        let (client, mut events) = start(false, SyncConfig::new(1));
        drop(client);
        // The aborted loop drops its sender without a final event.
        assert!(events.recv().await.is_none());
    }
}
