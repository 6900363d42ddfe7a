//! Connection Registry: at most one push connection per [`Target`].
//!
//! The registry tracks zero-or-one lobby connection and any number of session
//! connections. Every operation is idempotent. Connections run as background
//! tasks and report through the [`ChannelEvent`] sender given to
//! [`ConnectionRegistry::new`].
//!
//! # Reconnection
//!
//! When a socket closes with any code other than 1000 or 1001 (or drops
//! without a close frame, or fails to open), the registry schedules exactly one
//! reconnect after `reconnect_delay`. While a reconnect is pending, further
//! abnormal closures of that target do not schedule another. When the timer
//! fires it skips if a connection for the target was opened in the meantime.
//! [`disconnect`](ConnectionRegistry::disconnect) cancels a pending reconnect.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::channel::{
    ChannelConnection, ChannelEvent, ChannelEventKind, ConnectionEnd, ConnectionState,
};
use crate::protocol::{is_intentional_close, SessionId};
use crate::snapshot::Target;
use crate::transport::Connector;

struct Slot {
    generation: u64,
    state: ConnectionState,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<Target, Slot>,
    reconnects: HashMap<Target, JoinHandle<()>>,
    next_generation: u64,
}

struct Shared {
    connector: Arc<dyn Connector>,
    events: mpsc::Sender<ChannelEvent>,
    reconnect_delay: Duration,
    inner: Mutex<Inner>,
}

/// Tracks and owns push connections keyed by [`Target`].
///
/// Cloning yields another handle to the same registry. Background tasks hold
/// only weak references, so dropping the last handle aborts every connection
/// and pending reconnect.
#[derive(Clone)]
pub struct ConnectionRegistry {
    shared: Arc<Shared>,
}

impl ConnectionRegistry {
    pub fn new(
        connector: Arc<dyn Connector>,
        events: mpsc::Sender<ChannelEvent>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                events,
                reconnect_delay,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    pub fn connect_lobby(&self) -> bool {
        self.connect(Target::Lobby)
    }

    pub fn connect_session(&self, id: SessionId) -> bool {
        self.connect(Target::Session(id))
    }

    /// Open a connection for `target`.
    ///
    /// Returns `false` without doing anything if a connection for `target` is
    /// already connecting or open.
    pub fn connect(&self, target: Target) -> bool {
        let mut inner = self.shared.inner.lock();
        if inner.slots.contains_key(&target) {
            debug!(target = %target, "already connected, ignoring connect");
            return false;
        }
        spawn_connection(&self.shared, &mut inner, target);
        true
    }

    pub fn disconnect_lobby(&self) -> bool {
        self.disconnect(Target::Lobby)
    }

    pub fn disconnect_session(&self, id: SessionId) -> bool {
        self.disconnect(Target::Session(id))
    }

    /// Close the connection for `target` and cancel any pending reconnect.
    ///
    /// The socket is closed with a normal close code, so it is never
    /// reconnected. Returns `false` if nothing was tracked for `target`.
    pub fn disconnect(&self, target: Target) -> bool {
        let mut inner = self.shared.inner.lock();
        let cancelled = cancel_reconnect(&mut inner, target);
        let closed = match inner.slots.remove(&target) {
            Some(slot) => {
                close_slot(target, slot);
                true
            }
            None => false,
        };
        cancelled || closed
    }

    /// Close every connection and cancel every pending reconnect.
    pub fn disconnect_all(&self) {
        let mut inner = self.shared.inner.lock();
        for (target, handle) in inner.reconnects.drain() {
            handle.abort();
            debug!(target = %target, "pending reconnect cancelled");
        }
        for (target, slot) in inner.slots.drain() {
            close_slot(target, slot);
        }
    }

    /// Current state of `target`'s connection, `None` if untracked.
    pub fn state(&self, target: Target) -> Option<ConnectionState> {
        let inner = self.shared.inner.lock();
        match inner.slots.get(&target) {
            Some(slot) => Some(slot.state),
            None if inner.reconnects.contains_key(&target) => Some(ConnectionState::Reconnecting),
            None => None,
        }
    }

    /// Number of live or connecting sockets.
    pub fn len(&self) -> usize {
        self.shared.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("ConnectionRegistry")
            .field("connections", &inner.slots.keys().collect::<Vec<_>>())
            .field("reconnecting", &inner.reconnects.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for (_, handle) in inner.reconnects.drain() {
            handle.abort();
        }
        for (_, slot) in inner.slots.drain() {
            slot.task.abort();
        }
    }
}

fn close_slot(target: Target, mut slot: Slot) {
    if let Some(shutdown) = slot.shutdown.take() {
        let _ = shutdown.send(());
    }
    info!(target = %target, "push connection disconnected");
}

fn cancel_reconnect(inner: &mut Inner, target: Target) -> bool {
    match inner.reconnects.remove(&target) {
        Some(handle) => {
            handle.abort();
            debug!(target = %target, "pending reconnect cancelled");
            true
        }
        None => false,
    }
}

/// Spawn a connection task for `target`. The caller holds the lock and has
/// checked that no slot exists.
fn spawn_connection(shared: &Arc<Shared>, inner: &mut Inner, target: Target) {
    let generation = inner.next_generation;
    inner.next_generation += 1;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let connection = ChannelConnection::new(
        target,
        Arc::clone(&shared.connector),
        shared.events.clone(),
    );
    let task = tokio::spawn(connection_task(
        Arc::downgrade(shared),
        connection,
        target,
        generation,
        shutdown_rx,
    ));

    inner.slots.insert(
        target,
        Slot {
            generation,
            state: ConnectionState::Connecting,
            shutdown: Some(shutdown_tx),
            task,
        },
    );
}

async fn connection_task(
    shared: Weak<Shared>,
    connection: ChannelConnection,
    target: Target,
    generation: u64,
    shutdown: oneshot::Receiver<()>,
) {
    let on_open = {
        let shared = shared.clone();
        move || {
            if let Some(shared) = shared.upgrade() {
                if let Some(slot) = shared.inner.lock().slots.get_mut(&target) {
                    if slot.generation == generation {
                        slot.state = ConnectionState::Open;
                    }
                }
            }
        }
    };

    let code = match connection.run(shutdown, on_open).await {
        ConnectionEnd::Shutdown => return,
        ConnectionEnd::Closed(code) => code,
    };

    let Some(shared) = shared.upgrade() else {
        return;
    };
    let Some(reconnecting) = on_closed(&shared, target, generation, code) else {
        return;
    };

    let event = ChannelEvent {
        target,
        kind: ChannelEventKind::Closed { code, reconnecting },
    };
    if shared.events.send(event).await.is_err() {
        debug!(target = %target, "channel event receiver dropped");
    }
}

/// Forget a closed connection and apply the reconnect policy.
///
/// Returns `None` if the slot no longer belongs to this connection (it was
/// disconnected or replaced), otherwise whether a reconnect is pending.
fn on_closed(
    shared: &Arc<Shared>,
    target: Target,
    generation: u64,
    code: Option<u16>,
) -> Option<bool> {
    let mut inner = shared.inner.lock();
    match inner.slots.get(&target) {
        Some(slot) if slot.generation == generation => {
            inner.slots.remove(&target);
        }
        _ => return None,
    }

    if is_intentional_close(code) {
        debug!(target = %target, ?code, "intentional close, not reconnecting");
        return Some(false);
    }
    if inner.reconnects.contains_key(&target) {
        debug!(target = %target, "reconnect already pending");
        return Some(true);
    }

    info!(target = %target, ?code, delay = ?shared.reconnect_delay, "abnormal close, scheduling reconnect");
    let handle = tokio::spawn(reconnect_after(
        Arc::downgrade(shared),
        target,
        shared.reconnect_delay,
    ));
    inner.reconnects.insert(target, handle);
    Some(true)
}

async fn reconnect_after(shared: Weak<Shared>, target: Target, delay: Duration) {
    tokio::time::sleep(delay).await;

    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut inner = shared.inner.lock();
    if inner.reconnects.remove(&target).is_none() {
        // Cancelled after the timer fired.
        return;
    }
    if inner.slots.contains_key(&target) {
        debug!(target = %target, "connection reopened meanwhile, skipping reconnect");
        return;
    }
    info!(target = %target, "reconnecting");
    spawn_connection(&shared, &mut inner, target);
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
    use crate::error::SyncError;
    use crate::protocol::PushMessage;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    enum Frame {
        Text(String),
        Close(Option<u16>),
    }

    /// Test-side handle of one mock socket.
    struct Socket {
        frames: mpsc::UnboundedSender<Frame>,
        closed: Arc<AtomicBool>,
    }

    impl Socket {
        fn text(&self, text: &str) {
            self.frames.send(Frame::Text(text.to_string())).unwrap();
        }

        fn close(&self, code: Option<u16>) {
            self.frames.send(Frame::Close(code)).unwrap();
        }
    }

    struct MockTransport {
        frames: mpsc::UnboundedReceiver<Frame>,
        close_code: Option<u16>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn recv(&mut self) -> Option<Result<String, SyncError>> {
            match self.frames.recv().await? {
                Frame::Text(text) => Some(Ok(text)),
                Frame::Close(code) => {
                    self.close_code = code;
                    None
                }
            }
        }

        fn close_code(&self) -> Option<u16> {
            self.close_code
        }

        async fn close(&mut self) -> Result<(), SyncError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockConnector {
        connects: AtomicUsize,
        sockets: mpsc::UnboundedSender<Socket>,
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, _target: &Target) -> Result<Box<dyn Transport>, SyncError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (frames_tx, frames_rx) = mpsc::unbounded_channel();
            let closed = Arc::new(AtomicBool::new(false));
            let _ = self.sockets.send(Socket {
                frames: frames_tx,
                closed: Arc::clone(&closed),
            });
            Ok(Box::new(MockTransport {
                frames: frames_rx,
                close_code: None,
                closed,
            }))
        }
    }

    const DELAY: Duration = Duration::from_secs(5);

    struct Harness {
        registry: ConnectionRegistry,
        connector: Arc<MockConnector>,
        sockets: mpsc::UnboundedReceiver<Socket>,
        events: mpsc::Receiver<ChannelEvent>,
    }

    impl Harness {
        fn new() -> Self {
            let (sockets_tx, sockets) = mpsc::unbounded_channel();
            let connector = Arc::new(MockConnector {
                connects: AtomicUsize::new(0),
                sockets: sockets_tx,
            });
            let (events_tx, events) = mpsc::channel(32);
            let registry = ConnectionRegistry::new(connector.clone(), events_tx, DELAY);
            Self {
                registry,
                connector,
                sockets,
                events,
            }
        }

        fn connects(&self) -> usize {
            self.connector.connects.load(Ordering::SeqCst)
        }

        /// Wait for the next socket and its `Opened` event.
        async fn next_socket(&mut self) -> Socket {
            let socket = self.sockets.recv().await.unwrap();
            let event = self.events.recv().await.unwrap();
            assert!(matches!(event.kind, ChannelEventKind::Opened));
            socket
        }

        async fn next_closed(&mut self) -> (Option<u16>, bool) {
            match self.events.recv().await.unwrap().kind {
                ChannelEventKind::Closed { code, reconnecting } => (code, reconnecting),
                other => panic!("expected Closed, got {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let mut h = Harness::new();
        assert!(h.registry.connect_lobby());
        assert!(!h.registry.connect_lobby());
        assert_eq!(h.registry.state(Target::Lobby), Some(ConnectionState::Connecting));

        let _socket = h.next_socket().await;
        assert!(!h.registry.connect_lobby());
        assert_eq!(h.registry.state(Target::Lobby), Some(ConnectionState::Open));
        assert_eq!(h.registry.len(), 1);
        assert_eq!(h.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_are_tracked_independently() {
        let h = Harness::new();
        assert!(h.registry.connect_session(1));
        assert!(h.registry.connect_session(2));
        assert!(h.registry.connect_lobby());
        assert_eq!(h.registry.len(), 3);

        assert!(h.registry.disconnect_session(1));
        assert_eq!(h.registry.len(), 2);
        assert_eq!(h.registry.state(Target::Session(1)), None);
        assert!(h.registry.state(Target::Session(2)).is_some());

        h.registry.disconnect_all();
        assert!(h.registry.is_empty());
        // Safe to repeat during teardown.
        h.registry.disconnect_all();
    }

    #[tokio::test(start_paused = true)]
    async fn abnormal_close_reconnects_exactly_once() {
        let mut h = Harness::new();
        h.registry.connect_session(7);
        let socket = h.next_socket().await;

        socket.close(Some(4000));
        assert_eq!(h.next_closed().await, (Some(4000), true));
        assert_eq!(
            h.registry.state(Target::Session(7)),
            Some(ConnectionState::Reconnecting)
        );
        assert_eq!(h.connects(), 1);

        let _second = h.next_socket().await;
        assert_eq!(h.connects(), 2);

        tokio::time::sleep(DELAY * 4).await;
        assert_eq!(h.connects(), 2);
        assert_eq!(h.registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_socket_without_close_frame_reconnects() {
        let mut h = Harness::new();
        h.registry.connect_lobby();
        let socket = h.next_socket().await;

        drop(socket);
        assert_eq!(h.next_closed().await, (None, true));
        let _second = h.next_socket().await;
        assert_eq!(h.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_reconnect_within_backoff_is_not_doubled() {
        let mut h = Harness::new();
        h.registry.connect_session(7);
        let socket = h.next_socket().await;

        socket.close(Some(1006));
        assert_eq!(h.next_closed().await, (Some(1006), true));

        // Consumer reconnects by hand before the timer fires.
        assert!(h.registry.connect_session(7));
        let _manual = h.next_socket().await;

        tokio::time::sleep(DELAY * 2).await;
        assert_eq!(h.connects(), 2);
        assert_eq!(h.registry.len(), 1);
        assert_eq!(
            h.registry.state(Target::Session(7)),
            Some(ConnectionState::Open)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn intentional_close_does_not_reconnect() {
        for code in [1000, 1001] {
            let mut h = Harness::new();
            h.registry.connect_lobby();
            let socket = h.next_socket().await;

            socket.close(Some(code));
            assert_eq!(h.next_closed().await, (Some(code), false));

            tokio::time::sleep(DELAY * 2).await;
            assert_eq!(h.connects(), 1);
            assert_eq!(h.registry.state(Target::Lobby), None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let mut h = Harness::new();
        h.registry.connect_session(3);
        let socket = h.next_socket().await;

        socket.close(Some(4001));
        assert_eq!(h.next_closed().await, (Some(4001), true));

        assert!(h.registry.disconnect_session(3));
        assert_eq!(h.registry.state(Target::Session(3)), None);

        tokio::time::sleep(DELAY * 2).await;
        assert_eq!(h.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_socket_deliberately() {
        let mut h = Harness::new();
        h.registry.connect_session(3);
        let socket = h.next_socket().await;

        assert!(h.registry.disconnect_session(3));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(socket.closed.load(Ordering::SeqCst));

        // No Closed event and no reconnect for deliberate disconnects.
        tokio::time::sleep(DELAY * 2).await;
        assert!(h.events.try_recv().is_err());
        assert_eq!(h.connects(), 1);
    }

    #[tokio::test]
    async fn disconnecting_an_absent_target_is_a_no_op() {
        let h = Harness::new();
        assert!(!h.registry.disconnect_lobby());
        assert!(!h.registry.disconnect_session(99));
        h.registry.disconnect_all();
        assert!(h.registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_messages_keep_the_connection_open() {
        let mut h = Harness::new();
        h.registry.connect_session(5);
        let socket = h.next_socket().await;

        socket.text("<<garbage>>");
        socket.text(r#"{"action":"reload"}"#);

        let event = h.events.recv().await.unwrap();
        assert!(matches!(
            event.kind,
            ChannelEventKind::Message(PushMessage::Reload)
        ));
        assert_eq!(
            h.registry.state(Target::Session(5)),
            Some(ConnectionState::Open)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_registry_aborts_connections() {
        let mut h = Harness::new();
        h.registry.connect_lobby();
        let socket = h.next_socket().await;

        drop(h.registry);
        tokio::time::sleep(Duration::from_millis(10)).await;
        // The transport was dropped with its task.
        assert!(socket.frames.is_closed());
    }
}
