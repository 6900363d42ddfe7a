//! Channel Connection: one push socket for one [`Target`].
//!
//! A [`ChannelConnection`] opens its socket through a [`Connector`], forwards
//! every parsed push message as a [`ChannelEvent`], and reports how the socket
//! ended. It knows nothing about other targets or about reconnecting; the
//! [`ConnectionRegistry`](crate::registry::ConnectionRegistry) owns that policy.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::protocol::PushMessage;
use crate::snapshot::Target;
use crate::transport::Connector;

/// Lifecycle of a tracked push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The socket is being opened.
    Connecting,
    /// The socket is open and delivering messages.
    Open,
    /// The socket closed abnormally and a reconnect is scheduled.
    Reconnecting,
}

/// Something that happened on a push connection.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub target: Target,
    pub kind: ChannelEventKind,
}

#[derive(Debug, Clone)]
pub enum ChannelEventKind {
    /// The socket finished its opening handshake.
    Opened,
    /// A well-formed push message arrived.
    Message(PushMessage),
    /// The socket closed on its own (never sent for deliberate disconnects).
    Closed {
        /// Close code received from the peer, `None` if the socket dropped.
        code: Option<u16>,
        /// Whether a reconnect was scheduled.
        reconnecting: bool,
    },
}

/// How a connection run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// Stopped on request; the socket was closed with a normal close code.
    Shutdown,
    /// The socket closed or failed to open. `None` means no close frame.
    Closed(Option<u16>),
}

/// One push connection for one target.
pub struct ChannelConnection {
    target: Target,
    connector: Arc<dyn Connector>,
    events: mpsc::Sender<ChannelEvent>,
}

impl ChannelConnection {
    pub fn new(
        target: Target,
        connector: Arc<dyn Connector>,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Self {
        Self {
            target,
            connector,
            events,
        }
    }

    /// Open the socket and pump messages until it closes or `shutdown` fires.
    ///
    /// Dropping the `shutdown` sender counts as a shutdown request.
    /// `on_open` runs once, right after the socket is established.
    /// Malformed or unsupported messages are logged and dropped.
    pub async fn run(
        self,
        mut shutdown: oneshot::Receiver<()>,
        on_open: impl FnOnce() + Send,
    ) -> ConnectionEnd {
        let target = self.target;
        debug!(target = %target, "opening push connection");

        let connected = tokio::select! {
            connected = self.connector.connect(&target) => connected,
            _ = &mut shutdown => {
                debug!(target = %target, "push connection cancelled while connecting");
                return ConnectionEnd::Shutdown;
            }
        };
        let mut transport = match connected {
            Ok(transport) => transport,
            Err(e) => {
                warn!(target = %target, error = %e, "push connection failed");
                return ConnectionEnd::Closed(None);
            }
        };

        info!(target = %target, "push connection open");
        on_open();
        if !self.emit(ChannelEventKind::Opened).await {
            let _ = transport.close().await;
            return ConnectionEnd::Shutdown;
        }

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!(target = %target, "closing push connection");
                    if let Err(e) = transport.close().await {
                        debug!(target = %target, error = %e, "close handshake failed");
                    }
                    return ConnectionEnd::Shutdown;
                }

                frame = transport.recv() => match frame {
                    Some(Ok(text)) => match PushMessage::parse(&text, target.is_lobby()) {
                        Ok(message) => {
                            if !self.emit(ChannelEventKind::Message(message)).await {
                                let _ = transport.close().await;
                                return ConnectionEnd::Shutdown;
                            }
                        }
                        Err(e) => {
                            warn!(target = %target, error = %e, raw = %text, "dropping malformed push message");
                        }
                    },
                    Some(Err(e)) => {
                        warn!(target = %target, error = %e, "push connection failed");
                        return ConnectionEnd::Closed(None);
                    }
                    None => {
                        let code = transport.close_code();
                        info!(target = %target, ?code, "push connection closed by peer");
                        return ConnectionEnd::Closed(code);
                    }
                },
            }
        }
    }

    /// Forward an event. Returns `false` once the receiver is gone.
    async fn emit(&self, kind: ChannelEventKind) -> bool {
        let event = ChannelEvent {
            target: self.target,
            kind,
        };
        if self.events.send(event).await.is_err() {
            debug!(target = %self.target, "channel event receiver dropped");
            return false;
        }
        true
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
    use crate::error::SyncError;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    enum Frame {
        Text(&'static str),
        Fail,
        Close(Option<u16>),
    }

    struct ScriptedTransport {
        frames: Vec<Frame>,
        close_code: Option<u16>,
        closed: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn recv(&mut self) -> Option<Result<String, SyncError>> {
            if self.frames.is_empty() {
                return std::future::pending().await;
            }
            match self.frames.remove(0) {
                Frame::Text(text) => Some(Ok(text.to_string())),
                Frame::Fail => Some(Err(SyncError::TransportReceive("reset".into()))),
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
            *self.closed.lock() = true;
            Ok(())
        }
    }

    struct OneShotConnector {
        transport: Mutex<Option<ScriptedTransport>>,
    }

    #[async_trait]
    impl Connector for OneShotConnector {
        async fn connect(&self, _target: &Target) -> Result<Box<dyn Transport>, SyncError> {
            match self.transport.lock().take() {
                Some(transport) => Ok(Box::new(transport)),
                None => Err(SyncError::TransportConnect("refused".into())),
            }
        }
    }

    fn connection(
        target: Target,
        frames: Vec<Frame>,
    ) -> (
        ChannelConnection,
        mpsc::Receiver<ChannelEvent>,
        Arc<Mutex<bool>>,
    ) {
        let closed = Arc::new(Mutex::new(false));
        let connector = Arc::new(OneShotConnector {
            transport: Mutex::new(Some(ScriptedTransport {
                frames,
                close_code: None,
                closed: Arc::clone(&closed),
            })),
        });
        let (tx, rx) = mpsc::channel(16);
        (ChannelConnection::new(target, connector, tx), rx, closed)
    }

    #[tokio::test]
    async fn forwards_messages_and_reports_close_code() {
        let (conn, mut rx, _) = connection(
            Target::Session(3),
            vec![
                Frame::Text(r#"{"action":"reload"}"#),
                Frame::Close(Some(4000)),
            ],
        );
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();

        let end = conn.run(shutdown_rx, || {}).await;
        assert_eq!(end, ConnectionEnd::Closed(Some(4000)));

        assert!(matches!(rx.recv().await.unwrap().kind, ChannelEventKind::Opened));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.target, Target::Session(3));
        assert!(matches!(
            event.kind,
            ChannelEventKind::Message(PushMessage::Reload)
        ));
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped() {
        let (conn, mut rx, _) = connection(
            Target::Lobby,
            vec![
                Frame::Text("{not json"),
                Frame::Text(r#"{"action":"chat","data":{}}"#),
                Frame::Text(r#"{"action":"reload"}"#),
                Frame::Close(Some(1000)),
            ],
        );
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();

        let end = conn.run(shutdown_rx, || {}).await;
        assert_eq!(end, ConnectionEnd::Closed(Some(1000)));

        rx.recv().await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap().kind,
            ChannelEventKind::Message(PushMessage::Reload)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn receive_error_is_an_abnormal_close() {
        let (conn, _rx, _) = connection(Target::Lobby, vec![Frame::Fail]);
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        assert_eq!(
            conn.run(shutdown_rx, || {}).await,
            ConnectionEnd::Closed(None)
        );
    }

    #[tokio::test]
    async fn connect_failure_is_an_abnormal_close() {
        let connector = Arc::new(OneShotConnector {
            transport: Mutex::new(None),
        });
        let (tx, mut rx) = mpsc::channel(1);
        let conn = ChannelConnection::new(Target::Lobby, connector, tx);
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();

        let mut opened = false;
        let end = conn.run(shutdown_rx, || opened = true).await;
        assert_eq!(end, ConnectionEnd::Closed(None));
        assert!(!opened);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_closes_the_socket() {
        let (conn, mut rx, closed) = connection(Target::Session(1), vec![]);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(conn.run(shutdown_rx, || {}));
        assert!(matches!(rx.recv().await.unwrap().kind, ChannelEventKind::Opened));

        drop(shutdown_tx);
        assert_eq!(task.await.unwrap(), ConnectionEnd::Shutdown);
        assert!(*closed.lock());
    }
}
