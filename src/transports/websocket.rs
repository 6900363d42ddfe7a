//! WebSocket push transport using `tokio-tungstenite`.
//!
//! [`WebSocketConnector`] maps a [`Target`] to the authority's push endpoint
//! (`/ws/lobby/` or `/ws/game/{id}/`) and opens a [`WebSocketTransport`] for it.
//! Both `ws://` and `wss://` URLs are supported; TLS is handled transparently
//! via [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
//!
//! # Feature gate
//!
//! This module is only available when the `transport-websocket` feature is enabled
//! (it is enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), gambit_sync::SyncError> {
//! use gambit_sync::{Connector, Target, Transport, WebSocketConnector};
//!
//! let connector = WebSocketConnector::new("ws://localhost:8000");
//! let mut socket = connector.connect(&Target::Lobby).await?;
//!
//! if let Some(Ok(frame)) = socket.recv().await {
//!     println!("push: {frame}");
//! }
//!
//! socket.close().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};

use crate::error::SyncError;
use crate::snapshot::Target;
use crate::transport::{Connector, Transport};

/// Type alias for the underlying WebSocket stream.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Transport`] backed by a WebSocket connection.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) is cancel-safe. Dropping its future before it
/// completes does not lose frames.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
    close_code: Option<u16>,
}

impl WebSocketTransport {
    /// Establish a WebSocket connection to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Io`] if the URL is invalid or the connection cannot
    /// be established. An underlying I/O error keeps its
    /// [`ErrorKind`](std::io::ErrorKind); everything else maps to
    /// [`ErrorKind::Other`](std::io::ErrorKind::Other).
    pub async fn connect(url: &str) -> Result<Self, SyncError> {
        tracing::debug!(url = %url, "connecting to push endpoint");

        let (stream, _response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            let kind = match &e {
                tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
                _ => std::io::ErrorKind::Other,
            };
            SyncError::Io(std::io::Error::new(kind, e))
        })?;

        tracing::info!(url = %url, "push connection established");

        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-established stream (custom TLS, cookies, proxies).
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
            close_code: None,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn recv(&mut self) -> Option<Result<String, SyncError>> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Some(Err(SyncError::TransportReceive(e.to_string())));
                }
                None => return None,
            };

            match msg {
                Message::Text(text) => return Some(Ok(text.to_string())),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "received close frame");
                    self.close_code = frame.map(|frame| u16::from(frame.code));
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) => {
                    // tungstenite queues the pong itself.
                }
                Message::Binary(_) => {
                    tracing::warn!("received unexpected binary frame, skipping");
                }
                Message::Frame(_) => {
                    tracing::debug!("received raw frame, skipping");
                }
            }
        }
    }

    fn close_code(&self) -> Option<u16> {
        self.close_code
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }))
            .await
            .map_err(|e| SyncError::TransportSend(e.to_string()))
    }
}

/// Opens [`WebSocketTransport`]s against the authority's push endpoints.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    base_url: String,
    connect_timeout: Option<Duration>,
}

impl WebSocketConnector {
    /// Create a connector for `base_url` (e.g. `ws://localhost:8000`).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            connect_timeout: None,
        }
    }

    /// Fail connection attempts that take longer than `timeout`.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// The push endpoint URL for `target`.
    pub fn url_for(&self, target: &Target) -> String {
        match target {
            Target::Lobby => format!("{}/ws/lobby/", self.base_url),
            Target::Session(id) => format!("{}/ws/game/{id}/", self.base_url),
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, target: &Target) -> Result<Box<dyn Transport>, SyncError> {
        let url = self.url_for(target);
        let transport = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, WebSocketTransport::connect(&url))
                .await
                .map_err(|_| SyncError::Timeout)??,
            None => WebSocketTransport::connect(&url).await?,
        };
        Ok(Box::new(transport))
    }
}

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

    #[test]
    fn websocket_transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
    }

    #[test]
    fn connector_builds_target_urls() {
        let connector = WebSocketConnector::new("ws://chess.local:8000/");
        assert_eq!(
            connector.url_for(&Target::Lobby),
            "ws://chess.local:8000/ws/lobby/"
        );
        assert_eq!(
            connector.url_for(&Target::Session(17)),
            "ws://chess.local:8000/ws/game/17/"
        );
    }

    #[tokio::test]
    async fn connect_fails_with_invalid_url() {
        let result = WebSocketTransport::connect("not-a-valid-url").await;
        assert!(matches!(result.unwrap_err(), SyncError::Io(_)));
    }

    #[tokio::test]
    async fn connect_fails_with_unreachable_host() {
        let connector = WebSocketConnector::new("ws://127.0.0.1:1");
        let result = connector.connect(&Target::Lobby).await;
        assert!(matches!(result, Err(SyncError::Io(_))));
    }

    // ── Mock-server helpers ──────────────────────────────────────────

    use tokio::net::TcpListener;

    /// Start a local WebSocket server that runs `handler` on the accepted
    /// connection and returns the address to connect to.
    async fn start_mock_server<F, Fut>(handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });

        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn recv_yields_text_then_codeless_close() {
        let url = start_mock_server(|mut ws| async move {
            ws.send(Message::Text(r#"{"action":"reload"}"#.into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        let frame = transport.recv().await.unwrap().unwrap();
        assert_eq!(frame, r#"{"action":"reload"}"#);

        assert!(transport.recv().await.is_none());
        // A close frame without a payload carries no code.
        assert_eq!(transport.close_code(), None);
    }

    #[tokio::test]
    async fn recv_records_application_close_code() {
        let url = start_mock_server(|mut ws| async move {
            ws.close(Some(CloseFrame {
                code: CloseCode::Library(4000),
                reason: "restart".into(),
            }))
            .await
            .unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        assert!(transport.recv().await.is_none());
        assert_eq!(transport.close_code(), Some(4000));
    }

    #[tokio::test]
    async fn recv_records_going_away() {
        let url = start_mock_server(|mut ws| async move {
            ws.close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "".into(),
            }))
            .await
            .unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        assert!(transport.recv().await.is_none());
        assert_eq!(transport.close_code(), Some(1001));
    }

    #[tokio::test]
    async fn recv_skips_binary_frames() {
        let url = start_mock_server(|mut ws| async move {
            ws.send(Message::Binary(vec![0xDE, 0xAD].into()))
                .await
                .unwrap();
            ws.send(Message::Text("after_binary".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        let msg = transport.recv().await.unwrap().unwrap();
        assert_eq!(msg, "after_binary");
    }

    #[tokio::test]
    async fn double_close_is_idempotent() {
        let url =
            start_mock_server(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} })
                .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn deliberate_close_sends_normal_code() {
        let (code_tx, code_rx) = tokio::sync::oneshot::channel();
        let url = start_mock_server(|mut ws| async move {
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Close(frame) = msg {
                    let _ = code_tx.send(frame.map(|f| u16::from(f.code)));
                    break;
                }
            }
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close().await.unwrap();
        assert_eq!(code_rx.await.unwrap(), Some(1000));
    }

    #[tokio::test]
    async fn connector_times_out() {
        // Accepts TCP but never answers the WebSocket handshake.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = WebSocketConnector::new(format!("ws://{addr}"))
            .with_connect_timeout(Duration::from_millis(50));
        let result = connector.connect(&Target::Session(1)).await;
        assert!(matches!(result, Err(SyncError::Timeout)));
        drop(listener);
    }
}
