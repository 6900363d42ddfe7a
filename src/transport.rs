//! Push transport abstraction.
//!
//! The push channel is receive-only: the authority sends `{action, data}` JSON
//! text frames and the client never writes to it. A [`Transport`] is one open
//! socket for one [`Target`]; a [`Connector`] knows how to open one. The
//! registry needs the connector (not a ready-made transport) because the
//! reconnection policy has to open fresh sockets on its own.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use gambit_sync::error::SyncError;
//! use gambit_sync::snapshot::Target;
//! use gambit_sync::transport::{Connector, Transport};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn recv(&mut self) -> Option<Result<String, SyncError>> {
//!         // Return the next JSON text frame, or None once closed
//!         None
//!     }
//!
//!     fn close_code(&self) -> Option<u16> {
//!         Some(1000)
//!     }
//!
//!     async fn close(&mut self) -> Result<(), SyncError> {
//!         Ok(())
//!     }
//! }
//!
//! struct MyConnector;
//!
//! #[async_trait]
//! impl Connector for MyConnector {
//!     async fn connect(&self, _target: &Target) -> Result<Box<dyn Transport>, SyncError> {
//!         Ok(Box::new(MyTransport {}))
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::SyncError;
use crate::snapshot::Target;

/// One open push connection.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) **MUST** be cancel-safe: the connection loop
/// races it against a shutdown signal inside `tokio::select!`.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Receive the next text frame.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete frame was received
    /// - `Some(Err(e))`: the socket failed; treated as an abnormal closure
    /// - `None`: the socket closed; see [`close_code`](Transport::close_code)
    async fn recv(&mut self) -> Option<Result<String, SyncError>>;

    /// The close code received with the closing handshake, if any.
    ///
    /// `None` after `recv` returned `None` means the socket ended without a
    /// close frame, which counts as abnormal.
    fn close_code(&self) -> Option<u16>;

    /// Close the connection deliberately (normal closure).
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TransportSend`] if the closing handshake fails.
    /// Implementations should still release resources.
    async fn close(&mut self) -> Result<(), SyncError>;
}

/// Opens push connections for targets.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a push connection for `target`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TransportConnect`] (or [`SyncError::Io`]) when the
    /// socket cannot be established.
    async fn connect(&self, target: &Target) -> Result<Box<dyn Transport>, SyncError>;
}
