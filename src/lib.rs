//! # Gambit Sync
//!
//! Dual-channel state synchronization for turn-based two-player game clients.
//!
//! A remote authority owns every game rule and exposes a request/response API
//! plus an unreliable push feed. This crate keeps a local view of the lobby and
//! of watched sessions consistent with that authority over two independently
//! failing channels: a persistent push socket per target and periodic polling.
//!
//! ## Features
//!
//! - **One merge point**: push refreshes, reloads, poll changes and the
//!   viewer's own write responses all go through the
//!   [`ReconciliationEngine`](engine::ReconciliationEngine)
//! - **Exactly-once endings**: a session that ends is announced (and torn
//!   down) once, however many channels report it
//! - **Monotonic views**: stale or duplicate snapshots never flicker the view
//! - **Self-healing push**: abnormal socket closures reconnect after a delay
//! - **Transport-agnostic**: implement [`Connector`]/[`Transport`] and
//!   [`Authority`] for any backend; WebSocket (`transport-websocket`) and HTTP
//!   (`transport-http`) implementations are built in
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gambit_sync::{HttpAuthority, SyncClient, SyncConfig, SyncEvent, WebSocketConnector};
//!
//! # async fn run() -> Result<(), gambit_sync::SyncError> {
//! let authority = Arc::new(HttpAuthority::new("http://localhost:8000/api")?);
//! let connector = Arc::new(WebSocketConnector::new("ws://localhost:8000"));
//! let (mut client, mut events) = SyncClient::start(authority, connector, SyncConfig::new(1));
//!
//! let game = client.watch_session(42)?;
//! if let Err(e) = game.submit_move("e2", "e4").await {
//!     eprintln!("{e}");
//! }
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SyncEvent::SessionEnded(notice) => {
//!             println!("{}", notice.message());
//!             break;
//!         }
//!         SyncEvent::Disconnected { .. } => break,
//!         _ => {}
//!     }
//! }
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod authority;
pub mod channel;
pub mod client;
pub mod engine;
pub mod error;
pub mod event;
pub mod lobby;
pub mod poller;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod snapshot;
pub mod square;
pub mod transport;
pub mod transports;
pub mod view;

// Re-export primary types for ergonomic imports.
pub use authority::Authority;
pub use channel::ConnectionState;
pub use client::{SyncClient, SyncConfig};
pub use engine::{MergeOutcome, SubscriptionId};
pub use error::{SquareRole, SyncError};
pub use event::{SyncEvent, TerminalNotice};
pub use lobby::LobbyViewModel;
pub use protocol::{PushMessage, Session, SessionStatus};
pub use registry::ConnectionRegistry;
pub use session::{ResignOutcome, SessionViewModel};
pub use snapshot::{Fingerprint, Snapshot, Target};
pub use square::Square;
pub use transport::{Connector, Transport};
pub use view::{LobbyView, SessionView};

#[cfg(feature = "transport-http")]
pub use transports::HttpAuthority;
#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
