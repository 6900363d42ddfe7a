//! Concrete transports for the push and pull channels.
//!
//! Each implementation sits behind a feature gate:
//!
//! | Feature                | Provides |
//! |------------------------|----------|
//! | `transport-websocket`  | [`WebSocketConnector`] / [`WebSocketTransport`] (push) |
//! | `transport-http`       | [`HttpAuthority`] (pull + write) |
//!
//! # Example
//!
//! ```rust,ignore
//! use gambit_sync::{HttpAuthority, WebSocketConnector};
//!
//! let authority = HttpAuthority::new("http://localhost:8000/api")?;
//! let connector = WebSocketConnector::new("ws://localhost:8000");
//! ```

#[cfg(feature = "transport-websocket")]
pub mod websocket;

#[cfg(feature = "transport-http")]
pub mod http;

#[cfg(feature = "transport-websocket")]
pub use websocket::{WebSocketConnector, WebSocketTransport};

#[cfg(feature = "transport-http")]
pub use http::HttpAuthority;
