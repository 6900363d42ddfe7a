//! Error types for the synchronization client.

use std::fmt;

use thiserror::Error;

/// Which half of a move a square belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SquareRole {
    /// The origin square.
    From,
    /// The destination square.
    To,
}

impl SquareRole {
    /// Example square shown in validation messages.
    pub fn example(self) -> &'static str {
        match self {
            Self::From => "e2",
            Self::To => "e4",
        }
    }
}

impl fmt::Display for SquareRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::From => f.write_str("from"),
            Self::To => f.write_str("to"),
        }
    }
}

/// Errors that can occur while synchronizing with the remote authority.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A push connection could not be established.
    #[error("transport connect error: {0}")]
    TransportConnect(String),

    /// Failed to send on a push connection, including the closing handshake.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from a push connection.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The push connection was already closed.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A push envelope carried an action this client does not understand.
    #[error("unsupported push action: {0}")]
    UnsupportedAction(String),

    /// A pull or write request failed below the authority (network, decoding).
    #[error("http error: {0}")]
    Http(String),

    /// The authority rejected the request. The message is surfaced verbatim.
    #[error("{message}")]
    Rejected {
        /// Human-readable message from the authority, or a generic fallback.
        message: String,
    },

    /// The requested resource does not exist (or is not visible to the viewer).
    #[error("not found")]
    NotFound,

    /// One or both squares of a move were left empty.
    #[error("Please enter both from and to squares")]
    MissingSquares,

    /// A square did not match the `[a-h][1-8]` pattern.
    #[error("Invalid {role} square: {input}. Use format like \"{}\"", .role.example())]
    InvalidSquare {
        /// Which side of the move was invalid.
        role: SquareRole,
        /// The input as typed by the user.
        input: String,
    },

    /// The client loop has shut down; no further commands are accepted.
    #[error("synchronization client is not running")]
    NotRunning,

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Shorthand for an authority rejection.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Returns `true` for errors raised locally before any request was issued.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::MissingSquares | Self::InvalidSquare { .. })
    }
}

/// A specialized [`Result`] type for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_name_their_direction() {
        let send = SyncError::TransportSend("broken pipe".into());
        assert_eq!(send.to_string(), "transport send error: broken pipe");

        let receive = SyncError::TransportReceive("reset by peer".into());
        assert_eq!(receive.to_string(), "transport receive error: reset by peer");
    }

    #[test]
    fn validation_errors_are_local() {
        assert!(SyncError::MissingSquares.is_validation());
        let invalid = SyncError::InvalidSquare {
            role: SquareRole::To,
            input: "z9".into(),
        };
        assert!(invalid.is_validation());
        assert_eq!(
            invalid.to_string(),
            "Invalid to square: z9. Use format like \"e4\""
        );
        assert!(!SyncError::rejected("Not your turn").is_validation());
        assert!(!SyncError::TransportSend("closed".into()).is_validation());
    }
}
