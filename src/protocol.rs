//! Wire types shared with the remote authority.
//!
//! Every type in this module matches the JSON produced by the authority's
//! REST endpoints and push consumers:
//!
//! - participants are `{id, username}` objects, but `winner` may arrive as a
//!   bare id depending on the serializer in use
//! - the board detail is a separate resource (`board_state`) and is often
//!   omitted from push refreshes
//! - push frames are `{action, data}` envelopes

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SyncError};

// ── Type aliases ────────────────────────────────────────────────────

/// Identifier of a player account.
pub type PlayerId = u64;

/// Identifier of a game session.
pub type SessionId = u64;

/// Identifier of a pending challenge.
pub type ChallengeId = u64;

// ── Close codes ─────────────────────────────────────────────────────

/// WebSocket close code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// WebSocket close code for an endpoint going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// WebSocket close code reported when a socket dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Returns `true` if a closure with `code` was intentional.
///
/// Only [`CLOSE_NORMAL`] and [`CLOSE_GOING_AWAY`] count; a missing code means
/// the socket dropped without a close handshake.
pub fn is_intentional_close(code: Option<u16>) -> bool {
    matches!(code, Some(CLOSE_NORMAL | CLOSE_GOING_AWAY))
}

// ── Enums ───────────────────────────────────────────────────────────

/// Lifecycle status of a session.
///
/// `Active` is the only non-terminal status; once a session leaves it the
/// authority never mutates it again.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Completed,
    Resigned,
}

impl SessionStatus {
    /// Returns `true` for `Completed` and `Resigned`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }

    /// Ordering rank used when comparing snapshots: terminal beats active.
    pub fn rank(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Completed | Self::Resigned => 1,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Completed => f.write_str("completed"),
            Self::Resigned => f.write_str("resigned"),
        }
    }
}

/// Side to move.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    #[default]
    White,
    Black,
}

/// How a finished session ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    WhiteWins,
    BlackWins,
    Draw,
    WhiteResigned,
    BlackResigned,
}

/// Challenge lifecycle as reported by the authority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    #[default]
    Pending,
    Accepted,
    Declined,
}

// ── Structs ─────────────────────────────────────────────────────────

/// A player identity as exposed by the authority.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Player {
    pub id: PlayerId,
    pub username: String,
}

/// A reference to a participant that may be either inlined or a bare id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum ParticipantRef {
    Full(Player),
    Id(PlayerId),
}

impl ParticipantRef {
    /// The referenced player id.
    pub fn id(&self) -> PlayerId {
        match self {
            Self::Full(player) => player.id,
            Self::Id(id) => *id,
        }
    }
}

/// One authority-confirmed move.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MoveRecord {
    pub from_square: String,
    pub to_square: String,
    #[serde(default)]
    pub piece: String,
    #[serde(default)]
    pub notation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// The authority's summary of one game session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Session {
    pub id: SessionId,
    pub white_player: Player,
    pub black_player: Player,
    pub current_turn: Color,
    pub status: SessionStatus,
    pub move_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<ParticipantRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub moves: Vec<MoveRecord>,
}

impl Session {
    /// The colour `player` plays, if they take part in this session.
    pub fn color_of(&self, player: PlayerId) -> Option<Color> {
        if self.white_player.id == player {
            Some(Color::White)
        } else if self.black_player.id == player {
            Some(Color::Black)
        } else {
            None
        }
    }

    /// The other participant from `player`'s point of view.
    pub fn opponent_of(&self, player: PlayerId) -> Option<&Player> {
        match self.color_of(player)? {
            Color::White => Some(&self.black_player),
            Color::Black => Some(&self.white_player),
        }
    }

    /// Id of the winner, if any.
    pub fn winner_id(&self) -> Option<PlayerId> {
        self.winner.as_ref().map(ParticipantRef::id)
    }
}

/// Viewer-specific board detail for a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BoardState {
    /// Square name → piece symbol.
    #[serde(default)]
    pub board_dict: BTreeMap<String, String>,
    pub current_turn: Color,
    pub is_my_turn: bool,
    pub is_game_over: bool,
    #[serde(default)]
    pub result: Option<String>,
}

/// A challenge from one player to another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Challenge {
    pub id: ChallengeId,
    pub challenger: Player,
    pub challenged: Player,
    #[serde(default)]
    pub status: ChallengeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// Everything the lobby view shows.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LobbyData {
    #[serde(default)]
    pub available_players: Vec<Player>,
    #[serde(default)]
    pub pending_challenges: Vec<Challenge>,
    #[serde(default)]
    pub game_history: Vec<Session>,
}

impl LobbyData {
    /// Build lobby data, keeping only finished sessions in the history.
    pub fn new(
        available_players: Vec<Player>,
        pending_challenges: Vec<Challenge>,
        game_history: Vec<Session>,
    ) -> Self {
        Self {
            available_players,
            pending_challenges,
            game_history: game_history
                .into_iter()
                .filter(|session| session.status.is_terminal())
                .collect(),
        }
    }
}

// ── Write responses ─────────────────────────────────────────────────

/// A move accepted by the authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveAccepted {
    /// The updated session.
    #[serde(rename = "game")]
    pub session: Session,
    /// Confirmation text, e.g. `"Move made: e2 to e4"`.
    #[serde(default)]
    pub message: String,
}

/// Result of a successful challenge operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeAccepted {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<Challenge>,
    /// Present when accepting a challenge started a session.
    #[serde(default, rename = "game", skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
}

// ── Push envelopes ──────────────────────────────────────────────────

/// Raw `{action, data}` envelope as sent by the push endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    action: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// Data carried by a session refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRefresh {
    #[serde(rename = "game")]
    pub session: Session,
    #[serde(default, rename = "board_state")]
    pub board: Option<BoardState>,
}

/// A parsed push message.
#[derive(Debug, Clone)]
pub enum PushMessage {
    /// New session state. `board` is `None` when only the header was sent.
    SessionRefresh(Box<SessionRefresh>),
    /// New lobby content (without the viewer's active session).
    LobbyRefresh(Box<LobbyData>),
    /// Re-pull via the pull channel; also produced by refreshes without data.
    Reload,
}

impl PushMessage {
    /// Parse a push frame received on a connection for a lobby or a session.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Serialization`] for non-JSON frames or payloads that
    /// do not match the target kind, and [`SyncError::UnsupportedAction`] for
    /// actions other than refresh/reload.
    pub fn parse(text: &str, lobby: bool) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)?;
        match envelope.action.as_str() {
            "reload" => Ok(Self::Reload),
            "refresh" | "game_refresh" | "lobby_refresh" => {
                let Some(data) = envelope.data.filter(|data| !data.is_null()) else {
                    debug!(action = %envelope.action, "refresh without data, treating as reload");
                    return Ok(Self::Reload);
                };
                if lobby {
                    let lobby: LobbyData = serde_json::from_value(data)?;
                    Ok(Self::LobbyRefresh(Box::new(LobbyData::new(
                        lobby.available_players,
                        lobby.pending_challenges,
                        lobby.game_history,
                    ))))
                } else if data.get("game").map_or(true, serde_json::Value::is_null) {
                    debug!("session refresh without game header, treating as reload");
                    Ok(Self::Reload)
                } else {
                    Ok(Self::SessionRefresh(Box::new(serde_json::from_value(data)?)))
                }
            }
            other => Err(SyncError::UnsupportedAction(other.to_string())),
        }
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

    #[test]
    fn close_code_classification() {
        assert!(is_intentional_close(Some(1000)));
        assert!(is_intentional_close(Some(1001)));
        assert!(!is_intentional_close(Some(1006)));
        assert!(!is_intentional_close(Some(4000)));
        assert!(!is_intentional_close(None));
    }

    #[test]
    fn status_rank_orders_terminal_above_active() {
        assert!(SessionStatus::Resigned.rank() > SessionStatus::Active.rank());
        assert_eq!(
            SessionStatus::Completed.rank(),
            SessionStatus::Resigned.rank()
        );
        assert!(!SessionStatus::Active.is_terminal());
    }

    #[test]
    fn null_data_is_reload() {
        let msg = PushMessage::parse(r#"{"action":"game_refresh","data":null}"#, false).unwrap();
        assert!(matches!(msg, PushMessage::Reload));
    }
}
