//! HTTP [`Authority`] using `reqwest`.
//!
//! Endpoints (relative to the API base URL):
//!
//! | Call | Endpoint |
//! |------|----------|
//! | session header | `GET games/{id}/` |
//! | board detail | `GET games/{id}/board_state/` |
//! | active session | `GET games/active/` (404 = none) |
//! | lobby | `GET players/available/`, `challenges/pending/`, `games/history/` |
//! | move | `POST games/{id}/make_move/` |
//! | resign | `POST games/{id}/resign/` |
//! | challenges | `POST challenges/`, `challenges/{id}/accept/`, `challenges/{id}/decline/` |
//!
//! Session cookies and CSRF headers are the caller's concern: build a
//! `reqwest::Client` with them and use [`HttpAuthority::from_client`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use crate::authority::Authority;
use crate::error::{Result, SyncError};
use crate::protocol::{
    BoardState, Challenge, ChallengeAccepted, ChallengeId, LobbyData, MoveAccepted, Player,
    PlayerId, Session, SessionId,
};
use crate::square::Square;

const REQUEST_TIMEOUT_SECS: u64 = 30;
const CONNECT_TIMEOUT_SECS: u64 = 10;

const MOVE_FALLBACK: &str = "Failed to make move";
const RESIGN_FALLBACK: &str = "Failed to resign";
const CHALLENGE_FALLBACK: &str = "Failed to send challenge";
const ACCEPT_FALLBACK: &str = "Failed to accept challenge";
const DECLINE_FALLBACK: &str = "Failed to decline challenge";

/// Talks to the authority's REST API.
#[derive(Debug, Clone)]
pub struct HttpAuthority {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAuthority {
    /// Create an authority client for `base_url` (e.g. `http://localhost:8000/api`).
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Http`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| SyncError::Http(e.to_string()))?;
        Ok(Self::from_client(http, base_url))
    }

    /// Use a preconfigured client (cookies, default headers, proxies).
    pub fn from_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| SyncError::Http(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound);
        }
        if !status.is_success() {
            let body = response.json::<Value>().await.ok();
            return Err(match body.as_ref().and_then(rejection_message) {
                Some(message) => SyncError::rejected(message),
                None => SyncError::Http(format!("GET {path} returned {status}")),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::Http(e.to_string()))
    }

    async fn post(&self, path: &str, body: Option<Value>, fallback: &str) -> Result<Value> {
        let mut request = self.http.post(self.url(path));
        if let Some(body) = &body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Http(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response.json::<Value>().await.ok();
        debug!(path, status, "write request answered");
        interpret_write(status, body, fallback)
    }
}

/// The first human-readable message in an authority response body.
pub(crate) fn rejection_message(body: &Value) -> Option<String> {
    ["error", "detail", "message"]
        .iter()
        .find_map(|key| body.get(key).and_then(Value::as_str))
        .filter(|message| !message.is_empty())
        .map(str::to_string)
}

/// Decide whether a write succeeded.
///
/// Non-2xx statuses and 2xx bodies with `"success": false` are rejections.
/// The authority's message is used verbatim; `fallback` covers bodies
/// without one.
pub(crate) fn interpret_write(status: u16, body: Option<Value>, fallback: &str) -> Result<Value> {
    let accepted = (200..300).contains(&status)
        && body
            .as_ref()
            .and_then(|body| body.get("success"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
    if accepted {
        return Ok(body.unwrap_or(Value::Null));
    }
    let message = body
        .as_ref()
        .and_then(rejection_message)
        .unwrap_or_else(|| fallback.to_string());
    Err(SyncError::rejected(message))
}

#[async_trait]
impl Authority for HttpAuthority {
    async fn fetch_session(&self, id: SessionId) -> Result<Session> {
        self.get(&format!("games/{id}/")).await
    }

    async fn fetch_board(&self, id: SessionId) -> Result<BoardState> {
        self.get(&format!("games/{id}/board_state/")).await
    }

    async fn fetch_lobby(&self) -> Result<LobbyData> {
        let players: Vec<Player> = self.get("players/available/").await?;
        let challenges: Vec<Challenge> = self.get("challenges/pending/").await?;
        let history: Vec<Session> = self.get("games/history/").await?;
        Ok(LobbyData::new(players, challenges, history))
    }

    async fn fetch_active_session(&self) -> Result<Option<Session>> {
        match self.get::<Value>("games/active/").await {
            Ok(body) if body.get("id").is_some() => Ok(Some(serde_json::from_value(body)?)),
            Ok(_) | Err(SyncError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn submit_move(&self, id: SessionId, from: Square, to: Square) -> Result<MoveAccepted> {
        let body = json!({
            "from_square": from.to_string(),
            "to_square": to.to_string(),
        });
        let reply = self
            .post(&format!("games/{id}/make_move/"), Some(body), MOVE_FALLBACK)
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    async fn resign(&self, id: SessionId) -> Result<()> {
        self.post(&format!("games/{id}/resign/"), None, RESIGN_FALLBACK)
            .await
            .map(|_| ())
    }

    async fn create_challenge(&self, player: PlayerId) -> Result<ChallengeAccepted> {
        let body = json!({ "challenged_id": player });
        let reply = self
            .post("challenges/", Some(body), CHALLENGE_FALLBACK)
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    async fn accept_challenge(&self, id: ChallengeId) -> Result<ChallengeAccepted> {
        let reply = self
            .post(&format!("challenges/{id}/accept/"), None, ACCEPT_FALLBACK)
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    async fn decline_challenge(&self, id: ChallengeId) -> Result<ChallengeAccepted> {
        let reply = self
            .post(&format!("challenges/{id}/decline/"), None, DECLINE_FALLBACK)
            .await?;
        Ok(serde_json::from_value(reply)?)
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
    fn url_joins_without_double_slashes() {
        let authority = HttpAuthority::new("http://localhost:8000/api/").unwrap();
        assert_eq!(
            authority.url("/games/3/"),
            "http://localhost:8000/api/games/3/"
        );
    }

    #[test]
    fn rejection_prefers_error_then_detail() {
        let body = json!({"error": "Not your turn", "detail": "ignored"});
        assert_eq!(rejection_message(&body).as_deref(), Some("Not your turn"));

        let body = json!({"detail": "Authentication credentials were not provided."});
        assert_eq!(
            rejection_message(&body).as_deref(),
            Some("Authentication credentials were not provided.")
        );
    }

    #[test]
    fn rejected_write_surfaces_authority_message_verbatim() {
        let err = interpret_write(400, Some(json!({"error": "Invalid move"})), MOVE_FALLBACK)
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid move");
    }

    #[test]
    fn rejected_write_without_message_uses_fallback() {
        let err = interpret_write(500, None, MOVE_FALLBACK).unwrap_err();
        assert_eq!(err.to_string(), "Failed to make move");
    }

    #[test]
    fn success_false_is_a_rejection() {
        let body = json!({"success": false, "message": "You have already challenged bob"});
        let err = interpret_write(200, Some(body), CHALLENGE_FALLBACK).unwrap_err();
        assert_eq!(err.to_string(), "You have already challenged bob");
    }

    #[test]
    fn success_true_passes_body_through() {
        let body = json!({"success": true, "message": "ok"});
        let value = interpret_write(201, Some(body), CHALLENGE_FALLBACK).unwrap();
        assert_eq!(value["message"], "ok");
    }
}
