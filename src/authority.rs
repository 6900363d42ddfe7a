//! The remote authority: pull and write endpoints.
//!
//! The authority owns every game rule and is always trusted. This module
//! defines what the client needs from it ([`Authority`]) and the pull helpers
//! the engine and the poller build on:
//!
//! - [`pull_summary`]: the cheap per-tick pull (session header, or the whole lobby)
//! - [`complete`]: fill in whatever detail a snapshot is missing
//! - [`pull_full`]: summary plus detail, used for reloads and the initial load

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::poller::SnapshotFetch;
use crate::protocol::{
    BoardState, ChallengeAccepted, ChallengeId, LobbyData, MoveAccepted, PlayerId, Session,
    SessionId,
};
use crate::snapshot::{ActiveGame, Snapshot, Target};
use crate::square::Square;

/// Request/response API of the remote authority.
///
/// Rejections must be reported as [`SyncError::Rejected`](crate::SyncError::Rejected)
/// carrying the authority's message verbatim (or a generic fallback).
#[async_trait]
pub trait Authority: Send + Sync + 'static {
    /// Fetch the session header (status, move count, participants).
    async fn fetch_session(&self, id: SessionId) -> Result<Session>;

    /// Fetch the viewer-specific board detail of a session.
    async fn fetch_board(&self, id: SessionId) -> Result<BoardState>;

    /// Fetch available players, pending challenges and finished sessions.
    async fn fetch_lobby(&self) -> Result<LobbyData>;

    /// Fetch the viewer's active session, if any.
    async fn fetch_active_session(&self) -> Result<Option<Session>>;

    /// Submit a move. Squares are already validated.
    async fn submit_move(&self, id: SessionId, from: Square, to: Square) -> Result<MoveAccepted>;

    /// Resign the session on behalf of the viewer.
    async fn resign(&self, id: SessionId) -> Result<()>;

    /// Challenge another player.
    async fn create_challenge(&self, player: PlayerId) -> Result<ChallengeAccepted>;

    /// Accept a pending challenge; the response carries the created session.
    async fn accept_challenge(&self, id: ChallengeId) -> Result<ChallengeAccepted>;

    /// Decline a pending challenge.
    async fn decline_challenge(&self, id: ChallengeId) -> Result<ChallengeAccepted>;
}

/// Pull the summary of `target`.
///
/// Session summaries carry no board detail. Lobby summaries are always
/// complete because the lobby has no cheaper pull.
///
/// # Errors
///
/// Propagates any error from the authority.
pub async fn pull_summary(authority: &dyn Authority, target: Target) -> Result<Snapshot> {
    match target {
        Target::Session(id) => Ok(Snapshot::session(authority.fetch_session(id).await?, None)),
        Target::Lobby => {
            let lobby = authority.fetch_lobby().await?;
            let active = active_game(authority.fetch_active_session().await?);
            Ok(Snapshot::lobby(lobby, Some(active)))
        }
    }
}

/// Pull the summary of `target` and complete it.
///
/// # Errors
///
/// Propagates any error from the authority.
pub async fn pull_full(authority: &dyn Authority, target: Target) -> Result<Snapshot> {
    let summary = pull_summary(authority, target).await?;
    complete(authority, summary).await
}

/// Fill in whatever detail `snapshot` is missing.
///
/// # Errors
///
/// Propagates any error from the authority; the partial snapshot is dropped.
pub async fn complete(authority: &dyn Authority, snapshot: Snapshot) -> Result<Snapshot> {
    if snapshot.is_complete() {
        return Ok(snapshot);
    }
    match snapshot.target() {
        Target::Session(id) => Ok(snapshot.with_board(authority.fetch_board(id).await?)),
        Target::Lobby => {
            let active = active_game(authority.fetch_active_session().await?);
            Ok(snapshot.with_active(active))
        }
    }
}

fn active_game(session: Option<Session>) -> ActiveGame {
    session
        .filter(|session| !session.status.is_terminal())
        .map_or(ActiveGame::Idle, |session| ActiveGame::Playing(session.id))
}

/// Adapts an [`Authority`] to the poller's [`SnapshotFetch`] using
/// [`pull_summary`].
#[derive(Clone)]
pub struct AuthorityFetch {
    authority: Arc<dyn Authority>,
}

impl AuthorityFetch {
    pub fn new(authority: Arc<dyn Authority>) -> Self {
        Self { authority }
    }
}

#[async_trait]
impl SnapshotFetch for AuthorityFetch {
    async fn fetch(&self, target: Target) -> Result<Snapshot> {
        pull_summary(self.authority.as_ref(), target).await
    }
}
