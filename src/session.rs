//! Session View Model: the viewer's handle on one watched session.
//!
//! Holds no state of its own beyond the subscription: the latest merged view
//! lives in the shared [`ViewStore`]. Moves and resignations go straight to
//! the authority; their results are fed back into the sync loop.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::authority::{self, Authority};
use crate::client::{Command, LoopHandle};
use crate::engine::SubscriptionId;
use crate::error::Result;
use crate::protocol::{MoveAccepted, SessionId};
use crate::snapshot::{Snapshot, Target};
use crate::square::validate_move;
use crate::view::{SessionView, ViewStore};

/// What happened to a resignation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResignOutcome {
    /// The viewer did not confirm; nothing was sent.
    Cancelled,
    /// The authority accepted the resignation and the session was left.
    Resigned,
}

/// Handle returned by [`SyncClient::watch_session`](crate::SyncClient::watch_session).
///
/// Dropping it unmounts the session.
pub struct SessionViewModel {
    id: SessionId,
    subscription: SubscriptionId,
    handle: LoopHandle,
    authority: Arc<dyn Authority>,
    store: Arc<ViewStore>,
}

impl SessionViewModel {
    pub(crate) fn new(
        id: SessionId,
        subscription: SubscriptionId,
        handle: LoopHandle,
        authority: Arc<dyn Authority>,
        store: Arc<ViewStore>,
    ) -> Self {
        Self {
            id,
            subscription,
            handle,
            authority,
            store,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn target(&self) -> Target {
        Target::Session(self.id)
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }

    /// The latest merged view, `None` until the first load completes.
    pub async fn current(&self) -> Option<SessionView> {
        self.store.session(self.id).await
    }

    /// Submit a move from `from` to `to` (e.g. `"e2"`, `"e4"`).
    ///
    /// Both squares are validated locally first; invalid input fails without
    /// any request. On success the view is updated with the returned session
    /// and its board before this returns, unless it already shows a later
    /// state. The result is then merged by the sync loop like any other
    /// snapshot.
    ///
    /// # Errors
    ///
    /// - [`SyncError::MissingSquares`](crate::SyncError::MissingSquares) /
    ///   [`SyncError::InvalidSquare`](crate::SyncError::InvalidSquare) for bad input
    /// - [`SyncError::Rejected`](crate::SyncError::Rejected) with the
    ///   authority's message verbatim
    /// - transport errors from the authority
    ///
    /// The error text is also stored in the view's `error` field while the
    /// session is watched.
    pub async fn submit_move(&self, from: &str, to: &str) -> Result<MoveAccepted> {
        let (from, to) = match validate_move(from, to) {
            Ok(squares) => squares,
            Err(e) => {
                debug!(session = self.id, error = %e, "move rejected locally");
                self.show_error(e.to_string()).await;
                return Err(e);
            }
        };

        let accepted = match self.authority.submit_move(self.id, from, to).await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!(session = self.id, error = %e, "move rejected by authority");
                self.show_error(e.to_string()).await;
                return Err(e);
            }
        };

        let message = accepted.message.clone();
        let header = Snapshot::session(accepted.session.clone(), None);
        match authority::complete(self.authority.as_ref(), header).await {
            Ok(snapshot) => {
                // A push may already have shown a later state.
                if self.store.apply_newer(&snapshot).await.is_none() {
                    debug!(session = self.id, "move response older than the view, not shown");
                }
                self.show_message(message).await;
                if let Err(e) = self.handle.send(Command::Applied(Box::new(snapshot))) {
                    debug!(session = self.id, error = %e, "sync loop gone, move not merged");
                }
            }
            Err(e) => {
                warn!(session = self.id, error = %e, "board pull after move failed, reloading");
                self.show_message(message).await;
                if let Err(e) = self.handle.send(Command::Refresh(self.target())) {
                    debug!(session = self.id, error = %e, "sync loop gone, reload skipped");
                }
            }
        }
        Ok(accepted)
    }

    /// Resign the session if `confirm` returns `true`.
    ///
    /// On success the session's connection and poller are released right away
    /// and [`SyncEvent::SessionLeft`](crate::SyncEvent::SessionLeft) is emitted;
    /// no echo from the authority is awaited.
    ///
    /// # Errors
    ///
    /// Returns the authority's error (also stored in the view) if the request
    /// fails. Nothing is torn down in that case.
    pub async fn resign(&self, confirm: impl FnOnce() -> bool) -> Result<ResignOutcome> {
        if !confirm() {
            debug!(session = self.id, "resignation cancelled");
            return Ok(ResignOutcome::Cancelled);
        }

        if let Err(e) = self.authority.resign(self.id).await {
            self.show_error(e.to_string()).await;
            return Err(e);
        }
        self.handle.send_quietly(Command::Resigned(self.target()));
        Ok(ResignOutcome::Resigned)
    }

    /// Stop watching the session. Same as dropping the view model.
    pub fn unwatch(self) {}

    /// Force a full pull of the session.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotRunning`](crate::SyncError::NotRunning) if the
    /// sync loop has stopped.
    pub fn refresh(&self) -> Result<()> {
        self.handle.send(Command::Refresh(self.target()))
    }

    async fn show_error(&self, error: String) {
        let shown = self
            .store
            .update_session(self.id, |view| {
                view.error = Some(error);
                view.message = None;
            })
            .await;
        if shown.is_none() {
            debug!(session = self.id, "no session view, error not shown");
        }
    }

    async fn show_message(&self, message: String) {
        let shown = self
            .store
            .update_session(self.id, |view| {
                view.message = Some(message).filter(|message| !message.is_empty());
                view.error = None;
            })
            .await;
        if shown.is_none() {
            debug!(session = self.id, "no session view, message not shown");
        }
    }
}

impl std::fmt::Debug for SessionViewModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionViewModel")
            .field("id", &self.id)
            .field("subscription", &self.subscription)
            .finish()
    }
}

impl Drop for SessionViewModel {
    fn drop(&mut self) {
        self.handle.send_quietly(Command::Unwatch {
            target: self.target(),
            subscription: self.subscription,
        });
    }
}
