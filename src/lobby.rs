//! Lobby view model: available players, challenges and finished sessions.

use std::sync::Arc;

use tracing::debug;

use crate::authority::Authority;
use crate::client::{Command, LoopHandle};
use crate::engine::SubscriptionId;
use crate::error::{Result, SyncError};
use crate::protocol::{ChallengeAccepted, ChallengeId, PlayerId, SessionId};
use crate::snapshot::Target;
use crate::view::{LobbyView, ViewStore};

/// Handle returned by [`SyncClient::watch_lobby`](crate::SyncClient::watch_lobby).
///
/// Dropping it unmounts the lobby.
pub struct LobbyViewModel {
    subscription: SubscriptionId,
    handle: LoopHandle,
    authority: Arc<dyn Authority>,
    store: Arc<ViewStore>,
}

impl LobbyViewModel {
    pub(crate) fn new(
        subscription: SubscriptionId,
        handle: LoopHandle,
        authority: Arc<dyn Authority>,
        store: Arc<ViewStore>,
    ) -> Self {
        Self {
            subscription,
            handle,
            authority,
            store,
        }
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }

    /// The latest merged lobby view, `None` until the first load completes.
    pub async fn current(&self) -> Option<LobbyView> {
        self.store.lobby().await
    }

    /// Challenge `player`. Returns the authority's confirmation text.
    ///
    /// # Errors
    ///
    /// Returns the authority's rejection verbatim (also stored in the view).
    pub async fn challenge(&self, player: PlayerId) -> Result<String> {
        let accepted = self
            .settle(self.authority.create_challenge(player).await)
            .await?;
        Ok(accepted.message)
    }

    /// Accept challenge `id` and return the session it started.
    ///
    /// # Errors
    ///
    /// Returns the authority's rejection verbatim (also stored in the view),
    /// or a rejection if the response did not include the new session.
    pub async fn accept(&self, id: ChallengeId) -> Result<SessionId> {
        let accepted = self
            .settle(self.authority.accept_challenge(id).await)
            .await?;
        match accepted.session {
            Some(session) => Ok(session.id),
            None => Err(SyncError::rejected("Failed to accept challenge")),
        }
    }

    /// Decline challenge `id`.
    ///
    /// # Errors
    ///
    /// Returns the authority's rejection verbatim (also stored in the view).
    pub async fn decline(&self, id: ChallengeId) -> Result<()> {
        self.settle(self.authority.decline_challenge(id).await)
            .await
            .map(|_| ())
    }

    /// Stop watching the lobby. Same as dropping the view model.
    pub fn unwatch(self) {}

    /// Force a full pull of the lobby.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotRunning`] if the sync loop has stopped.
    pub fn refresh(&self) -> Result<()> {
        self.handle.send(Command::Refresh(Target::Lobby))
    }

    /// Show the outcome of a challenge operation and reload after success.
    async fn settle(&self, result: Result<ChallengeAccepted>) -> Result<ChallengeAccepted> {
        match result {
            Ok(accepted) => {
                let message = accepted.message.clone();
                self.store
                    .update_lobby(|view| {
                        view.message = Some(message).filter(|message| !message.is_empty());
                        view.error = None;
                    })
                    .await;
                if let Err(e) = self.refresh() {
                    debug!(error = %e, "lobby reload after challenge update skipped");
                }
                Ok(accepted)
            }
            Err(e) => {
                let error = e.to_string();
                self.store
                    .update_lobby(|view| {
                        view.error = Some(error);
                        view.message = None;
                    })
                    .await;
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for LobbyViewModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LobbyViewModel")
            .field("subscription", &self.subscription)
            .finish()
    }
}

impl Drop for LobbyViewModel {
    fn drop(&mut self) {
        self.handle.send_quietly(Command::Unwatch {
            target: Target::Lobby,
            subscription: self.subscription,
        });
    }
}
