//! # Watch Session Example
//!
//! Follows one game session from the terminal:
//!
//! 1. Load the session over HTTP and open its push socket
//! 2. Print every merged view update
//! 3. Optionally submit one move given on the command line
//! 4. Print the ending notice and exit when the opponent resigns or the
//!    game completes
//!
//! ## Running
//!
//! ```sh
//! # Start the game server on localhost:8000, then:
//! GAMBIT_VIEWER=1 GAMBIT_SESSION=42 cargo run --example watch_session
//!
//! # Submit e2-e4 first and point at another server:
//! GAMBIT_API_URL=http://host:8000/api GAMBIT_WS_URL=ws://host:8000 \
//!     GAMBIT_VIEWER=1 GAMBIT_SESSION=42 cargo run --example watch_session -- e2 e4
//! ```

use std::sync::Arc;

use gambit_sync::{HttpAuthority, SyncClient, SyncConfig, SyncEvent, WebSocketConnector};

/// Default pull/write API when `GAMBIT_API_URL` is not set.
const DEFAULT_API_URL: &str = "http://localhost:8000/api";

/// Default push endpoint when `GAMBIT_WS_URL` is not set.
const DEFAULT_WS_URL: &str = "ws://localhost:8000";

fn env_id(name: &str) -> Result<u64, Box<dyn std::error::Error>> {
    let value = std::env::var(name).map_err(|_| format!("{name} must be set"))?;
    Ok(value
        .parse::<u64>()
        .map_err(|_| format!("{name} must be a number"))?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=gambit_sync=debug` to see every merge decision.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let api_url = std::env::var("GAMBIT_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
    let ws_url = std::env::var("GAMBIT_WS_URL").unwrap_or_else(|_| DEFAULT_WS_URL.to_string());
    let viewer = env_id("GAMBIT_VIEWER")?;
    let session = env_id("GAMBIT_SESSION")?;
    let mut args = std::env::args().skip(1);
    let requested_move = args.next().zip(args.next());

    tracing::info!("Watching session {session} as player {viewer} via {api_url}");

    // ── Start ───────────────────────────────────────────────────────
    let authority = Arc::new(HttpAuthority::new(api_url)?);
    let connector = Arc::new(WebSocketConnector::new(ws_url));
    let (mut client, mut event_rx) =
        SyncClient::start(authority, connector, SyncConfig::new(viewer));

    let game = client.watch_session(session)?;

    if let Some((from, to)) = requested_move {
        match game.submit_move(&from, &to).await {
            Ok(accepted) => tracing::info!("{}", accepted.message),
            Err(e) => tracing::error!("Move {from}-{to} failed: {e}"),
        }
    }

    // ── Event loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else {
                    tracing::info!("Event channel closed, exiting");
                    break;
                };

                match event {
                    SyncEvent::SessionUpdated(view) => {
                        if let Some(s) = &view.session {
                            tracing::info!(
                                "Session {}: {} after {} move(s), {:?} to move",
                                s.id, s.status, s.move_count, s.current_turn
                            );
                        }
                    }

                    SyncEvent::SessionEnded(notice) => {
                        tracing::info!("{}", notice.message());
                        break;
                    }

                    SyncEvent::LoadFailed { target, error } => {
                        tracing::error!("Loading {target} failed: {error}");
                    }

                    SyncEvent::ChannelClosed { target, code, reconnecting } => {
                        tracing::warn!(
                            "Push for {target} closed ({code:?}), reconnecting={reconnecting}"
                        );
                    }

                    SyncEvent::Disconnected { reason } => {
                        tracing::warn!("Disconnected: {}", reason.as_deref().unwrap_or("unknown"));
                        break;
                    }

                    other => {
                        tracing::debug!("Event: {other:?}");
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down…");
                break;
            }
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────────
    drop(game);
    client.shutdown().await;
    tracing::info!("Client shut down. Goodbye!");
    Ok(())
}
