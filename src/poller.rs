//! Snapshot Poller: periodic pulls with change detection.
//!
//! Each started [`Target`] gets one background task that calls
//! [`SnapshotFetch::fetch`] every interval and forwards the snapshot as a
//! [`PollEvent`] only when its [`Fingerprint`] differs from the last one seen
//! for that target. The baseline is seeded either explicitly with
//! [`SnapshotPoller::seed`] (after the initial load) or silently by the first
//! successful poll. Failed fetches are logged and the task keeps ticking.
//!
//! The baseline moves as soon as a change is reported. A consumer that fails
//! to act on a [`PollEvent`] hands the change back with
//! [`SnapshotPoller::rewind`] so the next tick reports it again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::Result;
use crate::snapshot::{Fingerprint, Snapshot, Target};

/// Pulls the current snapshot of a target.
#[async_trait]
pub trait SnapshotFetch: Send + Sync + 'static {
    async fn fetch(&self, target: Target) -> Result<Snapshot>;
}

/// A polled snapshot whose fingerprint changed.
#[derive(Debug, Clone)]
pub struct PollEvent {
    pub target: Target,
    pub snapshot: Snapshot,
}

/// What the poll loop compares fetched snapshots against.
#[derive(Debug, Clone, Copy, Default)]
struct Watermark {
    last: Option<Fingerprint>,
    /// Report the next observation even though there is no baseline.
    reoffer: bool,
}

impl Watermark {
    /// Move to `fingerprint`. Returns `true` if it should be reported.
    fn advance(&mut self, fingerprint: Fingerprint) -> bool {
        let reoffer = std::mem::take(&mut self.reoffer);
        match self.last.replace(fingerprint) {
            Some(previous) => previous != fingerprint,
            None => reoffer,
        }
    }
}

type Baseline = Arc<Mutex<Watermark>>;

struct PollTask {
    baseline: Baseline,
    handle: JoinHandle<()>,
}

/// Owns one polling task per target.
pub struct SnapshotPoller {
    tasks: HashMap<Target, PollTask>,
    events: mpsc::Sender<PollEvent>,
}

impl SnapshotPoller {
    /// Create a poller that reports changes on `events`.
    pub fn new(events: mpsc::Sender<PollEvent>) -> Self {
        Self {
            tasks: HashMap::new(),
            events,
        }
    }

    /// Start polling `target` every `interval`.
    ///
    /// The first tick fires one interval from now. Returns `false` (and does
    /// nothing) if `target` is already being polled.
    pub fn start(
        &mut self,
        target: Target,
        interval: Duration,
        fetch: Arc<dyn SnapshotFetch>,
    ) -> bool {
        if self.tasks.contains_key(&target) {
            debug!(target = %target, "poller already running");
            return false;
        }

        let baseline: Baseline = Arc::new(Mutex::new(Watermark::default()));
        let handle = tokio::spawn(poll_loop(
            target,
            interval,
            fetch,
            Arc::clone(&baseline),
            self.events.clone(),
        ));
        self.tasks.insert(target, PollTask { baseline, handle });
        debug!(target = %target, ?interval, "poller started");
        true
    }

    /// Record `fingerprint` as the last observed state of `target`.
    ///
    /// Polls returning this fingerprint stay silent. No-op for targets that
    /// are not being polled.
    pub fn seed(&self, target: Target, fingerprint: Fingerprint) {
        if let Some(task) = self.tasks.get(&target) {
            *task.baseline.lock() = Watermark {
                last: Some(fingerprint),
                reoffer: false,
            };
        }
    }

    /// Put the baseline of `target` back to `last`, the state its consumer
    /// actually holds.
    ///
    /// Any change reported since is reported again on the next tick. With
    /// `last == None` the next successful poll is reported whatever it
    /// returns instead of seeding silently.
    pub fn rewind(&self, target: Target, last: Option<Fingerprint>) {
        if let Some(task) = self.tasks.get(&target) {
            debug!(target = %target, ?last, "poll baseline rewound");
            *task.baseline.lock() = Watermark {
                last,
                reoffer: last.is_none(),
            };
        }
    }

    /// The baseline currently held for `target`.
    pub fn baseline(&self, target: Target) -> Option<Fingerprint> {
        self.tasks
            .get(&target)
            .and_then(|task| task.baseline.lock().last)
    }

    /// Stop polling `target`. Returns `false` if it was not being polled.
    pub fn stop(&mut self, target: Target) -> bool {
        match self.tasks.remove(&target) {
            Some(task) => {
                task.handle.abort();
                debug!(target = %target, "poller stopped");
                true
            }
            None => false,
        }
    }

    /// Stop every polling task.
    pub fn stop_all(&mut self) {
        for (target, task) in self.tasks.drain() {
            task.handle.abort();
            debug!(target = %target, "poller stopped");
        }
    }

    pub fn is_running(&self, target: Target) -> bool {
        self.tasks.contains_key(&target)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Drop for SnapshotPoller {
    fn drop(&mut self) {
        self.stop_all();
    }
}

impl std::fmt::Debug for SnapshotPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotPoller")
            .field("targets", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

async fn poll_loop(
    target: Target,
    interval: Duration,
    fetch: Arc<dyn SnapshotFetch>,
    baseline: Baseline,
    events: mpsc::Sender<PollEvent>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let snapshot = match fetch.fetch(target).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(target = %target, error = %e, "poll failed, will retry next tick");
                continue;
            }
        };

        let fingerprint = snapshot.fingerprint();
        let changed = {
            let mut mark = baseline.lock();
            if mark.last.is_none() && !mark.reoffer {
                debug!(target = %target, %fingerprint, "poll baseline established");
            }
            mark.advance(fingerprint)
        };

        if changed {
            debug!(target = %target, %fingerprint, "poll observed change");
            if events.send(PollEvent { target, snapshot }).await.is_err() {
                debug!(target = %target, "poll event receiver dropped, stopping");
                break;
            }
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
    use crate::error::SyncError;
    use crate::protocol::{Color, Player, Session, SessionStatus};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn snapshot(status: SessionStatus, move_count: u64) -> Snapshot {
        Snapshot::session(
            Session {
                id: 1,
                white_player: Player {
                    id: 10,
                    username: "alice".into(),
                },
                black_player: Player {
                    id: 20,
                    username: "bob".into(),
                },
                current_turn: Color::White,
                status,
                move_count,
                winner: None,
                outcome: None,
                created_at: None,
                updated_at: None,
                moves: vec![],
            },
            None,
        )
    }

    /// Replays scripted results, repeating the last one forever.
    struct Scripted {
        script: Mutex<VecDeque<Result<Snapshot>>>,
        last: Mutex<Option<Snapshot>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(script: Vec<Result<Snapshot>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SnapshotFetch for Scripted {
        async fn fetch(&self, _target: Target) -> Result<Snapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().pop_front();
            match next {
                Some(Ok(snapshot)) => {
                    *self.last.lock() = Some(snapshot.clone());
                    Ok(snapshot)
                }
                Some(Err(e)) => Err(e),
                None => self.last.lock().clone().ok_or(SyncError::NotFound),
            }
        }
    }

    const TICK: Duration = Duration::from_secs(2);
    const TARGET: Target = Target::Session(1);

    async fn assert_quiet(rx: &mut mpsc::Receiver<PollEvent>) {
        let next = tokio::time::timeout(TICK * 10, rx.recv()).await;
        assert!(next.is_err(), "unexpected poll event: {next:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn seeded_baseline_emits_only_on_change() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut poller = SnapshotPoller::new(tx);
        let fetch = Scripted::new(vec![
            Ok(snapshot(SessionStatus::Active, 4)),
            Ok(snapshot(SessionStatus::Active, 4)),
            Ok(snapshot(SessionStatus::Active, 5)),
        ]);

        assert!(poller.start(TARGET, TICK, fetch.clone()));
        poller.seed(TARGET, Fingerprint::new(SessionStatus::Active, 4));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.target, TARGET);
        assert_eq!(
            event.snapshot.fingerprint(),
            Fingerprint::new(SessionStatus::Active, 5)
        );
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 3);

        assert_quiet(&mut rx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn first_poll_seeds_silently() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut poller = SnapshotPoller::new(tx);
        let fetch = Scripted::new(vec![
            Ok(snapshot(SessionStatus::Active, 1)),
            Ok(snapshot(SessionStatus::Active, 1)),
            Ok(snapshot(SessionStatus::Resigned, 1)),
        ]);

        poller.start(TARGET, TICK, fetch);

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event.snapshot.fingerprint(),
            Fingerprint::new(SessionStatus::Resigned, 1)
        );
        assert_eq!(
            poller.baseline(TARGET),
            Some(Fingerprint::new(SessionStatus::Resigned, 1))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_errors_do_not_stop_polling() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut poller = SnapshotPoller::new(tx);
        let fetch = Scripted::new(vec![
            Err(SyncError::Http("connection reset".into())),
            Err(SyncError::Timeout),
            Ok(snapshot(SessionStatus::Active, 3)),
        ]);

        poller.start(TARGET, TICK, fetch.clone());
        poller.seed(TARGET, Fingerprint::new(SessionStatus::Active, 2));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.snapshot.fingerprint().revision, 3);
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_waits_one_interval() {
        let (tx, _rx) = mpsc::channel(8);
        let mut poller = SnapshotPoller::new(tx);
        let fetch = Scripted::new(vec![Ok(snapshot(SessionStatus::Active, 0))]);

        poller.start(TARGET, TICK, fetch.clone());
        tokio::time::sleep(TICK / 2).await;
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 0);
        tokio::time::sleep(TICK).await;
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_the_timer() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut poller = SnapshotPoller::new(tx);
        let fetch = Scripted::new(vec![Ok(snapshot(SessionStatus::Active, 0))]);

        poller.start(TARGET, TICK, fetch.clone());
        assert!(poller.stop(TARGET));
        assert!(!poller.stop(TARGET));
        assert!(poller.is_empty());

        assert_quiet(&mut rx).await;
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rewound_change_is_reported_again() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut poller = SnapshotPoller::new(tx);
        let fetch = Scripted::new(vec![Ok(snapshot(SessionStatus::Active, 5))]);

        poller.start(TARGET, TICK, fetch);
        poller.seed(TARGET, Fingerprint::new(SessionStatus::Active, 4));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.snapshot.fingerprint().revision, 5);
        assert_eq!(
            poller.baseline(TARGET),
            Some(Fingerprint::new(SessionStatus::Active, 5))
        );

        // The consumer could not apply it.
        poller.rewind(TARGET, Some(Fingerprint::new(SessionStatus::Active, 4)));

        let again = rx.recv().await.unwrap();
        assert_eq!(again.snapshot.fingerprint().revision, 5);
        assert_quiet(&mut rx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn rewind_without_baseline_reports_the_next_poll() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut poller = SnapshotPoller::new(tx);
        let fetch = Scripted::new(vec![Ok(snapshot(SessionStatus::Active, 2))]);

        poller.start(TARGET, TICK, fetch);
        poller.rewind(TARGET, None);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.snapshot.fingerprint().revision, 2);
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn stopping_an_unknown_target_is_a_no_op() {
        let (tx, _rx) = mpsc::channel(1);
        let mut poller = SnapshotPoller::new(tx);
        assert!(!poller.stop(Target::Lobby));
        poller.stop_all();
        poller.seed(Target::Lobby, Fingerprint::new(SessionStatus::Active, 1));
        poller.rewind(Target::Lobby, None);
        assert_eq!(poller.baseline(Target::Lobby), None);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_ignored() {
        let (tx, _rx) = mpsc::channel(1);
        let mut poller = SnapshotPoller::new(tx);
        let fetch = Scripted::new(vec![]);
        assert!(poller.start(TARGET, TICK, fetch.clone()));
        assert!(!poller.start(TARGET, TICK, fetch));
        assert_eq!(poller.len(), 1);
    }
}
