//! Exhaustive two-phase walk of a room's history.
//!
//! Discovery paginates forward from "now"; backfill then paginates backward
//! from the most recent event and counts what discovery missed. The engine
//! loop is the only owner of session state: the producer task hands it whole
//! pages, so every published snapshot reflects completed pages only.

pub mod control;
mod producer;
pub mod progress;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::FedProbeError;
use control::{ControlRegistry, ControlSignal, ControlStatus, SessionId};
use producer::{Producer, ProducerEvent};
pub use progress::{BackwalkProgress, Phase, PhaseProgress, Termination};
use progress::BackwalkSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn label(self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub event_ids: Vec<String>,
    /// `None` ends the phase.
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct PageFetchError(pub String);

/// Room-history transport.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(
        &self,
        room_id: &str,
        direction: Direction,
        token: Option<&str>,
        limit: u32,
    ) -> Result<Page, PageFetchError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackwalkPolicy {
    pub per_iteration: u32,
    pub snapshot_interval: Duration,
    /// Backoffs at or below this are skipped.
    pub backoff_threshold: Duration,
    /// Multiplier applied to the last page's latency.
    pub backoff_factor: f64,
    pub max_backoff: Duration,
    /// Consecutive failures of one token tolerated before giving up.
    pub max_retries: u32,
    pub retry_base: Duration,
}

impl Default for BackwalkPolicy {
    fn default() -> Self {
        Self {
            per_iteration: 1000,
            snapshot_interval: Duration::from_secs(5),
            backoff_threshold: Duration::from_secs(1),
            backoff_factor: 0.5,
            max_backoff: Duration::from_secs(30),
            max_retries: 5,
            retry_base: Duration::from_millis(500),
        }
    }
}

impl BackwalkPolicy {
    pub fn next_backoff(&self, elapsed: Duration) -> Duration {
        elapsed.mul_f64(self.backoff_factor).min(self.max_backoff)
    }

    /// Wait before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.retry_base
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

enum PhaseEnd {
    Complete,
    Stopped,
    Failed { attempts: u32, error: String },
}

#[derive(Clone)]
pub struct BackwalkEngine {
    source: Arc<dyn PageSource>,
    policy: BackwalkPolicy,
}

impl BackwalkEngine {
    pub fn new(source: Arc<dyn PageSource>, policy: BackwalkPolicy) -> Self {
        Self { source, policy }
    }

    pub fn policy(&self) -> &BackwalkPolicy {
        &self.policy
    }

    /// Registers a session and runs it on a background task.
    pub fn start(
        &self,
        registry: &Arc<ControlRegistry>,
        room_id: impl Into<String>,
        room_depth: Option<u64>,
    ) -> BackwalkHandle {
        let (session, control) = registry.register();
        let room_id = room_id.into();
        let initial = BackwalkSession::new(session, &room_id, room_depth).snapshot();
        let (progress_tx, progress_rx) = watch::channel(initial);
        let engine = self.clone();
        let registry = registry.clone();
        let task = tokio::spawn(async move {
            let finished = engine
                .run(session, &room_id, room_depth, control, progress_tx)
                .await;
            registry.remove(session);
            finished
        });
        BackwalkHandle {
            session,
            progress: progress_rx,
            task,
        }
    }

    /// Drives both phases to completion, stop, or retry exhaustion. Every
    /// snapshot is also published on `progress`.
    pub async fn run(
        &self,
        session_id: SessionId,
        room_id: &str,
        room_depth: Option<u64>,
        mut control: watch::Receiver<ControlSignal>,
        progress: watch::Sender<BackwalkProgress>,
    ) -> BackwalkProgress {
        let mut session = BackwalkSession::new(session_id, room_id, room_depth);
        session.status = ControlStatus::from(*control.borrow_and_update());

        for direction in [Direction::Forward, Direction::Backward] {
            session.begin(direction);
            let during = session.phase;
            progress.send_replace(session.snapshot());
            info!(
                target = "fedprobe::backwalk",
                session = %session_id,
                room_id,
                phase = ?during,
                "backwalk phase started"
            );

            let end = if session.status == ControlStatus::Stopping {
                PhaseEnd::Stopped
            } else {
                self.run_phase(&mut session, room_id, direction, &mut control, &progress)
                    .await
            };
            match end {
                PhaseEnd::Complete => continue,
                PhaseEnd::Stopped => session.finish(Termination::Stopped { during }),
                PhaseEnd::Failed { attempts, error } => {
                    warn!(
                        target = "fedprobe::backwalk",
                        session = %session_id,
                        room_id,
                        phase = ?during,
                        attempts,
                        error = %error,
                        "giving up on page fetches"
                    );
                    session.finish(Termination::Failed {
                        during,
                        attempts,
                        error,
                    });
                }
            }
            break;
        }
        if session.phase != Phase::Done {
            session.finish(Termination::Completed);
        }

        let finished = session.snapshot();
        progress.send_replace(finished.clone());
        info!(
            target = "fedprobe::backwalk",
            session = %session_id,
            room_id,
            termination = ?finished.termination,
            discovered = finished.discovery.events_received,
            backfilled = finished.backfill.events_received,
            new_in_backfill = finished.backfill.new_events,
            "backwalk finished"
        );
        finished
    }

    async fn run_phase(
        &self,
        session: &mut BackwalkSession,
        room_id: &str,
        direction: Direction,
        control: &mut watch::Receiver<ControlSignal>,
        progress: &watch::Sender<BackwalkProgress>,
    ) -> PhaseEnd {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);
        let producer = Producer {
            source: self.source.clone(),
            policy: self.policy.clone(),
            room_id: room_id.to_string(),
            direction,
            control: control.clone(),
            cancel: cancel.clone(),
            events: tx,
        }
        .spawn();

        let mut ticker = tokio::time::interval(self.policy.snapshot_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        let mut control_open = true;

        let end = loop {
            tokio::select! {
                biased;
                changed = control.changed(), if control_open => {
                    if changed.is_err() {
                        control_open = false;
                        continue;
                    }
                    let signal = *control.borrow_and_update();
                    session.status = ControlStatus::from(signal);
                    progress.send_replace(session.snapshot());
                    info!(
                        target = "fedprobe::backwalk",
                        room_id,
                        direction = direction.label(),
                        signal = ?signal,
                        "backwalk control signal"
                    );
                    if signal == ControlSignal::Stop {
                        break PhaseEnd::Stopped;
                    }
                }
                event = rx.recv() => match event {
                    Some(ProducerEvent::Page { event_ids, next_token, elapsed }) => {
                        if session.apply_page(direction, event_ids, next_token, elapsed) {
                            break PhaseEnd::Complete;
                        }
                    }
                    Some(ProducerEvent::Retrying { .. }) => session.record_retry(direction),
                    Some(ProducerEvent::Exhausted { attempts, error }) => {
                        break PhaseEnd::Failed { attempts, error };
                    }
                    None if *control.borrow() == ControlSignal::Stop => {
                        session.status = ControlStatus::Stopping;
                        break PhaseEnd::Stopped;
                    }
                    None => {
                        break PhaseEnd::Failed {
                            attempts: 0,
                            error: "page producer exited unexpectedly".into(),
                        };
                    }
                },
                _ = ticker.tick() => {
                    progress.send_replace(session.snapshot());
                    debug!(
                        target = "fedprobe::backwalk",
                        room_id,
                        direction = direction.label(),
                        "progress snapshot"
                    );
                }
            }
        };

        cancel.cancel();
        drop(rx);
        if let Err(err) = producer.await {
            warn!(
                target = "fedprobe::backwalk",
                room_id,
                direction = direction.label(),
                error = %err,
                "page producer task failed"
            );
        }
        end
    }
}

/// A running session: its control id, a live progress feed, and the task.
pub struct BackwalkHandle {
    session: SessionId,
    progress: watch::Receiver<BackwalkProgress>,
    task: JoinHandle<BackwalkProgress>,
}

impl BackwalkHandle {
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn progress(&self) -> watch::Receiver<BackwalkProgress> {
        self.progress.clone()
    }

    pub fn latest(&self) -> BackwalkProgress {
        self.progress.borrow().clone()
    }

    pub async fn join(self) -> Result<BackwalkProgress, FedProbeError> {
        self.task
            .await
            .map_err(|err| FedProbeError::Task(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use parking_lot::Mutex;
    use tokio::time::Instant;

    type Step = Result<Page, PageFetchError>;

    #[derive(Default)]
    struct ScriptedSource {
        script: Mutex<HashMap<Direction, VecDeque<Step>>>,
        delay: Duration,
        endless: bool,
        calls: Mutex<Vec<(Direction, Option<String>, Instant)>>,
    }

    impl ScriptedSource {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        fn endless(delay: Duration) -> Self {
            Self {
                delay,
                endless: true,
                ..Self::default()
            }
        }

        fn push(self, direction: Direction, step: Step) -> Self {
            self.script
                .lock()
                .entry(direction)
                .or_default()
                .push_back(step);
            self
        }

        fn calls(&self, direction: Direction) -> Vec<Option<String>> {
            self.calls
                .lock()
                .iter()
                .filter(|(d, _, _)| *d == direction)
                .map(|(_, token, _)| token.clone())
                .collect()
        }
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        async fn fetch_page(
            &self,
            _room_id: &str,
            direction: Direction,
            token: Option<&str>,
            _limit: u32,
        ) -> Result<Page, PageFetchError> {
            let call = self.calls.lock().len();
            self.calls
                .lock()
                .push((direction, token.map(str::to_owned), Instant::now()));
            tokio::time::sleep(self.delay).await;
            let step = self
                .script
                .lock()
                .get_mut(&direction)
                .and_then(|steps| steps.pop_front());
            match step {
                Some(step) => step,
                None if self.endless => {
                    let id = format!("$e{call}");
                    let token = format!("t{call}");
                    Ok(page(&[id.as_str()], Some(token.as_str())))
                }
                None => Ok(Page::default()),
            }
        }
    }

    fn page(ids: &[&str], next: Option<&str>) -> Page {
        Page {
            event_ids: ids.iter().map(|id| id.to_string()).collect(),
            next_token: next.map(str::to_owned),
        }
    }

    fn engine(source: Arc<ScriptedSource>, policy: BackwalkPolicy) -> BackwalkEngine {
        BackwalkEngine::new(source, policy)
    }

    #[test_timeout::tokio_timeout_test(30, paused)]
    async fn single_pages_complete_both_phases() {
        let source = Arc::new(ScriptedSource::default());
        let registry = Arc::new(ControlRegistry::new());
        let handle = engine(source.clone(), BackwalkPolicy::default()).start(&registry, "!r:a.org", None);
        let done = handle.join().await.unwrap();

        assert_eq!(done.termination, Some(Termination::Completed));
        assert_eq!(done.phase, Phase::Done);
        assert_eq!(source.calls(Direction::Forward), vec![None]);
        assert_eq!(source.calls(Direction::Backward), vec![None]);
        assert!(done.discovery.complete && done.backfill.complete);
        assert!(registry.active().is_empty());
    }

    #[test_timeout::tokio_timeout_test(30, paused)]
    async fn counts_backfill_events_discovery_missed() {
        let source = Arc::new(
            ScriptedSource::default()
                .push(Direction::Forward, Ok(page(&["$1", "$2"], Some("f1"))))
                .push(Direction::Forward, Ok(page(&["$3"], None)))
                .push(Direction::Backward, Ok(page(&["$3", "$2", "$0"], Some("b1"))))
                .push(Direction::Backward, Ok(page(&["$1", "$-1"], None))),
        );
        let registry = Arc::new(ControlRegistry::new());
        let done = engine(source.clone(), BackwalkPolicy::default())
            .start(&registry, "!r:a.org", Some(5))
            .join()
            .await
            .unwrap();

        assert_eq!(done.discovery.events_received, 3);
        assert_eq!(done.backfill.events_received, 5);
        assert_eq!(done.backfill.new_events, 2);
        assert_eq!(source.calls(Direction::Forward), vec![None, Some("f1".into())]);
        assert_eq!(source.calls(Direction::Backward), vec![None, Some("b1".into())]);
    }

    #[test_timeout::tokio_timeout_test(60, paused)]
    async fn stop_during_discovery_skips_backfill_and_releases_tasks() {
        let source = Arc::new(ScriptedSource::endless(Duration::from_secs(2)));
        let registry = Arc::new(ControlRegistry::new());
        let engine = engine(source.clone(), BackwalkPolicy::default());
        let baseline = Arc::strong_count(&source);

        let handle = engine.start(&registry, "!r:a.org", None);
        tokio::time::sleep(Duration::from_secs(9)).await;
        registry.signal(handle.session(), ControlSignal::Stop).unwrap();
        let done = handle.join().await.unwrap();

        assert_eq!(
            done.termination,
            Some(Termination::Stopped {
                during: Phase::Discovery
            })
        );
        assert!(done.discovery.iterations >= 1);
        assert_eq!(done.backfill.iterations, 0);
        assert!(source.calls(Direction::Backward).is_empty());
        assert_eq!(Arc::strong_count(&source), baseline);

        let fetched = source.calls.lock().len();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.calls.lock().len(), fetched);
    }

    #[test_timeout::tokio_timeout_test(60, paused)]
    async fn pause_holds_the_pending_token_until_start() {
        let source = Arc::new(
            ScriptedSource::with_delay(Duration::from_secs(1))
                .push(Direction::Forward, Ok(page(&["$1"], Some("f1"))))
                .push(Direction::Forward, Ok(page(&["$2"], Some("f2"))))
                .push(Direction::Forward, Ok(page(&["$3"], None))),
        );
        let registry = Arc::new(ControlRegistry::new());
        let handle = engine(source.clone(), BackwalkPolicy::default()).start(&registry, "!r:a.org", None);

        tokio::time::sleep(Duration::from_millis(500)).await;
        registry.signal(handle.session(), ControlSignal::Pause).unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(source.calls(Direction::Forward), vec![None]);
        let paused = handle.latest();
        assert_eq!(paused.status, ControlStatus::Paused);
        assert_eq!(paused.discovery.iterations, 1);
        assert_eq!(paused.pending_token.as_deref(), Some("f1"));

        registry.signal(handle.session(), ControlSignal::Start).unwrap();
        let done = handle.join().await.unwrap();
        assert_eq!(done.termination, Some(Termination::Completed));
        assert_eq!(
            source.calls(Direction::Forward),
            vec![None, Some("f1".into()), Some("f2".into())]
        );
        assert_eq!(done.discovery.events_received, 3);
    }

    #[test_timeout::tokio_timeout_test(60, paused)]
    async fn slow_pages_are_followed_by_half_latency_backoff() {
        let source = Arc::new(
            ScriptedSource::with_delay(Duration::from_secs(4))
                .push(Direction::Forward, Ok(page(&["$1"], Some("f1"))))
                .push(Direction::Forward, Ok(page(&["$2"], None))),
        );
        let registry = Arc::new(ControlRegistry::new());
        engine(source.clone(), BackwalkPolicy::default())
            .start(&registry, "!r:a.org", None)
            .join()
            .await
            .unwrap();

        let calls = source.calls.lock();
        let gap = calls[1].2 - calls[0].2;
        assert!(gap >= Duration::from_secs(6), "gap was {gap:?}");
        assert!(gap < Duration::from_millis(6_100), "gap was {gap:?}");
    }

    #[test_timeout::tokio_timeout_test(60, paused)]
    async fn fast_pages_skip_sub_threshold_backoff() {
        let source = Arc::new(
            ScriptedSource::with_delay(Duration::from_millis(600))
                .push(Direction::Forward, Ok(page(&["$1"], Some("f1"))))
                .push(Direction::Forward, Ok(page(&["$2"], None))),
        );
        let registry = Arc::new(ControlRegistry::new());
        engine(source.clone(), BackwalkPolicy::default())
            .start(&registry, "!r:a.org", None)
            .join()
            .await
            .unwrap();

        let calls = source.calls.lock();
        assert!(calls[1].2 - calls[0].2 < Duration::from_millis(700));
    }

    #[test_timeout::tokio_timeout_test(60, paused)]
    async fn failed_fetch_retries_the_same_token() {
        let source = Arc::new(
            ScriptedSource::default()
                .push(Direction::Forward, Ok(page(&["$1"], Some("f1"))))
                .push(Direction::Forward, Err(PageFetchError("502".into())))
                .push(Direction::Forward, Err(PageFetchError("502".into())))
                .push(Direction::Forward, Ok(page(&["$2"], None))),
        );
        let registry = Arc::new(ControlRegistry::new());
        let done = engine(source.clone(), BackwalkPolicy::default())
            .start(&registry, "!r:a.org", None)
            .join()
            .await
            .unwrap();

        assert_eq!(done.termination, Some(Termination::Completed));
        assert_eq!(done.discovery.retries, 2);
        assert_eq!(
            source.calls(Direction::Forward),
            vec![None, Some("f1".into()), Some("f1".into()), Some("f1".into())]
        );
    }

    #[test_timeout::tokio_timeout_test(60, paused)]
    async fn retry_budget_exhaustion_fails_the_walk() {
        let mut source = ScriptedSource::default();
        for _ in 0..10 {
            source = source.push(Direction::Forward, Err(PageFetchError("timeout".into())));
        }
        let source = Arc::new(source);
        let policy = BackwalkPolicy {
            max_retries: 2,
            ..BackwalkPolicy::default()
        };
        let registry = Arc::new(ControlRegistry::new());
        let done = engine(source.clone(), policy)
            .start(&registry, "!r:a.org", None)
            .join()
            .await
            .unwrap();

        assert_eq!(
            done.termination,
            Some(Termination::Failed {
                during: Phase::Discovery,
                attempts: 3,
                error: "timeout".into()
            })
        );
        assert_eq!(source.calls(Direction::Forward).len(), 3);
        assert!(source.calls(Direction::Backward).is_empty());
    }

    #[test_timeout::tokio_timeout_test(60, paused)]
    async fn snapshots_taken_mid_fetch_show_completed_pages_only() {
        let source = Arc::new(
            ScriptedSource::with_delay(Duration::from_secs(3))
                .push(Direction::Forward, Ok(page(&["$1", "$2"], Some("f1"))))
                .push(Direction::Forward, Ok(page(&["$3", "$4"], None))),
        );
        let policy = BackwalkPolicy {
            snapshot_interval: Duration::from_secs(1),
            ..BackwalkPolicy::default()
        };
        let registry = Arc::new(ControlRegistry::new());
        let handle = engine(source.clone(), policy).start(&registry, "!r:a.org", Some(4));

        tokio::time::sleep(Duration::from_millis(6_200)).await;
        let mid = handle.latest();
        assert_eq!(mid.phase, Phase::Discovery);
        assert_eq!(mid.discovery.iterations, 1);
        assert_eq!(mid.discovery.events_received, 2);
        assert_eq!(mid.pending_token.as_deref(), Some("f1"));

        let done = handle.join().await.unwrap();
        assert_eq!(done.discovery.events_received, 4);
    }

    #[test]
    fn retry_delay_doubles_up_to_the_cap() {
        let policy = BackwalkPolicy {
            retry_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            ..BackwalkPolicy::default()
        };
        assert_eq!(policy.retry_delay(1), Duration::from_secs(1));
        assert_eq!(policy.retry_delay(2), Duration::from_secs(2));
        assert_eq!(policy.retry_delay(3), Duration::from_secs(4));
        assert_eq!(policy.retry_delay(4), Duration::from_secs(5));
        assert_eq!(policy.retry_delay(40), Duration::from_secs(5));
        assert_eq!(
            policy.next_backoff(Duration::from_secs(60)),
            Duration::from_secs(5)
        );
    }
}
