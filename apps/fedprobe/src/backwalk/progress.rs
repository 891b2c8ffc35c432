use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use super::Direction;
use super::control::{ControlStatus, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Discovery,
    Backfill,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Termination {
    Completed,
    Stopped { during: Phase },
    Failed { during: Phase, attempts: u32, error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseProgress {
    pub iterations: u64,
    /// Distinct event ids received in this phase.
    pub events_received: usize,
    /// Backfill only: distinct ids that discovery never saw.
    pub new_events: usize,
    /// Ids in the most recent page not seen earlier in this phase.
    pub last_page_new: usize,
    /// Sum of page fetch latencies.
    pub cumulative_time: Duration,
    pub retries: u64,
    pub complete: bool,
}

/// Immutable point-in-time view of a session. Counts only ever include
/// fully applied pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackwalkProgress {
    pub session: SessionId,
    pub room_id: String,
    pub phase: Phase,
    pub status: ControlStatus,
    pub room_depth: Option<u64>,
    pub discovery: PhaseProgress,
    pub backfill: PhaseProgress,
    pub pending_token: Option<String>,
    pub termination: Option<Termination>,
}

impl BackwalkProgress {
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }
}

impl fmt::Display for BackwalkProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match (&self.termination, self.status) {
            (Some(_), _) => "Done",
            (None, ControlStatus::Paused) => "Paused",
            (None, ControlStatus::Stopping) => "Stopping",
            (None, ControlStatus::Running) => "Running",
        };
        writeln!(f, "Room Back-walking Procedure: {state}")?;
        writeln!(f, "--------------------------")?;
        match self.room_depth {
            Some(depth) => writeln!(f, "Room depth reported as: {depth}")?,
            None => writeln!(f, "Room depth: unknown")?,
        }
        writeln!(
            f,
            "Events found during discovery: {}",
            self.discovery.events_received
        )?;
        writeln!(
            f,
            "  Time taken: {:.3} seconds (iter# {})",
            self.discovery.cumulative_time.as_secs_f64(),
            self.discovery.iterations
        )?;
        if self.phase != Phase::Discovery || self.backfill.iterations > 0 {
            match self.room_depth {
                Some(depth) => writeln!(f, "{} of {depth}", self.backfill.events_received)?,
                None => writeln!(f, "{} received", self.backfill.events_received)?,
            }
            writeln!(
                f,
                "Received events during backfill: {}",
                self.backfill.events_received
            )?;
            writeln!(
                f,
                "New events found during backfill: {}",
                self.backfill.new_events
            )?;
            writeln!(
                f,
                "  Time taken: {:.3} seconds (iter# {})",
                self.backfill.cumulative_time.as_secs_f64(),
                self.backfill.iterations
            )?;
            writeln!(
                f,
                "  Events found this iter: ({})",
                self.backfill.last_page_new
            )?;
        }
        let retries = self.discovery.retries + self.backfill.retries;
        if retries > 0 {
            writeln!(f, "Retried page fetches: {retries}")?;
        }
        match &self.termination {
            Some(Termination::Completed) => writeln!(f, "Done")?,
            Some(Termination::Stopped { during }) => {
                writeln!(f, "Stopped during {during:?}")?
            }
            Some(Termination::Failed {
                during,
                attempts,
                error,
            }) => writeln!(f, "Gave up during {during:?} after {attempts} attempts: {error}")?,
            None => {}
        }
        Ok(())
    }
}

/// Mutable single-owner state of one walk. Only the engine loop touches it.
pub(crate) struct BackwalkSession {
    id: SessionId,
    room_id: String,
    room_depth: Option<u64>,
    pub(crate) phase: Phase,
    pub(crate) status: ControlStatus,
    discovered: HashSet<String>,
    backfilled: HashSet<String>,
    discovery: PhaseProgress,
    backfill: PhaseProgress,
    pending_token: Option<String>,
    termination: Option<Termination>,
}

impl BackwalkSession {
    pub(crate) fn new(id: SessionId, room_id: &str, room_depth: Option<u64>) -> Self {
        Self {
            id,
            room_id: room_id.to_string(),
            room_depth,
            phase: Phase::Discovery,
            status: ControlStatus::Running,
            discovered: HashSet::new(),
            backfilled: HashSet::new(),
            discovery: PhaseProgress::default(),
            backfill: PhaseProgress::default(),
            pending_token: None,
            termination: None,
        }
    }

    pub(crate) fn begin(&mut self, direction: Direction) {
        self.phase = match direction {
            Direction::Forward => Phase::Discovery,
            Direction::Backward => Phase::Backfill,
        };
        self.pending_token = None;
    }

    fn phase_mut(&mut self, direction: Direction) -> &mut PhaseProgress {
        match direction {
            Direction::Forward => &mut self.discovery,
            Direction::Backward => &mut self.backfill,
        }
    }

    /// Applies one complete page. Returns `true` when it ended the phase.
    pub(crate) fn apply_page(
        &mut self,
        direction: Direction,
        event_ids: Vec<String>,
        next_token: Option<String>,
        elapsed: Duration,
    ) -> bool {
        let mut page_new = 0;
        match direction {
            Direction::Forward => {
                for id in event_ids {
                    if self.discovered.insert(id) {
                        page_new += 1;
                    }
                }
                self.discovery.events_received = self.discovered.len();
            }
            Direction::Backward => {
                let mut unseen_by_discovery = 0;
                for id in event_ids {
                    let unseen = !self.discovered.contains(&id);
                    if self.backfilled.insert(id) {
                        page_new += 1;
                        if unseen {
                            unseen_by_discovery += 1;
                        }
                    }
                }
                self.backfill.events_received = self.backfilled.len();
                self.backfill.new_events += unseen_by_discovery;
            }
        }

        let finished = next_token.is_none();
        let progress = self.phase_mut(direction);
        progress.iterations += 1;
        progress.cumulative_time += elapsed;
        progress.last_page_new = page_new;
        progress.complete = finished;
        self.pending_token = next_token;
        finished
    }

    pub(crate) fn record_retry(&mut self, direction: Direction) {
        self.phase_mut(direction).retries += 1;
    }

    pub(crate) fn finish(&mut self, termination: Termination) {
        self.phase = Phase::Done;
        self.termination = Some(termination);
    }

    pub(crate) fn snapshot(&self) -> BackwalkProgress {
        BackwalkProgress {
            session: self.id,
            room_id: self.room_id.clone(),
            phase: self.phase,
            status: self.status,
            room_depth: self.room_depth,
            discovery: self.discovery.clone(),
            backfill: self.backfill.clone(),
            pending_token: self.pending_token.clone(),
            termination: self.termination.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn backfill_counts_only_ids_discovery_missed() {
        let mut session = BackwalkSession::new(SessionId(1), "!r:example.org", Some(10));
        session.begin(Direction::Forward);
        assert!(session.apply_page(
            Direction::Forward,
            ids(&["$1", "$2", "$3"]),
            None,
            Duration::from_millis(10)
        ));

        session.begin(Direction::Backward);
        assert!(!session.apply_page(
            Direction::Backward,
            ids(&["$3", "$4"]),
            Some("t1".into()),
            Duration::from_millis(5)
        ));
        session.apply_page(
            Direction::Backward,
            ids(&["$4", "$5", "$1"]),
            None,
            Duration::from_millis(5),
        );

        let snapshot = session.snapshot();
        assert_eq!(snapshot.discovery.events_received, 3);
        assert_eq!(snapshot.backfill.events_received, 5);
        assert_eq!(snapshot.backfill.new_events, 2);
        assert_eq!(snapshot.backfill.last_page_new, 2);
        assert_eq!(snapshot.backfill.iterations, 2);
        assert_eq!(snapshot.backfill.cumulative_time, Duration::from_millis(10));
        assert!(snapshot.backfill.complete);
    }

    #[test]
    fn rendering_reports_depth_progress() {
        let mut session = BackwalkSession::new(SessionId(1), "!r:example.org", Some(45));
        session.begin(Direction::Backward);
        session.apply_page(Direction::Backward, ids(&["$1"]), None, Duration::ZERO);
        session.finish(Termination::Completed);
        let text = session.snapshot().to_string();
        assert!(text.contains("Room Back-walking Procedure: Done"));
        assert!(text.contains("1 of 45"));
    }
}
