use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::FedProbeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    Start,
    Pause,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlStatus {
    Running,
    Paused,
    Stopping,
}

impl From<ControlSignal> for ControlStatus {
    fn from(signal: ControlSignal) -> Self {
        match signal {
            ControlSignal::Start => ControlStatus::Running,
            ControlSignal::Pause => ControlStatus::Paused,
            ControlSignal::Stop => ControlStatus::Stopping,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-session control channels keyed by session id. Each session owns its
/// own channel; the registry only routes signals to it.
#[derive(Default)]
pub struct ControlRegistry {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, Arc<watch::Sender<ControlSignal>>>>,
}

impl ControlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> (SessionId, watch::Receiver<ControlSignal>) {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = watch::channel(ControlSignal::Start);
        self.sessions.lock().insert(id, Arc::new(tx));
        (id, rx)
    }

    /// Delivers `signal` to a running session. Sessions whose engine has
    /// already gone away are forgotten and reported as unknown.
    pub fn signal(&self, id: SessionId, signal: ControlSignal) -> Result<(), FedProbeError> {
        let sender = self.sessions.lock().get(&id).cloned();
        let Some(sender) = sender else {
            return Err(FedProbeError::UnknownSession(id.0));
        };
        if sender.send(signal).is_err() {
            self.sessions.lock().remove(&id);
            return Err(FedProbeError::UnknownSession(id.0));
        }
        tracing::info!(
            target = "fedprobe::backwalk",
            session = %id,
            signal = ?signal,
            "control signal delivered"
        );
        Ok(())
    }

    pub fn remove(&self, id: SessionId) {
        self.sessions.lock().remove(&id);
    }

    pub fn active(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.lock().keys().copied().collect();
        ids.sort();
        ids
    }
}
