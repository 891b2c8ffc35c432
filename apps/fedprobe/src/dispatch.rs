//! Bounded fan-out of one probe function over many targets.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics;
use crate::probe::{FailureKind, ProbeFailure, ProbeOutcome, ProbeResult};

/// Exactly one result per distinct submitted target, plus the wall-clock
/// time the whole batch took.
#[derive(Debug)]
pub struct DispatchReport<K, T> {
    pub results: HashMap<K, ProbeResult<K, T>>,
    pub elapsed: Duration,
}

impl<K, T> DispatchReport<K, T> {
    pub fn failures(&self) -> usize {
        self.results
            .values()
            .filter(|result| !result.outcome.is_success())
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct ProbeDispatcher {
    max_in_flight: usize,
    per_request_timeout: Duration,
    label: &'static str,
}

impl ProbeDispatcher {
    pub fn new(max_in_flight: usize, per_request_timeout: Duration) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
            per_request_timeout,
            label: "probe",
        }
    }

    /// Metric label for the probes this dispatcher runs.
    pub fn with_label(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn per_request_timeout(&self) -> Duration {
        self.per_request_timeout
    }

    pub async fn run<K, T, F, Fut>(
        &self,
        targets: impl IntoIterator<Item = K>,
        probe: F,
    ) -> DispatchReport<K, T>
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
        T: Send + 'static,
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ProbeFailure>> + Send + 'static,
    {
        self.run_until(targets, probe, CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), but stops collecting once `cancel` fires.
    /// Every worker is aborted and joined before this returns; targets without
    /// a result by then are reported as cancelled.
    pub async fn run_until<K, T, F, Fut>(
        &self,
        targets: impl IntoIterator<Item = K>,
        probe: F,
        cancel: CancellationToken,
    ) -> DispatchReport<K, T>
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
        T: Send + 'static,
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ProbeFailure>> + Send + 'static,
    {
        let mut seen = HashSet::new();
        let targets: Vec<K> = targets
            .into_iter()
            .filter(|target| seen.insert(target.clone()))
            .collect();
        if targets.is_empty() {
            return DispatchReport {
                results: HashMap::new(),
                elapsed: Duration::ZERO,
            };
        }

        let started = Instant::now();
        let total = targets.len();
        let queue = Arc::new(Mutex::new(targets.iter().cloned().collect::<VecDeque<_>>()));
        let (tx, mut rx) = mpsc::channel::<ProbeResult<K, T>>(total);
        let probe = Arc::new(probe);
        let timeout = self.per_request_timeout;

        let mut workers = JoinSet::new();
        for _ in 0..self.max_in_flight.min(total) {
            let queue = queue.clone();
            let tx = tx.clone();
            let probe = probe.clone();
            workers.spawn(async move {
                loop {
                    let next = queue.lock().pop_front();
                    let Some(target) = next else {
                        break;
                    };
                    let probe_started = Instant::now();
                    let call = {
                        let probe = probe.clone();
                        let target = target.clone();
                        AssertUnwindSafe(async move { (*probe)(target).await }).catch_unwind()
                    };
                    let outcome = match tokio::time::timeout(timeout, call).await {
                        Ok(Ok(result)) => ProbeOutcome::from(result),
                        Ok(Err(panic)) => {
                            ProbeOutcome::Failure(ProbeFailure::internal(panic_message(&*panic)))
                        }
                        Err(_) => ProbeOutcome::Failure(ProbeFailure::timeout(timeout)),
                    };
                    let result = ProbeResult {
                        target,
                        outcome,
                        elapsed: probe_started.elapsed(),
                    };
                    if tx.send(result).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut results: HashMap<K, ProbeResult<K, T>> = HashMap::with_capacity(total);
        let mut cancelled = false;
        while results.len() < total {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                received = rx.recv() => match received {
                    Some(result) => {
                        results.insert(result.target.clone(), result);
                    }
                    None => break,
                },
            }
        }

        workers.abort_all();
        while workers.join_next().await.is_some() {}
        while let Ok(result) = rx.try_recv() {
            results.entry(result.target.clone()).or_insert(result);
        }

        for target in targets {
            results.entry(target.clone()).or_insert_with(|| {
                let failure = if cancelled {
                    ProbeFailure::new(FailureKind::Cancelled, "dispatch cancelled")
                } else {
                    ProbeFailure::internal("worker exited without reporting a result")
                };
                ProbeResult {
                    target,
                    outcome: ProbeOutcome::Failure(failure),
                    elapsed: Duration::ZERO,
                }
            });
        }

        for result in results.values() {
            metrics::PROBES
                .with_label_values(&[self.label, result.outcome.label()])
                .inc();
            if let ProbeOutcome::Failure(failure) = &result.outcome {
                debug!(
                    target = "fedprobe::dispatch",
                    kind = self.label,
                    failure = failure.kind.label(),
                    error = %failure,
                    "probe failed"
                );
            }
        }

        let report = DispatchReport {
            results,
            elapsed: started.elapsed(),
        };
        info!(
            target = "fedprobe::dispatch",
            kind = self.label,
            targets = total,
            failures = report.failures(),
            cancelled,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "dispatch complete"
        );
        report
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("probe panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("probe panicked: {message}")
    } else {
        "probe panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test_timeout::tokio_timeout_test]
    async fn empty_input_returns_immediately() {
        let dispatcher = ProbeDispatcher::new(4, Duration::from_secs(1));
        let report = dispatcher
            .run(Vec::<String>::new(), |_target: String| async move {
                Ok::<_, ProbeFailure>(())
            })
            .await;
        assert!(report.results.is_empty());
        assert_eq!(report.elapsed, Duration::ZERO);
    }

    #[test_timeout::tokio_timeout_test(30, paused)]
    async fn in_flight_never_exceeds_cap() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let dispatcher = ProbeDispatcher::new(3, Duration::from_secs(10));

        let probe = {
            let current = current.clone();
            let peak = peak.clone();
            move |n: u32| {
                let current = current.clone();
                let peak = peak.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, ProbeFailure>(n * 2)
                }
            }
        };
        let report = dispatcher.run(0..20u32, probe).await;

        assert_eq!(report.results.len(), 20);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert!(matches!(
            report.results[&7].outcome,
            ProbeOutcome::Success(14)
        ));
    }

    #[test_timeout::tokio_timeout_test(30, paused)]
    async fn panics_and_timeouts_become_results() {
        let dispatcher = ProbeDispatcher::new(10, Duration::from_secs(10));
        let report = dispatcher
            .run(["ok", "panics", "slow", "fails"], |target: &'static str| async move {
                match target {
                    "panics" => panic!("boom"),
                    "slow" => {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(())
                    }
                    "fails" => Err(ProbeFailure::http_status(503, "Service Unavailable")),
                    _ => Ok(()),
                }
            })
            .await;

        assert_eq!(report.results.len(), 4);
        assert!(report.results["ok"].outcome.is_success());

        let kind = |t: &str| match &report.results[t].outcome {
            ProbeOutcome::Failure(f) => Some(f.kind),
            ProbeOutcome::Success(_) => None,
        };
        assert_eq!(kind("panics"), Some(FailureKind::Internal));
        assert_eq!(kind("slow"), Some(FailureKind::Timeout));
        assert_eq!(kind("fails"), Some(FailureKind::ServerError));
        assert!(report.elapsed <= Duration::from_secs(10) + Duration::from_millis(50));
    }

    #[test_timeout::tokio_timeout_test(30, paused)]
    async fn duplicate_targets_are_probed_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = ProbeDispatcher::new(2, Duration::from_secs(1));
        let counter = calls.clone();
        let report = dispatcher
            .run(["a", "b", "a"], move |_t: &'static str| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ProbeFailure>(())
                }
            })
            .await;
        assert_eq!(report.results.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test_timeout::tokio_timeout_test(30, paused)]
    async fn cancellation_fills_outstanding_targets_and_joins_workers() {
        let live = Arc::new(AtomicUsize::new(0));
        let dispatcher = ProbeDispatcher::new(2, Duration::from_secs(600));
        let cancel = CancellationToken::new();

        struct Guard(Arc<AtomicUsize>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::SeqCst);
            }
        }

        let probe = {
            let live = live.clone();
            move |n: u32| {
                let live = live.clone();
                async move {
                    live.fetch_add(1, Ordering::SeqCst);
                    let _guard = Guard(live);
                    if n == 0 {
                        return Ok::<_, ProbeFailure>(n);
                    }
                    tokio::time::sleep(Duration::from_secs(300)).await;
                    Ok(n)
                }
            }
        };

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });
        let report = dispatcher.run_until(0..5u32, probe, cancel).await;

        assert_eq!(report.results.len(), 5);
        assert!(report.results[&0].outcome.is_success());
        let cancelled = report
            .results
            .values()
            .filter(|r| matches!(&r.outcome, ProbeOutcome::Failure(f) if f.kind == FailureKind::Cancelled))
            .count();
        assert_eq!(cancelled, 4);
        assert_eq!(live.load(Ordering::SeqCst), 0, "no probe may outlive the call");
    }
}
