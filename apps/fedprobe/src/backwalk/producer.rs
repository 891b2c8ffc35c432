//! The single page producer of one backwalk phase.
//!
//! Only one page is ever in flight per stream, so pages arrive in strict
//! pagination order. A failed fetch keeps its queue item and retries it
//! (`RetryingCurrent`) instead of dequeuing the next one.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::control::ControlSignal;
use super::{BackwalkPolicy, Direction, PageSource};
use crate::metrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueueItem {
    pub backoff: Duration,
    pub token: Option<String>,
}

#[derive(Debug)]
enum ProducerState {
    AwaitingItem,
    SleepingBackoff(QueueItem),
    Fetching { item: QueueItem, failures: u32 },
    RetryingCurrent {
        item: QueueItem,
        attempt: u32,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProducerEvent {
    Page {
        event_ids: Vec<String>,
        next_token: Option<String>,
        elapsed: Duration,
    },
    Retrying {
        attempt: u32,
        error: String,
        delay: Duration,
    },
    Exhausted {
        attempts: u32,
        error: String,
    },
}

pub(crate) struct Producer {
    pub source: Arc<dyn PageSource>,
    pub policy: BackwalkPolicy,
    pub room_id: String,
    pub direction: Direction,
    pub control: watch::Receiver<ControlSignal>,
    pub cancel: CancellationToken,
    pub events: mpsc::Sender<ProducerEvent>,
}

impl Producer {
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut queue = VecDeque::from([QueueItem {
            backoff: Duration::ZERO,
            token: None,
        }]);
        let mut state = ProducerState::AwaitingItem;
        loop {
            state = match state {
                ProducerState::AwaitingItem => {
                    if !self.wait_while_paused().await {
                        return;
                    }
                    match queue.pop_front() {
                        Some(item) => ProducerState::SleepingBackoff(item),
                        None => return,
                    }
                }
                ProducerState::SleepingBackoff(item) => {
                    if item.backoff > self.policy.backoff_threshold {
                        warn!(
                            target = "fedprobe::backwalk",
                            room_id = %self.room_id,
                            direction = self.direction.label(),
                            backoff_ms = item.backoff.as_millis() as u64,
                            "backing off before next page"
                        );
                        if !self.sleep(item.backoff).await {
                            return;
                        }
                    }
                    ProducerState::Fetching { item, failures: 0 }
                }
                ProducerState::Fetching { item, failures } => {
                    let started = Instant::now();
                    let fetch = self.source.fetch_page(
                        &self.room_id,
                        self.direction,
                        item.token.as_deref(),
                        self.policy.per_iteration,
                    );
                    let result = tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        result = fetch => result,
                    };
                    match result {
                        Ok(page) => {
                            let elapsed = started.elapsed();
                            metrics::BACKWALK_PAGES
                                .with_label_values(&[self.direction.label()])
                                .inc();
                            debug!(
                                target = "fedprobe::backwalk",
                                room_id = %self.room_id,
                                direction = self.direction.label(),
                                events = page.event_ids.len(),
                                elapsed_ms = elapsed.as_millis() as u64,
                                "page fetched"
                            );
                            let finished = page.next_token.is_none();
                            if let Some(token) = &page.next_token {
                                queue.push_back(QueueItem {
                                    backoff: self.policy.next_backoff(elapsed),
                                    token: Some(token.clone()),
                                });
                            }
                            let event = ProducerEvent::Page {
                                event_ids: page.event_ids,
                                next_token: page.next_token,
                                elapsed,
                            };
                            if self.events.send(event).await.is_err() || finished {
                                return;
                            }
                            ProducerState::AwaitingItem
                        }
                        Err(err) => {
                            let attempt = failures + 1;
                            if attempt > self.policy.max_retries {
                                let event = ProducerEvent::Exhausted {
                                    attempts: attempt,
                                    error: err.to_string(),
                                };
                                let _ = self.events.send(event).await;
                                return;
                            }
                            ProducerState::RetryingCurrent {
                                item,
                                attempt,
                                error: err.to_string(),
                            }
                        }
                    }
                }
                ProducerState::RetryingCurrent {
                    item,
                    attempt,
                    error,
                } => {
                    let delay = self.policy.retry_delay(attempt);
                    metrics::BACKWALK_RETRIES
                        .with_label_values(&[self.direction.label()])
                        .inc();
                    warn!(
                        target = "fedprobe::backwalk",
                        room_id = %self.room_id,
                        direction = self.direction.label(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "page fetch failed; retrying same token"
                    );
                    let event = ProducerEvent::Retrying {
                        attempt,
                        error,
                        delay,
                    };
                    if self.events.send(event).await.is_err() || !self.sleep(delay).await {
                        return;
                    }
                    ProducerState::Fetching {
                        item,
                        failures: attempt,
                    }
                }
            };
        }
    }

    /// Returns `false` when the producer should exit instead of dequeuing.
    async fn wait_while_paused(&mut self) -> bool {
        loop {
            let signal = *self.control.borrow_and_update();
            match signal {
                ControlSignal::Start => return true,
                ControlSignal::Stop => return false,
                ControlSignal::Pause => {}
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = self.control.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
