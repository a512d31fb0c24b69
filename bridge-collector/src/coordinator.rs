use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time;

use futures::stream::{self, StreamExt};
use health::{ComponentStatus, HealthHandle};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use bridge_common::retry::RetryPolicy;

use crate::engine::AggregationEngine;
use crate::source::{EventSource, LogBatch, RawLog, SourceError, Subscription};

const TRANSITION_HISTORY: usize = 32;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("event source unavailable after {attempts} attempts: {source}")]
    RetriesExhausted { attempts: u32, source: SourceError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Stopped,
    Starting,
    Listening,
    Retrying { attempt: u32 },
    Failed,
}

impl CoordinatorState {
    fn gauge_value(&self) -> f64 {
        match self {
            CoordinatorState::Stopped => 0.0,
            CoordinatorState::Starting => 1.0,
            CoordinatorState::Listening => 2.0,
            CoordinatorState::Retrying { .. } => 3.0,
            CoordinatorState::Failed => 4.0,
        }
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorState::Stopped => write!(f, "STOPPED"),
            CoordinatorState::Starting => write!(f, "STARTING"),
            CoordinatorState::Listening => write!(f, "LISTENING"),
            CoordinatorState::Retrying { attempt } => write!(f, "RETRYING({attempt})"),
            CoordinatorState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Connection state of the coordinator and the backoff between reconnects.
///
/// ```text
/// STOPPED -> STARTING -> LISTENING <-> RETRYING -> FAILED
/// ```
///
/// The failure counter resets once a connection delivers its first batch, so
/// `max_attempts` bounds consecutive failures only. A source that accepts the
/// subscription and then fails before delivering anything still counts as
/// failing.
#[derive(Debug)]
pub struct ReconnectStateMachine {
    state: CoordinatorState,
    failures: u32,
    max_attempts: u32,
    retry_policy: RetryPolicy,
    history: VecDeque<CoordinatorState>,
}

impl ReconnectStateMachine {
    pub fn new(retry_policy: RetryPolicy, max_attempts: u32) -> Self {
        Self {
            state: CoordinatorState::Stopped,
            failures: 0,
            max_attempts,
            retry_policy,
            history: VecDeque::with_capacity(TRANSITION_HISTORY),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// States entered so far, oldest first, bounded to the latest transitions.
    pub fn recent_transitions(&self) -> Vec<CoordinatorState> {
        self.history.iter().copied().collect()
    }

    pub fn start(&mut self) {
        self.failures = 0;
        self.transition(CoordinatorState::Starting);
    }

    pub fn connected(&mut self) {
        self.transition(CoordinatorState::Listening);
    }

    /// The current connection delivered a batch.
    pub fn delivered(&mut self) {
        self.failures = 0;
    }

    /// Record a failed connection. Returns how long to wait before the next
    /// attempt, or `None` once the attempts are exhausted.
    pub fn failed(&mut self) -> Option<time::Duration> {
        self.failures = self.failures.saturating_add(1);

        if self.failures > self.max_attempts {
            self.transition(CoordinatorState::Failed);
            return None;
        }

        self.transition(CoordinatorState::Retrying {
            attempt: self.failures,
        });
        Some(self.retry_policy.retry_interval(self.failures))
    }

    fn transition(&mut self, next: CoordinatorState) {
        info!(from = %self.state, to = %next, "coordinator state changed");
        metrics::gauge!("bridge_coordinator_state").set(next.gauge_value());

        self.state = next;
        if self.history.len() == TRANSITION_HISTORY {
            _ = self.history.pop_front();
        }
        self.history.push_back(next);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub processed: usize,
    pub dropped: usize,
    pub failed: usize,
}

enum EventOutcome {
    Processed,
    Dropped,
    Failed,
}

/// Owns the event source subscription and feeds every delivered batch to the
/// `AggregationEngine`.
pub struct IngestionCoordinator {
    source: Arc<dyn EventSource>,
    engine: Arc<AggregationEngine>,
    machine: ReconnectStateMachine,
    /// First block of the next subscription; `None` starts at the chain head.
    resume_from: Option<u64>,
    /// Maximum number of events of one batch processed at the same time.
    max_concurrent_events: usize,
    /// How many times a retryable event failure is retried.
    event_retry_attempts: u32,
    event_retry_policy: RetryPolicy,
    liveness: HealthHandle,
}

impl IngestionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn EventSource>,
        engine: Arc<AggregationEngine>,
        reconnect_policy: RetryPolicy,
        max_reconnect_attempts: u32,
        start_block: Option<u64>,
        max_concurrent_events: usize,
        event_retry_attempts: u32,
        event_retry_policy: RetryPolicy,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            source,
            engine,
            machine: ReconnectStateMachine::new(reconnect_policy, max_reconnect_attempts),
            resume_from: start_block,
            max_concurrent_events: max_concurrent_events.max(1),
            event_retry_attempts,
            event_retry_policy,
            liveness,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.machine.state()
    }

    pub fn recent_transitions(&self) -> Vec<CoordinatorState> {
        self.machine.recent_transitions()
    }

    /// Subscribe and process batches until the source fails more often in a
    /// row than the reconnect budget allows.
    pub async fn run(&mut self) -> Result<(), CoordinatorError> {
        self.machine.start();

        loop {
            let source_error = match self.source.subscribe(self.resume_from).await {
                Ok(subscription) => {
                    self.machine.connected();
                    // Resume here if the connection fails before its first batch.
                    self.resume_from = Some(subscription.start_block);
                    self.listen(subscription).await
                }
                Err(error) => error,
            };

            match self.machine.failed() {
                Some(delay) => {
                    warn!(
                        resume_from = ?self.resume_from,
                        delay_ms = delay.as_millis(),
                        "event source failed, reconnecting: {}",
                        source_error
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!("event source failed, giving up: {}", source_error);
                    self.liveness
                        .report_status(ComponentStatus::Unhealthy)
                        .await;
                    return Err(CoordinatorError::RetriesExhausted {
                        attempts: self.machine.max_attempts,
                        source: source_error,
                    });
                }
            }
        }
    }

    /// Process batches one after another until the subscription ends.
    async fn listen(&mut self, mut subscription: Subscription) -> SourceError {
        while let Some(item) = subscription.recv().await {
            match item {
                Ok(batch) => {
                    self.machine.delivered();
                    self.liveness.report_healthy().await;
                    let summary = self.handle_batch(&batch).await;
                    debug!(
                        to_block = batch.to_block,
                        processed = summary.processed,
                        dropped = summary.dropped,
                        failed = summary.failed,
                        "dispatched batch"
                    );
                    self.resume_from = Some(batch.to_block + 1);
                }
                Err(error) => return error,
            }
        }

        SourceError::Closed
    }

    /// Process every event of `batch` with bounded concurrency. An event that
    /// fails never affects the others.
    pub async fn handle_batch(&self, batch: &LogBatch) -> BatchSummary {
        let outcomes: Vec<EventOutcome> = stream::iter(batch.logs.iter())
            .map(|log| self.handle_event(log))
            .buffer_unordered(self.max_concurrent_events)
            .collect()
            .await;

        outcomes
            .into_iter()
            .fold(BatchSummary::default(), |mut summary, outcome| {
                match outcome {
                    EventOutcome::Processed => summary.processed += 1,
                    EventOutcome::Dropped => summary.dropped += 1,
                    EventOutcome::Failed => summary.failed += 1,
                }
                summary
            })
    }

    async fn handle_event(&self, log: &RawLog) -> EventOutcome {
        let mut attempt = 0;

        loop {
            let error = match self.engine.process(log).await {
                Ok(_) => return EventOutcome::Processed,
                Err(error) => error,
            };

            if !error.is_retryable() {
                metrics::counter!("bridge_events_dropped_total").increment(1);
                warn!(
                    transaction_hash = ?log.transaction_hash,
                    log_index = ?log.log_index,
                    "dropping bridge log: {}",
                    error
                );
                return EventOutcome::Dropped;
            }

            attempt += 1;
            if attempt > self.event_retry_attempts {
                metrics::counter!("bridge_events_failed_total").increment(1);
                error!(
                    transaction_hash = ?log.transaction_hash,
                    log_index = ?log.log_index,
                    attempts = attempt,
                    "giving up on bridge log: {}",
                    error
                );
                return EventOutcome::Failed;
            }

            tokio::time::sleep(self.event_retry_policy.retry_interval(attempt)).await;
        }
    }
}
