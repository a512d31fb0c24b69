use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use bridge_common::amount::{normalize, AmountError, TokenDecimals};
use bridge_common::cache::{compensate, within, AggregateCache, CacheError};
use bridge_common::notification::{AggregateUpdate, AGGREGATE_UPDATES_CHANNEL};
use bridge_common::queue::{PersistenceQueue, QueueError};
use bridge_common::types::{
    AggregateDelta, AggregateKind, AggregateRecord, BridgeEvent, PersistenceJob,
};

use crate::decode::{decode_bridge_event, DecodeError};
use crate::source::RawLog;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to decode log: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    InvalidAmount(#[from] AmountError),
    #[error("cache operation failed: {0}")]
    CacheOperation(#[from] CacheError),
    #[error("failed to enqueue persistence job: {0}")]
    Enqueue(#[from] QueueError),
}

impl EngineError {
    /// Decode and amount errors describe the log itself and never go away.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Decode(_) | EngineError::InvalidAmount(_) => false,
            EngineError::CacheOperation(error) => error.is_retryable(),
            EngineError::Enqueue(_) => true,
        }
    }
}

/// Turns one bridge log into cache increments, a persistence job and
/// notifications.
pub struct AggregationEngine {
    cache: Arc<dyn AggregateCache>,
    queue: Arc<dyn PersistenceQueue>,
    tokens: TokenDecimals,
    operation_timeout: Duration,
}

impl AggregationEngine {
    pub fn new(
        cache: Arc<dyn AggregateCache>,
        queue: Arc<dyn PersistenceQueue>,
        tokens: TokenDecimals,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            queue,
            tokens,
            operation_timeout,
        }
    }

    pub async fn process(&self, log: &RawLog) -> Result<PersistenceJob, EngineError> {
        let event = decode_bridge_event(log)?;
        self.process_event(event).await
    }

    /// Apply `event` to the cache and hand it over for persistence.
    ///
    /// When the job cannot be enqueued the increments are reverted before the
    /// error is returned, so a retry does not count the event twice.
    pub async fn process_event(&self, event: BridgeEvent) -> Result<PersistenceJob, EngineError> {
        let start = Instant::now();
        let deltas = self.deltas(&event)?;

        let records = self
            .cache
            .increment_all(&deltas, self.operation_timeout)
            .await?;

        let job = PersistenceJob { event, records };
        let enqueued = match timeout(self.operation_timeout, self.queue.enqueue(job.clone())).await
        {
            Ok(result) => result,
            Err(_) => Err(QueueError::Timeout),
        };

        if let Err(enqueue_error) = enqueued {
            warn!(
                transaction_hash = ?job.event.transaction_hash,
                log_index = ?job.event.log_index,
                "reverting cache increments after enqueue failure: {}",
                enqueue_error
            );
            compensate(self.cache.as_ref(), &deltas, self.operation_timeout).await;
            return Err(EngineError::Enqueue(enqueue_error));
        }

        for record in &job.records {
            self.notify(record).await;
        }

        metrics::counter!("bridge_events_processed_total").increment(1);
        metrics::histogram!("bridge_event_processing_duration_seconds")
            .record(start.elapsed().as_secs_f64());
        debug!(
            token = job.event.token,
            chain = job.event.to_chain_id,
            bridge = job.event.bridge_name,
            "processed bridge event"
        );

        Ok(job)
    }

    fn deltas(&self, event: &BridgeEvent) -> Result<Vec<AggregateDelta>, AmountError> {
        let volume = normalize(&event.amount, self.tokens.decimals_for(&event.token))?;

        Ok(vec![
            AggregateDelta::new(AggregateKind::TokenVolume, event.token.as_str(), volume),
            AggregateDelta::new(AggregateKind::ChainTxCount, event.to_chain_id.as_str(), "1"),
            AggregateDelta::new(AggregateKind::BridgeUseCount, event.bridge_name.as_str(), "1"),
        ])
    }

    /// Publish failures are only logged: the job is already enqueued, so the
    /// event must not be retried because of them.
    async fn notify(&self, record: &AggregateRecord) {
        let payload = match serde_json::to_string(&AggregateUpdate::from(record)) {
            Ok(payload) => payload,
            Err(err) => {
                error!(kind = %record.kind, "failed to serialize update: {}", err);
                return;
            }
        };

        let published = within(
            self.operation_timeout,
            self.cache.publish(AGGREGATE_UPDATES_CHANNEL, payload),
        )
        .await;

        if let Err(err) = published {
            metrics::counter!("bridge_notifications_failed_total").increment(1);
            warn!(
                kind = %record.kind,
                key = record.reference_key,
                "failed to publish aggregate update: {}",
                err
            );
        }
    }
}
