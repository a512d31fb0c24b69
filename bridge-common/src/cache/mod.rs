use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::time::timeout;
use tracing::error;

use crate::amount::{negate, AmountError};
use crate::types::{AggregateDelta, AggregateKind, AggregateRecord};

mod memory;
mod redis_cache;

pub use memory::MemoryAggregateCache;
pub use redis_cache::RedisAggregateCache;

#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("timed out waiting for the aggregate cache")]
    Timeout,
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid value for {key}: {source}")]
    InvalidValue { key: String, source: AmountError },
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("subscription to {0} closed")]
    SubscriptionClosed(String),
    #[error(transparent)]
    Redis(#[from] Arc<redis::RedisError>),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            CacheError::Timeout
        } else {
            CacheError::Redis(Arc::new(err))
        }
    }
}

impl CacheError {
    /// Whether repeating the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CacheError::Timeout => true,
            CacheError::InvalidConfiguration(_) => false,
            CacheError::InvalidValue { .. } => false,
            CacheError::UnexpectedReply(_) => false,
            CacheError::SubscriptionClosed(_) => true,
            CacheError::Redis(err) => !err.is_unrecoverable_error(),
        }
    }
}

/// Store of the current aggregate totals plus the notification channel.
///
/// Totals are only ever changed through increments; no caller reads a total,
/// modifies it and writes it back.
#[async_trait]
pub trait AggregateCache: Send + Sync {
    /// Current total for `key`, `"0"` when it was never incremented.
    async fn get_current(&self, kind: AggregateKind, key: &str) -> Result<String, CacheError>;

    /// Every total of `kind`.
    async fn get_all(&self, kind: AggregateKind) -> Result<HashMap<String, String>, CacheError>;

    /// Add a signed decimal `delta` in one backend operation and return the new total.
    async fn atomic_increment(
        &self,
        kind: AggregateKind,
        key: &str,
        delta: &str,
    ) -> Result<String, CacheError>;

    /// Apply several increments together, each backend call bounded by
    /// `operation_timeout`.
    ///
    /// Backends without multi-key transactions get this default: increments run
    /// in order, and when one fails or times out the already applied ones are
    /// reverted before the error is returned. Callers must not put another
    /// timeout around it, or the revert can be cut short.
    async fn increment_all(
        &self,
        deltas: &[AggregateDelta],
        operation_timeout: Duration,
    ) -> Result<Vec<AggregateRecord>, CacheError> {
        let mut records = Vec::with_capacity(deltas.len());

        for (applied, delta) in deltas.iter().enumerate() {
            let increment = self.atomic_increment(delta.kind, &delta.key, &delta.delta);
            match within(operation_timeout, increment).await {
                Ok(total) => records.push(AggregateRecord::from_delta(delta, total)),
                Err(err) => {
                    compensate(self, &deltas[..applied], operation_timeout).await;
                    return Err(err);
                }
            }
        }

        Ok(records)
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), CacheError>;

    /// Payloads published on `channel` from now on.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, CacheError>;
}

/// Run one cache call, turning an elapsed `operation_timeout` into `CacheError::Timeout`.
pub async fn within<T>(
    operation_timeout: Duration,
    call: impl Future<Output = Result<T, CacheError>>,
) -> Result<T, CacheError> {
    timeout(operation_timeout, call)
        .await
        .unwrap_or(Err(CacheError::Timeout))
}

/// Revert `applied` in reverse order. Failures are logged and counted, never raised.
pub async fn compensate<C>(cache: &C, applied: &[AggregateDelta], operation_timeout: Duration)
where
    C: AggregateCache + ?Sized,
{
    for delta in applied.iter().rev() {
        let reverse = match negate(&delta.delta) {
            Ok(reverse) => reverse,
            Err(err) => {
                error!(kind = %delta.kind, key = %delta.key, "cannot negate delta: {}", err);
                continue;
            }
        };

        let increment = cache.atomic_increment(delta.kind, &delta.key, &reverse);
        match within(operation_timeout, increment).await {
            Ok(_) => metrics::counter!("bridge_cache_compensations_total").increment(1),
            Err(err) => {
                metrics::counter!("bridge_cache_compensation_failures_total").increment(1);
                error!(
                    kind = %delta.kind,
                    key = %delta.key,
                    delta = %delta.delta,
                    "failed to compensate cache increment: {}",
                    err
                );
            }
        }
    }
}
