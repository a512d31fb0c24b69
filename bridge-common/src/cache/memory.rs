use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tracing::warn;

use super::{AggregateCache, CacheError};
use crate::amount::{parse_decimal, to_plain_string};
use crate::types::{AggregateDelta, AggregateKind, AggregateRecord};

const CHANNEL_CAPACITY: usize = 1024;

/// In-process cache used for local runs and tests. Every operation holds one
/// lock, so multi-key increments are atomic.
#[derive(Default)]
pub struct MemoryAggregateCache {
    totals: Mutex<HashMap<(AggregateKind, String), BigDecimal>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryAggregateCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(&self, deltas: &[AggregateDelta]) -> Result<Vec<AggregateRecord>, CacheError> {
        let parsed = deltas
            .iter()
            .map(|delta| {
                parse_decimal(&delta.delta).map_err(|source| CacheError::InvalidValue {
                    key: delta.key.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        Ok(deltas
            .iter()
            .zip(parsed)
            .map(|(delta, amount)| {
                let total = totals
                    .entry((delta.kind, delta.key.clone()))
                    .or_default();
                *total += amount;
                AggregateRecord::from_delta(delta, to_plain_string(total))
            })
            .collect())
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl AggregateCache for MemoryAggregateCache {
    async fn get_current(&self, kind: AggregateKind, key: &str) -> Result<String, CacheError> {
        let totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        Ok(totals
            .get(&(kind, key.to_owned()))
            .map(to_plain_string)
            .unwrap_or_else(|| "0".to_owned()))
    }

    async fn get_all(&self, kind: AggregateKind) -> Result<HashMap<String, String>, CacheError> {
        let totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        Ok(totals
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|((_, key), total)| (key.clone(), to_plain_string(total)))
            .collect())
    }

    async fn atomic_increment(
        &self,
        kind: AggregateKind,
        key: &str,
        delta: &str,
    ) -> Result<String, CacheError> {
        let delta = AggregateDelta::new(kind, key, delta);
        let mut records = self.apply(std::slice::from_ref(&delta))?;
        records
            .pop()
            .map(|record| record.total)
            .ok_or_else(|| CacheError::UnexpectedReply("no total returned".to_owned()))
    }

    async fn increment_all(
        &self,
        deltas: &[AggregateDelta],
        _operation_timeout: Duration,
    ) -> Result<Vec<AggregateRecord>, CacheError> {
        self.apply(deltas)
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), CacheError> {
        // Nobody listening is not an error, same as redis PUBLISH.
        if self.sender(channel).send(payload).is_err() {
            tracing::debug!(channel, "published without subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, CacheError> {
        let receiver = self.sender(channel).subscribe();
        let channel = channel.to_owned();

        Ok(stream::unfold(receiver, move |mut receiver| {
            let channel = channel.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(payload) => return Some((payload, receiver)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(channel, skipped, "subscriber lagged behind");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed())
    }
}
