use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use bridge_common::cache::{AggregateCache, CacheError};
use bridge_common::notification::AggregateUpdate;
use bridge_common::retry::RetryPolicy;
use bridge_common::types::AggregateKind;

/// A named event sent to every realtime client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientMessage {
    pub event: &'static str,
    pub data: serde_json::Value,
}

impl ClientMessage {
    fn from_update(update: AggregateUpdate) -> Self {
        match update.kind {
            AggregateKind::TokenVolume => ClientMessage {
                event: "token_volume_update",
                data: json!({"token": update.key, "totalVolume": update.total}),
            },
            AggregateKind::ChainTxCount => ClientMessage {
                event: "chain_volume_update",
                data: json!({"chainId": update.key, "totalVolume": update.total}),
            },
            AggregateKind::BridgeUseCount => ClientMessage {
                event: "bridge_usage_update",
                data: json!({"bridge": update.key, "usageCount": update.total}),
            },
        }
    }
}

/// Relays cache notifications to connected clients. Clients come and go
/// through `connect` without affecting each other or the cache subscription.
#[derive(Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<ClientMessage>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every message relayed from now on.
    pub fn connect(&self) -> broadcast::Receiver<ClientMessage> {
        let receiver = self.sender.subscribe();
        info!(clients = self.sender.receiver_count(), "realtime client connected");
        receiver
    }

    pub fn client_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Forward one raw notification payload. Returns whether it was relayed.
    pub fn relay(&self, payload: &str) -> bool {
        let update = match serde_json::from_str::<AggregateUpdate>(payload) {
            Ok(update) => update,
            Err(err) => {
                metrics::counter!("bridge_notifications_discarded_total").increment(1);
                warn!(payload, "discarding malformed aggregate update: {}", err);
                return false;
            }
        };

        if self.sender.send(ClientMessage::from_update(update)).is_err() {
            debug!("no realtime clients connected");
        }
        true
    }

    /// Relay everything published on `channel`.
    ///
    /// A lost subscription is re-established with `retry_policy` backoff. Once
    /// more than `max_attempts` subscriptions in a row fail without relaying
    /// anything, the last error is returned.
    pub async fn run(
        &self,
        cache: Arc<dyn AggregateCache>,
        channel: &str,
        retry_policy: RetryPolicy,
        max_attempts: u32,
    ) -> CacheError {
        let mut failures: u32 = 0;

        loop {
            let error = match cache.subscribe(channel).await {
                Ok(mut updates) => {
                    info!(channel, "relaying aggregate updates");
                    while let Some(payload) = updates.next().await {
                        failures = 0;
                        _ = self.relay(&payload);
                    }
                    CacheError::SubscriptionClosed(channel.to_owned())
                }
                Err(error) => error,
            };

            failures = failures.saturating_add(1);
            if failures > max_attempts {
                error!(channel, "giving up on aggregate updates: {}", error);
                return error;
            }

            let delay = retry_policy.retry_interval(failures);
            warn!(
                channel,
                attempt = failures,
                delay_ms = delay.as_millis(),
                "aggregate update subscription lost, resubscribing: {}",
                error
            );
            tokio::time::sleep(delay).await;
        }
    }
}
