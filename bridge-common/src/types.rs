use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The three running totals maintained for every processed bridge event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "aggregate_kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregateKind {
    TokenVolume,
    ChainTxCount,
    BridgeUseCount,
}

impl AggregateKind {
    /// Every kind, in the order increments are applied.
    pub const ALL: [AggregateKind; 3] = [
        AggregateKind::TokenVolume,
        AggregateKind::ChainTxCount,
        AggregateKind::BridgeUseCount,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateKind::TokenVolume => "TOKEN_VOLUME",
            AggregateKind::ChainTxCount => "CHAIN_TX_COUNT",
            AggregateKind::BridgeUseCount => "BRIDGE_USE_COUNT",
        }
    }

    /// Name of the cache hash holding the totals of this kind.
    pub fn cache_key(&self) -> &'static str {
        match self {
            AggregateKind::TokenVolume => "bridge_events:total_volume",
            AggregateKind::ChainTxCount => "bridge_events:volume_by_chain",
            AggregateKind::BridgeUseCount => "bridge_events:bridge_usage",
        }
    }
}

impl fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid aggregate kind")]
pub struct ParseKindError(String);

impl FromStr for AggregateKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TOKEN_VOLUME" => Ok(AggregateKind::TokenVolume),
            "CHAIN_TX_COUNT" => Ok(AggregateKind::ChainTxCount),
            "BRIDGE_USE_COUNT" => Ok(AggregateKind::BridgeUseCount),
            invalid => Err(ParseKindError(invalid.to_owned())),
        }
    }
}

/// A decoded SocketBridge transfer. Amount and chain id are decimal strings of
/// unsigned 256-bit integers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeEvent {
    pub event_name: String,
    pub token: String,
    pub amount: String,
    pub to_chain_id: String,
    pub bridge_name: String,
    pub sender: String,
    pub receiver: String,
    pub metadata: String,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<String>,
    pub log_index: Option<u64>,
}

/// A pending change to one cached total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateDelta {
    pub kind: AggregateKind,
    pub key: String,
    pub delta: String,
}

impl AggregateDelta {
    pub fn new(kind: AggregateKind, key: impl Into<String>, delta: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            delta: delta.into(),
        }
    }
}

/// One row of metric history: the total right after `delta` was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub kind: AggregateKind,
    pub reference_key: String,
    pub total: String,
    pub delta: String,
}

impl AggregateRecord {
    pub fn from_delta(delta: &AggregateDelta, total: String) -> Self {
        Self {
            kind: delta.kind,
            reference_key: delta.key.clone(),
            total,
            delta: delta.delta.clone(),
        }
    }
}

/// Work item handed from the collector to the persister.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceJob {
    pub event: BridgeEvent,
    pub records: Vec<AggregateRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_its_name() {
        for kind in AggregateKind::ALL {
            assert_eq!(kind.as_str().parse::<AggregateKind>(), Ok(kind));
        }
        assert!("SOCKET".parse::<AggregateKind>().is_err());
    }

    #[test]
    fn test_kind_serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&AggregateKind::ChainTxCount).unwrap();
        assert_eq!(json, "\"CHAIN_TX_COUNT\"");
    }
}
