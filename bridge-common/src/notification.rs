use serde::{Deserialize, Serialize};

use crate::types::{AggregateKind, AggregateRecord};

/// Cache pub/sub channel carrying one `AggregateUpdate` per changed total.
pub const AGGREGATE_UPDATES_CHANNEL: &str = "bridge_events:processed_updates";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateUpdate {
    pub kind: AggregateKind,
    pub key: String,
    pub total: String,
    pub delta: String,
}

impl From<&AggregateRecord> for AggregateUpdate {
    fn from(record: &AggregateRecord) -> Self {
        Self {
            kind: record.kind,
            key: record.reference_key.clone(),
            total: record.total.clone(),
            delta: record.delta.clone(),
        }
    }
}
