use async_trait::async_trait;
use sqlx::postgres::PgPool;
use thiserror::Error;

use crate::types::PersistenceJob;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction {command} failed with: {error}")]
    TransactionError { command: String, error: sqlx::Error },
    #[error("{field} is out of range: {value}")]
    OutOfRange { field: &'static str, value: u64 },
    #[error("timed out writing to the durable store")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistOutcome {
    /// False when the raw event was already stored by an earlier delivery.
    pub event_inserted: bool,
    pub records_inserted: usize,
}

/// System of record for raw events and aggregate history.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Write the raw event and its aggregate records in one transaction.
    async fn persist(&self, job: &PersistenceJob) -> Result<PersistOutcome, StoreError>;
}

const INSERT_EVENT: &str = r#"
INSERT INTO bridge_events
    (transaction_hash, log_index, event_name, token, amount, to_chain_id,
     bridge_name, sender, receiver, metadata, block_number)
VALUES
    ($1, $2, $3, $4, $5::numeric, $6::numeric, $7, $8, $9, $10, $11)
ON CONFLICT (transaction_hash, log_index) DO NOTHING
"#;

const INSERT_RECORD: &str = r#"
INSERT INTO aggregate_records
    (kind, reference_key, total, delta, transaction_hash, log_index)
VALUES
    ($1, $2, $3::numeric, $4::numeric, $5, $6)
"#;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_i64(field: &'static str, value: Option<u64>) -> Result<Option<i64>, StoreError> {
    value
        .map(|value| i64::try_from(value).map_err(|_| StoreError::OutOfRange { field, value }))
        .transpose()
}

#[async_trait]
impl DurableStore for PgStore {
    async fn persist(&self, job: &PersistenceJob) -> Result<PersistOutcome, StoreError> {
        let event = &job.event;
        let block_number = to_i64("block_number", event.block_number)?;
        let log_index = to_i64("log_index", event.log_index)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        let inserted = sqlx::query(INSERT_EVENT)
            .bind(&event.transaction_hash)
            .bind(log_index)
            .bind(&event.event_name)
            .bind(&event.token)
            .bind(&event.amount)
            .bind(&event.to_chain_id)
            .bind(&event.bridge_name)
            .bind(&event.sender)
            .bind(&event.receiver)
            .bind(&event.metadata)
            .bind(block_number)
            .execute(&mut *tx)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT bridge_events".to_owned(),
                error,
            })?
            .rows_affected();

        for record in &job.records {
            sqlx::query(INSERT_RECORD)
                .bind(record.kind)
                .bind(&record.reference_key)
                .bind(&record.total)
                .bind(&record.delta)
                .bind(&event.transaction_hash)
                .bind(log_index)
                .execute(&mut *tx)
                .await
                .map_err(|error| StoreError::QueryError {
                    command: "INSERT aggregate_records".to_owned(),
                    error,
                })?;
        }

        tx.commit()
            .await
            .map_err(|error| StoreError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })?;

        Ok(PersistOutcome {
            event_inserted: inserted > 0,
            records_inserted: job.records.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AggregateKind, AggregateRecord, BridgeEvent};

    fn job() -> PersistenceJob {
        PersistenceJob {
            event: BridgeEvent {
                event_name: "SocketBridge".to_owned(),
                token: "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".to_owned(),
                amount: "2500000".to_owned(),
                to_chain_id: "8453".to_owned(),
                bridge_name: "socket".to_owned(),
                sender: "0x0000000000000000000000000000000000000001".to_owned(),
                receiver: "0x0000000000000000000000000000000000000002".to_owned(),
                metadata: format!("0x{}", "00".repeat(32)),
                block_number: Some(19_000_000),
                transaction_hash: Some(format!("0x{}", "ab".repeat(32))),
                log_index: Some(7),
            },
            records: vec![
                AggregateRecord {
                    kind: AggregateKind::TokenVolume,
                    reference_key: "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".to_owned(),
                    total: "12.5".to_owned(),
                    delta: "2.5".to_owned(),
                },
                AggregateRecord {
                    kind: AggregateKind::ChainTxCount,
                    reference_key: "8453".to_owned(),
                    total: "3".to_owned(),
                    delta: "1".to_owned(),
                },
                AggregateRecord {
                    kind: AggregateKind::BridgeUseCount,
                    reference_key: "socket".to_owned(),
                    total: "3".to_owned(),
                    delta: "1".to_owned(),
                },
            ],
        }
    }

    #[test]
    fn test_out_of_range_numbers_are_rejected() {
        assert!(matches!(
            to_i64("block_number", Some(u64::MAX)),
            Err(StoreError::OutOfRange { field: "block_number", .. })
        ));
        assert_eq!(to_i64("log_index", Some(4)).unwrap(), Some(4));
        assert_eq!(to_i64("log_index", None).unwrap(), None);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_replayed_job_duplicates_history_but_not_raw_event(db: PgPool) {
        let store = PgStore::new_from_pool(db.clone());
        let job = job();

        let first = store.persist(&job).await.unwrap();
        let second = store.persist(&job).await.unwrap();

        assert!(first.event_inserted);
        assert!(!second.event_inserted);

        let events: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bridge_events")
            .fetch_one(&db)
            .await
            .unwrap();
        let records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM aggregate_records")
            .fetch_one(&db)
            .await
            .unwrap();
        let total: String = sqlx::query_scalar(
            "SELECT total::text FROM aggregate_records WHERE kind = 'TOKEN_VOLUME' LIMIT 1",
        )
        .fetch_one(&db)
        .await
        .unwrap();

        assert_eq!(events, 1);
        assert_eq!(records, 6);
        assert_eq!(total, "12.5");
    }
}
