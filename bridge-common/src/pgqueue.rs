//! # PgQueue
//!
//! A job queue implementation backed by the `persistence_jobs` PostgreSQL table.
//! Jobs are dequeued in batches inside a transaction; the row locks taken by
//! `FOR UPDATE SKIP LOCKED` keep other workers away from them until the batch
//! is committed, and a worker that dies mid-batch rolls everything back to
//! `available`.
use std::str::FromStr;
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::postgres::{PgPool, Postgres};
use sqlx::types::Json;
use thiserror::Error;
use tokio::sync::Mutex;

/// Enumeration of database-related errors for PgQueue.
/// Errors that can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction {command} failed with: {error}")]
    TransactionError { command: String, error: sqlx::Error },
    #[error("transaction was already closed")]
    TransactionAlreadyClosedError,
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("{0} is not a valid JobStatus")]
    ParseJobStatusError(String),
}

/// Returned by `retry`: either the database failed, or the job has no
/// attempts left and is handed back so the caller can dead-letter it.
pub enum RetryError<J> {
    DatabaseError(DatabaseError),
    RetryInvalidError(RetryInvalidError<J>),
}

pub struct RetryInvalidError<J> {
    pub job: J,
    pub error: JobError,
}

impl<J> From<DatabaseError> for RetryError<J> {
    fn from(error: DatabaseError) -> Self {
        RetryError::DatabaseError(error)
    }
}

/// Enumeration of possible statuses for a Job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "job_status")]
#[sqlx(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the queue to be picked up by a worker.
    Available,
    /// Written to the durable store.
    Completed,
    /// Failed on every allowed attempt; kept for manual inspection.
    DeadLetter,
    /// Picked up by a worker whose batch transaction is still open.
    Running,
}

impl FromStr for JobStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(JobStatus::Available),
            "completed" => Ok(JobStatus::Completed),
            "dead_letter" => Ok(JobStatus::DeadLetter),
            "running" => Ok(JobStatus::Running),
            invalid => Err(ParseError::ParseJobStatusError(invalid.to_owned())),
        }
    }
}

/// Appended to a job's `errors` column every time an attempt fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub attempt: i32,
    pub message: String,
}

impl JobError {
    pub fn new(attempt: i32, message: impl Into<String>) -> Self {
        Self {
            attempt,
            message: message.into(),
        }
    }
}

/// A Job to be executed by a worker dequeueing a PgQueue.
#[derive(sqlx::FromRow, Debug)]
pub struct Job<J> {
    pub id: i64,
    /// Incremented on every dequeue, so the first delivery is attempt 1.
    pub attempt: i32,
    pub attempted_at: Option<DateTime<Utc>>,
    pub attempted_by: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub max_attempts: i32,
    pub parameters: Json<J>,
    pub queue: String,
    pub status: JobStatus,
}

impl<J> Job<J> {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A NewJob to be enqueued into a PgQueue.
pub struct NewJob<J> {
    pub max_attempts: i32,
    pub parameters: Json<J>,
}

impl<J> NewJob<J> {
    pub fn new(max_attempts: i32, parameters: J) -> Self {
        Self {
            max_attempts,
            parameters: Json(parameters),
        }
    }
}

/// Operations a worker performs on a dequeued job.
#[async_trait]
pub trait PgQueueJob: Send + Sized {
    async fn complete(self) -> Result<(), DatabaseError>;

    /// Make the job available again after `retry_interval`, or hand it back
    /// inside `RetryError::RetryInvalidError` when no attempts are left.
    async fn retry(
        self,
        error: JobError,
        retry_interval: time::Duration,
    ) -> Result<(), RetryError<Self>>;

    async fn dead_letter(self, error: JobError) -> Result<(), DatabaseError>;
}

type SharedTransaction<'c> = Arc<Mutex<Option<sqlx::Transaction<'c, Postgres>>>>;

/// A job dequeued as part of a batch. Its updates only become visible once
/// the batch is committed.
pub struct PgTransactionJob<'c, J> {
    pub job: Job<J>,
    shared_txn: SharedTransaction<'c>,
}

impl<J> PgTransactionJob<'_, J> {
    async fn execute(
        &self,
        command: &str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<(), DatabaseError> {
        let mut guard = self.shared_txn.lock().await;
        let txn = guard
            .as_mut()
            .ok_or(DatabaseError::TransactionAlreadyClosedError)?;

        query
            .execute(&mut **txn)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: command.to_owned(),
                error,
            })?;

        Ok(())
    }
}

const COMPLETE_JOB: &str = r#"
UPDATE persistence_jobs
SET
    finished_at = NOW(),
    status = 'completed'::job_status
WHERE
    queue = $1
    AND id = $2
"#;

const RETRY_JOB: &str = r#"
UPDATE persistence_jobs
SET
    status = 'available'::job_status,
    scheduled_at = NOW() + $3,
    errors = array_append(errors, $4)
WHERE
    queue = $1
    AND id = $2
"#;

const DEAD_LETTER_JOB: &str = r#"
UPDATE persistence_jobs
SET
    finished_at = NOW(),
    status = 'dead_letter'::job_status,
    errors = array_append(errors, $3)
WHERE
    queue = $1
    AND id = $2
"#;

#[async_trait]
impl<'c, J: Send + Sync> PgQueueJob for PgTransactionJob<'c, J> {
    async fn complete(self) -> Result<(), DatabaseError> {
        let query = sqlx::query(COMPLETE_JOB)
            .bind(&self.job.queue)
            .bind(self.job.id);
        self.execute("UPDATE", query).await
    }

    async fn retry(
        self,
        error: JobError,
        retry_interval: time::Duration,
    ) -> Result<(), RetryError<Self>> {
        if self.job.is_final_attempt() {
            return Err(RetryError::RetryInvalidError(RetryInvalidError {
                job: self,
                error,
            }));
        }

        let query = sqlx::query(RETRY_JOB)
            .bind(&self.job.queue)
            .bind(self.job.id)
            .bind(retry_interval)
            .bind(Json(&error));
        self.execute("UPDATE", query).await?;
        Ok(())
    }

    async fn dead_letter(self, error: JobError) -> Result<(), DatabaseError> {
        let query = sqlx::query(DEAD_LETTER_JOB)
            .bind(&self.job.queue)
            .bind(self.job.id)
            .bind(Json(&error));
        self.execute("UPDATE", query).await
    }
}

/// The jobs of one dequeue, sharing one open transaction.
pub struct PgTransactionBatch<'c, J> {
    pub jobs: Vec<PgTransactionJob<'c, J>>,
    shared_txn: SharedTransaction<'c>,
}

impl<J> PgTransactionBatch<'_, J> {
    pub async fn commit(self) -> Result<(), DatabaseError> {
        let mut guard = self.shared_txn.lock().await;
        let txn = guard
            .take()
            .ok_or(DatabaseError::TransactionAlreadyClosedError)?;

        txn.commit()
            .await
            .map_err(|error| DatabaseError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })
    }
}

const DEQUEUE_JOBS: &str = r#"
WITH available_in_queue AS (
    SELECT
        id
    FROM
        persistence_jobs
    WHERE
        status = 'available'
        AND scheduled_at <= NOW()
        AND queue = $1
    ORDER BY
        attempt,
        scheduled_at
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
UPDATE
    persistence_jobs
SET
    attempted_at = NOW(),
    status = 'running'::job_status,
    attempt = persistence_jobs.attempt + 1,
    attempted_by = array_append(persistence_jobs.attempted_by, $3::text)
FROM
    available_in_queue
WHERE
    persistence_jobs.id = available_in_queue.id
RETURNING
    persistence_jobs.*
"#;

const ENQUEUE_JOB: &str = r#"
INSERT INTO persistence_jobs
    (attempt, created_at, scheduled_at, max_attempts, parameters, queue, status)
VALUES
    (0, NOW(), NOW(), $1, $2, $3, 'available'::job_status)
"#;

/// A queue implemented on top of a PostgreSQL table.
#[derive(Clone)]
pub struct PgQueue {
    name: String,
    pool: PgPool,
}

impl PgQueue {
    pub fn new_from_pool(queue_name: &str, pool: PgPool) -> Self {
        Self {
            name: queue_name.to_owned(),
            pool,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take up to `limit` available jobs. The returned batch holds an open
    /// transaction that must be committed for any job update to stick.
    pub async fn dequeue_tx<J>(
        &self,
        attempted_by: &str,
        limit: u32,
    ) -> Result<Option<PgTransactionBatch<'static, J>>, DatabaseError>
    where
        J: DeserializeOwned + Send + Unpin + 'static,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| DatabaseError::ConnectionError { error })?;

        let jobs: Vec<Job<J>> = sqlx::query_as(DEQUEUE_JOBS)
            .bind(&self.name)
            .bind(i64::from(limit))
            .bind(attempted_by)
            .fetch_all(&mut *tx)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        if jobs.is_empty() {
            // Dropping the transaction rolls it back.
            return Ok(None);
        }

        let shared_txn = Arc::new(Mutex::new(Some(tx)));
        let jobs = jobs
            .into_iter()
            .map(|job| PgTransactionJob {
                job,
                shared_txn: shared_txn.clone(),
            })
            .collect();

        Ok(Some(PgTransactionBatch { jobs, shared_txn }))
    }

    /// Enqueue a Job into this PgQueue.
    /// We take ownership of NewJob to enforce a specific NewJob is only enqueued once.
    pub async fn enqueue<J: Serialize + Sync>(&self, job: NewJob<J>) -> Result<(), DatabaseError> {
        sqlx::query(ENQUEUE_JOB)
            .bind(job.max_attempts)
            .bind(&job.parameters)
            .bind(&self.name)
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct TestParameters {
        token: String,
    }

    fn parameters() -> TestParameters {
        TestParameters {
            token: "0xAAA".to_owned(),
        }
    }

    #[test]
    fn test_job_status_parsing() {
        assert_eq!(
            "dead_letter".parse::<JobStatus>().unwrap(),
            JobStatus::DeadLetter
        );
        assert!("failed".parse::<JobStatus>().is_err());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_can_dequeue_job(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_can_dequeue_job", db);
        queue.enqueue(NewJob::new(3, parameters())).await.unwrap();

        let mut batch: PgTransactionBatch<'_, TestParameters> = queue
            .dequeue_tx("worker-1", 10)
            .await
            .unwrap()
            .expect("one job is available");
        let job = batch.jobs.pop().unwrap();

        assert_eq!(job.job.attempt, 1);
        assert_eq!(job.job.attempted_by, vec!["worker-1".to_owned()]);
        assert_eq!(job.job.max_attempts, 3);
        assert_eq!(job.job.status, JobStatus::Running);
        assert_eq!(*job.job.parameters, parameters());

        job.complete().await.unwrap();
        batch.commit().await.unwrap();

        let next: Option<PgTransactionBatch<'_, TestParameters>> =
            queue.dequeue_tx("worker-1", 10).await.unwrap();
        assert!(next.is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_uncommitted_batch_is_redelivered(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_uncommitted_batch_is_redelivered", db);
        queue.enqueue(NewJob::new(3, parameters())).await.unwrap();

        let batch: PgTransactionBatch<'_, TestParameters> =
            queue.dequeue_tx("worker-1", 10).await.unwrap().unwrap();
        drop(batch);

        let mut batch: PgTransactionBatch<'_, TestParameters> =
            queue.dequeue_tx("worker-2", 10).await.unwrap().unwrap();
        let job = batch.jobs.pop().unwrap();
        assert_eq!(job.job.attempt, 1);
        assert_eq!(job.job.attempted_by, vec!["worker-2".to_owned()]);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_retry_on_final_attempt_is_invalid(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_retry_on_final_attempt_is_invalid", db.clone());
        queue.enqueue(NewJob::new(1, parameters())).await.unwrap();

        let mut batch: PgTransactionBatch<'_, TestParameters> =
            queue.dequeue_tx("worker-1", 10).await.unwrap().unwrap();
        let job = batch.jobs.pop().unwrap();

        let job = match job
            .retry(JobError::new(1, "store down"), time::Duration::from_secs(1))
            .await
        {
            Err(RetryError::RetryInvalidError(invalid)) => invalid.job,
            _ => panic!("a job on its final attempt cannot be retried"),
        };
        job.dead_letter(JobError::new(1, "store down")).await.unwrap();
        batch.commit().await.unwrap();

        let status: JobStatus =
            sqlx::query_scalar("SELECT status FROM persistence_jobs WHERE queue = $1")
                .bind("test_retry_on_final_attempt_is_invalid")
                .fetch_one(&db)
                .await
                .unwrap();
        assert_eq!(status, JobStatus::DeadLetter);
    }
}
