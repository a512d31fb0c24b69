use async_trait::async_trait;
use thiserror::Error;

use crate::pgqueue::{DatabaseError, NewJob, PgQueue};
use crate::types::PersistenceJob;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("timed out enqueueing persistence job")]
    Timeout,
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Producer side of the persistence queue.
#[async_trait]
pub trait PersistenceQueue: Send + Sync {
    async fn enqueue(&self, job: PersistenceJob) -> Result<(), QueueError>;
}

/// Enqueues persistence jobs into a `PgQueue` with a fixed attempt budget.
pub struct PgPersistenceQueue {
    queue: PgQueue,
    max_attempts: i32,
}

impl PgPersistenceQueue {
    pub fn new(queue: PgQueue, max_attempts: i32) -> Self {
        Self {
            queue,
            max_attempts,
        }
    }
}

#[async_trait]
impl PersistenceQueue for PgPersistenceQueue {
    async fn enqueue(&self, job: PersistenceJob) -> Result<(), QueueError> {
        self.queue
            .enqueue(NewJob::new(self.max_attempts, job))
            .await?;
        Ok(())
    }
}
