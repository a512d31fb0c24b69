use bridge_common::pgqueue;
use thiserror::Error;

/// Errors that stop a worker or fail a single job update.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a database error occurred when executing a job")]
    DatabaseError(#[from] pgqueue::DatabaseError),
    #[error("the job semaphore was closed")]
    SemaphoreClosed,
}
