use std::sync::Arc;
use std::time;

use futures::future::join_all;
use health::HealthHandle;
use tokio::sync;
use tracing::{debug, error, warn};

use bridge_common::pgqueue::{
    Job, JobError, PgQueue, PgQueueJob, PgTransactionBatch, PgTransactionJob, RetryError,
    RetryInvalidError,
};
use bridge_common::retry::RetryPolicy;
use bridge_common::store::{DurableStore, StoreError};
use bridge_common::types::PersistenceJob;

use crate::error::WorkerError;

/// A dequeued `PgQueueJob` carrying a `PersistenceJob`.
pub trait PersistenceQueueJob: PgQueueJob + Send {
    fn job(&self) -> &Job<PersistenceJob>;

    fn parameters(&self) -> &PersistenceJob {
        &self.job().parameters
    }

    fn attempt(&self) -> i32 {
        self.job().attempt
    }

    fn queue(&self) -> String {
        self.job().queue.to_owned()
    }
}

impl PersistenceQueueJob for PgTransactionJob<'_, PersistenceJob> {
    fn job(&self) -> &Job<PersistenceJob> {
        &self.job
    }
}

/// What happened to a job after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retried,
    DeadLettered,
}

/// A worker to poll `PgQueue` and write the dequeued jobs to the durable store.
pub struct PersistenceWorker<'p> {
    /// An identifier for this worker. Used to mark jobs we have consumed.
    name: String,
    /// The queue we will be dequeuing jobs from.
    queue: &'p PgQueue,
    /// Where raw events and aggregate history end up.
    store: Arc<dyn DurableStore>,
    /// The maximum number of jobs to dequeue in one query.
    dequeue_batch_size: u32,
    /// The interval for polling the queue.
    poll_interval: time::Duration,
    /// Upper bound for one write to the durable store.
    store_timeout: time::Duration,
    /// Maximum number of concurrent jobs being processed.
    max_concurrent_jobs: usize,
    /// Maximum number of dequeued batches, each holding a queue connection
    /// for its open transaction.
    max_in_flight_batches: usize,
    /// The retry policy used to calculate retry intervals when a write fails.
    retry_policy: RetryPolicy,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
}

impl<'p> PersistenceWorker<'p> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        queue: &'p PgQueue,
        store: Arc<dyn DurableStore>,
        dequeue_batch_size: u32,
        poll_interval: time::Duration,
        store_timeout: time::Duration,
        max_concurrent_jobs: usize,
        max_in_flight_batches: usize,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
    ) -> Self {
        let dequeue_batch_size = dequeue_batch_size.max(1);
        // A whole batch must fit into the semaphore.
        let max_concurrent_jobs =
            max_concurrent_jobs.max(usize::try_from(dequeue_batch_size).unwrap_or(usize::MAX));

        Self {
            name: name.to_owned(),
            queue,
            store,
            dequeue_batch_size,
            poll_interval,
            store_timeout,
            max_concurrent_jobs,
            max_in_flight_batches: max_in_flight_batches.max(1),
            retry_policy,
            liveness,
        }
    }

    /// Wait until at least one job becomes available in our queue.
    async fn wait_for_jobs_tx(&self) -> PgTransactionBatch<'static, PersistenceJob> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;

            match self
                .queue
                .dequeue_tx(&self.name, self.dequeue_batch_size)
                .await
            {
                Ok(Some(batch)) => return batch,
                Ok(None) => continue,
                Err(error) => {
                    error!("error while trying to dequeue_tx job: {}", error);
                    continue;
                }
            }
        }
    }

    /// Run this worker to continuously process any jobs that become available.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let semaphore = Arc::new(sync::Semaphore::new(self.max_concurrent_jobs));
        let batches = Arc::new(sync::Semaphore::new(self.max_in_flight_batches));
        let report_semaphore_utilization = || {
            metrics::gauge!("persistence_worker_saturation_percent")
                .set(1f64 - semaphore.available_permits() as f64 / self.max_concurrent_jobs as f64);
        };

        let dequeue_batch_size_histogram = metrics::histogram!("persistence_dequeue_batch_size");

        loop {
            report_semaphore_utilization();

            // Taken before dequeueing: the batch transaction pins a connection.
            let batch_permit = batches
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::SemaphoreClosed)?;
            let batch = self.wait_for_jobs_tx().await;
            dequeue_batch_size_histogram.record(batch.jobs.len() as f64);

            let permits = u32::try_from(batch.jobs.len()).unwrap_or(u32::MAX);
            let permit = semaphore
                .clone()
                .acquire_many_owned(permits)
                .await
                .map_err(|_| WorkerError::SemaphoreClosed)?;

            let store = self.store.clone();
            let retry_policy = self.retry_policy.clone();
            let store_timeout = self.store_timeout;

            tokio::spawn(async move {
                process_batch(batch, store, store_timeout, retry_policy).await;
                drop(permit);
                drop(batch_permit);
            });
        }
    }
}

/// Process every job of `batch`, then commit the job updates together.
async fn process_batch(
    mut batch: PgTransactionBatch<'_, PersistenceJob>,
    store: Arc<dyn DurableStore>,
    store_timeout: time::Duration,
    retry_policy: RetryPolicy,
) {
    let futures = std::mem::take(&mut batch.jobs).into_iter().map(|job| {
        process_persistence_job(store.as_ref(), job, store_timeout, &retry_policy)
    });

    for result in join_all(futures).await {
        if let Err(error) = result {
            error!("failed to update persistence job: {}", error);
        }
    }

    if let Err(error) = batch.commit().await {
        // Uncommitted jobs go back to available and will be delivered again.
        metrics::counter!("persistence_batch_commit_failed").increment(1);
        error!("error committing transactional batch: {}", error);
    }
}

/// Write one job to the durable store and move it to its next state.
///
/// A failed write is retried with `retry_policy` while the job has attempts
/// left; after that the job is dead-lettered, never dropped.
pub async fn process_persistence_job<J: PersistenceQueueJob>(
    store: &dyn DurableStore,
    job: J,
    store_timeout: time::Duration,
    retry_policy: &RetryPolicy,
) -> Result<JobOutcome, WorkerError> {
    let labels = [("queue", job.queue())];
    metrics::counter!("persistence_jobs_total", &labels).increment(1);

    let now = tokio::time::Instant::now();
    let persisted = tokio::time::timeout(store_timeout, store.persist(job.parameters()))
        .await
        .unwrap_or(Err(StoreError::Timeout));
    let elapsed = now.elapsed().as_secs_f64();

    match persisted {
        Ok(outcome) => {
            if !outcome.event_inserted {
                debug!(
                    job_id = job.job().id,
                    "raw event was stored by an earlier delivery"
                );
                metrics::counter!("persistence_jobs_redelivered", &labels).increment(1);
            }

            job.complete().await?;

            metrics::counter!("persistence_jobs_completed", &labels).increment(1);
            metrics::histogram!("persistence_jobs_processing_duration_seconds", &labels)
                .record(elapsed);

            Ok(JobOutcome::Completed)
        }
        Err(store_error) => {
            let job_id = job.job().id;
            let attempt = job.attempt();
            let retry_interval = retry_policy.retry_interval(u32::try_from(attempt).unwrap_or(0));
            let job_error = JobError::new(attempt, store_error.to_string());

            match job.retry(job_error, retry_interval).await {
                Ok(()) => {
                    warn!(
                        job_id,
                        attempt,
                        retry_in_ms = retry_interval.as_millis(),
                        "failed to persist job, will retry: {}",
                        store_error
                    );
                    metrics::counter!("persistence_jobs_retried", &labels).increment(1);

                    Ok(JobOutcome::Retried)
                }
                Err(RetryError::RetryInvalidError(RetryInvalidError { job, error })) => {
                    error!(
                        job_id,
                        attempt, "persistence job exhausted its attempts: {}", store_error
                    );
                    job.dead_letter(error).await?;

                    metrics::counter!("persistence_jobs_dead_lettered", &labels).increment(1);

                    Ok(JobOutcome::DeadLettered)
                }
                Err(RetryError::DatabaseError(error)) => {
                    metrics::counter!("persistence_jobs_database_error", &labels).increment(1);
                    Err(WorkerError::from(error))
                }
            }
        }
    }
}
