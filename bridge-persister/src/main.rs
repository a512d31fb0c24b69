//! Consume `PgQueue` jobs to persist bridge events and aggregate history.
use std::future::ready;
use std::sync::Arc;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use bridge_common::metrics::{serve, setup_metrics_recorder, setup_metrics_routes};
use bridge_common::pgqueue::PgQueue;
use bridge_common::store::PgStore;
use bridge_persister::config::Config;
use bridge_persister::worker::PersistenceWorker;
use health::HealthRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let config = Config::init_from_env().wrap_err("invalid configuration")?;
    let recorder_handle = setup_metrics_recorder()?;

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker", config.liveness_deadline.0)
        .await;

    let pool = config
        .pool
        .connect_lazy("bridge-persister")
        .wrap_err("invalid database configuration")?;
    let queue = PgQueue::new_from_pool(config.queue_name.as_str(), pool);
    let store_pool = config
        .pool
        .connect_lazy_sized("bridge-persister-store", config.store_pool_size())
        .wrap_err("invalid database configuration")?;
    let store = Arc::new(PgStore::new_from_pool(store_pool));

    let worker = PersistenceWorker::new(
        &config.worker_name,
        &queue,
        store,
        config.dequeue_batch_size,
        config.poll_interval.0,
        config.store_timeout.0,
        config.max_concurrent_jobs,
        config.max_in_flight_batches(),
        config.retry_policy.provide(),
        worker_liveness,
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router, recorder_handle);
    let bind = config.bind();

    info!(bind, queue = queue.name(), "starting bridge-persister");

    tokio::select! {
        result = worker.run() => {
            result?;
            error!("worker stopped");
        },
        result = serve(router, &bind) => {
            result.wrap_err("http server failed")?;
        },
    }

    Ok(())
}

pub async fn index() -> &'static str {
    "bridge-persister"
}
