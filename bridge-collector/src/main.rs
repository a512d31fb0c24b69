//! Ingest bridge logs, keep the aggregate totals and serve them.
use std::sync::Arc;

use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use bridge_collector::api::{self, AppState};
use bridge_collector::config::Config;
use bridge_collector::coordinator::IngestionCoordinator;
use bridge_collector::engine::AggregationEngine;
use bridge_collector::publisher::BroadcastPublisher;
use bridge_collector::source::JsonRpcLogSource;
use bridge_common::amount::TokenDecimals;
use bridge_common::cache::{AggregateCache, RedisAggregateCache};
use bridge_common::metrics::{serve, setup_metrics_recorder, setup_metrics_routes};
use bridge_common::notification::AGGREGATE_UPDATES_CHANNEL;
use bridge_common::pgqueue::PgQueue;
use bridge_common::queue::{PgPersistenceQueue, PersistenceQueue};
use health::HealthRegistry;

const REALTIME_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let config = Config::init_from_env().wrap_err("invalid configuration")?;
    let recorder_handle = setup_metrics_recorder()?;

    let cache: Arc<dyn AggregateCache> = Arc::new(
        RedisAggregateCache::connect(
            &config.redis_url,
            config.redis_response_timeout.0,
            config.redis_connection_timeout.0,
        )
        .await
        .wrap_err("failed to connect to redis")?,
    );

    let pool = config
        .pool
        .connect_lazy("bridge-collector")
        .wrap_err("invalid database configuration")?;
    let queue: Arc<dyn PersistenceQueue> = Arc::new(PgPersistenceQueue::new(
        PgQueue::new_from_pool(config.queue_name.as_str(), pool),
        config.job_max_attempts,
    ));

    let engine = Arc::new(AggregationEngine::new(
        cache.clone(),
        queue,
        TokenDecimals::mainnet(),
        config.operation_timeout.0,
    ));

    let source = JsonRpcLogSource::new(
        &config.eth_rpc_url,
        config.contract_address.as_str(),
        config.poll_interval.0,
        config.rpc_request_timeout.0,
        config.source_channel_capacity,
        config.max_block_range,
    )?;

    let liveness = HealthRegistry::new("liveness");
    let coordinator_liveness = liveness
        .register("coordinator", config.liveness_deadline.0)
        .await;

    let mut coordinator = IngestionCoordinator::new(
        Arc::new(source),
        engine,
        config.retry.retry_policy(),
        config.retry.max_attempts,
        config.start_block,
        config.max_concurrent_events,
        config.event_retry_attempts,
        config.event_retry_policy(),
        coordinator_liveness,
    );

    let publisher = BroadcastPublisher::new(REALTIME_CHANNEL_CAPACITY);
    let router = api::router(AppState {
        cache: cache.clone(),
        publisher: publisher.clone(),
        liveness,
    });
    let router = setup_metrics_routes(router, recorder_handle);
    let bind = config.bind();

    info!(bind, "starting bridge-collector");

    tokio::select! {
        result = coordinator.run() => match result {
            Ok(()) => info!("coordinator stopped"),
            Err(err) => {
                error!("coordinator failed: {}", err);
                return Err(err.into());
            }
        },
        error = publisher.run(
            cache,
            AGGREGATE_UPDATES_CHANNEL,
            config.retry.retry_policy(),
            config.retry.max_attempts,
        ) => {
            return Err(eyre::Report::new(error).wrap_err("aggregate update relay failed"));
        },
        result = serve(router, &bind) => {
            result.wrap_err("http server failed")?;
        },
    }

    Ok(())
}
