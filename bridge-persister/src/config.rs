use envconfig::Envconfig;

use bridge_common::config::{EnvMsDuration, NonEmptyString, PoolConfig};
use bridge_common::retry::RetryPolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3311")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub pool: PoolConfig,

    #[envconfig(default = "persister")]
    pub worker_name: String,

    #[envconfig(default = "bridge_events")]
    pub queue_name: NonEmptyString,

    #[envconfig(default = "100")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(default = "10")]
    pub dequeue_batch_size: u32,

    #[envconfig(default = "20")]
    pub max_concurrent_jobs: usize,

    #[envconfig(default = "5000")]
    pub store_timeout: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub liveness_deadline: EnvMsDuration,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Batches whose transactions may be open at once. One queue connection
    /// stays free for polling.
    pub fn max_in_flight_batches(&self) -> usize {
        usize::try_from(self.pool.max_pg_connections.saturating_sub(1))
            .unwrap_or(usize::MAX)
            .max(1)
    }

    /// The store gets its own pool with a connection for every job that can
    /// run at once, so writes never wait on connections held by batches.
    pub fn store_pool_size(&self) -> u32 {
        let batch_size = usize::try_from(self.dequeue_batch_size).unwrap_or(usize::MAX);
        u32::try_from(self.max_concurrent_jobs.max(batch_size)).unwrap_or(u32::MAX)
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "100000")]
    pub maximum_interval: EnvMsDuration,
}

impl RetryPolicyConfig {
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy::build(self.backoff_coefficient, self.initial_interval.0)
            .maximum_interval(self.maximum_interval.0)
            .provide()
    }
}
