use std::time;

use envconfig::Envconfig;

use bridge_common::config::{EnvMsDuration, NonEmptyString, PoolConfig};
use bridge_common::retry::RetryPolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(default = "redis://localhost:6379")]
    pub redis_url: String,

    #[envconfig(default = "100")]
    pub redis_response_timeout: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub redis_connection_timeout: EnvMsDuration,

    #[envconfig(nested = true)]
    pub pool: PoolConfig,

    #[envconfig(default = "http://localhost:8545")]
    pub eth_rpc_url: String,

    #[envconfig(default = "0x3a23F943181408EAC424116Af7b7790c94Cb97a5")]
    pub contract_address: NonEmptyString,

    pub start_block: Option<u64>,

    #[envconfig(default = "4000")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub rpc_request_timeout: EnvMsDuration,

    #[envconfig(default = "16")]
    pub source_channel_capacity: usize,

    #[envconfig(default = "500")]
    pub max_block_range: u64,

    #[envconfig(nested = true)]
    pub retry: ReconnectConfig,

    #[envconfig(default = "64")]
    pub max_concurrent_events: usize,

    #[envconfig(default = "3")]
    pub event_retry_attempts: u32,

    #[envconfig(default = "5000")]
    pub operation_timeout: EnvMsDuration,

    #[envconfig(default = "bridge_events")]
    pub queue_name: NonEmptyString,

    #[envconfig(default = "5")]
    pub job_max_attempts: i32,

    #[envconfig(default = "60000")]
    pub liveness_deadline: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Backoff used when the event source connection is lost.
#[derive(Envconfig, Clone)]
pub struct ReconnectConfig {
    #[envconfig(from = "RETRY_BASE_DELAY", default = "1000")]
    pub base_delay: EnvMsDuration,

    #[envconfig(from = "RETRY_MAX_DELAY", default = "30000")]
    pub max_delay: EnvMsDuration,

    #[envconfig(from = "RETRY_MAX_ATTEMPTS", default = "5")]
    pub max_attempts: u32,
}

impl ReconnectConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::build(2, self.base_delay.0)
            .maximum_interval(self.max_delay.0)
            .provide()
    }
}

impl Config {
    /// Backoff between retries of a single event, kept short so one slow
    /// event does not hold its batch back for long.
    pub fn event_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::build(2, time::Duration::from_millis(50))
            .maximum_interval(self.operation_timeout.0)
            .provide()
    }
}
