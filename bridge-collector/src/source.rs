//! Log delivery from the chain.
//!
//! An `EventSource` hands out subscriptions: bounded channels of `LogBatch`es
//! in block order. A subscription ends with an error item (or by closing) when
//! the connection is lost; reconnecting is the coordinator's job.
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::decode::{SOCKET_BRIDGE_EVENT, SOCKET_BRIDGE_TOPIC};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("rpc transport failed: {0}")]
    Connection(#[from] reqwest::Error),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("invalid rpc response: {0}")]
    InvalidResponse(String),
    #[error("log subscription closed")]
    Closed,
}

/// A contract log as delivered by the node, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub event_name: Option<String>,
    pub address: String,
    pub data: String,
    pub topics: Vec<String>,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<String>,
    pub log_index: Option<u64>,
}

/// All matching logs of the block range ending at `to_block`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBatch {
    pub logs: Vec<RawLog>,
    pub to_block: u64,
}

/// Batches of one connection, starting at `start_block`.
#[derive(Debug)]
pub struct Subscription {
    /// First block covered; resolved from the chain head when none was requested.
    pub start_block: u64,
    batches: mpsc::Receiver<Result<LogBatch, SourceError>>,
}

impl Subscription {
    pub fn new(start_block: u64, batches: mpsc::Receiver<Result<LogBatch, SourceError>>) -> Self {
        Self {
            start_block,
            batches,
        }
    }

    /// Next batch, or `None` once the source stopped delivering.
    pub async fn recv(&mut self) -> Option<Result<LogBatch, SourceError>> {
        self.batches.recv().await
    }
}

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Start delivering batches from `from_block`, or from the chain head when `None`.
    async fn subscribe(&self, from_block: Option<u64>) -> Result<Subscription, SourceError>;
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: String,
    topics: Vec<String>,
    data: String,
    block_number: Option<String>,
    transaction_hash: Option<String>,
    log_index: Option<String>,
    #[serde(default)]
    removed: bool,
}

fn parse_quantity(value: &str) -> Result<u64, SourceError> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| SourceError::InvalidResponse(format!("{value} is not a hex quantity")))?;
    u64::from_str_radix(digits, 16)
        .map_err(|_| SourceError::InvalidResponse(format!("{value} is not a hex quantity")))
}

impl RpcLog {
    fn into_raw_log(self) -> Result<RawLog, SourceError> {
        let matches_event = self
            .topics
            .first()
            .is_some_and(|topic| topic.eq_ignore_ascii_case(SOCKET_BRIDGE_TOPIC));

        Ok(RawLog {
            event_name: matches_event.then(|| SOCKET_BRIDGE_EVENT.to_owned()),
            address: self.address,
            data: self.data,
            topics: self.topics,
            block_number: self.block_number.as_deref().map(parse_quantity).transpose()?,
            transaction_hash: self.transaction_hash,
            log_index: self.log_index.as_deref().map(parse_quantity).transpose()?,
        })
    }
}

/// Polls an Ethereum JSON-RPC endpoint with `eth_blockNumber` and `eth_getLogs`.
#[derive(Clone)]
pub struct JsonRpcLogSource {
    client: reqwest::Client,
    url: String,
    contract_address: String,
    poll_interval: Duration,
    channel_capacity: usize,
    max_block_range: u64,
}

impl JsonRpcLogSource {
    pub fn new(
        url: &str,
        contract_address: &str,
        poll_interval: Duration,
        request_timeout: Duration,
        channel_capacity: usize,
        max_block_range: u64,
    ) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .user_agent("bridge-collector")
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            url: url.to_owned(),
            contract_address: contract_address.to_owned(),
            poll_interval,
            channel_capacity: channel_capacity.max(1),
            max_block_range: max_block_range.max(1),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, SourceError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };

        let response: RpcResponse<T> = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match (response.result, response.error) {
            (_, Some(error)) => Err(SourceError::Rpc {
                code: error.code,
                message: error.message,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Err(SourceError::InvalidResponse(format!(
                "{method} returned neither result nor error"
            ))),
        }
    }

    async fn block_number(&self) -> Result<u64, SourceError> {
        let block: String = self.call("eth_blockNumber", serde_json::json!([])).await?;
        parse_quantity(&block)
    }

    async fn get_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<RawLog>, SourceError> {
        let filter = serde_json::json!([{
            "address": self.contract_address,
            "topics": [SOCKET_BRIDGE_TOPIC],
            "fromBlock": format!("0x{from_block:x}"),
            "toBlock": format!("0x{to_block:x}"),
        }]);
        let logs: Vec<RpcLog> = self.call("eth_getLogs", filter).await?;

        logs.into_iter()
            .filter(|log| !log.removed)
            .map(RpcLog::into_raw_log)
            .collect()
    }

    /// Logs from `next_block` up to the head, at most `max_block_range` blocks.
    /// `None` while the head has not reached `next_block`.
    async fn next_batch(&self, next_block: u64) -> Result<Option<LogBatch>, SourceError> {
        let head = self.block_number().await?;
        if head < next_block {
            return Ok(None);
        }

        let to_block = head.min(next_block.saturating_add(self.max_block_range - 1));
        let logs = self.get_logs(next_block, to_block).await?;

        Ok(Some(LogBatch { logs, to_block }))
    }

    async fn poll(self, mut next_block: u64, sender: mpsc::Sender<Result<LogBatch, SourceError>>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if sender.is_closed() {
                return;
            }

            match self.next_batch(next_block).await {
                Ok(None) => continue,
                Ok(Some(batch)) => {
                    debug!(
                        from_block = next_block,
                        to_block = batch.to_block,
                        logs = batch.logs.len(),
                        "fetched log batch"
                    );
                    next_block = batch.to_block + 1;
                    // Blocks while the coordinator is still busy with earlier batches.
                    if sender.send(Ok(batch)).await.is_err() {
                        return;
                    }
                }
                Err(error) => {
                    if sender.send(Err(error)).await.is_err() {
                        debug!("subscription dropped before the error was delivered");
                    }
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl EventSource for JsonRpcLogSource {
    async fn subscribe(&self, from_block: Option<u64>) -> Result<Subscription, SourceError> {
        let head = self.block_number().await?;
        let start = from_block.unwrap_or(head);
        info!(
            contract = self.contract_address,
            head, start, "subscribed to bridge logs"
        );

        let (sender, receiver) = mpsc::channel(self.channel_capacity);
        tokio::spawn(self.clone().poll(start, sender));

        Ok(Subscription::new(start, receiver))
    }
}
