use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use bridge_collector::coordinator::{CoordinatorError, CoordinatorState, IngestionCoordinator};
use bridge_collector::decode::{SOCKET_BRIDGE_EVENT, SOCKET_BRIDGE_TOPIC};
use bridge_collector::engine::AggregationEngine;
use bridge_collector::publisher::BroadcastPublisher;
use bridge_collector::source::{EventSource, LogBatch, RawLog, SourceError, Subscription};
use bridge_common::amount::TokenDecimals;
use bridge_common::cache::{AggregateCache, MemoryAggregateCache};
use bridge_common::notification::AGGREGATE_UPDATES_CHANNEL;
use bridge_common::queue::{PersistenceQueue, QueueError};
use bridge_common::retry::RetryPolicy;
use bridge_common::types::{AggregateKind, PersistenceJob};
use health::HealthRegistry;

const TOKEN: &str = "0x0000000000000000000000000000000000000aaa";

fn bridge_log(block: u64, log_index: u64, amount: u64, bridge_name: &str) -> RawLog {
    let word = |value: u64| format!("{value:064x}");
    let data = [
        word(amount),
        format!("{:0>64}", &TOKEN[2..]),
        word(8453),
        format!("{:0<64}", hex_label(bridge_name)),
        word(0xa1),
        word(0xb2),
        word(0),
    ]
    .concat();

    RawLog {
        event_name: Some(SOCKET_BRIDGE_EVENT.to_owned()),
        address: "0x3a23f943181408eac424116af7b7790c94cb97a5".to_owned(),
        data: format!("0x{data}"),
        topics: vec![SOCKET_BRIDGE_TOPIC.to_owned()],
        block_number: Some(block),
        transaction_hash: Some(format!("0x{block:064x}")),
        log_index: Some(log_index),
    }
}

fn hex_label(label: &str) -> String {
    label.bytes().map(|byte| format!("{byte:02x}")).collect()
}

#[derive(Default)]
struct RecordingQueue {
    jobs: Mutex<Vec<PersistenceJob>>,
}

#[async_trait]
impl PersistenceQueue for RecordingQueue {
    async fn enqueue(&self, job: PersistenceJob) -> Result<(), QueueError> {
        self.jobs.lock().unwrap().push(job);
        Ok(())
    }
}

enum Step {
    Refuse,
    Deliver(Vec<LogBatch>),
}

/// Plays back one step per subscription, then refuses to connect. The chain
/// head is the first block a step delivers.
struct ScriptedSource {
    steps: Mutex<VecDeque<Step>>,
    requested: Mutex<Vec<Option<u64>>>,
}

impl ScriptedSource {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            requested: Mutex::default(),
        }
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    async fn subscribe(&self, from_block: Option<u64>) -> Result<Subscription, SourceError> {
        self.requested.lock().unwrap().push(from_block);

        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Deliver(batches)) => {
                let head = batches.first().map_or(0, |batch| batch.to_block);
                let (sender, receiver) = mpsc::channel(batches.len().max(1));
                for batch in batches {
                    sender.try_send(Ok(batch)).unwrap();
                }
                Ok(Subscription::new(from_block.unwrap_or(head), receiver))
            }
            Some(Step::Refuse) | None => Err(SourceError::InvalidResponse(
                "connection refused".to_owned(),
            )),
        }
    }
}

struct Pipeline {
    cache: Arc<MemoryAggregateCache>,
    queue: Arc<RecordingQueue>,
    coordinator: IngestionCoordinator,
}

async fn pipeline(source: Arc<ScriptedSource>, max_reconnect_attempts: u32) -> Pipeline {
    let cache = Arc::new(MemoryAggregateCache::new());
    let queue = Arc::new(RecordingQueue::default());
    let engine = AggregationEngine::new(
        cache.clone(),
        queue.clone(),
        TokenDecimals::empty().with_token(TOKEN, 6),
        Duration::from_secs(1),
    );
    let liveness = HealthRegistry::new("liveness")
        .register("coordinator", Duration::from_secs(30))
        .await;

    let coordinator = IngestionCoordinator::new(
        source,
        Arc::new(engine),
        RetryPolicy::build(2, Duration::from_millis(1))
            .maximum_interval(Duration::from_millis(10))
            .provide(),
        max_reconnect_attempts,
        None,
        16,
        2,
        RetryPolicy::build(1, Duration::from_millis(1)).provide(),
        liveness,
    );

    Pipeline {
        cache,
        queue,
        coordinator,
    }
}

#[tokio::test]
async fn bridge_event_flows_to_cache_queue_and_clients() {
    let source = Arc::new(ScriptedSource::new(vec![Step::Deliver(vec![LogBatch {
        logs: vec![bridge_log(100, 0, 2_500_000, "socket")],
        to_block: 100,
    }])]));
    let mut pipeline = pipeline(source, 0).await;

    let publisher = BroadcastPublisher::new(16);
    let mut client = publisher.connect();
    let mut updates = pipeline
        .cache
        .subscribe(AGGREGATE_UPDATES_CHANNEL)
        .await
        .unwrap();

    let result = pipeline.coordinator.run().await;
    assert!(matches!(
        result,
        Err(CoordinatorError::RetriesExhausted { .. })
    ));

    let cache = &pipeline.cache;
    assert_eq!(
        cache
            .get_current(AggregateKind::TokenVolume, TOKEN)
            .await
            .unwrap(),
        "2.5"
    );
    assert_eq!(
        cache
            .get_current(AggregateKind::ChainTxCount, "8453")
            .await
            .unwrap(),
        "1"
    );
    assert_eq!(
        cache
            .get_current(AggregateKind::BridgeUseCount, "socket")
            .await
            .unwrap(),
        "1"
    );

    let jobs = pipeline.queue.jobs.lock().unwrap().clone();
    assert_eq!(jobs.len(), 1);
    let deltas: Vec<&str> = jobs[0].records.iter().map(|r| r.delta.as_str()).collect();
    assert_eq!(deltas, vec!["2.5", "1", "1"]);
    assert_eq!(jobs[0].event.amount, "2500000");
    assert_eq!(jobs[0].event.to_chain_id, "8453");

    for expected in [
        "token_volume_update",
        "chain_volume_update",
        "bridge_usage_update",
    ] {
        let payload = updates.next().await.unwrap();
        assert!(publisher.relay(&payload));
        assert_eq!(client.recv().await.unwrap().event, expected);
    }
}

#[tokio::test]
async fn reconnect_resumes_after_the_last_dispatched_block() {
    let source = Arc::new(ScriptedSource::new(vec![
        Step::Deliver(vec![
            LogBatch {
                logs: vec![bridge_log(10, 0, 1_000_000, "socket")],
                to_block: 10,
            },
            LogBatch {
                logs: vec![
                    bridge_log(11, 0, 1_000_000, "socket"),
                    bridge_log(11, 1, 1_000_000, "hop"),
                ],
                to_block: 11,
            },
        ]),
        Step::Refuse,
        Step::Deliver(vec![LogBatch {
            logs: vec![bridge_log(12, 0, 1_000_000, "socket")],
            to_block: 12,
        }]),
    ]));
    let mut pipeline = pipeline(source.clone(), 2).await;

    let result = pipeline.coordinator.run().await;

    assert!(matches!(
        result,
        Err(CoordinatorError::RetriesExhausted { attempts: 2, .. })
    ));
    assert_eq!(
        pipeline.coordinator.recent_transitions(),
        vec![
            CoordinatorState::Starting,
            CoordinatorState::Listening,
            CoordinatorState::Retrying { attempt: 1 },
            CoordinatorState::Retrying { attempt: 2 },
            CoordinatorState::Listening,
            CoordinatorState::Retrying { attempt: 1 },
            CoordinatorState::Retrying { attempt: 2 },
            CoordinatorState::Failed,
        ]
    );
    assert_eq!(
        *source.requested.lock().unwrap(),
        vec![None, Some(12), Some(12), Some(13), Some(13)]
    );

    assert_eq!(
        pipeline
            .cache
            .get_current(AggregateKind::BridgeUseCount, "socket")
            .await
            .unwrap(),
        "3"
    );
    assert_eq!(
        pipeline
            .cache
            .get_current(AggregateKind::TokenVolume, TOKEN)
            .await
            .unwrap(),
        "4"
    );
    assert_eq!(pipeline.queue.jobs.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn concurrent_events_in_one_batch_lose_no_updates() {
    let logs = (0..50)
        .map(|index| bridge_log(7, index, 100_000, "socket"))
        .collect();
    let source = Arc::new(ScriptedSource::new(vec![Step::Deliver(vec![LogBatch {
        logs,
        to_block: 7,
    }])]));
    let mut pipeline = pipeline(source, 0).await;

    assert!(pipeline.coordinator.run().await.is_err());

    assert_eq!(
        pipeline
            .cache
            .get_current(AggregateKind::TokenVolume, TOKEN)
            .await
            .unwrap(),
        "5"
    );
    assert_eq!(
        pipeline
            .cache
            .get_current(AggregateKind::ChainTxCount, "8453")
            .await
            .unwrap(),
        "50"
    );
    assert_eq!(pipeline.queue.jobs.lock().unwrap().len(), 50);
}
