//! Kafka adapter: a consumer-group subscriber that feeds partition workers,
//! and a producer that waits for the broker acknowledgement.

use crate::traits::{MessageHandler, MessageProducer, OffsetCommitter};
use crate::types::{BusConfig, BusMessage, Result, WorkerConfig};
use crate::worker::{PartitionKey, PartitionRouter, PartitionSessions, RouteOutcome};
use async_trait::async_trait;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(100);

/// Client context that ends partition sessions on revocation and reports
/// rebalances and asynchronous commit results.
pub struct PipelineContext {
    ready: watch::Sender<bool>,
    sessions: PartitionSessions,
}

impl ClientContext for PipelineContext {}

impl ConsumerContext for PipelineContext {
    fn pre_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        if let Rebalance::Revoke(partitions) = rebalance {
            for partition in partitions.elements() {
                if self.sessions.revoke(partition.topic(), partition.partition()) {
                    debug!(topic = partition.topic(), partition = partition.partition(), "partition session revoked");
                }
            }
        }
    }

    fn post_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                info!(partitions = partitions.count(), "partitions assigned");
                if !self.ready.send_replace(true) {
                    info!("first consumer group session established");
                }
            }
            Rebalance::Revoke(partitions) => {
                info!(partitions = partitions.count(), "partitions revoked");
            }
            Rebalance::Error(e) => warn!(error = %e, "rebalance failed"),
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(partitions = offsets.count(), "offsets committed"),
            Err(e) => warn!(error = %e, "offset commit rejected"),
        }
    }
}

pub fn to_bus_message<M: Message>(message: &M) -> BusMessage {
    BusMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

#[derive(Clone)]
pub struct KafkaConsumer {
    consumer: Arc<StreamConsumer<PipelineContext>>,
    sessions: PartitionSessions,
}

impl KafkaConsumer {
    /// Builds the group consumer. Offsets are only ever committed explicitly.
    /// The returned receiver flips to `true` on the first partition assignment.
    pub fn new(config: &BusConfig) -> Result<(Self, watch::Receiver<bool>)> {
        let (ready, ready_rx) = watch::channel(false);
        let sessions = PartitionSessions::default();
        let consumer: StreamConsumer<PipelineContext> = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .create_with_context(PipelineContext {
                ready,
                sessions: sessions.clone(),
            })?;

        Ok((
            Self {
                consumer: Arc::new(consumer),
                sessions,
            },
            ready_rx,
        ))
    }

    /// Fails when no broker answers a metadata request within `timeout`.
    pub async fn check_brokers(&self, timeout: Duration) -> Result<usize> {
        let consumer = self.consumer.clone();
        let metadata = tokio::task::spawn_blocking(move || consumer.fetch_metadata(None, timeout))
            .await
            .map_err(|e| crate::types::PipelineError::General(format!("metadata task failed: {e}")))??;
        Ok(metadata.brokers().len())
    }

    /// Subscribes to `topics` and hands every message to `handler` on its
    /// partition's worker until `cancel` fires. A partition whose queue fills
    /// up is paused until its backlog drains. In-flight work is awaited
    /// before returning.
    pub async fn consume(
        &self,
        topics: &[&str],
        handler: Arc<dyn MessageHandler>,
        cancel: &CancellationToken,
        config: &WorkerConfig,
    ) -> Result<()> {
        self.consumer.subscribe(topics)?;
        info!(?topics, "subscribed");

        let committer: Arc<dyn OffsetCommitter> = Arc::new(self.clone());
        let mut router = PartitionRouter::new(
            handler,
            committer,
            cancel.clone(),
            self.sessions.clone(),
            config.clone(),
        );
        let mut paused: HashSet<PartitionKey> = HashSet::new();
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = housekeeping.tick() => {
                    for key in router.prune_revoked() {
                        if paused.remove(&key) {
                            self.set_paused(&key, false);
                        }
                    }
                    if !paused.is_empty() {
                        for key in router.drain_backlogs() {
                            if paused.remove(&key) {
                                self.set_paused(&key, false);
                            }
                        }
                    }
                }
                received = self.consumer.recv() => match received {
                    Ok(message) => {
                        let message = to_bus_message(&message);
                        let key = (message.topic.clone(), message.partition);
                        if router.route(message) == RouteOutcome::Backlogged && paused.insert(key.clone()) {
                            self.set_paused(&key, true);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "consumer error");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                },
            }
        }

        router.shutdown().await;
        self.sessions.revoke_all();
        self.consumer.unsubscribe();
        Ok(())
    }

    fn set_paused(&self, key: &PartitionKey, pause: bool) {
        let mut partitions = TopicPartitionList::new();
        partitions.add_partition(&key.0, key.1);
        let result = if pause {
            self.consumer.pause(&partitions)
        } else {
            self.consumer.resume(&partitions)
        };

        match result {
            Ok(()) if pause => info!(topic = %key.0, partition = key.1, "partition backlogged, fetching paused"),
            Ok(()) => info!(topic = %key.0, partition = key.1, "partition backlog drained, fetching resumed"),
            Err(e) => warn!(topic = %key.0, partition = key.1, paused = pause, error = %e, "failed to change partition fetch state"),
        }
    }
}

impl OffsetCommitter for KafkaConsumer {
    fn commit(&self, message: &BusMessage) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        // The committed offset is the next one to read.
        offsets.add_partition_offset(&message.topic, message.partition, Offset::Offset(message.offset + 1))?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: &BusConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.produce_timeout_seconds);
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("acks", "all")
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .create()?;

        Ok(Self { producer, timeout })
    }

    pub fn flush(&self) -> Result<()> {
        self.producer.flush(self.timeout)?;
        Ok(())
    }
}

#[async_trait]
impl MessageProducer for KafkaProducer {
    async fn send(&self, topic: &str, key: &str, value: &[u8]) -> Result<()> {
        let record = FutureRecord::to(topic).key(key).payload(value);
        let (partition, offset) = self
            .producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| e)?;
        debug!(topic, key, partition, offset, "message acknowledged");
        Ok(())
    }
}
