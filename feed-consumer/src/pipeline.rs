use crate::bus::{KafkaConsumer, KafkaProducer};
use crate::classifier::HttpClassifier;
use crate::config::Config;
use crate::stages::{AddressResolvedHandler, IntentResolvedHandler};
use crate::store::PgFeedStore;
use crate::traits::{Classifier, FeedStore, MessageHandler, MessageProducer};
use crate::types::{BusMessage, Disposition, Result, TopicConfig, WorkerConfig};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const BROKER_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Routes each message to the stage registered for its topic.
pub struct TopicDispatcher {
    routes: HashMap<String, Arc<dyn MessageHandler>>,
}

impl TopicDispatcher {
    pub fn new() -> Self {
        Self { routes: HashMap::new() }
    }

    pub fn route(mut self, topic: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        self.routes.insert(topic.into(), handler);
        self
    }

    /// Wires the address stage to the location topic and the intent stage to
    /// the intent topic. Both stages publish through `producer`.
    pub fn for_stages(
        topics: &TopicConfig,
        store: Arc<dyn FeedStore>,
        classifier: Arc<dyn Classifier>,
        producer: Arc<dyn MessageProducer>,
    ) -> Self {
        let address = AddressResolvedHandler::new(store.clone(), producer.clone(), topics.intent.clone());
        let intent = IntentResolvedHandler::new(store, classifier, producer)
            .with_dead_letter_topic(topics.intent_dead_letter.clone());

        Self::new()
            .route(topics.location.clone(), Arc::new(address))
            .route(topics.intent.clone(), Arc::new(intent))
    }

    pub fn topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        topics.sort_unstable();
        topics
    }
}

impl Default for TopicDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageHandler for TopicDispatcher {
    async fn handle(&self, message: &BusMessage) -> Disposition {
        match self.routes.get(&message.topic) {
            Some(handler) => handler.handle(message).await,
            None => {
                warn!(topic = %message.topic, offset = message.offset, "no stage for topic, skipping message");
                Disposition::Commit
            }
        }
    }
}

/// Owns the store, classifier and bus clients and drives the consumer group
/// until shutdown. Teardown runs in reverse order of construction.
pub struct FeedPipeline {
    store: Arc<PgFeedStore>,
    producer: KafkaProducer,
    consumer: KafkaConsumer,
    dispatcher: Arc<TopicDispatcher>,
    workers: WorkerConfig,
    ready: watch::Receiver<bool>,
}

impl FeedPipeline {
    /// Connects every collaborator. Any failure here is fatal for the process.
    pub async fn start(config: &Config) -> Result<Self> {
        let store = Arc::new(PgFeedStore::connect(&config.store_config()).await?);
        info!("connected to feed store");
        if config.setup_schema {
            store.setup_schema().await?;
        }

        let classifier = Arc::new(HttpClassifier::new(config.classifier_config())?);

        let bus_config = config.bus_config();
        let producer = KafkaProducer::new(&bus_config)?;
        let (consumer, ready) = KafkaConsumer::new(&bus_config)?;
        let brokers = consumer.check_brokers(BROKER_CHECK_TIMEOUT).await?;
        info!(brokers, group = %bus_config.group_id, "connected to message bus");

        let dispatcher = TopicDispatcher::for_stages(
            &config.topic_config(),
            store.clone(),
            classifier,
            Arc::new(producer.clone()),
        );

        Ok(Self {
            store,
            producer,
            consumer,
            dispatcher: Arc::new(dispatcher),
            workers: config.worker_config(),
            ready,
        })
    }

    /// Flips to `true` once the first consumer group session is established.
    pub fn readiness(&self) -> watch::Receiver<bool> {
        self.ready.clone()
    }

    /// Consumes both stage topics until `cancel` fires, subscribing again if
    /// the consumer fails, then tears everything down. Rebalances are handled
    /// per partition inside the consumer.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let topics = self.dispatcher.topics();
        let handler: Arc<dyn MessageHandler> = self.dispatcher.clone();

        while !cancel.is_cancelled() {
            if let Err(e) = self.consumer.consume(&topics, handler.clone(), &cancel, &self.workers).await {
                error!(error = %e, "consumer session failed");
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(self) {
        info!("shutting down feed pipeline");
        if let Err(e) = self.producer.flush() {
            warn!(error = %e, "producer flush incomplete");
        }
        self.store.close().await;
        info!("feed pipeline stopped");
    }
}
