use crate::traits::{Classifier, FeedStore, MessageHandler, MessageProducer};
use crate::types::{BusMessage, ClassifyError, Disposition, IntentWorkItem};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Classifies a stored feed and writes the labels and needs back to its
/// location, or removes the location when the text is off-topic.
pub struct IntentResolvedHandler {
    store: Arc<dyn FeedStore>,
    classifier: Arc<dyn Classifier>,
    producer: Arc<dyn MessageProducer>,
    dead_letter_topic: Option<String>,
}

impl IntentResolvedHandler {
    pub fn new(store: Arc<dyn FeedStore>, classifier: Arc<dyn Classifier>, producer: Arc<dyn MessageProducer>) -> Self {
        Self {
            store,
            classifier,
            producer,
            dead_letter_topic: None,
        }
    }

    /// Routes work items whose classification failed to `topic` instead of
    /// only dropping them.
    pub fn with_dead_letter_topic(mut self, topic: Option<String>) -> Self {
        self.dead_letter_topic = topic;
        self
    }

    async fn dead_letter(&self, item: &IntentWorkItem, message: &BusMessage) {
        let Some(topic) = &self.dead_letter_topic else {
            return;
        };

        match self.producer.send(topic, &item.key(), &message.payload).await {
            Ok(()) => info!(entry_id = item.id, topic = %topic, "work item sent to dead-letter topic"),
            Err(e) => error!(entry_id = item.id, topic = %topic, error = %e, "failed to dead-letter work item"),
        }
    }
}

#[async_trait]
impl MessageHandler for IntentResolvedHandler {
    async fn handle(&self, message: &BusMessage) -> Disposition {
        let item: IntentWorkItem = match serde_json::from_slice(&message.payload) {
            Ok(item) => item,
            Err(e) => {
                error!(
                    offset = message.offset,
                    partition = message.partition,
                    error = %e,
                    raw = %message.payload_lossy(),
                    "dropping undecodable intent message"
                );
                return Disposition::Commit;
            }
        };

        let labels = match self.classifier.classify_intent(&item.full_text).await {
            Ok(labels) => labels,
            Err(ClassifyError::Irrelevant { score }) => {
                info!(entry_id = item.id, score, "feed classified as irrelevant, removing location");
                if let Err(e) = self.store.delete_feed_location(item.id).await {
                    error!(entry_id = item.id, error = %e, "failed to delete irrelevant feed location");
                }
                return Disposition::Commit;
            }
            Err(e) => {
                warn!(entry_id = item.id, error = %e, "intent classification failed, skipping enrichment");
                self.dead_letter(&item, message).await;
                return Disposition::Commit;
            }
        };

        let needs = match self.classifier.extract_needs(&item.full_text).await {
            Ok(needs) => needs,
            Err(e) => {
                warn!(entry_id = item.id, error = %e, "needs extraction failed, skipping enrichment");
                self.dead_letter(&item, message).await;
                return Disposition::Commit;
            }
        };

        match self.store.update_intent_and_needs(item.id, &labels, &needs).await {
            Ok(()) => {}
            Err(e) if !e.is_retryable() => {
                error!(entry_id = item.id, error = %e, "intent and needs rejected by store, skipping enrichment");
                return Disposition::Commit;
            }
            Err(e) => {
                error!(entry_id = item.id, error = %e, "failed to store intent and needs");
                return Disposition::Redeliver;
            }
        }

        debug!(entry_id = item.id, reason = %labels, needs = needs.len(), "feed enriched");
        Disposition::Commit
    }
}
