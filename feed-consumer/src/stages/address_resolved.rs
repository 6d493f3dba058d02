use crate::traits::{FeedStore, MessageHandler, MessageProducer};
use crate::types::{AddressResolvedMessage, BusMessage, Disposition, IntentWorkItem};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Persists a geocoded feed and queues it for intent resolution.
pub struct AddressResolvedHandler {
    store: Arc<dyn FeedStore>,
    producer: Arc<dyn MessageProducer>,
    intent_topic: String,
}

impl AddressResolvedHandler {
    pub fn new(store: Arc<dyn FeedStore>, producer: Arc<dyn MessageProducer>, intent_topic: String) -> Self {
        Self {
            store,
            producer,
            intent_topic,
        }
    }
}

#[async_trait]
impl MessageHandler for AddressResolvedHandler {
    async fn handle(&self, message: &BusMessage) -> Disposition {
        let payload: AddressResolvedMessage = match serde_json::from_slice(&message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    offset = message.offset,
                    partition = message.partition,
                    error = %e,
                    raw = %message.payload_lossy(),
                    "dropping undecodable location message"
                );
                return Disposition::Commit;
            }
        };

        if payload.feed.full_text.trim().is_empty() {
            warn!(offset = message.offset, partition = message.partition, "dropping location message without text");
            return Disposition::Commit;
        }

        let AddressResolvedMessage { location, feed } = payload;
        let full_text = feed.full_text.clone();
        let entry = feed.into_new_entry(Utc::now());

        let entry_id = match self.store.create_feed(&entry, &location).await {
            Ok(stored) => stored.id,
            Err(e) if !e.is_retryable() => {
                error!(
                    offset = message.offset,
                    partition = message.partition,
                    channel = %entry.channel,
                    error = %e,
                    "feed rejected by store, dropping message"
                );
                return Disposition::Commit;
            }
            Err(e) => {
                error!(offset = message.offset, channel = %entry.channel, error = %e, "failed to store feed");
                return Disposition::Redeliver;
            }
        };
        debug!(entry_id, geocoded = location.is_geocoded(), "stored feed entry");

        let work_item = IntentWorkItem { id: entry_id, full_text };
        let value = match serde_json::to_vec(&work_item) {
            Ok(value) => value,
            Err(e) => {
                error!(entry_id, error = %e, "failed to encode intent work item");
                return Disposition::Commit;
            }
        };

        // The entry is already committed; retrying here would only duplicate it.
        if let Err(e) = self.producer.send(&self.intent_topic, &work_item.key(), &value).await {
            error!(
                entry_id,
                topic = %self.intent_topic,
                error = %e,
                "failed to publish intent work item, entry needs manual re-enqueue"
            );
            return Disposition::Commit;
        }

        info!(entry_id, "feed stored and queued for intent resolution");
        Disposition::Commit
    }
}
