use crate::types::{BusMessage, ClassifyError, Disposition, FeedEntry, Location, NeedItem, NewFeedEntry, Result};
use async_trait::async_trait;

/// Relational storage for feed entries and their locations.
#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Inserts the entry and, when it is geocoded, its location in one
    /// transaction. Returns the stored entry carrying its assigned id.
    async fn create_feed(&self, entry: &NewFeedEntry, location: &Location) -> Result<FeedEntry>;

    /// Overwrites the location's `reason` and `needs`. Matching no row is not an error.
    async fn update_intent_and_needs(&self, entry_id: i64, reason: &str, needs: &[NeedItem]) -> Result<()>;

    /// Removes the location row and keeps the entry.
    async fn delete_feed_location(&self, entry_id: i64) -> Result<()>;
}

/// The two remote text classifiers.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Comma-joined lowercase intent labels, or `Irrelevant` when the text is
    /// confidently off-topic.
    async fn classify_intent(&self, text: &str) -> std::result::Result<String, ClassifyError>;

    async fn extract_needs(&self, text: &str) -> std::result::Result<Vec<NeedItem>, ClassifyError>;
}

/// Synchronous publish: returns once the broker acknowledged the write.
#[async_trait]
pub trait MessageProducer: Send + Sync {
    async fn send(&self, topic: &str, key: &str, value: &[u8]) -> Result<()>;
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &BusMessage) -> Disposition;
}

/// Marks a message consumed for the consumer group.
pub trait OffsetCommitter: Send + Sync {
    fn commit(&self, message: &BusMessage) -> Result<()>;
}
