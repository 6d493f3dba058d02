#![allow(dead_code)]

// Shared fakes for the stage and pipeline tests
use async_trait::async_trait;
use feed_consumer::{
    BusMessage, Classifier, ClassifyError, FeedEntry, FeedLocation, FeedStore, Location, MessageProducer, NeedItem,
    NewFeedEntry, OffsetCommitter, PipelineError, Result,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, Once};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// In-memory store mirroring the feed_entry / feed_location tables.
#[derive(Default)]
pub struct MemoryStore {
    pub entries: Mutex<Vec<FeedEntry>>,
    pub locations: Mutex<HashMap<i64, FeedLocation>>,
    /// Number of upcoming `create_feed` calls that fail.
    pub failing_creates: AtomicUsize,
    /// Refuse every entry the way Postgres refuses malformed data.
    pub reject_creates: AtomicBool,
    pub fail_updates: AtomicBool,
    pub reject_updates: AtomicBool,
    pub fail_deletes: AtomicBool,
}

impl MemoryStore {
    pub fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn location(&self, entry_id: i64) -> Option<FeedLocation> {
        self.locations.lock().unwrap().get(&entry_id).cloned()
    }

    pub fn location_count(&self) -> usize {
        self.locations.lock().unwrap().len()
    }
}

fn unavailable() -> PipelineError {
    PipelineError::General("store unavailable".to_string())
}

fn rejected() -> PipelineError {
    PipelineError::Rejected {
        sqlstate: "22021".to_string(),
        message: "invalid byte sequence for encoding \"UTF8\": 0x00".to_string(),
    }
}

#[async_trait]
impl FeedStore for MemoryStore {
    async fn create_feed(&self, entry: &NewFeedEntry, location: &Location) -> Result<FeedEntry> {
        if self.reject_creates.load(Ordering::SeqCst) {
            return Err(rejected());
        }
        if self
            .failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(unavailable());
        }

        let mut entries = self.entries.lock().unwrap();
        let stored = entry.clone().with_id(entries.len() as i64 + 1);
        let id = stored.id;
        entries.push(stored.clone());

        if location.is_geocoded() {
            self.locations
                .lock()
                .unwrap()
                .insert(id, FeedLocation::from_location(location, id, entry.timestamp));
        }
        Ok(stored)
    }

    async fn update_intent_and_needs(&self, entry_id: i64, reason: &str, needs: &[NeedItem]) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        if self.reject_updates.load(Ordering::SeqCst) {
            return Err(rejected());
        }
        if let Some(location) = self.locations.lock().unwrap().get_mut(&entry_id) {
            location.reason = Some(reason.to_string());
            location.needs = needs.to_vec();
        }
        Ok(())
    }

    async fn delete_feed_location(&self, entry_id: i64) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.locations.lock().unwrap().remove(&entry_id);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub topic: String,
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Default)]
pub struct RecordingProducer {
    pub sent: Mutex<Vec<SentMessage>>,
    pub fail: AtomicBool,
}

impl RecordingProducer {
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, topic: &str) -> Vec<SentMessage> {
        self.sent().into_iter().filter(|m| m.topic == topic).collect()
    }
}

#[async_trait]
impl MessageProducer for RecordingProducer {
    async fn send(&self, topic: &str, key: &str, value: &[u8]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PipelineError::General("broker unreachable".to_string()));
        }
        self.sent.lock().unwrap().push(SentMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            value: value.to_vec(),
        });
        Ok(())
    }
}

/// Classifier answering every call with the same canned results.
pub struct StubClassifier {
    pub intent: std::result::Result<String, ClassifyError>,
    pub needs: std::result::Result<Vec<NeedItem>, ClassifyError>,
    pub needs_calls: AtomicUsize,
}

impl StubClassifier {
    pub fn new(
        intent: std::result::Result<String, ClassifyError>,
        needs: std::result::Result<Vec<NeedItem>, ClassifyError>,
    ) -> Self {
        Self { intent, needs, needs_calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl Classifier for StubClassifier {
    async fn classify_intent(&self, _text: &str) -> std::result::Result<String, ClassifyError> {
        self.intent.clone()
    }

    async fn extract_needs(&self, _text: &str) -> std::result::Result<Vec<NeedItem>, ClassifyError> {
        self.needs_calls.fetch_add(1, Ordering::SeqCst);
        self.needs.clone()
    }
}

#[derive(Default)]
pub struct RecordingCommitter {
    pub offsets: Mutex<Vec<(String, i32, i64)>>,
}

impl OffsetCommitter for RecordingCommitter {
    fn commit(&self, message: &BusMessage) -> Result<()> {
        self.offsets
            .lock()
            .unwrap()
            .push((message.topic.clone(), message.partition, message.offset));
        Ok(())
    }
}

pub fn bus_message(topic: &str, offset: i64, payload: impl Into<Vec<u8>>) -> BusMessage {
    BusMessage {
        topic: topic.to_string(),
        partition: 0,
        offset,
        key: None,
        payload: payload.into(),
    }
}

/// Location topic payload for `text` at the given point.
pub fn location_payload(text: &str, address: &str, latitude: f64, longitude: f64) -> Vec<u8> {
    serde_json::json!({
        "feed": {
            "raw_text": text,
            "channel": "twitter",
            "epoch": 1675845000,
            "is_resolved": false
        },
        "location": {
            "formatted_address": address,
            "latitude": latitude,
            "longitude": longitude,
            "northeast_lat": latitude + 0.01,
            "northeast_lng": longitude + 0.01,
            "southwest_lat": latitude - 0.01,
            "southwest_lng": longitude - 0.01,
            "epoch": 1675845000,
            "channel": "twitter"
        }
    })
    .to_string()
    .into_bytes()
}
