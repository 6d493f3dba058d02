use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default topic carrying geocoded feeds into the pipeline.
pub const LOCATION_TOPIC: &str = "topic.feeds.location";

/// Default topic carrying work items from the address stage to the intent stage.
pub const INTENT_TOPIC: &str = "topic.feeds.intent";

/// A single need tag extracted from the feed text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeedItem {
    pub label: String,
    pub status: bool,
}

impl NeedItem {
    pub fn from_tag(tag: &str) -> Self {
        Self {
            label: tag.to_lowercase(),
            status: true,
        }
    }
}

/// A persisted `feed_entry` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub id: i64,
    pub full_text: String,
    pub channel: String,
    pub timestamp: DateTime<Utc>,
    pub epoch: i64,
    pub extra_parameters: Option<String>,
    pub is_resolved: bool,
    pub reason: Option<String>,
}

/// A feed entry that has not been written yet; the store assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFeedEntry {
    pub full_text: String,
    pub channel: String,
    pub timestamp: DateTime<Utc>,
    pub epoch: i64,
    pub extra_parameters: Option<String>,
    pub is_resolved: bool,
    pub reason: Option<String>,
}

impl NewFeedEntry {
    pub fn with_id(self, id: i64) -> FeedEntry {
        FeedEntry {
            id,
            full_text: self.full_text,
            channel: self.channel,
            timestamp: self.timestamp,
            epoch: self.epoch,
            extra_parameters: self.extra_parameters,
            is_resolved: self.is_resolved,
            reason: self.reason,
        }
    }
}

/// Geocoded point and viewport as produced by the upstream geocoder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    pub entry_id: i64,
    pub formatted_address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub northeast_lat: f64,
    pub northeast_lng: f64,
    pub southwest_lat: f64,
    pub southwest_lng: f64,
    pub epoch: i64,
    pub reason: String,
    pub channel: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Location {
    /// Whether the geocoder produced a usable point. Locations failing this
    /// check are not persisted; the entry is stored on its own.
    pub fn is_geocoded(&self) -> bool {
        !self.formatted_address.is_empty() && self.latitude != 0.0 && self.longitude != 0.0
    }
}

/// A persisted `feed_location` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedLocation {
    pub entry_id: i64,
    pub formatted_address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub northeast_lat: f64,
    pub northeast_lng: f64,
    pub southwest_lat: f64,
    pub southwest_lng: f64,
    pub reason: Option<String>,
    pub channel: String,
    pub epoch: i64,
    pub timestamp: DateTime<Utc>,
    pub needs: Vec<NeedItem>,
    pub is_location_verified: bool,
    pub is_need_verified: bool,
}

impl FeedLocation {
    pub fn from_location(location: &Location, entry_id: i64, timestamp: DateTime<Utc>) -> Self {
        Self {
            entry_id,
            formatted_address: location.formatted_address.clone(),
            latitude: location.latitude,
            longitude: location.longitude,
            northeast_lat: location.northeast_lat,
            northeast_lng: location.northeast_lng,
            southwest_lat: location.southwest_lat,
            southwest_lng: location.southwest_lng,
            reason: Some(location.reason.clone()),
            channel: location.channel.clone(),
            epoch: location.epoch,
            timestamp: location.timestamp.unwrap_or(timestamp),
            needs: Vec::new(),
            is_location_verified: false,
            is_need_verified: false,
        }
    }
}

/// The `feed` half of a location topic message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(rename = "raw_text")]
    pub full_text: String,
    pub is_resolved: bool,
    pub channel: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub epoch: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_parameters: Option<String>,
    pub formatted_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl FeedMessage {
    /// Builds the entry to insert, stamped with the ingest time rather than
    /// whatever the producer claimed.
    pub fn into_new_entry(self, ingested_at: DateTime<Utc>) -> NewFeedEntry {
        NewFeedEntry {
            full_text: self.full_text,
            channel: self.channel,
            timestamp: ingested_at,
            epoch: self.epoch,
            extra_parameters: self.extra_parameters,
            is_resolved: self.is_resolved,
            reason: self.reason,
        }
    }
}

/// Payload of the location topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressResolvedMessage {
    pub location: Location,
    pub feed: FeedMessage,
}

/// Payload of the intent topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentWorkItem {
    pub id: i64,
    pub full_text: String,
}

impl IntentWorkItem {
    /// Partition key for this item. Every message about one entry shares it.
    pub fn key(&self) -> String {
        partition_key(self.id)
    }
}

pub fn partition_key(entry_id: i64) -> String {
    entry_id.to_string()
}
