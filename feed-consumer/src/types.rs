use std::time::Duration;

pub use interfaces::defs::{
    AddressResolvedMessage, FeedEntry, FeedLocation, FeedMessage, IntentWorkItem, Location, NeedItem,
    NewFeedEntry,
};

/// What the supervisor should do with a message once its handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Mark and commit the offset; the message is done with.
    Commit,
    /// Leave the offset alone and hand the same message to the handler again.
    Redeliver,
}

/// A message taken off the bus, detached from the consumer that read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct ClassifierEndpoint {
    pub url: url::Url,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub intent: ClassifierEndpoint,
    pub needs: ClassifierEndpoint,
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl ClassifierConfig {
    pub fn new(intent: ClassifierEndpoint, needs: ClassifierEndpoint) -> Self {
        Self {
            intent,
            needs,
            user_agent: "feed-consumer/0.1".to_string(),
            timeout_seconds: 10,
            max_retries: 2,
            retry_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub operation_timeout_seconds: u64,
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_seconds)
    }
}

#[derive(Debug, Clone)]
pub struct RedeliveryConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RedeliveryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

/// Per-partition worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Messages buffered per partition before the partition is paused.
    pub queue_capacity: usize,
    pub redelivery: RedeliveryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            redelivery: RedeliveryConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TopicConfig {
    pub location: String,
    pub intent: String,
    pub intent_dead_letter: Option<String>,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            location: interfaces::defs::LOCATION_TOPIC.to_string(),
            intent: interfaces::defs::INTENT_TOPIC.to_string(),
            intent_dead_letter: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub brokers: String,
    pub group_id: String,
    pub session_timeout_ms: u32,
    pub produce_timeout_seconds: u64,
}

/// Outcome of intent classification that did not yield labels.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClassifyError {
    #[error("text classified as irrelevant (score {score:.2})")]
    Irrelevant { score: f64 },

    #[error("classifier unavailable: {0}")]
    Transient(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// The database refused the data itself (SQLSTATE class 22 or 23).
    /// Retrying the same input cannot succeed.
    #[error("Database rejected data ({sqlstate}): {message}")]
    Rejected { sqlstate: String, message: String },

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: &'static str, seconds: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("General error: {0}")]
    General(String),
}

impl PipelineError {
    /// Whether the same input could succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected { .. } | Self::Serialization(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
