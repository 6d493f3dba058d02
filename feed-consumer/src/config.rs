use crate::types::{
    BusConfig, ClassifierConfig, ClassifierEndpoint, RedeliveryConfig, StoreConfig, TopicConfig,
    WorkerConfig,
};
use clap::Parser;
use interfaces::defs::{INTENT_TOPIC, LOCATION_TOPIC};
use url::Url;

/// Feed enrichment consumer. Every option can also be set through the
/// environment variable named next to it.
#[derive(Debug, Clone, Parser)]
#[command(name = "feed-consumer", version)]
pub struct Config {
    /// Postgres connection string
    #[arg(long, env = "DB_CONN_STR", hide_env_values = true)]
    pub db_conn_str: String,

    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 10)]
    pub db_max_connections: u32,

    #[arg(long, env = "STORE_TIMEOUT_SECS", default_value_t = 10)]
    pub store_timeout_secs: u64,

    /// Create the feed tables and indexes when they are missing
    #[arg(long, env = "SETUP_SCHEMA", default_value_t = false)]
    pub setup_schema: bool,

    /// Comma separated bootstrap servers
    #[arg(long, env = "KAFKA_BROKERS")]
    pub kafka_brokers: String,

    #[arg(long, env = "KAFKA_GROUP_ID", default_value = "feeds_location_consumer")]
    pub kafka_group_id: String,

    #[arg(long, env = "KAFKA_SESSION_TIMEOUT_MS", default_value_t = 10_000)]
    pub kafka_session_timeout_ms: u32,

    #[arg(long, env = "KAFKA_PRODUCE_TIMEOUT_SECS", default_value_t = 10)]
    pub kafka_produce_timeout_secs: u64,

    #[arg(long, env = "LOCATION_TOPIC", default_value = LOCATION_TOPIC)]
    pub location_topic: String,

    #[arg(long, env = "INTENT_TOPIC", default_value = INTENT_TOPIC)]
    pub intent_topic: String,

    /// Topic receiving work items whose classification failed
    #[arg(long, env = "INTENT_DEAD_LETTER_TOPIC")]
    pub intent_dead_letter_topic: Option<String>,

    #[arg(long, env = "INTENT_RESOLVER_API_URL")]
    pub intent_resolver_api_url: Url,

    #[arg(long, env = "INTENT_RESOLVER_API_KEY", hide_env_values = true)]
    pub intent_resolver_api_key: String,

    #[arg(long, env = "NEEDS_RESOLVER_API_URL")]
    pub needs_resolver_api_url: Url,

    #[arg(long, env = "NEEDS_RESOLVER_API_KEY", hide_env_values = true)]
    pub needs_resolver_api_key: String,

    #[arg(long, env = "CLASSIFIER_TIMEOUT_SECS", default_value_t = 10)]
    pub classifier_timeout_secs: u64,

    #[arg(long, env = "CLASSIFIER_MAX_RETRIES", default_value_t = 2)]
    pub classifier_max_retries: u32,

    #[arg(long, env = "REDELIVERY_BACKOFF_MS", default_value_t = 500)]
    pub redelivery_backoff_ms: u64,

    #[arg(long, env = "REDELIVERY_MAX_BACKOFF_MS", default_value_t = 30_000)]
    pub redelivery_max_backoff_ms: u64,

    /// Messages buffered per partition before fetching from it is paused
    #[arg(long, env = "PARTITION_QUEUE_CAPACITY", default_value_t = 256)]
    pub partition_queue_capacity: usize,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            database_url: self.db_conn_str.clone(),
            max_connections: self.db_max_connections,
            operation_timeout_seconds: self.store_timeout_secs,
        }
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            brokers: self.kafka_brokers.clone(),
            group_id: self.kafka_group_id.clone(),
            session_timeout_ms: self.kafka_session_timeout_ms,
            produce_timeout_seconds: self.kafka_produce_timeout_secs,
        }
    }

    pub fn topic_config(&self) -> TopicConfig {
        TopicConfig {
            location: self.location_topic.clone(),
            intent: self.intent_topic.clone(),
            intent_dead_letter: self.intent_dead_letter_topic.clone().filter(|t| !t.is_empty()),
        }
    }

    pub fn classifier_config(&self) -> ClassifierConfig {
        let mut config = ClassifierConfig::new(
            ClassifierEndpoint {
                url: self.intent_resolver_api_url.clone(),
                api_key: self.intent_resolver_api_key.clone(),
            },
            ClassifierEndpoint {
                url: self.needs_resolver_api_url.clone(),
                api_key: self.needs_resolver_api_key.clone(),
            },
        );
        config.timeout_seconds = self.classifier_timeout_secs;
        config.max_retries = self.classifier_max_retries;
        config
    }

    pub fn redelivery_config(&self) -> RedeliveryConfig {
        RedeliveryConfig {
            initial_backoff_ms: self.redelivery_backoff_ms,
            max_backoff_ms: self.redelivery_max_backoff_ms.max(self.redelivery_backoff_ms),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            queue_capacity: self.partition_queue_capacity.max(1),
            redelivery: self.redelivery_config(),
        }
    }
}
