pub mod types;
pub mod traits;
pub mod store;
pub mod classifier;
pub mod bus;
pub mod worker;
pub mod stages;
pub mod config;
pub mod shutdown;
pub mod pipeline;

pub use types::*;
pub use traits::{Classifier, FeedStore, MessageHandler, MessageProducer, OffsetCommitter};
pub use store::PgFeedStore;
pub use classifier::HttpClassifier;
pub use bus::{KafkaConsumer, KafkaProducer};
pub use worker::{process_message, MessageOutcome, PartitionRouter, PartitionSessions, RouteOutcome};
pub use stages::{AddressResolvedHandler, IntentResolvedHandler};
pub use config::Config;
pub use pipeline::{FeedPipeline, TopicDispatcher};
