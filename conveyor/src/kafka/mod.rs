pub mod consumer;
pub mod producer;

use thiserror::Error;

use crate::error::ConfigError;

pub use consumer::KafkaLogClient;
pub use producer::KafkaFailureSink;

#[derive(Debug, Error)]
pub enum KafkaClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("kafka client error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}
