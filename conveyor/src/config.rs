use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

use crate::error::ConfigError;

/// What to do with a record whose task reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Shut the whole pool down with the failure as cause.
    Shutdown,
    /// Hand the record to the failure sink, mark it processed on ack.
    FallbackTopic,
    /// Mark the record processed and move on.
    Skip,
}

impl FromStr for FailureAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shutdown" => Ok(FailureAction::Shutdown),
            "fallback_topic" => Ok(FailureAction::FallbackTopic),
            "skip" => Ok(FailureAction::Skip),
            other => Err(format!("{other} is not a valid failure action")),
        }
    }
}

impl fmt::Display for FailureAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureAction::Shutdown => write!(f, "shutdown"),
            FailureAction::FallbackTopic => write!(f, "fallback_topic"),
            FailureAction::Skip => write!(f, "skip"),
        }
    }
}

/// Kafka connection and tuning options shared by the consumer client and the
/// fallback producer.
#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "conveyor")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    // Upper bound on records folded into one poll batch.
    #[envconfig(default = "300")]
    pub kafka_consumer_batch_size: usize,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            kafka_hosts: "localhost:9092".to_string(),
            kafka_tls: false,
            kafka_consumer_group: "conveyor".to_string(),
            kafka_consumer_offset_reset: "earliest".to_string(),
            kafka_consumer_batch_size: 300,
            kafka_producer_linger_ms: 20,
            kafka_producer_queue_mib: 400,
            kafka_message_timeout_ms: 20000,
            kafka_compression_codec: "none".to_string(),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    /// Comma-separated list of topics to subscribe to.
    #[envconfig(from = "CONSUMER_TOPICS")]
    pub topics: String,

    #[envconfig(from = "CONSUMER_POLL_TIMEOUT_MS", default = "1000")]
    pub poll_timeout_ms: u64,

    #[envconfig(from = "CONSUMER_COMMIT_INTERVAL_MS", default = "10000")]
    pub commit_interval_ms: u64,

    /// Watchdog bound on how long a consumed record may stay unprocessed.
    #[envconfig(from = "CONSUMER_PROCESSING_TIMEOUT_MS", default = "300000")]
    pub processing_timeout_ms: u64,

    #[envconfig(from = "CONSUMER_COMMIT_RETRIES", default = "3")]
    pub commit_retries: u32,

    #[envconfig(from = "WORKER_THREADS_NUM", default = "1")]
    pub worker_threads_num: usize,

    /// Idle-wait bound for a worker with no runnable subpartition.
    #[envconfig(from = "WORKER_SLEEP_MS", default = "1000")]
    pub worker_sleep_ms: u64,

    #[envconfig(from = "QUEUE_MAX_SIZE_BYTES", default = "268435456")]
    pub queue_max_size_bytes: u64,

    /// Unset means no global cap.
    #[envconfig(from = "QUEUE_TOTAL_MAX_SIZE_BYTES")]
    pub queue_total_max_size_bytes: Option<u64>,

    #[envconfig(from = "RECORD_PROCESSING_FAILURE_ACTION", default = "shutdown")]
    pub failure_action: FailureAction,

    #[envconfig(from = "RECORD_PROCESSING_FALLBACK_TOPIC")]
    pub fallback_topic: Option<String>,

    /// How long shutdown waits for in-flight work before aborting it.
    #[envconfig(from = "SHUTDOWN_GRACE_MS", default = "10000")]
    pub shutdown_grace_ms: u64,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Self::init_from_env()
    }

    pub fn topic_list(&self) -> Vec<String> {
        self.topics
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn worker_sleep(&self) -> Duration {
        Duration::from_millis(self.worker_sleep_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic_list().is_empty() {
            return Err(ConfigError::Missing("consumer topics"));
        }
        if self.worker_threads_num == 0 {
            return Err(ConfigError::Invalid {
                field: "worker_threads_num",
                reason: "at least one worker is required".to_string(),
            });
        }
        if self.queue_max_size_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "queue_max_size_bytes",
                reason: "byte budget must be positive".to_string(),
            });
        }
        if self.queue_total_max_size_bytes == Some(0) {
            return Err(ConfigError::Invalid {
                field: "queue_total_max_size_bytes",
                reason: "byte budget must be positive".to_string(),
            });
        }
        if self.failure_action == FailureAction::FallbackTopic
            && self
                .fallback_topic
                .as_ref()
                .map(|t| t.trim().is_empty())
                .unwrap_or(true)
        {
            return Err(ConfigError::FallbackTopicMissing);
        }
        Ok(())
    }
}

/// Client options the framework manages itself; user overrides are rejected.
pub const FORCED_CONSUMER_OPTIONS: &[&str] = &["enable.auto.commit", "enable.auto.offset.store"];

/// Validate a `consumer.kafka.*` style override map against the forced options.
pub fn validate_client_overrides(
    overrides: &std::collections::HashMap<String, String>,
) -> Result<(), ConfigError> {
    for key in overrides.keys() {
        if FORCED_CONSUMER_OPTIONS.contains(&key.as_str()) {
            return Err(ConfigError::ForcedOptionOverride { key: key.clone() });
        }
    }
    Ok(())
}
