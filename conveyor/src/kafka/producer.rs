//! Fallback producer: failed records are re-produced to the configured
//! fallback topic, with the original key, payload, and headers, plus the
//! failure text as an extra header. An offset is only marked processed once
//! the broker acknowledges the delivery.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ConfigError;
use crate::kafka::KafkaClientError;
use crate::sink::FailureSink;
use crate::types::Record;

const ERROR_HEADER: &str = "conveyor-failure";

pub struct KafkaFailureSink {
    producer: FutureProducer,
    topic: String,
    delivery_timeout: Duration,
}

impl KafkaFailureSink {
    pub fn new(
        config: &Config,
        overrides: &HashMap<String, String>,
    ) -> Result<Self, KafkaClientError> {
        let topic = config
            .fallback_topic
            .clone()
            .ok_or(ConfigError::FallbackTopicMissing)?;

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set(
                "linger.ms",
                config.kafka.kafka_producer_linger_ms.to_string(),
            )
            .set(
                "message.timeout.ms",
                config.kafka.kafka_message_timeout_ms.to_string(),
            )
            .set(
                "compression.codec",
                config.kafka.kafka_compression_codec.to_owned(),
            )
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka.kafka_producer_queue_mib * 1024).to_string(),
            );

        for (key, value) in overrides {
            client_config.set(key, value);
        }

        if config.kafka.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        debug!("rdkafka producer configuration: {:?}", client_config);
        let producer: FutureProducer = client_config.create()?;

        // "Ping" the brokers by requesting metadata before accepting work.
        match producer
            .client()
            .fetch_metadata(None, Duration::from_secs(2))
        {
            Ok(metadata) => {
                info!(
                    topics = metadata.topics().len(),
                    fallback_topic = %topic,
                    "fallback producer connected"
                );
            }
            Err(err) => {
                error!(error = %err, "failed to fetch metadata from kafka brokers");
                return Err(err.into());
            }
        }

        Ok(Self {
            producer,
            topic,
            delivery_timeout: Duration::from_millis(
                u64::from(config.kafka.kafka_message_timeout_ms),
            ),
        })
    }
}

#[async_trait]
impl FailureSink for KafkaFailureSink {
    async fn deliver(&self, record: &Record, cause: &anyhow::Error) -> anyhow::Result<()> {
        let failure_text = cause.to_string();
        let mut headers = OwnedHeaders::new();
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key,
                value: Some(value),
            });
        }
        headers = headers.insert(Header {
            key: ERROR_HEADER,
            value: Some(failure_text.as_bytes()),
        });

        let mut future_record: FutureRecord<'_, Vec<u8>, Vec<u8>> =
            FutureRecord::to(&self.topic).headers(headers);
        if let Some(key) = &record.key {
            future_record = future_record.key(key);
        }
        if let Some(payload) = &record.payload {
            future_record = future_record.payload(payload);
        }

        match self
            .producer
            .send(future_record, Timeout::After(self.delivery_timeout))
            .await
        {
            Ok(_) => Ok(()),
            Err((err, _)) => Err(anyhow::Error::new(err)),
        }
    }

    async fn close(&self) {
        if let Err(err) = self.producer.flush(Duration::from_secs(30)) {
            warn!(error = %err, "fallback producer flush failed");
        }
    }
}
