//! rdkafka-backed log client. Rebalance callbacks are captured into an event
//! buffer by the consumer context and drained into the next poll batch, so
//! assignment changes are always observed on the consumer loop.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::config::{validate_client_overrides, Config};
use crate::error::{ClientError, CommitError};
use crate::kafka::KafkaClientError;
use crate::log_client::{LogClient, PolledBatch};
use crate::types::{Partition, Record};

// Once a batch has records, further recvs only drain what is already
// buffered instead of waiting out the full poll timeout.
const BATCH_DRAIN_WAIT: Duration = Duration::from_millis(10);

enum RebalanceEvent {
    Assigned(Vec<Partition>),
    Revoked(Vec<Partition>),
}

struct RebalanceContext {
    events: Arc<Mutex<Vec<RebalanceEvent>>>,
}

impl RebalanceContext {
    fn push(&self, event: RebalanceEvent) {
        self.events
            .lock()
            .expect("rebalance event lock poisoned")
            .push(event);
    }
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            let partitions = partitions_of(tpl);
            debug!(count = partitions.len(), "partitions being revoked");
            self.push(RebalanceEvent::Revoked(partitions));
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let partitions = partitions_of(tpl);
                debug!(count = partitions.len(), "partitions assigned");
                self.push(RebalanceEvent::Assigned(partitions));
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(err) => error!(error = %err, "rebalance failed"),
        }
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<Partition> {
    tpl.elements()
        .iter()
        .map(|elem| Partition::new(elem.topic(), elem.partition()))
        .collect()
}

pub struct KafkaLogClient {
    consumer: StreamConsumer<RebalanceContext>,
    events: Arc<Mutex<Vec<RebalanceEvent>>>,
    batch_size: usize,
}

impl KafkaLogClient {
    /// Build, configure, and subscribe. `overrides` is the raw passthrough
    /// option map; attempts to override framework-managed options are
    /// rejected here.
    pub fn new(
        config: &Config,
        overrides: &HashMap<String, String>,
    ) -> Result<Self, KafkaClientError> {
        validate_client_overrides(overrides)?;

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka.kafka_hosts)
            .set("group.id", &config.kafka.kafka_consumer_group)
            .set("statistics.interval.ms", "10000")
            .set(
                "auto.offset.reset",
                &config.kafka.kafka_consumer_offset_reset,
            );

        for (key, value) in overrides {
            client_config.set(key, value);
        }

        // Offsets are derived from the tracker and committed explicitly;
        // these stay off no matter what.
        client_config.set("enable.auto.commit", "false");
        client_config.set("enable.auto.offset.store", "false");

        if config.kafka.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        let events = Arc::new(Mutex::new(Vec::new()));
        let consumer: StreamConsumer<RebalanceContext> =
            client_config.create_with_context(RebalanceContext {
                events: events.clone(),
            })?;

        let topics = config.topic_list();
        let topic_refs: Vec<&str> = topics.iter().map(|t| t.as_str()).collect();
        consumer.subscribe(&topic_refs)?;
        info!(
            topics = ?topics,
            group = %config.kafka.kafka_consumer_group,
            "kafka consumer subscribed"
        );

        Ok(Self {
            consumer,
            events,
            batch_size: config.kafka.kafka_consumer_batch_size,
        })
    }

    fn drain_events(&self, batch: &mut PolledBatch) {
        let mut events = self.events.lock().expect("rebalance event lock poisoned");
        for event in events.drain(..) {
            match event {
                RebalanceEvent::Assigned(partitions) => batch.assigned.extend(partitions),
                RebalanceEvent::Revoked(partitions) => batch.revoked.extend(partitions),
            }
        }
    }
}

fn owned_record(message: &BorrowedMessage<'_>) -> Record {
    let headers: Vec<(String, Vec<u8>)> = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .filter_map(|header| header.value.map(|v| (header.key.to_string(), v.to_vec())))
                .collect()
        })
        .unwrap_or_default();

    Record::new(
        Partition::new(message.topic(), message.partition()),
        message.offset(),
        message.key().map(|k| k.to_vec()),
        message.payload().map(|p| p.to_vec()),
        headers,
    )
}

fn topic_partition_list(partitions: &[Partition]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for partition in partitions {
        tpl.add_partition(&partition.topic, partition.partition);
    }
    tpl
}

fn is_retriable(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::RebalanceInProgress
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::OperationTimedOut
    )
}

#[async_trait]
impl LogClient for KafkaLogClient {
    async fn poll(&self, timeout: Duration) -> Result<PolledBatch, ClientError> {
        let deadline = Instant::now() + timeout;
        let mut batch = PolledBatch::default();
        self.drain_events(&mut batch);

        while batch.records.len() < self.batch_size {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = if batch.records.is_empty() {
                deadline - now
            } else {
                BATCH_DRAIN_WAIT.min(deadline - now)
            };
            match tokio::time::timeout(wait, self.consumer.recv()).await {
                Ok(Ok(message)) => batch.records.push(owned_record(&message)),
                Ok(Err(err)) => {
                    if err.rdkafka_error_code() == Some(RDKafkaErrorCode::Fatal) {
                        return Err(ClientError(anyhow::Error::new(err)));
                    }
                    warn!(error = %err, "kafka recv error");
                    break;
                }
                Err(_) => break,
            }
        }

        self.drain_events(&mut batch);
        Ok(batch)
    }

    fn pause(&self, partitions: &[Partition]) -> Result<(), ClientError> {
        self.consumer
            .pause(&topic_partition_list(partitions))
            .map_err(|err| ClientError(anyhow::Error::new(err)))
    }

    fn resume(&self, partitions: &[Partition]) -> Result<(), ClientError> {
        self.consumer
            .resume(&topic_partition_list(partitions))
            .map_err(|err| ClientError(anyhow::Error::new(err)))
    }

    async fn commit(&self, offsets: &BTreeMap<Partition, i64>) -> Result<(), CommitError> {
        let mut tpl = TopicPartitionList::new();
        for (partition, offset) in offsets {
            tpl.add_partition_offset(
                &partition.topic,
                partition.partition,
                Offset::Offset(*offset),
            )
            .map_err(|err| CommitError::Fatal(anyhow::Error::new(err)))?;
        }
        match self.consumer.commit(&tpl, CommitMode::Sync) {
            Ok(()) => Ok(()),
            Err(err) => {
                let retriable = err.rdkafka_error_code().map(is_retriable).unwrap_or(false);
                if retriable {
                    Err(CommitError::Retriable(anyhow::Error::new(err)))
                } else {
                    Err(CommitError::Fatal(anyhow::Error::new(err)))
                }
            }
        }
    }

    async fn close(&self) {
        self.consumer.unsubscribe();
        info!("kafka consumer closed");
    }
}
