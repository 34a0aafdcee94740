//! Kafka backend built on librdkafka.

use std::collections::BTreeMap;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::{Message, Offset, TopicPartitionList};
use tracing::{debug, info};

use super::{BrokerClient, BrokerRecord, OffsetMap};
use crate::error::BrokerError;

/// Blocking Kafka consumer with manual offset commits.
pub struct KafkaBrokerClient {
    consumer: BaseConsumer,
    group: String,
}

impl KafkaBrokerClient {
    /// Builds a consumer from client properties. `group.id` is set from
    /// `group`; auto-commit is always disabled.
    pub fn new(properties: &BTreeMap<String, String>, group: &str) -> Result<Self, BrokerError> {
        let mut config = ClientConfig::new();
        for (key, value) in properties {
            config.set(key, value);
        }
        config
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");
        if !properties.contains_key("auto.offset.reset") {
            config.set("auto.offset.reset", "earliest");
        }

        let consumer: BaseConsumer = config.create().map_err(|e| BrokerError::Connection {
            message: e.to_string(),
        })?;
        Ok(Self {
            consumer,
            group: group.to_string(),
        })
    }
}

fn poll_error(e: KafkaError) -> BrokerError {
    BrokerError::Poll {
        message: e.to_string(),
    }
}

impl BrokerClient for KafkaBrokerClient {
    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.consumer
            .subscribe(&[topic])
            .map_err(|e| BrokerError::Subscribe {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;
        info!(group = %self.group, topic, "Subscribed to topic");
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<BrokerRecord>, BrokerError> {
        let Some(result) = self.consumer.poll(timeout) else {
            return Ok(None);
        };
        let message = result.map_err(poll_error)?;
        let payload = match message.payload_view::<str>() {
            Some(Ok(text)) => text.to_string(),
            Some(Err(_)) => {
                debug!(partition = message.partition(), offset = message.offset(), "Payload is not UTF-8");
                String::from_utf8_lossy(message.payload().unwrap_or_default()).into_owned()
            }
            None => String::new(),
        };
        let key = message
            .key()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned());
        Ok(Some(BrokerRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key,
            payload,
        }))
    }

    fn commit(&mut self, offsets: &OffsetMap) -> Result<(), BrokerError> {
        if offsets.is_empty() {
            return Ok(());
        }
        let mut list = TopicPartitionList::new();
        for ((topic, partition), next) in offsets {
            list.add_partition_offset(topic, *partition, Offset::Offset(*next))
                .map_err(|e| BrokerError::Commit {
                    message: e.to_string(),
                })?;
        }
        self.consumer
            .commit(&list, CommitMode::Sync)
            .map_err(|e| BrokerError::Commit {
                message: e.to_string(),
            })
    }

    fn partition_count(&mut self, topic: &str, timeout: Duration) -> Result<usize, BrokerError> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(topic), timeout)
            .map_err(|e| BrokerError::Metadata {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;
        Ok(metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic && t.error().is_none())
            .map(|t| t.partitions().len())
            .unwrap_or(0))
    }

    fn close(&mut self) {
        self.consumer.unsubscribe();
    }
}
