//! Message broker abstraction.
//!
//! Consumers only need a small slice of a broker client: subscribe to one
//! topic, poll records, and commit consumed offsets explicitly. Auto-commit
//! is never used; offsets are committed only after the batch they cover has
//! been handled.

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::BrokerError;

pub use memory::{MemoryBroker, MemoryBrokerClient};

#[cfg(feature = "kafka")]
pub use kafka::KafkaBrokerClient;

/// One record read from the topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: String,
}

/// Next offset to read, per `(topic, partition)`.
pub type OffsetMap = BTreeMap<(String, i32), i64>;

/// Builds the offsets to commit for a set of consumed records: one past the
/// highest offset seen on each partition.
pub fn next_offsets<'a>(records: impl IntoIterator<Item = &'a BrokerRecord>) -> OffsetMap {
    let mut offsets = OffsetMap::new();
    for record in records {
        offsets
            .entry((record.topic.clone(), record.partition))
            .and_modify(|next| *next = (*next).max(record.offset + 1))
            .or_insert(record.offset + 1);
    }
    offsets
}

/// Blocking broker client owned by a single consumer thread.
pub trait BrokerClient: Send {
    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    /// Returns the next record, or `None` if nothing arrived within `timeout`.
    fn poll(&mut self, timeout: Duration) -> Result<Option<BrokerRecord>, BrokerError>;

    fn commit(&mut self, offsets: &OffsetMap) -> Result<(), BrokerError>;

    /// Number of partitions of `topic`; zero if the topic does not exist.
    fn partition_count(&mut self, topic: &str, timeout: Duration) -> Result<usize, BrokerError>;

    fn close(&mut self);
}

impl<B: BrokerClient + ?Sized> BrokerClient for Box<B> {
    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        (**self).subscribe(topic)
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<BrokerRecord>, BrokerError> {
        (**self).poll(timeout)
    }

    fn commit(&mut self, offsets: &OffsetMap) -> Result<(), BrokerError> {
        (**self).commit(offsets)
    }

    fn partition_count(&mut self, topic: &str, timeout: Duration) -> Result<usize, BrokerError> {
        (**self).partition_count(topic, timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }
}
