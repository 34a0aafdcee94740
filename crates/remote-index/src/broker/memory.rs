//! In-process broker.
//!
//! Partitioned, append-only topics with committed offsets per consumer
//! group. Clients created with [`MemoryBroker::client`] join their group's
//! membership for the subscribed topic and own the partitions `p` with
//! `p % members == index`; the assignment is recomputed whenever a member
//! joins or leaves. Used by the test suite and for local runs without Kafka.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::{BrokerClient, BrokerRecord, OffsetMap};
use crate::error::BrokerError;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<String>,
    payload: String,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    /// Next offset per (group, topic, partition).
    committed: HashMap<(String, String, i32), i64>,
    commits: usize,
    failing_commits: usize,
    round_robin: usize,
    /// Group membership per (group, topic).
    groups: HashMap<(String, String), Membership>,
    next_member: u64,
}

#[derive(Debug, Default)]
struct Membership {
    members: Vec<u64>,
    generation: u64,
}

impl State {
    fn join(&mut self, group: &str, topic: &str) -> u64 {
        let member = self.next_member;
        self.next_member += 1;
        let membership = self
            .groups
            .entry((group.to_string(), topic.to_string()))
            .or_default();
        membership.members.push(member);
        membership.generation += 1;
        member
    }

    fn leave(&mut self, group: &str, topic: &str, member: u64) {
        if let Some(membership) = self.groups.get_mut(&(group.to_string(), topic.to_string())) {
            membership.members.retain(|m| *m != member);
            membership.generation += 1;
        }
    }

    fn committed_or_zero(&self, group: &str, topic: &str, partition: i32) -> i64 {
        self.committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    arrived: Condvar,
}

/// Handle to an in-process broker. Clones share the same topics.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a topic; an existing topic keeps its records.
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut state = self.shared.state.lock();
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions]);
    }

    /// Appends a record and returns its `(partition, offset)`. Keyed records
    /// always land on the same partition; unkeyed ones are spread round-robin.
    pub fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: impl Into<String>,
    ) -> Result<(i32, i64), BrokerError> {
        let mut state = self.shared.state.lock();
        let next = state.round_robin;
        state.round_robin += 1;

        let partitions = state
            .topics
            .get_mut(topic)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| BrokerError::Metadata {
                topic: topic.to_string(),
                message: "unknown topic".to_string(),
            })?;
        let partition = match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % partitions.len() as u64) as usize
            }
            None => next % partitions.len(),
        };
        let log = &mut partitions[partition];
        log.push(StoredRecord {
            key: key.map(str::to_string),
            payload: payload.into(),
        });
        let offset = log.len() as i64 - 1;
        drop(state);

        self.shared.arrived.notify_all();
        Ok((partition as i32, offset))
    }

    /// Client for `group`. Partitions of the subscribed topic are shared out
    /// among the group's subscribed clients.
    pub fn client(&self, group: &str) -> MemoryBrokerClient {
        MemoryBrokerClient::new(self.clone(), group, None)
    }

    /// Client for `group` reading exactly the given partitions, outside the
    /// group's membership.
    pub fn client_for_partitions(&self, group: &str, partitions: Vec<i32>) -> MemoryBrokerClient {
        MemoryBrokerClient::new(self.clone(), group, Some(partitions))
    }

    /// Next offset committed by `group`, if any.
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        let state = self.shared.state.lock();
        state
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Number of successful commits across all groups.
    pub fn commit_count(&self) -> usize {
        self.shared.state.lock().commits
    }

    /// Makes the next `count` commits fail with a transient error.
    pub fn fail_next_commits(&self, count: usize) {
        self.shared.state.lock().failing_commits = count;
    }
}

/// A consumer's view of a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryBrokerClient {
    broker: MemoryBroker,
    group: String,
    requested: Option<Vec<i32>>,
    topic: Option<String>,
    /// Membership id and the generation the assignment was computed for.
    member: Option<(u64, u64)>,
    /// Read position per assigned partition.
    positions: Vec<(i32, i64)>,
    cursor: usize,
    closed: bool,
}

impl MemoryBrokerClient {
    fn new(broker: MemoryBroker, group: &str, requested: Option<Vec<i32>>) -> Self {
        Self {
            broker,
            group: group.to_string(),
            requested,
            topic: None,
            member: None,
            positions: Vec::new(),
            cursor: 0,
            closed: false,
        }
    }

    /// Rewinds every assigned partition to the group's committed offset, as a
    /// restarted consumer would.
    pub fn reset_to_committed(&mut self) {
        let Some(topic) = self.topic.clone() else {
            return;
        };
        let state = self.broker.shared.state.lock();
        for (partition, position) in &mut self.positions {
            *position = state.committed_or_zero(&self.group, &topic, *partition);
        }
    }

    /// Partitions currently assigned to this client.
    pub fn assignment(&self) -> Vec<i32> {
        self.positions.iter().map(|(partition, _)| *partition).collect()
    }

    /// Recomputes the partition assignment after a membership change. Kept
    /// partitions keep their read position; new ones start at the committed
    /// offset.
    fn rebalance(&mut self, state: &State) {
        let (Some(topic), Some((member, generation))) = (self.topic.as_ref(), self.member) else {
            return;
        };
        let Some(membership) = state.groups.get(&(self.group.clone(), topic.clone())) else {
            return;
        };
        if membership.generation == generation {
            return;
        }
        let members = membership.members.len();
        let index = membership.members.iter().position(|m| *m == member);
        let partition_count = state.topics.get(topic).map(Vec::len).unwrap_or(0) as i32;

        let positions = match index {
            Some(index) => (0..partition_count)
                .filter(|p| *p as usize % members == index)
                .map(|partition| {
                    let position = self
                        .positions
                        .iter()
                        .find(|(owned, _)| *owned == partition)
                        .map(|(_, position)| *position)
                        .unwrap_or_else(|| state.committed_or_zero(&self.group, topic, partition));
                    (partition, position)
                })
                .collect(),
            None => Vec::new(),
        };
        debug!(
            group = %self.group,
            topic = %topic,
            member,
            partitions = ?positions.iter().map(|(p, _)| *p).collect::<Vec<_>>(),
            "Rebalanced"
        );
        self.positions = positions;
        self.cursor = 0;
        self.member = Some((member, membership.generation));
    }

    fn leave_group(&mut self) {
        if let (Some(topic), Some((member, _))) = (self.topic.as_ref(), self.member.take()) {
            self.broker.shared.state.lock().leave(&self.group, topic, member);
            self.broker.shared.arrived.notify_all();
        }
    }

    fn next_record(&mut self, state: &State) -> Option<BrokerRecord> {
        let topic = self.topic.as_ref()?;
        let partitions = state.topics.get(topic)?;
        let assigned = self.positions.len();
        for step in 0..assigned {
            let index = (self.cursor + step) % assigned;
            let (partition, position) = self.positions[index];
            let Some(stored) = partitions
                .get(partition as usize)
                .and_then(|log| log.get(position as usize))
            else {
                continue;
            };
            self.positions[index].1 += 1;
            self.cursor = (index + 1) % assigned;
            return Some(BrokerRecord {
                topic: topic.clone(),
                partition,
                offset: position,
                key: stored.key.clone(),
                payload: stored.payload.clone(),
            });
        }
        None
    }
}

impl BrokerClient for MemoryBrokerClient {
    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        self.leave_group();
        let shared = Arc::clone(&self.broker.shared);
        let mut state = shared.state.lock();
        self.topic = Some(topic.to_string());
        self.cursor = 0;
        match self.requested.clone() {
            Some(requested) => {
                self.positions = requested
                    .into_iter()
                    .map(|partition| {
                        (partition, state.committed_or_zero(&self.group, topic, partition))
                    })
                    .collect();
            }
            None => {
                self.positions.clear();
                let member = state.join(&self.group, topic);
                self.member = Some((member, 0));
                self.rebalance(&state);
                drop(state);
                shared.arrived.notify_all();
            }
        }
        debug!(group = %self.group, topic, partitions = self.positions.len(), "Subscribed");
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<BrokerRecord>, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        let deadline = Instant::now() + timeout;
        let shared = Arc::clone(&self.broker.shared);
        let mut state = shared.state.lock();
        loop {
            self.rebalance(&state);
            if let Some(record) = self.next_record(&state) {
                return Ok(Some(record));
            }
            if shared.arrived.wait_until(&mut state, deadline).timed_out() {
                self.rebalance(&state);
                return Ok(self.next_record(&state));
            }
        }
    }

    fn commit(&mut self, offsets: &OffsetMap) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        let mut state = self.broker.shared.state.lock();
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(BrokerError::Commit {
                message: "injected commit failure".to_string(),
            });
        }
        for ((topic, partition), next) in offsets {
            let slot = state
                .committed
                .entry((self.group.clone(), topic.clone(), *partition))
                .or_insert(0);
            *slot = (*slot).max(*next);
        }
        state.commits += 1;
        Ok(())
    }

    fn partition_count(&mut self, topic: &str, _timeout: Duration) -> Result<usize, BrokerError> {
        let state = self.broker.shared.state.lock();
        Ok(state.topics.get(topic).map(Vec::len).unwrap_or(0))
    }

    fn close(&mut self) {
        self.leave_group();
        self.closed = true;
    }
}

impl Drop for MemoryBrokerClient {
    fn drop(&mut self) {
        self.leave_group();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::next_offsets;

    const TOPIC: &str = "fhirIndex";

    #[test]
    fn test_publish_and_poll() {
        let broker = MemoryBroker::new();
        broker.create_topic(TOPIC, 1);
        broker.publish(TOPIC, None, "a").unwrap();
        broker.publish(TOPIC, None, "b").unwrap();

        let mut client = broker.client("g");
        client.subscribe(TOPIC).unwrap();
        let first = client.poll(Duration::from_millis(10)).unwrap().unwrap();
        let second = client.poll(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!((first.offset, first.payload.as_str()), (0, "a"));
        assert_eq!((second.offset, second.payload.as_str()), (1, "b"));
        assert!(client.poll(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn test_keyed_records_share_partition() {
        let broker = MemoryBroker::new();
        broker.create_topic(TOPIC, 4);
        let (p1, _) = broker.publish(TOPIC, Some("Patient/1"), "x").unwrap();
        let (p2, o2) = broker.publish(TOPIC, Some("Patient/1"), "y").unwrap();
        assert_eq!(p1, p2);
        assert_eq!(o2, 1);
    }

    #[test]
    fn test_publish_to_unknown_topic() {
        let broker = MemoryBroker::new();
        assert!(matches!(
            broker.publish("missing", None, "x"),
            Err(BrokerError::Metadata { .. })
        ));
    }

    #[test]
    fn test_uncommitted_records_redelivered() {
        let broker = MemoryBroker::new();
        broker.create_topic(TOPIC, 1);
        for payload in ["a", "b", "c"] {
            broker.publish(TOPIC, None, payload).unwrap();
        }

        let mut client = broker.client("g");
        client.subscribe(TOPIC).unwrap();
        let first = client.poll(Duration::from_millis(10)).unwrap().unwrap();
        client.commit(&next_offsets([&first])).unwrap();
        client.poll(Duration::from_millis(10)).unwrap().unwrap();

        client.reset_to_committed();
        let again = client.poll(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(again.payload, "b");
        assert_eq!(broker.committed_offset("g", TOPIC, 0), Some(1));
    }

    #[test]
    fn test_partition_assignment() {
        let broker = MemoryBroker::new();
        broker.create_topic(TOPIC, 2);
        broker.publish(TOPIC, None, "p0").unwrap();
        broker.publish(TOPIC, None, "p1").unwrap();

        let mut client = broker.client_for_partitions("g", vec![1]);
        client.subscribe(TOPIC).unwrap();
        let record = client.poll(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(record.partition, 1);
        assert!(client.poll(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn test_group_clients_split_partitions() {
        let broker = MemoryBroker::new();
        broker.create_topic(TOPIC, 2);
        let mut first = broker.client("g");
        let mut second = broker.client("g");
        first.subscribe(TOPIC).unwrap();
        second.subscribe(TOPIC).unwrap();
        broker.publish(TOPIC, None, "only").unwrap();

        let a = first.poll(Duration::from_millis(10)).unwrap();
        let b = second.poll(Duration::from_millis(10)).unwrap();
        assert_eq!(a.is_some() as u8 + b.is_some() as u8, 1);
        assert_eq!(first.assignment(), vec![0]);
        assert_eq!(second.assignment(), vec![1]);
    }

    #[test]
    fn test_leaving_member_hands_over_partitions() {
        let broker = MemoryBroker::new();
        broker.create_topic(TOPIC, 2);
        let mut first = broker.client("g");
        let mut second = broker.client("g");
        first.subscribe(TOPIC).unwrap();
        second.subscribe(TOPIC).unwrap();
        broker.publish(TOPIC, None, "p0").unwrap();
        broker.publish(TOPIC, None, "p1").unwrap();

        let owned = second.poll(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(owned.partition, 1);
        second.commit(&next_offsets([&owned])).unwrap();
        second.close();

        let mut seen: Vec<_> = std::iter::from_fn(|| first.poll(Duration::from_millis(10)).unwrap())
            .map(|record| record.payload)
            .collect();
        seen.sort();
        assert_eq!(seen, vec!["p0".to_string()]);
        assert_eq!(first.assignment(), vec![0, 1]);
    }

    #[test]
    fn test_groups_consume_independently() {
        let broker = MemoryBroker::new();
        broker.create_topic(TOPIC, 1);
        broker.publish(TOPIC, None, "shared").unwrap();
        let mut first = broker.client("g1");
        let mut second = broker.client("g2");
        first.subscribe(TOPIC).unwrap();
        second.subscribe(TOPIC).unwrap();
        assert!(first.poll(Duration::from_millis(10)).unwrap().is_some());
        assert!(second.poll(Duration::from_millis(10)).unwrap().is_some());
    }

    #[test]
    fn test_poll_wakes_on_publish() {
        let broker = MemoryBroker::new();
        broker.create_topic(TOPIC, 1);
        let mut client = broker.client("g");
        client.subscribe(TOPIC).unwrap();

        let publisher = broker.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            publisher.publish(TOPIC, None, "late").unwrap();
        });
        let record = client.poll(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(record.unwrap().payload, "late");
    }

    #[test]
    fn test_injected_commit_failure() {
        let broker = MemoryBroker::new();
        broker.create_topic(TOPIC, 1);
        broker.fail_next_commits(1);
        let mut client = broker.client("g");
        client.subscribe(TOPIC).unwrap();

        let offsets: OffsetMap = [((TOPIC.to_string(), 0), 3)].into_iter().collect();
        assert!(client.commit(&offsets).unwrap_err().is_transient());
        client.commit(&offsets).unwrap();
        assert_eq!(broker.commit_count(), 1);
        assert_eq!(broker.committed_offset("g", TOPIC, 0), Some(3));
    }

    #[test]
    fn test_closed_client() {
        let broker = MemoryBroker::new();
        broker.create_topic(TOPIC, 1);
        let mut client = broker.client("g");
        client.close();
        assert!(matches!(
            client.poll(Duration::from_millis(1)),
            Err(BrokerError::Closed)
        ));
    }
}
