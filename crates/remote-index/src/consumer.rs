//! A single consumer: one broker client driving one message handler.
//!
//! The loop collects records until the batch is full, the collect window
//! closes, or the fleet is stopping. It then hands the payloads to the
//! handler and commits offsets only once the handler has succeeded.
//! Transient failures are retried in place a bounded number of times. Any
//! other failure is reported through the failure callback and ends the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::broker::{BrokerClient, BrokerRecord, next_offsets};
use crate::error::{IndexError, IndexResult};
use crate::handler::{BatchOutcome, MessageHandler};

/// Consumer loop settings.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub topic: String,
    /// Upper bound on a single broker poll.
    pub poll_duration: Duration,
    /// How long records are accumulated before a batch is handled.
    pub max_batch_collect_time: Duration,
    pub max_batch_size: usize,
    /// In-place retries of a batch (or commit) after a transient error.
    pub batch_retry_limit: u32,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            topic: "fhirIndex".to_string(),
            poll_duration: Duration::from_millis(100),
            max_batch_collect_time: Duration::from_secs(5),
            max_batch_size: 500,
            batch_retry_limit: 3,
        }
    }
}

/// Invoked with the consumer id when a consumer stops because of an error.
pub type FailureCallback = Arc<dyn Fn(usize, &IndexError) + Send + Sync>;

/// Running totals for one consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub batches: usize,
    pub records: usize,
    pub applied: usize,
    pub stale: usize,
    pub dropped: usize,
    pub rejected: usize,
    pub ignored: usize,
    pub retries: usize,
}

impl ConsumerStats {
    fn record(&mut self, outcome: &BatchOutcome) {
        self.batches += 1;
        self.records += outcome.received;
        self.applied += outcome.applied;
        self.stale += outcome.stale;
        self.dropped += outcome.dropped;
        self.rejected += outcome.rejected;
        self.ignored += outcome.ignored;
    }
}

pub struct Consumer<B: BrokerClient> {
    id: usize,
    broker: B,
    handler: MessageHandler,
    options: ConsumerOptions,
    running: Arc<AtomicBool>,
    on_failure: Option<FailureCallback>,
    stats: ConsumerStats,
}

impl<B: BrokerClient> Consumer<B> {
    pub fn new(
        id: usize,
        broker: B,
        handler: MessageHandler,
        options: ConsumerOptions,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            broker,
            handler,
            options,
            running,
            on_failure: None,
            stats: ConsumerStats::default(),
        }
    }

    pub fn with_failure_callback(mut self, callback: FailureCallback) -> Self {
        self.on_failure = Some(callback);
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    pub fn broker_mut(&mut self) -> &mut B {
        &mut self.broker
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Runs until the fleet stops or an unrecoverable error occurs. Errors
    /// are passed to the failure callback before being returned.
    pub fn run(mut self) -> IndexResult<ConsumerStats> {
        info!(consumer = self.id, topic = %self.options.topic, "Consumer starting");
        let result = self.consume();
        self.handler.close();
        self.broker.close();

        match result {
            Ok(()) => {
                info!(
                    consumer = self.id,
                    batches = self.stats.batches,
                    applied = self.stats.applied,
                    "Consumer stopped"
                );
                Ok(self.stats)
            }
            Err(e) => {
                error!(consumer = self.id, error = %e, "Consumer failed");
                if let Some(callback) = &self.on_failure {
                    callback(self.id, &e);
                }
                Err(e)
            }
        }
    }

    fn consume(&mut self) -> IndexResult<()> {
        self.broker.subscribe(&self.options.topic)?;
        while self.is_running() {
            let records = self.collect_batch()?;
            if records.is_empty() {
                continue;
            }
            self.process_batch(&records)?;
        }
        Ok(())
    }

    /// Accumulates records until the batch is full, the collect window
    /// closes or the fleet is stopping.
    pub fn collect_batch(&mut self) -> IndexResult<Vec<BrokerRecord>> {
        let started = Instant::now();
        let mut records = Vec::new();
        while self.is_running() && records.len() < self.options.max_batch_size {
            let remaining = self.options.max_batch_collect_time.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            let timeout = self.options.poll_duration.min(remaining);
            match self.with_retries("poll", |consumer| Ok(consumer.broker.poll(timeout)?))? {
                Some(record) => records.push(record),
                None if !records.is_empty() => break,
                None => {}
            }
        }
        if !records.is_empty() {
            debug!(consumer = self.id, records = records.len(), "Collected batch");
        }
        Ok(records)
    }

    /// Handles a collected batch and commits its offsets.
    pub fn process_batch(&mut self, records: &[BrokerRecord]) -> IndexResult<BatchOutcome> {
        let payloads: Vec<String> = records.iter().map(|r| r.payload.clone()).collect();
        let outcome = self.with_retries("handle", |consumer| consumer.handler.handle(&payloads))?;

        let offsets = next_offsets(records);
        self.with_retries("commit", |consumer| Ok(consumer.broker.commit(&offsets)?))?;
        self.stats.record(&outcome);
        debug!(
            consumer = self.id,
            records = records.len(),
            partitions = offsets.len(),
            "Committed offsets"
        );
        Ok(outcome)
    }

    fn with_retries<T>(
        &mut self,
        operation: &str,
        mut f: impl FnMut(&mut Self) -> IndexResult<T>,
    ) -> IndexResult<T> {
        let mut attempt = 0;
        loop {
            match f(self) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.options.batch_retry_limit => {
                    attempt += 1;
                    self.stats.retries += 1;
                    warn!(
                        consumer = self.id,
                        operation,
                        attempt,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    std::thread::sleep(self.options.poll_duration);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::cache::{IdentityCache, IdentityCacheConfig};
    use crate::database::IndexDatabase;
    use crate::handler::HandlerOptions;

    const TOPIC: &str = "fhirIndex";

    fn options() -> ConsumerOptions {
        ConsumerOptions {
            topic: TOPIC.to_string(),
            poll_duration: Duration::from_millis(5),
            max_batch_collect_time: Duration::from_millis(50),
            max_batch_size: 10,
            batch_retry_limit: 2,
        }
    }

    fn consumer(broker: &MemoryBroker, dir: &tempfile::TempDir) -> Consumer<crate::broker::MemoryBrokerClient> {
        let db = IndexDatabase::open(dir.path().join("index.db")).unwrap();
        db.init_schema().unwrap();
        let cache = Arc::new(IdentityCache::new(&IdentityCacheConfig::default()));
        let handler = MessageHandler::new(db.connection().unwrap(), cache, HandlerOptions::default());
        Consumer::new(
            0,
            broker.client("g"),
            handler,
            options(),
            Arc::new(AtomicBool::new(true)),
        )
    }

    #[test]
    fn test_collect_respects_batch_size() {
        let dir = tempfile::tempdir().unwrap();
        let broker = MemoryBroker::new();
        broker.create_topic(TOPIC, 1);
        for i in 0..15 {
            broker.publish(TOPIC, None, format!("m{}", i)).unwrap();
        }
        let mut consumer = consumer(&broker, &dir);
        consumer.broker_mut().subscribe(TOPIC).unwrap();

        assert_eq!(consumer.collect_batch().unwrap().len(), 10);
        assert_eq!(consumer.collect_batch().unwrap().len(), 5);
        assert!(consumer.collect_batch().unwrap().is_empty());
    }

    #[test]
    fn test_undecodable_batch_still_commits() {
        let dir = tempfile::tempdir().unwrap();
        let broker = MemoryBroker::new();
        broker.create_topic(TOPIC, 1);
        broker.publish(TOPIC, None, "not json").unwrap();
        let mut consumer = consumer(&broker, &dir);
        consumer.broker_mut().subscribe(TOPIC).unwrap();

        let records = consumer.collect_batch().unwrap();
        let outcome = consumer.process_batch(&records).unwrap();
        assert_eq!(outcome.rejected, 1);
        assert_eq!(broker.committed_offset("g", TOPIC, 0), Some(1));
    }

    #[test]
    fn test_commit_retried_after_transient_failure() {
        let dir = tempfile::tempdir().unwrap();
        let broker = MemoryBroker::new();
        broker.create_topic(TOPIC, 1);
        broker.publish(TOPIC, None, "not json").unwrap();
        broker.fail_next_commits(2);
        let mut consumer = consumer(&broker, &dir);
        consumer.broker_mut().subscribe(TOPIC).unwrap();

        let records = consumer.collect_batch().unwrap();
        consumer.process_batch(&records).unwrap();
        assert_eq!(consumer.stats().retries, 2);
        assert_eq!(broker.committed_offset("g", TOPIC, 0), Some(1));
    }

    #[test]
    fn test_commit_failure_past_retry_limit_stops_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let broker = MemoryBroker::new();
        broker.create_topic(TOPIC, 1);
        broker.publish(TOPIC, None, "not json").unwrap();
        broker.fail_next_commits(10);

        let failures = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = Arc::clone(&failures);
        let consumer = consumer(&broker, &dir).with_failure_callback(Arc::new(move |id, e| {
            seen.lock().push((id, e.to_string()));
        }));

        assert!(consumer.run().is_err());
        let failures = failures.lock();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, 0);
        assert_eq!(broker.committed_offset("g", TOPIC, 0), None);
    }

    #[test]
    fn test_stopped_consumer_exits_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let broker = MemoryBroker::new();
        broker.create_topic(TOPIC, 1);
        let consumer = consumer(&broker, &dir);
        consumer.running.store(false, Ordering::Release);
        assert_eq!(consumer.run().unwrap(), ConsumerStats::default());
    }
}
