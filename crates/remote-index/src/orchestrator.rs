//! Consumer fleet orchestration.
//!
//! The orchestrator primes the identity cache, builds every consumer (each
//! with its own broker client and database connection), and runs one thread
//! per consumer. Consumer failures are counted in [`FleetHealth`]. Once the
//! number of healthy consumers falls below
//! `ceil(consumer_count * min_running_consumer_ratio)` the shared running
//! flag is cleared, the remaining consumers finish their current batch, and
//! the fleet reports a health breach so the process can exit non-zero.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, info, info_span, warn};

use crate::broker::BrokerClient;
use crate::cache::{CacheLoader, IdentityCache};
use crate::consumer::{Consumer, ConsumerOptions, ConsumerStats};
use crate::database::IndexDatabase;
use crate::error::{BrokerError, IndexError, IndexResult, StartupError};
use crate::handler::{HandlerOptions, MessageHandler};

/// Timeout for the startup partition check.
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Fleet settings.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub consumer_count: usize,
    pub min_running_consumer_ratio: f64,
    /// How long to wait for consumers to stop once shutdown begins.
    pub shutdown_grace: Duration,
    pub consumer: ConsumerOptions,
    pub handler: HandlerOptions,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            consumer_count: 1,
            min_running_consumer_ratio: 0.5,
            shutdown_grace: Duration::from_secs(10),
            consumer: ConsumerOptions::default(),
            handler: HandlerOptions::default(),
        }
    }
}

/// How the fleet ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetOutcome {
    /// Shutdown was requested and no health breach occurred.
    Stopped,
    /// Too many consumers failed.
    HealthBreach { running: usize, threshold: usize },
}

#[derive(Debug, Default)]
struct Lifecycle {
    /// Consumer threads that have not finished yet.
    alive: usize,
    breach: Option<(usize, usize)>,
}

/// Shared health accounting for the consumer fleet.
#[derive(Debug)]
pub struct FleetHealth {
    consumer_count: usize,
    threshold: usize,
    running: AtomicUsize,
    flag: Arc<AtomicBool>,
    lifecycle: Mutex<Lifecycle>,
    changed: Condvar,
}

impl FleetHealth {
    pub fn new(consumer_count: usize, min_running_consumer_ratio: f64) -> Self {
        let threshold = (consumer_count as f64 * min_running_consumer_ratio).ceil() as usize;
        Self {
            consumer_count,
            threshold,
            running: AtomicUsize::new(consumer_count),
            flag: Arc::new(AtomicBool::new(true)),
            lifecycle: Mutex::new(Lifecycle {
                alive: consumer_count,
                breach: None,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumer_count
    }

    /// Consumers that have not failed.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Minimum number of healthy consumers.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// False once shutdown has begun.
    pub fn is_running(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// The flag consumers check between batches.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    /// Records a consumer failure. Returns true if this failure breached the
    /// fleet threshold.
    pub fn consumer_failed(&self, consumer: usize, err: &IndexError) -> bool {
        let previous = self
            .running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |running| {
                Some(running.saturating_sub(1))
            })
            .unwrap_or_else(|current| current);
        let remaining = previous.saturating_sub(1);
        warn!(
            consumer,
            running = remaining,
            threshold = self.threshold,
            error = %err,
            "Consumer reported failure"
        );
        if remaining >= self.threshold && remaining > 0 {
            return false;
        }

        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.breach.is_some() {
            return false;
        }
        lifecycle.breach = Some((remaining, self.threshold));
        error!(
            running = remaining,
            threshold = self.threshold,
            consumers = self.consumer_count,
            "Fleet health breach; shutting down all consumers"
        );
        self.flag.store(false, Ordering::Release);
        self.changed.notify_all();
        true
    }

    /// Records that a consumer thread has finished, for whatever reason.
    pub fn consumer_exited(&self) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.alive = lifecycle.alive.saturating_sub(1);
        self.changed.notify_all();
    }

    /// Begins a cooperative shutdown.
    pub fn request_stop(&self) {
        let _lifecycle = self.lifecycle.lock();
        self.flag.store(false, Ordering::Release);
        self.changed.notify_all();
    }

    /// Blocks until shutdown begins or every consumer has finished.
    pub fn wait_for_stop(&self) {
        let mut lifecycle = self.lifecycle.lock();
        while self.is_running() && lifecycle.alive > 0 {
            self.changed.wait(&mut lifecycle);
        }
    }

    /// Waits up to `grace` for every consumer to finish. Returns the number
    /// still alive when the wait ended.
    pub fn wait_for_exit(&self, grace: Duration) -> usize {
        let deadline = Instant::now() + grace;
        let mut lifecycle = self.lifecycle.lock();
        while lifecycle.alive > 0 {
            if self.changed.wait_until(&mut lifecycle, deadline).timed_out() {
                break;
            }
        }
        lifecycle.alive
    }

    pub fn breach(&self) -> Option<(usize, usize)> {
        self.lifecycle.lock().breach
    }

    pub fn outcome(&self) -> FleetOutcome {
        match self.breach() {
            Some((running, threshold)) => FleetOutcome::HealthBreach { running, threshold },
            None => FleetOutcome::Stopped,
        }
    }
}

/// Requests a cooperative shutdown of a running fleet.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    health: Arc<FleetHealth>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.health.request_stop();
    }

    pub fn health(&self) -> &FleetHealth {
        &self.health
    }
}

/// Starts and supervises the consumer fleet.
pub struct Orchestrator<F> {
    options: OrchestratorOptions,
    database: IndexDatabase,
    cache: Arc<IdentityCache>,
    broker_factory: F,
    health: Arc<FleetHealth>,
}

impl<F, B> Orchestrator<F>
where
    F: Fn(usize) -> Result<B, BrokerError>,
    B: BrokerClient + 'static,
{
    /// `broker_factory` builds the broker client for consumer `i`.
    pub fn new(
        options: OrchestratorOptions,
        database: IndexDatabase,
        cache: Arc<IdentityCache>,
        broker_factory: F,
    ) -> Self {
        let health = Arc::new(FleetHealth::new(
            options.consumer_count,
            options.min_running_consumer_ratio,
        ));
        Self {
            options,
            database,
            cache,
            broker_factory,
            health,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            health: Arc::clone(&self.health),
        }
    }

    pub fn health(&self) -> Arc<FleetHealth> {
        Arc::clone(&self.health)
    }

    /// Runs the fleet until shutdown is requested or fleet health is
    /// breached. Startup failures are returned before any consumer starts.
    pub fn run(self) -> IndexResult<FleetOutcome> {
        self.preload_cache()?;
        let consumers = self.build_consumers()?;

        info!(
            consumers = consumers.len(),
            threshold = self.health.threshold(),
            topic = %self.options.consumer.topic,
            "Starting consumer fleet"
        );
        let handles = self.spawn(consumers);

        self.health.wait_for_stop();
        self.health.request_stop();

        let still_alive = self.health.wait_for_exit(self.options.shutdown_grace);
        if still_alive > 0 {
            warn!(
                still_alive,
                grace_ms = self.options.shutdown_grace.as_millis() as u64,
                "Consumers did not stop within the shutdown grace period"
            );
        }

        let mut totals = ConsumerStats::default();
        for handle in handles {
            if !handle.is_finished() {
                continue;
            }
            if let Ok(Ok(stats)) = handle.join() {
                totals.batches += stats.batches;
                totals.applied += stats.applied;
                totals.stale += stats.stale;
            }
        }

        let outcome = self.health.outcome();
        info!(
            ?outcome,
            batches = totals.batches,
            applied = totals.applied,
            stale = totals.stale,
            "Consumer fleet stopped"
        );
        Ok(outcome)
    }

    fn preload_cache(&self) -> IndexResult<()> {
        let conn = self.database.connection().map_err(|e| StartupError::CachePreload {
            message: e.to_string(),
        })?;
        CacheLoader::new(&self.cache)
            .apply(&conn)
            .map_err(|e| StartupError::CachePreload {
                message: e.to_string(),
            })?;
        Ok(())
    }

    fn build_consumers(&self) -> IndexResult<Vec<Consumer<B>>> {
        let topic = &self.options.consumer.topic;
        let mut consumers = Vec::with_capacity(self.options.consumer_count);
        for id in 0..self.options.consumer_count {
            let mut broker = (self.broker_factory)(id).map_err(|e| StartupError::ConsumerConstruction {
                consumer: id,
                message: e.to_string(),
            })?;

            if id == 0 {
                let partitions = broker.partition_count(topic, METADATA_TIMEOUT)?;
                if partitions == 0 {
                    return Err(StartupError::MissingPartitions {
                        topic: topic.clone(),
                    }
                    .into());
                }
                info!(topic = %topic, partitions, "Topic partitions found");
            }

            let conn = self
                .database
                .connection()
                .map_err(|e| StartupError::ConsumerConstruction {
                    consumer: id,
                    message: e.to_string(),
                })?;
            let handler = MessageHandler::new(conn, Arc::clone(&self.cache), self.options.handler.clone());

            let health = Arc::clone(&self.health);
            let consumer = Consumer::new(
                id,
                broker,
                handler,
                self.options.consumer.clone(),
                self.health.running_flag(),
            )
            .with_failure_callback(Arc::new(move |id, err| {
                health.consumer_failed(id, err);
            }));
            consumers.push(consumer);
        }
        Ok(consumers)
    }

    fn spawn(&self, consumers: Vec<Consumer<B>>) -> Vec<JoinHandle<IndexResult<ConsumerStats>>> {
        let mut handles = Vec::with_capacity(consumers.len());
        for consumer in consumers {
            let id = consumer.id();
            let health = Arc::clone(&self.health);
            let spawned = std::thread::Builder::new()
                .name(format!("remote-index-consumer-{}", id))
                .spawn(move || {
                    let span = info_span!("consumer", id);
                    let _entered = span.enter();
                    let result = consumer.run();
                    health.consumer_exited();
                    result
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    let err = IndexError::from(e);
                    error!(consumer = id, error = %err, "Failed to start consumer thread");
                    self.health.consumer_failed(id, &err);
                    self.health.consumer_exited();
                }
            }
        }
        handles
    }
}
