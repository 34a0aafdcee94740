//! Helios FHIR Server Remote Index Service
//!
//! This crate consumes search-parameter index messages published by the FHIR
//! server and writes them into the search index tables of a separate
//! database. Index writes are decoupled from the server's request path, so
//! the service must tolerate messages that arrive before, or long after, the
//! resource version they describe.
//!
//! # Readiness
//!
//! Each message names a resource version: `versionId`, `parameterHash` and
//! `lastUpdated`. It is applied only when the primary store's current
//! version of the logical resource matches all three:
//!
//! - store behind the message: **waiting**, retried up to a bound
//! - store ahead of the message: **stale**, dropped and never retried
//! - same version, different hash or timestamp: **stale**, the message came
//!   from a transaction that rolled back
//!
//! Because a version is matched at most once, redelivered messages are safe
//! to reprocess and offsets can be committed after the fact (at-least-once).
//!
//! # Architecture
//!
//! - [`config`] - Command line and properties-file configuration
//! - [`message`] - Inbound message format
//! - [`cache`] - Shared identity cache for dictionary ids, and its loader
//! - [`database`] - Connection pool and bootstrap schema
//! - [`batch`] - Parameter batch writers for the plain and sharded layouts
//! - [`handler`] - Readiness protocol and transaction lifecycle
//! - [`broker`] - Broker client abstraction (in-memory, and Kafka with the
//!   `kafka` feature)
//! - [`consumer`] - Poll, collect, handle, commit loop
//! - [`orchestrator`] - Consumer threads and fleet health
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use helios_remote_index::broker::MemoryBroker;
//! use helios_remote_index::cache::IdentityCache;
//! use helios_remote_index::database::IndexDatabase;
//! use helios_remote_index::orchestrator::{FleetOutcome, Orchestrator};
//! use helios_remote_index::RemoteIndexConfig;
//!
//! let config = RemoteIndexConfig::for_testing();
//! let database = IndexDatabase::open("index.db")?;
//! database.init_schema()?;
//! database.register_resource_types(&["Patient", "Observation"])?;
//!
//! let broker = MemoryBroker::new();
//! broker.create_topic(&config.topic_name, 4);
//!
//! let cache = Arc::new(IdentityCache::new(&config.identity_cache_config()));
//! let group = config.consumer_group.clone();
//! let orchestrator = Orchestrator::new(
//!     config.orchestrator_options(),
//!     database,
//!     cache,
//!     move |_| Ok(broker.client(&group)),
//! );
//!
//! match orchestrator.run()? {
//!     FleetOutcome::Stopped => {}
//!     FleetOutcome::HealthBreach { .. } => std::process::exit(1),
//! }
//! # Ok::<(), helios_remote_index::IndexError>(())
//! ```

pub mod batch;
pub mod broker;
pub mod cache;
pub mod config;
pub mod consumer;
pub mod database;
pub mod error;
pub mod handler;
pub mod message;
pub mod orchestrator;

pub use config::RemoteIndexConfig;
pub use error::{IndexError, IndexResult};
pub use handler::{BatchOutcome, MessageHandler, WaitTimeoutPolicy};
pub use message::{IndexMessage, RemoteIndexMessage};
pub use orchestrator::{FleetHealth, FleetOutcome, Orchestrator};

/// Initializes the tracing subscriber. `RUST_LOG` takes precedence over
/// `level`.
pub fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("helios_remote_index={}", level)));

    tracing_subscriber::registry()
        .with(fmt::layer().with_thread_names(true))
        .with(filter)
        .init();
}
