//! Service configuration for the remote index consumer fleet.
//!
//! Options are read from the command line, with environment variable
//! overrides. Broker and database connection settings live in separate
//! `key=value` properties files so they can be shared with other tooling.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `REMOTE_INDEX_KAFKA_PROPERTIES` | - | Broker client properties file |
//! | `REMOTE_INDEX_DATABASE_PROPERTIES` | - | Database properties file |
//! | `REMOTE_INDEX_DATABASE_PATH` | - | SQLite database path (overrides `path` property) |
//! | `REMOTE_INDEX_INIT_SCHEMA` | false | Create the schema before starting |
//! | `REMOTE_INDEX_TOPIC_NAME` | fhirIndex | Topic carrying index messages |
//! | `REMOTE_INDEX_CONSUMER_GROUP` | remote-index-service-cg | Consumer group id |
//! | `REMOTE_INDEX_CONSUMER_COUNT` | 1 | Number of consumer threads |
//! | `REMOTE_INDEX_POLL_DURATION` | 100ms | Broker poll timeout |
//! | `REMOTE_INDEX_MAX_BATCH_COLLECT_TIME` | 5s | Batch collect window |
//! | `REMOTE_INDEX_MAX_BATCH_SIZE` | 500 | Records per batch |
//! | `REMOTE_INDEX_MAX_READY_WAIT` | 5s | Wait bound for messages not yet visible |
//! | `REMOTE_INDEX_READY_RETRY_INTERVAL` | 250ms | Pause between readiness checks |
//! | `REMOTE_INDEX_BATCH_RETRY_LIMIT` | 3 | In-place retries of a transiently failed batch |
//! | `REMOTE_INDEX_MIN_RUNNING_CONSUMER_RATIO` | 0.5 | Fleet health ratio |
//! | `REMOTE_INDEX_SHUTDOWN_GRACE` | 10s | Wait for consumers during shutdown |
//! | `REMOTE_INDEX_INSTANCE_IDENTIFIER` | - | Only accept messages from this instance |
//! | `REMOTE_INDEX_SCHEMA_VARIANT` | plain | `plain` or `sharded` parameter tables |
//! | `REMOTE_INDEX_WAIT_TIMEOUT_POLICY` | drop | `drop` or `fail` after the wait bound |
//! | `REMOTE_INDEX_LOG_LEVEL` | info | Log level |
//!
//! Each identity cache dictionary also has a `*_CACHE_SIZE` and `*_CACHE_TTL`
//! pair (for example `REMOTE_INDEX_TOKEN_VALUE_CACHE_SIZE`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use crate::batch::SchemaVariant;
use crate::cache::{DictionaryCacheConfig, IdentityCacheConfig};
use crate::consumer::ConsumerOptions;
use crate::database::DatabaseConfig;
use crate::error::ConfigError;
use crate::handler::{HandlerOptions, WaitTimeoutPolicy};
use crate::orchestrator::OrchestratorOptions;

/// Configuration for the `fhir-remote-index` service.
#[derive(Debug, Clone, Parser)]
#[command(name = "fhir-remote-index")]
#[command(about = "Remote search-index consumer for Helios FHIR Server")]
#[command(
    long_about = "Remote search-index consumer for Helios FHIR Server.\n\n\
                  Consuming from Kafka requires a build with the `kafka` feature \
                  (cargo build --features kafka); without it the service exits \
                  at startup because no broker backend is available in the build."
)]
pub struct RemoteIndexConfig {
    /// Properties file with broker client settings.
    #[arg(long, env = "REMOTE_INDEX_KAFKA_PROPERTIES")]
    pub kafka_properties: Option<PathBuf>,

    /// Properties file with database settings.
    #[arg(long, env = "REMOTE_INDEX_DATABASE_PROPERTIES")]
    pub database_properties: Option<PathBuf>,

    /// SQLite database file.
    #[arg(long, env = "REMOTE_INDEX_DATABASE_PATH")]
    pub database_path: Option<PathBuf>,

    /// Create the dictionary and index tables before starting.
    #[arg(long, env = "REMOTE_INDEX_INIT_SCHEMA")]
    pub init_schema: bool,

    /// Topic carrying index messages.
    #[arg(long, env = "REMOTE_INDEX_TOPIC_NAME", default_value = "fhirIndex")]
    pub topic_name: String,

    /// Consumer group id shared by all consumers.
    #[arg(
        long,
        env = "REMOTE_INDEX_CONSUMER_GROUP",
        default_value = "remote-index-service-cg"
    )]
    pub consumer_group: String,

    /// Number of consumers, each on its own thread.
    #[arg(long, env = "REMOTE_INDEX_CONSUMER_COUNT", default_value = "1")]
    pub consumer_count: usize,

    /// Maximum time a single broker poll blocks.
    #[arg(long, env = "REMOTE_INDEX_POLL_DURATION", default_value = "100ms", value_parser = humantime::parse_duration)]
    pub poll_duration: Duration,

    /// Maximum time spent collecting one batch.
    #[arg(long, env = "REMOTE_INDEX_MAX_BATCH_COLLECT_TIME", default_value = "5s", value_parser = humantime::parse_duration)]
    pub max_batch_collect_time: Duration,

    /// Maximum records in one batch.
    #[arg(long, env = "REMOTE_INDEX_MAX_BATCH_SIZE", default_value = "500")]
    pub max_batch_size: usize,

    /// How long a message may wait for its version to become visible.
    #[arg(long, env = "REMOTE_INDEX_MAX_READY_WAIT", default_value = "5s", value_parser = humantime::parse_duration)]
    pub max_ready_wait: Duration,

    /// Pause between readiness checks for waiting messages.
    #[arg(long, env = "REMOTE_INDEX_READY_RETRY_INTERVAL", default_value = "250ms", value_parser = humantime::parse_duration)]
    pub ready_retry_interval: Duration,

    /// In-place retries of a batch that failed with a transient error.
    #[arg(long, env = "REMOTE_INDEX_BATCH_RETRY_LIMIT", default_value = "3")]
    pub batch_retry_limit: u32,

    /// Fraction of consumers that must keep running.
    #[arg(
        long,
        env = "REMOTE_INDEX_MIN_RUNNING_CONSUMER_RATIO",
        default_value = "0.5"
    )]
    pub min_running_consumer_ratio: f64,

    /// Bounded wait for consumers to stop during shutdown.
    #[arg(long, env = "REMOTE_INDEX_SHUTDOWN_GRACE", default_value = "10s", value_parser = humantime::parse_duration)]
    pub shutdown_grace: Duration,

    /// Only accept messages produced by this server instance.
    #[arg(long, env = "REMOTE_INDEX_INSTANCE_IDENTIFIER")]
    pub instance_identifier: Option<String>,

    /// Parameter table layout.
    #[arg(long, env = "REMOTE_INDEX_SCHEMA_VARIANT", value_enum, default_value = "plain")]
    pub schema_variant: SchemaVariant,

    /// What to do with messages still waiting after the wait bound.
    #[arg(long, env = "REMOTE_INDEX_WAIT_TIMEOUT_POLICY", value_enum, default_value = "drop")]
    pub wait_timeout_policy: WaitTimeoutPolicy,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, env = "REMOTE_INDEX_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "REMOTE_INDEX_PARAMETER_NAME_CACHE_SIZE", default_value = "1000")]
    pub parameter_name_cache_size: usize,

    #[arg(long, env = "REMOTE_INDEX_PARAMETER_NAME_CACHE_TTL", default_value = "1h", value_parser = humantime::parse_duration)]
    pub parameter_name_cache_ttl: Duration,

    #[arg(long, env = "REMOTE_INDEX_RESOURCE_TYPE_CACHE_SIZE", default_value = "1000")]
    pub resource_type_cache_size: usize,

    #[arg(long, env = "REMOTE_INDEX_RESOURCE_TYPE_CACHE_TTL", default_value = "1h", value_parser = humantime::parse_duration)]
    pub resource_type_cache_ttl: Duration,

    #[arg(long, env = "REMOTE_INDEX_CODE_SYSTEM_CACHE_SIZE", default_value = "1000")]
    pub code_system_cache_size: usize,

    #[arg(long, env = "REMOTE_INDEX_CODE_SYSTEM_CACHE_TTL", default_value = "1h", value_parser = humantime::parse_duration)]
    pub code_system_cache_ttl: Duration,

    #[arg(long, env = "REMOTE_INDEX_TOKEN_VALUE_CACHE_SIZE", default_value = "10000")]
    pub token_value_cache_size: usize,

    #[arg(long, env = "REMOTE_INDEX_TOKEN_VALUE_CACHE_TTL", default_value = "1h", value_parser = humantime::parse_duration)]
    pub token_value_cache_ttl: Duration,

    #[arg(long, env = "REMOTE_INDEX_CANONICAL_VALUE_CACHE_SIZE", default_value = "1000")]
    pub canonical_value_cache_size: usize,

    #[arg(long, env = "REMOTE_INDEX_CANONICAL_VALUE_CACHE_TTL", default_value = "1h", value_parser = humantime::parse_duration)]
    pub canonical_value_cache_ttl: Duration,

    #[arg(long, env = "REMOTE_INDEX_LOGICAL_RESOURCE_CACHE_SIZE", default_value = "10000")]
    pub logical_resource_cache_size: usize,

    #[arg(long, env = "REMOTE_INDEX_LOGICAL_RESOURCE_CACHE_TTL", default_value = "1h", value_parser = humantime::parse_duration)]
    pub logical_resource_cache_ttl: Duration,
}

impl Default for RemoteIndexConfig {
    fn default() -> Self {
        Self {
            kafka_properties: None,
            database_properties: None,
            database_path: None,
            init_schema: false,
            topic_name: "fhirIndex".to_string(),
            consumer_group: "remote-index-service-cg".to_string(),
            consumer_count: 1,
            poll_duration: Duration::from_millis(100),
            max_batch_collect_time: Duration::from_secs(5),
            max_batch_size: 500,
            max_ready_wait: Duration::from_secs(5),
            ready_retry_interval: Duration::from_millis(250),
            batch_retry_limit: 3,
            min_running_consumer_ratio: 0.5,
            shutdown_grace: Duration::from_secs(10),
            instance_identifier: None,
            schema_variant: SchemaVariant::Plain,
            wait_timeout_policy: WaitTimeoutPolicy::Drop,
            log_level: "info".to_string(),
            parameter_name_cache_size: 1000,
            parameter_name_cache_ttl: Duration::from_secs(3600),
            resource_type_cache_size: 1000,
            resource_type_cache_ttl: Duration::from_secs(3600),
            code_system_cache_size: 1000,
            code_system_cache_ttl: Duration::from_secs(3600),
            token_value_cache_size: 10000,
            token_value_cache_ttl: Duration::from_secs(3600),
            canonical_value_cache_size: 1000,
            canonical_value_cache_ttl: Duration::from_secs(3600),
            logical_resource_cache_size: 10000,
            logical_resource_cache_ttl: Duration::from_secs(3600),
        }
    }
}

impl RemoteIndexConfig {
    /// Validates the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.topic_name.trim().is_empty() {
            errors.push("Topic name cannot be empty".to_string());
        }

        if self.consumer_group.trim().is_empty() {
            errors.push("Consumer group cannot be empty".to_string());
        }

        if self.consumer_count == 0 {
            errors.push("Consumer count must be at least 1".to_string());
        }

        if self.poll_duration.is_zero() {
            errors.push("Poll duration cannot be 0".to_string());
        }

        if self.max_batch_collect_time < self.poll_duration {
            errors.push("Max batch collect time cannot be shorter than the poll duration".to_string());
        }

        if self.max_batch_size == 0 {
            errors.push("Max batch size cannot be 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.min_running_consumer_ratio) {
            errors.push("Min running consumer ratio must be between 0.0 and 1.0".to_string());
        }

        if self.database_path.is_none() && self.database_properties.is_none() {
            errors.push("Either a database path or a database properties file is required".to_string());
        }

        let caches = [
            ("parameter name", self.parameter_name_cache_size),
            ("resource type", self.resource_type_cache_size),
            ("code system", self.code_system_cache_size),
            ("token value", self.token_value_cache_size),
            ("canonical value", self.canonical_value_cache_size),
            ("logical resource", self.logical_resource_cache_size),
        ];
        for (name, size) in caches {
            if size == 0 {
                errors.push(format!("The {} cache size cannot be 0", name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Creates a configuration suitable for testing, with short waits and
    /// small caches. The caller still supplies the database path.
    pub fn for_testing() -> Self {
        Self {
            consumer_group: "remote-index-test-cg".to_string(),
            poll_duration: Duration::from_millis(10),
            max_batch_collect_time: Duration::from_millis(50),
            max_ready_wait: Duration::from_millis(200),
            ready_retry_interval: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(2),
            log_level: "debug".to_string(),
            parameter_name_cache_size: 100,
            resource_type_cache_size: 100,
            code_system_cache_size: 100,
            token_value_cache_size: 100,
            canonical_value_cache_size: 100,
            logical_resource_cache_size: 100,
            ..Default::default()
        }
    }

    /// Per-dictionary capacity and TTL settings for the identity cache.
    pub fn identity_cache_config(&self) -> IdentityCacheConfig {
        IdentityCacheConfig {
            parameter_names: DictionaryCacheConfig::new(
                self.parameter_name_cache_size,
                self.parameter_name_cache_ttl,
            ),
            resource_types: DictionaryCacheConfig::new(
                self.resource_type_cache_size,
                self.resource_type_cache_ttl,
            ),
            code_systems: DictionaryCacheConfig::new(
                self.code_system_cache_size,
                self.code_system_cache_ttl,
            ),
            common_token_values: DictionaryCacheConfig::new(
                self.token_value_cache_size,
                self.token_value_cache_ttl,
            ),
            canonical_values: DictionaryCacheConfig::new(
                self.canonical_value_cache_size,
                self.canonical_value_cache_ttl,
            ),
            logical_resource_idents: DictionaryCacheConfig::new(
                self.logical_resource_cache_size,
                self.logical_resource_cache_ttl,
            ),
        }
    }

    /// Builds the database configuration from the properties file (if any),
    /// with `--database-path` taking precedence over the `path` property.
    pub fn database_config(&self) -> Result<DatabaseConfig, ConfigError> {
        let mut config = match &self.database_properties {
            Some(path) => DatabaseConfig::from_properties(&load_properties(path)?)?,
            None => DatabaseConfig::default(),
        };
        if let Some(path) = &self.database_path {
            config.path = path.clone();
        }
        Ok(config)
    }

    /// Broker client properties, empty when no file was given.
    pub fn broker_properties(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        match &self.kafka_properties {
            Some(path) => load_properties(path),
            None => Ok(BTreeMap::new()),
        }
    }

    pub fn handler_options(&self) -> HandlerOptions {
        HandlerOptions {
            schema_variant: self.schema_variant,
            max_ready_wait: self.max_ready_wait,
            ready_retry_interval: self.ready_retry_interval,
            wait_timeout_policy: self.wait_timeout_policy,
            instance_identifier: self.instance_identifier.clone(),
        }
    }

    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            topic: self.topic_name.clone(),
            poll_duration: self.poll_duration,
            max_batch_collect_time: self.max_batch_collect_time,
            max_batch_size: self.max_batch_size,
            batch_retry_limit: self.batch_retry_limit,
        }
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            consumer_count: self.consumer_count,
            min_running_consumer_ratio: self.min_running_consumer_ratio,
            shutdown_grace: self.shutdown_grace,
            consumer: self.consumer_options(),
            handler: self.handler_options(),
        }
    }
}

/// Reads a `key=value` properties file.
pub fn load_properties(path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::PropertiesFile {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    Ok(parse_properties(&text))
}

/// Parses properties text. Lines starting with `#` or `!` are comments; the
/// first `=` or `:` separates key and value.
pub fn parse_properties(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
        .filter_map(|line| {
            let split = line.find(['=', ':'])?;
            let key = line[..split].trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), line[split + 1..].trim().to_string()))
        })
        .collect()
}
