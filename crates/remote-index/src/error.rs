//! Error types for the remote index service.
//!
//! Errors are organised as a hierarchy: message decoding, database access,
//! broker access, configuration and startup. [`IndexError::is_transient`]
//! separates failures that a redelivery may cure from those that should stop
//! the owning consumer.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use std::time::Duration;

use thiserror::Error;

/// The top-level error type for the remote index service.
#[derive(Error, Debug)]
pub enum IndexError {
    /// Inbound message errors
    #[error(transparent)]
    Message(#[from] MessageError),

    /// Index store and primary-store access errors
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// Message broker errors
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Configuration errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Errors that abort the fleet before any consumer starts
    #[error(transparent)]
    Startup(#[from] StartupError),

    /// Messages still not visible in the primary store after the wait bound
    #[error("{waiting} message(s) still waiting after {}ms", waited.as_millis())]
    WaitTimeout { waiting: usize, waited: Duration },

    /// Thread spawn and file I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IndexError {
    /// Returns true if rolling back and retrying the batch may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            IndexError::Database(e) => e.is_transient(),
            IndexError::Broker(e) => e.is_transient(),
            IndexError::Message(_)
            | IndexError::Config(_)
            | IndexError::Startup(_)
            | IndexError::WaitTimeout { .. }
            | IndexError::Io(_) => false,
        }
    }
}

/// Errors decoding or validating an inbound message.
#[derive(Error, Debug)]
pub enum MessageError {
    /// The payload is not a valid message envelope.
    #[error("malformed message payload: {message}")]
    Malformed { message: String },

    /// The envelope carries a version this service does not understand.
    #[error("unsupported message version {found} (supported: {supported})")]
    UnsupportedVersion { found: i32, supported: i32 },

    /// The message names a resource type that is not in the dictionary.
    #[error("unknown resource type: {resource_type}")]
    UnknownResourceType { resource_type: String },
}

/// Errors from the index store or the primary-store snapshot reads.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Connection to the database could not be established.
    #[error("connection failed to {database}: {message}")]
    ConnectionFailed { database: String, message: String },

    /// No pooled connection became available in time.
    #[error("connection pool exhausted for {database}")]
    PoolExhausted { database: String },

    /// The database was locked by another writer past the busy timeout.
    #[error("database busy: {message}")]
    Busy { message: String },

    /// A statement failed to prepare or execute.
    #[error("query execution failed: {message}")]
    Query {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    /// A dictionary value could not be resolved to an id after insert-if-absent.
    #[error("unresolved {dictionary} value: {key}")]
    UnresolvedIdentity { dictionary: String, key: String },

    /// A required dictionary was empty during cache preload.
    #[error("dictionary {dictionary} is empty")]
    EmptyDictionary { dictionary: String },

    /// Schema bootstrap failed.
    #[error("schema bootstrap failed: {message}")]
    Schema { message: String },

    /// A stored value could not be interpreted.
    #[error("invalid stored value in {column}: {message}")]
    InvalidValue { column: String, message: String },
}

impl DatabaseError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DatabaseError::ConnectionFailed { .. }
                | DatabaseError::PoolExhausted { .. }
                | DatabaseError::Busy { .. }
        )
    }
}

/// Errors from the message broker.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The client could not be created or connected.
    #[error("broker connection failed: {message}")]
    Connection { message: String },

    /// Subscribing to the topic failed.
    #[error("subscribe to {topic} failed: {message}")]
    Subscribe { topic: String, message: String },

    /// Polling for records failed.
    #[error("poll failed: {message}")]
    Poll { message: String },

    /// Committing offsets failed.
    #[error("offset commit failed: {message}")]
    Commit { message: String },

    /// Topic metadata could not be read.
    #[error("metadata for {topic} unavailable: {message}")]
    Metadata { topic: String, message: String },

    /// The client was used after `close()`.
    #[error("broker client closed")]
    Closed,
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Poll { .. } | BrokerError::Commit { .. })
    }
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A properties file could not be read.
    #[error("cannot read properties file {path}: {message}")]
    PropertiesFile { path: String, message: String },

    /// A property is present but has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidProperty { key: String, message: String },
}

/// Errors that prevent the consumer fleet from starting.
#[derive(Error, Debug)]
pub enum StartupError {
    /// The configured topic has no partitions.
    #[error("topic {topic} has no partitions")]
    MissingPartitions { topic: String },

    /// The identity cache could not be primed.
    #[error("identity cache preload failed: {message}")]
    CachePreload { message: String },

    /// A broker client or database connection could not be constructed.
    #[error("consumer {consumer} could not be created: {message}")]
    ConsumerConstruction { consumer: usize, message: String },

    /// The requested broker backend is not compiled in.
    #[error("broker backend '{backend}' is not available in this build")]
    BrokerUnavailable { backend: String },
}

/// Result type for remote index operations.
pub type IndexResult<T> = Result<T, IndexError>;

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                DatabaseError::Busy {
                    message: err.to_string(),
                }
            }
            Some(ErrorCode::CannotOpen) => DatabaseError::ConnectionFailed {
                database: "sqlite".to_string(),
                message: err.to_string(),
            },
            _ => DatabaseError::Query {
                message: err.to_string(),
                source: Some(err),
            },
        }
    }
}

impl From<rusqlite::Error> for IndexError {
    fn from(err: rusqlite::Error) -> Self {
        IndexError::Database(err.into())
    }
}

// r2d2 only fails a checkout when the connection timeout elapses.
impl From<r2d2::Error> for DatabaseError {
    fn from(_err: r2d2::Error) -> Self {
        DatabaseError::PoolExhausted {
            database: "sqlite".to_string(),
        }
    }
}

impl From<r2d2::Error> for IndexError {
    fn from(err: r2d2::Error) -> Self {
        IndexError::Database(err.into())
    }
}

impl From<serde_json::Error> for MessageError {
    fn from(err: serde_json::Error) -> Self {
        MessageError::Malformed {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for BrokerError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        BrokerError::Connection {
            message: err.to_string(),
        }
    }
}
