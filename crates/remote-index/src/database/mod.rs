//! Index store access: connection pool, configuration and schema bootstrap.
//!
//! Every consumer owns one pooled connection for its whole life; the pool
//! exists so connections are configured identically and so startup code
//! (cache preload, schema bootstrap) can borrow one briefly.

pub mod schema;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ConfigError, DatabaseError, IndexResult};

/// A pooled connection owned by a single consumer.
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Configuration for the index database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file.
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of idle connections.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u32,

    /// Enable WAL mode so readers do not block the consumer writers.
    #[serde(default = "default_true")]
    pub enable_wal: bool,
}

fn default_path() -> PathBuf {
    PathBuf::from("fhir-remote-index.db")
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connection_timeout_ms() -> u64 {
    30000
}

fn default_busy_timeout_ms() -> u32 {
    5000
}

fn default_true() -> bool {
    true
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connection_timeout_ms: default_connection_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            enable_wal: true,
        }
    }
}

impl DatabaseConfig {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Builds a configuration from database properties. Unknown keys are
    /// ignored so the same file can carry settings for other tools.
    pub fn from_properties(props: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = props.get("path") {
            config.path = PathBuf::from(path);
        }
        if let Some(v) = props.get("max_connections") {
            config.max_connections = parse_property("max_connections", v)?;
        }
        if let Some(v) = props.get("min_connections") {
            config.min_connections = parse_property("min_connections", v)?;
        }
        if let Some(v) = props.get("connection_timeout_ms") {
            config.connection_timeout_ms = parse_property("connection_timeout_ms", v)?;
        }
        if let Some(v) = props.get("busy_timeout_ms") {
            config.busy_timeout_ms = parse_property("busy_timeout_ms", v)?;
        }
        if let Some(v) = props.get("enable_wal") {
            config.enable_wal = parse_property("enable_wal", v)?;
        }
        Ok(config)
    }
}

fn parse_property<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidProperty {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Connection pool over the index database. Clones share the pool.
#[derive(Clone)]
pub struct IndexDatabase {
    pool: Pool<SqliteConnectionManager>,
    config: DatabaseConfig,
}

impl fmt::Debug for IndexDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexDatabase")
            .field("config", &self.config)
            .field("connections", &self.pool.state().connections)
            .finish_non_exhaustive()
    }
}

impl IndexDatabase {
    /// Opens or creates a file-based database.
    pub fn open<P: AsRef<Path>>(path: P) -> IndexResult<Self> {
        Self::with_config(DatabaseConfig::with_path(path.as_ref()))
    }

    /// Creates the pool. Every pooled connection gets the busy timeout and
    /// journal mode applied when it is opened.
    pub fn with_config(config: DatabaseConfig) -> IndexResult<Self> {
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms as u64);
        let enable_wal = config.enable_wal;
        let manager = SqliteConnectionManager::file(&config.path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            if enable_wal {
                conn.pragma_update(None, "journal_mode", "WAL")?;
            }
            conn.pragma_update(None, "foreign_keys", true)?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(config.max_connections)
            .min_idle(Some(config.min_connections))
            .connection_timeout(Duration::from_millis(config.connection_timeout_ms))
            .build(manager)
            .map_err(|e| DatabaseError::ConnectionFailed {
                database: config.path.display().to_string(),
                message: e.to_string(),
            })?;

        info!(path = %config.path.display(), max_connections = config.max_connections, "Index database opened");
        Ok(Self { pool, config })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Borrows a connection from the pool.
    pub fn connection(&self) -> IndexResult<DbConnection> {
        Ok(self.pool.get()?)
    }

    /// Creates the dictionary, primary-store and index tables.
    pub fn init_schema(&self) -> IndexResult<()> {
        let conn = self.connection()?;
        schema::initialize_schema(&conn)
    }

    /// Adds resource types to the dictionary and creates their per-type tables.
    pub fn register_resource_types(&self, resource_types: &[&str]) -> IndexResult<()> {
        let conn = self.connection()?;
        schema::register_resource_types(&conn, resource_types)
    }
}

/// Canonical text form of an instant in the database. Round-trips exactly
/// through [`parse_timestamp`].
pub fn format_timestamp(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub fn parse_timestamp(column: &str, text: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::InvalidValue {
            column: column.to_string(),
            message: format!("'{}': {}", text, e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_default_config() {
        let config = DatabaseConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.busy_timeout_ms, 5000);
        assert!(config.enable_wal);
    }

    #[test]
    fn test_config_deserialize_defaults() {
        let config: DatabaseConfig = serde_json::from_str(r#"{"path": "idx.db"}"#).unwrap();
        assert_eq!(config.path, PathBuf::from("idx.db"));
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.connection_timeout_ms, 30000);
    }

    #[test]
    fn test_exhausted_pool_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let database = IndexDatabase::with_config(DatabaseConfig {
            path: dir.path().join("index.db"),
            max_connections: 1,
            min_connections: 0,
            connection_timeout_ms: 50,
            ..Default::default()
        })
        .unwrap();

        let _held = database.connection().unwrap();
        let err = database.connection().unwrap_err();
        assert!(matches!(
            err,
            crate::error::IndexError::Database(DatabaseError::PoolExhausted { .. })
        ));
        assert!(err.is_transient());
    }

    #[test]
    fn test_config_from_properties() {
        let mut props = BTreeMap::new();
        props.insert("path".to_string(), "/data/index.db".to_string());
        props.insert("max_connections".to_string(), "4".to_string());
        props.insert("enable_wal".to_string(), "false".to_string());
        props.insert("db.driver".to_string(), "ignored".to_string());

        let config = DatabaseConfig::from_properties(&props).unwrap();
        assert_eq!(config.path, PathBuf::from("/data/index.db"));
        assert_eq!(config.max_connections, 4);
        assert!(!config.enable_wal);
    }

    #[test]
    fn test_config_from_properties_invalid_number() {
        let mut props = BTreeMap::new();
        props.insert("busy_timeout_ms".to_string(), "soon".to_string());
        let err = DatabaseConfig::from_properties(&props).unwrap_err();
        assert!(err.to_string().contains("busy_timeout_ms"));
    }

    #[test]
    fn test_open_and_init_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db = IndexDatabase::open(dir.path().join("index.db")).unwrap();
        db.init_schema().unwrap();
        db.register_resource_types(&["Patient"]).unwrap();

        let conn = db.connection().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM resource_types", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_timestamp_round_trip() {
        let instant = Utc.with_ymd_and_hms(2022, 3, 4, 5, 6, 7).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        let text = format_timestamp(&instant);
        assert_eq!(parse_timestamp("last_updated", &text).unwrap(), instant);
        assert!(parse_timestamp("last_updated", "yesterday").is_err());
    }
}
