//! Test harness: a temporary index database with a simulated primary store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::params;
use tempfile::TempDir;

use helios_remote_index::batch::SchemaVariant;
use helios_remote_index::cache::{CacheLoader, IdentityCache, IdentityCacheConfig};
use helios_remote_index::database::{IndexDatabase, format_timestamp};
use helios_remote_index::handler::{HandlerOptions, MessageHandler, WaitTimeoutPolicy};
use helios_remote_index::message::IndexMessage;

/// Resource types registered in every test database.
pub const RESOURCE_TYPES: &[&str] = &["Patient", "Observation", "Practitioner", "Organization"];

/// Handler settings with short waits.
pub fn handler_options() -> HandlerOptions {
    HandlerOptions {
        schema_variant: SchemaVariant::Plain,
        max_ready_wait: Duration::from_millis(200),
        ready_retry_interval: Duration::from_millis(20),
        wait_timeout_policy: WaitTimeoutPolicy::Drop,
        instance_identifier: None,
    }
}

/// A file-backed index database shared by every connection of one test.
pub struct TestIndex {
    _dir: TempDir,
    pub database: IndexDatabase,
    pub cache: Arc<IdentityCache>,
}

impl TestIndex {
    /// Creates the schema, registers [`RESOURCE_TYPES`] and primes the cache.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let database =
            IndexDatabase::open(dir.path().join("index.db")).expect("Failed to open database");
        database.init_schema().expect("Failed to initialize schema");
        database
            .register_resource_types(RESOURCE_TYPES)
            .expect("Failed to register resource types");

        let cache = Arc::new(IdentityCache::new(&IdentityCacheConfig::default()));
        let conn = database.connection().expect("Failed to get connection");
        CacheLoader::new(&cache)
            .apply(&conn)
            .expect("Failed to preload identity cache");

        Self {
            _dir: dir,
            database,
            cache,
        }
    }

    pub fn handler(&self, options: HandlerOptions) -> MessageHandler {
        let conn = self.database.connection().expect("Failed to get connection");
        MessageHandler::new(conn, Arc::clone(&self.cache), options)
    }

    /// Makes the message's version the current one in the primary store.
    pub fn commit_version(&self, message: &IndexMessage) {
        self.set_version(
            &message.resource_type,
            &message.logical_id,
            message.logical_resource_id,
            message.version_id,
            &message.parameter_hash,
            message.last_updated,
        );
    }

    /// Writes (or overwrites) the primary store's current version of a
    /// logical resource.
    pub fn set_version(
        &self,
        resource_type: &str,
        logical_id: &str,
        logical_resource_id: i64,
        version_id: i32,
        parameter_hash: &str,
        last_updated: DateTime<Utc>,
    ) {
        let conn = self.database.connection().expect("Failed to get connection");
        let resource_type_id: i64 = conn
            .query_row(
                "SELECT resource_type_id FROM resource_types WHERE resource_type = ?1",
                [resource_type],
                |row| row.get(0),
            )
            .expect("Unknown resource type");
        let last_updated = format_timestamp(&last_updated);

        conn.execute(
            "INSERT INTO logical_resource_ident (logical_resource_id, resource_type_id, logical_id)
             VALUES (?1, ?2, ?3) ON CONFLICT DO NOTHING",
            params![logical_resource_id, resource_type_id, logical_id],
        )
        .expect("Failed to write logical_resource_ident");
        conn.execute(
            "INSERT INTO logical_resources
                 (logical_resource_id, resource_type_id, logical_id, last_updated, parameter_hash)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (logical_resource_id) DO UPDATE
                SET last_updated = excluded.last_updated,
                    parameter_hash = excluded.parameter_hash",
            params![logical_resource_id, resource_type_id, logical_id, last_updated, parameter_hash],
        )
        .expect("Failed to write logical_resources");
        conn.execute(
            &format!(
                "INSERT INTO {}_logical_resources (logical_resource_id, logical_id, version_id, last_updated)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (logical_resource_id) DO UPDATE
                    SET version_id = excluded.version_id,
                        last_updated = excluded.last_updated",
                resource_type
            ),
            params![logical_resource_id, logical_id, version_id, last_updated],
        )
        .expect("Failed to write per-type logical resources");
    }

    /// Rows in `table` for one logical resource.
    pub fn rows_for(&self, table: &str, logical_resource_id: i64) -> i64 {
        let conn = self.database.connection().expect("Failed to get connection");
        conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE logical_resource_id = ?1", table),
            [logical_resource_id],
            |row| row.get(0),
        )
        .expect("Failed to count rows")
    }

    /// Drops a table, leaving the dictionaries that refer to it in place.
    pub fn drop_table(&self, table: &str) {
        let conn = self.database.connection().expect("Failed to get connection");
        conn.execute_batch(&format!("DROP TABLE {}", table))
            .expect("Failed to drop table");
    }

    /// Total rows in `table`.
    pub fn row_count(&self, table: &str) -> i64 {
        let conn = self.database.connection().expect("Failed to get connection");
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .expect("Failed to count rows")
    }

    /// Indexed string values of one logical resource, sorted.
    pub fn string_values(&self, logical_resource_id: i64) -> Vec<String> {
        let conn = self.database.connection().expect("Failed to get connection");
        let mut stmt = conn
            .prepare(
                "SELECT str_value FROM str_values WHERE logical_resource_id = ?1 ORDER BY str_value",
            )
            .expect("Failed to prepare query");
        stmt.query_map([logical_resource_id], |row| row.get(0))
            .expect("Failed to query")
            .collect::<Result<Vec<String>, _>>()
            .expect("Failed to read rows")
    }

    /// Id of a parameter name in the database, if it exists.
    pub fn parameter_name_id(&self, name: &str) -> Option<i64> {
        let conn = self.database.connection().expect("Failed to get connection");
        conn.query_row(
            "SELECT parameter_name_id FROM parameter_names WHERE parameter_name = ?1",
            [name],
            |row| row.get(0),
        )
        .ok()
    }
}
