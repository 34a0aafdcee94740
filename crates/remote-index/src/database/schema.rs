//! Bootstrap DDL for the dictionary, primary-store and parameter tables.
//!
//! Production deployments manage their schema with dedicated tooling; this
//! module creates an equivalent layout for local environments and tests.

use rusqlite::Connection;

use crate::batch::ParameterKind;
use crate::error::{DatabaseError, IndexResult, MessageError};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Creates the schema if the database is fresh.
pub fn initialize_schema(conn: &Connection) -> IndexResult<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_schema_v1(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version > SCHEMA_VERSION {
        return Err(schema_error(format!(
            "database schema version {} is newer than supported version {}",
            current_version, SCHEMA_VERSION
        )));
    }

    Ok(())
}

fn schema_error(message: String) -> crate::error::IndexError {
    DatabaseError::Schema { message }.into()
}

fn get_schema_version(conn: &Connection) -> IndexResult<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )
    .map_err(|e| schema_error(format!("Failed to create schema_version table: {}", e)))?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> IndexResult<()> {
    conn.execute("DELETE FROM schema_version", [])
        .and_then(|_| conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version]))
        .map_err(|e| schema_error(format!("Failed to set schema version: {}", e)))?;
    Ok(())
}

fn create_schema_v1(conn: &Connection) -> IndexResult<()> {
    let mut ddl = String::from(
        "CREATE TABLE IF NOT EXISTS resource_types (
            resource_type_id INTEGER PRIMARY KEY,
            resource_type TEXT NOT NULL UNIQUE
        );
        CREATE TABLE IF NOT EXISTS parameter_names (
            parameter_name_id INTEGER PRIMARY KEY,
            parameter_name TEXT NOT NULL UNIQUE
        );
        CREATE TABLE IF NOT EXISTS code_systems (
            code_system_id INTEGER PRIMARY KEY,
            code_system_name TEXT NOT NULL UNIQUE
        );
        CREATE TABLE IF NOT EXISTS common_token_values (
            common_token_value_id INTEGER PRIMARY KEY,
            shard_key INTEGER NOT NULL DEFAULT 0,
            code_system_id INTEGER NOT NULL REFERENCES code_systems (code_system_id),
            token_value TEXT NOT NULL,
            UNIQUE (shard_key, code_system_id, token_value)
        );
        CREATE TABLE IF NOT EXISTS common_canonical_values (
            canonical_id INTEGER PRIMARY KEY,
            url TEXT NOT NULL UNIQUE
        );
        CREATE TABLE IF NOT EXISTS logical_resource_ident (
            logical_resource_id INTEGER PRIMARY KEY,
            resource_type_id INTEGER NOT NULL REFERENCES resource_types (resource_type_id),
            logical_id TEXT NOT NULL,
            UNIQUE (resource_type_id, logical_id)
        );
        CREATE TABLE IF NOT EXISTS logical_resources (
            logical_resource_id INTEGER PRIMARY KEY,
            resource_type_id INTEGER NOT NULL REFERENCES resource_types (resource_type_id),
            logical_id TEXT NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            last_updated TEXT NOT NULL,
            parameter_hash TEXT NOT NULL
        );
        ",
    );

    // Plain layout: shared parameter tables discriminated by resource type.
    for kind in ParameterKind::ALL {
        ddl.push_str(&parameter_table_ddl(
            kind.table_suffix(),
            "resource_type_id INTEGER NOT NULL",
            kind,
        ));
    }

    conn.execute_batch(&ddl)
        .map_err(|e| schema_error(format!("Failed to create schema: {}", e)))?;
    Ok(())
}

fn parameter_table_ddl(table: &str, discriminator: &str, kind: ParameterKind) -> String {
    let mut columns = vec![
        discriminator.to_string(),
        "parameter_name_id INTEGER NOT NULL".to_string(),
        "logical_resource_id INTEGER NOT NULL".to_string(),
    ];
    columns.extend(
        kind.value_columns()
            .iter()
            .map(|(name, sql_type)| format!("{} {}", name, sql_type)),
    );
    columns.push("composite_id INTEGER".to_string());
    format!(
        "CREATE TABLE IF NOT EXISTS {table} ({});
        CREATE INDEX IF NOT EXISTS idx_{table}_lr ON {table} (logical_resource_id);
        ",
        columns.join(", ")
    )
}

/// Returns true if `name` is safe to embed in a table name: an ASCII letter
/// followed by ASCII letters or digits.
pub fn is_valid_resource_type(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric())
}

/// Name of the per-type primary-store table holding the current version.
pub fn logical_resources_table(resource_type: &str) -> String {
    format!("{}_logical_resources", resource_type)
}

/// Adds resource types to the dictionary and creates their per-type tables:
/// the primary-store `<Type>_logical_resources` table and the sharded
/// parameter tables.
pub fn register_resource_types(conn: &Connection, resource_types: &[&str]) -> IndexResult<()> {
    for resource_type in resource_types {
        if !is_valid_resource_type(resource_type) {
            return Err(MessageError::UnknownResourceType {
                resource_type: resource_type.to_string(),
            }
            .into());
        }

        let mut ddl = format!(
            "INSERT INTO resource_types (resource_type) VALUES ('{rt}')
                ON CONFLICT (resource_type) DO NOTHING;
            CREATE TABLE IF NOT EXISTS {table} (
                logical_resource_id INTEGER PRIMARY KEY,
                logical_id TEXT NOT NULL,
                version_id INTEGER NOT NULL,
                last_updated TEXT NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0
            );
            ",
            rt = resource_type,
            table = logical_resources_table(resource_type)
        );
        for kind in ParameterKind::ALL {
            ddl.push_str(&parameter_table_ddl(
                &format!("{}_{}", resource_type, kind.table_suffix()),
                "shard_key INTEGER NOT NULL",
                kind,
            ));
        }

        conn.execute_batch(&ddl).map_err(|e| {
            schema_error(format!(
                "Failed to register resource type {}: {}",
                resource_type, e
            ))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn test_initialize_schema_is_repeatable() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        initialize_schema(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
        for kind in ParameterKind::ALL {
            assert!(table_exists(&conn, kind.table_suffix()), "{}", kind);
        }
    }

    #[test]
    fn test_newer_schema_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        conn.execute("UPDATE schema_version SET version = 99", []).unwrap();
        assert!(initialize_schema(&conn).is_err());
    }

    #[test]
    fn test_register_resource_types() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        register_resource_types(&conn, &["Patient", "Observation"]).unwrap();
        register_resource_types(&conn, &["Patient"]).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM resource_types", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
        assert!(table_exists(&conn, "Patient_logical_resources"));
        assert!(table_exists(&conn, "Observation_str_values"));
    }

    #[test]
    fn test_register_rejects_unsafe_names() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        assert!(register_resource_types(&conn, &["Patient; DROP TABLE x"]).is_err());
    }

    #[test]
    fn test_is_valid_resource_type() {
        assert!(is_valid_resource_type("Patient"));
        assert!(is_valid_resource_type("Observation2"));
        assert!(!is_valid_resource_type(""));
        assert!(!is_valid_resource_type("1Patient"));
        assert!(!is_valid_resource_type("Pat_ient"));
        assert!(!is_valid_resource_type("Patient'--"));
    }
}
