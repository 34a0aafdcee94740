//! Startup preload of the identity cache.

use rusqlite::Connection;
use tracing::info;

use crate::cache::identity::{CacheSeed, IdentityCache};
use crate::error::{DatabaseError, IndexResult};

/// Primes the [`IdentityCache`] with the resource-type and parameter-name
/// dictionaries before any consumer starts.
pub struct CacheLoader<'a> {
    cache: &'a IdentityCache,
}

impl<'a> CacheLoader<'a> {
    pub fn new(cache: &'a IdentityCache) -> Self {
        Self { cache }
    }

    /// Reads both dictionaries in one read transaction and seeds the cache.
    ///
    /// An empty resource-type dictionary means the schema was never
    /// populated, and is reported as an error.
    pub fn apply(&self, conn: &Connection) -> IndexResult<()> {
        let tx = conn.unchecked_transaction()?;
        let seed = CacheSeed {
            resource_types: read_pairs(
                &tx,
                "SELECT resource_type, resource_type_id FROM resource_types",
            )?,
            parameter_names: read_pairs(
                &tx,
                "SELECT parameter_name, parameter_name_id FROM parameter_names",
            )?,
        };
        tx.commit()?;

        if seed.resource_types.is_empty() {
            return Err(DatabaseError::EmptyDictionary {
                dictionary: "resource_types".to_string(),
            }
            .into());
        }

        info!(
            resource_types = seed.resource_types.len(),
            parameter_names = seed.parameter_names.len(),
            "Identity cache preloaded"
        );
        self.cache.init(seed);
        Ok(())
    }
}

fn read_pairs(conn: &Connection, sql: &str) -> IndexResult<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut pairs = Vec::new();
    for row in rows {
        pairs.push(row?);
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::identity::{Dictionary, IdentityCacheConfig};
    use crate::database::schema::{initialize_schema, register_resource_types};
    use crate::error::IndexError;

    #[test]
    fn test_preload_seeds_cache() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        register_resource_types(&conn, &["Patient", "Observation"]).unwrap();
        conn.execute(
            "INSERT INTO parameter_names (parameter_name) VALUES ('subject')",
            [],
        )
        .unwrap();

        let cache = IdentityCache::new(&IdentityCacheConfig::default());
        CacheLoader::new(&cache).apply(&conn).unwrap();

        assert!(cache.get_resource_type_id("Patient").is_some());
        assert!(cache.get_resource_type_id("Observation").is_some());
        assert!(cache.get_parameter_name_id("subject").is_some());
        assert_eq!(cache.stats(Dictionary::ParameterNames).entries, 1);
    }

    #[test]
    fn test_empty_resource_types_is_fatal() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        let cache = IdentityCache::new(&IdentityCacheConfig::default());
        let err = CacheLoader::new(&cache).apply(&conn).unwrap_err();
        assert!(matches!(
            err,
            IndexError::Database(DatabaseError::EmptyDictionary { .. })
        ));
    }

    #[test]
    fn test_missing_tables_is_an_error() {
        let conn = Connection::open_in_memory().unwrap();
        let cache = IdentityCache::new(&IdentityCacheConfig::default());
        assert!(CacheLoader::new(&cache).apply(&conn).is_err());
    }
}
