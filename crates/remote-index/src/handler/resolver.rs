//! Resolution of dictionary values to surrogate ids inside a transaction.
//!
//! Values are first looked up in the transaction's own map, then in the
//! shared cache. Misses are collected and resolved in bulk: read, insert the
//! missing values with `ON CONFLICT DO NOTHING`, read again. Keys are
//! processed in sorted order so concurrent consumers take row locks in the
//! same order.
//!
//! Ids obtained from the database are staged, not published: the handler
//! hands them to the cache only after its transaction commits.

use std::collections::{BTreeSet, HashMap};

use rusqlite::Connection;
use rusqlite::types::Value;
use tracing::debug;

use crate::cache::{CommonTokenValueKey, Dictionary, DictionaryKey, IdentityCache, LogicalResourceIdentKey};
use crate::error::{DatabaseError, IndexResult};

const MAX_CODE_SYSTEMS_PER_STATEMENT: usize = 512;
const MAX_NAMES_PER_STATEMENT: usize = 256;
const MAX_TOKEN_VALUES_PER_STATEMENT: usize = 256;
const MAX_CANONICALS_PER_STATEMENT: usize = 256;
const MAX_LOGICAL_RESOURCES_PER_STATEMENT: usize = 256;

/// Ids known to the current transaction.
#[derive(Debug, Default)]
pub struct TransactionIdentities {
    resolved: HashMap<DictionaryKey, i64>,
    staged: Vec<(DictionaryKey, i64)>,
}

impl TransactionIdentities {
    /// Ids read or created by this transaction that the cache does not have yet.
    pub fn staged(&self) -> &[(DictionaryKey, i64)] {
        &self.staged
    }

    pub fn take_staged(&mut self) -> Vec<(DictionaryKey, i64)> {
        std::mem::take(&mut self.staged)
    }

    pub fn clear(&mut self) {
        self.resolved.clear();
        self.staged.clear();
    }

    fn record(&mut self, key: DictionaryKey, id: i64, stage: bool) {
        if stage {
            self.staged.push((key.clone(), id));
        }
        self.resolved.insert(key, id);
    }
}

#[derive(Debug, Default)]
struct Unresolved {
    parameter_names: BTreeSet<String>,
    code_systems: BTreeSet<String>,
    token_values: BTreeSet<CommonTokenValueKey>,
    canonical_values: BTreeSet<String>,
    logical_resource_idents: BTreeSet<LogicalResourceIdentKey>,
}

/// Collects dictionary values used by a set of messages and resolves them.
pub struct IdentityResolver<'a> {
    conn: &'a Connection,
    cache: &'a IdentityCache,
    identities: &'a mut TransactionIdentities,
    unresolved: Unresolved,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(
        conn: &'a Connection,
        cache: &'a IdentityCache,
        identities: &'a mut TransactionIdentities,
    ) -> Self {
        Self {
            conn,
            cache,
            identities,
            unresolved: Unresolved::default(),
        }
    }

    /// Known id for a key, from this transaction or the shared cache.
    pub fn lookup(&self, key: &DictionaryKey) -> Option<i64> {
        self.identities
            .resolved
            .get(key)
            .copied()
            .or_else(|| self.cache.get(key))
    }

    /// Id for a key that must already be resolved.
    pub fn id(&self, key: &DictionaryKey) -> IndexResult<i64> {
        self.lookup(key).ok_or_else(|| {
            DatabaseError::UnresolvedIdentity {
                dictionary: key.dictionary().to_string(),
                key: key.to_string(),
            }
            .into()
        })
    }

    /// Returns true if the key is already known to this transaction, copying
    /// a cache hit into the transaction's map.
    fn remember(&mut self, key: &DictionaryKey) -> bool {
        if self.identities.resolved.contains_key(key) {
            return true;
        }
        match self.cache.get(key) {
            Some(id) => {
                self.identities.record(key.clone(), id, false);
                true
            }
            None => false,
        }
    }

    /// Resource type id, falling back to a read of the dictionary. Resource
    /// types are never created here; `None` means the type is unknown.
    pub fn resource_type_id(&mut self, resource_type: &str) -> IndexResult<Option<i64>> {
        let key = DictionaryKey::ResourceType(resource_type.to_string());
        if self.remember(&key) {
            return Ok(self.lookup(&key));
        }
        let id: Option<i64> = match self.conn.query_row(
            "SELECT resource_type_id FROM resource_types WHERE resource_type = ?1",
            [resource_type],
            |row| row.get(0),
        ) {
            Ok(id) => Some(id),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(id) = id {
            self.identities.record(key, id, true);
        }
        Ok(id)
    }

    pub fn note_parameter_name(&mut self, name: &str) {
        if !self.remember(&DictionaryKey::ParameterName(name.to_string())) {
            self.unresolved.parameter_names.insert(name.to_string());
        }
    }

    pub fn note_code_system(&mut self, system: &str) {
        if !self.remember(&DictionaryKey::CodeSystem(system.to_string())) {
            self.unresolved.code_systems.insert(system.to_string());
        }
    }

    pub fn note_token_value(&mut self, key: CommonTokenValueKey) {
        self.note_code_system(&key.code_system);
        if !self.remember(&DictionaryKey::CommonTokenValue(key.clone())) {
            self.unresolved.token_values.insert(key);
        }
    }

    pub fn note_canonical(&mut self, url: &str) {
        if !self.remember(&DictionaryKey::CanonicalValue(url.to_string())) {
            self.unresolved.canonical_values.insert(url.to_string());
        }
    }

    /// Notes a reference target. The caller must have checked that the
    /// resource type is known.
    pub fn note_logical_resource(&mut self, key: LogicalResourceIdentKey) {
        if !self.remember(&DictionaryKey::LogicalResourceIdent(key.clone())) {
            self.unresolved.logical_resource_idents.insert(key);
        }
    }

    /// Resolves everything noted so far. Code systems go before token values,
    /// which reference them.
    pub fn resolve(&mut self) -> IndexResult<()> {
        let unresolved = std::mem::take(&mut self.unresolved);

        self.resolve_named(
            Dictionary::ParameterNames,
            "parameter_name",
            "parameter_name_id",
            MAX_NAMES_PER_STATEMENT,
            &unresolved.parameter_names,
            DictionaryKey::ParameterName,
        )?;
        self.resolve_named(
            Dictionary::CodeSystems,
            "code_system_name",
            "code_system_id",
            MAX_CODE_SYSTEMS_PER_STATEMENT,
            &unresolved.code_systems,
            DictionaryKey::CodeSystem,
        )?;
        self.resolve_token_values(&unresolved.token_values)?;
        self.resolve_named(
            Dictionary::CanonicalValues,
            "url",
            "canonical_id",
            MAX_CANONICALS_PER_STATEMENT,
            &unresolved.canonical_values,
            DictionaryKey::CanonicalValue,
        )?;
        self.resolve_logical_resources(&unresolved.logical_resource_idents)?;
        Ok(())
    }

    /// Resolves a dictionary of the form `(id, unique name)`.
    fn resolve_named(
        &mut self,
        dictionary: Dictionary,
        name_column: &str,
        id_column: &str,
        chunk_size: usize,
        names: &BTreeSet<String>,
        to_key: fn(String) -> DictionaryKey,
    ) -> IndexResult<()> {
        if names.is_empty() {
            return Ok(());
        }
        let table = dictionary.as_str();
        let fetch = |conn: &Connection, wanted: &[&String]| -> IndexResult<Vec<(String, i64)>> {
            let mut found = Vec::with_capacity(wanted.len());
            for chunk in wanted.chunks(chunk_size) {
                let sql = format!(
                    "SELECT {name_column}, {id_column} FROM {table} WHERE {name_column} IN ({})",
                    vec!["?"; chunk.len()].join(", ")
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
                for row in rows {
                    found.push(row?);
                }
            }
            Ok(found)
        };

        let wanted: Vec<&String> = names.iter().collect();
        let mut found: HashMap<String, i64> = fetch(self.conn, &wanted)?.into_iter().collect();

        let missing: Vec<&String> = wanted
            .iter()
            .copied()
            .filter(|name| !found.contains_key(*name))
            .collect();
        if !missing.is_empty() {
            debug!(dictionary = %dictionary, count = missing.len(), "Creating dictionary values");
            let mut insert = self.conn.prepare_cached(&format!(
                "INSERT INTO {table} ({name_column}) VALUES (?1) ON CONFLICT DO NOTHING"
            ))?;
            for name in &missing {
                insert.execute([name])?;
            }
            found.extend(fetch(self.conn, &missing)?);
        }

        for name in wanted {
            let id = *found.get(name).ok_or_else(|| DatabaseError::UnresolvedIdentity {
                dictionary: table.to_string(),
                key: name.clone(),
            })?;
            self.identities.record(to_key(name.clone()), id, true);
        }
        Ok(())
    }

    fn resolve_token_values(&mut self, keys: &BTreeSet<CommonTokenValueKey>) -> IndexResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        // (shard, code system id, value) -> key
        let mut by_row: HashMap<(i16, i64, String), CommonTokenValueKey> = HashMap::new();
        for key in keys {
            let code_system_id = self.id(&DictionaryKey::CodeSystem(key.code_system.clone()))?;
            by_row.insert((key.shard_key, code_system_id, key.token_value.clone()), key.clone());
        }
        let mut rows: Vec<(i16, i64, String)> = by_row.keys().cloned().collect();
        rows.sort();

        let fetch = |conn: &Connection, wanted: &[(i16, i64, String)]| -> IndexResult<HashMap<(i16, i64, String), i64>> {
            let mut found = HashMap::with_capacity(wanted.len());
            for chunk in wanted.chunks(MAX_TOKEN_VALUES_PER_STATEMENT) {
                let sql = format!(
                    "WITH v (shard_key, code_system_id, token_value) AS (VALUES {})
                     SELECT c.shard_key, c.code_system_id, c.token_value, c.common_token_value_id
                       FROM common_token_values AS c
                       JOIN v ON c.shard_key = v.shard_key
                             AND c.code_system_id = v.code_system_id
                             AND c.token_value = v.token_value",
                    vec!["(?, ?, ?)"; chunk.len()].join(", ")
                );
                let params: Vec<Value> = chunk
                    .iter()
                    .flat_map(|(shard, cs, value)| {
                        [
                            Value::Integer((*shard).into()),
                            Value::Integer(*cs),
                            Value::Text(value.clone()),
                        ]
                    })
                    .collect();
                let mut stmt = conn.prepare(&sql)?;
                let result = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
                    Ok(((row.get(0)?, row.get(1)?, row.get(2)?), row.get(3)?))
                })?;
                for row in result {
                    let (k, id) = row?;
                    found.insert(k, id);
                }
            }
            Ok(found)
        };

        let mut found = fetch(self.conn, &rows)?;
        let missing: Vec<(i16, i64, String)> =
            rows.iter().filter(|r| !found.contains_key(*r)).cloned().collect();
        if !missing.is_empty() {
            debug!(count = missing.len(), "Creating common token values");
            let mut insert = self.conn.prepare_cached(
                "INSERT INTO common_token_values (shard_key, code_system_id, token_value)
                 VALUES (?1, ?2, ?3) ON CONFLICT DO NOTHING",
            )?;
            for (shard, cs, value) in &missing {
                insert.execute((shard, cs, value))?;
            }
            found.extend(fetch(self.conn, &missing)?);
        }

        for row in rows {
            let id = found.get(&row).copied();
            let key = by_row.remove(&row).ok_or_else(|| DatabaseError::UnresolvedIdentity {
                dictionary: Dictionary::CommonTokenValues.to_string(),
                key: row.2.clone(),
            })?;
            let id = id.ok_or_else(|| DatabaseError::UnresolvedIdentity {
                dictionary: Dictionary::CommonTokenValues.to_string(),
                key: DictionaryKey::CommonTokenValue(key.clone()).to_string(),
            })?;
            self.identities.record(DictionaryKey::CommonTokenValue(key), id, true);
        }
        Ok(())
    }

    fn resolve_logical_resources(&mut self, keys: &BTreeSet<LogicalResourceIdentKey>) -> IndexResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut by_row: HashMap<(i64, String), LogicalResourceIdentKey> = HashMap::new();
        for key in keys {
            let resource_type_id = self
                .resource_type_id(&key.resource_type)?
                .ok_or_else(|| DatabaseError::UnresolvedIdentity {
                    dictionary: Dictionary::ResourceTypes.to_string(),
                    key: key.resource_type.clone(),
                })?;
            by_row.insert((resource_type_id, key.logical_id.clone()), key.clone());
        }
        let mut rows: Vec<(i64, String)> = by_row.keys().cloned().collect();
        rows.sort();

        let fetch = |conn: &Connection, wanted: &[(i64, String)]| -> IndexResult<HashMap<(i64, String), i64>> {
            let mut found = HashMap::with_capacity(wanted.len());
            for chunk in wanted.chunks(MAX_LOGICAL_RESOURCES_PER_STATEMENT) {
                let sql = format!(
                    "WITH v (resource_type_id, logical_id) AS (VALUES {})
                     SELECT lri.resource_type_id, lri.logical_id, lri.logical_resource_id
                       FROM logical_resource_ident AS lri
                       JOIN v ON lri.resource_type_id = v.resource_type_id
                             AND lri.logical_id = v.logical_id",
                    vec!["(?, ?)"; chunk.len()].join(", ")
                );
                let params: Vec<Value> = chunk
                    .iter()
                    .flat_map(|(rt, lid)| [Value::Integer(*rt), Value::Text(lid.clone())])
                    .collect();
                let mut stmt = conn.prepare(&sql)?;
                let result = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
                    Ok(((row.get(0)?, row.get(1)?), row.get(2)?))
                })?;
                for row in result {
                    let (k, id) = row?;
                    found.insert(k, id);
                }
            }
            Ok(found)
        };

        let mut found = fetch(self.conn, &rows)?;
        let missing: Vec<(i64, String)> =
            rows.iter().filter(|r| !found.contains_key(*r)).cloned().collect();
        if !missing.is_empty() {
            debug!(count = missing.len(), "Creating logical resource idents for reference targets");
            let mut insert = self.conn.prepare_cached(
                "INSERT INTO logical_resource_ident (resource_type_id, logical_id)
                 VALUES (?1, ?2) ON CONFLICT DO NOTHING",
            )?;
            for (rt, lid) in &missing {
                insert.execute((rt, lid))?;
            }
            found.extend(fetch(self.conn, &missing)?);
        }

        for row in rows {
            let key = by_row.remove(&row).ok_or_else(|| DatabaseError::UnresolvedIdentity {
                dictionary: Dictionary::LogicalResourceIdents.to_string(),
                key: row.1.clone(),
            })?;
            let id = found.get(&row).copied().ok_or_else(|| DatabaseError::UnresolvedIdentity {
                dictionary: Dictionary::LogicalResourceIdents.to_string(),
                key: DictionaryKey::LogicalResourceIdent(key.clone()).to_string(),
            })?;
            self.identities.record(DictionaryKey::LogicalResourceIdent(key), id, true);
        }
        Ok(())
    }
}
