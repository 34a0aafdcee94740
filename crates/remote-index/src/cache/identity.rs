//! Thread-shared dictionary cache mapping natural keys to surrogate ids.
//!
//! Every dictionary is its own LRU behind its own lock, so consumers working
//! on different dictionaries never contend. Entries expire after a
//! per-dictionary TTL and are evicted least-recently-used under capacity
//! pressure.
//!
//! The cache only ever holds committed ids. Handlers stage ids they resolve
//! inside a transaction and publish them here after the commit succeeds.

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

/// Capacity and TTL for one dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DictionaryCacheConfig {
    pub capacity: usize,
    pub ttl: Duration,
}

impl DictionaryCacheConfig {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self { capacity, ttl }
    }
}

impl Default for DictionaryCacheConfig {
    fn default() -> Self {
        Self::new(1000, Duration::from_secs(3600))
    }
}

/// Settings for every dictionary held by the [`IdentityCache`].
#[derive(Debug, Clone, Default)]
pub struct IdentityCacheConfig {
    pub parameter_names: DictionaryCacheConfig,
    pub resource_types: DictionaryCacheConfig,
    pub code_systems: DictionaryCacheConfig,
    pub common_token_values: DictionaryCacheConfig,
    pub canonical_values: DictionaryCacheConfig,
    pub logical_resource_idents: DictionaryCacheConfig,
}

/// The dictionaries held by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dictionary {
    ParameterNames,
    ResourceTypes,
    CodeSystems,
    CommonTokenValues,
    CanonicalValues,
    LogicalResourceIdents,
}

impl Dictionary {
    pub const ALL: [Dictionary; 6] = [
        Dictionary::ParameterNames,
        Dictionary::ResourceTypes,
        Dictionary::CodeSystems,
        Dictionary::CommonTokenValues,
        Dictionary::CanonicalValues,
        Dictionary::LogicalResourceIdents,
    ];

    /// Name of the backing table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dictionary::ParameterNames => "parameter_names",
            Dictionary::ResourceTypes => "resource_types",
            Dictionary::CodeSystems => "code_systems",
            Dictionary::CommonTokenValues => "common_token_values",
            Dictionary::CanonicalValues => "common_canonical_values",
            Dictionary::LogicalResourceIdents => "logical_resource_ident",
        }
    }
}

impl fmt::Display for Dictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of a common token value. Token values are partitioned by shard so the
/// sharded schema can co-locate them with the resources that use them; the
/// plain schema always uses shard 0.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommonTokenValueKey {
    pub shard_key: i16,
    pub code_system: String,
    pub token_value: String,
}

impl CommonTokenValueKey {
    pub fn new(shard_key: i16, code_system: impl Into<String>, token_value: impl Into<String>) -> Self {
        Self {
            shard_key,
            code_system: code_system.into(),
            token_value: token_value.into(),
        }
    }
}

/// Key of a logical resource identity (`resourceType/logicalId`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalResourceIdentKey {
    pub resource_type: String,
    pub logical_id: String,
}

impl LogicalResourceIdentKey {
    pub fn new(resource_type: impl Into<String>, logical_id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            logical_id: logical_id.into(),
        }
    }
}

/// A key in any of the dictionaries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DictionaryKey {
    ParameterName(String),
    ResourceType(String),
    CodeSystem(String),
    CommonTokenValue(CommonTokenValueKey),
    CanonicalValue(String),
    LogicalResourceIdent(LogicalResourceIdentKey),
}

impl DictionaryKey {
    pub fn dictionary(&self) -> Dictionary {
        match self {
            DictionaryKey::ParameterName(_) => Dictionary::ParameterNames,
            DictionaryKey::ResourceType(_) => Dictionary::ResourceTypes,
            DictionaryKey::CodeSystem(_) => Dictionary::CodeSystems,
            DictionaryKey::CommonTokenValue(_) => Dictionary::CommonTokenValues,
            DictionaryKey::CanonicalValue(_) => Dictionary::CanonicalValues,
            DictionaryKey::LogicalResourceIdent(_) => Dictionary::LogicalResourceIdents,
        }
    }
}

impl fmt::Display for DictionaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DictionaryKey::ParameterName(v)
            | DictionaryKey::ResourceType(v)
            | DictionaryKey::CodeSystem(v)
            | DictionaryKey::CanonicalValue(v) => f.write_str(v),
            DictionaryKey::CommonTokenValue(k) => {
                write!(f, "{}|{}|{}", k.shard_key, k.code_system, k.token_value)
            }
            DictionaryKey::LogicalResourceIdent(k) => {
                write!(f, "{}/{}", k.resource_type, k.logical_id)
            }
        }
    }
}

/// Rows used to prime the cache at startup.
#[derive(Debug, Clone, Default)]
pub struct CacheSeed {
    pub resource_types: Vec<(String, i64)>,
    pub parameter_names: Vec<(String, i64)>,
}

/// Counters for one dictionary.
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Point-in-time copy of a dictionary's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStatsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    id: i64,
    expires_at: Option<Instant>,
}

/// One dictionary: an LRU of ids with a TTL.
struct DictionaryCache<K: Hash + Eq> {
    entries: Mutex<LruCache<K, Entry>>,
    ttl: Duration,
    stats: CacheStats,
}

impl<K: Hash + Eq> DictionaryCache<K> {
    fn new(config: DictionaryCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: config.ttl,
            stats: CacheStats::default(),
        }
    }

    fn get<Q>(&self, key: &Q) -> Option<i64>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key).copied() {
            Some(entry) if entry.expires_at.is_none_or(|at| at > now) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.id)
            }
            Some(_) => {
                entries.pop(key);
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn put(&self, key: K, id: i64) {
        let entry = Entry {
            id,
            // A TTL too large to represent never expires.
            expires_at: Instant::now().checked_add(self.ttl),
        };
        let mut entries = self.entries.lock();
        if entries.len() == entries.cap().get() && !entries.contains(&key) {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
        entries.put(key, entry);
        self.stats.insertions.fetch_add(1, Ordering::Relaxed);
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }

    fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            entries: self.entries.lock().len(),
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            insertions: self.stats.insertions.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            expirations: self.stats.expirations.load(Ordering::Relaxed),
        }
    }
}

/// Shared identity cache used by every consumer thread.
///
/// Callers never hold a lock across calls; each `get`/`put` takes and
/// releases the lock of a single dictionary.
pub struct IdentityCache {
    parameter_names: DictionaryCache<String>,
    resource_types: DictionaryCache<String>,
    code_systems: DictionaryCache<String>,
    common_token_values: DictionaryCache<CommonTokenValueKey>,
    canonical_values: DictionaryCache<String>,
    logical_resource_idents: DictionaryCache<LogicalResourceIdentKey>,
}

impl IdentityCache {
    pub fn new(config: &IdentityCacheConfig) -> Self {
        Self {
            parameter_names: DictionaryCache::new(config.parameter_names),
            resource_types: DictionaryCache::new(config.resource_types),
            code_systems: DictionaryCache::new(config.code_systems),
            common_token_values: DictionaryCache::new(config.common_token_values),
            canonical_values: DictionaryCache::new(config.canonical_values),
            logical_resource_idents: DictionaryCache::new(config.logical_resource_idents),
        }
    }

    /// Seeds the resource-type and parameter-name dictionaries.
    pub fn init(&self, seed: CacheSeed) {
        for (name, id) in seed.resource_types {
            self.resource_types.put(name, id);
        }
        for (name, id) in seed.parameter_names {
            self.parameter_names.put(name, id);
        }
    }

    /// Looks up a key in its dictionary.
    pub fn get(&self, key: &DictionaryKey) -> Option<i64> {
        match key {
            DictionaryKey::ParameterName(v) => self.parameter_names.get(v.as_str()),
            DictionaryKey::ResourceType(v) => self.resource_types.get(v.as_str()),
            DictionaryKey::CodeSystem(v) => self.code_systems.get(v.as_str()),
            DictionaryKey::CommonTokenValue(k) => self.common_token_values.get(k),
            DictionaryKey::CanonicalValue(v) => self.canonical_values.get(v.as_str()),
            DictionaryKey::LogicalResourceIdent(k) => self.logical_resource_idents.get(k),
        }
    }

    /// Stores a committed id.
    pub fn put(&self, key: DictionaryKey, id: i64) {
        match key {
            DictionaryKey::ParameterName(v) => self.parameter_names.put(v, id),
            DictionaryKey::ResourceType(v) => self.resource_types.put(v, id),
            DictionaryKey::CodeSystem(v) => self.code_systems.put(v, id),
            DictionaryKey::CommonTokenValue(k) => self.common_token_values.put(k, id),
            DictionaryKey::CanonicalValue(v) => self.canonical_values.put(v, id),
            DictionaryKey::LogicalResourceIdent(k) => self.logical_resource_idents.put(k, id),
        }
    }

    pub fn get_parameter_name_id(&self, name: &str) -> Option<i64> {
        self.parameter_names.get(name)
    }

    pub fn get_resource_type_id(&self, resource_type: &str) -> Option<i64> {
        self.resource_types.get(resource_type)
    }

    /// Drops every entry of one dictionary.
    pub fn clear(&self, dictionary: Dictionary) {
        match dictionary {
            Dictionary::ParameterNames => self.parameter_names.clear(),
            Dictionary::ResourceTypes => self.resource_types.clear(),
            Dictionary::CodeSystems => self.code_systems.clear(),
            Dictionary::CommonTokenValues => self.common_token_values.clear(),
            Dictionary::CanonicalValues => self.canonical_values.clear(),
            Dictionary::LogicalResourceIdents => self.logical_resource_idents.clear(),
        }
    }

    pub fn stats(&self, dictionary: Dictionary) -> CacheStatsSnapshot {
        match dictionary {
            Dictionary::ParameterNames => self.parameter_names.stats(),
            Dictionary::ResourceTypes => self.resource_types.stats(),
            Dictionary::CodeSystems => self.code_systems.stats(),
            Dictionary::CommonTokenValues => self.common_token_values.stats(),
            Dictionary::CanonicalValues => self.canonical_values.stats(),
            Dictionary::LogicalResourceIdents => self.logical_resource_idents.stats(),
        }
    }
}

impl fmt::Debug for IdentityCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for dictionary in Dictionary::ALL {
            map.entry(&dictionary.as_str(), &self.stats(dictionary).entries);
        }
        map.finish()
    }
}
