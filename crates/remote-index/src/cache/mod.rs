//! Identity cache and its startup loader.

pub mod identity;
pub mod loader;

pub use identity::{
    CacheSeed, CacheStatsSnapshot, CommonTokenValueKey, Dictionary, DictionaryCacheConfig,
    DictionaryKey, IdentityCache, IdentityCacheConfig, LogicalResourceIdentKey,
};
pub use loader::CacheLoader;
