//! Persistent, namespaced response cache.
//!
//! Every namespace belongs to one build (`<app>-cache-<version>`) and is the
//! unit of wholesale deletion. Entries are only ever created for idempotent
//! requests; both backends refuse anything else.
//!
//! Backends:
//! - `DiskStore`: one directory per namespace, one JSON file per entry
//! - `MemoryStore`: in-process maps, with an optional quota for tests

pub mod disk;
pub mod entry;
pub mod memory;

use async_trait::async_trait;

use crate::error::StoreError;

pub use disk::DiskStore;
pub use entry::{age_display, normalize_url, CacheEntry, CacheKey};
pub use memory::MemoryStore;

/// Per-key atomic storage shared by the interceptor and the lifecycle
/// manager. Writes to the same key are last-writer-wins.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Names of every namespace currently present.
    async fn namespaces(&self) -> Result<Vec<String>, StoreError>;

    async fn get(&self, namespace: &str, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError>;

    /// Insert or overwrite an entry, creating the namespace if needed.
    async fn put(&self, namespace: &str, entry: CacheEntry) -> Result<(), StoreError>;

    async fn keys(&self, namespace: &str) -> Result<Vec<CacheKey>, StoreError>;

    /// Remove a namespace and everything in it. Returns false if it did not exist.
    async fn delete_namespace(&self, namespace: &str) -> Result<bool, StoreError>;
}

pub(crate) fn check_namespace(namespace: &str) -> Result<(), StoreError> {
    if namespace.is_empty()
        || namespace.contains(['/', '\\'])
        || namespace == "."
        || namespace == ".."
    {
        return Err(StoreError::InvalidNamespace(namespace.to_string()));
    }
    Ok(())
}

pub(crate) fn check_cacheable(entry: &CacheEntry) -> Result<(), StoreError> {
    if entry.key.is_idempotent() {
        Ok(())
    } else {
        Err(StoreError::NotCacheable(entry.key.method.clone()))
    }
}
