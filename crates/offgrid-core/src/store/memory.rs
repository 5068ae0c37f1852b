use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{check_cacheable, check_namespace, CacheEntry, CacheKey, CacheStore};
use crate::error::StoreError;

/// In-process store. Lost on exit, which the cache contract allows.
#[derive(Default)]
pub struct MemoryStore {
    namespaces: RwLock<HashMap<String, HashMap<CacheKey, CacheEntry>>>,
    /// Maximum total entries across all namespaces
    quota: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that rejects new keys once `limit` entries exist.
    pub fn with_quota(limit: usize) -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
            quota: Some(limit),
        }
    }

    pub async fn len(&self, namespace: &str) -> usize {
        self.namespaces
            .read()
            .await
            .get(namespace)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn namespaces(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self.namespaces.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn get(&self, namespace: &str, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self
            .namespaces
            .read()
            .await
            .get(namespace)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn put(&self, namespace: &str, entry: CacheEntry) -> Result<(), StoreError> {
        check_namespace(namespace)?;
        check_cacheable(&entry)?;

        let mut namespaces = self.namespaces.write().await;
        if let Some(limit) = self.quota {
            let exists = namespaces
                .get(namespace)
                .map(|entries| entries.contains_key(&entry.key))
                .unwrap_or(false);
            let total: usize = namespaces.values().map(HashMap::len).sum();
            if !exists && total >= limit {
                return Err(StoreError::QuotaExceeded { limit });
            }
        }
        namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<CacheKey>, StoreError> {
        Ok(self
            .namespaces
            .read()
            .await
            .get(namespace)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<bool, StoreError> {
        Ok(self.namespaces.write().await.remove(namespace).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Response;
    use reqwest::{Method, Url};

    fn entry(method: Method, path: &str) -> CacheEntry {
        let url = Url::parse("https://example.org").unwrap().join(path).unwrap();
        CacheEntry::from_response(
            CacheKey::new(&method, &url),
            &Response::new(200, vec![], path.as_bytes().to_vec()),
        )
    }

    #[tokio::test]
    async fn test_put_get_overwrite() {
        let store = MemoryStore::new();
        let first = entry(Method::GET, "/a");
        let key = first.key.clone();
        store.put("app-cache-v1", first).await.unwrap();

        let mut second = entry(Method::GET, "/a");
        second.body = b"newer".to_vec();
        store.put("app-cache-v1", second).await.unwrap();

        let found = store.get("app-cache-v1", &key).await.unwrap().unwrap();
        assert_eq!(found.body, b"newer");
        assert_eq!(store.len("app-cache-v1").await, 1);
        assert!(store.get("app-cache-v2", &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refuses_mutating_entries() {
        let store = MemoryStore::new();
        for method in [Method::POST, Method::PUT, Method::DELETE] {
            let err = store.put("app-cache-v1", entry(method, "/a")).await;
            assert!(matches!(err, Err(StoreError::NotCacheable(_))));
        }
        assert!(store.namespaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quota_allows_overwrite_but_not_growth() {
        let store = MemoryStore::with_quota(1);
        store.put("ns", entry(Method::GET, "/a")).await.unwrap();
        store.put("ns", entry(Method::GET, "/a")).await.unwrap();
        let err = store.put("ns", entry(Method::GET, "/b")).await;
        assert!(matches!(err, Err(StoreError::QuotaExceeded { limit: 1 })));
    }

    #[tokio::test]
    async fn test_delete_namespace() {
        let store = MemoryStore::new();
        store.put("app-cache-v1", entry(Method::GET, "/")).await.unwrap();
        store.put("app-cache-v2", entry(Method::GET, "/")).await.unwrap();

        assert!(store.delete_namespace("app-cache-v1").await.unwrap());
        assert!(!store.delete_namespace("app-cache-v1").await.unwrap());
        assert_eq!(store.namespaces().await.unwrap(), vec!["app-cache-v2"]);
    }
}
