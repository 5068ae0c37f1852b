use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, warn};

use super::{check_cacheable, check_namespace, CacheEntry, CacheKey, CacheStore};
use crate::error::StoreError;

const ENTRY_EXTENSION: &str = "json";

/// Distinguishes temp files of concurrent writers to the same key.
static WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Stores each namespace as a directory under `root` and each entry as
/// `<sha256(key)>.json`. Writes go to a temp file and are renamed into
/// place, so readers never observe a half-written entry.
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: PathBuf) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn namespace_dir(&self, namespace: &str) -> Result<PathBuf, StoreError> {
        check_namespace(namespace)?;
        Ok(self.root.join(namespace))
    }

    fn entry_path(&self, namespace: &str, key: &CacheKey) -> Result<PathBuf, StoreError> {
        Ok(self
            .namespace_dir(namespace)?
            .join(format!("{}.{}", key.digest(), ENTRY_EXTENSION)))
    }

    async fn read_entry(path: &Path) -> Result<Option<CacheEntry>, StoreError> {
        let contents = match fs::read(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl CacheStore for DiskStore {
    async fn namespaces(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            if item.file_type().await?.is_dir() {
                if let Some(name) = item.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn get(&self, namespace: &str, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        let path = self.entry_path(namespace, key)?;
        let entry = Self::read_entry(&path).await?;
        // Never serve another key's body on a digest collision
        Ok(entry.filter(|e| e.key == *key))
    }

    async fn put(&self, namespace: &str, entry: CacheEntry) -> Result<(), StoreError> {
        check_cacheable(&entry)?;
        let dir = self.namespace_dir(namespace)?;
        fs::create_dir_all(&dir).await?;

        let path = self.entry_path(namespace, &entry.key)?;
        let seq = WRITE_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = dir.join(format!(
            ".{}.{}.{}.tmp",
            entry.key.digest(),
            std::process::id(),
            seq
        ));

        let contents = serde_json::to_vec(&entry)?;
        if let Err(e) = fs::write(&tmp, contents).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(namespace = namespace, url = %entry.key.url, "Stored cache entry");
        Ok(())
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<CacheKey>, StoreError> {
        let dir = self.namespace_dir(namespace)?;
        let mut listing = match fs::read_dir(&dir).await {
            Ok(listing) => listing,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(item) = listing.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            match Self::read_entry(&path).await {
                Ok(Some(entry)) => keys.push(entry.key),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Skipping unreadable cache entry"),
            }
        }
        Ok(keys)
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<bool, StoreError> {
        let dir = self.namespace_dir(namespace)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
