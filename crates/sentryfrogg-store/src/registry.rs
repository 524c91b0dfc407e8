use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{fsio, StoreError};

// ── Generic named-item registry ──────────────────────────────────
//
// Projects, runbooks, aliases and presets are all `name → item` maps in
// their own JSON files with atomic replace on every mutation.

struct Inner<T> {
    path: PathBuf,
    items: BTreeMap<String, T>,
}

pub struct Registry<T> {
    inner: Arc<RwLock<Inner<T>>>,
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Serialize + DeserializeOwned + Clone + Send + Sync> Registry<T> {
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let items: BTreeMap<String, T> = fsio::load_json(&path)?.unwrap_or_default();
        Ok(Self {
            inner: Arc::new(RwLock::new(Inner { path, items })),
        })
    }

    pub async fn put(&self, name: &str, item: T) -> Result<(), StoreError> {
        if name.is_empty() {
            return Err(StoreError::Invalid("name must not be empty".to_string()));
        }
        let mut inner = self.inner.write().await;
        inner.items.insert(name.to_string(), item);
        fsio::atomic_write_json(&inner.path, &inner.items)
    }

    pub async fn get(&self, name: &str) -> Option<T> {
        self.inner.read().await.items.get(name).cloned()
    }

    pub async fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let removed = inner.items.remove(name).is_some();
        if removed {
            fsio::atomic_write_json(&inner.path, &inner.items)?;
        }
        Ok(removed)
    }

    pub async fn names(&self) -> Vec<String> {
        self.inner.read().await.items.keys().cloned().collect()
    }

    pub async fn entries(&self) -> Vec<(String, T)> {
        self.inner
            .read()
            .await
            .items
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let reg: Registry<String> = Registry::open(dir.path().join("aliases.json")).unwrap();

        reg.put("sql", "postgres".to_string()).await.unwrap();
        assert_eq!(reg.get("sql").await, Some("postgres".to_string()));
        assert!(reg.remove("sql").await.unwrap());
        assert!(!reg.remove("sql").await.unwrap());
    }

    #[tokio::test]
    async fn test_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presets.json");
        {
            let reg: Registry<serde_json::Value> = Registry::open(path.clone()).unwrap();
            reg.put("prod-db", serde_json::json!({"profile_name": "prod"}))
                .await
                .unwrap();
        }
        let reg: Registry<serde_json::Value> = Registry::open(path).unwrap();
        assert_eq!(reg.names().await, vec!["prod-db".to_string()]);
    }
}
