use chrono::{DateTime, Utc};
use sentryfrogg_types::StateScope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{fsio, StoreError};

// ── State store ──────────────────────────────────────────────────
//
// Persistent scope lives in state.json (atomic replace on every write);
// session scope is a process-local map that dies with the process.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntry {
    pub value: Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    entries: BTreeMap<String, StateEntry>,
}

struct Inner {
    path: PathBuf,
    persistent: BTreeMap<String, StateEntry>,
    session: BTreeMap<String, StateEntry>,
}

#[derive(Clone)]
pub struct StateStore {
    inner: Arc<RwLock<Inner>>,
}

impl StateStore {
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let file: StateFile = fsio::load_json(&path)?.unwrap_or_default();
        Ok(Self {
            inner: Arc::new(RwLock::new(Inner {
                path,
                persistent: file.entries,
                session: BTreeMap::new(),
            })),
        })
    }

    pub async fn set(&self, scope: StateScope, key: &str, value: Value) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::Invalid("state key must not be empty".to_string()));
        }
        let entry = StateEntry {
            value,
            updated_at: Utc::now(),
        };
        let mut inner = self.inner.write().await;
        match scope {
            StateScope::Session => {
                inner.session.insert(key.to_string(), entry);
            }
            StateScope::Persistent => {
                inner.persistent.insert(key.to_string(), entry);
                save(&inner)?;
            }
        }
        Ok(())
    }

    pub async fn get(&self, scope: StateScope, key: &str) -> Option<StateEntry> {
        let inner = self.inner.read().await;
        match scope {
            StateScope::Session => inner.session.get(key).cloned(),
            StateScope::Persistent => inner.persistent.get(key).cloned(),
        }
    }

    pub async fn delete(&self, scope: StateScope, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        match scope {
            StateScope::Session => Ok(inner.session.remove(key).is_some()),
            StateScope::Persistent => {
                let removed = inner.persistent.remove(key).is_some();
                if removed {
                    save(&inner)?;
                }
                Ok(removed)
            }
        }
    }

    pub async fn list(&self, scope: StateScope) -> Vec<(String, StateEntry)> {
        let inner = self.inner.read().await;
        let map = match scope {
            StateScope::Session => &inner.session,
            StateScope::Persistent => &inner.persistent,
        };
        map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Snapshot of one scope as a JSON object, used to build runbook
    /// template scopes.
    pub async fn snapshot(&self, scope: StateScope) -> Value {
        let inner = self.inner.read().await;
        let map = match scope {
            StateScope::Session => &inner.session,
            StateScope::Persistent => &inner.persistent,
        };
        Value::Object(
            map.iter()
                .map(|(k, entry)| (k.clone(), entry.value.clone()))
                .collect(),
        )
    }
}

fn save(inner: &Inner) -> Result<(), StoreError> {
    let file = StateFile {
        entries: inner.persistent.clone(),
    };
    fsio::atomic_write_json(&inner.path, &file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_persistent_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = StateStore::open(path.clone()).unwrap();
            store
                .set(StateScope::Persistent, "cursor", json!("abc"))
                .await
                .unwrap();
        }
        let store = StateStore::open(path).unwrap();
        let entry = store.get(StateScope::Persistent, "cursor").await.unwrap();
        assert_eq!(entry.value, json!("abc"));
    }

    #[tokio::test]
    async fn test_session_scope_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.json")).unwrap();
        store
            .set(StateScope::Session, "tmp", json!(1))
            .await
            .unwrap();
        assert!(store.get(StateScope::Session, "tmp").await.is_some());
        assert!(store.get(StateScope::Persistent, "tmp").await.is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.json")).unwrap();
        store
            .set(StateScope::Persistent, "k", json!(true))
            .await
            .unwrap();
        assert!(store.delete(StateScope::Persistent, "k").await.unwrap());
        assert!(!store.delete(StateScope::Persistent, "k").await.unwrap());
    }

    #[tokio::test]
    async fn test_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.json")).unwrap();
        store
            .set(StateScope::Session, "a", json!({"n": 1}))
            .await
            .unwrap();
        let snap = store.snapshot(StateScope::Session).await;
        assert_eq!(snap, json!({"a": {"n": 1}}));
    }
}
