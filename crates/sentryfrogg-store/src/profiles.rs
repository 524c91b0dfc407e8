use chrono::Utc;
use sentryfrogg_types::{Profile, ProfileKind, ProfileSummary, SealedValue, StoredProfile};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::crypto::MasterKey;
use crate::{fsio, StoreError};

// ── On-disk format ───────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProfilesFile {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    profiles: BTreeMap<String, StoredProfile>,
}

fn default_version() -> u32 {
    1
}

// ── Profile store ────────────────────────────────────────────────

/// Callback invoked with the profile name whenever a profile is upserted
/// or deleted. Connection managers register these to evict pools.
pub type ChangeHook = Box<dyn Fn(&str) + Send + Sync>;

struct Inner {
    path: PathBuf,
    key: MasterKey,
    profiles: BTreeMap<String, StoredProfile>,
}

/// Thread-safe handle over the encrypted profile file.
#[derive(Clone)]
pub struct ProfileStore {
    inner: Arc<RwLock<Inner>>,
    hooks: Arc<std::sync::Mutex<Vec<ChangeHook>>>,
}

impl ProfileStore {
    /// Open (or initialize) the profile store at `path` with `key`.
    pub fn open(path: PathBuf, key: MasterKey) -> Result<Self, StoreError> {
        let file: ProfilesFile = fsio::load_json(&path)?.unwrap_or_default();
        Ok(Self {
            inner: Arc::new(RwLock::new(Inner {
                path,
                key,
                profiles: file.profiles,
            })),
            hooks: Arc::new(std::sync::Mutex::new(Vec::new())),
        })
    }

    /// Register a hook fired after every upsert/delete with the profile name.
    pub fn on_change(&self, hook: ChangeHook) {
        self.hooks.lock().expect("hook registry poisoned").push(hook);
    }

    fn notify(&self, name: &str) {
        for hook in self.hooks.lock().expect("hook registry poisoned").iter() {
            hook(name);
        }
    }

    /// Create or replace a profile. `data` stays plaintext; every value in
    /// `secrets` is sealed independently before the file is written.
    pub async fn set(
        &self,
        name: &str,
        kind: ProfileKind,
        data: Map<String, Value>,
        secrets: BTreeMap<String, String>,
    ) -> Result<ProfileSummary, StoreError> {
        if name.is_empty() {
            return Err(StoreError::Invalid("profile name must not be empty".to_string()));
        }

        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let created_at = inner
            .profiles
            .get(name)
            .map(|p| p.created_at)
            .unwrap_or(now);

        let mut sealed: BTreeMap<String, SealedValue> = BTreeMap::new();
        for (k, v) in &secrets {
            sealed.insert(k.clone(), inner.key.seal(v.as_bytes())?);
        }

        let stored = StoredProfile {
            kind,
            data,
            secrets: sealed,
            created_at,
            updated_at: now,
        };
        let summary = summarize(name, &stored);
        inner.profiles.insert(name.to_string(), stored);
        save(&inner)?;
        drop(inner);

        self.notify(name);
        Ok(summary)
    }

    /// Patch only the named secret, leaving everything else intact. Used by
    /// the Vault client to persist a refreshed token.
    pub async fn set_secret(&self, name: &str, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let sealed = inner.key.seal(value.as_bytes())?;
        let profile = inner
            .profiles
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("profile '{name}' not found")))?;
        profile.secrets.insert(key.to_string(), sealed);
        profile.updated_at = Utc::now();
        save(&inner)
    }

    /// Patch a single plaintext `data` field. Used by TOFU host-key pinning.
    pub async fn set_data_field(&self, name: &str, key: &str, value: Value) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let profile = inner
            .profiles
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("profile '{name}' not found")))?;
        profile.data.insert(key.to_string(), value);
        profile.updated_at = Utc::now();
        save(&inner)
    }

    /// Fetch a profile with decrypted secrets. `expected_kind` guards
    /// against using e.g. an SSH profile for a Postgres call.
    pub async fn get(
        &self,
        name: &str,
        expected_kind: Option<ProfileKind>,
    ) -> Result<Profile, StoreError> {
        let inner = self.inner.read().await;
        let stored = inner
            .profiles
            .get(name)
            .ok_or_else(|| StoreError::NotFound(format!("profile '{name}' not found")))?;

        if let Some(expected) = expected_kind {
            if stored.kind != expected {
                return Err(StoreError::TypeMismatch {
                    name: name.to_string(),
                    expected,
                    actual: stored.kind,
                });
            }
        }

        let mut secrets = BTreeMap::new();
        for (k, sealed) in &stored.secrets {
            let plaintext = inner.key.open(sealed).map_err(|e| match e {
                StoreError::Corrupt(_) => {
                    StoreError::Corrupt(format!("profile '{name}' secret '{k}' failed to decrypt"))
                }
                other => other,
            })?;
            let text = String::from_utf8(plaintext)
                .map_err(|_| StoreError::Corrupt(format!("profile '{name}' secret '{k}' is not UTF-8")))?;
            secrets.insert(k.clone(), text);
        }

        Ok(Profile {
            name: name.to_string(),
            kind: stored.kind,
            data: stored.data.clone(),
            secrets,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
        })
    }

    /// List profile summaries. Only secret key names are visible.
    pub async fn list(&self, kind: Option<ProfileKind>) -> Vec<ProfileSummary> {
        let inner = self.inner.read().await;
        inner
            .profiles
            .iter()
            .filter(|(_, p)| kind.map_or(true, |k| p.kind == k))
            .map(|(name, p)| summarize(name, p))
            .collect()
    }

    /// Find the single profile of `kind`, if exactly one exists. Used to
    /// resolve the default vault profile for secret references.
    pub async fn singleton_of_kind(&self, kind: ProfileKind) -> Option<String> {
        let inner = self.inner.read().await;
        let mut names = inner
            .profiles
            .iter()
            .filter(|(_, p)| p.kind == kind)
            .map(|(name, _)| name.clone());
        let first = names.next()?;
        if names.next().is_some() {
            return None;
        }
        Some(first)
    }

    /// Delete a profile. Returns true when it existed.
    pub async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let removed = inner.profiles.remove(name).is_some();
        if removed {
            save(&inner)?;
        }
        drop(inner);
        if removed {
            self.notify(name);
        }
        Ok(removed)
    }

    /// Break-glass plaintext export, gated by an explicit env flag.
    pub async fn export_plaintext(&self, name: &str) -> Result<Profile, StoreError> {
        if !secret_export_allowed() {
            return Err(StoreError::Denied(
                "plaintext secret export is disabled; set SENTRYFROGG_ALLOW_SECRET_EXPORT=1".to_string(),
            ));
        }
        self.get(name, None).await
    }
}

fn secret_export_allowed() -> bool {
    ["SENTRYFROGG_ALLOW_SECRET_EXPORT", "SF_ALLOW_SECRET_EXPORT"]
        .iter()
        .any(|var| {
            std::env::var(var)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        })
}

fn summarize(name: &str, stored: &StoredProfile) -> ProfileSummary {
    ProfileSummary {
        name: name.to_string(),
        kind: stored.kind,
        secret_keys: stored.secrets.keys().cloned().collect(),
        created_at: stored.created_at,
        updated_at: stored.updated_at,
    }
}

fn save(inner: &Inner) -> Result<(), StoreError> {
    let file = ProfilesFile {
        version: 1,
        profiles: inner.profiles.clone(),
    };
    fsio::atomic_write_json(&inner.path, &file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn open_store(dir: &tempfile::TempDir) -> ProfileStore {
        let key = MasterKey::new([42u8; 32]);
        ProfileStore::open(dir.path().join("profiles.json"), key).unwrap()
    }

    fn pg_data() -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("host".into(), Value::String("db.example".into()));
        data.insert("port".into(), Value::Number(5432.into()));
        data
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let mut secrets = BTreeMap::new();
        secrets.insert("password".to_string(), "hunter2".to_string());
        store
            .set("db", ProfileKind::Postgresql, pg_data(), secrets)
            .await
            .unwrap();

        let profile = store.get("db", Some(ProfileKind::Postgresql)).await.unwrap();
        assert_eq!(profile.secrets["password"], "hunter2");
        assert_eq!(profile.data["host"], Value::String("db.example".into()));
    }

    #[tokio::test]
    async fn test_secrets_sealed_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let mut secrets = BTreeMap::new();
        secrets.insert("password".to_string(), "plaintext-marker".to_string());
        store
            .set("db", ProfileKind::Postgresql, pg_data(), secrets)
            .await
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("profiles.json")).unwrap();
        assert!(!raw.contains("plaintext-marker"));
    }

    #[tokio::test]
    async fn test_type_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store
            .set("db", ProfileKind::Postgresql, pg_data(), BTreeMap::new())
            .await
            .unwrap();

        let err = store.get("db", Some(ProfileKind::Ssh)).await.unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_list_never_returns_secret_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let mut secrets = BTreeMap::new();
        secrets.insert("token".to_string(), "sekrit".to_string());
        store
            .set("api", ProfileKind::Api, Map::new(), secrets)
            .await
            .unwrap();

        let listed = store.list(None).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].secret_keys, vec!["token".to_string()]);
        let json = serde_json::to_string(&listed).unwrap();
        assert!(!json.contains("sekrit"));
    }

    #[tokio::test]
    async fn test_change_hook_fires() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        store.on_change(Box::new(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        store
            .set("db", ProfileKind::Postgresql, pg_data(), BTreeMap::new())
            .await
            .unwrap();
        store.delete("db").await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_delete_missing_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        assert!(!store.delete("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_reopen_preserves_profiles() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(&dir);
            let mut secrets = BTreeMap::new();
            secrets.insert("password".to_string(), "persisted".to_string());
            store
                .set("db", ProfileKind::Postgresql, pg_data(), secrets)
                .await
                .unwrap();
        }
        let store = open_store(&dir);
        let profile = store.get("db", None).await.unwrap();
        assert_eq!(profile.secrets["password"], "persisted");
    }

    #[tokio::test]
    async fn test_singleton_of_kind() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store
            .set("v1", ProfileKind::Vault, Map::new(), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(store.singleton_of_kind(ProfileKind::Vault).await, Some("v1".into()));

        store
            .set("v2", ProfileKind::Vault, Map::new(), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(store.singleton_of_kind(ProfileKind::Vault).await, None);
    }
}
