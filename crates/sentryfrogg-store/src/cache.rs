use chrono::Utc;
use sentryfrogg_types::{CacheEnvelope, CacheKind};
use serde_json::Value;
use std::fs;
use std::path::PathBuf;

use crate::{fsio, StoreError};

// ── Response cache ───────────────────────────────────────────────
//
// Two files per key under cache/: `<hash>.json` (envelope) and, for
// file entries, `<hash>.bin` (body). Expired entries are purged on read.

#[derive(Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn envelope_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}.json"))
    }

    /// Final location of a file entry's body.
    pub fn file_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}.bin"))
    }

    /// Temp sibling for staging a streamed body before commit.
    pub fn part_path(&self, hash: &str) -> Result<PathBuf, StoreError> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| StoreError::Io(format!("failed to create cache dir: {e}")))?;
        Ok(self.dir.join(format!("{hash}.bin.part")))
    }

    pub fn put_json(&self, hash: &str, value: Value, ttl_ms: u64, meta: Value) -> Result<(), StoreError> {
        let envelope = CacheEnvelope {
            kind: CacheKind::Json,
            created_at: Utc::now(),
            ttl_ms,
            meta,
            value: Some(value),
            file: None,
        };
        fsio::atomic_write_json(&self.envelope_path(hash), &envelope)
    }

    /// Promote a fully-written `.part` body to `<hash>.bin` and record
    /// its envelope.
    pub fn commit_file(&self, hash: &str, ttl_ms: u64, meta: Value) -> Result<(), StoreError> {
        let part = self.dir.join(format!("{hash}.bin.part"));
        let target = self.file_path(hash);
        fs::rename(&part, &target)
            .map_err(|e| StoreError::Io(format!("failed to commit cache body: {e}")))?;

        let envelope = CacheEnvelope {
            kind: CacheKind::File,
            created_at: Utc::now(),
            ttl_ms,
            meta,
            value: None,
            file: Some(format!("{hash}.bin")),
        };
        fsio::atomic_write_json(&self.envelope_path(hash), &envelope)
    }

    /// Fetch a live envelope; expired entries are deleted and reported
    /// as absent.
    pub fn get(&self, hash: &str) -> Result<Option<CacheEnvelope>, StoreError> {
        let path = self.envelope_path(hash);
        let envelope: Option<CacheEnvelope> = fsio::load_json(&path)?;
        match envelope {
            None => Ok(None),
            Some(env) if env.is_expired(Utc::now()) => {
                self.remove(hash);
                Ok(None)
            }
            Some(env) => Ok(Some(env)),
        }
    }

    fn remove(&self, hash: &str) {
        let _ = fs::remove_file(self.envelope_path(hash));
        let _ = fs::remove_file(self.file_path(hash));
    }

    /// Drop every expired entry. Returns the number purged.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let now = Utc::now();
        let mut purged = 0;
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| StoreError::Io(format!("failed to read cache dir: {e}")))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(hash) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            if let Ok(Some(env)) = fsio::load_json::<CacheEnvelope>(&path) {
                if env.is_expired(now) {
                    self.remove(&hash);
                    purged += 1;
                }
            }
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path().join("cache"));

        cache
            .put_json("abc123", json!({"rows": 3}), 60_000, json!({"url": "https://x"}))
            .unwrap();
        let env = cache.get("abc123").unwrap().unwrap();
        assert_eq!(env.kind, CacheKind::Json);
        assert_eq!(env.value.unwrap()["rows"], 3);
    }

    #[test]
    fn test_expired_purged_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path().join("cache"));

        cache.put_json("dead", json!(1), 0, Value::Null).unwrap();
        assert!(cache.get("dead").unwrap().is_none());
        assert!(!dir.path().join("cache/dead.json").exists());
    }

    #[test]
    fn test_file_entry_commit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path().join("cache"));

        let part = cache.part_path("blob").unwrap();
        fs::write(&part, b"payload").unwrap();
        cache.commit_file("blob", 60_000, Value::Null).unwrap();

        let env = cache.get("blob").unwrap().unwrap();
        assert_eq!(env.kind, CacheKind::File);
        assert_eq!(fs::read(cache.file_path("blob")).unwrap(), b"payload");
    }

    #[test]
    fn test_purge_expired() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path().join("cache"));
        cache.put_json("a", json!(1), 0, Value::Null).unwrap();
        cache.put_json("b", json!(2), 600_000, Value::Null).unwrap();
        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert!(cache.get("b").unwrap().is_some());
    }
}
