use fd_lock::RwLock;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::StoreError;

// ── Atomic file replacement ──────────────────────────────────────
//
// Every persistent mutation goes through write-temp + fsync + rename so
// no reader can observe a torn file. Files holding secrets or state are
// created 0600.

pub fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| StoreError::Io(format!("failed to create directory {}: {e}", parent.display())))?;
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `bytes` to `path` atomically with `0600` permissions.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    ensure_parent(path)?;
    let temp_path = temp_sibling(path);

    {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let file = opts
            .open(&temp_path)
            .map_err(|e| StoreError::Io(format!("failed to create temp file: {e}")))?;

        let mut lock = RwLock::new(file);
        let mut guard = lock
            .write()
            .map_err(|e| StoreError::Io(format!("failed to acquire write lock: {e}")))?;

        guard
            .write_all(bytes)
            .map_err(|e| StoreError::Io(format!("failed to write temp file: {e}")))?;
        guard
            .flush()
            .map_err(|e| StoreError::Io(format!("failed to flush temp file: {e}")))?;
        guard
            .sync_all()
            .map_err(|e| StoreError::Io(format!("failed to fsync temp file: {e}")))?;
    }

    fs::rename(&temp_path, path)
        .map_err(|e| StoreError::Io(format!("failed to rename temp file: {e}")))?;
    Ok(())
}

/// Serialize `value` as pretty JSON and atomically replace `path`.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let contents = serde_json::to_string_pretty(value)
        .map_err(|e| StoreError::Io(format!("failed to serialize {}: {e}", path.display())))?;
    atomic_write(path, contents.as_bytes())
}

/// Load and parse a JSON file; `Ok(None)` when the file does not exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)
        .map_err(|e| StoreError::Io(format!("failed to read {}: {e}", path.display())))?;
    let parsed = serde_json::from_str(&contents)
        .map_err(|e| StoreError::Corrupt(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");

        atomic_write_json(&path, &serde_json::json!({"a": 1})).unwrap();
        let loaded: Option<serde_json::Value> = load_json(&path).unwrap();
        assert_eq!(loaded.unwrap()["a"], 1);

        // No temp sibling left behind
        assert!(!path.with_file_name("data.json.tmp").exists());
    }

    #[test]
    fn test_load_missing_is_none() {
        let loaded: Option<serde_json::Value> =
            load_json(Path::new("/nonexistent/data.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_permissions_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.json");
        atomic_write(&path, b"{}").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_replace_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        atomic_write(&path, b"old").unwrap();
        atomic_write(&path, b"new").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
    }
}
