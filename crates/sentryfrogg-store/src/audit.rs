use chrono::{DateTime, Utc};
use sentryfrogg_types::AuditEntry;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::redact::redact_value;
use crate::StoreError;

const DEFAULT_READ_LIMIT: usize = 100;
const MAX_READ_LIMIT: usize = 1000;

// ── Append-only audit log ────────────────────────────────────────

#[derive(Clone)]
pub struct AuditLog {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Append one entry as a JSONL line. `details` and `error` are redacted
    /// before serialization; a failure to audit never fails the tool call
    /// at the call sites (callers ignore the result deliberately).
    pub async fn append(&self, mut entry: AuditEntry) -> Result<(), StoreError> {
        if let Some(details) = &entry.details {
            entry.details = Some(redact_value(details));
        }
        if let Some(error) = &entry.error {
            entry.error = Some(redact_value(error));
        }

        let line = serde_json::to_string(&entry)
            .map_err(|e| StoreError::Io(format!("failed to serialize audit entry: {e}")))?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("failed to create audit dir: {e}")))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::Io(format!("failed to open audit log: {e}")))?;
        writeln!(file, "{line}")
            .map_err(|e| StoreError::Io(format!("failed to write audit entry: {e}")))?;
        Ok(())
    }

    /// Read the most recent entries, optionally filtered by tool and
    /// start time. `limit` defaults to 100 and is capped at 1000.
    pub async fn read(
        &self,
        tool: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        if !self.path.exists() {
            return Ok(vec![]);
        }

        let contents = fs::read_to_string(&self.path)
            .map_err(|e| StoreError::Io(format!("failed to read audit log: {e}")))?;

        let mut entries: Vec<AuditEntry> = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .filter(|entry: &AuditEntry| {
                if let Some(t) = tool {
                    if entry.tool != t {
                        return false;
                    }
                }
                if let Some(s) = since {
                    if entry.timestamp < s {
                        return false;
                    }
                }
                true
            })
            .collect();

        // Most recent first
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(limit.unwrap_or(DEFAULT_READ_LIMIT).min(MAX_READ_LIMIT));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentryfrogg_types::AuditStatus;
    use serde_json::json;

    fn entry(tool: &str, details: Option<serde_json::Value>) -> AuditEntry {
        AuditEntry {
            timestamp: Utc::now(),
            tool: tool.to_string(),
            action: "query".to_string(),
            status: AuditStatus::Ok,
            trace_id: "t-1".to_string(),
            span_id: "s-1".to_string(),
            parent_span_id: None,
            duration_ms: Some(12),
            details,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));

        log.append(entry("postgres", None)).await.unwrap();
        log.append(entry("ssh", None)).await.unwrap();

        let all = log.read(None, None, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let only_pg = log.read(Some("postgres"), None, None).await.unwrap();
        assert_eq!(only_pg.len(), 1);
        assert_eq!(only_pg[0].tool, "postgres");
    }

    #[tokio::test]
    async fn test_details_redacted_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::new(path.clone());

        log.append(entry("ssh", Some(json!({"password": "topsecret"}))))
            .await
            .unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("topsecret"));
        assert!(raw.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn test_limit_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));
        for _ in 0..5 {
            log.append(entry("api", None)).await.unwrap();
        }
        let limited = log.read(None, None, Some(2)).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let log = AuditLog::new(PathBuf::from("/nonexistent/audit.jsonl"));
        assert!(log.read(None, None, None).await.unwrap().is_empty());
    }
}
