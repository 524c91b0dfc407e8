use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Audit Entry ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Ok,
    Error,
}

/// One line of the append-only JSONL audit log. `details` is redacted
/// before the entry is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub tool: String,
    pub action: String,
    pub status: AuditStatus,
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

// ── Cache Envelope ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    Json,
    File,
}

/// Metadata envelope stored as `<hash>.json` next to an optional
/// `<hash>.bin` body for file entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEnvelope {
    pub kind: CacheKind,
    pub created_at: DateTime<Utc>,
    pub ttl_ms: u64,
    #[serde(default)]
    pub meta: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// File name of the binary body relative to the cache directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl CacheEnvelope {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age.num_milliseconds() < 0 || age.num_milliseconds() as u64 >= self.ttl_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_expiry() {
        let env = CacheEnvelope {
            kind: CacheKind::Json,
            created_at: Utc::now() - Duration::seconds(10),
            ttl_ms: 5_000,
            meta: Value::Null,
            value: Some(Value::Bool(true)),
            file: None,
        };
        assert!(env.is_expired(Utc::now()));

        let fresh = CacheEnvelope {
            ttl_ms: 60_000,
            ..env
        };
        assert!(!fresh.is_expired(Utc::now()));
    }
}
