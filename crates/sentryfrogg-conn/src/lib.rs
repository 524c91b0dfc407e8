pub mod http;
pub mod postgres;
pub mod resolver;
pub mod sftp;
pub mod ssh;
pub mod vault;

pub use http::ApiManager;
pub use postgres::PgManager;
pub use resolver::{ResolveCtx, SecretResolver};
pub use ssh::SshManager;
pub use vault::VaultClient;

/// Read a per-subsystem capture cap from the environment with a default.
/// Accepts `SENTRYFROGG_<NAME>` and the short `SF_<NAME>` form.
pub(crate) fn env_bytes(name: &str, default: usize) -> usize {
    for prefix in ["SENTRYFROGG_", "SF_"] {
        if let Ok(raw) = std::env::var(format!("{prefix}{name}")) {
            if let Ok(n) = raw.trim().parse::<usize>() {
                return n;
            }
        }
    }
    default
}

/// Serialize with object keys sorted recursively, so structurally equal
/// values hash identically regardless of construction order.
pub(crate) fn canonical_json(value: &serde_json::Value) -> String {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

pub(crate) fn env_ms(name: &str, default: u64) -> u64 {
    for prefix in ["SENTRYFROGG_", "SF_"] {
        if let Ok(raw) = std::env::var(format!("{prefix}{name}")) {
            if let Ok(n) = raw.trim().parse::<u64>() {
                return n;
            }
        }
    }
    default
}
