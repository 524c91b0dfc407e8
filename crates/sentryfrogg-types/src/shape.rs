use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ── Output shaping IR ────────────────────────────────────────────

/// What a `path` extraction does when it resolves to nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingPolicy {
    #[default]
    Error,
    Empty,
    Null,
    Undefined,
}

/// The `output` directive attached to any tool call. Applied to a
/// successful result in order: `path`, `pick`, `omit`, `map`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputShape {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pick: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub omit: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub missing: MissingPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

// ── store_as directive ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateScope {
    Session,
    #[default]
    Persistent,
}

impl std::fmt::Display for StateScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Session => write!(f, "session"),
            Self::Persistent => write!(f, "persistent"),
        }
    }
}

/// `store_as` accepts either a bare string key or `{key, scope}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoreAs {
    Key(String),
    Scoped { key: String, scope: StateScope },
}

impl StoreAs {
    pub fn key(&self) -> &str {
        match self {
            Self::Key(k) => k,
            Self::Scoped { key, .. } => key,
        }
    }

    pub fn scope(&self) -> StateScope {
        match self {
            Self::Key(_) => StateScope::Persistent,
            Self::Scoped { scope, .. } => *scope,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_as_forms() {
        let bare: StoreAs = serde_json::from_value(serde_json::json!("last_result")).unwrap();
        assert_eq!(bare.key(), "last_result");
        assert_eq!(bare.scope(), StateScope::Persistent);

        let scoped: StoreAs =
            serde_json::from_value(serde_json::json!({"key": "x", "scope": "session"})).unwrap();
        assert_eq!(scoped.key(), "x");
        assert_eq!(scoped.scope(), StateScope::Session);
    }

    #[test]
    fn test_missing_policy_default() {
        let shape: OutputShape = serde_json::from_value(serde_json::json!({"path": "a.b"})).unwrap();
        assert_eq!(shape.missing, MissingPolicy::Error);
    }
}
