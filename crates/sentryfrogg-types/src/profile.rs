use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

// ── Profile Kind ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    Postgresql,
    Ssh,
    Api,
    Vault,
}

impl std::fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgresql => write!(f, "postgresql"),
            Self::Ssh => write!(f, "ssh"),
            Self::Api => write!(f, "api"),
            Self::Vault => write!(f, "vault"),
        }
    }
}

impl std::str::FromStr for ProfileKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "postgresql" | "postgres" => Ok(Self::Postgresql),
            "ssh" => Ok(Self::Ssh),
            "api" | "http" => Ok(Self::Api),
            "vault" => Ok(Self::Vault),
            other => Err(format!("unknown profile type '{other}'")),
        }
    }
}

// ── Sealed Value (encrypted at rest) ─────────────────────────────

/// One AES-256-GCM sealed secret value. Each value carries its own nonce;
/// the GCM tag is part of `ciphertext` and is verified on open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedValue {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

// ── Profile (in-memory, decrypted) ───────────────────────────────

/// A named, typed bag of non-secret `data` and secret values for one backend.
/// `secrets` here is the decrypted form; it only exists in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub kind: ProfileKind,
    pub data: Map<String, Value>,
    pub secrets: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    /// Merge `data` and decrypted `secrets` into one flat config object.
    /// Secrets win on key collision.
    pub fn merged_config(&self) -> Map<String, Value> {
        let mut out = self.data.clone();
        for (k, v) in &self.secrets {
            out.insert(k.clone(), Value::String(v.clone()));
        }
        out
    }
}

// ── Stored Profile (on-disk) ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredProfile {
    #[serde(rename = "type")]
    pub kind: ProfileKind,
    pub data: Map<String, Value>,
    pub secrets: BTreeMap<String, SealedValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Profile Summary (listings, never plaintext secrets) ──────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProfileKind,
    pub secret_keys: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Project & Target Binding ─────────────────────────────────────

/// A project's named environment mapping profile roles to profile names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetBinding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postgres_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vault_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub default_target: String,
    pub targets: BTreeMap<String, TargetBinding>,
}

impl Project {
    /// Resolve a target binding by name, falling back to the default target.
    pub fn target(&self, name: Option<&str>) -> Option<&TargetBinding> {
        let key = name.unwrap_or(&self.default_target);
        self.targets.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse() {
        assert_eq!("postgres".parse::<ProfileKind>().unwrap(), ProfileKind::Postgresql);
        assert_eq!("http".parse::<ProfileKind>().unwrap(), ProfileKind::Api);
        assert!("ftp".parse::<ProfileKind>().is_err());
    }

    #[test]
    fn test_merged_config_secrets_win() {
        let mut data = Map::new();
        data.insert("host".into(), Value::String("db.example".into()));
        data.insert("password".into(), Value::String("stale".into()));
        let mut secrets = BTreeMap::new();
        secrets.insert("password".to_string(), "fresh".to_string());

        let p = Profile {
            name: "db".into(),
            kind: ProfileKind::Postgresql,
            data,
            secrets,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let merged = p.merged_config();
        assert_eq!(merged["host"], Value::String("db.example".into()));
        assert_eq!(merged["password"], Value::String("fresh".into()));
    }

    #[test]
    fn test_project_target_fallback() {
        let mut targets = BTreeMap::new();
        targets.insert("prod".to_string(), TargetBinding::default());
        let project = Project {
            name: "svc".into(),
            description: None,
            default_target: "prod".into(),
            targets,
        };
        assert!(project.target(None).is_some());
        assert!(project.target(Some("prod")).is_some());
        assert!(project.target(Some("staging")).is_none());
    }
}
