use futures::future::BoxFuture;
use futures::FutureExt;
use regex::Regex;
use sentryfrogg_store::ProfileStore;
use sentryfrogg_types::{ProfileKind, ToolError, ToolResult};
use serde_json::Value;
use std::sync::OnceLock;

use crate::vault::{Kv2Options, VaultClient};

// ── Secret reference resolver ────────────────────────────────────
//
// Expands `ref:env:NAME` and `ref:vault:kv2:mount/path#key` anywhere
// inside a configuration value. Pure: always returns a new structure,
// and applying it to already-resolved output is the identity.

#[derive(Debug, Clone, Default)]
pub struct ResolveCtx {
    /// Vault profile named by the request or the project target binding.
    pub vault_profile: Option<String>,
}

fn ref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^ref:(env|vault):(.+)$").expect("ref regex"))
}

#[derive(Clone)]
pub struct SecretResolver {
    profiles: ProfileStore,
    vault: VaultClient,
}

impl SecretResolver {
    pub fn new(profiles: ProfileStore, vault: VaultClient) -> Self {
        Self { profiles, vault }
    }

    /// Resolve every reference in `value`, deeply. The input is never
    /// mutated.
    pub async fn resolve_deep(&self, value: &Value, ctx: &ResolveCtx) -> ToolResult<Value> {
        self.resolve_boxed(value, ctx).await
    }

    fn resolve_boxed<'a>(&'a self, value: &'a Value, ctx: &'a ResolveCtx) -> BoxFuture<'a, ToolResult<Value>> {
        async move {
            match value {
                Value::String(s) => self.resolve_string(s, ctx).await,
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.resolve_boxed(item, ctx).await?);
                    }
                    Ok(Value::Array(out))
                }
                Value::Object(map) => {
                    let mut out = serde_json::Map::with_capacity(map.len());
                    for (k, v) in map {
                        out.insert(k.clone(), self.resolve_boxed(v, ctx).await?);
                    }
                    Ok(Value::Object(out))
                }
                primitive => Ok(primitive.clone()),
            }
        }
        .boxed()
    }

    async fn resolve_string(&self, s: &str, ctx: &ResolveCtx) -> ToolResult<Value> {
        let Some(captures) = ref_pattern().captures(s) else {
            return Ok(Value::String(s.to_string()));
        };
        let scheme = &captures[1];
        let body = &captures[2];

        match scheme {
            "env" => match std::env::var(body) {
                Ok(v) => Ok(Value::String(v)),
                Err(_) => Err(ToolError::not_found(format!(
                    "secret reference 'ref:env:{body}' did not resolve"
                ))
                .with_code("secret_ref_unresolved")
                .with_hint(format!("set the environment variable {body}"))),
            },
            "vault" => {
                let reference = body.strip_prefix("kv2:").ok_or_else(|| {
                    ToolError::invalid_params(format!(
                        "vault reference 'ref:vault:{body}' must use the kv2 scheme"
                    ))
                    .with_code("secret_ref_shape")
                })?;

                let profile = match &ctx.vault_profile {
                    Some(name) => name.clone(),
                    None => self
                        .profiles
                        .singleton_of_kind(ProfileKind::Vault)
                        .await
                        .ok_or_else(|| {
                            ToolError::invalid_params(
                                "no vault profile named and no single default exists",
                            )
                            .with_code("secret_ref_unresolved")
                            .with_hint("pass vault_profile_name or create exactly one vault profile")
                        })?,
                };

                let resolved = self
                    .vault
                    .kv2_get(&profile, reference, Kv2Options::default())
                    .await?;
                match resolved {
                    Value::String(s) => Ok(Value::String(s)),
                    Value::Number(n) => Ok(Value::String(n.to_string())),
                    Value::Bool(b) => Ok(Value::String(b.to_string())),
                    other => Err(ToolError::invalid_params(format!(
                        "vault reference 'ref:vault:{body}' resolved to non-scalar {}",
                        kind_name(&other)
                    ))
                    .with_code("secret_ref_shape")
                    .with_hint("append '#key' to select one field")),
                }
            }
            _ => unreachable!("regex only admits env|vault"),
        }
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentryfrogg_store::crypto::MasterKey;
    use serde_json::json;

    fn resolver(dir: &tempfile::TempDir) -> SecretResolver {
        let store = ProfileStore::open(dir.path().join("profiles.json"), MasterKey::new([1u8; 32]))
            .unwrap();
        let vault = VaultClient::new(store.clone());
        SecretResolver::new(store, vault)
    }

    #[tokio::test]
    async fn test_env_reference() {
        std::env::set_var("SF_RESOLVER_TEST_VAR", "resolved-value");
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(&dir);

        let input = json!({"password": "ref:env:SF_RESOLVER_TEST_VAR", "host": "db"});
        let out = r.resolve_deep(&input, &ResolveCtx::default()).await.unwrap();
        assert_eq!(out["password"], json!("resolved-value"));
        assert_eq!(out["host"], json!("db"));
        // caller's structure untouched
        assert_eq!(input["password"], json!("ref:env:SF_RESOLVER_TEST_VAR"));
    }

    #[tokio::test]
    async fn test_missing_env_names_variable() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(&dir);
        let err = r
            .resolve_deep(&json!("ref:env:SF_DEFINITELY_UNSET_VAR"), &ResolveCtx::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, "secret_ref_unresolved");
        assert!(err.hint.unwrap().contains("SF_DEFINITELY_UNSET_VAR"));
    }

    #[tokio::test]
    async fn test_idempotent() {
        std::env::set_var("SF_RESOLVER_IDEM", "x");
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(&dir);

        let input = json!({"a": ["ref:env:SF_RESOLVER_IDEM", 1, null], "b": {"c": true}});
        let once = r.resolve_deep(&input, &ResolveCtx::default()).await.unwrap();
        let twice = r.resolve_deep(&once, &ResolveCtx::default()).await.unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_non_ref_strings_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(&dir);
        let input = json!("refinery: not a reference");
        let out = r.resolve_deep(&input, &ResolveCtx::default()).await.unwrap();
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn test_vault_ref_requires_kv2() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(&dir);
        let err = r
            .resolve_deep(&json!("ref:vault:kv1:secret/app#k"), &ResolveCtx::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, "secret_ref_shape");
    }
}
