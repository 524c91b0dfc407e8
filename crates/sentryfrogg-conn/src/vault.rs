use async_trait::async_trait;
use sentryfrogg_store::ProfileStore;
use sentryfrogg_types::{ErrorCategory, Profile, ProfileKind, ToolError, ToolResult};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

// ── Vault KV v2 client ───────────────────────────────────────────
//
// Token reads with AppRole auto-login. The HTTP layer sits behind a
// transport trait so login/read sequences are testable without a
// live Vault.

const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RETRIES: u32 = 1;
const RETRY_DELAY_MS: u64 = 150;

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Value,
}

/// Minimal HTTP seam for the Vault API.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, req: TransportRequest) -> ToolResult<TransportResponse>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, req: TransportRequest) -> ToolResult<TransportResponse> {
        let method: reqwest::Method = req
            .method
            .parse()
            .map_err(|_| ToolError::internal(format!("invalid method {}", req.method)))?;

        let mut builder = self
            .client
            .request(method, &req.url)
            .timeout(Duration::from_millis(req.timeout_ms));
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ToolError::timeout(format!("vault request timed out: {e}")).with_code("vault_timeout")
            } else {
                ToolError::retryable(format!("vault request failed: {e}")).with_code("vault_unreachable")
            }
        })?;

        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(TransportResponse { status, body })
    }
}

// ── Options & reference parsing ──────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Kv2Options {
    pub version: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
}

/// `mount/path#key` → (mount, path, key?).
fn parse_kv2_ref(reference: &str) -> ToolResult<(String, String, Option<String>)> {
    let (path_part, key) = match reference.split_once('#') {
        Some((p, k)) if !k.is_empty() => (p, Some(k.to_string())),
        Some((p, _)) => (p, None),
        None => (reference, None),
    };
    let (mount, rest) = path_part.split_once('/').ok_or_else(|| {
        ToolError::invalid_params(format!("vault reference '{reference}' must be mount/path"))
            .with_code("secret_ref_shape")
    })?;
    if mount.is_empty() || rest.is_empty() {
        return Err(
            ToolError::invalid_params(format!("vault reference '{reference}' must be mount/path"))
                .with_code("secret_ref_shape"),
        );
    }
    Ok((mount.to_string(), rest.to_string(), key))
}

/// Strip trailing slashes and any query component from the address.
fn normalize_addr(addr: &str) -> String {
    let no_query = addr.split('?').next().unwrap_or(addr);
    no_query.trim_end_matches('/').to_string()
}

fn vault_error_message(body: &Value) -> Option<String> {
    let errors = body.get("errors")?.as_array()?;
    if errors.is_empty() {
        return None;
    }
    Some(
        errors
            .iter()
            .filter_map(|e| e.as_str())
            .collect::<Vec<_>>()
            .join("; "),
    )
}

// ── Client ───────────────────────────────────────────────────────

#[derive(Clone)]
pub struct VaultClient {
    transport: Arc<dyn HttpTransport>,
    profiles: ProfileStore,
}

impl VaultClient {
    pub fn new(profiles: ProfileStore) -> Self {
        Self {
            transport: Arc::new(ReqwestTransport::new()),
            profiles,
        }
    }

    pub fn with_transport(profiles: ProfileStore, transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport, profiles }
    }

    async fn profile(&self, name: &str) -> ToolResult<Profile> {
        Ok(self.profiles.get(name, Some(ProfileKind::Vault)).await?)
    }

    fn addr(profile: &Profile) -> ToolResult<String> {
        profile
            .data
            .get("addr")
            .and_then(|v| v.as_str())
            .map(normalize_addr)
            .ok_or_else(|| {
                ToolError::invalid_params(format!("vault profile '{}' has no addr", profile.name))
            })
    }

    fn headers(profile: &Profile, token: Option<&str>) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(token) = token {
            headers.push(("X-Vault-Token".to_string(), token.to_string()));
        }
        if let Some(ns) = profile.data.get("namespace").and_then(|v| v.as_str()) {
            headers.push(("X-Vault-Namespace".to_string(), ns.to_string()));
        }
        headers
    }

    /// Execute with bounded retries on transport-level failures.
    async fn call(&self, req: TransportRequest, retries: u32) -> ToolResult<TransportResponse> {
        let mut attempt = 0;
        loop {
            match self.transport.execute(req.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(err) if attempt < retries
                    && matches!(err.category, ErrorCategory::Retryable | ErrorCategory::Timeout) =>
                {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// AppRole login; persists the returned client token into the profile.
    async fn approle_login(&self, profile: &Profile, timeout_ms: u64, retries: u32) -> ToolResult<String> {
        let (role_id, secret_id) = match (
            profile.secrets.get("role_id"),
            profile.secrets.get("secret_id"),
        ) {
            (Some(r), Some(s)) => (r.clone(), s.clone()),
            _ => {
                return Err(ToolError::denied(format!(
                    "vault profile '{}' has no token and no AppRole credentials",
                    profile.name
                ))
                .with_code("vault_auth")
                .with_hint("store role_id and secret_id secrets, or a token"));
            }
        };

        let addr = Self::addr(profile)?;
        let response = self
            .call(
                TransportRequest {
                    method: "POST",
                    url: format!("{addr}/v1/auth/approle/login"),
                    headers: Self::headers(profile, None),
                    body: Some(json!({"role_id": role_id, "secret_id": secret_id})),
                    timeout_ms,
                },
                retries,
            )
            .await?;

        if response.status != 200 {
            let detail = vault_error_message(&response.body).unwrap_or_default();
            return Err(ToolError::denied(format!(
                "vault AppRole login failed with status {}: {detail}",
                response.status
            ))
            .with_code("vault_auth"));
        }

        let token = response
            .body
            .get("auth")
            .and_then(|a| a.get("client_token"))
            .and_then(|t| t.as_str())
            .ok_or_else(|| {
                ToolError::internal("vault login response had no auth.client_token")
                    .with_code("vault_auth")
            })?
            .to_string();

        self.profiles.set_secret(&profile.name, "token", &token).await?;
        Ok(token)
    }

    /// GET with token auth; performs AppRole login and retries exactly once
    /// when the token is missing or rejected with 401/403.
    async fn authed_get(&self, profile_name: &str, url_path: &str, opts: &Kv2Options) -> ToolResult<Value> {
        let timeout_ms = opts.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);
        let retries = opts.retries.unwrap_or(DEFAULT_RETRIES);

        let mut profile = self.profile(profile_name).await?;
        let addr = Self::addr(&profile)?;
        let url = format!("{addr}/v1/{url_path}");

        let has_approle =
            profile.secrets.contains_key("role_id") && profile.secrets.contains_key("secret_id");

        let mut token = match profile.secrets.get("token") {
            Some(t) => t.clone(),
            None if has_approle => {
                let t = self.approle_login(&profile, timeout_ms, retries).await?;
                profile.secrets.insert("token".to_string(), t.clone());
                t
            }
            None => {
                return Err(ToolError::denied(format!(
                    "vault profile '{profile_name}' has no token"
                ))
                .with_code("vault_auth"))
            }
        };

        let mut relogin_done = false;
        loop {
            let response = self
                .call(
                    TransportRequest {
                        method: "GET",
                        url: url.clone(),
                        headers: Self::headers(&profile, Some(&token)),
                        body: None,
                        timeout_ms,
                    },
                    retries,
                )
                .await?;

            match response.status {
                200 => return Ok(response.body),
                401 | 403 if has_approle && !relogin_done => {
                    tracing::debug!(profile = profile_name, "vault token rejected, re-logging in");
                    token = self.approle_login(&profile, timeout_ms, retries).await?;
                    relogin_done = true;
                }
                status => {
                    let detail = vault_error_message(&response.body).unwrap_or_default();
                    let category = ToolError::category_for_status(status);
                    return Err(ToolError::new(
                        category,
                        "vault_read",
                        format!("vault returned status {status}: {detail}"),
                    ));
                }
            }
        }
    }

    pub async fn sys_health(&self, profile_name: &str) -> ToolResult<Value> {
        let profile = self.profile(profile_name).await?;
        let addr = Self::addr(&profile)?;
        let response = self
            .call(
                TransportRequest {
                    method: "GET",
                    url: format!("{addr}/v1/sys/health"),
                    headers: Self::headers(&profile, None),
                    body: None,
                    timeout_ms: DEFAULT_TIMEOUT_MS,
                },
                DEFAULT_RETRIES,
            )
            .await?;
        Ok(json!({"status": response.status, "body": response.body}))
    }

    pub async fn token_lookup_self(&self, profile_name: &str) -> ToolResult<Value> {
        let body = self.authed_get(profile_name, "auth/token/lookup-self", &Kv2Options::default()).await?;
        Ok(body.get("data").cloned().unwrap_or(body))
    }

    /// Read `mount/path#key` from the KV v2 engine. Without `#key` the
    /// whole secret map is returned.
    pub async fn kv2_get(
        &self,
        profile_name: &str,
        reference: &str,
        opts: Kv2Options,
    ) -> ToolResult<Value> {
        let (mount, path, key) = parse_kv2_ref(reference)?;
        let mut url_path = format!("{mount}/data/{path}");
        if let Some(version) = opts.version {
            url_path.push_str(&format!("?version={version}"));
        }

        let body = self.authed_get(profile_name, &url_path, &opts).await?;
        let data = body
            .get("data")
            .and_then(|d| d.get("data"))
            .ok_or_else(|| {
                ToolError::internal(format!("vault read of '{reference}' returned no data.data"))
                    .with_code("secret_ref_shape")
            })?;

        match key {
            None => Ok(data.clone()),
            Some(key) => data.get(&key).cloned().ok_or_else(|| {
                ToolError::not_found(format!("key '{key}' not present in secret '{mount}/{path}'"))
                    .with_code("secret_ref_shape")
                    .with_hint("check the fragment after '#'")
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentryfrogg_store::crypto::MasterKey;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    // Scripted transport: answers requests in order and records them.
    struct ScriptedTransport {
        script: Mutex<Vec<TransportResponse>>,
        pub seen: Mutex<Vec<TransportRequest>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<TransportResponse>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(responses),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn execute(&self, req: TransportRequest) -> ToolResult<TransportResponse> {
            self.seen.lock().unwrap().push(req);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Err(ToolError::internal("scripted transport exhausted"));
            }
            Ok(script.remove(0))
        }
    }

    async fn vault_store(dir: &tempfile::TempDir, secrets: BTreeMap<String, String>) -> ProfileStore {
        let store = ProfileStore::open(dir.path().join("profiles.json"), MasterKey::new([1u8; 32]))
            .unwrap();
        let mut data = serde_json::Map::new();
        data.insert("addr".into(), json!("https://vault.example/"));
        store
            .set("vault", ProfileKind::Vault, data, secrets)
            .await
            .unwrap();
        store
    }

    fn kv2_body(key: &str, value: &str) -> Value {
        json!({"data": {"data": {key: value}}})
    }

    #[test]
    fn test_parse_kv2_ref() {
        let (mount, path, key) = parse_kv2_ref("secret/myapp/prod#DATABASE_URL").unwrap();
        assert_eq!(mount, "secret");
        assert_eq!(path, "myapp/prod");
        assert_eq!(key.as_deref(), Some("DATABASE_URL"));

        let (_, _, none) = parse_kv2_ref("kv/config").unwrap();
        assert!(none.is_none());

        assert!(parse_kv2_ref("no-slash").is_err());
    }

    #[test]
    fn test_normalize_addr() {
        assert_eq!(normalize_addr("https://v.example/"), "https://v.example");
        assert_eq!(normalize_addr("https://v.example/?ns=x"), "https://v.example");
    }

    #[tokio::test]
    async fn test_approle_auto_login_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut secrets = BTreeMap::new();
        secrets.insert("role_id".to_string(), "role-1".to_string());
        secrets.insert("secret_id".to_string(), "secret-1".to_string());
        let store = vault_store(&dir, secrets).await;

        let transport = ScriptedTransport::new(vec![
            TransportResponse {
                status: 200,
                body: json!({"auth": {"client_token": "token123"}}),
            },
            TransportResponse {
                status: 200,
                body: kv2_body("DATABASE_URL", "postgres://db"),
            },
        ]);
        let client = VaultClient::with_transport(store.clone(), transport.clone());

        let value = client
            .kv2_get("vault", "secret/myapp/prod#DATABASE_URL", Kv2Options::default())
            .await
            .unwrap();
        assert_eq!(value, json!("postgres://db"));

        // Exactly two calls: login then read, in that order.
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].url, "https://vault.example/v1/auth/approle/login");
        assert_eq!(seen[1].url, "https://vault.example/v1/secret/data/myapp/prod");

        // Token persisted into the profile.
        let profile = store.get("vault", None).await.unwrap();
        assert_eq!(profile.secrets["token"], "token123");
    }

    #[tokio::test]
    async fn test_expired_token_relogin_retries_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut secrets = BTreeMap::new();
        secrets.insert("token".to_string(), "badtoken".to_string());
        secrets.insert("role_id".to_string(), "role-1".to_string());
        secrets.insert("secret_id".to_string(), "secret-1".to_string());
        let store = vault_store(&dir, secrets).await;

        let transport = ScriptedTransport::new(vec![
            TransportResponse {
                status: 403,
                body: json!({"errors": ["permission denied"]}),
            },
            TransportResponse {
                status: 200,
                body: json!({"auth": {"client_token": "fresh"}}),
            },
            TransportResponse {
                status: 200,
                body: kv2_body("PASSWORD", "pw"),
            },
        ]);
        let client = VaultClient::with_transport(store.clone(), transport.clone());

        let value = client
            .kv2_get("vault", "secret/app#PASSWORD", Kv2Options::default())
            .await
            .unwrap();
        assert_eq!(value, json!("pw"));

        // read(bad), login, read(good)
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen[0].url.ends_with("/v1/secret/data/app"));
        assert!(seen[1].url.ends_with("/v1/auth/approle/login"));
        assert!(seen[2].url.ends_with("/v1/secret/data/app"));
        // Second read carries the fresh token
        assert!(seen[2]
            .headers
            .iter()
            .any(|(k, v)| k == "X-Vault-Token" && v == "fresh"));

        let profile = store.get("vault", None).await.unwrap();
        assert_eq!(profile.secrets["token"], "fresh");
    }

    #[tokio::test]
    async fn test_missing_key_is_shape_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut secrets = BTreeMap::new();
        secrets.insert("token".to_string(), "t".to_string());
        let store = vault_store(&dir, secrets).await;

        let transport = ScriptedTransport::new(vec![TransportResponse {
            status: 200,
            body: kv2_body("OTHER", "x"),
        }]);
        let client = VaultClient::with_transport(store, transport);

        let err = client
            .kv2_get("vault", "secret/app#MISSING", Kv2Options::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, "secret_ref_shape");
    }

    #[tokio::test]
    async fn test_no_token_no_approle_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let store = vault_store(&dir, BTreeMap::new()).await;
        let transport = ScriptedTransport::new(vec![]);
        let client = VaultClient::with_transport(store, transport);

        let err = client
            .kv2_get("vault", "secret/app#K", Kv2Options::default())
            .await
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::Denied);
    }
}
