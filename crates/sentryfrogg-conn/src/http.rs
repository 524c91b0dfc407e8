use base64::Engine;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use sentryfrogg_store::{CacheStore, ProfileStore};
use sentryfrogg_types::{ProfileKind, ToolError, ToolResult};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

use crate::resolver::{ResolveCtx, SecretResolver};
use crate::{canonical_json, env_bytes, env_ms};

// ── HTTP manager ─────────────────────────────────────────────────
//
// Profile-backed requests with auth providers, retry/backoff honoring
// Retry-After, bounded streaming body capture, pagination, response
// caching and atomic downloads.

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CAPTURE_BYTES: usize = 256 * 1024;
const DEFAULT_TOKEN_BUFFER_MS: u64 = 30_000;
const DEFAULT_MAX_PAGES: u32 = 10;
const DEFAULT_PAGE_SIZE: u64 = 100;

// ── Retry policy ─────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
    pub jitter: f64,
    pub methods: Vec<String>,
    pub statuses: Vec<u16>,
    pub respect_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_ms: 250,
            max_delay_ms: 5_000,
            factor: 2.0,
            jitter: 0.2,
            // POST/PATCH are excluded by default; callers opt in explicitly.
            methods: ["GET", "HEAD", "PUT", "DELETE", "OPTIONS"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            statuses: vec![408, 429, 500, 502, 503, 504],
            respect_retry_after: true,
        }
    }
}

impl RetryPolicy {
    fn method_eligible(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    fn status_eligible(&self, status: u16) -> bool {
        self.statuses.contains(&status)
    }

    /// `min(max_delay, base × factor^(attempt−1))` with jitter `[1−j, 1+j]`.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_ms as f64 * self.factor.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.max_delay_ms as f64);
        let jitter = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_millis((capped * jitter).max(0.0) as u64)
    }
}

/// Parse a `Retry-After` header: either delay-seconds or an HTTP date.
fn parse_retry_after(raw: &str) -> Option<Duration> {
    if let Ok(secs) = raw.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = chrono::DateTime::parse_from_rfc2822(raw.trim()).ok()?;
    let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
    delta.to_std().ok()
}

// ── Auth providers ───────────────────────────────────────────────

#[derive(Debug, Clone)]
enum AuthApplied {
    None,
    Basic { username: String, password: String },
    Header { name: String, value: String },
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Option<tokio::time::Instant>,
}

// ── Request arguments ────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct RequestArgs {
    pub profile_name: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    pub url: Option<String>,
    pub path: Option<String>,
    pub headers: Option<Map<String, Value>>,
    pub query: Option<Map<String, Value>>,
    pub body: Option<Value>,
    #[serde(default)]
    pub response_type: ResponseType,
    #[serde(default)]
    pub require_complete: bool,
    pub timeout_ms: Option<u64>,
    pub retry: Option<RetryPolicy>,
    pub cache_ttl_ms: Option<u64>,
    pub max_capture_bytes: Option<usize>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Default for RequestArgs {
    fn default() -> Self {
        Self {
            profile_name: None,
            method: default_method(),
            url: None,
            path: None,
            headers: None,
            query: None,
            body: None,
            response_type: ResponseType::default(),
            require_complete: false,
            timeout_ms: None,
            retry: None,
            cache_ttl_ms: None,
            max_capture_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    #[default]
    Auto,
    Json,
    Text,
    Bytes,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaginationSpec {
    #[serde(rename = "type")]
    pub kind: PaginationKind,
    pub param: Option<String>,
    pub size_param: Option<String>,
    pub size: Option<u64>,
    pub cursor_path: Option<String>,
    pub items_path: Option<String>,
    pub max_pages: Option<u32>,
    #[serde(default = "default_true")]
    pub stop_on_empty: bool,
    #[serde(default = "default_true")]
    pub strict: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationKind {
    Page,
    Offset,
    Cursor,
    Link,
}

// ── Manager ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ApiManager {
    client: reqwest::Client,
    profiles: ProfileStore,
    resolver: SecretResolver,
    cache: CacheStore,
    token_cache: Arc<AsyncMutex<HashMap<String, CachedToken>>>,
}

impl ApiManager {
    pub fn new(profiles: ProfileStore, resolver: SecretResolver, cache: CacheStore) -> Self {
        let manager = Self {
            client: reqwest::Client::new(),
            profiles: profiles.clone(),
            resolver,
            cache,
            token_cache: Arc::new(AsyncMutex::new(HashMap::new())),
        };
        // Dropping/replacing a profile invalidates its cached token.
        let tokens = manager.token_cache.clone();
        profiles.on_change(Box::new(move |name| {
            if let Ok(mut cache) = tokens.try_lock() {
                cache.remove(name);
            }
        }));
        manager
    }

    async fn profile_config(&self, name: &str, ctx: &ResolveCtx) -> ToolResult<Value> {
        let profile = self.profiles.get(name, Some(ProfileKind::Api)).await?;
        let merged = Value::Object(profile.merged_config());
        self.resolver.resolve_deep(&merged, ctx).await
    }

    fn build_url(config: Option<&Value>, args: &RequestArgs) -> ToolResult<String> {
        if let Some(url) = &args.url {
            return Ok(url.clone());
        }
        let path = args.path.as_deref().ok_or_else(|| {
            ToolError::invalid_params("either url or path is required")
        })?;
        let base = config
            .and_then(|c| c.get("base_url"))
            .and_then(|b| b.as_str())
            .ok_or_else(|| {
                ToolError::invalid_params("path given but the profile has no base_url")
            })?;
        Ok(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        ))
    }

    // ── Auth resolution ──────────────────────────────────────────

    async fn resolve_auth(
        &self,
        profile_name: &str,
        config: &Value,
    ) -> ToolResult<AuthApplied> {
        let Some(auth) = config.get("auth").and_then(|a| a.as_object()) else {
            return Ok(AuthApplied::None);
        };
        let kind = auth.get("kind").and_then(|k| k.as_str()).unwrap_or("bearer");

        if kind == "basic" {
            let username = auth
                .get("username")
                .or_else(|| config.get("username"))
                .and_then(|u| u.as_str())
                .ok_or_else(|| ToolError::invalid_params("basic auth needs a username"))?;
            let password = auth
                .get("password")
                .or_else(|| config.get("password"))
                .and_then(|p| p.as_str())
                .unwrap_or("");
            return Ok(AuthApplied::Basic {
                username: username.to_string(),
                password: password.to_string(),
            });
        }

        let token = self.provider_token(profile_name, config, auth).await?;
        Ok(match kind {
            "raw" => AuthApplied::Header {
                name: "Authorization".to_string(),
                value: token,
            },
            "header" => {
                let name = auth
                    .get("header")
                    .and_then(|h| h.as_str())
                    .unwrap_or("Authorization");
                let prefix = auth.get("prefix").and_then(|p| p.as_str()).unwrap_or("");
                AuthApplied::Header {
                    name: name.to_string(),
                    value: format!("{prefix}{token}"),
                }
            }
            // bearer (default)
            _ => AuthApplied::Header {
                name: "Authorization".to_string(),
                value: format!("Bearer {token}"),
            },
        })
    }

    async fn provider_token(
        &self,
        profile_name: &str,
        config: &Value,
        auth: &Map<String, Value>,
    ) -> ToolResult<String> {
        let provider = auth
            .get("provider")
            .and_then(|p| p.as_str())
            .unwrap_or("static");

        match provider {
            "static" => auth
                .get("token")
                .or_else(|| config.get("token"))
                .and_then(|t| t.as_str())
                .map(String::from)
                .ok_or_else(|| {
                    ToolError::invalid_params(format!(
                        "api profile '{profile_name}' has no token for static auth"
                    ))
                }),
            "exec" => self.exec_token(profile_name, auth).await,
            "oauth2" => self.oauth2_token(profile_name, config, auth).await,
            other => Err(ToolError::invalid_params(format!(
                "unknown auth provider '{other}'"
            ))),
        }
    }

    /// Run a local command and parse the token from its stdout.
    async fn exec_token(&self, profile_name: &str, auth: &Map<String, Value>) -> ToolResult<String> {
        if let Some(token) = self.cached_token(profile_name).await {
            return Ok(token);
        }

        let command = auth
            .get("command")
            .and_then(|c| c.as_str())
            .ok_or_else(|| ToolError::invalid_params("exec auth provider needs a command"))?;

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| ToolError::internal(format!("auth command failed to start: {e}")))?;
        if !output.status.success() {
            return Err(ToolError::denied(format!(
                "auth command exited with {}",
                output.status
            ))
            .with_code("auth_exec"));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);

        let parse = auth.get("parse").and_then(|p| p.as_str()).unwrap_or("raw");
        let token = match parse {
            "json" => {
                let parsed: Value = serde_json::from_str(stdout.trim()).map_err(|e| {
                    ToolError::internal(format!("auth command output is not JSON: {e}"))
                })?;
                let path = auth
                    .get("token_path")
                    .and_then(|p| p.as_str())
                    .unwrap_or("token");
                sentryfrogg_types::path::get_path(&parsed, path)
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .ok_or_else(|| {
                        ToolError::internal(format!(
                            "token_path '{path}' not found in auth command output"
                        ))
                    })?
            }
            _ => stdout.trim().to_string(),
        };

        if let Some(ttl) = auth.get("cache_ttl_ms").and_then(|t| t.as_u64()) {
            self.store_token(profile_name, &token, Some(ttl)).await;
        }
        Ok(token)
    }

    /// client_credentials / refresh_token grant with expiry-aware caching.
    async fn oauth2_token(
        &self,
        profile_name: &str,
        config: &Value,
        auth: &Map<String, Value>,
    ) -> ToolResult<String> {
        if let Some(token) = self.cached_token(profile_name).await {
            return Ok(token);
        }

        let token_url = auth
            .get("token_url")
            .and_then(|u| u.as_str())
            .ok_or_else(|| ToolError::invalid_params("oauth2 provider needs token_url"))?;
        let grant_type = auth
            .get("grant_type")
            .and_then(|g| g.as_str())
            .unwrap_or("client_credentials");

        let mut form: Vec<(String, String)> = vec![("grant_type".to_string(), grant_type.to_string())];
        for field in ["client_id", "client_secret", "scope", "refresh_token", "audience"] {
            if let Some(value) = auth
                .get(field)
                .or_else(|| config.get(field))
                .and_then(|v| v.as_str())
            {
                form.push((field.to_string(), value.to_string()));
            }
        }

        let response = self
            .client
            .post(token_url)
            .form(&form)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .send()
            .await
            .map_err(|e| ToolError::retryable(format!("token request failed: {e}")).with_code("auth_oauth2"))?;

        let status = response.status().as_u16();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if status != 200 {
            return Err(ToolError::new(
                ToolError::category_for_status(status),
                "auth_oauth2",
                format!("token endpoint returned {status}"),
            ));
        }

        let token = body
            .get("access_token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ToolError::internal("token response had no access_token").with_code("auth_oauth2"))?
            .to_string();

        let buffer_ms = auth
            .get("buffer_ms")
            .and_then(|b| b.as_u64())
            .unwrap_or(DEFAULT_TOKEN_BUFFER_MS);
        let ttl = body
            .get("expires_in")
            .and_then(|e| e.as_u64())
            .map(|secs| (secs * 1000).saturating_sub(buffer_ms));
        self.store_token(profile_name, &token, ttl).await;
        Ok(token)
    }

    async fn cached_token(&self, profile_name: &str) -> Option<String> {
        let mut cache = self.token_cache.lock().await;
        match cache.get(profile_name) {
            Some(cached) => match cached.expires_at {
                Some(at) if tokio::time::Instant::now() >= at => {
                    cache.remove(profile_name);
                    None
                }
                _ => Some(cached.value.clone()),
            },
            None => None,
        }
    }

    async fn store_token(&self, profile_name: &str, token: &str, ttl_ms: Option<u64>) {
        let mut cache = self.token_cache.lock().await;
        cache.insert(
            profile_name.to_string(),
            CachedToken {
                value: token.to_string(),
                expires_at: ttl_ms.map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms)),
            },
        );
    }

    // ── Core request ─────────────────────────────────────────────

    fn cache_key(method: &str, url: &str, headers: &Value, body: &Value) -> String {
        let canonical = canonical_json(&json!({
            "method": method.to_uppercase(),
            "url": url,
            "headers": headers,
            "body": body,
        }));
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }

    async fn send_once(
        &self,
        method: &reqwest::Method,
        url: &str,
        headers: &HeaderMap,
        auth: &AuthApplied,
        query: Option<&Map<String, Value>>,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self
            .client
            .request(method.clone(), url)
            .headers(headers.clone())
            .timeout(timeout);

        match auth {
            AuthApplied::None => {}
            AuthApplied::Basic { username, password } => {
                request = request.basic_auth(username, Some(password));
            }
            AuthApplied::Header { name, value } => {
                request = request.header(name, value);
            }
        }
        if let Some(query) = query {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(k, v)| (k.clone(), value_to_query(v)))
                .collect();
            request = request.query(&pairs);
        }
        if let Some(body) = body {
            request = match body {
                Value::String(text) => request.body(text.clone()),
                other => request.json(other),
            };
        }
        request.send().await
    }

    /// Execute one request with the retry loop; the body is left unread.
    async fn execute(
        &self,
        config: Option<&Value>,
        args: &RequestArgs,
        url: &str,
    ) -> ToolResult<reqwest::Response> {
        let method: reqwest::Method = args
            .method
            .to_uppercase()
            .parse()
            .map_err(|_| ToolError::invalid_params(format!("invalid HTTP method '{}'", args.method)))?;

        let mut headers = HeaderMap::new();
        if let Some(defaults) = config
            .and_then(|c| c.get("headers"))
            .and_then(|h| h.as_object())
        {
            insert_headers(&mut headers, defaults)?;
        }
        if let Some(extra) = &args.headers {
            insert_headers(&mut headers, extra)?;
        }

        let auth = match (config, &args.profile_name) {
            (Some(config), Some(name)) => self.resolve_auth(name, config).await?,
            _ => AuthApplied::None,
        };

        let retry = args
            .retry
            .clone()
            .or_else(|| {
                config
                    .and_then(|c| c.get("retry"))
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
            })
            .unwrap_or_default();
        let timeout = Duration::from_millis(
            args.timeout_ms
                .unwrap_or_else(|| env_ms("HTTP_TIMEOUT_MS", DEFAULT_TIMEOUT_MS)),
        );

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = self
                .send_once(
                    &method,
                    url,
                    &headers,
                    &auth,
                    args.query.as_ref(),
                    args.body.as_ref(),
                    timeout,
                )
                .await;

            let can_retry = attempt < retry.max_attempts && retry.method_eligible(method.as_str());
            match result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if can_retry && retry.status_eligible(status) {
                        let mut delay = retry.delay_for(attempt);
                        if retry.respect_retry_after {
                            if let Some(after) = response
                                .headers()
                                .get("retry-after")
                                .and_then(|v| v.to_str().ok())
                                .and_then(parse_retry_after)
                            {
                                delay = delay.max(after);
                            }
                        }
                        tracing::debug!(url, status, attempt, delay_ms = delay.as_millis() as u64, "retrying request");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) if can_retry => {
                    tokio::time::sleep(retry.delay_for(attempt)).await;
                    tracing::debug!(url, attempt, error = %err, "retrying after network error");
                }
                Err(err) => {
                    return Err(if err.is_timeout() {
                        ToolError::timeout(format!("request to {url} timed out")).with_code("http_timeout")
                    } else {
                        ToolError::retryable(format!("request to {url} failed: {err}"))
                            .with_code("http_network")
                    });
                }
            }
        }
    }

    /// Read the body through a bounded capture buffer, reporting totals.
    async fn read_body(
        &self,
        response: reqwest::Response,
        cap: usize,
    ) -> ToolResult<(u16, Map<String, Value>, Vec<u8>, u64, bool)> {
        let status = response.status().as_u16();
        let mut headers = Map::new();
        for (name, value) in response.headers() {
            headers.insert(
                name.to_string(),
                Value::String(value.to_str().unwrap_or_default().to_string()),
            );
        }

        let mut response = response;
        let mut captured: Vec<u8> = Vec::new();
        let mut total: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ToolError::retryable(format!("failed to read response body: {e}")).with_code("http_body"))?
        {
            total += chunk.len() as u64;
            let room = cap.saturating_sub(captured.len());
            captured.extend_from_slice(&chunk[..room.min(chunk.len())]);
        }

        let truncated = total > captured.len() as u64;
        Ok((status, headers, captured, total, truncated))
    }

    fn shape_body(
        args: &RequestArgs,
        headers: &Map<String, Value>,
        captured: &[u8],
        truncated: bool,
    ) -> ToolResult<(Value, bool)> {
        let content_type = headers
            .get("content-type")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        let want_json = match args.response_type {
            ResponseType::Json => true,
            ResponseType::Auto => content_type.contains("json"),
            _ => false,
        };

        if args.response_type == ResponseType::Bytes {
            return Ok((
                json!(base64::engine::general_purpose::STANDARD.encode(captured)),
                false,
            ));
        }

        let text = String::from_utf8_lossy(captured).into_owned();
        if want_json {
            if truncated {
                if args.require_complete {
                    return Err(ToolError::retryable(
                        "response body exceeded the capture limit and require_complete is set",
                    )
                    .with_code("http_truncated")
                    .with_hint("raise max_capture_bytes or stream via download"));
                }
                // Degrade to text; the caller sees data_truncated.
                return Ok((Value::String(text), true));
            }
            match serde_json::from_str::<Value>(&text) {
                Ok(parsed) => return Ok((parsed, false)),
                Err(_) if args.response_type == ResponseType::Auto => {
                    return Ok((Value::String(text), false))
                }
                Err(e) => {
                    return Err(ToolError::invalid_params(format!("response is not valid JSON: {e}"))
                        .with_code("http_body"))
                }
            }
        }
        Ok((Value::String(text), false))
    }

    // ── Public operations ────────────────────────────────────────

    pub async fn request(&self, args: &RequestArgs, ctx: &ResolveCtx) -> ToolResult<Value> {
        let config = match &args.profile_name {
            Some(name) => Some(self.profile_config(name, ctx).await?),
            None => None,
        };
        let url = Self::build_url(config.as_ref(), args)?;

        let cache_key = args.cache_ttl_ms.map(|_| {
            Self::cache_key(
                &args.method,
                &url,
                &args.headers.clone().map(Value::Object).unwrap_or(Value::Null),
                &args.body.clone().unwrap_or(Value::Null),
            )
        });
        if let Some(key) = &cache_key {
            if let Some(envelope) = self.cache.get(key)? {
                if let Some(mut value) = envelope.value {
                    if let Some(obj) = value.as_object_mut() {
                        obj.insert("from_cache".to_string(), json!(true));
                    }
                    return Ok(value);
                }
            }
        }

        let response = self.execute(config.as_ref(), args, &url).await?;
        let cap = args
            .max_capture_bytes
            .unwrap_or_else(|| env_bytes("HTTP_MAX_CAPTURE_BYTES", DEFAULT_CAPTURE_BYTES));
        let (status, headers, captured, total, truncated) = self.read_body(response, cap).await?;
        let (data, data_truncated) = Self::shape_body(args, &headers, &captured, truncated)?;

        let mut result = json!({
            "status": status,
            "headers": headers,
            "data": data,
            "body_truncated": truncated,
            "body_read_bytes": total,
            "body_captured_bytes": captured.len(),
        });
        if data_truncated {
            result["data_truncated"] = json!(true);
        }

        if let (Some(key), Some(ttl)) = (&cache_key, args.cache_ttl_ms) {
            self.cache
                .put_json(key, result.clone(), ttl, json!({"url": url, "method": args.method}))?;
        }
        Ok(result)
    }

    /// Issue a raw request and hand back the unread response for streaming
    /// consumers (pipelines, downloads).
    pub async fn request_streaming(
        &self,
        args: &RequestArgs,
        ctx: &ResolveCtx,
    ) -> ToolResult<reqwest::Response> {
        let config = match &args.profile_name {
            Some(name) => Some(self.profile_config(name, ctx).await?),
            None => None,
        };
        let url = Self::build_url(config.as_ref(), args)?;
        self.execute(config.as_ref(), args, &url).await
    }

    pub async fn paginate(
        &self,
        args: &RequestArgs,
        spec: &PaginationSpec,
        ctx: &ResolveCtx,
    ) -> ToolResult<Value> {
        let config = match &args.profile_name {
            Some(name) => Some(self.profile_config(name, ctx).await?),
            None => None,
        };
        let base_url = Self::build_url(config.as_ref(), args)?;
        let max_pages = spec.max_pages.unwrap_or(DEFAULT_MAX_PAGES);
        let size = spec.size.unwrap_or(DEFAULT_PAGE_SIZE);
        let cap = args
            .max_capture_bytes
            .unwrap_or_else(|| env_bytes("HTTP_MAX_CAPTURE_BYTES", DEFAULT_CAPTURE_BYTES));

        let mut items: Vec<Value> = Vec::new();
        let mut pages: u32 = 0;
        let mut cursor: Option<String> = None;
        let mut next_url: Option<String> = None;
        let mut last_status: u16 = 0;

        while pages < max_pages {
            let mut page_args = args.clone();
            let mut url = base_url.clone();
            let mut query = args.query.clone().unwrap_or_default();

            match spec.kind {
                PaginationKind::Page => {
                    let param = spec.param.as_deref().unwrap_or("page");
                    let size_param = spec.size_param.as_deref().unwrap_or("per_page");
                    query.insert(param.to_string(), json!(pages as u64 + 1));
                    query.insert(size_param.to_string(), json!(size));
                }
                PaginationKind::Offset => {
                    let param = spec.param.as_deref().unwrap_or("offset");
                    let size_param = spec.size_param.as_deref().unwrap_or("limit");
                    query.insert(param.to_string(), json!(pages as u64 * size));
                    query.insert(size_param.to_string(), json!(size));
                }
                PaginationKind::Cursor => {
                    let param = spec.param.as_deref().unwrap_or("cursor");
                    if let Some(size_param) = spec.size_param.as_deref() {
                        query.insert(size_param.to_string(), json!(size));
                    }
                    if let Some(cursor) = &cursor {
                        query.insert(param.to_string(), json!(cursor));
                    }
                }
                PaginationKind::Link => {
                    if let Some(next) = &next_url {
                        url = next.clone();
                        query.clear();
                    }
                }
            }

            page_args.query = if query.is_empty() { None } else { Some(query) };
            let response = self.execute(config.as_ref(), &page_args, &url).await?;
            let (status, headers, captured, _total, truncated) =
                self.read_body(response, cap).await?;
            last_status = status;
            pages += 1;

            if !(200..300).contains(&status) {
                if spec.strict {
                    return Err(ToolError::new(
                        ToolError::category_for_status(status),
                        "http_paginate",
                        format!("page {pages} returned status {status}"),
                    ));
                }
                break;
            }
            if truncated {
                return Err(ToolError::retryable("page body exceeded the capture limit")
                    .with_code("http_truncated")
                    .with_hint("raise max_capture_bytes or reduce page size"));
            }

            let parsed: Value = serde_json::from_slice(&captured)
                .map_err(|e| ToolError::invalid_params(format!("page {pages} is not JSON: {e}")))?;

            let page_items: Vec<Value> = match &spec.items_path {
                Some(path) => sentryfrogg_types::path::get_path(&parsed, path)
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default(),
                None => match &parsed {
                    Value::Array(items) => items.clone(),
                    _ => vec![parsed.clone()],
                },
            };
            let empty = page_items.is_empty();
            items.extend(page_items);

            if empty && spec.stop_on_empty {
                break;
            }

            match spec.kind {
                PaginationKind::Cursor => {
                    let path = spec.cursor_path.as_deref().ok_or_else(|| {
                        ToolError::invalid_params("cursor pagination requires cursor_path")
                    })?;
                    match sentryfrogg_types::path::get_path(&parsed, path) {
                        Some(Value::String(next)) if !next.is_empty() => {
                            cursor = Some(next.clone());
                        }
                        Some(Value::Number(next)) => cursor = Some(next.to_string()),
                        _ => break,
                    }
                }
                PaginationKind::Link => {
                    match headers
                        .get("link")
                        .and_then(|v| v.as_str())
                        .and_then(parse_link_next)
                    {
                        Some(next) => next_url = Some(next),
                        None => break,
                    }
                }
                _ => {}
            }
        }

        Ok(json!({
            "items": items,
            "item_count": items.len(),
            "pages": pages,
            "last_status": last_status,
        }))
    }

    /// Stream a response body to `target`, staged through `.part` and
    /// atomically renamed with 0600 permissions.
    pub async fn download(
        &self,
        args: &RequestArgs,
        target: &std::path::Path,
        overwrite: bool,
        ctx: &ResolveCtx,
    ) -> ToolResult<Value> {
        if !overwrite && target.exists() {
            return Err(ToolError::conflict(format!(
                "target '{}' exists; pass overwrite=true to replace it",
                target.display()
            ))
            .with_code("download_exists"));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::internal(format!("mkdir failed: {e}")))?;
        }

        let response = self.request_streaming(args, ctx).await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(ToolError::new(
                ToolError::category_for_status(status),
                "http_download",
                format!("download returned status {status}"),
            ));
        }

        let part = target.with_extension("part");
        let mut file = {
            let mut opts = tokio::fs::OpenOptions::new();
            opts.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                opts.mode(0o600);
            }
            opts.open(&part)
                .await
                .map_err(|e| ToolError::internal(format!("cannot create {}: {e}", part.display())))?
        };

        let mut response = response;
        let mut bytes: u64 = 0;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    tokio::io::AsyncWriteExt::write_all(&mut file, &chunk)
                        .await
                        .map_err(|e| ToolError::internal(format!("write failed: {e}")))?;
                    bytes += chunk.len() as u64;
                }
                Ok(None) => break,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&part).await;
                    return Err(ToolError::retryable(format!("download stream failed: {e}"))
                        .with_code("http_body"));
                }
            }
        }
        file.sync_all()
            .await
            .map_err(|e| ToolError::internal(format!("fsync failed: {e}")))?;
        drop(file);
        tokio::fs::rename(&part, target)
            .await
            .map_err(|e| ToolError::internal(format!("rename failed: {e}")))?;

        Ok(json!({
            "path": target.display().to_string(),
            "bytes": bytes,
            "status": status,
        }))
    }

    /// Send a request whose body arrives as a stream. No retry loop:
    /// streaming bodies are not replayable.
    pub async fn send_body_stream(
        &self,
        args: &RequestArgs,
        body: reqwest::Body,
        ctx: &ResolveCtx,
    ) -> ToolResult<Value> {
        let config = match &args.profile_name {
            Some(name) => Some(self.profile_config(name, ctx).await?),
            None => None,
        };
        let url = Self::build_url(config.as_ref(), args)?;
        let method: reqwest::Method = args
            .method
            .to_uppercase()
            .parse()
            .map_err(|_| ToolError::invalid_params(format!("invalid HTTP method '{}'", args.method)))?;

        let mut headers = HeaderMap::new();
        if let Some(defaults) = config
            .as_ref()
            .and_then(|c| c.get("headers"))
            .and_then(|h| h.as_object())
        {
            insert_headers(&mut headers, defaults)?;
        }
        if let Some(extra) = &args.headers {
            insert_headers(&mut headers, extra)?;
        }
        let auth = match (&config, &args.profile_name) {
            (Some(config), Some(name)) => self.resolve_auth(name, config).await?,
            _ => AuthApplied::None,
        };

        let mut request = self
            .client
            .request(method, &url)
            .headers(headers)
            .timeout(Duration::from_millis(
                args.timeout_ms
                    .unwrap_or_else(|| env_ms("HTTP_TIMEOUT_MS", DEFAULT_TIMEOUT_MS)),
            ))
            .body(body);
        match &auth {
            AuthApplied::None => {}
            AuthApplied::Basic { username, password } => {
                request = request.basic_auth(username, Some(password));
            }
            AuthApplied::Header { name, value } => {
                request = request.header(name, value);
            }
        }
        if let Some(query) = &args.query {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(k, v)| (k.clone(), value_to_query(v)))
                .collect();
            request = request.query(&pairs);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ToolError::timeout(format!("request to {url} timed out")).with_code("http_timeout")
            } else {
                ToolError::retryable(format!("request to {url} failed: {e}")).with_code("http_network")
            }
        })?;

        let cap = args
            .max_capture_bytes
            .unwrap_or_else(|| env_bytes("HTTP_MAX_CAPTURE_BYTES", DEFAULT_CAPTURE_BYTES));
        let (status, headers, captured, total, truncated) = self.read_body(response, cap).await?;
        let (data, _) = Self::shape_body(args, &headers, &captured, truncated)?;
        Ok(json!({
            "status": status,
            "headers": headers,
            "data": data,
            "body_truncated": truncated,
            "body_read_bytes": total,
            "body_captured_bytes": captured.len(),
        }))
    }

    /// Reachability probe: HEAD (with GET fallback on 405).
    pub async fn check(&self, args: &RequestArgs, ctx: &ResolveCtx) -> ToolResult<Value> {
        let started = std::time::Instant::now();
        let mut head_args = args.clone();
        head_args.method = "HEAD".to_string();

        let mut response = self.request_streaming(&head_args, ctx).await?;
        if response.status().as_u16() == 405 {
            let mut get_args = args.clone();
            get_args.method = "GET".to_string();
            response = self.request_streaming(&get_args, ctx).await?;
        }
        let status = response.status().as_u16();
        Ok(json!({
            "ok": (200..400).contains(&status),
            "status": status,
            "latency_ms": started.elapsed().as_millis() as u64,
        }))
    }
}

fn insert_headers(headers: &mut HeaderMap, source: &Map<String, Value>) -> ToolResult<()> {
    for (name, value) in source {
        let Some(value) = value.as_str() else { continue };
        let header_name = HeaderName::try_from(name.as_str())
            .map_err(|e| ToolError::invalid_params(format!("invalid header name '{name}': {e}")))?;
        let header_value = HeaderValue::try_from(value)
            .map_err(|e| ToolError::invalid_params(format!("invalid header value for '{name}': {e}")))?;
        headers.insert(header_name, header_value);
    }
    Ok(())
}

fn value_to_query(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Extract the `rel="next"` target from a Link header.
fn parse_link_next(header: &str) -> Option<String> {
    for part in header.split(',') {
        let part = part.trim();
        let (url_part, params) = part.split_once(';')?;
        if params.contains("rel=\"next\"") || params.contains("rel=next") {
            let url = url_part.trim().trim_start_matches('<').trim_end_matches('>');
            return Some(url.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentryfrogg_types::ErrorCategory;

    #[test]
    fn test_retry_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.method_eligible("get"));
        assert!(policy.method_eligible("DELETE"));
        assert!(!policy.method_eligible("POST"));
        assert!(policy.status_eligible(503));
        assert!(!policy.status_eligible(404));
    }

    #[test]
    fn test_delay_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 1..=6 {
            let delay = policy.delay_for(attempt).as_millis() as f64;
            // max_delay plus jitter headroom
            assert!(delay <= 5000.0 * 1.2 + 1.0, "attempt {attempt}: {delay}");
        }
        // first attempt stays near the base
        let first = policy.delay_for(1).as_millis() as f64;
        assert!((200.0..=300.0).contains(&first), "{first}");
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::from_secs(0)));
        assert!(parse_retry_after("not-a-date").is_none());
    }

    #[test]
    fn test_parse_link_next() {
        let header = "<https://api.example/items?page=2>; rel=\"next\", <https://api.example/items?page=9>; rel=\"last\"";
        assert_eq!(
            parse_link_next(header),
            Some("https://api.example/items?page=2".to_string())
        );
        assert!(parse_link_next("<https://api.example>; rel=\"prev\"").is_none());
    }

    #[test]
    fn test_cache_key_stable_and_distinct() {
        let a = ApiManager::cache_key(
            "get",
            "https://x",
            &serde_json::json!({"b": 1, "a": 2}),
            &Value::Null,
        );
        let b = ApiManager::cache_key(
            "GET",
            "https://x",
            &serde_json::json!({"a": 2, "b": 1}),
            &Value::Null,
        );
        assert_eq!(a, b);

        let c = ApiManager::cache_key("GET", "https://y", &Value::Null, &Value::Null);
        assert_ne!(a, c);
    }

    #[test]
    fn test_shape_body_truncated_json_degrades() {
        let args = RequestArgs {
            response_type: ResponseType::Json,
            ..Default::default()
        };
        let headers = Map::new();
        let (value, data_truncated) =
            ApiManager::shape_body(&args, &headers, b"{\"partial\":", true).unwrap();
        assert!(value.is_string());
        assert!(data_truncated);
    }

    #[test]
    fn test_shape_body_truncated_strict_fails() {
        let args = RequestArgs {
            response_type: ResponseType::Json,
            require_complete: true,
            ..Default::default()
        };
        let err = ApiManager::shape_body(&args, &Map::new(), b"{", true).unwrap_err();
        assert_eq!(err.category, ErrorCategory::Retryable);
    }

    #[test]
    fn test_shape_body_auto_json() {
        let args = RequestArgs::default();
        let mut headers = Map::new();
        headers.insert("content-type".into(), json!("application/json; charset=utf-8"));
        let (value, _) = ApiManager::shape_body(&args, &headers, b"{\"ok\":true}", false).unwrap();
        assert_eq!(value, json!({"ok": true}));
    }

    #[test]
    fn test_shape_body_bytes_base64() {
        let args = RequestArgs {
            response_type: ResponseType::Bytes,
            ..Default::default()
        };
        let (value, _) = ApiManager::shape_body(&args, &Map::new(), b"\x00\x01", false).unwrap();
        assert_eq!(
            value,
            json!(base64::engine::general_purpose::STANDARD.encode(b"\x00\x01"))
        );
    }

    #[test]
    fn test_build_url_join() {
        let config = json!({"base_url": "https://api.example/"});
        let args = RequestArgs {
            path: Some("/v2/items".into()),
            ..Default::default()
        };
        assert_eq!(
            ApiManager::build_url(Some(&config), &args).unwrap(),
            "https://api.example/v2/items"
        );
    }
}
